use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::DocsyncConfig;
use crate::manifest::commands_manifest_path;

pub const STATE_DIR_NAME: &str = ".docsync";
pub const DB_FILENAME: &str = "docsync.db";
const CONFIG_FILENAME: &str = "config.toml";
const MATERIALIZED_HEADER: &str = "# docsync runtime configuration (written by `docsync init`)\n# Leave [corrections] lists out to keep the built-in ones; set a list to [] to disable it.\n\n";

/// Where a resolved path came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        Ok(Self {
            cwd: env::current_dir().context("failed to read current directory")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        [
            ("project_root", &self.project_root, Some(self.root_source)),
            ("state_dir", &self.state_dir, None),
            ("data_dir", &self.data_dir, Some(self.data_source)),
            ("db_path", &self.db_path, None),
            ("config_path", &self.config_path, Some(self.config_source)),
        ]
        .iter()
        .map(|(key, path, source)| match source {
            Some(source) => format!("{key}={} ({})", normalize_for_display(path), source.as_str()),
            None => format!("{key}={}", normalize_for_display(path)),
        })
        .collect::<Vec<_>>()
        .join("\n")
    }

    /// Rendered documentation root, relative values resolved against the project root.
    pub fn output_dir(&self, config: &DocsyncConfig) -> PathBuf {
        absolutize_from_project(Path::new(&config.output_dir()), &self.project_root)
    }

    pub fn extractor_binary(&self, config: &DocsyncConfig) -> PathBuf {
        absolutize_from_project(Path::new(&config.extractor_binary()), &self.project_root)
    }

    pub fn template_path(&self, config: &DocsyncConfig) -> Option<PathBuf> {
        let template = config.render.template.as_deref()?;
        Some(absolutize_from_project(Path::new(template), &self.project_root))
    }
}

/// Resolve the runtime layout: flag > env > heuristic/default.
pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = pick_path(
        overrides.project_root.as_deref(),
        lookup_env("DOCSYNC_PROJECT_ROOT"),
        &context.cwd,
    )
    .unwrap_or_else(|| match nearest_initialized_root(&context.cwd) {
        Some(root) => (root, ValueSource::Heuristic),
        None => (context.cwd.clone(), ValueSource::Default),
    });
    let state_dir = project_root.join(STATE_DIR_NAME);
    let (data_dir, data_source) = pick_path(
        overrides.data_dir.as_deref(),
        lookup_env("DOCSYNC_DATA_DIR"),
        &project_root,
    )
    .unwrap_or_else(|| (state_dir.join("data"), ValueSource::Default));
    let (config_path, config_source) = pick_path(
        overrides.config.as_deref(),
        lookup_env("DOCSYNC_CONFIG"),
        &project_root,
    )
    .unwrap_or_else(|| (state_dir.join(CONFIG_FILENAME), ValueSource::Default));

    Ok(ResolvedPaths {
        db_path: data_dir.join(DB_FILENAME),
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    })
}

fn pick_path(
    flag: Option<&Path>,
    env_value: Option<String>,
    base: &Path,
) -> Option<(PathBuf, ValueSource)> {
    if let Some(path) = flag {
        return Some((absolutize_from_project(path, base), ValueSource::Flag));
    }
    let value = env_value?;
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    Some((absolutize_from_project(Path::new(value), base), ValueSource::Env))
}

fn nearest_initialized_root(cwd: &Path) -> Option<PathBuf> {
    cwd.ancestors()
        .find(|candidate| candidate.join(STATE_DIR_NAME).is_dir())
        .map(Path::to_path_buf)
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub state_dir_exists: bool,
    pub data_dir_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub output_dir_exists: bool,
    pub manifest_exists: bool,
    pub warnings: Vec<String>,
}

pub fn inspect_runtime(paths: &ResolvedPaths, config: &DocsyncConfig) -> Result<RuntimeStatus> {
    let output_dir = paths.output_dir(config);
    let binary = paths.extractor_binary(config);
    let db_size_bytes = match fs::metadata(&paths.db_path) {
        Ok(metadata) => Some(metadata.len()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to inspect {}", paths.db_path.display()));
        }
    };

    let status = RuntimeStatus {
        project_root_exists: paths.project_root.exists(),
        state_dir_exists: paths.state_dir.is_dir(),
        data_dir_exists: paths.data_dir.is_dir(),
        db_exists: db_size_bytes.is_some(),
        db_size_bytes,
        config_exists: paths.config_path.is_file(),
        output_dir_exists: output_dir.is_dir(),
        manifest_exists: commands_manifest_path(&output_dir).is_file(),
        warnings: Vec::new(),
    };

    let mut warnings = Vec::new();
    if !status.state_dir_exists {
        warnings.push(format!(
            "{STATE_DIR_NAME}/ is missing; run `docsync init` before importing"
        ));
    }
    if !binary.exists() && config.extractor.download_url.is_none() {
        warnings.push(format!(
            "extractor binary {} is missing and no download_url is configured",
            normalize_for_display(&binary)
        ));
    }
    if !status.manifest_exists {
        warnings.push("commands manifest is missing; run `docsync gen-docs`".to_string());
    }
    Ok(RuntimeStatus { warnings, ..status })
}

pub fn ensure_runtime_ready_for_import(paths: &ResolvedPaths, status: &RuntimeStatus) -> Result<()> {
    if status.state_dir_exists {
        return Ok(());
    }
    bail!(
        "Runtime layout is not initialized for import: {} is missing.\nRun: docsync init --project-root {}",
        normalize_for_display(&paths.state_dir),
        normalize_for_display(&paths.project_root)
    );
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

/// Create the state, data and output directories and optionally write the default config.
pub fn init_layout(
    paths: &ResolvedPaths,
    config: &DocsyncConfig,
    options: &InitOptions,
) -> Result<InitReport> {
    let output_dir = paths.output_dir(config);
    let mut created_dirs = Vec::new();
    for dir in [
        paths.state_dir.clone(),
        paths.data_dir.clone(),
        output_dir.join("commands"),
        output_dir.join("bin"),
    ] {
        if dir.is_dir() {
            continue;
        }
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        created_dirs.push(dir);
    }

    let wrote_config = options.materialize_config
        && write_text_file(
            &paths.config_path,
            &render_materialized_config()?,
            options.force,
        )?;

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn render_materialized_config() -> Result<String> {
    let body = toml::to_string_pretty(&DocsyncConfig::materialized())
        .context("failed to serialize default config")?;
    Ok(format!("{MATERIALIZED_HEADER}{body}"))
}

pub fn absolutize_from_project(path: &Path, project_root: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_root.join(path)
    }
}

/// Write `content` unless the file exists and `force` is unset. Returns whether a write happened.
pub fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::tempdir;

    use super::*;
    use crate::config::load_config;

    fn context(cwd: &Path) -> ResolutionContext {
        ResolutionContext {
            cwd: cwd.to_path_buf(),
        }
    }

    fn rooted(root: &Path) -> PathOverrides {
        PathOverrides {
            project_root: Some(root.to_path_buf()),
            ..PathOverrides::default()
        }
    }

    #[test]
    fn flag_beats_env_for_project_root() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        let env = HashMap::from([(
            "DOCSYNC_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved =
            resolve_paths_with_lookup(&context(&cwd), &rooted(&from_flag), |key| {
                env.get(key).cloned()
            })
            .expect("resolve");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
        assert_eq!(resolved.db_path, from_flag.join(".docsync/data/docsync.db"));
        assert_eq!(resolved.config_path, from_flag.join(".docsync/config.toml"));
        assert!(resolved.diagnostics().contains("data_dir="));
    }

    #[test]
    fn initialized_ancestor_becomes_project_root() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let nested = root.join("docs").join("commands");
        fs::create_dir_all(root.join(STATE_DIR_NAME)).expect("state dir");
        fs::create_dir_all(&nested).expect("nested");

        let resolved = resolve_paths_with_lookup(&context(&nested), &PathOverrides::default(), |_| None)
            .expect("resolve");
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);

        let plain = temp.path().join("plain");
        fs::create_dir_all(&plain).expect("plain");
        let resolved = resolve_paths_with_lookup(&context(&plain), &PathOverrides::default(), |_| None)
            .expect("resolve");
        assert_eq!(resolved.project_root, plain);
        assert_eq!(resolved.root_source, ValueSource::Default);
    }

    #[test]
    fn env_data_dir_is_relative_to_project_root() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let env = HashMap::from([
            ("DOCSYNC_DATA_DIR".to_string(), "state".to_string()),
            ("DOCSYNC_CONFIG".to_string(), "  ".to_string()),
        ]);
        let resolved = resolve_paths_with_lookup(&context(&root), &rooted(&root), |key| {
            env.get(key).cloned()
        })
        .expect("resolve");
        assert_eq!(resolved.data_dir, root.join("state"));
        assert_eq!(resolved.data_source, ValueSource::Env);
        assert_eq!(resolved.config_source, ValueSource::Default);
    }

    #[test]
    fn init_creates_layout_and_round_trippable_config() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let paths = resolve_paths_with_lookup(&context(&root), &rooted(&root), |_| None)
            .expect("resolve");
        let config = DocsyncConfig::default();

        let report = init_layout(&paths, &config, &InitOptions::default()).expect("init");
        assert!(report.wrote_config);
        assert_eq!(report.created_dirs.len(), 4);
        assert!(root.join("docs/commands").is_dir());
        assert!(root.join("docs/bin").is_dir());

        let written = fs::read_to_string(&paths.config_path).expect("read config");
        assert!(written.starts_with("# docsync runtime configuration"));
        let materialized = load_config(&paths.config_path).expect("materialized config parses");
        assert_eq!(materialized.command_prefix(), "ee");
        assert_eq!(materialized.scratch_dir(), config.scratch_dir());
        assert_eq!(materialized.title_rewrites(), config.title_rewrites());

        let again = init_layout(&paths, &config, &InitOptions::default()).expect("init again");
        assert!(!again.wrote_config);
        assert!(again.created_dirs.is_empty());
    }

    #[test]
    fn import_requires_initialized_layout() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let paths = resolve_paths_with_lookup(&context(&root), &rooted(&root), |_| None)
            .expect("resolve");
        let status = inspect_runtime(&paths, &DocsyncConfig::default()).expect("inspect");
        assert!(!status.db_exists);
        assert_eq!(status.warnings.len(), 3);
        let error = ensure_runtime_ready_for_import(&paths, &status).expect_err("must fail");
        assert!(error.to_string().contains("not initialized for import"));
    }
}
