use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::DocsyncConfig;
use crate::extract::{CommandSource, ExternalTool, cleanup_scratch_dir, ensure_binary};
use crate::import::{SyncOptions, SyncReport, synchronize};
use crate::manifest::{
    build_manifest, commands_manifest_path, handbook_manifest_path, load_manifest, write_manifest,
};
use crate::refresh::{RefreshOptions, RefreshReport, refresh_all};
use crate::render::{DEFAULT_PAGE_TEMPLATE, PageRenderer, RenderOptions, RenderReport};
use crate::runtime::{
    ResolvedPaths, absolutize_from_project, ensure_runtime_ready_for_import, inspect_runtime,
};
use crate::store::{DocumentStore, RecordType, SqliteDocumentStore};

#[derive(Debug, Clone)]
pub struct GenDocsReport {
    pub output_dir: PathBuf,
    pub render: RenderReport,
    pub manifest_path: PathBuf,
    pub manifest_entries: usize,
    pub scratch_removed: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct ImportOptions {
    pub record_type: RecordType,
    pub skip_generate: bool,
    pub skip_refresh: bool,
}

#[derive(Debug, Clone)]
pub struct ImportReport {
    pub record_type: RecordType,
    pub manifest_path: PathBuf,
    pub gen_docs: Option<GenDocsReport>,
    pub sync: SyncReport,
    pub refresh: Option<RefreshReport>,
}

/// Render every command page from `source`, then rebuild and write the manifest.
pub fn generate_docs<C>(
    source: &mut C,
    options: RenderOptions,
    template_source: &str,
) -> Result<(RenderReport, PathBuf, usize)>
where
    C: CommandSource + ?Sized,
{
    let output_dir = options.output_dir.clone();
    let registry = source.parameter_registry()?;
    let nodes = source.command_tree()?;
    let renderer = PageRenderer::new(options, &registry, template_source)?;
    let render = renderer.render_tree(&nodes)?;

    let manifest = build_manifest(&output_dir)?;
    let manifest_path = write_manifest(&output_dir, &manifest)?;
    Ok((render, manifest_path, manifest.len()))
}

pub fn render_options(config: &DocsyncConfig, output_dir: PathBuf) -> RenderOptions {
    RenderOptions {
        output_dir,
        command_prefix: config.command_prefix(),
        breadcrumb_base: config.breadcrumb_base(),
        skipped_commands: config.skipped_commands(),
    }
}

pub fn load_page_template(paths: &ResolvedPaths, config: &DocsyncConfig) -> Result<String> {
    match paths.template_path(config) {
        Some(path) => fs::read_to_string(&path)
            .with_context(|| format!("failed to read page template {}", path.display())),
        None => Ok(DEFAULT_PAGE_TEMPLATE.to_string()),
    }
}

/// `gen-docs`: run the external tool, render pages, write the manifest, clean scratch.
pub fn run_gen_docs(
    paths: &ResolvedPaths,
    config: &DocsyncConfig,
    output_override: Option<&Path>,
) -> Result<GenDocsReport> {
    let output_dir = match output_override {
        Some(path) => absolutize_from_project(path, &paths.project_root),
        None => paths.output_dir(config),
    };

    let mut tool = ExternalTool::from_config(paths, config);
    ensure_binary(
        &tool.binary,
        config.extractor.download_url.as_deref(),
        &config.github_user_agent(),
    )?;

    let template = load_page_template(paths, config)?;
    let (render, manifest_path, manifest_entries) = generate_docs(
        &mut tool,
        render_options(config, output_dir.clone()),
        &template,
    )?;

    let scratch_removed = match cleanup_scratch_dir(config.scratch_dir().as_deref()) {
        Ok(removed) => removed,
        Err(error) => {
            warn!("scratch cleanup failed: {error:#}");
            None
        }
    };

    info!(
        pages = render.written.len(),
        manifest_entries,
        "generated command docs"
    );
    Ok(GenDocsReport {
        output_dir,
        render,
        manifest_path,
        manifest_entries,
        scratch_removed,
    })
}

/// `manifest`: rebuild the manifest from pages already on disk.
pub fn run_manifest(
    paths: &ResolvedPaths,
    config: &DocsyncConfig,
    output_override: Option<&Path>,
) -> Result<(PathBuf, usize)> {
    let output_dir = match output_override {
        Some(path) => absolutize_from_project(path, &paths.project_root),
        None => paths.output_dir(config),
    };
    let manifest = build_manifest(&output_dir)?;
    let path = write_manifest(&output_dir, &manifest)?;
    Ok((path, manifest.len()))
}

pub fn manifest_path_for(output_dir: &Path, record_type: RecordType) -> PathBuf {
    match record_type {
        RecordType::Commands => commands_manifest_path(output_dir),
        RecordType::Handbook => handbook_manifest_path(output_dir),
    }
}

/// Synchronize one manifest into `store`, then refresh that type's bodies.
pub fn sync_and_refresh<S>(
    store: &mut S,
    manifest_path: &Path,
    record_type: RecordType,
    config: &DocsyncConfig,
    project_root: &Path,
    skip_refresh: bool,
) -> Result<(SyncReport, Option<RefreshReport>)>
where
    S: DocumentStore + ?Sized,
{
    let manifest = load_manifest(manifest_path)?;
    let title_rewrites = match record_type {
        RecordType::Commands => config.title_rewrites(),
        RecordType::Handbook => Vec::new(),
    };
    let sync = synchronize(
        store,
        &manifest,
        &SyncOptions {
            record_type,
            page_size: config.page_size(),
            title_rewrites,
        },
    )?;
    if skip_refresh {
        return Ok((sync, None));
    }

    let rules = match record_type {
        RecordType::Commands => config.refresh_rules(),
        RecordType::Handbook => Vec::new(),
    };
    let refresh = refresh_all(
        store,
        &RefreshOptions {
            record_type,
            page_size: config.page_size(),
            project_root: project_root.to_path_buf(),
            rules,
        },
    )?;
    Ok((sync, Some(refresh)))
}

/// `import`: regenerate command docs when applicable, then sync and refresh.
pub fn run_import(
    paths: &ResolvedPaths,
    config: &DocsyncConfig,
    options: &ImportOptions,
) -> Result<ImportReport> {
    let status = inspect_runtime(paths, config)?;
    ensure_runtime_ready_for_import(paths, &status)?;

    let gen_docs = if options.record_type == RecordType::Commands && !options.skip_generate {
        Some(run_gen_docs(paths, config, None)?)
    } else {
        None
    };

    let output_dir = paths.output_dir(config);
    let manifest_path = manifest_path_for(&output_dir, options.record_type);
    let mut store = SqliteDocumentStore::open(&paths.db_path)?;
    let (sync, refresh) = sync_and_refresh(
        &mut store,
        &manifest_path,
        options.record_type,
        config,
        &paths.project_root,
        options.skip_refresh,
    )?;

    Ok(ImportReport {
        record_type: options.record_type,
        manifest_path,
        gen_docs,
        sync,
        refresh,
    })
}

/// One scheduled pass: commands always, the handbook when its manifest exists.
pub fn run_import_cycle(paths: &ResolvedPaths, config: &DocsyncConfig) -> Result<Vec<ImportReport>> {
    let mut reports = vec![run_import(
        paths,
        config,
        &ImportOptions {
            record_type: RecordType::Commands,
            skip_generate: false,
            skip_refresh: false,
        },
    )?];

    if handbook_manifest_path(&paths.output_dir(config)).exists() {
        reports.push(run_import(
            paths,
            config,
            &ImportOptions {
                record_type: RecordType::Handbook,
                skip_generate: true,
                skip_refresh: false,
            },
        )?);
    }
    Ok(reports)
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleReport {
    pub cycles: usize,
    pub failures: Vec<String>,
}

/// Sleep between scheduled cycles. At least one minute; huge values saturate.
pub fn schedule_interval(minutes: u64) -> Duration {
    Duration::from_secs(minutes.max(1).saturating_mul(60))
}

/// Run `cycle` every `interval`, one run at a time. `None` iterations loops forever.
pub fn run_schedule<F>(interval: Duration, iterations: Option<usize>, mut cycle: F) -> ScheduleReport
where
    F: FnMut() -> Result<()>,
{
    let mut report = ScheduleReport::default();
    loop {
        match cycle() {
            Ok(()) => info!(cycle = report.cycles + 1, "scheduled import finished"),
            Err(error) => {
                warn!(cycle = report.cycles + 1, "scheduled import failed: {error:#}");
                report.failures.push(format!("{error:#}"));
            }
        }
        report.cycles += 1;
        if iterations.is_some_and(|limit| report.cycles >= limit) {
            return report;
        }
        thread::sleep(interval);
    }
}
