use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "docsync/0.1";
pub const DEFAULT_OUTPUT_DIR: &str = "docs";
pub const DEFAULT_COMMAND_PREFIX: &str = "ee";
pub const DEFAULT_BREADCRUMB_BASE: &str = "/commands/";
pub const DEFAULT_EDIT_ICON_URL: &str = "/assets/github-edit.svg";
pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_LISTING_LIMIT: usize = 200;
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_GITHUB_CACHE_TTL_SECONDS: u64 = 3 * 60;
pub const DEFAULT_SCHEDULE_INTERVAL_MINUTES: u64 = 15;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DocsyncConfig {
    #[serde(default)]
    pub extractor: ExtractorSection,
    #[serde(default)]
    pub render: RenderSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub corrections: CorrectionsSection,
    #[serde(default)]
    pub github: GithubSection,
    #[serde(default)]
    pub schedule: ScheduleSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ExtractorSection {
    pub interpreter: Option<String>,
    pub binary: Option<String>,
    pub download_url: Option<String>,
    pub command_dump_args: Option<Vec<String>>,
    pub param_dump_args: Option<Vec<String>>,
    pub excluded_commands: Option<Vec<String>>,
    pub skipped_commands: Option<Vec<String>>,
    pub scratch_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RenderSection {
    pub output_dir: Option<String>,
    pub command_prefix: Option<String>,
    pub breadcrumb_base: Option<String>,
    pub template: Option<String>,
    pub edit_icon_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StoreSection {
    pub page_size: Option<usize>,
    pub listing_limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CorrectionsSection {
    pub title_rewrites: Option<Vec<TitleRewrite>>,
    pub refresh_rules: Option<Vec<RefreshRule>>,
}

/// Renames a manifest title before synchronization.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TitleRewrite {
    pub from: String,
    pub to: String,
}

/// Post-conversion fixup keyed on the title recovered from a markdown source.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RefreshRule {
    pub titles: Vec<String>,
    pub canonical_title: String,
    pub prepend_html: Option<String>,
    pub excerpt: Option<String>,
    pub keep_after: Option<String>,
}

impl RefreshRule {
    pub fn matches(&self, title: &str) -> bool {
        self.titles.iter().any(|candidate| candidate == title)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct GithubSection {
    pub api_url: Option<String>,
    pub org: Option<String>,
    pub root_repo: Option<String>,
    pub repo_pattern: Option<String>,
    pub user_agent: Option<String>,
    pub cache_ttl_seconds: Option<u64>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ScheduleSection {
    pub interval_minutes: Option<u64>,
}

impl DocsyncConfig {
    /// Every scalar setting spelled out with its default. Corrections stay unset so the
    /// built-in lists keep applying.
    pub fn materialized() -> Self {
        let defaults = Self::default();
        Self {
            extractor: ExtractorSection {
                interpreter: Some(defaults.interpreter()),
                binary: Some(defaults.extractor_binary()),
                download_url: None,
                command_dump_args: Some(defaults.command_dump_args()),
                param_dump_args: Some(defaults.param_dump_args()),
                excluded_commands: Some(defaults.excluded_commands()),
                skipped_commands: Some(defaults.skipped_commands()),
                scratch_dir: defaults.scratch_dir(),
            },
            render: RenderSection {
                output_dir: Some(DEFAULT_OUTPUT_DIR.to_string()),
                command_prefix: Some(defaults.command_prefix()),
                breadcrumb_base: Some(defaults.breadcrumb_base()),
                template: None,
                edit_icon_url: Some(defaults.edit_icon_url()),
            },
            store: StoreSection {
                page_size: Some(defaults.page_size()),
                listing_limit: Some(defaults.listing_limit()),
            },
            corrections: CorrectionsSection::default(),
            github: GithubSection {
                api_url: Some(DEFAULT_GITHUB_API_URL.to_string()),
                org: Some(defaults.github_org()),
                root_repo: Some(defaults.github_root_repo()),
                repo_pattern: Some(defaults.github_repo_pattern()),
                user_agent: None,
                cache_ttl_seconds: Some(defaults.github_cache_ttl_seconds()),
                timeout_ms: Some(defaults.github_timeout_ms()),
            },
            schedule: ScheduleSection {
                interval_minutes: Some(defaults.schedule_interval_minutes()),
            },
        }
    }

    pub fn interpreter(&self) -> String {
        self.extractor
            .interpreter
            .clone()
            .unwrap_or_else(|| "php".to_string())
    }

    pub fn extractor_binary(&self) -> String {
        self.extractor
            .binary
            .clone()
            .unwrap_or_else(|| "easyengine.phar".to_string())
    }

    pub fn command_dump_args(&self) -> Vec<String> {
        self.extractor
            .command_dump_args
            .clone()
            .unwrap_or_else(|| vec!["site".to_string(), "cmd-dump".to_string()])
    }

    pub fn param_dump_args(&self) -> Vec<String> {
        self.extractor
            .param_dump_args
            .clone()
            .unwrap_or_else(|| vec!["cli".to_string(), "param-dump".to_string()])
    }

    pub fn excluded_commands(&self) -> Vec<String> {
        self.extractor
            .excluded_commands
            .clone()
            .unwrap_or_else(|| vec!["website".to_string(), "api-dump".to_string()])
    }

    pub fn skipped_commands(&self) -> Vec<String> {
        self.extractor
            .skipped_commands
            .clone()
            .unwrap_or_else(|| vec!["handbook".to_string()])
    }

    /// Home-relative directory removed after extraction. `None` when disabled.
    pub fn scratch_dir(&self) -> Option<String> {
        let value = self
            .extractor
            .scratch_dir
            .clone()
            .unwrap_or_else(|| "easyengine".to_string());
        let trimmed = value.trim().trim_matches('/').to_string();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }

    /// Resolve output directory: env DOCSYNC_OUTPUT_DIR > config > DEFAULT_OUTPUT_DIR.
    pub fn output_dir(&self) -> String {
        if let Some(value) = env_override("DOCSYNC_OUTPUT_DIR") {
            return value;
        }
        self.render
            .output_dir
            .clone()
            .unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_string())
    }

    pub fn command_prefix(&self) -> String {
        self.render
            .command_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_COMMAND_PREFIX.to_string())
    }

    pub fn breadcrumb_base(&self) -> String {
        self.render
            .breadcrumb_base
            .clone()
            .unwrap_or_else(|| DEFAULT_BREADCRUMB_BASE.to_string())
    }

    pub fn edit_icon_url(&self) -> String {
        self.render
            .edit_icon_url
            .clone()
            .unwrap_or_else(|| DEFAULT_EDIT_ICON_URL.to_string())
    }

    pub fn page_size(&self) -> usize {
        self.store.page_size.unwrap_or(DEFAULT_PAGE_SIZE).max(1)
    }

    pub fn listing_limit(&self) -> usize {
        self.store.listing_limit.unwrap_or(DEFAULT_LISTING_LIMIT).max(1)
    }

    /// Configured rewrites, or the built-in ones for the three bundled site commands.
    pub fn title_rewrites(&self) -> Vec<TitleRewrite> {
        if let Some(rewrites) = &self.corrections.title_rewrites {
            return rewrites.clone();
        }
        let prefix = self.command_prefix();
        ["reload", "restart", "create"]
            .iter()
            .map(|command| TitleRewrite {
                from: format!("{prefix} site {command} --type=html"),
                to: format!("{prefix} site {command}"),
            })
            .collect()
    }

    pub fn refresh_rules(&self) -> Vec<RefreshRule> {
        if let Some(rules) = &self.corrections.refresh_rules {
            return rules.clone();
        }
        let prefix = self.command_prefix();
        let site_command = |command: &str| format!("{prefix} site {command}");
        vec![
            RefreshRule {
                titles: vec![
                    format!("{} --type=html", site_command("create")),
                    site_command("create"),
                ],
                canonical_title: site_command("create"),
                prepend_html: Some(format!("<h2>{} --type=html</h2>", site_command("create"))),
                excerpt: Some("Runs site installation with provided site type.".to_string()),
                keep_after: None,
            },
            RefreshRule {
                titles: vec![
                    format!("{} --type=html", site_command("restart")),
                    site_command("restart"),
                ],
                canonical_title: site_command("restart"),
                prepend_html: None,
                excerpt: None,
                keep_after: Some(format!("<h2>{} --type=wp</h2>", site_command("restart"))),
            },
            RefreshRule {
                titles: vec![
                    format!("{} --type=html", site_command("reload")),
                    site_command("reload"),
                ],
                canonical_title: site_command("reload"),
                prepend_html: None,
                excerpt: None,
                keep_after: Some(format!("<h2>{} --type=wp</h2>", site_command("reload"))),
            },
        ]
    }

    /// Resolve GitHub API base: env DOCSYNC_GITHUB_API_URL > config > default.
    pub fn github_api_url(&self) -> String {
        if let Some(value) = env_override("DOCSYNC_GITHUB_API_URL") {
            return value.trim_end_matches('/').to_string();
        }
        self.github
            .api_url
            .as_deref()
            .unwrap_or(DEFAULT_GITHUB_API_URL)
            .trim_end_matches('/')
            .to_string()
    }

    pub fn github_org(&self) -> String {
        self.github.org.clone().unwrap_or_else(|| "wp-cli".to_string())
    }

    pub fn github_root_repo(&self) -> String {
        self.github
            .root_repo
            .clone()
            .unwrap_or_else(|| format!("{org}/{org}", org = self.github_org()))
    }

    pub fn github_repo_pattern(&self) -> String {
        self.github
            .repo_pattern
            .clone()
            .unwrap_or_else(|| format!("^{}/.+-command$", self.github_org()))
    }

    pub fn github_user_agent(&self) -> String {
        self.github
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn github_token(&self) -> Option<String> {
        env_override("GITHUB_TOKEN")
    }

    pub fn github_cache_ttl_seconds(&self) -> u64 {
        self.github
            .cache_ttl_seconds
            .unwrap_or(DEFAULT_GITHUB_CACHE_TTL_SECONDS)
    }

    pub fn github_timeout_ms(&self) -> u64 {
        self.github.timeout_ms.unwrap_or(30_000)
    }

    pub fn schedule_interval_minutes(&self) -> u64 {
        self.schedule
            .interval_minutes
            .unwrap_or(DEFAULT_SCHEDULE_INTERVAL_MINUTES)
            .max(1)
    }
}

/// Load and parse a DocsyncConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<DocsyncConfig> {
    if !config_path.exists() {
        return Ok(DocsyncConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: DocsyncConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_override(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
