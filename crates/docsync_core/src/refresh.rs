use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use tracing::{debug, info};

use crate::config::RefreshRule;
use crate::markdown::{demote_h1, front_matter_title, split_front_matter, take_first_heading, to_html};
use crate::runtime::normalize_for_display;
use crate::store::{ContentUpdate, DocumentRecord, DocumentStore, RecordType};

static GITHUB_BLOB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://github\.com/([^/]+/[^/]+)/blob/master/(.+)$")
        .expect("valid github blob regex")
});

#[derive(Debug, Clone)]
pub struct RefreshOptions {
    pub record_type: RecordType,
    pub page_size: usize,
    pub project_root: PathBuf,
    pub rules: Vec<RefreshRule>,
}

#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    pub success: usize,
    pub total: usize,
    pub warnings: Vec<String>,
    pub updated: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshedContent {
    pub title: Option<String>,
    pub body: String,
    pub excerpt: String,
}

/// Map a source reference onto a local file. GitHub blob URLs point into the local checkout.
pub fn resolve_source(source: &str, project_root: &Path) -> PathBuf {
    let trimmed = source.trim();
    let relative = match GITHUB_BLOB.captures(trimmed).and_then(|found| found.get(2)) {
        Some(rest) => rest.as_str(),
        None => trimmed,
    };
    let path = Path::new(relative);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_root.join(path)
    }
}

/// Markdown to stored HTML: front matter stripped, first heading lifted into the title.
pub fn convert_markdown(raw: &str, rules: &[RefreshRule]) -> RefreshedContent {
    let (front_matter, markdown) = split_front_matter(raw);
    let (heading, markdown) = take_first_heading(markdown);
    let mut title = heading.or_else(|| front_matter.and_then(front_matter_title));

    let mut body = demote_h1(&to_html(&markdown));
    let mut excerpt = String::new();

    let rule = title
        .as_deref()
        .and_then(|current| rules.iter().find(|rule| rule.matches(current)));
    if let Some(rule) = rule {
        title = Some(rule.canonical_title.clone());
        if let Some(marker) = rule.keep_after.as_deref()
            && let Some((_, after)) = body.split_once(marker)
        {
            body = after.to_string();
        }
        if let Some(prepend) = &rule.prepend_html {
            body = format!("{prepend}{body}");
        }
        if let Some(rule_excerpt) = &rule.excerpt {
            excerpt = rule_excerpt.clone();
        }
    }

    RefreshedContent {
        title,
        body,
        excerpt,
    }
}

/// Re-read one record's Markdown source and store the converted body.
pub fn refresh_record<S>(store: &mut S, id: i64, options: &RefreshOptions) -> Result<()>
where
    S: DocumentStore + ?Sized,
{
    let Some(record) = store.get_record(id)? else {
        bail!("record {id} does not exist");
    };
    refresh_loaded(store, &record, options)
}

fn refresh_loaded<S>(store: &mut S, record: &DocumentRecord, options: &RefreshOptions) -> Result<()>
where
    S: DocumentStore + ?Sized,
{
    let Some(source) = record
        .source_reference
        .as_deref()
        .filter(|source| !source.trim().is_empty())
    else {
        bail!("Markdown source is missing for record {}", record.id);
    };

    let path = resolve_source(source, &options.project_root);
    let raw = fs::read_to_string(&path).unwrap_or_default();
    if raw.trim().is_empty() {
        bail!(
            "Markdown source is empty. File: {}",
            normalize_for_display(&path)
        );
    }

    let content = convert_markdown(&raw, &options.rules);
    store
        .update_content(
            record.id,
            &ContentUpdate {
                body: content.body,
                excerpt: content.excerpt,
                title: content.title,
            },
        )
        .with_context(|| format!("failed to store refreshed content for record {}", record.id))?;
    debug!(id = record.id, source = %normalize_for_display(&path), "refreshed record");
    Ok(())
}

/// Refresh every record of the configured type. Per-record failures become warnings.
pub fn refresh_all<S>(store: &mut S, options: &RefreshOptions) -> Result<RefreshReport>
where
    S: DocumentStore + ?Sized,
{
    let records = store.list_records(options.record_type, options.page_size)?;
    let mut report = RefreshReport {
        total: records.len(),
        ..RefreshReport::default()
    };

    for record in &records {
        match refresh_loaded(store, record, options) {
            Ok(()) => {
                report.success += 1;
                report.updated.push(record.id);
            }
            Err(error) => report.warnings.push(format!("{error:#}")),
        }
    }

    info!(
        record_type = %options.record_type,
        success = report.success,
        total = report.total,
        "refreshed records"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DocsyncConfig;
    use crate::store::{MemoryStore, NewRecord};
    use tempfile::tempdir;

    fn options(root: &Path) -> RefreshOptions {
        RefreshOptions {
            record_type: RecordType::Commands,
            page_size: 100,
            project_root: root.to_path_buf(),
            rules: DocsyncConfig::default().refresh_rules(),
        }
    }

    fn seed(store: &mut MemoryStore, title: &str, source: Option<&str>) -> i64 {
        store
            .create_record(&NewRecord {
                record_type: RecordType::Commands,
                title: title.to_string(),
                slug: title.replace(' ', "-"),
                parent_id: None,
                source_reference: source.map(str::to_string),
            })
            .expect("seed")
    }

    #[test]
    fn resolve_source_maps_github_blobs_to_local_files() {
        let root = Path::new("/srv/project");
        assert_eq!(
            resolve_source(
                "https://github.com/EasyEngine/handbook/blob/master/docs/install.md",
                root
            ),
            PathBuf::from("/srv/project/docs/install.md")
        );
        assert_eq!(
            resolve_source("/abs/commands/site.md", root),
            PathBuf::from("/abs/commands/site.md")
        );
        assert_eq!(
            resolve_source("docs/commands/site.md", root),
            PathBuf::from("/srv/project/docs/commands/site.md")
        );
    }

    #[test]
    fn convert_markdown_lifts_title_and_demotes_headings() {
        let content = convert_markdown(
            "---\nlayout: page\n---\n# ee site info\n\nIntro.\n\n# Options\n",
            &[],
        );
        assert_eq!(content.title.as_deref(), Some("ee site info"));
        assert!(!content.body.contains("ee site info"));
        assert!(content.body.contains("<h2>Options</h2>"));
        assert!(!content.body.contains("<h1>"));
        assert!(!content.body.contains("layout"));
        assert_eq!(content.excerpt, "");
    }

    #[test]
    fn convert_markdown_falls_back_to_front_matter_title() {
        let content = convert_markdown("---\ntitle: Installation\n---\nSteps.\n", &[]);
        assert_eq!(content.title.as_deref(), Some("Installation"));
        let content = convert_markdown("Just text.\n", &[]);
        assert_eq!(content.title, None);
    }

    #[test]
    fn create_rule_prepends_banner_and_excerpt() {
        let rules = DocsyncConfig::default().refresh_rules();
        let content = convert_markdown("# ee site create --type=html\n\nCreates a site.\n", &rules);
        assert_eq!(content.title.as_deref(), Some("ee site create"));
        assert!(
            content
                .body
                .starts_with("<h2>ee site create --type=html</h2><p>Creates a site.</p>")
        );
        assert_eq!(content.excerpt, "Runs site installation with provided site type.");
    }

    #[test]
    fn restart_rule_keeps_only_section_after_marker() {
        let rules = DocsyncConfig::default().refresh_rules();
        let markdown = "# ee site restart --type=html\n\nHTML variant.\n\n# ee site restart --type=wp\n\nWP variant.\n";
        let content = convert_markdown(markdown, &rules);
        assert_eq!(content.title.as_deref(), Some("ee site restart"));
        assert!(!content.body.contains("HTML variant"));
        assert!(content.body.contains("WP variant"));

        let without_marker = convert_markdown("# ee site reload\n\nOnly one.\n", &rules);
        assert_eq!(without_marker.title.as_deref(), Some("ee site reload"));
        assert!(without_marker.body.contains("Only one."));
    }

    #[test]
    fn refresh_all_reports_partial_success() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("docs/commands")).expect("dirs");
        fs::write(root.join("docs/commands/site.md"), "# ee site\n\nManage sites.\n").expect("write");
        fs::write(root.join("docs/commands/empty.md"), "  \n").expect("write");

        let mut store = MemoryStore::default();
        let site = seed(&mut store, "ee site", Some("docs/commands/site.md"));
        seed(&mut store, "ee empty", Some("docs/commands/empty.md"));
        seed(&mut store, "ee gone", Some("docs/commands/gone.md"));
        seed(&mut store, "ee nothing", None);

        let report = refresh_all(&mut store, &options(root)).expect("refresh");
        assert_eq!(report.total, 4);
        assert_eq!(report.success, 1);
        assert_eq!(report.updated, vec![site]);
        assert_eq!(report.warnings.len(), 3);
        assert!(report.warnings[0].contains("Markdown source is empty"));
        assert!(report.warnings[2].contains("Markdown source is missing"));

        let record = store.get_record(site).expect("get").expect("exists");
        assert_eq!(record.body, "<p>Manage sites.</p>\n");
        assert_eq!(record.title, "ee site");
        assert!(store.by_title("ee empty").expect("untouched").body.is_empty());
    }

    #[test]
    fn refresh_record_rejects_unknown_id() {
        let temp = tempdir().expect("tempdir");
        let mut store = MemoryStore::default();
        let error = refresh_record(&mut store, 42, &options(temp.path())).expect_err("missing");
        assert!(error.to_string().contains("does not exist"));
    }

    #[test]
    fn convert_markdown_keeps_code_comments_out_of_the_title() {
        let content = convert_markdown("Intro text.\n\n```bash\n# install deps\nmake\n```\n", &[]);
        assert_eq!(content.title, None);
        assert!(content.body.contains("# install deps\nmake"));

        let with_front_matter = convert_markdown(
            "---\ntitle: Installation\n---\n```bash\n# install deps\n```\n",
            &[],
        );
        assert_eq!(with_front_matter.title.as_deref(), Some("Installation"));
        assert!(with_front_matter.body.contains("# install deps"));
    }
}
