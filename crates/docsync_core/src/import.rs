use std::collections::HashMap;

use anyhow::Result;
use tracing::{debug, info};

use crate::config::TitleRewrite;
use crate::manifest::{Manifest, ManifestEntry};
use crate::markdown::{sanitize_slug, sanitize_title};
use crate::store::{DocumentStore, NewRecord, RecordType};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub record_type: RecordType,
    pub page_size: usize,
    pub title_rewrites: Vec<TitleRewrite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedRecord {
    pub id: i64,
    pub title: String,
    pub cmd_path: String,
    pub parent_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub total_entries: usize,
    pub created: usize,
    pub skipped_existing: usize,
    pub rewritten_titles: usize,
    pub untitled: Vec<String>,
    pub orphans: Vec<String>,
    pub title_collisions: Vec<String>,
    pub warnings: Vec<String>,
    pub created_records: Vec<CreatedRecord>,
}

/// Rename manifest titles per the configured rewrites. Returns how many entries changed.
pub fn apply_title_rewrites(manifest: &mut Manifest, rewrites: &[TitleRewrite]) -> usize {
    let mut changed = 0;
    for entry in manifest.entries_mut() {
        if let Some(rewrite) = rewrites.iter().find(|rewrite| rewrite.from == entry.title) {
            entry.title = rewrite.to.clone();
            changed += 1;
        }
    }
    changed
}

/// Create missing records for every manifest entry, parents before children.
///
/// Titles are the dedup key: an entry whose title already exists maps onto that record.
pub fn synchronize<S>(store: &mut S, manifest: &Manifest, options: &SyncOptions) -> Result<SyncReport>
where
    S: DocumentStore + ?Sized,
{
    let mut manifest = manifest.clone();
    let mut report = SyncReport {
        total_entries: manifest.len(),
        rewritten_titles: apply_title_rewrites(&mut manifest, &options.title_rewrites),
        ..SyncReport::default()
    };

    let mut ids_by_title = HashMap::new();
    for record in store.list_records(options.record_type, options.page_size)? {
        ids_by_title.entry(record.title).or_insert(record.id);
    }

    let mut ids_by_path: HashMap<String, i64> = HashMap::new();
    let mut title_claims: HashMap<String, String> = HashMap::new();

    for entry in ordered_by_depth(&manifest) {
        let title = sanitize_title(&entry.title);
        if title.is_empty() {
            report.untitled.push(entry.cmd_path.clone());
            continue;
        }

        if let Some(&existing_id) = ids_by_title.get(&title) {
            match title_claims.get(&title) {
                Some(claimed_by) if claimed_by != &entry.cmd_path => {
                    report.title_collisions.push(format!(
                        "{} shares title `{title}` with {claimed_by}",
                        entry.cmd_path
                    ));
                }
                _ => report.skipped_existing += 1,
            }
            title_claims
                .entry(title)
                .or_insert_with(|| entry.cmd_path.clone());
            ids_by_path.insert(entry.cmd_path.clone(), existing_id);
            continue;
        }

        let parent_id = match entry.parent.as_deref() {
            None => None,
            Some(parent) => match ids_by_path.get(parent) {
                Some(&id) => Some(id),
                None => {
                    debug!(cmd_path = %entry.cmd_path, parent, "skipping orphan entry");
                    report.orphans.push(entry.cmd_path.clone());
                    continue;
                }
            },
        };

        let record = NewRecord {
            record_type: options.record_type,
            title: title.clone(),
            slug: entry_slug(entry),
            parent_id,
            source_reference: Some(entry.markdown_source.clone()).filter(|source| !source.is_empty()),
        };
        match store.create_record(&record) {
            Ok(id) => {
                debug!(id, cmd_path = %entry.cmd_path, "created record");
                ids_by_title.insert(title.clone(), id);
                title_claims.insert(title.clone(), entry.cmd_path.clone());
                ids_by_path.insert(entry.cmd_path.clone(), id);
                report.created += 1;
                report.created_records.push(CreatedRecord {
                    id,
                    title,
                    cmd_path: entry.cmd_path.clone(),
                    parent_id,
                });
            }
            Err(error) => {
                report
                    .warnings
                    .push(format!("{}: {error:#}", entry.cmd_path));
            }
        }
    }

    info!(
        record_type = %options.record_type,
        created = report.created,
        skipped = report.skipped_existing,
        orphans = report.orphans.len(),
        "synchronized manifest"
    );
    Ok(report)
}

fn entry_slug(entry: &ManifestEntry) -> String {
    let slug = sanitize_slug(&entry.slug);
    if !slug.is_empty() {
        return slug;
    }
    let last_segment = entry.cmd_path.rsplit('/').next().unwrap_or_default();
    sanitize_slug(last_segment)
}

/// Entries sorted by hierarchy depth, stable over manifest order.
///
/// Depth follows the `parent` chain through the manifest, so keys that are not slash paths
/// still sort parents first. A parent missing from the manifest counts as depth zero.
fn ordered_by_depth(manifest: &Manifest) -> Vec<&ManifestEntry> {
    let parents: HashMap<&str, Option<&str>> = manifest
        .entries()
        .iter()
        .map(|entry| (entry.cmd_path.as_str(), entry.parent.as_deref()))
        .collect();

    let depth_of = |entry: &ManifestEntry| {
        let mut depth = 0usize;
        let mut cursor = entry.parent.as_deref();
        while let Some(parent) = cursor {
            depth += 1;
            if depth > parents.len() {
                break;
            }
            cursor = parents.get(parent).copied().flatten();
        }
        depth
    };

    let mut ordered = manifest.entries().iter().collect::<Vec<_>>();
    ordered.sort_by_cached_key(|entry| depth_of(*entry));
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn entry(cmd_path: &str, title: &str, parent: Option<&str>) -> ManifestEntry {
        ManifestEntry {
            title: title.to_string(),
            slug: cmd_path.rsplit('/').next().unwrap_or_default().to_string(),
            cmd_path: cmd_path.to_string(),
            parent: parent.map(str::to_string),
            markdown_source: format!("/srv/docs/commands/{cmd_path}.md"),
        }
    }

    fn options() -> SyncOptions {
        SyncOptions {
            record_type: RecordType::Commands,
            page_size: 100,
            title_rewrites: Vec::new(),
        }
    }

    #[test]
    fn parents_are_created_before_children_regardless_of_order() {
        let manifest = Manifest::new(vec![
            entry("a/b/c", "c", Some("a/b")),
            entry("a/b", "b", Some("a")),
            entry("a", "a", None),
        ]);
        let mut store = MemoryStore::default();
        let report = synchronize(&mut store, &manifest, &options()).expect("sync");

        assert_eq!(report.created, 3);
        assert_eq!(store.titles(), vec!["a", "b", "c"]);
        let a = store.by_title("a").expect("a").id;
        let b = store.by_title("b").expect("b");
        let c = store.by_title("c").expect("c");
        assert_eq!(b.parent_id, Some(a));
        assert_eq!(c.parent_id, Some(b.id));
        assert_eq!(
            c.source_reference.as_deref(),
            Some("/srv/docs/commands/a/b/c.md")
        );
    }

    #[test]
    fn resync_creates_nothing() {
        let manifest = Manifest::new(vec![
            entry("site", "ee site", None),
            entry("site/create", "ee site create", Some("site")),
        ]);
        let mut store = MemoryStore::default();
        synchronize(&mut store, &manifest, &options()).expect("first sync");
        let report = synchronize(&mut store, &manifest, &options()).expect("second sync");
        assert_eq!(report.created, 0);
        assert_eq!(report.skipped_existing, 2);
        assert!(report.title_collisions.is_empty());
        assert_eq!(store.records.len(), 2);
    }

    #[test]
    fn orphans_and_their_descendants_are_skipped() {
        let manifest = Manifest::new(vec![
            entry("site", "ee site", None),
            entry("ghost/child", "ee ghost child", Some("ghost")),
            entry("ghost/child/leaf", "ee ghost child leaf", Some("ghost/child")),
        ]);
        let mut store = MemoryStore::default();
        let report = synchronize(&mut store, &manifest, &options()).expect("sync");
        assert_eq!(report.created, 1);
        assert_eq!(report.orphans, vec!["ghost/child", "ghost/child/leaf"]);
        assert!(report.warnings.is_empty());
        assert_eq!(store.titles(), vec!["ee site"]);
    }

    #[test]
    fn children_attach_to_existing_parent_found_by_title() {
        let mut store = MemoryStore::default();
        let existing = store
            .create_record(&NewRecord {
                record_type: RecordType::Commands,
                title: "ee site".to_string(),
                slug: "site".to_string(),
                parent_id: None,
                source_reference: None,
            })
            .expect("seed");
        let manifest = Manifest::new(vec![
            entry("site", "ee site", None),
            entry("site/create", "ee site create", Some("site")),
        ]);
        let report = synchronize(&mut store, &manifest, &options()).expect("sync");
        assert_eq!(report.created, 1);
        assert_eq!(
            store.by_title("ee site create").expect("child").parent_id,
            Some(existing)
        );
    }

    #[test]
    fn duplicate_titles_are_reported_as_collisions() {
        let manifest = Manifest::new(vec![
            entry("site", "ee site", None),
            entry("legacy", "ee site", None),
        ]);
        let mut store = MemoryStore::default();
        let report = synchronize(&mut store, &manifest, &options()).expect("sync");
        assert_eq!(report.created, 1);
        assert_eq!(report.title_collisions.len(), 1);
        assert!(report.title_collisions[0].starts_with("legacy shares title"));
    }

    #[test]
    fn title_rewrites_apply_before_dedup() {
        let manifest = Manifest::new(vec![
            entry("site", "ee site", None),
            entry("site/create", "ee site create --type=html", Some("site")),
            entry("site/empty", "   ", Some("site")),
        ]);
        let mut store = MemoryStore::default();
        let report = synchronize(
            &mut store,
            &manifest,
            &SyncOptions {
                title_rewrites: vec![TitleRewrite {
                    from: "ee site create --type=html".to_string(),
                    to: "ee site create".to_string(),
                }],
                ..options()
            },
        )
        .expect("sync");
        assert_eq!(report.rewritten_titles, 1);
        assert_eq!(report.untitled, vec!["site/empty"]);
        assert_eq!(store.titles(), vec!["ee site", "ee site create"]);
        assert_eq!(store.by_title("ee site create").expect("create").slug, "create");
    }

    #[test]
    fn creation_failures_become_warnings() {
        let manifest = Manifest::new(vec![
            entry("site", "ee site", None),
            entry("site/create", "ee site create", Some("site")),
            entry("cli", "ee cli", None),
        ]);
        let mut store = MemoryStore {
            fail_titles: vec!["ee site".to_string()],
            ..MemoryStore::default()
        };
        let report = synchronize(&mut store, &manifest, &options()).expect("sync");
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("simulated failure"));
        assert_eq!(report.orphans, vec!["site/create"]);
        assert_eq!(store.titles(), vec!["ee cli"]);
    }

    #[test]
    fn slug_keyed_manifests_still_order_parents_first() {
        let manifest = Manifest::new(vec![
            entry("logging", "Logging", Some("internal-api")),
            entry("internal-api", "Internal API", None),
        ]);
        let mut store = MemoryStore::default();
        let report = synchronize(&mut store, &manifest, &options()).expect("sync");
        assert_eq!(report.created, 2);
        assert_eq!(store.titles(), vec!["Internal API", "Logging"]);
    }
}
