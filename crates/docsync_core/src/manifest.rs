use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::markdown::first_heading;
use crate::runtime::normalize_for_display;

pub const COMMANDS_MANIFEST: &str = "commands-manifest.json";
pub const HANDBOOK_MANIFEST: &str = "handbook-manifest.json";
const MAX_DEPTH: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub cmd_path: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub markdown_source: String,
}

impl ManifestEntry {
    /// Number of path segments; top-level entries have depth 1.
    pub fn depth(&self) -> usize {
        self.cmd_path.split('/').count()
    }
}

/// Entries keyed by `cmd_path`, in scan order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [ManifestEntry] {
        &mut self.entries
    }

    pub fn get(&self, cmd_path: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|entry| entry.cmd_path == cmd_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace by `cmd_path`, keeping the original position on replace.
    pub fn insert(&mut self, entry: ManifestEntry) {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.cmd_path == entry.cmd_path)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }
}

impl Serialize for Manifest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for entry in &self.entries {
            map.serialize_entry(&entry.cmd_path, entry)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Manifest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ManifestVisitor;

        impl<'de> Visitor<'de> for ManifestVisitor {
            type Value = Manifest;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an object keyed by command path")
            }

            fn visit_map<A>(self, mut access: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut manifest = Manifest::default();
                while let Some((key, mut entry)) = access.next_entry::<String, ManifestEntry>()? {
                    if entry.cmd_path.is_empty() {
                        entry.cmd_path = key;
                    }
                    manifest.insert(entry);
                }
                Ok(manifest)
            }
        }

        deserializer.deserialize_map(ManifestVisitor)
    }
}

pub fn commands_manifest_path(output_dir: &Path) -> PathBuf {
    output_dir.join("bin").join(COMMANDS_MANIFEST)
}

pub fn handbook_manifest_path(output_dir: &Path) -> PathBuf {
    output_dir.join("bin").join(HANDBOOK_MANIFEST)
}

/// Derive the manifest from `<output>/commands/**.md`, depth-major then lexicographic.
pub fn build_manifest(output_dir: &Path) -> Result<Manifest> {
    let commands_dir = output_dir.join("commands");
    if !commands_dir.is_dir() {
        return Ok(Manifest::default());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(&commands_dir)
        .min_depth(1)
        .max_depth(MAX_DEPTH)
        .follow_links(false)
    {
        let entry = entry.with_context(|| format!("failed to scan {}", commands_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(|ext| ext.to_str()) != Some("md") {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(&commands_dir)
            .with_context(|| format!("{} escaped the commands root", entry.path().display()))?;
        let cmd_path = normalize_for_display(&relative.with_extension(""));
        files.push((entry.depth(), cmd_path, entry.path().to_path_buf()));
    }
    files.sort_by(|left, right| left.0.cmp(&right.0).then_with(|| left.1.cmp(&right.1)));

    let mut manifest = Manifest::default();
    for (_, cmd_path, file) in files {
        let contents =
            fs::read_to_string(&file).with_context(|| format!("failed to read {}", file.display()))?;
        let slug = file
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();
        let parent = cmd_path
            .rsplit_once('/')
            .map(|(parent, _)| parent.to_string());
        manifest.insert(ManifestEntry {
            title: first_heading(&contents).unwrap_or_default(),
            slug,
            markdown_source: format!(
                "{}/commands/{cmd_path}.md",
                normalize_for_display(output_dir).trim_end_matches('/')
            ),
            cmd_path,
            parent,
        });
    }
    debug!(entries = manifest.len(), "built commands manifest");
    Ok(manifest)
}

/// Pretty-print the manifest to `<output>/bin/commands-manifest.json`, replacing any previous file.
pub fn write_manifest(output_dir: &Path, manifest: &Manifest) -> Result<PathBuf> {
    let path = commands_manifest_path(output_dir);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let rendered = serde_json::to_string_pretty(manifest).context("failed to serialize manifest")?;
    fs::write(&path, rendered).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            bail!(
                "Markdown source not found: {} is missing",
                normalize_for_display(path)
            );
        }
        Err(error) => {
            return Err(error).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    if raw.trim().is_empty() {
        bail!(
            "Markdown source not found: {} is empty",
            normalize_for_display(path)
        );
    }
    let manifest: Manifest = serde_json::from_str(&raw).with_context(|| {
        format!(
            "Manifest did not unfurl properly: {} is not a valid manifest",
            normalize_for_display(path)
        )
    })?;
    if manifest.is_empty() {
        bail!(
            "Manifest did not unfurl properly: {} has no entries",
            normalize_for_display(path)
        );
    }
    Ok(manifest)
}
