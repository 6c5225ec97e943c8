use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::DocsyncConfig;
use crate::runtime::{ResolvedPaths, normalize_for_display};

/// One node of the external tool's command tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandNode {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "longdesc", alias = "long_description")]
    pub long_description: Option<String>,
    /// `None` marks a leaf. An empty list still counts as having subcommands.
    #[serde(default)]
    pub subcommands: Option<Vec<CommandNode>>,
}

impl CommandNode {
    pub fn has_subcommands(&self) -> bool {
        self.subcommands.is_some()
    }

    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }

    pub fn long_description(&self) -> &str {
        self.long_description.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuntimeFlag {
    Bool(bool),
    Value(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterMeta {
    #[serde(default)]
    pub runtime: Option<RuntimeFlag>,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub deprecated: Option<Value>,
}

impl ParameterMeta {
    /// A parameter explicitly marked `runtime: false` never applies at runtime.
    pub fn is_runtime_applicable(&self) -> bool {
        !matches!(self.runtime, Some(RuntimeFlag::Bool(false)))
    }

    pub fn description(&self) -> &str {
        self.desc.as_deref().unwrap_or("")
    }

    /// Value suffix shown after `--name`, e.g. `=<url>`.
    pub fn runtime_suffix(&self) -> Option<&str> {
        match &self.runtime {
            Some(RuntimeFlag::Value(value)) if !value.is_empty() => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn is_deprecated(&self) -> bool {
        match &self.deprecated {
            None | Some(Value::Null) => false,
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(text)) => !text.is_empty() && text != "0",
            Some(Value::Number(number)) => number.as_f64().is_some_and(|value| value != 0.0),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::Object(fields)) => !fields.is_empty(),
        }
    }
}

/// Global parameters in the order the external tool declared them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterRegistry {
    entries: Vec<(String, ParameterMeta)>,
}

impl ParameterRegistry {
    pub fn new(entries: Vec<(String, ParameterMeta)>) -> Self {
        Self { entries }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterMeta)> {
        self.entries.iter().map(|(name, meta)| (name.as_str(), meta))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'de> Deserialize<'de> for ParameterRegistry {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RegistryVisitor;

        impl<'de> Visitor<'de> for RegistryVisitor {
            type Value = ParameterRegistry;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of parameter names to parameter metadata")
            }

            fn visit_map<A>(self, mut access: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, meta)) = access.next_entry::<String, ParameterMeta>()? {
                    entries.push((name, meta));
                }
                Ok(ParameterRegistry { entries })
            }

            // An empty registry may be encoded as `[]`.
            fn visit_seq<A>(self, mut access: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                if access.next_element::<de::IgnoredAny>()?.is_some() {
                    return Err(de::Error::custom(
                        "parameter registry must be an object, found a non-empty array",
                    ));
                }
                Ok(ParameterRegistry::default())
            }
        }

        deserializer.deserialize_any(RegistryVisitor)
    }
}

/// Seam over the external tool that knows the command tree.
pub trait CommandSource {
    fn command_tree(&mut self) -> Result<Vec<CommandNode>>;
    fn parameter_registry(&mut self) -> Result<ParameterRegistry>;
}

#[derive(Debug, Deserialize)]
struct CommandDump {
    #[serde(default)]
    subcommands: Vec<CommandNode>,
}

/// Runs `<interpreter> <binary> <args..>` and decodes its JSON output.
#[derive(Debug, Clone)]
pub struct ExternalTool {
    pub interpreter: String,
    pub binary: PathBuf,
    pub command_dump_args: Vec<String>,
    pub param_dump_args: Vec<String>,
    pub excluded_commands: Vec<String>,
}

impl ExternalTool {
    pub fn from_config(paths: &ResolvedPaths, config: &DocsyncConfig) -> Self {
        Self {
            interpreter: config.interpreter(),
            binary: paths.extractor_binary(config),
            command_dump_args: config.command_dump_args(),
            param_dump_args: config.param_dump_args(),
            excluded_commands: config.excluded_commands(),
        }
    }

    fn run(&self, args: &[String]) -> Result<String> {
        let output = Command::new(&self.interpreter)
            .arg(&self.binary)
            .args(args)
            .output()
            .with_context(|| {
                format!(
                    "failed to execute {} {} {}",
                    self.interpreter,
                    normalize_for_display(&self.binary),
                    args.join(" ")
                )
            })?;
        if !output.status.success() {
            warn!(
                code = output.status.code().unwrap_or(1),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "extractor exited unsuccessfully; decoding stdout anyway"
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl CommandSource for ExternalTool {
    fn command_tree(&mut self) -> Result<Vec<CommandNode>> {
        let stdout = self.run(&self.command_dump_args)?;
        let nodes = decode_command_tree(&stdout, &self.excluded_commands).with_context(|| {
            format!(
                "failed to decode output of `{}`",
                self.command_dump_args.join(" ")
            )
        })?;
        debug!(count = nodes.len(), "decoded command tree");
        Ok(nodes)
    }

    fn parameter_registry(&mut self) -> Result<ParameterRegistry> {
        let stdout = self.run(&self.param_dump_args)?;
        let registry = decode_parameter_registry(&stdout).with_context(|| {
            format!(
                "failed to decode output of `{}`",
                self.param_dump_args.join(" ")
            )
        })?;
        debug!(count = registry.len(), "decoded parameter registry");
        Ok(registry)
    }
}

/// Decode `{ "subcommands": [...] }`, dropping excluded top-level names.
pub fn decode_command_tree(raw: &str, excluded: &[String]) -> Result<Vec<CommandNode>> {
    let dump: CommandDump =
        serde_json::from_str(raw.trim()).context("command dump is not valid JSON")?;
    Ok(dump
        .subcommands
        .into_iter()
        .filter(|node| !excluded.iter().any(|name| name == &node.name))
        .collect())
}

pub fn decode_parameter_registry(raw: &str) -> Result<ParameterRegistry> {
    serde_json::from_str(raw.trim()).context("parameter dump is not valid JSON")
}

/// Make sure the extractor binary exists, downloading it first when a URL is configured.
pub fn ensure_binary(binary: &Path, download_url: Option<&str>, user_agent: &str) -> Result<()> {
    if let Some(url) = download_url {
        download_binary(url, binary, user_agent)?;
    }
    if !binary.exists() {
        bail!(
            "extractor binary not found at {}. Add it or configure [extractor].download_url and try again",
            normalize_for_display(binary)
        );
    }
    Ok(())
}

fn download_binary(url: &str, destination: &Path, user_agent: &str) -> Result<()> {
    let client = Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .context("failed to build download HTTP client")?;
    let response = client
        .get(url)
        .header("User-Agent", user_agent)
        .send()
        .with_context(|| format!("failed to download {url}"))?;
    let status = response.status();
    if !status.is_success() {
        bail!("download of {url} failed with HTTP {status}");
    }
    let bytes = response
        .bytes()
        .with_context(|| format!("failed to read download body from {url}"))?;

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let partial = destination.with_extension("download");
    fs::write(&partial, &bytes)
        .with_context(|| format!("failed to write {}", partial.display()))?;
    fs::rename(&partial, destination).with_context(|| {
        format!(
            "failed to move {} to {}",
            partial.display(),
            destination.display()
        )
    })?;
    info!(
        bytes = bytes.len(),
        path = %normalize_for_display(destination),
        "downloaded extractor binary"
    );
    Ok(())
}

/// Remove the home-relative directory the extractor leaves behind. Returns the removed path.
pub fn cleanup_scratch_dir(scratch_dir: Option<&str>) -> Result<Option<PathBuf>> {
    let Some(relative) = scratch_dir else {
        return Ok(None);
    };
    let Some(home) = dirs::home_dir() else {
        warn!("home directory is unknown; skipping scratch cleanup");
        return Ok(None);
    };
    remove_scratch_under(&home, relative)
}

fn remove_scratch_under(home: &Path, relative: &str) -> Result<Option<PathBuf>> {
    let relative_path = Path::new(relative.trim());
    let confined = relative_path.components().next().is_some()
        && relative_path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !confined {
        bail!("scratch_dir must be a plain path below the home directory: {relative}");
    }
    let target = home.join(relative_path);
    if !target.is_dir() {
        return Ok(None);
    }
    fs::remove_dir_all(&target)
        .with_context(|| format!("failed to remove {}", target.display()))?;
    Ok(Some(target))
}
