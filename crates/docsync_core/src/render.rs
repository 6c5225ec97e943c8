use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::extract::{CommandNode, ParameterRegistry};
use crate::markdown::first_heading;

pub const DEFAULT_PAGE_TEMPLATE: &str = include_str!("../templates/command-page.liquid");

const BUNDLE_MARKER: &str = " --type=";
const PUBLISH_VARIANT: &str = "publish --type=";
const GLOBAL_TABLE_HEADER: &str = "| **Argument**    | **Description**              |\n|:----------------|:-----------------------------|";

static SECTION_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^## ").expect("valid section heading regex"));
static OPTION_AT_LINE_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(\[?)--").expect("valid option regex"));
static INDENTED_OPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t][ \t]--").expect("valid indented option regex"));
static MERGE_TAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\w().,;`]$").expect("valid merge tail regex"));
static MERGE_HEAD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\w|`|\\--\w)").expect("valid merge head regex"));
static GLOBAL_PARAMETERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)(#?## GLOBAL PARAMETERS).*").expect("valid global parameters regex")
});

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub output_dir: PathBuf,
    pub command_prefix: String,
    pub breadcrumb_base: String,
    pub skipped_commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub path: String,
    pub title: Option<String>,
    pub breadcrumb: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct WrittenPage {
    pub page: RenderedPage,
    pub file: PathBuf,
    pub bundled_variants: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RenderReport {
    pub written: Vec<WrittenPage>,
    pub skipped_commands: Vec<String>,
}

impl RenderReport {
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.written.iter().map(|written| written.file.as_path())
    }
}

#[derive(Debug, Serialize)]
struct PageBinding<'a> {
    prefix: &'a str,
    name: &'a str,
    synopsis: String,
    path: String,
    breadcrumbs: &'a str,
    description: &'a str,
    docs: String,
    has_subcommands: bool,
}

/// Renders command nodes into Markdown pages under `<output>/commands/`.
pub struct PageRenderer<'a> {
    options: RenderOptions,
    registry: &'a ParameterRegistry,
    template: liquid::Template,
}

impl<'a> PageRenderer<'a> {
    pub fn new(
        options: RenderOptions,
        registry: &'a ParameterRegistry,
        template_source: &str,
    ) -> Result<Self> {
        let parser = liquid::ParserBuilder::with_stdlib()
            .build()
            .context("failed to build template parser")?;
        let template = parser
            .parse(template_source)
            .context("failed to parse command page template")?;
        Ok(Self {
            options,
            registry,
            template,
        })
    }

    pub fn commands_dir(&self) -> PathBuf {
        self.options.output_dir.join("commands")
    }

    pub fn render_tree(&self, nodes: &[CommandNode]) -> Result<RenderReport> {
        let mut report = RenderReport::default();
        for node in nodes {
            if self
                .options
                .skipped_commands
                .iter()
                .any(|name| name == &node.name)
            {
                report.skipped_commands.push(node.name.clone());
                continue;
            }
            self.render_node(node, &[], &mut report)?;
        }
        Ok(report)
    }

    fn render_node(
        &self,
        node: &CommandNode,
        ancestors: &[String],
        report: &mut RenderReport,
    ) -> Result<()> {
        let page = self.render_page(node, ancestors, false)?;
        let file = self.write_page(&page)?;
        report.written.push(WrittenPage {
            page,
            file,
            bundled_variants: 0,
        });

        let Some(children) = node.subcommands.as_deref() else {
            return Ok(());
        };

        let mut lineage = ancestors.to_vec();
        lineage.push(node.name.clone());

        let arranged = arrange_subcommands(children);
        for child in &arranged.plain {
            self.render_node(child, &lineage, report)?;
        }
        for (base, variants) in &arranged.bundles {
            self.render_bundle(base, variants, &lineage, report)?;
        }
        Ok(())
    }

    /// Concatenate every variant into one page at `<parent>/<base>.md`; the last one is canonical.
    fn render_bundle(
        &self,
        base: &str,
        variants: &[CommandNode],
        ancestors: &[String],
        report: &mut RenderReport,
    ) -> Result<()> {
        let mut body = String::new();
        let mut canonical = None;
        for (index, variant) in variants.iter().enumerate() {
            let is_last = index + 1 == variants.len();
            let page = self.render_page(variant, ancestors, !is_last)?;
            body.push_str(&page.body);
            if is_last {
                canonical = Some(page);
            }
        }
        let Some(canonical) = canonical else {
            return Ok(());
        };

        let mut path_names = ancestors.to_vec();
        path_names.push(base.to_string());
        let page = RenderedPage {
            path: path_names.join("/"),
            title: first_heading(&body),
            breadcrumb: canonical.breadcrumb,
            body,
        };
        let file = self.write_page(&page)?;
        report.written.push(WrittenPage {
            page,
            file,
            bundled_variants: variants.len(),
        });
        Ok(())
    }

    /// Render one node without writing it. `skip_global` drops the global parameter section.
    pub fn render_page(
        &self,
        node: &CommandNode,
        ancestors: &[String],
        skip_global: bool,
    ) -> Result<RenderedPage> {
        let mut names = ancestors.to_vec();
        names.push(node.name.clone());

        let breadcrumb = breadcrumb(&self.options.breadcrumb_base, &names);
        let docs = if node.long_description().is_empty() {
            String::new()
        } else {
            let table = if skip_global || node.has_subcommands() {
                None
            } else {
                Some(global_parameter_table(self.registry))
            };
            process_long_description(
                node.long_description(),
                &self.options.command_prefix,
                table.as_deref(),
            )
        };

        let binding = PageBinding {
            prefix: &self.options.command_prefix,
            name: &node.name,
            synopsis: names.join(" "),
            path: names.join("/"),
            breadcrumbs: &breadcrumb,
            description: node.description(),
            docs,
            has_subcommands: node.has_subcommands(),
        };
        let globals = liquid::to_object(&binding).context("failed to build template binding")?;
        let body = self
            .template
            .render(&globals)
            .with_context(|| format!("failed to render page for {}", binding.path))?;

        Ok(RenderedPage {
            path: binding.path,
            title: first_heading(&body),
            breadcrumb,
            body,
        })
    }

    fn write_page(&self, page: &RenderedPage) -> Result<PathBuf> {
        let file = self.commands_dir().join(format!("{}.md", page.path));
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&file, &page.body)
            .with_context(|| format!("failed to write {}", file.display()))?;
        debug!(path = %page.path, "generated command page");
        Ok(file)
    }
}

#[derive(Debug, Default)]
struct ArrangedSubcommands {
    plain: Vec<CommandNode>,
    bundles: Vec<(String, Vec<CommandNode>)>,
}

fn arrange_subcommands(children: &[CommandNode]) -> ArrangedSubcommands {
    let mut ordered = Vec::with_capacity(children.len());
    let mut publish = None;
    for child in children {
        if child.name.contains(PUBLISH_VARIANT) {
            let mut renamed = child.clone();
            renamed.name = "publish".to_string();
            publish = Some(renamed);
        } else {
            ordered.push(child.clone());
        }
    }
    ordered.extend(publish);

    let mut arranged = ArrangedSubcommands::default();
    for child in ordered {
        let Some((base, _)) = child.name.split_once(BUNDLE_MARKER) else {
            arranged.plain.push(child);
            continue;
        };
        let base = base.to_string();
        match arranged.bundles.iter_mut().find(|(name, _)| *name == base) {
            Some((_, variants)) => variants.push(child),
            None => arranged.bundles.push((base, vec![child])),
        }
    }
    arranged
}

/// `[Commands](base)` followed by a link per ancestor and the current name as plain text.
pub fn breadcrumb(base: &str, names: &[String]) -> String {
    let mut out = format!("[Commands]({base})");
    let mut href = base.to_string();
    for (index, name) in names.iter().enumerate() {
        href.push_str(name);
        href.push('/');
        if index + 1 < names.len() {
            out.push_str(&format!(" &raquo; [{name}]({href})"));
        } else {
            out.push_str(&format!(" &raquo; {name}"));
        }
    }
    out
}

/// Normalize an upstream long description for Markdown output.
///
/// `global_table` replaces the `GLOBAL PARAMETERS` section; `None` removes the section.
pub fn process_long_description(
    text: &str,
    command_prefix: &str,
    global_table: Option<&str>,
) -> String {
    let escaped = escape_html(text);
    let demoted = SECTION_HEADING.replace_all(&escaped, "### ");
    let options = OPTION_AT_LINE_START.replace_all(&demoted, "${1}\\--");
    let options = INDENTED_OPTION.replace_all(&options, "  \\--");
    let unwrapped = unwrap_hard_wraps(&options);
    let decoded = undo_double_encoding(&unwrapped, command_prefix);
    replace_global_parameters(&decoded, global_table)
}

/// Escape `&`, `<`, `>` and `"`; single quotes are left alone.
pub fn escape_html(text: &str) -> String {
    html_escape::encode_double_quoted_attribute(text).into_owned()
}

/// Merge hard-wrapped lines back into paragraphs, leaving front matter and fenced code intact.
pub fn unwrap_hard_wraps(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut in_front_matter = false;
    let mut in_code_block = false;
    let mut last_open = false;

    for line in text.split('\n') {
        if line == "---" || line == "\\---" {
            in_front_matter = !in_front_matter;
            out.push(line.to_string());
            last_open = false;
            continue;
        }
        if line == "```" {
            in_code_block = !in_code_block;
            out.push(line.to_string());
            last_open = false;
            continue;
        }
        if in_front_matter || in_code_block {
            out.push(line.to_string());
            continue;
        }
        if last_open
            && let Some(previous) = out.last_mut()
            && MERGE_TAIL.is_match(previous)
            && MERGE_HEAD.is_match(line)
        {
            previous.push(' ');
            previous.push_str(line);
            continue;
        }
        out.push(line.to_string());
        last_open = true;
    }

    out.join("\n")
}

fn undo_double_encoding(text: &str, command_prefix: &str) -> String {
    text.replace(" &lt; ", " < ")
        .replace(" &gt; ", " > ")
        .replace(" &lt;&lt;", " <<")
        .replace("&quot;", "\"")
        .replace(&format!("{command_prefix}&gt; "), &format!("{command_prefix}> "))
        .replace("=&gt;", "=>")
}

fn replace_global_parameters(text: &str, global_table: Option<&str>) -> String {
    let Some(found) = GLOBAL_PARAMETERS.captures(text) else {
        return text.to_string();
    };
    let (Some(whole), Some(marker)) = (found.get(0), found.get(1)) else {
        return text.to_string();
    };
    let mut out = text[..whole.start()].to_string();
    if let Some(table) = global_table {
        out.push_str(marker.as_str());
        out.push_str("\n\n");
        out.push_str(table);
    }
    out
}

/// Two-column Markdown table of runtime-applicable, described, non-deprecated parameters.
pub fn global_parameter_table(registry: &ParameterRegistry) -> String {
    let mut table = GLOBAL_TABLE_HEADER.to_string();
    for (name, meta) in registry.iter() {
        if !meta.is_runtime_applicable() || meta.description().is_empty() || meta.is_deprecated()
        {
            continue;
        }
        let argument = if name == "color" {
            "--[no-]color".to_string()
        } else {
            format!("--{name}{}", meta.runtime_suffix().unwrap_or(""))
        };
        table.push_str(&format!(
            "\n| `{}` | {} |",
            argument.replace('|', "\\|"),
            meta.description().replace('|', "\\|")
        ));
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::decode_parameter_registry;
    use tempfile::tempdir;

    fn registry() -> ParameterRegistry {
        decode_parameter_registry(
            r#"{
                "path": {"runtime": "=<path>", "desc": "Path to the install."},
                "color": {"runtime": true, "desc": "Whether to colorize."},
                "debug": {"runtime": false, "desc": "Show debug output."},
                "secret": {"runtime": true, "desc": ""},
                "old": {"runtime": true, "desc": "Old.", "deprecated": "yes"},
                "filter": {"runtime": "=<a|b>", "desc": "Pick a|b."}
            }"#,
        )
        .expect("registry")
    }

    fn leaf(name: &str, longdesc: &str) -> CommandNode {
        CommandNode {
            name: name.to_string(),
            description: Some(format!("{name} description.")),
            long_description: Some(longdesc.to_string()),
            subcommands: None,
        }
    }

    fn options(output_dir: &Path) -> RenderOptions {
        RenderOptions {
            output_dir: output_dir.to_path_buf(),
            command_prefix: "ee".to_string(),
            breadcrumb_base: "/commands/".to_string(),
            skipped_commands: vec!["handbook".to_string()],
        }
    }

    #[test]
    fn unwrap_merges_hard_wrapped_paragraphs() {
        let input = "This is a long\nwrapped sentence,\nacross lines.\n\nNew paragraph\n\\--force flag";
        assert_eq!(
            unwrap_hard_wraps(input),
            "This is a long wrapped sentence, across lines.\n\nNew paragraph \\--force flag"
        );
    }

    #[test]
    fn unwrap_leaves_fenced_code_and_front_matter() {
        let input = "Intro\n```\nline one\nline two\n```\n---\nkey: value\nother: value\n---\nOutro";
        assert_eq!(unwrap_hard_wraps(input), input);
    }

    #[test]
    fn unwrap_is_identity_without_mergeable_lines() {
        let input = "Ends with colon:\nnext line\n\n- list item\n- second item\n[ ] box -\n(paren";
        assert_eq!(unwrap_hard_wraps(input), input);
    }

    #[test]
    fn unwrap_is_idempotent() {
        let inputs = [
            "a\nb\nc\n\nd\n`code`\n\\--flag\n",
            "Para (one),\ncontinues;\n```\nraw\ntext\n```\nmore\nwords",
            "---\ntitle: x\n---\nfoo\nbar\n\n## Head\ntext.\nnext",
            "",
        ];
        for input in inputs {
            let once = unwrap_hard_wraps(input);
            assert_eq!(unwrap_hard_wraps(&once), once, "input: {input:?}");
        }
    }

    #[test]
    fn process_long_description_escapes_and_normalizes() {
        let text = "## OPTIONS\n\n[--force]\n: Force it.\n  --site=<name>\n\n## EXAMPLES\n\n    $ ee site create \"example.com\" 2>&1 > log\n    ee> run";
        let out = process_long_description(text, "ee", None);
        assert!(out.contains("### OPTIONS"));
        assert!(out.contains("[\\--force]"));
        assert!(out.contains("  \\--site=&lt;name&gt;"));
        assert!(out.contains("ee site create \"example.com\" 2&gt;&amp;1 > log"));
        assert!(out.contains("ee> run"));
    }

    #[test]
    fn global_parameters_are_replaced_by_table() {
        let table = global_parameter_table(&registry());
        let out = process_long_description(
            "Does things.\n\n## GLOBAL PARAMETERS\n\n  --path=<path>\n  whatever follows",
            "ee",
            Some(&table),
        );
        let expected = format!(
            "Does things.\n\n### GLOBAL PARAMETERS\n\n{}\n{}\n{}\n{}",
            GLOBAL_TABLE_HEADER,
            "| `--path=<path>` | Path to the install. |",
            "| `--[no-]color` | Whether to colorize. |",
            "| `--filter=<a\\|b>` | Pick a\\|b. |"
        );
        assert_eq!(out, expected);
    }

    #[test]
    fn global_parameters_removed_when_suppressed() {
        let out = process_long_description("Body.\n\n## GLOBAL PARAMETERS\n\nstuff", "ee", None);
        assert_eq!(out, "Body.\n\n");
    }

    #[test]
    fn breadcrumb_links_ancestors_only() {
        let names = vec!["site".to_string(), "create".to_string()];
        assert_eq!(
            breadcrumb("/commands/", &names),
            "[Commands](/commands/) &raquo; [site](/commands/site/) &raquo; create"
        );
    }

    #[test]
    fn leaf_pages_have_no_subcommand_section() {
        let temp = tempdir().expect("tempdir");
        let registry = registry();
        let renderer =
            PageRenderer::new(options(temp.path()), &registry, DEFAULT_PAGE_TEMPLATE).expect("renderer");
        let node = leaf("info", "Shows info.\n\n## GLOBAL PARAMETERS\n\nx");
        let page = renderer
            .render_page(&node, &["site".to_string()], false)
            .expect("render");
        assert_eq!(page.path, "site/info");
        assert_eq!(page.title.as_deref(), Some("ee site info"));
        assert!(!page.body.contains("SUBCOMMANDS"));
        assert!(page.body.contains("### GLOBAL PARAMETERS"));
        assert!(page.body.contains("info description."));
    }

    #[test]
    fn parent_pages_drop_global_parameters() {
        let temp = tempdir().expect("tempdir");
        let registry = registry();
        let renderer =
            PageRenderer::new(options(temp.path()), &registry, DEFAULT_PAGE_TEMPLATE).expect("renderer");
        let node = CommandNode {
            name: "site".to_string(),
            description: Some("Manage sites.".to_string()),
            long_description: Some("Site commands.\n\n## GLOBAL PARAMETERS\n\nx".to_string()),
            subcommands: Some(Vec::new()),
        };
        let page = renderer.render_page(&node, &[], false).expect("render");
        assert!(!page.body.contains("GLOBAL PARAMETERS"));
        assert!(!page.body.contains("SUBCOMMANDS"));
    }

    #[test]
    fn render_tree_writes_pages_and_bundles_variants() {
        let temp = tempdir().expect("tempdir");
        let registry = registry();
        let renderer =
            PageRenderer::new(options(temp.path()), &registry, DEFAULT_PAGE_TEMPLATE).expect("renderer");
        let tree = vec![
            CommandNode {
                name: "site".to_string(),
                description: Some("Manage sites.".to_string()),
                long_description: Some(String::new()),
                subcommands: Some(vec![
                    leaf("foo --type=a", "Variant a.\n\n## GLOBAL PARAMETERS\n\nx"),
                    leaf("list", "Lists.\n\n## GLOBAL PARAMETERS\n\nx"),
                    leaf("foo --type=b", "Variant b.\n\n## GLOBAL PARAMETERS\n\nx"),
                ]),
            },
            leaf("handbook", "Never rendered."),
        ];

        let report = renderer.render_tree(&tree).expect("render tree");
        let paths = report
            .written
            .iter()
            .map(|written| written.page.path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(paths, vec!["site", "site/list", "site/foo"]);
        assert_eq!(report.skipped_commands, vec!["handbook"]);

        let commands = temp.path().join("commands");
        assert!(commands.join("site.md").exists());
        assert!(commands.join("site/list.md").exists());
        assert!(!commands.join("site/foo --type=a.md").exists());
        assert!(!commands.join("site/foo --type=b.md").exists());
        assert!(!commands.join("handbook.md").exists());

        let bundled = fs::read_to_string(commands.join("site/foo.md")).expect("bundle");
        let a = bundled.find("Variant a.").expect("variant a");
        let b = bundled.find("Variant b.").expect("variant b");
        assert!(a < b);
        assert_eq!(bundled.matches("### GLOBAL PARAMETERS").count(), 1);
        assert!(bundled.find("### GLOBAL PARAMETERS").expect("table") > b);
        assert_eq!(first_heading(&bundled).as_deref(), Some("ee site foo --type=a"));
        assert_eq!(report.written[2].bundled_variants, 2);
    }

    #[test]
    fn publish_variant_is_renamed_and_moved_last() {
        let children = vec![
            leaf("publish --type=wp", "first"),
            leaf("create", "create"),
            leaf("publish --type=html", "second"),
            leaf("delete", "delete"),
        ];
        let arranged = arrange_subcommands(&children);
        let names = arranged
            .plain
            .iter()
            .map(|node| node.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["create", "delete", "publish"]);
        assert_eq!(arranged.plain[2].long_description(), "second");
        assert!(arranged.bundles.is_empty());
    }

    #[test]
    fn custom_template_is_used() {
        let temp = tempdir().expect("tempdir");
        let registry = ParameterRegistry::default();
        let renderer = PageRenderer::new(
            options(temp.path()),
            &registry,
            "# {{ prefix }} {{ synopsis }}\n{{ path }}|{{ has_subcommands }}",
        )
        .expect("renderer");
        let page = renderer
            .render_page(&leaf("up", ""), &["site".to_string()], false)
            .expect("render");
        assert_eq!(page.body, "# ee site up\nsite/up|false");
    }
}
