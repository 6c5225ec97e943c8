use std::sync::LazyLock;

use pulldown_cmark::{Options, Parser, html};
use regex::Regex;
use serde::Deserialize;

static HEADING_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#[ \t]+(.+?)[ \t]*$").expect("valid heading line regex"));
static FRONT_MATTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^---(.+?)---").expect("valid front matter regex"));
static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));
static SLUG_INVALID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("valid slug regex"));

#[derive(Debug, Deserialize)]
struct FrontMatter {
    title: Option<String>,
}

/// Byte range of the first `# ` heading line outside fenced code, plus its text.
fn locate_first_heading(markdown: &str) -> Option<(usize, usize, String)> {
    let mut fence: Option<&str> = None;
    let mut offset = 0;
    for raw_line in markdown.split_inclusive('\n') {
        let start = offset;
        offset += raw_line.len();
        let line = raw_line.trim_end_matches(['\n', '\r']);
        let marker = line.trim_start();
        if let Some(open) = fence {
            if marker.starts_with(open) {
                fence = None;
            }
            continue;
        }
        if marker.starts_with("```") {
            fence = Some("```");
            continue;
        }
        if marker.starts_with("~~~") {
            fence = Some("~~~");
            continue;
        }
        if let Some(heading) = HEADING_LINE.captures(line).and_then(|found| found.get(1)) {
            return Some((start, start + line.len(), heading.as_str().to_string()));
        }
    }
    None
}

/// Text of the first `# ` heading line outside fenced code, if any.
pub fn first_heading(markdown: &str) -> Option<String> {
    locate_first_heading(markdown).map(|(_, _, title)| title)
}

/// Remove the first `# ` heading line, returning the heading text and the remaining body.
pub fn take_first_heading(markdown: &str) -> (Option<String>, String) {
    let Some((start, end, title)) = locate_first_heading(markdown) else {
        return (None, markdown.to_string());
    };
    let mut body = String::with_capacity(markdown.len());
    body.push_str(&markdown[..start]);
    let rest = &markdown[end..];
    let rest = rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n')).unwrap_or(rest);
    body.push_str(rest);
    (Some(title), body)
}

/// Split a leading `---` YAML block from the document. Returns the raw YAML and the rest.
pub fn split_front_matter(markdown: &str) -> (Option<&str>, &str) {
    match FRONT_MATTER.captures(markdown) {
        Some(captures) => {
            let yaml = captures.get(1).map(|value| value.as_str());
            let end = captures.get(0).map(|value| value.end()).unwrap_or(0);
            (yaml, &markdown[end..])
        }
        None => (None, markdown),
    }
}

/// `title:` key of a YAML front-matter block. Malformed YAML yields `None`.
pub fn front_matter_title(yaml: &str) -> Option<String> {
    serde_yaml::from_str::<FrontMatter>(yaml)
        .ok()
        .and_then(|front| front.title)
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
}

pub fn to_html(markdown: &str) -> String {
    let parser = Parser::new_ext(markdown, Options::ENABLE_TABLES);
    let mut out = String::with_capacity(markdown.len() * 3 / 2);
    html::push_html(&mut out, parser);
    out
}

pub fn demote_h1(html: &str) -> String {
    html.replace("<h1>", "<h2>").replace("</h1>", "</h2>")
}

/// Lowercase, collapse every non-alphanumeric run into `-`, trim dashes.
pub fn sanitize_slug(value: &str) -> String {
    let lowered = value.to_lowercase();
    SLUG_INVALID
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string()
}

pub fn sanitize_title(value: &str) -> String {
    WHITESPACE_RUN
        .replace_all(value.trim(), " ")
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_heading_skips_deeper_levels() {
        let markdown = "intro\n## Not this\n# ee site create\n\nbody\n# second\n";
        assert_eq!(first_heading(markdown).as_deref(), Some("ee site create"));
        assert_eq!(first_heading("no heading here"), None);
    }

    #[test]
    fn take_first_heading_removes_only_that_line() {
        let (title, body) = take_first_heading("# ee site\n\nSome text\n# ee other\n");
        assert_eq!(title.as_deref(), Some("ee site"));
        assert_eq!(body, "\nSome text\n# ee other\n");
    }

    #[test]
    fn heading_detection_ignores_fenced_code() {
        let markdown = "Intro text.\n\n```bash\n# install deps\nmake\n```\n";
        assert_eq!(first_heading(markdown), None);
        let (title, body) = take_first_heading(markdown);
        assert!(title.is_none());
        assert_eq!(body, markdown);

        let tilde = "~~~\n# not a title\n~~~\n# Real title\n";
        assert_eq!(first_heading(tilde).as_deref(), Some("Real title"));
        let (_, body) = take_first_heading(tilde);
        assert_eq!(body, "~~~\n# not a title\n~~~\n");
    }

    #[test]
    fn split_front_matter_returns_yaml_and_body() {
        let (yaml, body) = split_front_matter("---\ntitle: Install\n---\n# Heading\n");
        assert_eq!(yaml, Some("\ntitle: Install\n"));
        assert_eq!(body, "\n# Heading\n");
        assert_eq!(front_matter_title(yaml.expect("yaml")).as_deref(), Some("Install"));

        let (yaml, body) = split_front_matter("# plain\n");
        assert!(yaml.is_none());
        assert_eq!(body, "# plain\n");
    }

    #[test]
    fn to_html_renders_tables_and_demotes() {
        let html = to_html("# Title\n\n| a | b |\n|---|---|\n| 1 | 2 |\n");
        assert!(html.contains("<table>"));
        let demoted = demote_h1(&html);
        assert!(demoted.contains("<h2>Title</h2>"));
        assert!(!demoted.contains("<h1>"));
    }

    #[test]
    fn sanitizers_normalize_values() {
        assert_eq!(sanitize_slug("Site Create!"), "site-create");
        assert_eq!(sanitize_slug("ee_site"), "ee-site");
        assert_eq!(sanitize_title("  ee   site\tcreate "), "ee site create");
    }
}
