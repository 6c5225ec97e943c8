use std::collections::HashSet;
use std::sync::LazyLock;

use anyhow::{Result, bail};
use regex::Regex;
use reqwest::Url;

use crate::store::{DocumentRecord, DocumentStore, RecordType};

const GLOBAL_PARAMETERS_HEADING: &str = "<h3>GLOBAL PARAMETERS</h3>";

static HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<h([1-6])((?:\s[^>]*)?)>(.*?)</h([1-6])>").expect("valid heading regex")
});
static ID_ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\s+id\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#).expect("valid id attribute regex")
});
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));
static DASH_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-{2,}").expect("valid dash regex"));

struct HeadingSpan {
    start: usize,
    end: usize,
    level: u8,
    attributes: String,
    inner: String,
}

/// Give every `h1`..`h6` a unique `id` and a trailing self-link.
///
/// Slugs are handed out level by level (all `h1` first), document order within a level;
/// repeats become `slug-2`, `slug-3`, ...
pub fn inject_heading_anchors(html: &str) -> String {
    if html.is_empty() {
        return String::new();
    }

    let headings = HEADING
        .captures_iter(html)
        .filter_map(|found| {
            let whole = found.get(0)?;
            let level = found.get(1)?.as_str();
            if level != found.get(4)?.as_str() {
                return None;
            }
            Some(HeadingSpan {
                start: whole.start(),
                end: whole.end(),
                level: level.parse().ok()?,
                attributes: found
                    .get(2)
                    .map(|value| ID_ATTRIBUTE.replace_all(value.as_str(), "").into_owned())
                    .unwrap_or_default(),
                inner: found.get(3)?.as_str().to_string(),
            })
        })
        .collect::<Vec<_>>();

    let mut slugs = vec![String::new(); headings.len()];
    let mut used = HashSet::new();
    for level in 1..=6u8 {
        for (index, heading) in headings.iter().enumerate() {
            if heading.level != level {
                continue;
            }
            let base = heading_slug(&heading.inner);
            let mut slug = base.clone();
            let mut counter = 2;
            while used.contains(&slug) {
                slug = format!("{base}-{counter}");
                counter += 1;
            }
            used.insert(slug.clone());
            slugs[index] = slug;
        }
    }

    let mut out = String::with_capacity(html.len() + headings.len() * 96);
    let mut cursor = 0;
    for (heading, slug) in headings.iter().zip(&slugs) {
        out.push_str(&html[cursor..heading.start]);
        out.push_str(&format!(
            "<h{level} id=\"{slug}\"{attributes}>{inner}<a href=\"#{slug}\" class=\"anchorlink dashicons-before\"></a></h{level}>",
            level = heading.level,
            attributes = heading.attributes,
            inner = heading.inner,
        ));
        cursor = heading.end;
    }
    out.push_str(&html[cursor..]);
    out
}

/// Heading text reduced to `[a-z0-9-]`, dash runs collapsed.
pub fn heading_slug(inner_html: &str) -> String {
    let text = html_escape::decode_html_entities(&TAG.replace_all(inner_html, "")).into_owned();
    let kept = text
        .chars()
        .filter(|character| character.is_ascii_alphanumeric() || *character == '-' || *character == ' ')
        .collect::<String>()
        .to_ascii_lowercase()
        .replace(' ', "-");
    let slug = DASH_RUN.replace_all(&kept, "-").trim_matches('-').to_string();
    if slug.is_empty() {
        "section".to_string()
    } else {
        slug
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubcommandLink {
    pub id: i64,
    pub title: String,
    pub permalink: String,
    pub description: String,
}

/// Insert a sibling table before the global parameters section and restyle that section.
pub fn inject_subcommand_table(content: &str, current_id: i64, siblings: &[SubcommandLink]) -> String {
    let rows = siblings
        .iter()
        .filter(|sibling| sibling.id != current_id)
        .collect::<Vec<_>>();

    let mut table = String::new();
    if !rows.is_empty() {
        table.push_str("<h3 id=\"subcommands\">SUBCOMMANDS</h3>");
        table.push_str("<table class=\"wp-block-table ee-commands-table\">");
        table.push_str("<thead><tr><th>Name</th><th>Description</th></tr></thead><tbody>");
        for row in rows {
            table.push_str(&format!(
                "<tr><td><a href=\"{}\">{}</a></td><td>{}</td></tr>",
                html_escape::encode_double_quoted_attribute(&row.permalink),
                html_escape::encode_text(&row.title),
                row.description
            ));
        }
        table.push_str("</tbody></table>");
    }

    let Some((before, after)) = content.split_once(GLOBAL_PARAMETERS_HEADING) else {
        return format!("{content}{table}");
    };

    let mut out = format!("{before}{table}");
    if !after.is_empty() {
        let globals = after
            .replace(
                "<table>",
                "<table class=\"wp-block-table ee-global-parameter-table\">",
            )
            .replace(" style=\"text-align: left\"", "")
            .replace("style=\"text-align: left\"", "")
            .replace("<code>", "")
            .replace("</code>", "");
        out.push_str(GLOBAL_PARAMETERS_HEADING);
        out.push_str(&globals);
    }
    out
}

/// GitHub blob links become edit links; anything else is returned as is.
pub fn github_edit_link(source: &str) -> String {
    let is_github = Url::parse(source)
        .ok()
        .and_then(|url| url.host_str().map(|host| host == "github.com"))
        .unwrap_or(false);
    if !is_github || source.to_ascii_lowercase().contains("/edit/master/") {
        return source.to_string();
    }
    source.replace("/blob/master/", "/edit/master/")
}

pub fn title_with_edit_link(title: &str, source: Option<&str>, icon_url: &str) -> String {
    let Some(source) = source.filter(|source| !source.trim().is_empty()) else {
        return title.to_string();
    };
    format!(
        "{title} <a class=\"github-edit\" href=\"{}\"><img src=\"{}\"> <span>Edit</span></a>",
        html_escape::encode_double_quoted_attribute(&github_edit_link(source)),
        html_escape::encode_double_quoted_attribute(icon_url)
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubpageLink {
    pub id: i64,
    pub title: String,
    pub permalink: String,
}

pub fn append_subpage_list(content: &str, current_id: i64, children: &[SubpageLink]) -> String {
    let items = children
        .iter()
        .filter(|child| child.id != current_id)
        .map(|child| {
            format!(
                "<li class=\"page_item page-item-{}\"><a href=\"{}\">{}</a></li>",
                child.id,
                html_escape::encode_double_quoted_attribute(&child.permalink),
                html_escape::encode_text(&child.title)
            )
        })
        .collect::<String>();
    if items.is_empty() {
        return content.to_string();
    }
    format!("{content}<h3 id=\"subpages\" class=\"\">Subpages</h3><ul>{items}</ul>")
}

/// Excerpt when set, otherwise the first non-empty line of the body.
pub fn command_description(excerpt: &str, body: &str) -> String {
    if !excerpt.is_empty() {
        return excerpt.to_string();
    }
    body.split('\n')
        .find(|line| !line.is_empty())
        .map(|line| line.trim_end().to_string())
        .unwrap_or_default()
}

/// `/<type>/<ancestor slugs>/<slug>/`
pub fn permalink<S>(store: &S, record: &DocumentRecord) -> Result<String>
where
    S: DocumentStore + ?Sized,
{
    let mut slugs = vec![record.slug.clone()];
    let mut seen = HashSet::from([record.id]);
    let mut parent = record.parent_id;
    while let Some(parent_id) = parent {
        if !seen.insert(parent_id) {
            bail!("record {} has a cyclic parent chain", record.id);
        }
        let Some(ancestor) = store.get_record(parent_id)? else {
            break;
        };
        slugs.push(ancestor.slug.clone());
        parent = ancestor.parent_id;
    }
    slugs.reverse();
    Ok(format!("/{}/{}/", record.record_type, slugs.join("/")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedRecord {
    pub title: String,
    pub permalink: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct PresentOptions {
    pub listing_limit: usize,
    pub edit_icon_url: String,
}

/// Apply the display-time filters for a record's type to its stored body.
pub fn present_record<S>(store: &S, id: i64, options: &PresentOptions) -> Result<PresentedRecord>
where
    S: DocumentStore + ?Sized,
{
    let Some(record) = store.get_record(id)? else {
        bail!("record {id} does not exist");
    };
    let group_parent = record.parent_id.unwrap_or(record.id);
    let siblings = store.children(group_parent, record.record_type, options.listing_limit)?;

    let (title, body) = match record.record_type {
        RecordType::Commands => {
            let mut links = Vec::with_capacity(siblings.len());
            for sibling in &siblings {
                links.push(SubcommandLink {
                    id: sibling.id,
                    title: sibling.title.clone(),
                    permalink: permalink(store, sibling)?,
                    description: command_description(&sibling.excerpt, &sibling.body),
                });
            }
            (
                record.title.clone(),
                inject_subcommand_table(&record.body, record.id, &links),
            )
        }
        RecordType::Handbook => {
            let mut links = Vec::with_capacity(siblings.len());
            for sibling in &siblings {
                links.push(SubpageLink {
                    id: sibling.id,
                    title: sibling.title.clone(),
                    permalink: permalink(store, sibling)?,
                });
            }
            (
                title_with_edit_link(
                    &record.title,
                    record.source_reference.as_deref(),
                    &options.edit_icon_url,
                ),
                append_subpage_list(&record.body, record.id, &links),
            )
        }
    };

    Ok(PresentedRecord {
        title,
        permalink: permalink(store, &record)?,
        body: inject_heading_anchors(&body),
    })
}
