use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use regex::Regex;
use reqwest::Url;
use reqwest::blocking::Client;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::DocsyncConfig;
use crate::store::{open_connection, unix_timestamp};

const GITHUB_CACHE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS github_cache (
    cache_key TEXT PRIMARY KEY,
    body TEXT NOT NULL,
    expires_at_unix INTEGER NOT NULL
);
"#;

const GITHUB_ACCEPT: &str = "application/vnd.github.v3+json";

pub trait GithubApi {
    fn get_json(&mut self, url: &str) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub struct GithubClientConfig {
    pub user_agent: String,
    pub token: Option<String>,
    pub timeout_ms: u64,
    pub cache_ttl_seconds: u64,
}

impl GithubClientConfig {
    pub fn from_config(config: &DocsyncConfig) -> Self {
        Self {
            user_agent: config.github_user_agent(),
            token: config.github_token(),
            timeout_ms: config.github_timeout_ms(),
            cache_ttl_seconds: config.github_cache_ttl_seconds(),
        }
    }
}

/// GitHub GETs with responses kept in SQLite for the configured TTL.
pub struct CachedGithubClient {
    client: Client,
    connection: Connection,
    config: GithubClientConfig,
}

impl CachedGithubClient {
    pub fn open(db_path: &Path, config: GithubClientConfig) -> Result<Self> {
        let connection = open_connection(db_path)?;
        connection
            .execute_batch(GITHUB_CACHE_SCHEMA_SQL)
            .context("failed to initialize github cache schema")?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build GitHub HTTP client")?;
        Ok(Self {
            client,
            connection,
            config,
        })
    }

    fn cached(&self, key: &str) -> Result<Option<Value>> {
        let body = self
            .connection
            .query_row(
                "SELECT body FROM github_cache WHERE cache_key = ?1 AND expires_at_unix > ?2",
                params![key, unix_timestamp()?],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .context("failed to read github cache")?;
        match body {
            Some(body) => Ok(Some(
                serde_json::from_str(&body).context("failed to decode cached GitHub response")?,
            )),
            None => Ok(None),
        }
    }

    fn remember(&self, key: &str, value: &Value) -> Result<()> {
        let ttl = i64::try_from(self.config.cache_ttl_seconds).unwrap_or(i64::MAX);
        let expires_at = unix_timestamp()?.saturating_add(ttl);
        self.connection
            .execute(
                "INSERT INTO github_cache (cache_key, body, expires_at_unix) VALUES (?1, ?2, ?3)
                 ON CONFLICT(cache_key) DO UPDATE SET body = excluded.body, expires_at_unix = excluded.expires_at_unix",
                params![key, value.to_string(), expires_at],
            )
            .context("failed to write github cache")?;
        Ok(())
    }
}

impl GithubApi for CachedGithubClient {
    fn get_json(&mut self, url: &str) -> Result<Value> {
        let key = cache_key(url);
        if let Some(value) = self.cached(&key)? {
            debug!(url, "github cache hit");
            return Ok(value);
        }

        let mut request = self
            .client
            .get(url)
            .header("Accept", GITHUB_ACCEPT)
            .header("User-Agent", self.config.user_agent.clone());
        if let Some(token) = &self.config.token {
            request = request.header("Authorization", format!("token {token}"));
        }
        let response = request.send().context("failed to call GitHub API")?;
        let status = response.status();
        if status.as_u16() != 200 {
            bail!("GitHub API error (HTTP code {})", status.as_u16());
        }
        let value: Value = response
            .json()
            .context("failed to decode GitHub API JSON response")?;
        self.remember(&key, &value)?;
        Ok(value)
    }
}

pub fn cache_key(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let mut output = String::from("cli_github_");
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[derive(Debug, Clone)]
pub struct ShortcodeSettings {
    pub api_url: String,
    pub org: String,
    pub root_repo: String,
    pub repo_pattern: String,
}

impl ShortcodeSettings {
    pub fn from_config(config: &DocsyncConfig) -> Self {
        Self {
            api_url: config.github_api_url(),
            org: config.github_org(),
            root_repo: config.github_root_repo(),
            repo_pattern: config.github_repo_pattern(),
        }
    }
}

/// `#000` on light label colours, `#FFF` otherwise.
pub fn label_text_color(background: &str) -> &'static str {
    let channel = |start: usize| {
        background
            .get(start..start + 2)
            .and_then(|pair| u32::from_str_radix(pair, 16).ok())
            .unwrap_or(0)
    };
    let brightness = (channel(0) * 299 + channel(2) * 587 + channel(4) * 114) / 1000;
    if brightness > 135 { "#000" } else { "#FFF" }
}

fn inline_error(message: &str) -> String {
    format!("<p>{}</p>\n", html_escape::encode_text(message))
}

fn text(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Open issues carrying `label` across the organisation, grouped by repository.
pub fn render_issue_list<A>(api: &mut A, settings: &ShortcodeSettings, label: &str) -> String
where
    A: GithubApi + ?Sized,
{
    let mut out = format!(
        "<h2>Issues labeled \"{}\" </h2>",
        html_escape::encode_text(label)
    );

    let url = match Url::parse_with_params(
        &format!("{}/orgs/{}/issues", settings.api_url, settings.org),
        &[("per_page", "100"), ("labels", label), ("filter", "all")],
    ) {
        Ok(url) => url,
        Err(error) => {
            out.push_str(&inline_error(&format!("invalid GitHub API URL: {error}")));
            return out;
        }
    };
    let issues = match api.get_json(url.as_str()) {
        Ok(issues) => issues,
        Err(error) => {
            out.push_str(&inline_error(&format!("{error:#}")));
            return out;
        }
    };
    let issues = issues.as_array().cloned().unwrap_or_default();
    if issues.is_empty() {
        out.push_str(&inline_error("No issues found."));
        return out;
    }

    let mut groups: Vec<(String, Vec<&Value>)> = vec![(settings.root_repo.clone(), Vec::new())];
    for issue in &issues {
        let repo = issue
            .get("repository")
            .map(|repository| text(repository, "full_name"))
            .unwrap_or_default();
        match groups.iter_mut().find(|(name, _)| *name == repo) {
            Some((_, members)) => members.push(issue),
            None => groups.push((repo, vec![issue])),
        }
    }

    for (repo, members) in groups {
        if members.is_empty() {
            continue;
        }
        out.push_str(&format!("<h4>{}</h4><ul>", html_escape::encode_text(&repo)));
        for issue in members {
            out.push_str(&format!(
                "<li><a href=\"{}\">{}</a><br />\n",
                html_escape::encode_double_quoted_attribute(&text(issue, "html_url")),
                html_escape::encode_text(&text(issue, "title"))
            ));
            let labels = issue
                .get("labels")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if !labels.is_empty() {
                for issue_label in &labels {
                    let name = text(issue_label, "name");
                    if name == label {
                        continue;
                    }
                    let color = text(issue_label, "color");
                    let style = format!(
                        "display:inline-block;padding-left:3px;padding-right:3px;color:{};background-color:#{color}",
                        label_text_color(&color)
                    );
                    out.push_str(&format!(
                        "<span class=\"label\" style=\"{}\">{}</span> ",
                        html_escape::encode_double_quoted_attribute(&style),
                        html_escape::encode_text(&name)
                    ));
                }
                out.push_str("<br />");
            }
            out.push_str("</li>");
        }
        out.push_str("</ul>");
    }
    out
}

/// Table of command repositories with milestone, release and CI status.
pub fn render_repo_list<A>(api: &mut A, settings: &ShortcodeSettings) -> String
where
    A: GithubApi + ?Sized,
{
    let mut out = String::from("<h2>Repositories</h2>");

    let pattern = match Regex::new(&settings.repo_pattern) {
        Ok(pattern) => pattern,
        Err(error) => {
            out.push_str(&inline_error(&format!("invalid repo_pattern: {error}")));
            return out;
        }
    };
    let repos = match api.get_json(&format!(
        "{}/orgs/{}/repos?per_page=100",
        settings.api_url, settings.org
    )) {
        Ok(repos) => repos,
        Err(error) => {
            out.push_str(&inline_error(&format!("{error:#}")));
            return out;
        }
    };

    let mut names = repos
        .as_array()
        .map(|repos| {
            repos
                .iter()
                .map(|repo| text(repo, "full_name"))
                .filter(|name| pattern.is_match(name) && *name != settings.root_repo)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    names.sort();
    names.dedup();
    names.insert(0, settings.root_repo.clone());

    out.push_str("<table>\n<thead>\n<tr>\n<th>Repository</th>\n<th>Overview</th>\n<th>Status</th>\n</tr>\n</thead>\n");
    for name in &names {
        out.push_str("<tr>\n");
        out.push_str(&format!(
            "<td><a href=\"{}\">{}</a></td>\n",
            html_escape::encode_double_quoted_attribute(&format!("https://github.com/{name}")),
            html_escape::encode_text(name)
        ));
        out.push_str("<td><ul>\n");
        out.push_str(&format!(
            "<li>Active: {}</li>",
            active_milestone(api, settings, name)
        ));
        out.push_str(&format!(
            "<li>Latest: {}</li>",
            latest_release(api, settings, name)
        ));
        out.push_str("</ul></td>\n");
        out.push_str(&format!(
            "<td><a href=\"{}\"><img src=\"{}\"></a></td>\n",
            html_escape::encode_double_quoted_attribute(&format!(
                "https://travis-ci.org/{name}/branches"
            )),
            html_escape::encode_double_quoted_attribute(&format!(
                "https://travis-ci.org/{name}.svg?branch=master"
            ))
        ));
        out.push_str("</tr>\n");
    }
    out.push_str("</table>");
    out
}

fn active_milestone<A>(api: &mut A, settings: &ShortcodeSettings, repo: &str) -> String
where
    A: GithubApi + ?Sized,
{
    match api.get_json(&format!("{}/repos/{repo}/milestones", settings.api_url)) {
        Err(error) => html_escape::encode_text(&format!("{error:#}")).into_owned(),
        Ok(milestones) => match milestones.as_array().and_then(|list| list.first()) {
            None => "<em>None</em>".to_string(),
            Some(milestone) => format!(
                "<a href=\"{}\">v{}</a> ({} open, {} closed)",
                html_escape::encode_double_quoted_attribute(&text(milestone, "html_url")),
                html_escape::encode_text(&text(milestone, "title")),
                milestone
                    .get("open_issues")
                    .and_then(Value::as_i64)
                    .unwrap_or(0),
                milestone
                    .get("closed_issues")
                    .and_then(Value::as_i64)
                    .unwrap_or(0)
            ),
        },
    }
}

fn latest_release<A>(api: &mut A, settings: &ShortcodeSettings, repo: &str) -> String
where
    A: GithubApi + ?Sized,
{
    match api.get_json(&format!("{}/repos/{repo}/releases", settings.api_url)) {
        Err(error) => html_escape::encode_text(&format!("{error:#}")).into_owned(),
        Ok(releases) => match releases.as_array().and_then(|list| list.first()) {
            None => "<em>None</em>".to_string(),
            Some(release) => format!(
                "<a href=\"{}\">{}</a>",
                html_escape::encode_double_quoted_attribute(&text(release, "html_url")),
                html_escape::encode_text(&text(release, "tag_name"))
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[derive(Default)]
    struct MockGithub {
        responses: HashMap<String, Value>,
        requested: Vec<String>,
    }

    impl GithubApi for MockGithub {
        fn get_json(&mut self, url: &str) -> Result<Value> {
            self.requested.push(url.to_string());
            match self.responses.get(url) {
                Some(value) => Ok(value.clone()),
                None => bail!("GitHub API error (HTTP code 404)"),
            }
        }
    }

    fn settings() -> ShortcodeSettings {
        ShortcodeSettings {
            api_url: "https://api.test".to_string(),
            org: "wp-cli".to_string(),
            root_repo: "wp-cli/wp-cli".to_string(),
            repo_pattern: "^wp-cli/.+-command$".to_string(),
        }
    }

    const ISSUES_URL: &str =
        "https://api.test/orgs/wp-cli/issues?per_page=100&labels=good-first-issue&filter=all";

    #[test]
    fn label_text_color_follows_brightness() {
        assert_eq!(label_text_color("ffffff"), "#000");
        assert_eq!(label_text_color("000000"), "#FFF");
        assert_eq!(label_text_color("7057ff"), "#FFF");
        assert_eq!(label_text_color("fbca04"), "#000");
        assert_eq!(label_text_color("zz"), "#FFF");
    }

    #[test]
    fn cache_key_is_stable_hex() {
        let key = cache_key("https://api.github.com/orgs/wp-cli/repos");
        assert!(key.starts_with("cli_github_"));
        assert_eq!(key.len(), "cli_github_".len() + 64);
        assert_eq!(key, cache_key("https://api.github.com/orgs/wp-cli/repos"));
    }

    #[test]
    fn issue_list_groups_by_repository_root_first() {
        let mut api = MockGithub::default();
        api.responses.insert(
            ISSUES_URL.to_string(),
            json!([
                {
                    "title": "Fix <b>scaffold</b>",
                    "html_url": "https://github.com/wp-cli/scaffold-command/issues/1",
                    "repository": {"full_name": "wp-cli/scaffold-command"},
                    "labels": [
                        {"name": "good-first-issue", "color": "7057ff"},
                        {"name": "bug", "color": "ffffff"}
                    ]
                },
                {
                    "title": "Core issue",
                    "html_url": "https://github.com/wp-cli/wp-cli/issues/2",
                    "repository": {"full_name": "wp-cli/wp-cli"},
                    "labels": []
                }
            ]),
        );

        let html = render_issue_list(&mut api, &settings(), "good-first-issue");
        assert!(html.starts_with("<h2>Issues labeled \"good-first-issue\" </h2>"));
        let core = html.find("<h4>wp-cli/wp-cli</h4>").expect("root group");
        let scaffold = html.find("<h4>wp-cli/scaffold-command</h4>").expect("scaffold group");
        assert!(core < scaffold);
        assert!(html.contains("Fix &lt;b&gt;scaffold&lt;/b&gt;"));
        assert!(html.contains("color:#000;background-color:#ffffff\">bug</span> "));
        assert!(!html.contains(">good-first-issue</span>"));
        assert!(html.contains("<li><a href=\"https://github.com/wp-cli/wp-cli/issues/2\">Core issue</a><br />\n</li>"));
    }

    #[test]
    fn issue_list_renders_errors_and_empty_results_inline() {
        let mut api = MockGithub::default();
        let html = render_issue_list(&mut api, &settings(), "good-first-issue");
        assert!(html.ends_with("<p>GitHub API error (HTTP code 404)</p>\n"));

        api.responses.insert(ISSUES_URL.to_string(), json!([]));
        let html = render_issue_list(&mut api, &settings(), "good-first-issue");
        assert!(html.ends_with("<p>No issues found.</p>\n"));
    }

    #[test]
    fn repo_list_filters_sorts_and_puts_root_first() {
        let mut api = MockGithub::default();
        api.responses.insert(
            "https://api.test/orgs/wp-cli/repos?per_page=100".to_string(),
            json!([
                {"full_name": "wp-cli/scaffold-command"},
                {"full_name": "wp-cli/wp-cli"},
                {"full_name": "wp-cli/handbook"},
                {"full_name": "wp-cli/cache-command"}
            ]),
        );
        api.responses.insert(
            "https://api.test/repos/wp-cli/wp-cli/milestones".to_string(),
            json!([{"html_url": "https://github.com/wp-cli/wp-cli/milestone/9", "title": "2.5.0", "open_issues": 3, "closed_issues": 7}]),
        );
        api.responses.insert(
            "https://api.test/repos/wp-cli/wp-cli/releases".to_string(),
            json!([{"html_url": "https://github.com/wp-cli/wp-cli/releases/v2.4.0", "tag_name": "v2.4.0"}]),
        );
        api.responses.insert(
            "https://api.test/repos/wp-cli/cache-command/milestones".to_string(),
            json!([]),
        );

        let html = render_repo_list(&mut api, &settings());
        let root = html.find(">wp-cli/wp-cli</a>").expect("root");
        let cache = html.find(">wp-cli/cache-command</a>").expect("cache");
        let scaffold = html.find(">wp-cli/scaffold-command</a>").expect("scaffold");
        assert!(root < cache && cache < scaffold);
        assert!(!html.contains("wp-cli/handbook"));
        assert!(html.contains("<li>Active: <a href=\"https://github.com/wp-cli/wp-cli/milestone/9\">v2.5.0</a> (3 open, 7 closed)</li>"));
        assert!(html.contains("<li>Latest: <a href=\"https://github.com/wp-cli/wp-cli/releases/v2.4.0\">v2.4.0</a></li>"));
        assert!(html.contains("<li>Active: <em>None</em></li>"));
        assert!(html.contains("<li>Latest: GitHub API error (HTTP code 404)</li>"));
        assert!(html.contains("https://travis-ci.org/wp-cli/cache-command.svg?branch=master"));
        assert!(html.ends_with("</table>"));
    }

    #[test]
    fn cached_responses_are_served_until_expiry() {
        let temp = tempdir().expect("tempdir");
        let config = GithubClientConfig {
            user_agent: "docsync-test".to_string(),
            token: None,
            timeout_ms: 1_000,
            cache_ttl_seconds: 180,
        };
        let mut client =
            CachedGithubClient::open(&temp.path().join("docsync.db"), config).expect("open");
        let url = "http://127.0.0.1:9/orgs/wp-cli/repos";
        let payload = json!([{"full_name": "wp-cli/wp-cli"}]);
        client.remember(&cache_key(url), &payload).expect("remember");
        assert_eq!(client.get_json(url).expect("cache hit"), payload);

        client.config.cache_ttl_seconds = 0;
        client.remember(&cache_key(url), &payload).expect("remember expired");
        assert_eq!(client.cached(&cache_key(url)).expect("lookup"), None);
    }
}
