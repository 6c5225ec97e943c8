use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, Row, params};

const STORE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_type TEXT NOT NULL,
    title TEXT NOT NULL,
    slug TEXT NOT NULL,
    parent_id INTEGER REFERENCES documents(id),
    source_reference TEXT,
    body TEXT NOT NULL DEFAULT '',
    excerpt TEXT NOT NULL DEFAULT '',
    created_at_unix INTEGER NOT NULL,
    updated_at_unix INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_type_title ON documents(record_type, title);
CREATE INDEX IF NOT EXISTS idx_documents_parent ON documents(parent_id);
"#;

const RECORD_COLUMNS: &str =
    "id, record_type, title, slug, parent_id, source_reference, body, excerpt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    Commands,
    Handbook,
}

impl RecordType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commands => "commands",
            Self::Handbook => "handbook",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "commands" | "command" => Ok(Self::Commands),
            "handbook" => Ok(Self::Handbook),
            other => bail!("unknown record type `{other}` (expected commands or handbook)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    pub id: i64,
    pub record_type: RecordType,
    pub title: String,
    pub slug: String,
    pub parent_id: Option<i64>,
    pub source_reference: Option<String>,
    pub body: String,
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub record_type: RecordType,
    pub title: String,
    pub slug: String,
    pub parent_id: Option<i64>,
    pub source_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUpdate {
    pub body: String,
    pub excerpt: String,
    /// Only replaces the stored title when set.
    pub title: Option<String>,
}

/// Hierarchical record storage. Records are never deleted through this seam.
pub trait DocumentStore {
    /// Records of one type in creation order, capped at `limit`.
    fn list_records(&self, record_type: RecordType, limit: usize) -> Result<Vec<DocumentRecord>>;
    fn get_record(&self, id: i64) -> Result<Option<DocumentRecord>>;
    fn create_record(&mut self, record: &NewRecord) -> Result<i64>;
    fn update_content(&mut self, id: i64, update: &ContentUpdate) -> Result<()>;
    fn set_source_reference(&mut self, id: i64, source_reference: &str) -> Result<()>;
    /// Direct children ordered by title.
    fn children(
        &self,
        parent_id: i64,
        record_type: RecordType,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>>;
    /// Records without a parent ordered by title.
    fn top_level(&self, record_type: RecordType, limit: usize) -> Result<Vec<DocumentRecord>>;
    fn count(&self, record_type: RecordType) -> Result<usize>;
}

pub struct SqliteDocumentStore {
    connection: Connection,
}

impl SqliteDocumentStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let connection = open_connection(db_path)?;
        connection
            .execute_batch(STORE_SCHEMA_SQL)
            .context("failed to initialize document store schema")?;
        Ok(Self { connection })
    }

    fn query_records(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<DocumentRecord>> {
        let mut statement = self
            .connection
            .prepare(sql)
            .with_context(|| format!("failed to prepare query: {sql}"))?;
        let rows = statement
            .query_map(params, read_record_row)
            .with_context(|| format!("failed query: {sql}"))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(decode_record(row.context("failed to decode document row")?)?);
        }
        Ok(records)
    }
}

type RawRecord = (i64, String, String, String, Option<i64>, Option<String>, String, String);

fn read_record_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn decode_record(raw: RawRecord) -> Result<DocumentRecord> {
    let (id, record_type, title, slug, parent_id, source_reference, body, excerpt) = raw;
    Ok(DocumentRecord {
        id,
        record_type: record_type.parse()?,
        title,
        slug,
        parent_id,
        source_reference,
        body,
        excerpt,
    })
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl DocumentStore for SqliteDocumentStore {
    fn list_records(&self, record_type: RecordType, limit: usize) -> Result<Vec<DocumentRecord>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM documents WHERE record_type = ?1 ORDER BY id LIMIT ?2"
            ),
            params![record_type.as_str(), sql_limit(limit)],
        )
    }

    fn get_record(&self, id: i64) -> Result<Option<DocumentRecord>> {
        let raw = self
            .connection
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM documents WHERE id = ?1"),
                params![id],
                read_record_row,
            )
            .optional()
            .with_context(|| format!("failed to load document {id}"))?;
        raw.map(decode_record).transpose()
    }

    fn create_record(&mut self, record: &NewRecord) -> Result<i64> {
        let now = unix_timestamp()?;
        self.connection
            .execute(
                "INSERT INTO documents (
                    record_type, title, slug, parent_id, source_reference,
                    created_at_unix, updated_at_unix
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    record.record_type.as_str(),
                    record.title,
                    record.slug,
                    record.parent_id,
                    record.source_reference,
                    now,
                ],
            )
            .with_context(|| format!("failed to insert document `{}`", record.title))?;
        Ok(self.connection.last_insert_rowid())
    }

    fn update_content(&mut self, id: i64, update: &ContentUpdate) -> Result<()> {
        let now = unix_timestamp()?;
        let changed = self
            .connection
            .execute(
                "UPDATE documents
                 SET body = ?2, excerpt = ?3, title = COALESCE(?4, title), updated_at_unix = ?5
                 WHERE id = ?1",
                params![id, update.body, update.excerpt, update.title, now],
            )
            .with_context(|| format!("failed to update document {id}"))?;
        if changed == 0 {
            bail!("document {id} does not exist");
        }
        Ok(())
    }

    fn set_source_reference(&mut self, id: i64, source_reference: &str) -> Result<()> {
        let now = unix_timestamp()?;
        let changed = self
            .connection
            .execute(
                "UPDATE documents SET source_reference = ?2, updated_at_unix = ?3 WHERE id = ?1",
                params![id, source_reference, now],
            )
            .with_context(|| format!("failed to update source reference of document {id}"))?;
        if changed == 0 {
            bail!("document {id} does not exist");
        }
        Ok(())
    }

    fn children(
        &self,
        parent_id: i64,
        record_type: RecordType,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM documents
                 WHERE parent_id = ?1 AND record_type = ?2
                 ORDER BY title, id LIMIT ?3"
            ),
            params![parent_id, record_type.as_str(), sql_limit(limit)],
        )
    }

    fn top_level(&self, record_type: RecordType, limit: usize) -> Result<Vec<DocumentRecord>> {
        self.query_records(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM documents
                 WHERE parent_id IS NULL AND record_type = ?1
                 ORDER BY title, id LIMIT ?2"
            ),
            params![record_type.as_str(), sql_limit(limit)],
        )
    }

    fn count(&self, record_type: RecordType) -> Result<usize> {
        let count: i64 = self
            .connection
            .query_row(
                "SELECT COUNT(*) FROM documents WHERE record_type = ?1",
                params![record_type.as_str()],
                |row| row.get(0),
            )
            .context("failed to count documents")?;
        usize::try_from(count).context("count does not fit into usize")
    }
}

pub(crate) fn open_connection(db_path: &Path) -> Result<Connection> {
    let parent = db_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", db_path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })?;
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

pub(crate) fn unix_timestamp() -> Result<i64> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?
        .as_secs();
    i64::try_from(seconds).context("timestamp does not fit into i64")
}

/// In-memory store used by unit tests across modules.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    pub records: Vec<DocumentRecord>,
    pub fail_titles: Vec<String>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn titles(&self) -> Vec<&str> {
        self.records.iter().map(|record| record.title.as_str()).collect()
    }

    pub fn by_title(&self, title: &str) -> Option<&DocumentRecord> {
        self.records.iter().find(|record| record.title == title)
    }

    fn sorted(mut records: Vec<DocumentRecord>, limit: usize) -> Vec<DocumentRecord> {
        records.sort_by(|left, right| left.title.cmp(&right.title).then(left.id.cmp(&right.id)));
        records.truncate(limit);
        records
    }
}

#[cfg(test)]
impl DocumentStore for MemoryStore {
    fn list_records(&self, record_type: RecordType, limit: usize) -> Result<Vec<DocumentRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|record| record.record_type == record_type)
            .take(limit)
            .cloned()
            .collect())
    }

    fn get_record(&self, id: i64) -> Result<Option<DocumentRecord>> {
        Ok(self.records.iter().find(|record| record.id == id).cloned())
    }

    fn create_record(&mut self, record: &NewRecord) -> Result<i64> {
        if self.fail_titles.contains(&record.title) {
            bail!("simulated failure for `{}`", record.title);
        }
        let id = self.records.len() as i64 + 1;
        self.records.push(DocumentRecord {
            id,
            record_type: record.record_type,
            title: record.title.clone(),
            slug: record.slug.clone(),
            parent_id: record.parent_id,
            source_reference: record.source_reference.clone(),
            body: String::new(),
            excerpt: String::new(),
        });
        Ok(id)
    }

    fn update_content(&mut self, id: i64, update: &ContentUpdate) -> Result<()> {
        let Some(record) = self.records.iter_mut().find(|record| record.id == id) else {
            bail!("document {id} does not exist");
        };
        record.body = update.body.clone();
        record.excerpt = update.excerpt.clone();
        if let Some(title) = &update.title {
            record.title = title.clone();
        }
        Ok(())
    }

    fn set_source_reference(&mut self, id: i64, source_reference: &str) -> Result<()> {
        let Some(record) = self.records.iter_mut().find(|record| record.id == id) else {
            bail!("document {id} does not exist");
        };
        record.source_reference = Some(source_reference.to_string());
        Ok(())
    }

    fn children(
        &self,
        parent_id: i64,
        record_type: RecordType,
        limit: usize,
    ) -> Result<Vec<DocumentRecord>> {
        let matching = self
            .records
            .iter()
            .filter(|record| record.parent_id == Some(parent_id) && record.record_type == record_type)
            .cloned()
            .collect();
        Ok(Self::sorted(matching, limit))
    }

    fn top_level(&self, record_type: RecordType, limit: usize) -> Result<Vec<DocumentRecord>> {
        let matching = self
            .records
            .iter()
            .filter(|record| record.parent_id.is_none() && record.record_type == record_type)
            .cloned()
            .collect();
        Ok(Self::sorted(matching, limit))
    }

    fn count(&self, record_type: RecordType) -> Result<usize> {
        Ok(self
            .records
            .iter()
            .filter(|record| record.record_type == record_type)
            .count())
    }
}
