//! Full-text search over closed sessions, one tantivy index per org
//!
//! Indexes live at `<dir>/<org>/`. A session is indexed once, when its
//! transcript is committed; indexing the same session id again replaces
//! the earlier document. Queries use tantivy's query syntax over `input`
//! and `output`, and any field can be addressed directly, e.g.
//! `connection:pg-prod AND error:true`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tantivy::{
    Index, IndexWriter, ReloadPolicy, TantivyDocument, Term,
    collector::TopDocs,
    query::{BooleanQuery, Occur, Query, QueryParser, TermQuery},
    schema::*,
};
use tracing::{debug, info};

use crate::wal::{SessionTranscript, StorageWriter, sanitize_component};

/// Upper bound on hits returned by one search
pub const MAX_SEARCH_LIMIT: usize = 50;

const WRITER_HEAP_BYTES: usize = 50_000_000;

/// A matching session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHit {
    pub session_id: String,
    pub user_id: String,
    pub user: String,
    pub connection: String,
    pub connection_type: String,
    pub verb: String,
    pub size: u64,
    pub input: String,
    pub output: String,
    pub is_input_truncated: bool,
    pub is_output_truncated: bool,
    pub is_error: bool,
    pub started: String,
    pub completed: String,
    /// Seconds between start and end
    pub duration: i64,
    pub score: f32,
}

#[derive(Clone, Copy)]
struct Fields {
    session_id: Field,
    user_id: Field,
    user: Field,
    connection: Field,
    connection_type: Field,
    verb: Field,
    size: Field,
    input: Field,
    output: Field,
    input_truncated: Field,
    output_truncated: Field,
    error: Field,
    started: Field,
    completed: Field,
    duration: Field,
}

fn session_schema() -> (Schema, Fields) {
    let mut builder = Schema::builder();
    let fields = Fields {
        session_id: builder.add_text_field("session", STRING | STORED),
        user_id: builder.add_text_field("user_id", STRING | STORED),
        user: builder.add_text_field("user", STRING | STORED),
        connection: builder.add_text_field("connection", STRING | STORED),
        connection_type: builder.add_text_field("connection_type", STRING | STORED),
        verb: builder.add_text_field("verb", STRING | STORED),
        size: builder.add_u64_field("size", INDEXED | STORED),
        input: builder.add_text_field("input", TEXT | STORED),
        output: builder.add_text_field("output", TEXT | STORED),
        input_truncated: builder.add_bool_field("isinput_trunc", INDEXED | STORED),
        output_truncated: builder.add_bool_field("isoutput_trunc", INDEXED | STORED),
        error: builder.add_bool_field("error", INDEXED | STORED),
        started: builder.add_text_field("started", STRING | STORED),
        completed: builder.add_text_field("completed", STRING | STORED),
        duration: builder.add_i64_field("duration", INDEXED | STORED),
    };
    (builder.build(), fields)
}

struct OrgIndex {
    index: Index,
    fields: Fields,
    writer: Mutex<IndexWriter>,
}

impl OrgIndex {
    fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("creating index dir {}", path.display()))?;
        let (schema, _) = session_schema();
        let index = if path.join("meta.json").exists() {
            Index::open_in_dir(path)?
        } else {
            Index::create_in_dir(path, schema)?
        };
        let fields = resolve_fields(&index.schema())?;
        let writer = index
            .writer(WRITER_HEAP_BYTES)
            .context("Failed to create index writer")?;
        Ok(Self {
            index,
            fields,
            writer: Mutex::new(writer),
        })
    }
}

/// Look the fields up by name so an index written by an older build still opens
fn resolve_fields(schema: &Schema) -> Result<Fields> {
    let f = |name: &str| {
        schema
            .get_field(name)
            .with_context(|| format!("index schema has no field {name}"))
    };
    Ok(Fields {
        session_id: f("session")?,
        user_id: f("user_id")?,
        user: f("user")?,
        connection: f("connection")?,
        connection_type: f("connection_type")?,
        verb: f("verb")?,
        size: f("size")?,
        input: f("input")?,
        output: f("output")?,
        input_truncated: f("isinput_trunc")?,
        output_truncated: f("isoutput_trunc")?,
        error: f("error")?,
        started: f("started")?,
        completed: f("completed")?,
        duration: f("duration")?,
    })
}

struct Inner {
    dir: PathBuf,
    orgs: Mutex<HashMap<String, Arc<OrgIndex>>>,
}

/// Per-org session indexes under one directory
#[derive(Clone)]
pub struct SessionIndex {
    inner: Arc<Inner>,
}

impl SessionIndex {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                dir: dir.into(),
                orgs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    fn org(&self, org_id: &str) -> Result<Arc<OrgIndex>> {
        let mut orgs = self.inner.orgs.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(index) = orgs.get(org_id) {
            return Ok(index.clone());
        }
        let path = self.inner.dir.join(sanitize_component(org_id));
        info!("opening session index for org {} at {}", org_id, path.display());
        let index = Arc::new(OrgIndex::open(&path)?);
        orgs.insert(org_id.to_string(), index.clone());
        Ok(index)
    }

    /// Add or replace the document of a committed session
    pub fn index_transcript(&self, transcript: &SessionTranscript) -> Result<()> {
        let org = self.org(&transcript.org_id)?;
        let f = org.fields;
        let (input, output) = transcript.direction_text();
        let duration = (transcript.end_date - transcript.start_date).num_seconds();

        let mut doc = TantivyDocument::default();
        doc.add_text(f.session_id, &transcript.session_id);
        doc.add_text(f.user_id, &transcript.user_id);
        doc.add_text(f.user, &transcript.user_email);
        doc.add_text(f.connection, &transcript.connection_name);
        doc.add_text(f.connection_type, &transcript.connection_type);
        doc.add_text(f.verb, &transcript.verb);
        doc.add_u64(f.size, (input.len() + output.len()) as u64);
        doc.add_text(f.input, &input);
        doc.add_text(f.output, &output);
        doc.add_bool(f.input_truncated, transcript.is_input_truncated);
        doc.add_bool(f.output_truncated, transcript.is_output_truncated);
        doc.add_bool(f.error, transcript.session_error.is_some());
        doc.add_text(f.started, transcript.start_date.to_rfc3339());
        doc.add_text(f.completed, transcript.end_date.to_rfc3339());
        doc.add_i64(f.duration, duration);

        let mut writer = org.writer.lock().unwrap_or_else(|p| p.into_inner());
        writer.delete_term(Term::from_field_text(f.session_id, &transcript.session_id));
        writer.add_document(doc)?;
        writer.commit()?;

        debug!(
            "session {} indexed for org {} ({} bytes)",
            transcript.session_id,
            transcript.org_id,
            input.len() + output.len()
        );
        Ok(())
    }

    /// Search an org's sessions, best match first.
    ///
    /// `user_id` restricts hits to sessions of that user. `limit` is capped
    /// at [`MAX_SEARCH_LIMIT`].
    pub fn search(
        &self,
        org_id: &str,
        query_str: &str,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SessionHit>> {
        let org = self.org(org_id)?;
        let f = org.fields;
        let reader = org
            .index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()?;
        let searcher = reader.searcher();

        let parser = QueryParser::for_index(&org.index, vec![f.input, f.output]);
        let parsed = parser
            .parse_query(query_str)
            .context("Failed to parse search query")?;
        let query: Box<dyn Query> = match user_id {
            Some(user_id) => Box::new(BooleanQuery::new(vec![
                (Occur::Must, parsed),
                (
                    Occur::Must,
                    Box::new(TermQuery::new(
                        Term::from_field_text(f.user_id, user_id),
                        IndexRecordOption::Basic,
                    )),
                ),
            ])),
            None => parsed,
        };

        let limit = limit.clamp(1, MAX_SEARCH_LIMIT);
        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            let text = |field: Field| {
                doc.get_first(field)
                    .and_then(|v: &OwnedValue| v.as_str())
                    .unwrap_or("")
                    .to_string()
            };
            let flag = |field: Field| {
                doc.get_first(field)
                    .and_then(|v: &OwnedValue| v.as_bool())
                    .unwrap_or(false)
            };
            hits.push(SessionHit {
                session_id: text(f.session_id),
                user_id: text(f.user_id),
                user: text(f.user),
                connection: text(f.connection),
                connection_type: text(f.connection_type),
                verb: text(f.verb),
                size: doc
                    .get_first(f.size)
                    .and_then(|v: &OwnedValue| v.as_u64())
                    .unwrap_or(0),
                input: text(f.input),
                output: text(f.output),
                is_input_truncated: flag(f.input_truncated),
                is_output_truncated: flag(f.output_truncated),
                is_error: flag(f.error),
                started: text(f.started),
                completed: text(f.completed),
                duration: doc
                    .get_first(f.duration)
                    .and_then(|v: &OwnedValue| v.as_i64())
                    .unwrap_or(0),
                score,
            });
        }

        debug!(
            "org {} search '{}' returned {} hits",
            org_id,
            query_str,
            hits.len()
        );
        Ok(hits)
    }
}

#[async_trait]
impl StorageWriter for SessionIndex {
    async fn write(&self, transcript: &SessionTranscript) -> Result<()> {
        let index = self.clone();
        let transcript = transcript.clone();
        tokio::task::spawn_blocking(move || index.index_transcript(&transcript))
            .await
            .context("indexing task failed")?
    }
}
