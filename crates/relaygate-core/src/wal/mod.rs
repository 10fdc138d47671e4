//! Write-ahead audit log for per-session transcripts
//!
//! Each session gets its own append-only file `<dir>/<org>/<session>.wal`.
//! Record 1 is the JSON header, events follow in strictly increasing index
//! order, and a footer records whether the transcript reached storage.
//! Input and output are capped independently; events past the cap are
//! dropped and the direction is flagged as truncated.
//!
//! File work runs on the blocking pool; a session's async lock is held
//! across it so its records keep their order.

pub mod log;
pub mod record;
pub mod storage;

use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::context::SessionContext;

pub use log::{CommitStatus, EventType, WalContents, WalEvent, WalHeader, WalLog, read_contents};
pub use storage::{JsonFileStorageWriter, SessionTranscript, StorageWriter, TranscriptEvent};

pub const DEFAULT_MAX_DIRECTION_BYTES: usize = 600 * 1024;
pub const WAL_EXTENSION: &str = "wal";

/// Commit error recorded for logs left behind by a previous process
pub const ORPHAN_COMMIT_ERROR: &str = "gateway restarted before session close";

#[derive(Debug, Error)]
pub enum WalError {
    #[error("no open wal for session {0}")]
    NotFound(String),

    #[error("wal header is already written")]
    HeaderAlreadyWritten,

    #[error("wal footer is already written")]
    FooterAlreadyWritten,

    #[error("expected a header before any event")]
    ExpectHeader,

    #[error("invalid wal header: {0}")]
    InvalidHeader(String),

    #[error("wal corrupted: {reason}")]
    Corrupted { reason: String },

    #[error("wal record too large: max {max} got {got}")]
    RecordTooLarge { max: usize, got: usize },

    #[error("failed committing session transcript: {0}")]
    Commit(String),

    #[error("wal i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wal json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("wal background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Escape an id into a single path component.
///
/// ASCII alphanumerics, `-` and `_` are kept; every other byte becomes `.xx`
/// (lowercase hex), so distinct ids never share a file name.
pub(crate) fn sanitize_component(raw: &str) -> String {
    if raw.is_empty() {
        return "_".to_string();
    }
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!(".{b:02x}"));
        }
    }
    out
}

async fn blocking<T, F>(f: F) -> Result<T, WalError>
where
    F: FnOnce() -> Result<T, WalError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

fn lock_log(log: &StdMutex<WalLog>) -> MutexGuard<'_, WalLog> {
    log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run `f` against the log on the blocking pool
async fn with_log<T, F>(log: &Arc<StdMutex<WalLog>>, f: F) -> Result<T, WalError>
where
    F: FnOnce(&mut WalLog) -> Result<T, WalError> + Send + 'static,
    T: Send + 'static,
{
    let log = log.clone();
    blocking(move || f(&mut lock_log(&log))).await
}

impl WalHeader {
    pub fn from_context(ctx: &SessionContext) -> Self {
        Self {
            org_id: ctx.org_id.clone(),
            session_id: ctx.sid.clone(),
            user_id: ctx.user_id.clone(),
            user_name: ctx.user_name.clone(),
            user_email: ctx.user_email.clone(),
            connection_name: ctx.connection_name.clone(),
            connection_type: ctx.connection_type.clone(),
            verb: ctx.client_verb.clone(),
            commit_status: CommitStatus::Open,
            commit_error: None,
            start_date: Utc::now(),
            end_date: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalSettings {
    pub dir: PathBuf,
    pub max_input_bytes: usize,
    pub max_output_bytes: usize,
    /// Keep successfully committed logs on disk instead of removing them
    pub retain_committed: bool,
}

impl Default for WalSettings {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("relaygate").join("wal"),
            max_input_bytes: DEFAULT_MAX_DIRECTION_BYTES,
            max_output_bytes: DEFAULT_MAX_DIRECTION_BYTES,
            retain_committed: false,
        }
    }
}

/// Result of one `append`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Written { index: u64 },
    /// Only the first `kept` bytes fit under the cap; the direction is now truncated
    Truncated { index: u64, kept: usize },
    /// The direction was already truncated
    Dropped,
}

/// Summary of a closed session log
#[derive(Debug, Clone)]
pub struct CloseReport {
    pub footer: WalHeader,
    pub event_count: usize,
    pub event_size: u64,
    pub is_input_truncated: bool,
    pub is_output_truncated: bool,
    /// Where the log remains on disk, if it was kept
    pub retained_path: Option<PathBuf>,
}

/// A log without footer found on startup
#[derive(Debug, Clone)]
pub struct RecoveredLog {
    pub path: PathBuf,
    pub session_id: String,
    pub committed: bool,
}

struct SessionWal {
    log: Arc<StdMutex<WalLog>>,
    path: PathBuf,
    header: WalHeader,
    input_bytes: usize,
    output_bytes: usize,
    input_truncated: bool,
    output_truncated: bool,
    closing: bool,
}

/// Table of open session logs
pub struct WalStore {
    settings: WalSettings,
    writer: Arc<dyn StorageWriter>,
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionWal>>>>,
}

impl WalStore {
    pub fn new(settings: WalSettings, writer: Arc<dyn StorageWriter>) -> Self {
        Self {
            settings,
            writer,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &WalSettings {
        &self.settings
    }

    pub fn path_for(&self, org_id: &str, session_id: &str) -> PathBuf {
        self.settings.dir.join(sanitize_component(org_id)).join(format!(
            "{}.{}",
            sanitize_component(session_id),
            WAL_EXTENSION
        ))
    }

    /// Create (or truncate) the session's log and write its header
    pub async fn open(&self, header: WalHeader) -> Result<PathBuf, WalError> {
        header.validate()?;
        let path = self.path_for(&header.org_id, &header.session_id);
        let log = blocking({
            let path = path.clone();
            let header = header.clone();
            move || WalLog::create_with_header(&path, &header)
        })
        .await?;
        let sid = header.session_id.clone();
        let state = SessionWal {
            log: Arc::new(StdMutex::new(log)),
            path: path.clone(),
            header,
            input_bytes: 0,
            output_bytes: 0,
            input_truncated: false,
            output_truncated: false,
            closing: false,
        };
        let previous = self
            .sessions
            .lock()
            .await
            .insert(sid.clone(), Arc::new(Mutex::new(state)));
        if previous.is_some() {
            warn!("session {} wal reopened, previous handle discarded", sid);
        }
        debug!("session {} wal opened at {}", sid, path.display());
        Ok(path)
    }

    pub async fn is_open(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    pub async fn open_sessions(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Record one event at the next index
    pub async fn append(
        &self,
        session_id: &str,
        event_type: EventType,
        data: &[u8],
    ) -> Result<AppendOutcome, WalError> {
        let handle = self
            .sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| WalError::NotFound(session_id.to_string()))?;

        let mut guard = handle.lock().await;
        let state = &mut *guard;
        if state.closing {
            return Err(WalError::NotFound(session_id.to_string()));
        }

        let (used, truncated, cap) = if event_type.is_input() {
            (
                &mut state.input_bytes,
                &mut state.input_truncated,
                self.settings.max_input_bytes,
            )
        } else {
            (
                &mut state.output_bytes,
                &mut state.output_truncated,
                self.settings.max_output_bytes,
            )
        };
        if *truncated {
            return Ok(AppendOutcome::Dropped);
        }

        let room = cap.saturating_sub(*used);
        if data.len() <= room {
            let body = data.to_vec();
            let index =
                with_log(&state.log, move |log| log.append_event(event_type, false, &body)).await?;
            *used += data.len();
            return Ok(AppendOutcome::Written { index });
        }

        let body = data[..room].to_vec();
        let index =
            with_log(&state.log, move |log| log.append_event(event_type, true, &body)).await?;
        *used += room;
        *truncated = true;
        info!(
            "session {} {:?} stream reached {} bytes, truncating",
            session_id, event_type, cap
        );
        Ok(AppendOutcome::Truncated { index, kept: room })
    }

    /// Commit the transcript, write the footer and release the log.
    ///
    /// `session_error` marks a session that ended abnormally; it is carried
    /// into the transcript and makes the footer's status `error`.
    pub async fn close(
        &self,
        session_id: &str,
        session_error: Option<&str>,
    ) -> Result<CloseReport, WalError> {
        let handle = self
            .sessions
            .lock()
            .await
            .remove(session_id)
            .ok_or_else(|| WalError::NotFound(session_id.to_string()))?;

        let mut state = handle.lock().await;
        state.closing = true;
        let path = state.path.clone();

        let result = self.commit(&mut state, session_error).await;

        // release the handle whatever happened above
        let has_footer = lock_log(&state.log).has_footer();
        drop(state);
        drop(handle);

        let committed = matches!(&result, Ok(r) if r.footer.commit_status == CommitStatus::Ok);
        if committed && !self.settings.retain_committed {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("failed removing wal {}: {}", path.display(), e);
            }
        } else if !has_footer {
            error!("session {} wal left without footer at {}", session_id, path.display());
        }

        result.map(|mut report| {
            if !committed || self.settings.retain_committed {
                report.retained_path = Some(path);
            }
            report
        })
    }

    async fn commit(
        &self,
        state: &mut SessionWal,
        session_error: Option<&str>,
    ) -> Result<CloseReport, WalError> {
        let path = state.path.clone();
        let contents = match blocking(move || read_contents(&path)).await {
            Ok(c) if c.header.session_id == state.header.session_id => c,
            Ok(c) => {
                let err = WalError::InvalidHeader(format!(
                    "header session {} does not match {}",
                    c.header.session_id, state.header.session_id
                ));
                write_failed_footer(state, &err).await;
                return Err(err);
            }
            Err(e) => {
                write_failed_footer(state, &e).await;
                return Err(e);
            }
        };

        let end_date = Utc::now();
        let transcript =
            SessionTranscript::build(&contents.header, &contents.events, end_date, session_error);
        let write_result = self.writer.write(&transcript).await;

        let mut errors = Vec::new();
        if let Some(e) = session_error {
            errors.push(e.to_string());
        }
        if let Err(e) = &write_result {
            errors.push(format!("{e:#}"));
        }
        let (status, commit_error) = if errors.is_empty() {
            (CommitStatus::Ok, None)
        } else {
            (CommitStatus::Error, Some(errors.join("; ")))
        };

        let footer = contents.header.footer(status, commit_error, end_date);
        with_log(&state.log, {
            let footer = footer.clone();
            move |log| log.write_footer(&footer)
        })
        .await?;

        if let Err(e) = write_result {
            error!(
                "session {} transcript commit failed: {:#}",
                contents.header.session_id, e
            );
            return Err(WalError::Commit(format!("{e:#}")));
        }

        debug!(
            "session {} wal committed ({} events, {} bytes)",
            contents.header.session_id,
            transcript.event_stream.len(),
            transcript.event_size
        );
        Ok(CloseReport {
            footer,
            event_count: transcript.event_stream.len(),
            event_size: transcript.event_size,
            is_input_truncated: transcript.is_input_truncated,
            is_output_truncated: transcript.is_output_truncated,
            retained_path: None,
        })
    }

    /// Commit logs left without a footer by a previous process
    pub async fn recover_orphans(&self) -> Result<Vec<RecoveredLog>, WalError> {
        let open: Vec<String> = self.open_sessions().await;
        let dir = self.settings.dir.clone();
        let mut recovered = Vec::new();
        for path in blocking(move || list_wal_files(&dir)).await? {
            match self.recover_one(&path, &open).await {
                Ok(Some(r)) => recovered.push(r),
                Ok(None) => {}
                Err(e) => warn!("skipping wal {}: {}", path.display(), e),
            }
        }
        if !recovered.is_empty() {
            info!("recovered {} orphaned session logs", recovered.len());
        }
        Ok(recovered)
    }

    async fn recover_one(
        &self,
        path: &Path,
        open: &[String],
    ) -> Result<Option<RecoveredLog>, WalError> {
        let contents = blocking({
            let path = path.to_path_buf();
            move || read_contents(&path)
        })
        .await?;
        if contents.footer.is_some() || open.contains(&contents.header.session_id) {
            return Ok(None);
        }
        let (log, contents) = blocking({
            let path = path.to_path_buf();
            move || WalLog::open(&path)
        })
        .await?;
        let end_date = Utc::now();
        let transcript = SessionTranscript::build(
            &contents.header,
            &contents.events,
            end_date,
            Some(ORPHAN_COMMIT_ERROR),
        );
        let write_result = self.writer.write(&transcript).await;
        let commit_error = match &write_result {
            Ok(()) => ORPHAN_COMMIT_ERROR.to_string(),
            Err(e) => format!("{ORPHAN_COMMIT_ERROR}; {e:#}"),
        };
        let footer = contents
            .header
            .footer(CommitStatus::Error, Some(commit_error), end_date);
        with_log(&Arc::new(StdMutex::new(log)), move |log| log.write_footer(&footer)).await?;
        info!(
            "session {} orphaned wal committed (stored={})",
            contents.header.session_id,
            write_result.is_ok()
        );
        Ok(Some(RecoveredLog {
            path: path.to_path_buf(),
            session_id: contents.header.session_id,
            committed: write_result.is_ok(),
        }))
    }
}

/// Footer a log whose transcript could not be read back
async fn write_failed_footer(state: &SessionWal, cause: &WalError) {
    let footer = state
        .header
        .footer(CommitStatus::Error, Some(cause.to_string()), Utc::now());
    if let Err(e) = with_log(&state.log, move |log| log.write_footer(&footer)).await {
        error!(
            "session {} failed writing error footer: {}",
            state.header.session_id, e
        );
    }
}

/// All `.wal` files in the per-org directories under `dir`, sorted by path
pub fn list_wal_files(dir: &Path) -> Result<Vec<PathBuf>, WalError> {
    let orgs = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    for org in orgs {
        let org = org?.path();
        if !org.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&org)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == WAL_EXTENSION) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingWriter {
        fail: bool,
        calls: StdMutex<Vec<SessionTranscript>>,
    }

    #[async_trait]
    impl StorageWriter for RecordingWriter {
        async fn write(&self, transcript: &SessionTranscript) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(transcript.clone());
            if self.fail {
                return Err(anyhow!("database unavailable"));
            }
            Ok(())
        }
    }

    fn header(sid: &str) -> WalHeader {
        WalHeader {
            org_id: "org".into(),
            session_id: sid.into(),
            user_id: "u1".into(),
            user_name: String::new(),
            user_email: String::new(),
            connection_name: "pg-prod".into(),
            connection_type: "postgres".into(),
            verb: "connect".into(),
            commit_status: CommitStatus::Open,
            commit_error: None,
            start_date: Utc::now(),
            end_date: None,
        }
    }

    fn store(dir: &TempDir, writer: Arc<RecordingWriter>, retain: bool) -> WalStore {
        WalStore::new(
            WalSettings {
                dir: dir.path().to_path_buf(),
                max_input_bytes: 1024,
                max_output_bytes: 2048,
                retain_committed: retain,
            },
            writer,
        )
    }

    #[tokio::test]
    async fn test_append_before_open_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, Arc::new(RecordingWriter::default()), false);
        assert!(matches!(
            store.append("nope", EventType::Input, b"x").await,
            Err(WalError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_close_writes_once_and_footer() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(RecordingWriter::default());
        let store = store(&dir, writer.clone(), true);
        store.open(header("s1")).await.unwrap();
        store.append("s1", EventType::Input, b"select 1;").await.unwrap();
        store.append("s1", EventType::Output, b"1").await.unwrap();

        let report = store.close("s1", None).await.unwrap();
        assert_eq!(report.footer.commit_status, CommitStatus::Ok);
        assert_eq!(report.event_count, 2);

        let calls = writer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].event_stream[0].data, b"select 1;");

        let contents = read_contents(report.retained_path.as_deref().unwrap()).unwrap();
        assert_eq!(contents.footer.unwrap().commit_status, CommitStatus::Ok);
    }

    #[tokio::test]
    async fn test_append_after_close_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, Arc::new(RecordingWriter::default()), false);
        store.open(header("s1")).await.unwrap();
        store.close("s1", None).await.unwrap();
        assert!(matches!(
            store.append("s1", EventType::Input, b"x").await,
            Err(WalError::NotFound(_))
        ));
        assert!(matches!(
            store.close("s1", None).await,
            Err(WalError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_committed_log_removed_by_default() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, Arc::new(RecordingWriter::default()), false);
        let path = store.open(header("s1")).await.unwrap();
        let report = store.close("s1", None).await.unwrap();
        assert!(report.retained_path.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_writer_failure_still_writes_footer() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(RecordingWriter {
            fail: true,
            ..Default::default()
        });
        let store = store(&dir, writer.clone(), false);
        let path = store.open(header("s1")).await.unwrap();
        store.append("s1", EventType::Output, b"data").await.unwrap();

        let err = store.close("s1", None).await.unwrap_err();
        assert!(matches!(err, WalError::Commit(_)));
        assert_eq!(writer.calls.lock().unwrap().len(), 1);

        let footer = read_contents(&path).unwrap().footer.unwrap();
        assert_eq!(footer.commit_status, CommitStatus::Error);
        assert!(footer.commit_error.unwrap().contains("database unavailable"));
        assert!(!store.is_open("s1").await);
    }

    #[tokio::test]
    async fn test_session_error_marks_footer() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(RecordingWriter::default());
        let store = store(&dir, writer.clone(), false);
        let path = store.open(header("s1")).await.unwrap();
        let report = store.close("s1", Some("connection reset")).await.unwrap();
        assert_eq!(report.footer.commit_status, CommitStatus::Error);
        assert!(path.exists());
        assert_eq!(
            writer.calls.lock().unwrap()[0].session_error.as_deref(),
            Some("connection reset")
        );
    }

    #[tokio::test]
    async fn test_truncation_per_direction() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, Arc::new(RecordingWriter::default()), true);
        store.open(header("s1")).await.unwrap();

        for _ in 0..3 {
            store.append("s1", EventType::Input, &[b'i'; 100]).await.unwrap();
        }
        let mut outcomes = Vec::new();
        for _ in 0..5 {
            outcomes.push(store.append("s1", EventType::Output, &[b'o'; 500]).await.unwrap());
        }
        assert!(matches!(outcomes[3], AppendOutcome::Written { .. }));
        assert_eq!(
            outcomes[4],
            AppendOutcome::Truncated { index: 9, kept: 48 }
        );
        assert_eq!(
            store.append("s1", EventType::Error, b"late").await.unwrap(),
            AppendOutcome::Dropped
        );
        // input is unaffected
        assert!(matches!(
            store.append("s1", EventType::Input, b"more").await.unwrap(),
            AppendOutcome::Written { .. }
        ));

        let report = store.close("s1", None).await.unwrap();
        assert!(report.is_output_truncated);
        assert!(!report.is_input_truncated);
        assert_eq!(report.event_size, 300 + 2048 + 4);
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_index_order() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store(&dir, Arc::new(RecordingWriter::default()), true));
        store.open(header("s1")).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.append("s1", EventType::Input, &[i]).await.unwrap()
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        let report = store.close("s1", None).await.unwrap();
        let contents = read_contents(report.retained_path.as_deref().unwrap()).unwrap();
        let indexes: Vec<u64> = contents.events.iter().map(|e| e.index).collect();
        assert_eq!(indexes, (2..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_recover_orphans() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(RecordingWriter::default());
        let orphan = dir.path().join("org").join("crashed.wal");
        {
            let mut log = WalLog::create_with_header(&orphan, &header("crashed")).unwrap();
            log.append_event(EventType::Input, false, b"rm -rf /tmp/x").unwrap();
        }

        let store = store(&dir, writer.clone(), false);
        store.open(header("live")).await.unwrap();

        let recovered = store.recover_orphans().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].session_id, "crashed");
        assert!(recovered[0].committed);

        let footer = read_contents(&orphan).unwrap().footer.unwrap();
        assert_eq!(footer.commit_status, CommitStatus::Error);
        assert_eq!(footer.commit_error.as_deref(), Some(ORPHAN_COMMIT_ERROR));
        assert_eq!(writer.calls.lock().unwrap().len(), 1);

        // second pass finds nothing new
        assert!(store.recover_orphans().await.unwrap().is_empty());
        assert!(store.is_open("live").await);
    }

    #[tokio::test]
    async fn test_unreadable_log_gets_error_footer() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(RecordingWriter::default());
        let store = store(&dir, writer.clone(), false);
        let h = header("s1");
        let path = store.open(h.clone()).await.unwrap();

        // another process replaces the log under the open handle
        let mut other = h.clone();
        other.session_id = "s2".into();
        WalLog::create_with_header(&path, &other).unwrap();

        let err = store.close("s1", None).await.unwrap_err();
        assert!(matches!(err, WalError::InvalidHeader(_)));
        assert!(writer.calls.lock().unwrap().is_empty());
        assert!(!store.is_open("s1").await);

        let footer = read_contents(&path).unwrap().footer.unwrap();
        assert_eq!(footer.commit_status, CommitStatus::Error);
        assert_eq!(footer.session_id, "s1");
        assert!(footer.commit_error.unwrap().contains("does not match"));
    }

    #[tokio::test]
    async fn test_path_per_org_directory() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, Arc::new(RecordingWriter::default()), false);
        assert_eq!(
            store.path_for("acme", "s1"),
            dir.path().join("acme").join("s1.wal")
        );
        assert_ne!(store.path_for("a-b", "c"), store.path_for("a", "b-c"));
        assert_ne!(store.path_for("a/b", "c"), store.path_for("a_b", "c"));
    }

    #[tokio::test]
    async fn test_same_session_id_in_two_orgs() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(RecordingWriter::default());
        let store = store(&dir, writer.clone(), true);
        let mut first = header("a");
        first.org_id = "x-y".into();
        let mut second = header("y-a");
        second.org_id = "x".into();
        let p1 = store.open(first).await.unwrap();
        let p2 = store.open(second).await.unwrap();
        assert_ne!(p1, p2);
        store.append("a", EventType::Input, b"one").await.unwrap();
        store.append("y-a", EventType::Input, b"two").await.unwrap();
        store.close("a", None).await.unwrap();
        store.close("y-a", None).await.unwrap();

        assert_eq!(read_contents(&p1).unwrap().events[0].data, b"one");
        assert_eq!(read_contents(&p2).unwrap().events[0].data, b"two");
        assert_eq!(list_wal_files(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("a/b"), "a.2fb");
        assert_eq!(sanitize_component(".."), ".2e.2e");
        assert_eq!(sanitize_component("org_1-x"), "org_1-x");
        assert_eq!(sanitize_component(""), "_");
    }
}
