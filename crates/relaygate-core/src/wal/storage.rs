//! Session transcripts and the storage writers that persist them

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::log::{EventType, WalEvent, WalHeader};

/// One event of a reconstructed transcript; `data` is stored as base64
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    /// Seconds since session start
    pub elapsed: f64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub data: Vec<u8>,
}

/// Full session payload handed to a [`StorageWriter`] at close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTranscript {
    pub org_id: String,
    pub session_id: String,
    pub user_id: String,
    pub user_name: String,
    pub user_email: String,
    pub connection_name: String,
    pub connection_type: String,
    pub verb: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub event_stream: Vec<TranscriptEvent>,
    pub event_size: u64,
    pub is_input_truncated: bool,
    pub is_output_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_error: Option<String>,
}

impl SessionTranscript {
    pub fn build(
        header: &WalHeader,
        events: &[WalEvent],
        end_date: DateTime<Utc>,
        session_error: Option<&str>,
    ) -> Self {
        let mut event_size = 0u64;
        let mut is_input_truncated = false;
        let mut is_output_truncated = false;
        let event_stream = events
            .iter()
            .map(|ev| {
                event_size += ev.data.len() as u64;
                if ev.truncated {
                    if ev.event_type.is_input() {
                        is_input_truncated = true;
                    } else {
                        is_output_truncated = true;
                    }
                }
                let elapsed = (ev.time - header.start_date).num_microseconds().unwrap_or(0);
                TranscriptEvent {
                    elapsed: elapsed.max(0) as f64 / 1_000_000.0,
                    event_type: ev.event_type,
                    data: ev.data.clone(),
                }
            })
            .collect();

        Self {
            org_id: header.org_id.clone(),
            session_id: header.session_id.clone(),
            user_id: header.user_id.clone(),
            user_name: header.user_name.clone(),
            user_email: header.user_email.clone(),
            connection_name: header.connection_name.clone(),
            connection_type: header.connection_type.clone(),
            verb: header.verb.clone(),
            start_date: header.start_date,
            end_date,
            event_stream,
            event_size,
            is_input_truncated,
            is_output_truncated,
            session_error: session_error.map(str::to_string),
        }
    }

    /// Input and output text, each direction's events concatenated.
    /// Stderr counts as output.
    pub fn direction_text(&self) -> (String, String) {
        let mut input = Vec::new();
        let mut output = Vec::new();
        for ev in &self.event_stream {
            if ev.event_type.is_input() {
                input.extend_from_slice(&ev.data);
            } else {
                output.extend_from_slice(&ev.data);
            }
        }
        (
            String::from_utf8_lossy(&input).into_owned(),
            String::from_utf8_lossy(&output).into_owned(),
        )
    }

    /// Total bytes recorded for one direction
    pub fn direction_size(&self, input: bool) -> usize {
        self.event_stream
            .iter()
            .filter(|e| e.event_type.is_input() == input)
            .map(|e| e.data.len())
            .sum()
    }
}

/// Downstream persistence of a closed session, invoked once per session
#[async_trait]
pub trait StorageWriter: Send + Sync {
    async fn write(&self, transcript: &SessionTranscript) -> Result<()>;
}

/// Writes every transcript to `<dir>/<org>/<session>.json`
pub struct JsonFileStorageWriter {
    dir: PathBuf,
}

impl JsonFileStorageWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn transcript_path(&self, org_id: &str, session_id: &str) -> PathBuf {
        self.dir
            .join(super::sanitize_component(org_id))
            .join(format!("{}.json", super::sanitize_component(session_id)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl StorageWriter for JsonFileStorageWriter {
    async fn write(&self, transcript: &SessionTranscript) -> Result<()> {
        let path = self.transcript_path(&transcript.org_id, &transcript.session_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let body = serde_json::to_vec_pretty(transcript).context("encoding transcript")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming into {}", path.display()))?;
        debug!(
            "session {} transcript stored at {}",
            transcript.session_id,
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::log::CommitStatus;
    use chrono::Duration;
    use tempfile::TempDir;

    fn header() -> WalHeader {
        WalHeader {
            org_id: "org".into(),
            session_id: "s1".into(),
            user_id: "u".into(),
            user_name: String::new(),
            user_email: String::new(),
            connection_name: "bash".into(),
            connection_type: "command-line".into(),
            verb: "exec".into(),
            commit_status: CommitStatus::Open,
            commit_error: None,
            start_date: Utc::now(),
            end_date: None,
        }
    }

    fn event(h: &WalHeader, index: u64, ty: EventType, data: &[u8], truncated: bool) -> WalEvent {
        WalEvent {
            index,
            time: h.start_date + Duration::milliseconds(1500),
            event_type: ty,
            truncated,
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_build_transcript() {
        let h = header();
        let events = vec![
            event(&h, 2, EventType::Input, b"whoami", false),
            event(&h, 3, EventType::Output, b"root", false),
            event(&h, 4, EventType::Error, b"warn", true),
        ];
        let t = SessionTranscript::build(&h, &events, Utc::now(), None);
        assert_eq!(t.event_stream.len(), 3);
        assert_eq!(t.event_size, 14);
        assert!(!t.is_input_truncated);
        assert!(t.is_output_truncated);
        assert!((t.event_stream[0].elapsed - 1.5).abs() < 1e-6);
        assert_eq!(t.direction_size(true), 6);
        assert_eq!(t.direction_size(false), 8);
    }

    #[test]
    fn test_transcript_json_shape() {
        let h = header();
        let events = vec![event(&h, 2, EventType::Output, b"hi", false)];
        let t = SessionTranscript::build(&h, &events, Utc::now(), Some("eof"));
        let v = serde_json::to_value(&t).unwrap();
        assert_eq!(v["event_stream"][0]["type"], "o");
        assert_eq!(v["event_stream"][0]["data"], "aGk=");
        assert_eq!(v["session_error"], "eof");
        assert_eq!(v["is_input_truncated"], false);
    }

    #[test]
    fn test_binary_event_data_survives_json() {
        let h = header();
        let raw = [0x44u8, 0xff, 0xfe, 0x00, 0x01];
        let events = vec![event(&h, 2, EventType::Output, &raw, false)];
        let t = SessionTranscript::build(&h, &events, Utc::now(), None);
        let json = serde_json::to_string(&t).unwrap();
        let back: SessionTranscript = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_stream[0].data, raw);
        assert_eq!(back, t);
    }

    #[test]
    fn test_direction_text() {
        let h = header();
        let events = vec![
            event(&h, 2, EventType::Input, b"select ", false),
            event(&h, 3, EventType::Output, b"ok", false),
            event(&h, 4, EventType::Input, b"1;", false),
            event(&h, 5, EventType::Error, b"!", false),
        ];
        let t = SessionTranscript::build(&h, &events, Utc::now(), None);
        assert_eq!(t.direction_text(), ("select 1;".to_string(), "ok!".to_string()));
    }

    #[tokio::test]
    async fn test_json_file_writer() {
        let dir = TempDir::new().unwrap();
        let writer = JsonFileStorageWriter::new(dir.path());
        let h = header();
        let t = SessionTranscript::build(&h, &[], Utc::now(), None);
        writer.write(&t).await.unwrap();

        let path = writer.transcript_path("org", "s1");
        let raw = std::fs::read_to_string(path).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["session_id"], "s1");
        assert_eq!(v["connection_type"], "command-line");
    }

    #[test]
    fn test_transcript_path_sanitized() {
        let writer = JsonFileStorageWriter::new("/data");
        let p = writer.transcript_path("../org", "a/b");
        assert!(p.starts_with("/data"));
        assert!(!p.to_string_lossy().contains(".."));
    }
}
