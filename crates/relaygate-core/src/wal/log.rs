//! A single session's write-ahead log file

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use super::WalError;
use super::record::{ReadNext, RecordKind, RecordReader, encode_record};

pub const HEADER_INDEX: u64 = 1;
pub const FIRST_EVENT_INDEX: u64 = 2;

/// Outcome of committing the transcript to storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitStatus {
    #[default]
    Open,
    Ok,
    Error,
}

/// Header (record 1) and footer (last record) of a session log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalHeader {
    pub org_id: String,
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_email: String,
    pub connection_name: String,
    pub connection_type: String,
    #[serde(default)]
    pub verb: String,
    #[serde(default)]
    pub commit_status: CommitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_error: Option<String>,
    pub start_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
}

impl WalHeader {
    pub fn validate(&self) -> Result<(), WalError> {
        let required = [
            ("org_id", &self.org_id),
            ("session_id", &self.session_id),
            ("connection_name", &self.connection_name),
            ("connection_type", &self.connection_type),
        ];
        for (name, value) in required {
            if value.is_empty() {
                return Err(WalError::InvalidHeader(format!("missing {name}")));
            }
        }
        Ok(())
    }

    /// Footer derived from this header
    pub fn footer(
        &self,
        status: CommitStatus,
        commit_error: Option<String>,
        end_date: DateTime<Utc>,
    ) -> Self {
        Self {
            commit_status: status,
            commit_error,
            end_date: Some(end_date),
            ..self.clone()
        }
    }
}

/// Kind of transcript event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "i")]
    Input,
    #[serde(rename = "o")]
    Output,
    #[serde(rename = "e")]
    Error,
}

impl EventType {
    pub fn as_byte(self) -> u8 {
        match self {
            EventType::Input => b'i',
            EventType::Output => b'o',
            EventType::Error => b'e',
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'i' => Some(EventType::Input),
            b'o' => Some(EventType::Output),
            b'e' => Some(EventType::Error),
            _ => None,
        }
    }

    /// Stderr counts toward the output direction
    pub fn is_input(self) -> bool {
        matches!(self, EventType::Input)
    }
}

const EVENT_FLAG_TRUNCATED: u8 = 0x01;
const EVENT_PREFIX_LEN: usize = 8 + 1 + 1;

/// One recorded event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEvent {
    pub index: u64,
    pub time: DateTime<Utc>,
    pub event_type: EventType,
    /// Set on the event at which its direction hit the size cap
    pub truncated: bool,
    pub data: Vec<u8>,
}

impl WalEvent {
    fn encode_body(time: DateTime<Utc>, event_type: EventType, truncated: bool, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(EVENT_PREFIX_LEN + data.len());
        body.extend_from_slice(&time.timestamp_micros().to_le_bytes());
        body.push(event_type.as_byte());
        body.push(if truncated { EVENT_FLAG_TRUNCATED } else { 0 });
        body.extend_from_slice(data);
        body
    }

    fn decode(index: u64, body: Vec<u8>) -> Result<Self, WalError> {
        if body.len() < EVENT_PREFIX_LEN {
            return Err(WalError::Corrupted {
                reason: format!("event {index} shorter than its prefix"),
            });
        }
        let mut micros = [0u8; 8];
        micros.copy_from_slice(&body[..8]);
        let time = DateTime::from_timestamp_micros(i64::from_le_bytes(micros)).ok_or_else(|| {
            WalError::Corrupted {
                reason: format!("event {index} has an out of range timestamp"),
            }
        })?;
        let event_type = EventType::from_byte(body[8]).ok_or_else(|| WalError::Corrupted {
            reason: format!("event {index} has unknown type {:#x}", body[8]),
        })?;
        let truncated = body[9] & EVENT_FLAG_TRUNCATED != 0;
        Ok(Self {
            index,
            time,
            event_type,
            truncated,
            data: body[EVENT_PREFIX_LEN..].to_vec(),
        })
    }
}

/// Everything stored in a log file
#[derive(Debug, Clone)]
pub struct WalContents {
    pub header: WalHeader,
    pub events: Vec<WalEvent>,
    pub footer: Option<WalHeader>,
    /// The file ended inside a partially written record
    pub torn_tail: bool,
    /// Byte length of the valid prefix of the file
    pub valid_len: u64,
}

impl WalContents {
    pub fn last_index(&self) -> u64 {
        if self.footer.is_some() {
            return self.events.last().map_or(HEADER_INDEX, |e| e.index) + 1;
        }
        self.events.last().map_or(HEADER_INDEX, |e| e.index)
    }
}

/// Read and verify a whole log file
pub fn read_contents(path: &Path) -> Result<WalContents, WalError> {
    let file = File::open(path)?;
    let mut reader = RecordReader::new(BufReader::new(file));

    let header_record = match reader.read_next()? {
        ReadNext::Record(r) if r.index == HEADER_INDEX && r.kind == RecordKind::Header => r,
        _ => return Err(WalError::ExpectHeader),
    };
    let header: WalHeader = serde_json::from_slice(&header_record.body)
        .map_err(|e| WalError::InvalidHeader(e.to_string()))?;
    header.validate()?;

    let mut valid_len = record_len(&header_record.body);
    let mut events = Vec::new();
    let mut footer = None;
    let mut torn_tail = false;
    let mut expected = FIRST_EVENT_INDEX;

    loop {
        let record = match reader.read_next()? {
            ReadNext::Record(r) => r,
            ReadNext::End => break,
            ReadNext::TornTail => {
                torn_tail = true;
                break;
            }
        };
        if footer.is_some() {
            return Err(WalError::Corrupted {
                reason: format!("record {} found after footer", record.index),
            });
        }
        if record.index != expected {
            return Err(WalError::Corrupted {
                reason: format!("expected index {expected}, found {}", record.index),
            });
        }
        valid_len += record_len(&record.body);
        match record.kind {
            RecordKind::Event => events.push(WalEvent::decode(record.index, record.body)?),
            RecordKind::Footer => {
                let f: WalHeader = serde_json::from_slice(&record.body)?;
                footer = Some(f);
            }
            RecordKind::Header => return Err(WalError::HeaderAlreadyWritten),
        }
        expected += 1;
    }

    Ok(WalContents {
        header,
        events,
        footer,
        torn_tail,
        valid_len,
    })
}

fn record_len(body: &[u8]) -> u64 {
    (super::record::RECORD_HEADER_LEN + body.len()) as u64
}

/// Append-only handle on one session log
#[derive(Debug)]
pub struct WalLog {
    path: PathBuf,
    file: File,
    write_index: u64,
    footer_written: bool,
}

impl WalLog {
    /// Create (or truncate) an empty log; the header must be written next
    pub fn create(path: &Path) -> Result<Self, WalError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            write_index: HEADER_INDEX,
            footer_written: false,
        })
    }

    pub fn create_with_header(path: &Path, header: &WalHeader) -> Result<Self, WalError> {
        let mut log = Self::create(path)?;
        log.write_header(header)?;
        Ok(log)
    }

    /// Reopen an existing log for appending, dropping a torn tail if present
    pub fn open(path: &Path) -> Result<(Self, WalContents), WalError> {
        let contents = read_contents(path)?;
        let file = OpenOptions::new().append(true).open(path)?;
        if contents.torn_tail {
            file.set_len(contents.valid_len)?;
        }
        let log = Self {
            path: path.to_path_buf(),
            file,
            write_index: contents.last_index() + 1,
            footer_written: contents.footer.is_some(),
        };
        Ok((log, contents))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_index(&self) -> u64 {
        self.write_index
    }

    pub fn write_header(&mut self, header: &WalHeader) -> Result<(), WalError> {
        if self.write_index > HEADER_INDEX {
            return Err(WalError::HeaderAlreadyWritten);
        }
        header.validate()?;
        let body = serde_json::to_vec(header)?;
        self.write_record(RecordKind::Header, &body)?;
        Ok(())
    }

    pub fn append_event(
        &mut self,
        event_type: EventType,
        truncated: bool,
        data: &[u8],
    ) -> Result<u64, WalError> {
        self.check_writable()?;
        let body = WalEvent::encode_body(Utc::now(), event_type, truncated, data);
        self.write_record(RecordKind::Event, &body)
    }

    pub fn write_footer(&mut self, footer: &WalHeader) -> Result<u64, WalError> {
        self.check_writable()?;
        let body = serde_json::to_vec(footer)?;
        let index = self.write_record(RecordKind::Footer, &body)?;
        self.footer_written = true;
        Ok(index)
    }

    pub fn has_footer(&self) -> bool {
        self.footer_written
    }

    fn check_writable(&self) -> Result<(), WalError> {
        if self.write_index == HEADER_INDEX {
            return Err(WalError::ExpectHeader);
        }
        if self.footer_written {
            return Err(WalError::FooterAlreadyWritten);
        }
        Ok(())
    }

    fn write_record(&mut self, kind: RecordKind, body: &[u8]) -> Result<u64, WalError> {
        let index = self.write_index;
        let frame = encode_record(index, kind, body)?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        self.write_index += 1;
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn header(sid: &str) -> WalHeader {
        WalHeader {
            org_id: "org".into(),
            session_id: sid.into(),
            user_id: "u1".into(),
            user_name: "Ada".into(),
            user_email: "ada@example.com".into(),
            connection_name: "pg-prod".into(),
            connection_type: "postgres".into(),
            verb: "connect".into(),
            commit_status: CommitStatus::Open,
            commit_error: None,
            start_date: Utc::now(),
            end_date: None,
        }
    }

    #[test]
    fn test_header_is_record_one() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.wal");
        let mut log = WalLog::create_with_header(&path, &header("s1")).unwrap();
        assert_eq!(log.append_event(EventType::Input, false, b"ls").unwrap(), 2);
        assert_eq!(log.append_event(EventType::Output, false, b"a b").unwrap(), 3);

        let contents = read_contents(&path).unwrap();
        assert_eq!(contents.header.session_id, "s1");
        assert_eq!(contents.events.len(), 2);
        assert_eq!(contents.events[0].event_type, EventType::Input);
        assert_eq!(contents.events[1].data, b"a b");
        assert!(contents.footer.is_none());
    }

    #[test]
    fn test_event_before_header_rejected() {
        let dir = TempDir::new().unwrap();
        let mut log = WalLog::create(&dir.path().join("s.wal")).unwrap();
        assert!(matches!(
            log.append_event(EventType::Input, false, b"x"),
            Err(WalError::ExpectHeader)
        ));
    }

    #[test]
    fn test_header_written_once() {
        let dir = TempDir::new().unwrap();
        let mut log = WalLog::create_with_header(&dir.path().join("s.wal"), &header("s1")).unwrap();
        assert!(matches!(
            log.write_header(&header("s1")),
            Err(WalError::HeaderAlreadyWritten)
        ));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let dir = TempDir::new().unwrap();
        let mut h = header("s1");
        h.session_id.clear();
        assert!(matches!(
            WalLog::create_with_header(&dir.path().join("s.wal"), &h),
            Err(WalError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_footer_closes_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.wal");
        let h = header("s1");
        let mut log = WalLog::create_with_header(&path, &h).unwrap();
        log.append_event(EventType::Input, false, b"q").unwrap();
        log.write_footer(&h.footer(CommitStatus::Ok, None, Utc::now()))
            .unwrap();
        assert!(matches!(
            log.append_event(EventType::Input, false, b"late"),
            Err(WalError::FooterAlreadyWritten)
        ));

        let contents = read_contents(&path).unwrap();
        let footer = contents.footer.unwrap();
        assert_eq!(footer.commit_status, CommitStatus::Ok);
        assert!(footer.end_date.is_some());
    }

    #[test]
    fn test_reopen_drops_torn_tail_and_continues() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.wal");
        {
            let mut log = WalLog::create_with_header(&path, &header("s1")).unwrap();
            log.append_event(EventType::Output, false, b"complete").unwrap();
        }
        // simulate a crash mid-record
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[9, 0, 0, 0, 1, 2]).unwrap();
        drop(f);

        let (mut log, contents) = WalLog::open(&path).unwrap();
        assert!(contents.torn_tail);
        assert_eq!(log.next_index(), 3);
        log.append_event(EventType::Output, false, b"after").unwrap();

        let contents = read_contents(&path).unwrap();
        assert!(!contents.torn_tail);
        assert_eq!(contents.events.len(), 2);
        assert_eq!(contents.events[1].data, b"after");
    }

    #[test]
    fn test_truncated_flag_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.wal");
        let mut log = WalLog::create_with_header(&path, &header("s1")).unwrap();
        log.append_event(EventType::Output, true, b"part").unwrap();
        let contents = read_contents(&path).unwrap();
        assert!(contents.events[0].truncated);
    }

    #[test]
    fn test_event_type_json() {
        assert_eq!(serde_json::to_string(&EventType::Output).unwrap(), "\"o\"");
        assert_eq!(
            serde_json::to_string(&CommitStatus::Error).unwrap(),
            "\"error\""
        );
    }
}
