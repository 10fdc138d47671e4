//! Built-in pipeline plugins

use crate::packet::{Packet, types};
use crate::wal::EventType;

pub mod access_control;
pub mod audit;
pub mod dlp;
pub mod indexer;
pub mod review;

pub use access_control::AccessControlPlugin;
pub use audit::AuditPlugin;
pub use dlp::DataMaskingPlugin;
pub use indexer::IndexerPlugin;
pub use review::{Review, ReviewBook, ReviewDecision, ReviewPlugin, ReviewStatus, ReviewType};

pub const ACCESS_CONTROL: &str = "access_control";
pub const REVIEW: &str = "review";
pub const AUDIT: &str = "audit";
pub const DLP: &str = "dlp";
pub const INDEXER: &str = "indexer";

/// Every built-in plugin, in the order the gateway registers them
pub const BUILTIN: &[&str] = &[ACCESS_CONTROL, REVIEW, AUDIT, INDEXER, DLP];

/// Transcript event recorded for a relayed packet, if any
pub(crate) fn transcript_event(pkt: &Packet) -> Option<EventType> {
    match pkt.packet_type.as_str() {
        types::WRITE_STDIN => Some(EventType::Input),
        types::SESSION_OPEN if !pkt.payload.is_empty() => Some(EventType::Input),
        types::WRITE_STDOUT => Some(EventType::Output),
        types::WRITE_STDERR => Some(EventType::Error),
        _ => None,
    }
}

/// Group whose members bypass access control
pub const ADMIN_GROUP: &str = "admin";
