//! Review — sessions wait for approval by a reviewer group before opening
//!
//! A one-time review gates a single session. A just-in-time (jit) review is
//! requested with a `jit.timeout` duration; once approved it grants the user
//! time-boxed access to the connection, enforced through the session lifetime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::context::SessionContext;
use crate::packet::{Packet, spec, types};
use crate::plugin::{Plugin, PluginError, PluginResponse};

/// Longest jit access granted when the request does not say otherwise
pub const MAX_JIT_DURATION: Duration = Duration::from_secs(48 * 3600);

pub const DENIED_MESSAGE: &str = "access to connection has been denied";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    Processing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewType {
    OneTime,
    Jit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewGroup {
    pub group: String,
    pub status: ReviewStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Review {
    pub id: String,
    pub org_id: String,
    pub session_id: String,
    pub user_id: String,
    pub user_email: String,
    pub connection_id: String,
    pub connection_name: String,
    pub review_type: ReviewType,
    #[serde(with = "duration_secs")]
    pub access_duration: Option<Duration>,
    pub input: String,
    pub status: ReviewStatus,
    pub groups: Vec<ReviewGroup>,
    pub created_at: DateTime<Utc>,
    pub revoke_at: Option<DateTime<Utc>>,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }
}

impl Review {
    /// Jit access still valid at `now`
    pub fn grants_access_at(&self, now: DateTime<Utc>) -> bool {
        self.review_type == ReviewType::Jit
            && matches!(self.status, ReviewStatus::Approved | ReviewStatus::Processing)
            && self.revoke_at.is_some_and(|r| r > now)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReviewError {
    #[error("review not found for {0}")]
    NotFound(String),

    #[error("review {id} is already {status:?}")]
    AlreadyDecided { id: String, status: ReviewStatus },

    #[error("group {0} is not a reviewer")]
    NotReviewer(String),
}

/// In-memory store of reviews
#[derive(Default)]
pub struct ReviewBook {
    reviews: RwLock<HashMap<String, Review>>,
}

impl ReviewBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, review: Review) {
        self.reviews.write().await.insert(review.id.clone(), review);
    }

    pub async fn get(&self, id: &str) -> Option<Review> {
        self.reviews.read().await.get(id).cloned()
    }

    /// Most recent review created for a session
    pub async fn find_by_session(&self, session_id: &str) -> Option<Review> {
        self.reviews
            .read()
            .await
            .values()
            .filter(|r| r.session_id == session_id)
            .max_by_key(|r| r.created_at)
            .cloned()
    }

    /// Most recent review of a session opened by this user on this connection
    pub async fn find_for_session(&self, ctx: &SessionContext) -> Option<Review> {
        self.reviews
            .read()
            .await
            .values()
            .filter(|r| {
                r.session_id == ctx.sid
                    && r.org_id == ctx.org_id
                    && r.user_id == ctx.user_id
                    && r.connection_id == ctx.connection_id
            })
            .max_by_key(|r| r.created_at)
            .cloned()
    }

    /// An approved, unexpired jit review of this user for this connection
    pub async fn find_valid_jit(
        &self,
        org_id: &str,
        user_id: &str,
        connection_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Review> {
        self.reviews
            .read()
            .await
            .values()
            .filter(|r| {
                r.org_id == org_id
                    && r.user_id == user_id
                    && r.connection_id == connection_id
                    && r.grants_access_at(now)
            })
            .max_by_key(|r| r.revoke_at)
            .cloned()
    }

    pub async fn pending(&self) -> Vec<Review> {
        let mut out: Vec<Review> = self
            .reviews
            .read()
            .await
            .values()
            .filter(|r| r.status == ReviewStatus::Pending)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        out
    }

    /// Record a decision on the latest review of `session_id`.
    ///
    /// `group = None` decides for every group. A review is approved once all
    /// of its groups approved; a single rejection rejects it.
    pub async fn decide(
        &self,
        session_id: &str,
        group: Option<&str>,
        decision: ReviewDecision,
    ) -> Result<Review, ReviewError> {
        let id = self
            .find_by_session(session_id)
            .await
            .map(|r| r.id)
            .ok_or_else(|| ReviewError::NotFound(session_id.to_string()))?;

        let mut reviews = self.reviews.write().await;
        let review = reviews
            .get_mut(&id)
            .ok_or_else(|| ReviewError::NotFound(session_id.to_string()))?;
        if review.status != ReviewStatus::Pending {
            return Err(ReviewError::AlreadyDecided {
                id: review.id.clone(),
                status: review.status,
            });
        }

        let new_group_status = match decision {
            ReviewDecision::Approve => ReviewStatus::Approved,
            ReviewDecision::Reject => ReviewStatus::Rejected,
        };
        match group {
            Some(name) => {
                let g = review
                    .groups
                    .iter_mut()
                    .find(|g| g.group == name)
                    .ok_or_else(|| ReviewError::NotReviewer(name.to_string()))?;
                g.status = new_group_status;
            }
            None => {
                for g in review.groups.iter_mut() {
                    g.status = new_group_status;
                }
            }
        }

        if review.groups.iter().any(|g| g.status == ReviewStatus::Rejected) {
            review.status = ReviewStatus::Rejected;
        } else if review.groups.iter().all(|g| g.status == ReviewStatus::Approved) {
            review.status = ReviewStatus::Approved;
            if let Some(d) = review.access_duration {
                review.revoke_at = chrono::Duration::from_std(d).ok().map(|d| Utc::now() + d);
            }
        }
        info!(
            "review {} for session {} is {:?}",
            review.id, review.session_id, review.status
        );
        Ok(review.clone())
    }

    async fn set_status(&self, id: &str, status: ReviewStatus) {
        if let Some(r) = self.reviews.write().await.get_mut(id) {
            r.status = status;
        }
    }
}

/// Parse `90`, `30s`, `15m`, `2h` or a combination such as `1h30m`
pub fn parse_access_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let mut total = 0u64;
    let mut digits = String::new();
    for c in raw.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: u64 = digits.parse().ok()?;
        digits.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            _ => return None,
        };
        total = total.checked_add(n.checked_mul(unit)?)?;
    }
    if !digits.is_empty() {
        return None;
    }
    Some(Duration::from_secs(total))
}

pub struct ReviewPlugin {
    book: std::sync::Arc<ReviewBook>,
    api_url: String,
}

impl ReviewPlugin {
    pub fn new(book: std::sync::Arc<ReviewBook>, api_url: impl Into<String>) -> Self {
        Self {
            book,
            api_url: api_url.into(),
        }
    }

    fn waiting_packet(&self, ctx: &SessionContext, review: &Review) -> Packet {
        Packet::gateway(types::SESSION_OPEN_WAITING_APPROVAL)
            .with_payload(format!(
                "{}/reviews/{}",
                self.api_url.trim_end_matches('/'),
                review.id
            ))
            .with_spec(spec::SESSION_ID, ctx.sid.as_str())
            .with_spec(spec::REVIEW_ID, review.id.as_str())
            .with_spec(spec::HAS_REVIEW, "1")
    }
}

#[async_trait]
impl Plugin for ReviewPlugin {
    fn name(&self) -> &str {
        super::REVIEW
    }

    async fn on_receive(
        &self,
        ctx: &SessionContext,
        pkt: &Packet,
    ) -> Result<Option<PluginResponse>, PluginError> {
        if !pkt.is_type(types::SESSION_OPEN) || !ctx.plugin_enabled() {
            return Ok(None);
        }
        let now = Utc::now();

        if let Some(existing) = self.book.find_for_session(ctx).await {
            match (existing.review_type, existing.status) {
                (_, ReviewStatus::Pending) => {
                    return Ok(Some(PluginResponse::reply(
                        self.waiting_packet(ctx, &existing),
                    )));
                }
                (_, ReviewStatus::Rejected) => {
                    return Err(PluginError::Rejected(DENIED_MESSAGE.to_string()));
                }
                (ReviewType::OneTime, ReviewStatus::Approved) => {
                    self.book
                        .set_status(&existing.id, ReviewStatus::Processing)
                        .await;
                    return Ok(None);
                }
                (ReviewType::OneTime, ReviewStatus::Processing) => return Ok(None),
                (ReviewType::Jit, _) => {}
            }
        }

        if let Some(jit) = self
            .book
            .find_valid_jit(&ctx.org_id, &ctx.user_id, &ctx.connection_id, now)
            .await
        {
            let remaining = jit
                .revoke_at
                .and_then(|r| (r - now).to_std().ok())
                .unwrap_or_default();
            info!(
                "session {} jit access granted by review {} for {:?}",
                ctx.sid, jit.id, remaining
            );
            if jit.status == ReviewStatus::Approved {
                self.book.set_status(&jit.id, ReviewStatus::Processing).await;
            }
            return Ok(Some(PluginResponse::lifetime(
                ctx.lifetime.with_timeout(remaining),
            )));
        }

        let access_duration = match pkt.spec_str(spec::JIT_TIMEOUT) {
            Some(raw) => {
                let d = parse_access_duration(raw).ok_or_else(|| {
                    PluginError::InvalidArgument(format!("invalid access time duration, got={raw}"))
                })?;
                if d > MAX_JIT_DURATION || d.is_zero() {
                    return Err(PluginError::InvalidArgument(
                        "jit access input must be between 1 second and 48 hours".to_string(),
                    ));
                }
                Some(d)
            }
            None => None,
        };

        let groups: Vec<ReviewGroup> = ctx
            .plugin_config
            .as_ref()
            .map(|c| c.config.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|group| ReviewGroup {
                group,
                status: ReviewStatus::Pending,
            })
            .collect();
        if groups.is_empty() {
            return Err(PluginError::Internal(
                "missing approval groups for connection".to_string(),
            ));
        }

        let review = Review {
            id: Uuid::new_v4().to_string(),
            org_id: ctx.org_id.clone(),
            session_id: ctx.sid.clone(),
            user_id: ctx.user_id.clone(),
            user_email: ctx.user_email.clone(),
            connection_id: ctx.connection_id.clone(),
            connection_name: ctx.connection_name.clone(),
            review_type: if access_duration.is_some() {
                ReviewType::Jit
            } else {
                ReviewType::OneTime
            },
            access_duration,
            input: String::from_utf8_lossy(&pkt.payload).into_owned(),
            status: ReviewStatus::Pending,
            groups,
            created_at: now,
            revoke_at: None,
        };
        info!(
            "session {} waiting for review {} ({:?}) by {}",
            ctx.sid,
            review.id,
            review.review_type,
            review
                .groups
                .iter()
                .map(|g| g.group.as_str())
                .collect::<Vec<_>>()
                .join(",")
        );
        let reply = self.waiting_packet(ctx, &review);
        self.book.insert(review).await;
        Ok(Some(PluginResponse::reply(reply)))
    }
}
