//! Job queue types
//!
//! The job set is closed; every job carries a typed payload. Processors are
//! idempotent by contract: at-least-once delivery means any job can run twice
//! against the same state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DocumentId, JobId};

/// The closed set of job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Embed,
    Enrich,
    DedupCheck,
    ReEmbed,
    Freshness,
    Scrape,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobKind::Embed => "embed",
            JobKind::Enrich => "enrich",
            JobKind::DedupCheck => "dedup-check",
            JobKind::ReEmbed => "re-embed",
            JobKind::Freshness => "freshness",
            JobKind::Scrape => "scrape",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embed" => Ok(JobKind::Embed),
            "enrich" => Ok(JobKind::Enrich),
            "dedup-check" => Ok(JobKind::DedupCheck),
            "re-embed" => Ok(JobKind::ReEmbed),
            "freshness" => Ok(JobKind::Freshness),
            "scrape" => Ok(JobKind::Scrape),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// Typed payload, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum JobPayload {
    Embed {
        document_id: DocumentId,
        model_id: Option<String>,
    },
    Enrich {
        document_id: DocumentId,
    },
    DedupCheck {
        document_id: DocumentId,
        model_id: String,
    },
    ReEmbed {
        document_id: DocumentId,
        model_id: String,
    },
    Freshness {
        document_id: DocumentId,
    },
    Scrape {
        url: String,
        title: Option<String>,
    },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Embed { .. } => JobKind::Embed,
            JobPayload::Enrich { .. } => JobKind::Enrich,
            JobPayload::DedupCheck { .. } => JobKind::DedupCheck,
            JobPayload::ReEmbed { .. } => JobKind::ReEmbed,
            JobPayload::Freshness { .. } => JobKind::Freshness,
            JobPayload::Scrape { .. } => JobKind::Scrape,
        }
    }

    /// The document this job touches, when any. Embed-family jobs on the
    /// same document serialize on this key.
    pub fn document_id(&self) -> Option<DocumentId> {
        match self {
            JobPayload::Embed { document_id, .. }
            | JobPayload::Enrich { document_id }
            | JobPayload::DedupCheck { document_id, .. }
            | JobPayload::ReEmbed { document_id, .. }
            | JobPayload::Freshness { document_id } => Some(*document_id),
            JobPayload::Scrape { .. } => None,
        }
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
    Delayed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "delayed" => Ok(JobState::Delayed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A durable job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub delay_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(payload: JobPayload, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            payload,
            attempts: 0,
            max_attempts,
            state: JobState::Queued,
            delay_until: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn delayed(payload: JobPayload, max_attempts: u32, until: DateTime<Utc>) -> Self {
        let mut job = Self::new(payload, max_attempts);
        job.state = JobState::Delayed;
        job.delay_until = Some(until);
        job
    }
}
