use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How an entry is anchored in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeMode {
    Point,
    Range,
    None,
}

impl fmt::Display for TimeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeMode::Point => "POINT",
            TimeMode::Range => "RANGE",
            TimeMode::None => "NONE",
        };
        f.write_str(s)
    }
}

impl FromStr for TimeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "POINT" => Ok(TimeMode::Point),
            "RANGE" => Ok(TimeMode::Range),
            "NONE" => Ok(TimeMode::None),
            other => Err(format!("unknown time mode: {other}")),
        }
    }
}

/// A typed note — the central record of the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub title: String,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub type_id: String,
    pub time_mode: TimeMode,
    pub time_at: Option<DateTime<Utc>>,
    pub time_from: Option<DateTime<Utc>>,
    pub time_to: Option<DateTime<Utc>>,
    pub tags: Vec<Tag>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entry {
    /// Fields whose change should trigger re-indexing. Type/tag/time
    /// churn is deliberately excluded.
    pub fn index_signature(&self) -> (String, Option<String>, Option<String>) {
        (
            self.title.clone(),
            self.summary.clone(),
            self.content.clone(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryType {
    pub id: String,
    pub code: String,
    pub name: String,
    pub color: Option<String>,
    pub icon: Option<String>,
    pub graph_enabled: bool,
    pub ai_enabled: bool,
    pub enabled: bool,
}

impl EntryType {
    /// Entries of this type go into the knowledge graph only when all
    /// three flags are on.
    pub fn indexable(&self) -> bool {
        self.graph_enabled && self.ai_enabled && self.enabled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub color: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationType {
    pub id: String,
    pub code: String,
    pub name: String,
    pub directed: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relation {
    pub id: String,
    pub source_entry_id: String,
    pub target_entry_id: String,
    pub relation_type_id: String,
}

/// Attachment parse lifecycle, visible in the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for ParseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParseStatus::Pending => "pending",
            ParseStatus::Processing => "processing",
            ParseStatus::Completed => "completed",
            ParseStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for ParseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ParseStatus::Pending),
            "processing" => Ok(ParseStatus::Processing),
            "completed" => Ok(ParseStatus::Completed),
            "failed" => Ok(ParseStatus::Failed),
            other => Err(format!("unknown parse status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub entry_id: String,
    pub file_path: String,
    pub original_filename: String,
    pub content_type: String,
    pub size: u64,
    pub parse_status: ParseStatus,
    pub parsed_text: Option<String>,
    pub parse_last_error: Option<String>,
    pub index_to_knowledge_graph: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outbox row lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Succeeded,
    Dead,
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Succeeded => "succeeded",
            OutboxStatus::Dead => "dead",
        };
        f.write_str(s)
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processing" => Ok(OutboxStatus::Processing),
            "succeeded" => Ok(OutboxStatus::Succeeded),
            "dead" => Ok(OutboxStatus::Dead),
            other => Err(format!("unknown outbox status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxOp {
    Upsert,
    Delete,
}

impl fmt::Display for OutboxOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutboxOp::Upsert => "upsert",
            OutboxOp::Delete => "delete",
        };
        f.write_str(s)
    }
}

impl FromStr for OutboxOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upsert" => Ok(OutboxOp::Upsert),
            "delete" => Ok(OutboxOp::Delete),
            other => Err(format!("unknown outbox op: {other}")),
        }
    }
}

/// Durable index intent for an entry.
#[derive(Debug, Clone)]
pub struct EntryIndexOutbox {
    pub id: String,
    pub entry_id: String,
    pub op: OutboxOp,
    pub entry_updated_at: Option<DateTime<Utc>>,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Same lease schema for attachment index and parse intents.
#[derive(Debug, Clone)]
pub struct AttachmentOutbox {
    pub id: String,
    pub attachment_id: String,
    pub entry_id: String,
    pub op: OutboxOp,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub available_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Retrieval mode passed through to the KG engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Naive,
    Local,
    Global,
    Hybrid,
    Mix,
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryMode::Naive => "naive",
            QueryMode::Local => "local",
            QueryMode::Global => "global",
            QueryMode::Hybrid => "hybrid",
            QueryMode::Mix => "mix",
        };
        f.write_str(s)
    }
}

impl FromStr for QueryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "naive" => Ok(QueryMode::Naive),
            "local" => Ok(QueryMode::Local),
            "global" => Ok(QueryMode::Global),
            "hybrid" => Ok(QueryMode::Hybrid),
            "mix" => Ok(QueryMode::Mix),
            other => Err(format!("unknown query mode: {other}")),
        }
    }
}
