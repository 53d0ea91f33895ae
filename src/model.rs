//! Shared domain types for the task coordination core.
//!
//! These mirror the `queue`, `userfiles`, `outbox` tables on the
//! persistent side, and the `T_req`/`T_res` broker payloads on the
//! wire side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user, identified by an opaque non-zero integer id.
pub type UserId = i64;

/// State of a `UserFile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileState {
    Pending,
    Processed,
    Error,
}

impl FileState {
    /// True once the file has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, FileState::Processed | FileState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileState::Pending => "PENDING",
            FileState::Processed => "PROCESSED",
            FileState::Error => "ERROR",
        }
    }
}

impl std::str::FromStr for FileState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(FileState::Pending),
            "PROCESSED" => Ok(FileState::Processed),
            "ERROR" => Ok(FileState::Error),
            other => Err(format!("unknown file state: {other}")),
        }
    }
}

/// A live queue entry: `{id, order}`. `order` is assigned at insertion and
/// is monotonically increasing and unique across all live entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub order: i64,
}

/// A row in `userfiles`. `queue_ref` is `Some` while `state = Pending`;
/// it is cleared on the terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFile {
    pub id: i64,
    pub queue_ref: Option<i64>,
    pub user_id: UserId,
    pub order_num: i64,
    pub src_url: String,
    pub src_key: String,
    pub dest_url: String,
    pub dest_key: String,
    pub state: FileState,
    pub created_at: DateTime<Utc>,
    pub file_name: String,
}

/// A task submitted by `create_tasks`, before it has a row id. Routed
/// to a user via the separate `user_id` argument `create_tasks` takes,
/// not carried per-task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub file_name: String,
    pub src_url: String,
    pub src_key: String,
    pub dest_url: String,
    pub dest_key: String,
}

/// Dashboard row returned by `get_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientUserItem {
    pub order_num: i64,
    pub file_name: String,
    /// Blanked while `status = PENDING`.
    pub link: String,
    /// 1-based position, 0/-1 when there is no live queue entry.
    pub queue_position: i64,
    pub status: FileState,
}

/// Status of an `OutboxRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxStatus {
    Pending,
    Sent,
}

/// A row in `outbox`, ready to be handed to the broker producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: i64,
    pub payload: String,
    pub idempotency_key: String,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// The `T_req` wire payload. Field casing (`FileID`, not `TaskId`) is
/// the schema consumers downstream already expect on this topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerRequest {
    #[serde(rename = "SrcFileURL")]
    pub src_file_url: String,
    #[serde(rename = "DestFileURL")]
    pub dest_file_url: String,
    #[serde(rename = "DestFileKey")]
    pub dest_file_key: String,
    #[serde(rename = "FileID")]
    pub file_id: i64,
    #[serde(rename = "FileExtension")]
    pub file_extension: String,
    #[serde(rename = "UserID")]
    pub user_id: UserId,
    #[serde(rename = "QueueID")]
    pub queue_id: i64,
}

/// Outcome carried by a `T_res` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessResult {
    Processed,
    Error,
}

impl ProcessResult {
    pub fn as_file_state(self) -> FileState {
        match self {
            ProcessResult::Processed => FileState::Processed,
            ProcessResult::Error => FileState::Error,
        }
    }
}

/// The `T_res` wire payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerResult {
    #[serde(rename = "Result")]
    pub result: ProcessResult,
    #[serde(rename = "Error")]
    pub error: String,
    #[serde(rename = "DestFileKey")]
    pub dest_file_key: String,
    #[serde(rename = "UserID")]
    pub user_id: UserId,
    #[serde(rename = "FileID")]
    pub file_id: i64,
    #[serde(rename = "QueueID")]
    pub queue_id: i64,
}

/// What `finish_tasks` applies to a single file. `dest_url` is a
/// freshly-issued presigned GET, produced by the caller (the completion
/// sink), not carried on the wire.
#[derive(Debug, Clone)]
pub struct FinishedTask {
    pub file_id: i64,
    pub user_id: UserId,
    pub queue_id: i64,
    pub result: ProcessResult,
    pub error: String,
    pub dest_url: String,
}

/// A blob handed to the front/back tier after a client uploads to a
/// presigned PUT URL.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub url: String,
    pub key: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_state_round_trips_through_str() {
        for state in [FileState::Pending, FileState::Processed, FileState::Error] {
            let parsed: FileState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn broker_request_uses_spec_field_names() {
        let req = BrokerRequest {
            src_file_url: "s".into(),
            dest_file_url: "d".into(),
            dest_file_key: "dk".into(),
            file_id: 42,
            file_extension: ".png".into(),
            user_id: 7,
            queue_id: 9,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"FileID\":42"));
        assert!(json.contains("\"QueueID\":9"));
    }

    #[test]
    fn process_result_maps_to_terminal_file_state() {
        assert_eq!(ProcessResult::Processed.as_file_state(), FileState::Processed);
        assert_eq!(ProcessResult::Error.as_file_state(), FileState::Error);
    }
}
