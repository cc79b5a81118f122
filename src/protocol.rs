//! Boundary message schema.
//!
//! Every message is one envelope `{type, payload, requestId, timestamp, status}`.
//! Inbound text is validated here once; the rest of the engine only sees
//! [`InboundMessage`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::bus::{SetupComplete, SetupProgress};
use crate::error::ProtocolError;
use crate::types::{IndexStatus, SearchResult, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    SetupStart,
    SetupProgress,
    SetupComplete,
    SearchRequest,
    SimilarRequest,
    SearchResults,
    StatusRequest,
    Status,
    Ping,
    Pong,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Success,
    Error,
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub payload: Value,
    pub request_id: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub status: MessageStatus,
}

/// A validated inbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub request_id: String,
    pub message: InboundMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    SetupStart,
    SearchRequest { query: String, limit: Option<usize> },
    SimilarRequest { note_id: String, limit: Option<usize> },
    StatusRequest,
    Ping,
}

/// An inbound message that failed validation, with the id to answer to.
#[derive(Debug)]
pub struct Rejection {
    pub request_id: String,
    pub error: ProtocolError,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Deserialize)]
struct SearchRequestPayload {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimilarRequestPayload {
    note_id: String,
    #[serde(default)]
    limit: Option<usize>,
}

pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Parse and validate one inbound message.
pub fn parse_inbound(text: &str) -> Result<Inbound, Rejection> {
    let raw: RawEnvelope = serde_json::from_str(text).map_err(|e| Rejection {
        request_id: new_request_id(),
        error: ProtocolError::InvalidJson(e),
    })?;
    let request_id = raw
        .request_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(new_request_id);

    let message = match raw.kind.as_str() {
        "setup_start" => Ok(InboundMessage::SetupStart),
        "status_request" => Ok(InboundMessage::StatusRequest),
        "ping" => Ok(InboundMessage::Ping),
        "search_request" => parse_search(raw.payload),
        "similar_request" => parse_similar(raw.payload),
        other => Err(ProtocolError::UnsupportedType(other.to_string())),
    };

    match message {
        Ok(message) => Ok(Inbound {
            request_id,
            message,
        }),
        Err(error) => Err(Rejection { request_id, error }),
    }
}

fn payload_of<T: serde::de::DeserializeOwned>(
    kind: &str,
    payload: Option<Value>,
) -> Result<T, ProtocolError> {
    let invalid = |reason: String| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason,
    };
    let payload = payload.ok_or_else(|| invalid("missing payload".to_string()))?;
    serde_json::from_value(payload).map_err(|e| invalid(e.to_string()))
}

fn parse_search(payload: Option<Value>) -> Result<InboundMessage, ProtocolError> {
    let SearchRequestPayload { query, limit } = payload_of("search_request", payload)?;
    Ok(InboundMessage::SearchRequest { query, limit })
}

fn parse_similar(payload: Option<Value>) -> Result<InboundMessage, ProtocolError> {
    let SimilarRequestPayload { note_id, limit } = payload_of("similar_request", payload)?;
    Ok(InboundMessage::SimilarRequest { note_id, limit })
}

impl Envelope {
    pub fn new(kind: MessageType, request_id: &str, status: MessageStatus, payload: Value) -> Self {
        Self {
            kind,
            payload,
            request_id: request_id.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            status,
        }
    }

    pub fn setup_progress(request_id: &str, progress: &SetupProgress) -> Self {
        Self::new(
            MessageType::SetupProgress,
            request_id,
            MessageStatus::InProgress,
            json!(progress),
        )
    }

    pub fn setup_complete(request_id: &str, complete: &SetupComplete) -> Self {
        let status = if complete.success {
            MessageStatus::Success
        } else {
            MessageStatus::Error
        };
        Self::new(MessageType::SetupComplete, request_id, status, json!(complete))
    }

    pub fn search_results(request_id: &str, results: &[SearchResult]) -> Self {
        Self::new(
            MessageType::SearchResults,
            request_id,
            MessageStatus::Success,
            json!({ "results": results }),
        )
    }

    pub fn status(request_id: &str, status: &IndexStatus, stage: Stage) -> Self {
        let mut payload = json!(status);
        payload["stage"] = json!(stage);
        Self::new(MessageType::Status, request_id, MessageStatus::Success, payload)
    }

    pub fn pong(request_id: &str) -> Self {
        Self::new(MessageType::Pong, request_id, MessageStatus::Success, json!({}))
    }

    pub fn error(request_id: &str, code: &str, message: &str) -> Self {
        Self::new(
            MessageType::Error,
            request_id,
            MessageStatus::Error,
            json!({ "error": { "code": code, "message": message } }),
        )
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CycleStats, StatusType};
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_search_request() {
        let inbound = parse_inbound(
            r#"{"type":"search_request","payload":{"query":"recipes","limit":5},"requestId":"r1","timestamp":1.0}"#,
        )
        .unwrap();
        assert_eq!(
            inbound,
            Inbound {
                request_id: "r1".to_string(),
                message: InboundMessage::SearchRequest {
                    query: "recipes".to_string(),
                    limit: Some(5),
                },
            }
        );
    }

    #[test]
    fn parses_similar_request() {
        let text = r#"{"type":"similar_request","payload":{"noteId":"abc"},"requestId":"r9"}"#;
        let inbound = parse_inbound(text).unwrap();
        assert_eq!(
            inbound.message,
            InboundMessage::SimilarRequest {
                note_id: "abc".to_string(),
                limit: None,
            }
        );

        let no_id =
            parse_inbound(r#"{"type":"similar_request","payload":{"limit":2}}"#).unwrap_err();
        assert_eq!(no_id.error.code(), "invalid_payload");
    }

    #[test]
    fn missing_request_id_gets_a_fresh_one() {
        let a = parse_inbound(r#"{"type":"ping"}"#).unwrap();
        let b = parse_inbound(r#"{"type":"ping","requestId":""}"#).unwrap();
        assert_eq!(a.message, InboundMessage::Ping);
        assert!(uuid::Uuid::parse_str(&a.request_id).is_ok());
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn rejects_malformed_input() {
        let bad_json = parse_inbound("{not json").unwrap_err();
        assert_eq!(bad_json.error.code(), "invalid_json");

        let unknown = parse_inbound(r#"{"type":"reboot","requestId":"r2"}"#).unwrap_err();
        assert_eq!(unknown.error.code(), "unsupported_type");
        assert_eq!(unknown.request_id, "r2");

        let no_query =
            parse_inbound(r#"{"type":"search_request","payload":{"limit":3}}"#).unwrap_err();
        assert_eq!(no_query.error.code(), "invalid_payload");

        let no_payload = parse_inbound(r#"{"type":"search_request"}"#).unwrap_err();
        assert_eq!(no_payload.error.code(), "invalid_payload");
    }

    #[test]
    fn outbound_envelopes_use_wire_names() {
        let progress = SetupProgress {
            stage: Stage::Parsing,
            status_type: StatusType::ReadingDatabase,
            processing: None,
            stats: None,
        };
        let text = Envelope::setup_progress("r3", &progress).to_json().unwrap();
        let json: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "setup_progress");
        assert_eq!(json["requestId"], "r3");
        assert_eq!(json["status"], "in_progress");
        assert_eq!(json["payload"]["statusType"], "reading_database");
        assert!(json["timestamp"].as_f64().unwrap() > 0.0);

        let done = Envelope::setup_complete(
            "r3",
            &SetupComplete {
                success: false,
                stats: Some(CycleStats::default()),
                error: Some("source offline".to_string()),
            },
        );
        assert_eq!(done.status, MessageStatus::Error);
        assert_eq!(done.payload["stats"]["inTrash"], 0);

        let err = Envelope::error("r4", "empty_query", "search query is empty");
        assert_eq!(err.payload["error"]["code"], "empty_query");
    }

    #[test]
    fn status_payload_carries_stage() {
        let status = IndexStatus {
            has_completed_index: true,
            indexed_notes: 3,
            last_completed_at: Some(7),
        };
        let env = Envelope::status("r5", &status, Stage::Idle);
        assert_eq!(env.payload["hasCompletedIndex"], true);
        assert_eq!(env.payload["indexedNotes"], 3);
        assert_eq!(env.payload["stage"], "idle");
    }
}
