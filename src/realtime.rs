//! Realtime task submission over the persistent publish channel.
//!
//! Outbound realtime operations (edit, pin, react) are all sent as a task
//! envelope on one well-known topic. The envelope is rebuilt for every
//! publish so each attempt carries fresh request and task sequence numbers.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::json;

use crate::{errors::Result, session::SessionContext, BoxFuture};

/// Topic that accepts outbound task submissions.
pub const TASK_TOPIC: &str = "/ls_req";

const APP_ID: &str = "2220391788200892";
const ENVELOPE_TYPE: u8 = 3;
const VERSION_ID: &str = "7553237234719461";

/// Delivery guarantee requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

/// Publish primitive of the realtime channel.
pub trait Publisher: Send + Sync {
    fn publish<'a>(&'a self, topic: &'a str, payload: Vec<u8>, qos: QoS) -> BoxFuture<'a, Result<()>>;
}

/// Realtime operation kinds and their wire labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    EditMessage,
    PinMessage,
    UnpinMessage,
    React,
}

impl TaskKind {
    fn label(self) -> &'static str {
        match self {
            TaskKind::EditMessage => "742",
            TaskKind::PinMessage => "430",
            TaskKind::UnpinMessage => "431",
            TaskKind::React => "29",
        }
    }

    fn queue_name(self, thread_or_message: &str) -> String {
        match self {
            TaskKind::EditMessage => "edit_message".to_string(),
            _ => thread_or_message.to_string(),
        }
    }
}

#[derive(Serialize)]
struct Task {
    failure_count: Option<u32>,
    label: &'static str,
    payload: String,
    queue_name: String,
    task_id: u64,
}

/// One task ready to be wrapped and published.
#[derive(Debug, Clone)]
pub struct TaskEnvelope {
    pub kind: TaskKind,
    pub queue_key: String,
    pub payload: serde_json::Value,
}

impl TaskEnvelope {
    pub fn edit_message(message_id: &str, text: &str) -> Self {
        Self {
            kind: TaskKind::EditMessage,
            queue_key: message_id.to_string(),
            payload: json!({ "message_id": message_id, "text": text }),
        }
    }

    pub fn pin_message(thread_id: &str, message_id: &str, pinned: bool) -> Self {
        Self {
            kind: if pinned {
                TaskKind::PinMessage
            } else {
                TaskKind::UnpinMessage
            },
            queue_key: thread_id.to_string(),
            payload: json!({ "thread_key": thread_id, "message_id": message_id }),
        }
    }

    /// An empty `reaction` removes the current reaction.
    pub fn react(thread_id: &str, message_id: &str, reaction: &str) -> Self {
        Self {
            kind: TaskKind::React,
            queue_key: thread_id.to_string(),
            payload: json!({
                "thread_key": thread_id,
                "message_id": message_id,
                "reaction": reaction,
            }),
        }
    }

    /// Serialize with freshly drawn request/task ids from `session`.
    pub fn encode(&self, session: &SessionContext) -> Result<Vec<u8>> {
        let request_id = session.next_request_id();
        let task_id = session.next_task_id();
        let task = Task {
            failure_count: None,
            label: self.kind.label(),
            payload: serde_json::to_string(&self.payload)?,
            queue_name: self.kind.queue_name(&self.queue_key),
            task_id,
        };
        let inner = json!({
            "epoch_id": epoch_id(),
            "tasks": [task],
            "version_id": VERSION_ID,
        });
        let outer = json!({
            "app_id": APP_ID,
            "payload": serde_json::to_string(&inner)?,
            "request_id": request_id,
            "type": ENVELOPE_TYPE,
        });
        Ok(serde_json::to_vec(&outer)?)
    }
}

/// Millisecond timestamp shifted into the upper bits, as the channel expects.
fn epoch_id() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    millis << 22
}
