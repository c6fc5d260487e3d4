use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Notification about something a session observed outside the framing of
/// a synchronous command.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEventKind {
    /// Debugger output that no synchronous command claimed, such as the
    /// response to a fire-and-forget command or an asynchronous stop report.
    UnsolicitedOutput { text: String },
    /// The debugged process exited.
    TargetExited { pid: u32, status: i32 },
    /// A command missed its deadline or was abandoned mid-flight.
    Poisoned { command: String },
    /// The debugger subprocess is gone.
    Terminated { reason: String },
}

/// Per-session handle onto the shared event stream.
#[derive(Debug, Clone)]
pub(crate) struct EventPublisher {
    session_id: Uuid,
    sender: broadcast::Sender<SessionEvent>,
}

impl EventPublisher {
    pub(crate) fn new(session_id: Uuid, sender: broadcast::Sender<SessionEvent>) -> Self {
        Self { session_id, sender }
    }

    pub(crate) fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub(crate) fn emit(&self, kind: SessionEventKind) {
        let event = SessionEvent {
            session_id: self.session_id,
            at: Utc::now(),
            kind,
        };
        // No subscribers is the common case.
        let _ = self.sender.send(event);
    }

    pub(crate) fn emit_unsolicited(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        if text.trim().is_empty() {
            return;
        }
        self.emit(SessionEventKind::UnsolicitedOutput {
            text: text.into_owned(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn blank_unsolicited_output_is_not_published() {
        let (tx, mut rx) = broadcast::channel(4);
        let publisher = EventPublisher::new(Uuid::new_v4(), tx);
        publisher.emit_unsolicited(b"  \n");
        publisher.emit_unsolicited(b"Process 12 stopped\n");

        let event = rx.try_recv().expect("event");
        assert_eq!(
            event.kind,
            SessionEventKind::UnsolicitedOutput {
                text: "Process 12 stopped\n".to_string()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = SessionEvent {
            session_id: Uuid::nil(),
            at: Utc::now(),
            kind: SessionEventKind::TargetExited { pid: 77, status: 0 },
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "target_exited");
        assert_eq!(value["pid"], 77);
        assert_eq!(value["status"], 0);
    }
}
