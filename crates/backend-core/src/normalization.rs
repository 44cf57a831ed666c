use crate::{
    error::BackendError,
    types::{BackendEvent, PushEvent, PushFrame, SendAck},
};

/// Internal helper describing send command success/failure before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Send succeeded and the backend stored a message with this id.
    Success { message_id: i64 },
    /// Send failed with backend error details.
    Failure { error: BackendError },
}

/// Convert a send command outcome to a stable `BackendEvent::SendAck`.
pub fn normalize_send_outcome(
    client_txn_id: impl Into<String>,
    outcome: SendOutcome,
) -> BackendEvent {
    let client_txn_id = client_txn_id.into();
    match outcome {
        SendOutcome::Success { message_id } => BackendEvent::SendAck(SendAck {
            client_txn_id,
            message_id: Some(message_id),
            error_code: None,
        }),
        SendOutcome::Failure { error } => BackendEvent::SendAck(SendAck {
            client_txn_id,
            message_id: None,
            error_code: Some(error.code),
        }),
    }
}

/// Convert a failed user-visible operation into an event.
pub fn normalize_operation_failure(
    operation: impl Into<String>,
    error: BackendError,
) -> BackendEvent {
    BackendEvent::OperationFailed {
        operation: operation.into(),
        error,
    }
}

/// Decode one inbound text frame from the push channel.
///
/// Non-JSON payloads become [`PushFrame::Raw`]; JSON without a recognized
/// `type` (or with a malformed body) becomes [`PushFrame::Json`].
pub fn decode_push_frame(payload: &str) -> PushFrame {
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(_) => return PushFrame::Raw(payload.to_owned()),
    };

    match serde_json::from_value::<PushEvent>(value.clone()) {
        Ok(PushEvent::MessageEdited {
            conversation_id,
            mut message,
        }) => {
            if message.conversation_id == 0 {
                message.conversation_id = conversation_id;
            }
            PushFrame::Event(PushEvent::MessageEdited {
                conversation_id,
                message,
            })
        }
        Ok(event) => PushFrame::Event(event),
        Err(_) => PushFrame::Json(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendErrorCategory;

    #[test]
    fn maps_success_to_send_ack() {
        let event = normalize_send_outcome("txn-1", SendOutcome::Success { message_id: 41 });

        match event {
            BackendEvent::SendAck(ack) => {
                assert_eq!(ack.client_txn_id, "txn-1");
                assert_eq!(ack.message_id, Some(41));
                assert_eq!(ack.error_code, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn maps_failure_to_send_ack_with_stable_error_code() {
        let event = normalize_send_outcome(
            "txn-2",
            SendOutcome::Failure {
                error: BackendError::validation("empty_message", "Type a message"),
            },
        );

        match event {
            BackendEvent::SendAck(ack) => {
                assert_eq!(ack.client_txn_id, "txn-2");
                assert_eq!(ack.message_id, None);
                assert_eq!(ack.error_code.as_deref(), Some("empty_message"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn wraps_operation_failures() {
        let event = normalize_operation_failure(
            "hide_conversation",
            BackendError::new(BackendErrorCategory::Network, "network", "offline"),
        );
        assert!(matches!(
            event,
            BackendEvent::OperationFailed { ref operation, .. } if operation == "hide_conversation"
        ));
    }

    #[test]
    fn decodes_recognized_unknown_and_raw_frames() {
        let frame = decode_push_frame(
            r#"{"type":"conversation_updated","conversation_id":3,"unread_count":2}"#,
        );
        assert_eq!(
            frame,
            PushFrame::Event(PushEvent::ConversationUpdated {
                conversation_id: 3,
                unread_count: Some(2),
            })
        );

        let frame = decode_push_frame(r#"{"type":"typing","conversation_id":3}"#);
        assert!(matches!(frame, PushFrame::Json(_)));

        let frame = decode_push_frame(r#"{"type":"new_message"}"#);
        assert!(matches!(frame, PushFrame::Json(_)));

        assert_eq!(decode_push_frame("pong"), PushFrame::Raw("pong".to_owned()));
    }

    #[test]
    fn edited_message_inherits_conversation_id() {
        let frame = decode_push_frame(
            r#"{"type":"message_edited","conversation_id":"9","message":{"id":5,"content":"fixed"}}"#,
        );
        match frame {
            PushFrame::Event(PushEvent::MessageEdited { message, .. }) => {
                assert_eq!(message.conversation_id, 9);
                assert_eq!(message.content.as_deref(), Some("fixed"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
