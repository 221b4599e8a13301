//! Protocol wrapper types for rendezvous messages.
//!
//! This module provides Rust-friendly wrapper types around the generated
//! protobuf messages, with conversion traits for ergonomic usage.

// Re-export proto types for internal use
pub(crate) use super::proto;

/// A named variable pushed from rank 0 to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableMessage {
    /// Broadcast session the message belongs to.
    pub session_id: String,
    /// Rank of the sender (always 0 today).
    pub sender_rank: u32,
    /// Variable name, e.g. `NCCLID`.
    pub name: String,
    /// Raw variable bytes.
    pub payload: Vec<u8>,
}

impl From<VariableMessage> for proto::SendVariableRequest {
    fn from(message: VariableMessage) -> Self {
        Self {
            session_id: message.session_id,
            sender_rank: message.sender_rank,
            variable_name: message.name,
            payload: message.payload,
        }
    }
}

impl From<proto::SendVariableRequest> for VariableMessage {
    fn from(request: proto::SendVariableRequest) -> Self {
        Self {
            session_id: request.session_id,
            sender_rank: request.sender_rank,
            name: request.variable_name,
            payload: request.payload,
        }
    }
}

/// Peer acknowledgement of a stored variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableAck {
    /// Number of bytes the peer stored.
    pub payload_len: u64,
}

impl From<VariableAck> for proto::SendVariableResponse {
    fn from(ack: VariableAck) -> Self {
        Self {
            payload_len: ack.payload_len,
        }
    }
}

impl From<proto::SendVariableResponse> for VariableAck {
    fn from(response: proto::SendVariableResponse) -> Self {
        Self {
            payload_len: response.payload_len,
        }
    }
}

/// Batch barrier: no more variables follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSignal {
    pub session_id: String,
    pub sender_rank: u32,
}

impl From<CompletionSignal> for proto::CompletionSignalRequest {
    fn from(signal: CompletionSignal) -> Self {
        Self {
            session_id: signal.session_id,
            sender_rank: signal.sender_rank,
        }
    }
}

impl From<proto::CompletionSignalRequest> for CompletionSignal {
    fn from(request: proto::CompletionSignalRequest) -> Self {
        Self {
            session_id: request.session_id,
            sender_rank: request.sender_rank,
        }
    }
}

/// Peer acknowledgement of the completion signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionAck {
    /// Variables the peer held when the signal arrived.
    pub received_variables: Vec<String>,
}

impl CompletionAck {
    /// Check whether the peer reported holding `name`.
    pub fn has_variable(&self, name: &str) -> bool {
        self.received_variables.iter().any(|v| v == name)
    }
}

impl From<CompletionAck> for proto::CompletionSignalResponse {
    fn from(ack: CompletionAck) -> Self {
        Self {
            received_variables: ack.received_variables,
        }
    }
}

impl From<proto::CompletionSignalResponse> for CompletionAck {
    fn from(response: proto::CompletionSignalResponse) -> Self {
        Self {
            received_variables: response.received_variables,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_message_field_mapping() {
        let message = VariableMessage {
            session_id: "s-1".to_string(),
            sender_rank: 0,
            name: "NCCLID".to_string(),
            payload: vec![0xAA, 0xBB],
        };

        let request = proto::SendVariableRequest::from(message.clone());
        assert_eq!(request.variable_name, "NCCLID");
        assert_eq!(request.payload, vec![0xAA, 0xBB]);
        assert_eq!(VariableMessage::from(request), message);
    }

    #[test]
    fn test_completion_ack_has_variable() {
        let ack = CompletionAck {
            received_variables: vec!["NCCLID".to_string()],
        };
        assert!(ack.has_variable("NCCLID"));
        assert!(!ack.has_variable("OTHER"));
        assert!(!CompletionAck::default().has_variable("NCCLID"));
    }
}
