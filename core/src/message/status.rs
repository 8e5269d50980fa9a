//! Message delivery status — forward-only transitions
//!
//! A status update that does not match the allowed-transition table is
//! rejected and logged, never silently applied. Terminal states stay put.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Delivery status of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Queued or being written to the link
    Sending,
    /// Accepted by the link; awaiting ack if tracked
    Sent,
    /// Peer acknowledged delivery
    Delivered,
    /// Peer responded with content
    Received,
    /// Gave up after exhausting retries
    Failed,
    /// Peer reported a routing error
    Error,
}

impl MessageStatus {
    /// Allowed forward transitions:
    /// Sending → {Sent, Failed}; Sent → {Delivered, Received, Failed, Error};
    /// Delivered/Received/Failed/Error are terminal.
    pub fn can_transition(self, to: MessageStatus) -> bool {
        use MessageStatus::*;
        match self {
            Sending => matches!(to, Sent | Failed),
            Sent => matches!(to, Delivered | Received | Failed | Error),
            Delivered | Received | Failed | Error => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        use MessageStatus::*;
        matches!(self, Delivered | Received | Failed | Error)
    }
}

/// Holds the current status of one packet and guards its transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTracker {
    current: MessageStatus,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            current: MessageStatus::Sending,
        }
    }

    pub fn current(&self) -> MessageStatus {
        self.current
    }

    /// Apply an update if the table allows it. Returns whether it applied.
    pub fn advance(&mut self, to: MessageStatus) -> bool {
        if self.current.can_transition(to) {
            self.current = to;
            true
        } else {
            debug!(
                "Rejected status update {:?} -> {:?}",
                self.current, to
            );
            false
        }
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}
