//! Link configuration — every tunable policy value in one place
//!
//! The operation-level and message-level retry caps are deliberately
//! independent fields: transports tolerate more low-level retries than the
//! messaging layer wants to spend on a single packet.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunable policy values for a single link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Timeout armed for each transport operation once it is in flight
    pub op_timeout: Duration,
    /// Maximum attempts for Read and ReliableWrite operations (first try included)
    pub max_op_attempts: u32,
    /// Delay inserted before a ReliableWrite retry is re-enqueued
    pub reliable_write_backoff: Duration,
    /// How long the delivery queue waits for the operation queue to accept
    /// one packet. Tuned close to `op_timeout`, well below `ack_timeout`.
    pub queue_send_timeout: Duration,
    /// How long a tracked packet waits for an application-level ack
    pub ack_timeout: Duration,
    /// Maximum re-submissions of a tracked packet after an ack timeout
    pub max_message_retries: u32,
    /// Upper bound on waiting for link-up / authorization during connect
    pub connect_timeout: Duration,
    /// Reconnect backoff grows linearly by this step per attempt
    pub reconnect_backoff_step: Duration,
    /// Reconnect backoff never exceeds this cap
    pub reconnect_backoff_cap: Duration,
    /// Reconnect attempts before the link reports Failed
    pub max_reconnect_attempts: u32,
    /// Pause between consecutive backlog-drain reads
    pub drain_interval: Duration,
    /// Hard cap on drain reads so a chatty peer cannot wedge the handshake
    pub max_drain_reads: u32,
    /// Transfer unit requested during parameter negotiation
    pub mtu_request: u16,
    /// Payload written to start the application-level handshake
    pub handshake_request: Vec<u8>,
    /// Frame that marks the handshake as complete when read back
    pub handshake_token: Vec<u8>,
    /// Topic on which acknowledgment/routing frames arrive
    pub ack_topic: String,
    /// Topic under which backlog-drained frames are dispatched
    pub inbound_topic: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(4),
            max_op_attempts: 3,
            reliable_write_backoff: Duration::from_millis(200),
            queue_send_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(30),
            max_message_retries: 1,
            connect_timeout: Duration::from_secs(20),
            reconnect_backoff_step: Duration::from_secs(1),
            reconnect_backoff_cap: Duration::from_secs(10),
            max_reconnect_attempts: 10,
            drain_interval: Duration::from_millis(100),
            max_drain_reads: 64,
            mtu_request: 512,
            handshake_request: b"want-config".to_vec(),
            handshake_token: b"config-complete".to_vec(),
            ack_topic: "routing".to_string(),
            inbound_topic: "inbound".to_string(),
        }
    }
}

impl LinkConfig {
    /// Linear reconnect backoff: `min(attempt * step, cap)`.
    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        let raw = self
            .reconnect_backoff_step
            .saturating_mul(attempt.max(1));
        raw.min(self.reconnect_backoff_cap)
    }
}
