//! Shared scripted transport fake for the integration tests.
//!
//! Unlike a mock, `FakeLink` carries real state: a pending inbound
//! backlog, a handshake latch, injectable outbound failures, and counters
//! for the explicit capability calls. Tests read the state back after
//! driving the subsystem through its public API.

#![allow(dead_code)]

use async_trait::async_trait;
use meshlink_core::{
    AckFrame, AckOutcome, LinkConfig, LinkError, LinkEvent, LinkEventReceiver, LinkTarget,
    ServiceMap, Target, TransportLink,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::num::NonZeroU32;
use tokio::sync::mpsc;
use tokio::time::Duration;

#[derive(Default)]
pub struct FakeState {
    pub connects: u32,
    pub disconnects: u32,
    pub invalidations: u32,
    pub stack_restarts: u32,
    pub notify_enabled: bool,
    pub handshake_done: bool,
    /// Frames buffered on the peer before connect; served one per read
    pub backlog: VecDeque<Vec<u8>>,
    /// Everything written to the outbound endpoint, in order
    pub outbound: Vec<Vec<u8>>,
    /// Remaining outbound operations that fail before succeeding
    pub fail_outbound: u32,
    /// When set, outbound operations hang forever
    pub stall_outbound: bool,
    /// When set, service resolution omits the outbound endpoint
    pub missing_services: bool,
    /// When unset, connect does not emit LinkUp; the test drives the gate
    pub auto_link_up: bool,
    /// Coarse call-order trace for sequencing assertions
    pub log: Vec<&'static str>,
}

pub struct FakeLink {
    config: LinkConfig,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    pub state: Mutex<FakeState>,
}

/// Route crate logs through the test harness when RUST_LOG asks for them.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl FakeLink {
    /// Build a fake plus the event stream to hand to `MeshLink::start`.
    pub fn new(config: LinkConfig) -> (std::sync::Arc<Self>, LinkEventReceiver) {
        init_tracing();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link = std::sync::Arc::new(Self {
            config,
            events_tx,
            state: Mutex::new(FakeState {
                auto_link_up: true,
                ..FakeState::default()
            }),
        });
        (link, events_rx)
    }

    pub fn emit(&self, event: LinkEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Deliver an acknowledgment frame the way a peer would: as a
    /// notification on the ack topic.
    pub fn ack(&self, id: NonZeroU32, outcome: AckOutcome) {
        let frame = AckFrame {
            packet_id: id,
            outcome,
        };
        self.emit(LinkEvent::Notification {
            topic: self.config.ack_topic.clone(),
            data: frame.to_bytes().to_vec(),
        });
    }
}

pub fn target() -> LinkTarget {
    LinkTarget::named("7c:41:a2:00:11:22", "mesh-node-7")
}

#[async_trait]
impl TransportLink for FakeLink {
    async fn connect(&self, _target: &LinkTarget) -> Result<(), LinkError> {
        let auto = {
            let mut state = self.state.lock();
            state.connects += 1;
            state.handshake_done = false;
            state.notify_enabled = false;
            state.auto_link_up
        };
        if auto {
            let _ = self.events_tx.send(LinkEvent::LinkUp);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        self.state.lock().disconnects += 1;
        Ok(())
    }

    async fn perform_write(&self, dest: Target, data: &[u8]) -> Result<(), LinkError> {
        if dest == Target::Outbound && self.state.lock().stall_outbound {
            // never completes; the queue-level timeout has to fire
            tokio::time::sleep(Duration::from_secs(86_400)).await;
        }
        let mut state = self.state.lock();
        match dest {
            Target::Config => {
                if data == self.config.handshake_request.as_slice() {
                    state.handshake_done = true;
                    state.log.push("handshake");
                }
                Ok(())
            }
            Target::Outbound => {
                if state.fail_outbound > 0 {
                    state.fail_outbound -= 1;
                    return Err(LinkError::OperationFailed(40));
                }
                state.outbound.push(data.to_vec());
                Ok(())
            }
            Target::Inbound => Err(LinkError::Unsupported("write to inbound")),
        }
    }

    async fn perform_read(&self, dest: Target) -> Result<Vec<u8>, LinkError> {
        let mut state = self.state.lock();
        match dest {
            Target::Inbound => {
                let frame = state.backlog.pop_front().unwrap_or_default();
                if !frame.is_empty() {
                    state.log.push("drain");
                }
                Ok(frame)
            }
            Target::Config => {
                if state.handshake_done {
                    Ok(self.config.handshake_token.clone())
                } else {
                    Ok(Vec::new())
                }
            }
            Target::Outbound => Err(LinkError::Unsupported("read from outbound")),
        }
    }

    async fn set_notify(&self, _dest: Target, enabled: bool) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.notify_enabled = enabled;
        state.log.push("notify");
        Ok(())
    }

    async fn perform_reliable_write(&self, dest: Target, data: &[u8]) -> Result<(), LinkError> {
        let stall = self.state.lock().stall_outbound;
        if stall {
            // never completes; the queue-level timeout has to fire
            tokio::time::sleep(Duration::from_secs(86_400)).await;
        }
        let mut state = self.state.lock();
        if state.fail_outbound > 0 {
            state.fail_outbound -= 1;
            return Err(LinkError::OperationFailed(40));
        }
        if dest == Target::Outbound {
            state.outbound.push(data.to_vec());
        }
        Ok(())
    }

    async fn negotiate_mtu(&self, requested: u16) -> Result<u16, LinkError> {
        Ok(requested.min(247))
    }

    async fn resolve_services(&self) -> Result<ServiceMap, LinkError> {
        let state = self.state.lock();
        if state.missing_services {
            Ok(ServiceMap::new([Target::Inbound, Target::Config]))
        } else {
            Ok(ServiceMap::new([
                Target::Inbound,
                Target::Outbound,
                Target::Config,
            ]))
        }
    }

    async fn invalidate_cache(&self) -> Result<(), LinkError> {
        self.state.lock().invalidations += 1;
        Ok(())
    }

    async fn restart_stack(&self) -> Result<(), LinkError> {
        self.state.lock().stack_restarts += 1;
        Ok(())
    }
}
