// Meshlink Core — reliable link spine
//
// "Make a half-duplex, lossy radio feel like an ordered,
//  acknowledged message pipe."
//
// If a feature doesn't serve that sentence, it doesn't belong here.

pub mod config;
pub mod link;
pub mod message;

use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::warn;

pub use config::LinkConfig;
pub use link::{
    ConnectionState, DisconnectReason, HandshakeStage, LinkError, LinkEvent, LinkEventReceiver,
    LinkPhase, LinkTarget, QueueStats, ServiceMap, Target, TransportLink,
};
pub use link::{DeviceMatcher, DeviceQuirks, QuirkRule, QuirkTable};
pub use message::{
    AckFrame, AckOutcome, Delivery, DeliveryEvent, DeliveryStats, MessageStatus,
    NotificationDispatcher, NotificationHandler,
};

use link::lifecycle::LifecycleHandle;
use link::operation::OperationQueueHandle;
use message::delivery::PacketQueueHandle;

/// Combined counters from both queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub operations: QueueStats,
    pub delivery: DeliveryStats,
}

/// The subsystem façade: one serialized operation queue, one packet
/// delivery queue, one lifecycle actor, one notification dispatcher.
///
/// `start` wires the pieces together around an injected [`TransportLink`]
/// and its event stream; everything after that is driven by the returned
/// handle. Cheap to clone.
#[derive(Clone)]
pub struct MeshLink {
    lifecycle: LifecycleHandle,
    ops: OperationQueueHandle,
    delivery: PacketQueueHandle,
    dispatcher: Arc<NotificationDispatcher>,
}

impl MeshLink {
    /// Assemble and start the subsystem. Returns the handle plus the
    /// per-packet delivery-event stream.
    pub fn start(
        transport: Arc<dyn TransportLink>,
        events: LinkEventReceiver,
        config: LinkConfig,
        quirks: QuirkTable,
    ) -> (Self, mpsc::UnboundedReceiver<DeliveryEvent>) {
        let dispatcher = Arc::new(NotificationDispatcher::new());
        let (escalation_tx, escalation_rx) = mpsc::unbounded_channel();
        let ops = OperationQueueHandle::spawn(transport.clone(), config.clone(), escalation_tx);
        let (delivery, delivery_events) = PacketQueueHandle::spawn(ops.clone(), config.clone());

        // acknowledgment frames come in as ordinary notifications on the
        // ack topic and resolve pending tracked packets
        let ack_queue = delivery.clone();
        dispatcher.register_fn(config.ack_topic.clone(), move |data: &[u8]| {
            match AckFrame::from_bytes(data) {
                Some(frame) => ack_queue.acknowledge(frame),
                None => warn!("Malformed ack frame ({} bytes) dropped", data.len()),
            }
        });

        let lifecycle = LifecycleHandle::spawn(
            transport,
            events,
            config,
            Arc::new(quirks),
            ops.clone(),
            delivery.clone(),
            dispatcher.clone(),
            escalation_rx,
        );

        (
            Self {
                lifecycle,
                ops,
                delivery,
                dispatcher,
            },
            delivery_events,
        )
    }

    /// Begin bring-up against `target`. Progress is observable on
    /// [`connection_state`](Self::connection_state) and
    /// [`phase`](Self::phase).
    pub fn connect(&self, target: LinkTarget) {
        self.lifecycle.connect(target);
    }

    /// Tear the link down and run bring-up again from scratch, resetting
    /// the backoff schedule.
    pub fn force_reconnect(&self) {
        self.lifecycle.force_reconnect();
    }

    /// Stop all actors. Pending packets resolve with `QueueClosed`.
    pub fn shutdown(&self) {
        self.lifecycle.shutdown();
    }

    /// Queue a packet for ordered delivery. A tracked packet is retried
    /// and replayed until acknowledged or failed; an untracked one
    /// resolves as soon as it is written out.
    pub async fn send_packet(
        &self,
        payload: Vec<u8>,
        track_for_ack: bool,
    ) -> Result<Delivery, LinkError> {
        self.delivery.submit(payload, None, track_for_ack).await
    }

    /// Like [`send_packet`](Self::send_packet), with a caller-chosen
    /// correlation id (already encoded in the payload).
    pub async fn send_packet_with_id(
        &self,
        payload: Vec<u8>,
        id: NonZeroU32,
        track_for_ack: bool,
    ) -> Result<Delivery, LinkError> {
        self.delivery.submit(payload, Some(id), track_for_ack).await
    }

    /// Register the handler for one notification topic, replacing any
    /// previous one.
    pub fn register_notification_handler<F>(&self, topic: impl Into<String>, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.dispatcher.register_fn(topic, handler);
    }

    pub fn unregister_notification_handler(&self, topic: &str) {
        self.dispatcher.unregister(topic);
    }

    /// Authoritative connection state, as a watch channel.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.lifecycle.state()
    }

    /// Fine-grained bring-up phase, as a watch channel.
    pub fn phase(&self) -> watch::Receiver<LinkPhase> {
        self.lifecycle.phase()
    }

    /// Counter snapshot from both queues.
    pub async fn stats(&self) -> Result<LinkStats, LinkError> {
        Ok(LinkStats {
            operations: self.ops.stats().await?,
            delivery: self.delivery.stats().await?,
        })
    }
}
