//! Packet delivery queue — ordered sends, acks, retries, replay
//!
//! Outbound packets get a monotonically increasing non-zero id and drain one
//! at a time through the operation queue. A tracked packet then waits for an
//! acknowledgment frame correlated by id, with a bounded message-level
//! retry. Packets that were in flight when the link dropped are replayed
//! exactly once after the link is Ready again, with their original id and
//! payload, so the peer can dedupe if the first copy actually landed.
//!
//! The queue-level send timeout is deliberately shorter than the ack
//! timeout: an operation-level failure fails the message immediately
//! instead of letting it idle out the long timer.

use crate::config::LinkConfig;
use crate::link::operation::OperationQueueHandle;
use crate::link::transport::{LinkError, Target};
use crate::message::status::{MessageStatus, StatusTracker};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::num::NonZeroU32;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome reported by an acknowledgment frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckOutcome {
    Delivered,
    Received,
    Failed,
    Error,
}

impl AckOutcome {
    pub fn status(self) -> MessageStatus {
        match self {
            AckOutcome::Delivered => MessageStatus::Delivered,
            AckOutcome::Received => MessageStatus::Received,
            AckOutcome::Failed => MessageStatus::Failed,
            AckOutcome::Error => MessageStatus::Error,
        }
    }

    fn to_byte(self) -> u8 {
        match self {
            AckOutcome::Delivered => 0,
            AckOutcome::Received => 1,
            AckOutcome::Failed => 2,
            AckOutcome::Error => 3,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(AckOutcome::Delivered),
            1 => Some(AckOutcome::Received),
            2 => Some(AckOutcome::Failed),
            3 => Some(AckOutcome::Error),
            _ => None,
        }
    }
}

/// Acknowledgment/routing frame: `[packet_id: u32 le | outcome: u8]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckFrame {
    pub packet_id: NonZeroU32,
    pub outcome: AckOutcome,
}

impl AckFrame {
    pub const WIRE_SIZE: usize = 5;

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut bytes = [0u8; Self::WIRE_SIZE];
        bytes[0..4].copy_from_slice(&self.packet_id.get().to_le_bytes());
        bytes[4] = self.outcome.to_byte();
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::WIRE_SIZE {
            return None;
        }
        let raw = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let packet_id = NonZeroU32::new(raw)?;
        let outcome = AckOutcome::from_byte(bytes[4])?;
        Some(Self { packet_id, outcome })
    }
}

/// Monotonic packet id source. Wraps modulo 2^32-1, skipping zero.
#[derive(Debug, Default)]
struct PacketIdCounter {
    last: u32,
}

impl PacketIdCounter {
    fn next(&mut self) -> NonZeroU32 {
        loop {
            self.last = self.last.wrapping_add(1);
            if let Some(id) = NonZeroU32::new(self.last) {
                return id;
            }
        }
    }
}

type DeliveryResult = Result<MessageStatus, LinkError>;

/// One outbound packet owned by the queue until resolved.
#[derive(Debug)]
struct PendingPacket {
    id: NonZeroU32,
    payload: Vec<u8>,
    #[allow(dead_code)]
    created_at: Instant,
    retry_count: u32,
    tracked_for_ack: bool,
    replayed: bool,
    status: StatusTracker,
    result: Option<oneshot::Sender<DeliveryResult>>,
}

fn resolve(packet: &mut PendingPacket, result: DeliveryResult) {
    if let Some(tx) = packet.result.take() {
        let _ = tx.send(result);
    }
}

/// Caller's handle to one submitted packet.
#[derive(Debug)]
pub struct Delivery {
    pub id: NonZeroU32,
    result: oneshot::Receiver<DeliveryResult>,
}

impl Delivery {
    /// Wait for the terminal outcome of this packet.
    pub async fn wait(self) -> DeliveryResult {
        self.result.await.unwrap_or(Err(LinkError::QueueClosed))
    }
}

/// Per-packet status change, published as it happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub id: NonZeroU32,
    pub status: MessageStatus,
}

/// Delivery counters, snapshot on request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub submitted: u64,
    pub acked: u64,
    pub failed: u64,
    pub retried: u64,
    pub replayed: u64,
}

pub(crate) enum DeliveryCommand {
    Submit {
        payload: Vec<u8>,
        correlation_id: Option<NonZeroU32>,
        track_for_ack: bool,
        reply: oneshot::Sender<Delivery>,
    },
    Ack {
        frame: AckFrame,
    },
    LinkReady,
    LinkLost,
    Stats(oneshot::Sender<DeliveryStats>),
    Shutdown,
}

/// Handle to the running delivery queue task.
#[derive(Clone)]
pub struct PacketQueueHandle {
    tx: mpsc::UnboundedSender<DeliveryCommand>,
}

impl PacketQueueHandle {
    /// Spawn the queue actor; returns the handle and the delivery-event
    /// stream.
    pub(crate) fn spawn(
        ops: OperationQueueHandle,
        config: LinkConfig,
    ) -> (Self, mpsc::UnboundedReceiver<DeliveryEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (send_done_tx, send_done_rx) = mpsc::unbounded_channel();
        let actor = DeliveryActor {
            ops,
            config,
            cmd_rx,
            send_done_tx,
            send_done_rx,
            events_tx,
            queue: VecDeque::new(),
            sending: None,
            send_token: 0,
            awaiting_ack: Vec::new(),
            replay: Vec::new(),
            ids: PacketIdCounter::default(),
            link_ready: false,
            stats: DeliveryStats::default(),
        };
        tokio::spawn(actor.run());
        (Self { tx: cmd_tx }, events_rx)
    }

    /// Submit a packet. `correlation_id` may be supplied when the caller
    /// already encoded an id into the payload; otherwise the next monotonic
    /// id is assigned. Fire-and-forget: the returned [`Delivery`] resolves
    /// when the packet reaches a terminal state.
    pub async fn submit(
        &self,
        payload: Vec<u8>,
        correlation_id: Option<NonZeroU32>,
        track_for_ack: bool,
    ) -> Result<Delivery, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DeliveryCommand::Submit {
                payload,
                correlation_id,
                track_for_ack,
                reply,
            })
            .map_err(|_| LinkError::QueueClosed)?;
        rx.await.map_err(|_| LinkError::QueueClosed)
    }

    /// Resolve a pending packet from an acknowledgment frame. Safe to call
    /// from a synchronous notification handler.
    pub fn acknowledge(&self, frame: AckFrame) {
        let _ = self.tx.send(DeliveryCommand::Ack { frame });
    }

    pub(crate) fn link_ready(&self) {
        let _ = self.tx.send(DeliveryCommand::LinkReady);
    }

    pub(crate) fn link_lost(&self) {
        let _ = self.tx.send(DeliveryCommand::LinkLost);
    }

    pub async fn stats(&self) -> Result<DeliveryStats, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DeliveryCommand::Stats(tx))
            .map_err(|_| LinkError::QueueClosed)?;
        rx.await.map_err(|_| LinkError::QueueClosed)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(DeliveryCommand::Shutdown);
    }
}

struct AckWait {
    deadline: Instant,
    packet: PendingPacket,
}

struct DeliveryActor {
    ops: OperationQueueHandle,
    config: LinkConfig,
    cmd_rx: mpsc::UnboundedReceiver<DeliveryCommand>,
    send_done_tx: mpsc::UnboundedSender<(u64, Result<(), LinkError>)>,
    send_done_rx: mpsc::UnboundedReceiver<(u64, Result<(), LinkError>)>,
    events_tx: mpsc::UnboundedSender<DeliveryEvent>,
    queue: VecDeque<PendingPacket>,
    sending: Option<PendingPacket>,
    send_token: u64,
    awaiting_ack: Vec<AckWait>,
    replay: Vec<PendingPacket>,
    ids: PacketIdCounter,
    link_ready: bool,
    stats: DeliveryStats,
}

impl DeliveryActor {
    async fn run(mut self) {
        loop {
            let ack_deadline = self.awaiting_ack.iter().map(|w| w.deadline).min();
            let sleep_to =
                ack_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
                    Some(DeliveryCommand::Submit { payload, correlation_id, track_for_ack, reply }) => {
                        self.on_submit(payload, correlation_id, track_for_ack, reply);
                    }
                    Some(DeliveryCommand::Ack { frame }) => self.on_ack(frame),
                    Some(DeliveryCommand::LinkReady) => self.on_link_ready(),
                    Some(DeliveryCommand::LinkLost) => self.on_link_lost(),
                    Some(DeliveryCommand::Stats(tx)) => {
                        let _ = tx.send(self.stats);
                    }
                    Some(DeliveryCommand::Shutdown) | None => {
                        self.flush_all(LinkError::QueueClosed);
                        break;
                    }
                },
                Some((token, result)) = self.send_done_rx.recv() => {
                    self.on_send_done(token, result);
                }
                _ = sleep_until(sleep_to), if ack_deadline.is_some() => {
                    self.on_ack_deadline();
                }
            }
        }
    }

    fn on_submit(
        &mut self,
        payload: Vec<u8>,
        correlation_id: Option<NonZeroU32>,
        track_for_ack: bool,
        reply: oneshot::Sender<Delivery>,
    ) {
        let id = correlation_id.unwrap_or_else(|| self.ids.next());
        let (tx, rx) = oneshot::channel();
        let packet = PendingPacket {
            id,
            payload,
            created_at: Instant::now(),
            retry_count: 0,
            tracked_for_ack: track_for_ack,
            replayed: false,
            status: StatusTracker::new(),
            result: Some(tx),
        };
        self.stats.submitted += 1;
        debug!("Packet {} submitted (tracked: {})", id, track_for_ack);
        self.queue.push_back(packet);
        let _ = reply.send(Delivery { id, result: rx });
        self.maybe_send();
    }

    /// Launch the next packet if the link is ready and nothing is sending.
    fn maybe_send(&mut self) {
        if !self.link_ready || self.sending.is_some() {
            return;
        }
        let Some(packet) = self.queue.pop_front() else {
            return;
        };

        self.send_token += 1;
        let token = self.send_token;
        let ops = self.ops.clone();
        let payload = packet.payload.clone();
        let tracked = packet.tracked_for_ack;
        let send_timeout = self.config.queue_send_timeout;
        let done = self.send_done_tx.clone();
        tokio::spawn(async move {
            let write = async {
                if tracked {
                    ops.reliable_write(Target::Outbound, payload).await
                } else {
                    ops.write(Target::Outbound, payload).await
                }
            };
            let result = match timeout(send_timeout, write).await {
                Ok(result) => result,
                Err(_) => Err(LinkError::OperationTimeout),
            };
            let _ = done.send((token, result));
        });
        self.sending = Some(packet);
    }

    fn on_send_done(&mut self, token: u64, result: Result<(), LinkError>) {
        if token != self.send_token {
            debug!("Stale send completion discarded");
            return;
        }
        let Some(mut packet) = self.sending.take() else {
            return;
        };

        match result {
            Ok(()) => {
                self.advance_status(&mut packet, MessageStatus::Sent);
                if packet.tracked_for_ack {
                    let deadline = Instant::now() + self.config.ack_timeout;
                    self.awaiting_ack.push(AckWait { deadline, packet });
                } else {
                    resolve(&mut packet, Ok(MessageStatus::Sent));
                }
            }
            Err(LinkError::LinkReset) if packet.tracked_for_ack && !packet.replayed => {
                // link dropped mid-send; the packet replays after reconnect
                debug!("Packet {} held for replay after link reset", packet.id);
                self.replay.push(packet);
            }
            Err(err) => {
                warn!("Packet {} failed at queue level: {}", packet.id, err);
                self.fail_packet(packet, LinkError::MessageDeliveryFailed);
            }
        }
        self.maybe_send();
    }

    fn on_ack(&mut self, frame: AckFrame) {
        let Some(pos) = self
            .awaiting_ack
            .iter()
            .position(|w| w.packet.id == frame.packet_id)
        else {
            debug!(
                "Ignoring duplicate or unknown ack for packet {}",
                frame.packet_id
            );
            return;
        };
        let AckWait { mut packet, .. } = self.awaiting_ack.remove(pos);
        let status = frame.outcome.status();
        if !self.advance_status(&mut packet, status) {
            resolve(&mut packet, Err(LinkError::MessageDeliveryFailed));
            return;
        }
        match status {
            MessageStatus::Delivered | MessageStatus::Received => {
                self.stats.acked += 1;
                resolve(&mut packet, Ok(status));
            }
            _ => {
                self.stats.failed += 1;
                resolve(&mut packet, Err(LinkError::MessageDeliveryFailed));
            }
        }
    }

    fn on_ack_deadline(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut i = 0;
        while i < self.awaiting_ack.len() {
            if self.awaiting_ack[i].deadline <= now {
                expired.push(self.awaiting_ack.remove(i));
            } else {
                i += 1;
            }
        }

        for AckWait { mut packet, .. } in expired {
            if packet.retry_count < self.config.max_message_retries {
                packet.retry_count += 1;
                self.stats.retried += 1;
                info!(
                    "Packet {} unacknowledged; retry {} of {}",
                    packet.id, packet.retry_count, self.config.max_message_retries
                );
                // same id, same payload, fresh timers
                self.queue.push_front(packet);
            } else {
                warn!("Packet {} unacknowledged after retries", packet.id);
                self.fail_packet(packet, LinkError::MessageDeliveryFailed);
            }
        }
        self.maybe_send();
    }

    fn on_link_ready(&mut self) {
        self.link_ready = true;
        if !self.replay.is_empty() {
            info!(
                "Replaying {} tracked packets after reconnect",
                self.replay.len()
            );
            let replayed: Vec<PendingPacket> = self.replay.drain(..).collect();
            for (i, mut packet) in replayed.into_iter().enumerate() {
                packet.replayed = true;
                self.stats.replayed += 1;
                self.queue.insert(i, packet);
            }
        }
        self.maybe_send();
    }

    fn on_link_lost(&mut self) {
        self.link_ready = false;
        // any in-progress send completion is now stale
        self.send_token += 1;

        if let Some(packet) = self.sending.take() {
            if packet.tracked_for_ack && !packet.replayed {
                self.replay.push(packet);
            } else {
                self.fail_packet(packet, LinkError::LinkReset);
            }
        }

        let waiting: Vec<AckWait> = self.awaiting_ack.drain(..).collect();
        for AckWait { packet, .. } in waiting {
            if !packet.replayed {
                self.replay.push(packet);
            } else {
                self.fail_packet(packet, LinkError::LinkReset);
            }
        }

        // queued untracked entries flush with failure; tracked ones stay
        // queued and go out after reconnect
        let queued: Vec<PendingPacket> = self.queue.drain(..).collect();
        for packet in queued {
            if packet.tracked_for_ack {
                self.queue.push_back(packet);
            } else {
                self.fail_packet(packet, LinkError::LinkReset);
            }
        }
    }

    fn flush_all(&mut self, err: LinkError) {
        if let Some(mut packet) = self.sending.take() {
            resolve(&mut packet, Err(err.clone()));
        }
        for AckWait { mut packet, .. } in self.awaiting_ack.drain(..) {
            resolve(&mut packet, Err(err.clone()));
        }
        for mut packet in self.queue.drain(..) {
            resolve(&mut packet, Err(err.clone()));
        }
        for mut packet in self.replay.drain(..) {
            resolve(&mut packet, Err(err.clone()));
        }
    }

    fn advance_status(&mut self, packet: &mut PendingPacket, to: MessageStatus) -> bool {
        if packet.status.advance(to) {
            let _ = self.events_tx.send(DeliveryEvent {
                id: packet.id,
                status: to,
            });
            true
        } else {
            false
        }
    }

    fn fail_packet(&mut self, mut packet: PendingPacket, err: LinkError) {
        self.advance_status(&mut packet, MessageStatus::Failed);
        self.stats.failed += 1;
        resolve(&mut packet, Err(err));
    }
}
