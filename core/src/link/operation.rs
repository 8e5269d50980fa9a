//! Operation queue — serializes exclusive transport primitives
//!
//! The radio link is half duplex: exactly one primitive operation may be in
//! flight at any moment. This actor owns the FIFO, the single in-flight
//! slot, the per-operation timeout, and the bounded retry policy. Callers
//! get a future per operation and never block on the link themselves.
//!
//! Completion is tracked by a per-operation token, so a completion that
//! arrives after its timeout already fired (or after a reset) is discarded
//! instead of resolving whatever operation happens to be in flight next.

use crate::config::LinkConfig;
use crate::link::transport::{LinkError, Target, TransportLink};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Duration, Instant};
use tracing::{debug, warn};

/// What an operation does on the wire.
#[derive(Debug)]
pub enum OpKind {
    Write { payload: Vec<u8> },
    Read,
    SetNotify { enable: bool },
    ReliableWrite { payload: Vec<u8> },
}

/// Where an operation's outcome is delivered.
#[derive(Debug)]
enum OpSink {
    Ack(oneshot::Sender<Result<(), LinkError>>),
    Data(oneshot::Sender<Result<Vec<u8>, LinkError>>),
}

/// One exclusive transport operation. `attempt` starts at 1; Read and
/// ReliableWrite may be re-enqueued up to the configured cap.
#[derive(Debug)]
pub struct Operation {
    pub target: Target,
    pub kind: OpKind,
    pub attempt: u32,
    sink: OpSink,
}

impl Operation {
    fn succeed(self, data: Option<Vec<u8>>) {
        match self.sink {
            OpSink::Ack(tx) => {
                let _ = tx.send(Ok(()));
            }
            OpSink::Data(tx) => {
                let _ = tx.send(Ok(data.unwrap_or_default()));
            }
        }
    }

    fn fail(self, err: LinkError) {
        match self.sink {
            OpSink::Ack(tx) => {
                let _ = tx.send(Err(err));
            }
            OpSink::Data(tx) => {
                let _ = tx.send(Err(err));
            }
        }
    }

    fn retryable(&self) -> bool {
        matches!(self.kind, OpKind::Read | OpKind::ReliableWrite { .. })
    }
}

/// Raised to the lifecycle when local retry is no longer enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// A retryable operation exhausted its attempts
    RetriesExhausted { target: Target },
    /// A non-retryable operation (Write/SetNotify) failed outright
    OperationFailed { target: Target },
}

/// Queue counters, snapshot on request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub timeouts: u64,
    pub escalations: u64,
}

enum QueueCommand {
    Enqueue(Operation),
    RequeueFront(Operation),
    Reset,
    Stats(oneshot::Sender<QueueStats>),
    Shutdown,
}

/// Handle to the running queue task.
#[derive(Clone)]
pub struct OperationQueueHandle {
    tx: mpsc::UnboundedSender<QueueCommand>,
}

impl OperationQueueHandle {
    /// Spawn the queue actor over `transport`.
    pub fn spawn(
        transport: Arc<dyn TransportLink>,
        config: LinkConfig,
        escalation_tx: mpsc::UnboundedSender<Escalation>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let actor = QueueActor {
            transport,
            config,
            cmd_tx: cmd_tx.clone(),
            cmd_rx,
            done_tx,
            done_rx,
            queue: VecDeque::new(),
            in_flight: None,
            next_token: 0,
            escalation_tx,
            stats: QueueStats::default(),
        };
        tokio::spawn(actor.run());
        Self { tx: cmd_tx }
    }

    fn enqueue(&self, op: Operation) {
        if self.tx.send(QueueCommand::Enqueue(op)).is_err() {
            debug!("Operation queue is gone; enqueue dropped");
        }
    }

    /// Plain write. Not retried; a failure escalates.
    pub async fn write(&self, target: Target, payload: Vec<u8>) -> Result<(), LinkError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Operation {
            target,
            kind: OpKind::Write { payload },
            attempt: 1,
            sink: OpSink::Ack(tx),
        });
        rx.await.map_err(|_| LinkError::QueueClosed)?
    }

    /// Acknowledged multi-step write, retried with backoff.
    pub async fn reliable_write(&self, target: Target, payload: Vec<u8>) -> Result<(), LinkError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Operation {
            target,
            kind: OpKind::ReliableWrite { payload },
            attempt: 1,
            sink: OpSink::Ack(tx),
        });
        rx.await.map_err(|_| LinkError::QueueClosed)?
    }

    /// Read one buffered frame. An empty vec means nothing pending.
    pub async fn read(&self, target: Target) -> Result<Vec<u8>, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Operation {
            target,
            kind: OpKind::Read,
            attempt: 1,
            sink: OpSink::Data(tx),
        });
        rx.await.map_err(|_| LinkError::QueueClosed)?
    }

    /// Toggle notifications on a characteristic.
    pub async fn set_notify(&self, target: Target, enable: bool) -> Result<(), LinkError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Operation {
            target,
            kind: OpKind::SetNotify { enable },
            attempt: 1,
            sink: OpSink::Ack(tx),
        });
        rx.await.map_err(|_| LinkError::QueueClosed)?
    }

    /// Fail everything (queued and in flight) with `LinkReset` and empty
    /// the queue. Called on disconnect so the queue can never deadlock on a
    /// completion that will not arrive.
    pub fn reset(&self) {
        let _ = self.tx.send(QueueCommand::Reset);
    }

    pub async fn stats(&self) -> Result<QueueStats, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(QueueCommand::Stats(tx))
            .map_err(|_| LinkError::QueueClosed)?;
        rx.await.map_err(|_| LinkError::QueueClosed)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(QueueCommand::Shutdown);
    }
}

type OpOutcome = Result<Option<Vec<u8>>, LinkError>;

struct InFlight {
    token: u64,
    op: Operation,
    deadline: Instant,
}

struct QueueActor {
    transport: Arc<dyn TransportLink>,
    config: LinkConfig,
    cmd_tx: mpsc::UnboundedSender<QueueCommand>,
    cmd_rx: mpsc::UnboundedReceiver<QueueCommand>,
    done_tx: mpsc::UnboundedSender<(u64, OpOutcome)>,
    done_rx: mpsc::UnboundedReceiver<(u64, OpOutcome)>,
    queue: VecDeque<Operation>,
    in_flight: Option<InFlight>,
    next_token: u64,
    escalation_tx: mpsc::UnboundedSender<Escalation>,
    stats: QueueStats,
}

impl QueueActor {
    async fn run(mut self) {
        loop {
            let deadline = self
                .in_flight
                .as_ref()
                .map(|f| f.deadline)
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
                    Some(QueueCommand::Enqueue(op)) => {
                        self.queue.push_back(op);
                        self.start_next();
                    }
                    Some(QueueCommand::RequeueFront(op)) => {
                        self.queue.push_front(op);
                        self.start_next();
                    }
                    Some(QueueCommand::Reset) => self.reset(),
                    Some(QueueCommand::Stats(tx)) => {
                        let _ = tx.send(self.stats);
                    }
                    Some(QueueCommand::Shutdown) | None => {
                        self.reset();
                        break;
                    }
                },
                Some((token, outcome)) = self.done_rx.recv() => {
                    self.on_complete(token, outcome);
                }
                _ = sleep_until(deadline), if self.in_flight.is_some() => {
                    self.on_timeout();
                }
            }
        }
    }

    /// Dequeue and launch the next operation if the slot is free.
    fn start_next(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        let Some(op) = self.queue.pop_front() else {
            return;
        };

        let token = self.next_token;
        self.next_token += 1;

        let transport = Arc::clone(&self.transport);
        let done_tx = self.done_tx.clone();
        let target = op.target;
        let call = match &op.kind {
            OpKind::Write { payload } => Call::Write(payload.clone()),
            OpKind::Read => Call::Read,
            OpKind::SetNotify { enable } => Call::SetNotify(*enable),
            OpKind::ReliableWrite { payload } => Call::Reliable(payload.clone()),
        };
        tokio::spawn(async move {
            let outcome: OpOutcome = match call {
                Call::Write(data) => transport.perform_write(target, &data).await.map(|_| None),
                Call::Read => transport.perform_read(target).await.map(Some),
                Call::SetNotify(enable) => {
                    transport.set_notify(target, enable).await.map(|_| None)
                }
                Call::Reliable(data) => transport
                    .perform_reliable_write(target, &data)
                    .await
                    .map(|_| None),
            };
            let _ = done_tx.send((token, outcome));
        });

        let deadline = Instant::now() + self.config.op_timeout;
        self.in_flight = Some(InFlight { token, op, deadline });
    }

    fn on_complete(&mut self, token: u64, outcome: OpOutcome) {
        let Some(inflight) = self.in_flight.take() else {
            debug!("Stale operation completion discarded (no operation in flight)");
            return;
        };
        if inflight.token != token {
            // completion for an operation that already timed out or was reset
            debug!("Stale operation completion discarded (token mismatch)");
            self.in_flight = Some(inflight);
            return;
        }

        match outcome {
            Ok(data) => {
                self.stats.completed += 1;
                inflight.op.succeed(data);
                self.start_next();
            }
            Err(err) => self.on_failure(inflight.op, err),
        }
    }

    fn on_timeout(&mut self) {
        let Some(inflight) = self.in_flight.take() else {
            return;
        };
        debug!(
            "Operation on {} timed out (attempt {})",
            inflight.op.target, inflight.op.attempt
        );
        // the late completion, if it ever arrives, carries a stale token
        self.on_failure(inflight.op, LinkError::OperationTimeout);
    }

    fn on_failure(&mut self, op: Operation, err: LinkError) {
        if err == LinkError::OperationTimeout {
            self.stats.timeouts += 1;
        }

        // Link torn down mid-operation: fail fast, no retry, no escalation —
        // the lifecycle already knows.
        if err == LinkError::TransportUnavailable {
            warn!("Operation on {} failed: transport unavailable", op.target);
            self.stats.failed += 1;
            op.fail(err);
            self.start_next();
            return;
        }

        if op.retryable() && op.attempt < self.config.max_op_attempts {
            self.stats.retried += 1;
            debug!(
                "Retrying operation on {} (attempt {} of {}): {}",
                op.target,
                op.attempt + 1,
                self.config.max_op_attempts,
                err
            );
            let next = Operation {
                attempt: op.attempt + 1,
                ..op
            };
            if matches!(next.kind, OpKind::ReliableWrite { .. }) {
                let tx = self.cmd_tx.clone();
                let backoff = self.config.reliable_write_backoff;
                tokio::spawn(async move {
                    sleep(backoff).await;
                    let _ = tx.send(QueueCommand::RequeueFront(next));
                });
            } else {
                self.queue.push_front(next);
            }
            self.start_next();
            return;
        }

        let escalation = if op.retryable() {
            warn!(
                "Operation on {} exhausted {} attempts: {}",
                op.target, op.attempt, err
            );
            Escalation::RetriesExhausted { target: op.target }
        } else {
            warn!("Operation on {} failed: {}", op.target, err);
            Escalation::OperationFailed { target: op.target }
        };
        self.stats.failed += 1;
        self.stats.escalations += 1;
        let _ = self.escalation_tx.send(escalation);
        op.fail(err);
        self.start_next();
    }

    fn reset(&mut self) {
        let drained = self.queue.len();
        if let Some(inflight) = self.in_flight.take() {
            inflight.op.fail(LinkError::LinkReset);
        }
        for op in self.queue.drain(..) {
            op.fail(LinkError::LinkReset);
        }
        if drained > 0 {
            debug!("Operation queue reset; {} queued operations failed", drained);
        }
        // in-flight slot is cleared unconditionally above; any late
        // completion is filtered by its stale token
    }
}

enum Call {
    Write(Vec<u8>),
    Read,
    SetNotify(bool),
    Reliable(Vec<u8>),
}
