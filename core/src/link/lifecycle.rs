//! Connection lifecycle — bring-up state machine and reconnect policy
//!
//! One actor owns the link state. Each bring-up attempt runs in its own
//! driver task carrying an attempt token; the actor discards any phase or
//! completion report whose token is stale, so a disconnect racing a
//! bring-up can never resurrect a dead attempt. Link-up and authorization
//! events are forwarded to the running driver through a gate channel.
//!
//! Bring-up order is fixed: connect, link-up/authorization gate, optional
//! cache invalidation (quirk), parameter negotiation (skippable quirk,
//! retried once then abandoned), service resolution (non-negotiable),
//! backlog drain, application handshake, and notifications enabled last.
//! Enabling notifications before the drain would interleave stale frames
//! with live traffic.

use crate::config::LinkConfig;
use crate::link::operation::{Escalation, OperationQueueHandle};
use crate::link::quirks::{DeviceQuirks, QuirkTable};
use crate::link::transport::{
    ConnectionState, DisconnectReason, HandshakeStage, LinkError, LinkEvent, LinkEventReceiver,
    LinkPhase, LinkTarget, Target, TransportLink,
};
use crate::message::delivery::PacketQueueHandle;
use crate::message::notify::NotificationDispatcher;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, timeout_at, Duration, Instant};
use tracing::{debug, info, warn};

pub(crate) enum LifecycleCommand {
    Connect(LinkTarget),
    ForceReconnect,
    Shutdown,
}

/// Handle to the lifecycle actor plus its observable state channels.
#[derive(Clone)]
pub(crate) struct LifecycleHandle {
    tx: mpsc::UnboundedSender<LifecycleCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    phase_rx: watch::Receiver<LinkPhase>,
}

impl LifecycleHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        transport: Arc<dyn TransportLink>,
        events: LinkEventReceiver,
        config: LinkConfig,
        quirks: Arc<QuirkTable>,
        ops: OperationQueueHandle,
        delivery: PacketQueueHandle,
        dispatcher: Arc<NotificationDispatcher>,
        escalations: mpsc::UnboundedReceiver<Escalation>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (phase_tx, phase_rx) = watch::channel(LinkPhase::Idle);
        let (bringup_tx, bringup_rx) = mpsc::unbounded_channel();
        let actor = LifecycleActor {
            transport,
            config,
            quirks,
            ops,
            delivery,
            dispatcher,
            cmd_rx,
            events,
            events_closed: false,
            escalations,
            escalations_closed: false,
            bringup_tx,
            bringup_rx,
            state_tx,
            phase_tx,
            target: None,
            attempt_token: 0,
            gate_tx: None,
            reconnect_at: None,
            reconnect_attempt: 0,
            ready: false,
        };
        tokio::spawn(actor.run());
        Self {
            tx: cmd_tx,
            state_rx,
            phase_rx,
        }
    }

    pub(crate) fn connect(&self, target: LinkTarget) {
        let _ = self.tx.send(LifecycleCommand::Connect(target));
    }

    pub(crate) fn force_reconnect(&self) {
        let _ = self.tx.send(LifecycleCommand::ForceReconnect);
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(LifecycleCommand::Shutdown);
    }

    pub(crate) fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub(crate) fn phase(&self) -> watch::Receiver<LinkPhase> {
        self.phase_rx.clone()
    }
}

enum BringupMsg {
    Phase(u64, LinkPhase),
    Done(u64, Result<(), LinkError>),
}

struct LifecycleActor {
    transport: Arc<dyn TransportLink>,
    config: LinkConfig,
    quirks: Arc<QuirkTable>,
    ops: OperationQueueHandle,
    delivery: PacketQueueHandle,
    dispatcher: Arc<NotificationDispatcher>,
    cmd_rx: mpsc::UnboundedReceiver<LifecycleCommand>,
    events: LinkEventReceiver,
    events_closed: bool,
    escalations: mpsc::UnboundedReceiver<Escalation>,
    escalations_closed: bool,
    bringup_tx: mpsc::UnboundedSender<BringupMsg>,
    bringup_rx: mpsc::UnboundedReceiver<BringupMsg>,
    state_tx: watch::Sender<ConnectionState>,
    phase_tx: watch::Sender<LinkPhase>,
    target: Option<LinkTarget>,
    /// Bumped on every bring-up and teardown; stale reports are discarded.
    attempt_token: u64,
    gate_tx: Option<mpsc::UnboundedSender<LinkEvent>>,
    reconnect_at: Option<Instant>,
    reconnect_attempt: u32,
    ready: bool,
}

impl LifecycleActor {
    async fn run(mut self) {
        loop {
            let reconnect_due = self.reconnect_at;
            let sleep_to =
                reconnect_due.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
                    Some(LifecycleCommand::Connect(target)) => self.on_connect(target),
                    Some(LifecycleCommand::ForceReconnect) => self.on_force_reconnect().await,
                    Some(LifecycleCommand::Shutdown) | None => {
                        self.on_shutdown().await;
                        break;
                    }
                },
                maybe_event = self.events.recv(), if !self.events_closed => match maybe_event {
                    Some(event) => self.on_link_event(event).await,
                    None => {
                        warn!("Transport event stream closed");
                        self.events_closed = true;
                    }
                },
                Some(msg) = self.bringup_rx.recv() => self.on_bringup_msg(msg).await,
                maybe_esc = self.escalations.recv(), if !self.escalations_closed => match maybe_esc {
                    Some(escalation) => self.on_escalation(escalation).await,
                    None => self.escalations_closed = true,
                },
                _ = sleep_until(sleep_to), if reconnect_due.is_some() => {
                    self.reconnect_at = None;
                    self.start_bringup();
                }
            }
        }
    }

    fn on_connect(&mut self, target: LinkTarget) {
        info!("Connecting to {}", target.address);
        self.target = Some(target);
        self.reconnect_at = None;
        self.reconnect_attempt = 0;
        self.start_bringup();
    }

    async fn on_force_reconnect(&mut self) {
        if self.target.is_none() {
            debug!("Force-reconnect with no target; ignored");
            return;
        }
        if self.ready || self.gate_tx.is_some() {
            self.teardown();
            let _ = self.transport.disconnect().await;
        }
        self.reconnect_at = None;
        self.reconnect_attempt = 0;
        self.start_bringup();
    }

    async fn on_shutdown(&mut self) {
        self.teardown();
        let _ = self.transport.disconnect().await;
        self.ops.shutdown();
        self.delivery.shutdown();
    }

    fn start_bringup(&mut self) {
        let Some(target) = self.target.clone() else {
            return;
        };
        self.attempt_token += 1;
        self.ready = false;
        let (gate_tx, gate_rx) = mpsc::unbounded_channel();
        self.gate_tx = Some(gate_tx);
        let _ = self.state_tx.send(ConnectionState::Connecting);
        let _ = self.phase_tx.send(LinkPhase::Connecting);

        let driver = BringupDriver {
            transport: self.transport.clone(),
            ops: self.ops.clone(),
            dispatcher: self.dispatcher.clone(),
            config: self.config.clone(),
            quirks: self.quirks.classify(&target),
            target,
            token: self.attempt_token,
            gate_rx,
            report: self.bringup_tx.clone(),
        };
        tokio::spawn(driver.run());
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Notification { topic, data } => {
                self.dispatcher.dispatch(&topic, &data);
            }
            LinkEvent::Disconnected { reason } => self.on_disconnected(reason).await,
            gate_event => {
                if let Some(gate) = &self.gate_tx {
                    let _ = gate.send(gate_event);
                } else {
                    debug!("Link event outside bring-up ignored: {:?}", gate_event);
                }
            }
        }
    }

    async fn on_disconnected(&mut self, reason: DisconnectReason) {
        if !self.ready && self.gate_tx.is_none() {
            debug!("Disconnect ({}) with no active link; ignored", reason);
            return;
        }
        info!("Link dropped: {}", reason);
        self.teardown();

        match reason {
            DisconnectReason::AuthDeclined => {
                self.fail(reason.to_string());
            }
            DisconnectReason::StaleCache => {
                // drop the bad attribute table, then retry right away
                if let Err(err) = self.transport.invalidate_cache().await {
                    debug!("Cache invalidation unavailable: {}", err);
                }
                self.schedule_reconnect_in(Duration::ZERO);
            }
            DisconnectReason::PersistentStackFault => {
                // a plain reconnect is known not to clear this category
                if let Err(err) = self.transport.restart_stack().await {
                    warn!("Stack restart failed: {}", err);
                }
                self.schedule_reconnect();
            }
            DisconnectReason::LostConnection | DisconnectReason::Other(_) => {
                self.schedule_reconnect();
            }
        }
    }

    async fn on_bringup_msg(&mut self, msg: BringupMsg) {
        match msg {
            BringupMsg::Phase(token, phase) if token == self.attempt_token => {
                let _ = self.phase_tx.send(phase);
            }
            BringupMsg::Done(token, result) if token == self.attempt_token => {
                self.gate_tx = None;
                match result {
                    Ok(()) => {
                        let endpoint = self
                            .target
                            .as_ref()
                            .map(|t| t.address.clone())
                            .unwrap_or_default();
                        info!("Link to {} ready", endpoint);
                        self.reconnect_attempt = 0;
                        self.ready = true;
                        let _ = self.phase_tx.send(LinkPhase::Ready);
                        let _ = self.state_tx.send(ConnectionState::Connected { endpoint });
                        self.delivery.link_ready();
                    }
                    Err(err) => {
                        warn!("Bring-up failed: {}", err);
                        let _ = self.transport.disconnect().await;
                        let _ = self.phase_tx.send(LinkPhase::Failed);
                        let terminal = matches!(
                            err,
                            LinkError::HandshakeFailed(HandshakeStage::Authorization)
                                | LinkError::HandshakeFailed(HandshakeStage::ServiceResolution)
                        );
                        if terminal {
                            self.fail(err.to_string());
                        } else {
                            self.schedule_reconnect();
                        }
                    }
                }
            }
            _ => debug!("Stale bring-up report discarded"),
        }
    }

    async fn on_escalation(&mut self, escalation: Escalation) {
        if !self.ready {
            debug!("Escalation while not ready; bring-up will surface it");
            return;
        }
        let target = match escalation {
            Escalation::RetriesExhausted { target } => target,
            Escalation::OperationFailed { target } => target,
        };
        warn!("Operation escalation on {}; recycling the link", target);
        self.teardown();
        let _ = self.transport.disconnect().await;
        self.schedule_reconnect();
    }

    /// Invalidate the current attempt and flush both queues.
    fn teardown(&mut self) {
        self.attempt_token += 1;
        self.gate_tx = None;
        self.ready = false;
        self.ops.reset();
        self.delivery.link_lost();
        let _ = self.state_tx.send(ConnectionState::Disconnected);
        let _ = self.phase_tx.send(LinkPhase::Disconnected);
    }

    fn fail(&mut self, reason: String) {
        warn!("Link failed: {}", reason);
        self.reconnect_at = None;
        let _ = self.phase_tx.send(LinkPhase::Failed);
        let _ = self.state_tx.send(ConnectionState::Failed { reason });
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.config.reconnect_backoff(self.reconnect_attempt + 1);
        self.schedule_reconnect_in(delay);
    }

    /// Idempotent: a reconnect already on the timer absorbs later requests.
    fn schedule_reconnect_in(&mut self, delay: Duration) {
        if self.target.is_none() {
            return;
        }
        if self.reconnect_at.is_some() {
            debug!("Reconnect already scheduled");
            return;
        }
        self.reconnect_attempt += 1;
        if self.reconnect_attempt > self.config.max_reconnect_attempts {
            self.fail(format!(
                "gave up after {} reconnect attempts",
                self.config.max_reconnect_attempts
            ));
            return;
        }
        info!(
            "Reconnect attempt {} of {} in {:?}",
            self.reconnect_attempt, self.config.max_reconnect_attempts, delay
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }
}

/// One bring-up attempt, start to Ready, in its own task.
struct BringupDriver {
    transport: Arc<dyn TransportLink>,
    ops: OperationQueueHandle,
    dispatcher: Arc<NotificationDispatcher>,
    config: LinkConfig,
    quirks: DeviceQuirks,
    target: LinkTarget,
    token: u64,
    gate_rx: mpsc::UnboundedReceiver<LinkEvent>,
    report: mpsc::UnboundedSender<BringupMsg>,
}

impl BringupDriver {
    async fn run(mut self) {
        let result = self.bring_up().await;
        let _ = self.report.send(BringupMsg::Done(self.token, result));
    }

    fn phase(&self, phase: LinkPhase) {
        let _ = self.report.send(BringupMsg::Phase(self.token, phase));
    }

    async fn bring_up(&mut self) -> Result<(), LinkError> {
        let deadline = Instant::now() + self.config.connect_timeout;
        timeout_at(deadline, self.transport.connect(&self.target))
            .await
            .map_err(|_| LinkError::HandshakeFailed(HandshakeStage::Connect))??;
        self.await_link_up(deadline).await?;
        self.phase(LinkPhase::LinkEstablished);

        if self.quirks.invalidate_cache_on_connect {
            match self.transport.invalidate_cache().await {
                Ok(()) => info!("Attribute cache invalidated for {}", self.target.address),
                Err(LinkError::Unsupported(what)) => {
                    debug!("Driver cannot {}; continuing", what)
                }
                Err(err) => warn!("Cache invalidation failed: {}; continuing", err),
            }
        }

        // negotiation failure is not fatal; the default unit still works
        if !self.quirks.skip_mtu_negotiation {
            self.phase(LinkPhase::ParameterNegotiation);
            self.negotiate_unit().await;
        }

        self.phase(LinkPhase::ServiceResolution);
        let services = self
            .transport
            .resolve_services()
            .await
            .map_err(|_| LinkError::HandshakeFailed(HandshakeStage::ServiceResolution))?;
        if let Some(missing) =
            services.missing(&[Target::Inbound, Target::Outbound, Target::Config])
        {
            warn!("Required endpoint {} missing after resolution", missing);
            return Err(LinkError::HandshakeFailed(HandshakeStage::ServiceResolution));
        }

        self.phase(LinkPhase::BacklogDrain);
        self.drain_backlog().await?;

        self.phase(LinkPhase::HandshakeInProgress);
        self.handshake().await?;

        // notifications last, so live frames cannot interleave with the
        // drain or the handshake exchange
        self.ops
            .set_notify(Target::Inbound, true)
            .await
            .map_err(|_| LinkError::HandshakeFailed(HandshakeStage::Handshake))?;
        Ok(())
    }

    /// Wait out the link-up / authorization gate.
    async fn await_link_up(&mut self, deadline: Instant) -> Result<(), LinkError> {
        loop {
            let event = timeout_at(deadline, self.gate_rx.recv())
                .await
                .map_err(|_| LinkError::HandshakeFailed(HandshakeStage::Connect))?
                .ok_or(LinkError::LinkReset)?;
            match event {
                LinkEvent::LinkUp => return Ok(()),
                LinkEvent::AuthRequired => {
                    info!("Authorization pending for {}", self.target.address);
                }
                LinkEvent::AuthResult { accepted: true } => {
                    debug!("Authorization accepted");
                }
                LinkEvent::AuthResult { accepted: false } => {
                    return Err(LinkError::HandshakeFailed(HandshakeStage::Authorization));
                }
                other => debug!("Unexpected event during link-up gate: {:?}", other),
            }
        }
    }

    async fn negotiate_unit(&self) {
        let requested = self.config.mtu_request;
        match self.transport.negotiate_mtu(requested).await {
            Ok(granted) => debug!("Negotiated transfer unit of {}", granted),
            Err(first) => match self.transport.negotiate_mtu(requested).await {
                Ok(granted) => debug!("Negotiated transfer unit of {} on retry", granted),
                Err(_) => warn!(
                    "Parameter negotiation failed twice ({}); keeping the default unit",
                    first
                ),
            },
        }
    }

    /// Read out frames buffered on the peer before the handshake. Bounded
    /// so a chatty peer cannot wedge bring-up.
    async fn drain_backlog(&mut self) -> Result<(), LinkError> {
        let mut drained = 0u32;
        while drained < self.config.max_drain_reads {
            let frame = self
                .ops
                .read(Target::Inbound)
                .await
                .map_err(|_| LinkError::HandshakeFailed(HandshakeStage::BacklogDrain))?;
            if frame.is_empty() {
                break;
            }
            drained += 1;
            self.dispatcher.dispatch(&self.config.inbound_topic, &frame);
            sleep(self.config.drain_interval).await;
        }
        if drained > 0 {
            info!("Drained {} buffered frames", drained);
        }
        Ok(())
    }

    /// Write the handshake request, then poll until the completion token
    /// comes back.
    async fn handshake(&mut self) -> Result<(), LinkError> {
        self.ops
            .write(Target::Config, self.config.handshake_request.clone())
            .await
            .map_err(|_| LinkError::HandshakeFailed(HandshakeStage::Handshake))?;

        let mut reads = 0u32;
        loop {
            let frame = self
                .ops
                .read(Target::Config)
                .await
                .map_err(|_| LinkError::HandshakeFailed(HandshakeStage::Handshake))?;
            if frame == self.config.handshake_token {
                return Ok(());
            }
            reads += 1;
            if reads >= self.config.max_drain_reads {
                return Err(LinkError::HandshakeFailed(HandshakeStage::Handshake));
            }
            sleep(self.config.drain_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::transport::MockTransportLink;
    use crate::message::delivery::PacketQueueHandle;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::time::timeout;

    struct Fixture {
        handle: LifecycleHandle,
        events_tx: mpsc::UnboundedSender<LinkEvent>,
        esc_tx: mpsc::UnboundedSender<Escalation>,
    }

    fn start(mock: MockTransportLink) -> Fixture {
        start_with_quirks(mock, QuirkTable::new())
    }

    fn start_with_quirks(mock: MockTransportLink, quirks: QuirkTable) -> Fixture {
        let transport: Arc<dyn TransportLink> = Arc::new(mock);
        let config = LinkConfig::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (esc_tx, esc_rx) = mpsc::unbounded_channel();
        let (ops_esc_tx, _ops_esc_rx) = mpsc::unbounded_channel();
        let ops = OperationQueueHandle::spawn(transport.clone(), config.clone(), ops_esc_tx);
        let (delivery, _delivery_events) = PacketQueueHandle::spawn(ops.clone(), config.clone());
        let handle = LifecycleHandle::spawn(
            transport,
            events_rx,
            config,
            Arc::new(quirks),
            ops,
            delivery,
            Arc::new(NotificationDispatcher::new()),
            esc_rx,
        );
        Fixture {
            handle,
            events_tx,
            esc_tx,
        }
    }

    /// Expectations for a clean bring-up: negotiation, resolution, empty
    /// drain, handshake exchange, notify enable.
    fn expect_happy_bringup(mock: &mut MockTransportLink, times: usize) {
        let config = LinkConfig::default();
        mock.expect_negotiate_mtu()
            .times(times)
            .returning(|req| Ok(req));
        mock.expect_resolve_services().times(times).returning(|| {
            Ok(crate::link::transport::ServiceMap::new([
                Target::Inbound,
                Target::Outbound,
                Target::Config,
            ]))
        });
        let token = config.handshake_token.clone();
        mock.expect_perform_read().returning(move |dest| match dest {
            Target::Config => Ok(token.clone()),
            _ => Ok(Vec::new()),
        });
        mock.expect_perform_write().returning(|_, _| Ok(()));
        mock.expect_set_notify()
            .times(times)
            .returning(|_, _| Ok(()));
    }

    async fn wait_connected(fixture: &Fixture) {
        let mut state = fixture.handle.state();
        timeout(
            Duration::from_secs(120),
            state.wait_for(|s| matches!(s, ConnectionState::Connected { .. })),
        )
        .await
        .expect("timed out waiting for Connected")
        .expect("state channel closed");
    }

    async fn settle() {
        // paused clock: a short sleep lets every runnable task drain
        sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bringup_reaches_ready() {
        let mut mock = MockTransportLink::new();
        mock.expect_connect().times(1).returning(|_| Ok(()));
        mock.expect_disconnect().returning(|| Ok(()));
        expect_happy_bringup(&mut mock, 1);
        let fixture = start(mock);

        fixture.handle.connect(LinkTarget::new("aa:bb"));
        settle().await;
        fixture.events_tx.send(LinkEvent::LinkUp).unwrap();

        wait_connected(&fixture).await;
        assert_eq!(*fixture.handle.phase().borrow(), LinkPhase::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_declined_is_terminal() {
        let mut mock = MockTransportLink::new();
        mock.expect_connect().times(1).returning(|_| Ok(()));
        mock.expect_disconnect().returning(|| Ok(()));
        let fixture = start(mock);

        fixture.handle.connect(LinkTarget::new("aa:bb"));
        settle().await;
        fixture.events_tx.send(LinkEvent::AuthRequired).unwrap();
        fixture
            .events_tx
            .send(LinkEvent::AuthResult { accepted: false })
            .unwrap();

        let mut state = fixture.handle.state();
        timeout(
            Duration::from_secs(120),
            state.wait_for(|s| matches!(s, ConnectionState::Failed { .. })),
        )
        .await
        .expect("timed out waiting for Failed")
        .expect("state channel closed");

        // no reconnect: connect() stays at one call even past the backoff
        sleep(Duration::from_secs(30)).await;
        assert!(matches!(
            &*fixture.handle.state().borrow(),
            ConnectionState::Failed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_cache_invalidates_then_reconnects() {
        let mut mock = MockTransportLink::new();
        mock.expect_connect().times(2).returning(|_| Ok(()));
        mock.expect_disconnect().returning(|| Ok(()));
        mock.expect_invalidate_cache().times(1).returning(|| Ok(()));
        expect_happy_bringup(&mut mock, 2);
        let fixture = start(mock);

        fixture.handle.connect(LinkTarget::new("aa:bb"));
        settle().await;
        fixture.events_tx.send(LinkEvent::LinkUp).unwrap();
        wait_connected(&fixture).await;

        fixture
            .events_tx
            .send(LinkEvent::Disconnected {
                reason: DisconnectReason::StaleCache,
            })
            .unwrap();
        settle().await;
        fixture.events_tx.send(LinkEvent::LinkUp).unwrap();
        wait_connected(&fixture).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stack_fault_restarts_stack_before_reconnect() {
        let mut mock = MockTransportLink::new();
        mock.expect_connect().times(2).returning(|_| Ok(()));
        mock.expect_disconnect().returning(|| Ok(()));
        mock.expect_restart_stack().times(1).returning(|| Ok(()));
        expect_happy_bringup(&mut mock, 2);
        let fixture = start(mock);

        fixture.handle.connect(LinkTarget::new("aa:bb"));
        settle().await;
        fixture.events_tx.send(LinkEvent::LinkUp).unwrap();
        wait_connected(&fixture).await;

        fixture
            .events_tx
            .send(LinkEvent::Disconnected {
                reason: DisconnectReason::PersistentStackFault,
            })
            .unwrap();
        // past the first backoff step
        sleep(Duration::from_secs(2)).await;
        fixture.events_tx.send(LinkEvent::LinkUp).unwrap();
        wait_connected(&fixture).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_disconnects_schedule_one_reconnect() {
        let mut mock = MockTransportLink::new();
        // exactly two: the original bring-up and one reconnect
        mock.expect_connect().times(2).returning(|_| Ok(()));
        mock.expect_disconnect().returning(|| Ok(()));
        expect_happy_bringup(&mut mock, 2);
        let fixture = start(mock);

        fixture.handle.connect(LinkTarget::new("aa:bb"));
        settle().await;
        fixture.events_tx.send(LinkEvent::LinkUp).unwrap();
        wait_connected(&fixture).await;

        for _ in 0..3 {
            fixture
                .events_tx
                .send(LinkEvent::Disconnected {
                    reason: DisconnectReason::LostConnection,
                })
                .unwrap();
        }
        sleep(Duration::from_secs(2)).await;
        fixture.events_tx.send(LinkEvent::LinkUp).unwrap();
        wait_connected(&fixture).await;
        sleep(Duration::from_secs(30)).await; // mockall asserts connect count
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalation_recycles_the_link() {
        let mut mock = MockTransportLink::new();
        mock.expect_connect().times(2).returning(|_| Ok(()));
        mock.expect_disconnect().returning(|| Ok(()));
        expect_happy_bringup(&mut mock, 2);
        let fixture = start(mock);

        fixture.handle.connect(LinkTarget::new("aa:bb"));
        settle().await;
        fixture.events_tx.send(LinkEvent::LinkUp).unwrap();
        wait_connected(&fixture).await;

        fixture
            .esc_tx
            .send(Escalation::RetriesExhausted {
                target: Target::Outbound,
            })
            .unwrap();
        sleep(Duration::from_secs(2)).await;
        fixture.events_tx.send(LinkEvent::LinkUp).unwrap();
        wait_connected(&fixture).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_failure_does_not_block_bringup() {
        let mut mock = MockTransportLink::new();
        mock.expect_connect().times(1).returning(|_| Ok(()));
        mock.expect_disconnect().returning(|| Ok(()));
        // both the attempt and its single retry fail
        mock.expect_negotiate_mtu()
            .times(2)
            .returning(|_| Err(LinkError::OperationFailed(1)));
        mock.expect_resolve_services().times(1).returning(|| {
            Ok(crate::link::transport::ServiceMap::new([
                Target::Inbound,
                Target::Outbound,
                Target::Config,
            ]))
        });
        let token = LinkConfig::default().handshake_token;
        mock.expect_perform_read().returning(move |dest| match dest {
            Target::Config => Ok(token.clone()),
            _ => Ok(Vec::new()),
        });
        mock.expect_perform_write().returning(|_, _| Ok(()));
        mock.expect_set_notify().times(1).returning(|_, _| Ok(()));
        let fixture = start(mock);

        fixture.handle.connect(LinkTarget::new("aa:bb"));
        settle().await;
        fixture.events_tx.send(LinkEvent::LinkUp).unwrap();
        wait_connected(&fixture).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_service_fails_terminally() {
        let mut mock = MockTransportLink::new();
        mock.expect_connect().times(1).returning(|_| Ok(()));
        mock.expect_disconnect().returning(|| Ok(()));
        mock.expect_negotiate_mtu().returning(|req| Ok(req));
        mock.expect_resolve_services().times(1).returning(|| {
            Ok(crate::link::transport::ServiceMap::new([Target::Inbound]))
        });
        let fixture = start(mock);

        fixture.handle.connect(LinkTarget::new("aa:bb"));
        settle().await;
        fixture.events_tx.send(LinkEvent::LinkUp).unwrap();

        let mut state = fixture.handle.state();
        timeout(
            Duration::from_secs(120),
            state.wait_for(|s| matches!(s, ConnectionState::Failed { .. })),
        )
        .await
        .expect("timed out waiting for Failed")
        .expect("state channel closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_drains_before_notifications_enable() {
        let calls: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let backlog: Arc<Mutex<VecDeque<Vec<u8>>>> = Arc::new(Mutex::new(VecDeque::from([
            b"stale-1".to_vec(),
            b"stale-2".to_vec(),
        ])));

        let mut mock = MockTransportLink::new();
        mock.expect_connect().times(1).returning(|_| Ok(()));
        mock.expect_disconnect().returning(|| Ok(()));
        mock.expect_negotiate_mtu().returning(|req| Ok(req));
        mock.expect_resolve_services().returning(|| {
            Ok(crate::link::transport::ServiceMap::new([
                Target::Inbound,
                Target::Outbound,
                Target::Config,
            ]))
        });
        let token = LinkConfig::default().handshake_token;
        let read_calls = calls.clone();
        let read_backlog = backlog.clone();
        mock.expect_perform_read().returning(move |dest| match dest {
            Target::Inbound => {
                let frame = read_backlog.lock().pop_front().unwrap_or_default();
                if !frame.is_empty() {
                    read_calls.lock().push("drain");
                }
                Ok(frame)
            }
            _ => Ok(token.clone()),
        });
        let write_calls = calls.clone();
        mock.expect_perform_write().returning(move |_, _| {
            write_calls.lock().push("handshake");
            Ok(())
        });
        let notify_calls = calls.clone();
        mock.expect_set_notify().returning(move |_, _| {
            notify_calls.lock().push("notify");
            Ok(())
        });
        let fixture = start(mock);

        fixture.handle.connect(LinkTarget::new("aa:bb"));
        settle().await;
        fixture.events_tx.send(LinkEvent::LinkUp).unwrap();
        wait_connected(&fixture).await;

        assert_eq!(
            *calls.lock(),
            vec!["drain", "drain", "handshake", "notify"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_quirk_invalidates_cache_during_bringup() {
        let mut mock = MockTransportLink::new();
        mock.expect_connect().times(1).returning(|_| Ok(()));
        mock.expect_disconnect().returning(|| Ok(()));
        mock.expect_invalidate_cache().times(1).returning(|| Ok(()));
        // the same quirk family also skips negotiation
        mock.expect_negotiate_mtu().times(0);
        mock.expect_resolve_services().returning(|| {
            Ok(crate::link::transport::ServiceMap::new([
                Target::Inbound,
                Target::Outbound,
                Target::Config,
            ]))
        });
        let token = LinkConfig::default().handshake_token;
        mock.expect_perform_read().returning(move |dest| match dest {
            Target::Config => Ok(token.clone()),
            _ => Ok(Vec::new()),
        });
        mock.expect_perform_write().returning(|_, _| Ok(()));
        mock.expect_set_notify().returning(|_, _| Ok(()));

        let quirks = QuirkTable::new();
        quirks.add_rule(
            crate::link::quirks::DeviceMatcher::NamePrefix("Legacy".into()),
            DeviceQuirks {
                invalidate_cache_on_connect: true,
                skip_mtu_negotiation: true,
            },
        );
        let fixture = start_with_quirks(mock, quirks);

        fixture
            .handle
            .connect(LinkTarget::named("aa:bb", "Legacy-Node"));
        settle().await;
        fixture.events_tx.send(LinkEvent::LinkUp).unwrap();
        wait_connected(&fixture).await;
    }
}
