//! Link supervisor: keep-alive pings and automatic reconnect.

use crate::config::SupervisorConfig;
use crate::core::{LinkEvent, LinkState};
use crate::error::LinkError;
use crate::link::{ConnectOutcome, Link};
use crate::transport::PumpTransport;
use danalink_protocol::packet::opcode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Keeps a [`Link`] connected.
///
/// Reconnects after unexpected disconnects, never after [`disconnect`]
/// or a fault that requires re-bonding. Pings the pump with
/// KEEP_CONNECTION while the link is idle.
///
/// [`disconnect`]: Supervisor::disconnect
pub struct Supervisor<T: PumpTransport> {
    link: Link<T>,
    config: SupervisorConfig,
    user_disconnect: AtomicBool,
    rebond_required: AtomicBool,
    shutdown: AtomicBool,
    notify: Notify,
}

impl<T: PumpTransport> Supervisor<T> {
    pub fn new(link: Link<T>, config: SupervisorConfig) -> Self {
        Self {
            link,
            config,
            user_disconnect: AtomicBool::new(false),
            rebond_required: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn link(&self) -> &Link<T> {
        &self.link
    }

    /// Returns whether the last fault requires forgetting the bond.
    pub fn is_rebond_required(&self) -> bool {
        self.rebond_required.load(Ordering::Relaxed)
    }

    /// Connects the link and re-enables automatic reconnect.
    pub async fn connect(&self) -> Result<ConnectOutcome, LinkError> {
        self.user_disconnect.store(false, Ordering::Relaxed);
        self.rebond_required.store(false, Ordering::Relaxed);
        self.link.connect().await
    }

    /// Disconnects the link. No reconnect follows until [`connect`](Self::connect).
    pub async fn disconnect(&self) {
        self.user_disconnect.store(true, Ordering::Relaxed);
        self.link.disconnect().await;
    }

    /// Spawns the supervision loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        // subscribe before spawning so no disconnect slips past
        let events = self.link.subscribe();
        let established = self.link.state() == LinkState::Connected;
        let this = Arc::clone(self);
        tokio::spawn(async move { this.supervise(events, established).await })
    }

    /// `established` tracks whether the link was up, since only a link
    /// that was up gets reconnected.
    async fn supervise(&self, mut events: broadcast::Receiver<LinkEvent>, mut established: bool) {
        tracing::info!(
            "Link supervisor started (keepalive={}s, reconnect_delay={}ms)",
            self.config.keepalive_secs,
            self.config.reconnect_delay_ms
        );

        let mut keepalive = tokio::time::interval(self.config.keepalive_interval());
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.tick().await;

        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = keepalive.tick() => self.keepalive().await,
                event = events.recv() => match event {
                    Ok(LinkEvent::StateChanged(LinkState::Connected)) => established = true,
                    Ok(LinkEvent::StateChanged(LinkState::Disconnected)) => {
                        established = self.recover(&mut events, established).await;
                    }
                    Ok(LinkEvent::Fault(fault)) if fault.requires_rebond() => {
                        tracing::error!("{}", fault);
                        self.rebond_required.store(true, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Link supervisor lagged, dropped {} events", n);
                    }
                    Err(RecvError::Closed) => break,
                },
            }

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
        }

        tracing::info!("Link supervisor stopped");
    }

    /// Reconnects a link that was up. Returns whether it is up again.
    async fn recover(&self, events: &mut broadcast::Receiver<LinkEvent>, mut established: bool) -> bool {
        while established && self.should_reconnect() {
            established = self.reconnect().await;
            // drop the events of failed attempts
            *events = events.resubscribe();
            // a drop published before resubscribing is not in the new receiver
            if self.link.state() != LinkState::Disconnected {
                return established;
            }
            if established {
                tracing::warn!("Link dropped right after reconnecting");
            }
        }
        false
    }

    fn should_reconnect(&self) -> bool {
        if self.user_disconnect.load(Ordering::Relaxed) {
            tracing::debug!("Disconnect was requested, not reconnecting");
            return false;
        }
        !self.shutdown.load(Ordering::Relaxed)
    }

    async fn keepalive(&self) {
        if self.link.state() != LinkState::Connected {
            return;
        }
        if self.link.is_busy() || self.link.dose_outstanding() {
            tracing::debug!("Skipping keep-alive while the pump is busy");
            return;
        }

        match self.link.send(opcode::KEEP_CONNECTION, &[]).await {
            Ok(response) if response.success => tracing::trace!("Keep-alive acknowledged"),
            Ok(_) => tracing::warn!("Keep-alive rejected by pump"),
            Err(LinkError::ConcurrentRequestRejected { .. }) => {
                tracing::debug!("Skipping keep-alive, request in flight");
            }
            Err(e @ LinkError::Timeout { .. }) => {
                tracing::warn!("Keep-alive failed: {}, dropping connection", e);
                self.link.disconnect().await;
            }
            Err(e) => tracing::warn!("Keep-alive failed: {}", e),
        }
    }

    /// Retries the connection until it succeeds, the attempt limit is
    /// reached, or a rebond becomes necessary.
    async fn reconnect(&self) -> bool {
        let mut attempts = 0u32;
        loop {
            if self.is_rebond_required() {
                tracing::error!("Not reconnecting: pump must be forgotten and re-bonded");
                return false;
            }
            if self.config.max_reconnect_attempts > 0 && attempts >= self.config.max_reconnect_attempts {
                tracing::error!("Giving up after {} reconnect attempts", attempts);
                return false;
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.reconnect_delay()) => {}
            }
            if self.shutdown.load(Ordering::Relaxed) || self.user_disconnect.load(Ordering::Relaxed) {
                return false;
            }

            attempts += 1;
            tracing::info!("Reconnecting (attempt {})", attempts);
            match self.link.connect().await {
                Ok(ConnectOutcome::Connected(_)) => {
                    tracing::info!("Reconnected after {} attempt(s)", attempts);
                    return true;
                }
                Ok(ConnectOutcome::PincodeRequired) => {
                    tracing::warn!("Pump asks for a new pairing, reconnect stopped");
                    return false;
                }
                Err(e) => {
                    tracing::warn!("Reconnect attempt {} failed: {}", attempts, e);
                    if let LinkError::Pairing { fault, .. } = &e {
                        if fault.requires_rebond() {
                            self.rebond_required.store(true, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
    }

    /// Signals the supervision loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::state::PersistedPumpState;
    use crate::testing::{MockTransport, PumpModel, DEVICE_NAME};
    use danalink_protocol::registry::payload;
    use std::time::Duration;

    fn supervised(config: SupervisorConfig) -> (Arc<Supervisor<MockTransport>>, MockTransport) {
        let transport = MockTransport::new(PumpModel::default_model(0x1234, [0x12, 0x34]));
        let link = Link::new(transport.clone(), &PersistedPumpState::new(DEVICE_NAME), LinkConfig::default()).unwrap();
        (Arc::new(Supervisor::new(link, config)), transport)
    }

    fn config(keepalive_secs: u64, max_reconnect_attempts: u32) -> SupervisorConfig {
        SupervisorConfig {
            keepalive_secs,
            reconnect_delay_ms: 1_000,
            max_reconnect_attempts,
        }
    }

    fn keepalives(transport: &MockTransport) -> usize {
        transport
            .pump()
            .received_opcodes()
            .into_iter()
            .filter(|op| *op == opcode::KEEP_CONNECTION)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_peripheral_drop() {
        let (supervisor, transport) = supervised(config(60, 0));
        supervisor.connect().await.unwrap();
        let handle = supervisor.start();

        transport.drop_link();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(transport.connects(), 2);
        assert_eq!(supervisor.link().state(), LinkState::Connected);

        supervisor.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_right_after_reconnect_reconnects_again() {
        let (supervisor, transport) = supervised(config(60, 0));
        supervisor.connect().await.unwrap();
        let handle = supervisor.start();

        // the reconnect succeeds, then the link closes before the loop resumes
        transport.drop_after_reply(opcode::INITIAL_SCREEN_INFORMATION);
        transport.drop_link();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(transport.connects(), 3);
        assert_eq!(supervisor.link().state(), LinkState::Connected);

        supervisor.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_disconnect_suppresses_reconnect() {
        let (supervisor, transport) = supervised(config(60, 0));
        supervisor.connect().await.unwrap();
        let handle = supervisor.start();

        supervisor.disconnect().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.connects(), 1);
        assert_eq!(supervisor.link().state(), LinkState::Disconnected);

        // an explicit connect re-arms reconnect
        supervisor.connect().await.unwrap();
        transport.drop_link();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.connects(), 3);

        supervisor.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_idle_link() {
        let (supervisor, transport) = supervised(config(10, 0));
        supervisor.connect().await.unwrap();
        let handle = supervisor.start();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(keepalives(&transport), 2);

        supervisor.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_skipped_while_dosing() {
        let (supervisor, transport) = supervised(config(10, 0));
        supervisor.connect().await.unwrap();
        supervisor
            .link()
            .send(
                opcode::STEP_BOLUS_START,
                &payload::step_bolus_start(3.0, payload::BolusSpeed::Speed12),
            )
            .await
            .unwrap();
        assert!(supervisor.link().dose_outstanding());
        let handle = supervisor.start();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(keepalives(&transport), 0);

        supervisor.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_timeout_forces_reconnect() {
        let (supervisor, transport) = supervised(config(10, 0));
        supervisor.connect().await.unwrap();
        transport.pump().silence(opcode::KEEP_CONNECTION);
        let handle = supervisor.start();

        // ping at 10s, timeout at 15s, reconnect at 16s
        tokio::time::sleep(Duration::from_secs(17)).await;
        assert_eq!(transport.connects(), 2);
        assert_eq!(supervisor.link().state(), LinkState::Connected);

        supervisor.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let (supervisor, transport) = supervised(config(60, 3));
        supervisor.connect().await.unwrap();
        let handle = supervisor.start();

        transport.set_refuse_connect(true);
        transport.drop_link();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(transport.connects(), 4);
        assert_eq!(supervisor.link().state(), LinkState::Disconnected);

        supervisor.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebond_fault_stops_reconnect() {
        let (supervisor, transport) = supervised(config(60, 0));
        supervisor.connect().await.unwrap();
        let handle = supervisor.start();

        // BLE5 acknowledgement with zero key bytes
        transport
            .pump()
            .set_pump_check_reply(vec![0x4F, 0x4B, 0x4D, 0x09, 0x00, 0x0C, 0, 0, 0, 0, 0, 0]);
        transport.drop_link();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(transport.connects(), 2);
        assert!(supervisor.is_rebond_required());
        assert_eq!(supervisor.link().state(), LinkState::Disconnected);

        supervisor.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_loop() {
        let (supervisor, _transport) = supervised(config(60, 0));
        let handle = supervisor.start();
        supervisor.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
