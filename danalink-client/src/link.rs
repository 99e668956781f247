//! Async link session.
//!
//! [`Link`] drives a [`LinkCore`] over a [`PumpTransport`]: a background
//! read loop feeds notifications to the core, and callers issue one request
//! at a time with [`Link::send`].

use crate::config::LinkConfig;
use crate::core::{Action, LinkCore, LinkEvent, LinkState};
use crate::error::LinkError;
use crate::state::PersistedPumpState;
use crate::transport::PumpTransport;
use bytes::Bytes;
use danalink_protocol::packet::opcode;
use danalink_protocol::{CommandRegistry, Generation, InitialScreenInformation, ParsedResponse, PinPair, ResponseValue};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Default capacity for the event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Result of a successful [`Link::connect`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    /// Session established and the initial status fetched.
    Connected(InitialScreenInformation),
    /// RSv3 pump is waiting for the pin pair shown on its display.
    PincodeRequired,
}

struct Inner<T> {
    core: parking_lot::Mutex<LinkCore>,
    transport: T,
    events: broadcast::Sender<LinkEvent>,
    state: watch::Sender<LinkState>,
    /// Serializes chunk writes so two messages never interleave.
    writer: Mutex<()>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// A link session with one pump.
pub struct Link<T: PumpTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: PumpTransport> Clone for Link<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: PumpTransport> Link<T> {
    /// Creates a session (not yet connected) with the built-in codecs.
    pub fn new(transport: T, stored: &PersistedPumpState, config: LinkConfig) -> Result<Self, LinkError> {
        Self::with_registry(transport, stored, config, CommandRegistry::new())
    }

    pub fn with_registry(
        transport: T,
        stored: &PersistedPumpState,
        config: LinkConfig,
        registry: CommandRegistry,
    ) -> Result<Self, LinkError> {
        let mut core = LinkCore::new(stored, config, registry)?;
        core.set_write_limit(core.config().write_limit.min(transport.max_write_len()));

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(LinkState::Disconnected);
        Ok(Self {
            inner: Arc::new(Inner {
                core: parking_lot::Mutex::new(core),
                transport,
                events,
                state,
                writer: Mutex::new(()),
                reader: parking_lot::Mutex::new(None),
            }),
        })
    }

    /// Subscribes to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.events.subscribe()
    }

    /// Watches the connection state.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> LinkState {
        self.inner.core.lock().state()
    }

    pub fn generation(&self) -> Generation {
        self.inner.core.lock().generation()
    }

    /// Returns whether a request is in flight.
    pub fn is_busy(&self) -> bool {
        self.inner.core.lock().is_busy()
    }

    pub fn dose_outstanding(&self) -> bool {
        self.inner.core.lock().dose_outstanding()
    }

    pub fn history_mode(&self) -> bool {
        self.inner.core.lock().history_mode()
    }

    /// Captures the state the host should persist.
    pub fn snapshot(&self) -> PersistedPumpState {
        self.inner.core.lock().snapshot()
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Connects, negotiates encryption and fetches the initial status.
    pub async fn connect(&self) -> Result<ConnectOutcome, LinkError> {
        tracing::debug!("Connecting...");
        self.inner.stop_reader();
        let actions = self.inner.core.lock().begin_connect();
        self.inner.apply(actions).await?;

        let notifications = match self.inner.transport.connect().await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::debug!("Transport connect failed: {}", e);
                self.inner.closed();
                return Err(e);
            }
        };

        let reader = tokio::spawn(read_loop(Arc::clone(&self.inner), notifications));
        *self.inner.reader.lock() = Some(reader);

        let peripheral_id = self.inner.transport.peripheral_id();
        let actions = self.inner.core.lock().on_transport_connected(peripheral_id)?;
        self.inner.apply(actions).await?;

        match self.await_negotiation().await? {
            LinkState::AwaitingPincode => Ok(ConnectOutcome::PincodeRequired),
            _ => self.fetch_initial_screen().await.map(ConnectOutcome::Connected),
        }
    }

    /// Completes RSv3 pairing with the pin pair shown on the pump.
    pub async fn complete_pairing(&self, pin: &PinPair) -> Result<InitialScreenInformation, LinkError> {
        let actions = self.inner.core.lock().complete_pairing(pin)?;
        self.inner.apply(actions).await?;

        match self.await_negotiation().await? {
            LinkState::AwaitingPincode => Err(LinkError::NotAwaitingPincode),
            _ => self.fetch_initial_screen().await,
        }
    }

    /// Waits until the handshake settles.
    async fn await_negotiation(&self) -> Result<LinkState, LinkError> {
        let timeout = self.inner.core.lock().config().handshake_timeout();
        let mut state_rx = self.inner.state.subscribe();

        let settled = tokio::time::timeout(
            timeout,
            state_rx.wait_for(|s| {
                matches!(
                    s,
                    LinkState::Connected
                        | LinkState::AwaitingPincode
                        | LinkState::Disconnecting
                        | LinkState::Disconnected
                )
            }),
        )
        .await
        .map(|waited| waited.map(|state| *state));

        let state = match settled {
            Ok(Ok(state)) => state,
            Ok(Err(_)) => return Err(LinkError::ConnectionClosed),
            Err(_) => {
                tracing::warn!("Handshake timed out");
                self.disconnect().await;
                return Err(LinkError::Timeout {
                    opcode: danalink_protocol::packet::handshake::PUMP_CHECK,
                });
            }
        };

        match state {
            LinkState::Connected | LinkState::AwaitingPincode => Ok(state),
            _ => Err(self.inner.core.lock().take_failure().unwrap_or(LinkError::ConnectionClosed)),
        }
    }

    async fn fetch_initial_screen(&self) -> Result<InitialScreenInformation, LinkError> {
        tracing::debug!("Getting initial state");
        let result = self.send(opcode::INITIAL_SCREEN_INFORMATION, &[]).await;
        match result {
            Ok(ParsedResponse {
                value: ResponseValue::InitialScreen(info),
                success: true,
                ..
            }) => {
                tracing::info!(
                    "Connection and encryption successful (reservoir {:.2} U, battery {}%)",
                    info.reservoir_remaining_units,
                    info.battery_remaining
                );
                Ok(info)
            }
            Ok(other) => {
                tracing::error!("Failed to fetch initial screen: {:?}", other.value);
                self.disconnect().await;
                Err(LinkError::Decode {
                    source: danalink_protocol::ProtocolError::ShortPayload {
                        opcode: opcode::INITIAL_SCREEN_INFORMATION,
                        needed: 15,
                        actual: other.raw.len(),
                    },
                    raw: other.raw.to_vec(),
                })
            }
            Err(e) => {
                tracing::error!("Failed to fetch initial screen: {}", e);
                self.disconnect().await;
                Err(e)
            }
        }
    }

    /// Sends a command and waits for its response.
    ///
    /// Rejected immediately if another request is in flight. A request that
    /// sees no response before its deadline fails with
    /// [`LinkError::Timeout`] and frees the slot for the next one.
    pub async fn send(&self, op: u8, payload: &[u8]) -> Result<ParsedResponse, LinkError> {
        let (ticket, chunks) = self.inner.core.lock().begin_request(op, payload)?;
        let id = ticket.id;

        if let Err(e) = self.inner.write_chunks(chunks).await {
            tracing::debug!("Request {:#04x} write failed: {}", op, e);
            self.inner.core.lock().release(id);
            return Err(e);
        }

        let mut receiver = ticket.receiver;
        match tokio::time::timeout_at(ticket.deadline, &mut receiver).await {
            Ok(result) => result.unwrap_or(Err(LinkError::ConnectionClosed)),
            Err(_) => {
                // resolves the ticket with Timeout unless a response got there first
                self.inner.core.lock().expire(id);
                receiver.await.unwrap_or(Err(LinkError::ConnectionClosed))
            }
        }
    }

    /// Closes the session. Any pending request fails with
    /// [`LinkError::ConnectionClosed`].
    pub async fn disconnect(&self) {
        tracing::debug!("Closing connection...");
        let actions = self.inner.core.lock().begin_disconnect();
        self.inner.emit_all(actions);
        self.inner.stop_reader();
        self.inner.transport.disconnect().await;
        self.inner.closed();
    }
}

impl<T: PumpTransport> Inner<T> {
    async fn apply(&self, actions: Vec<Action>) -> Result<(), LinkError> {
        for action in actions {
            match action {
                Action::Write(chunks) => self.write_chunks(chunks).await?,
                Action::Emit(event) => self.emit(event),
                Action::Disconnect => {
                    self.transport.disconnect().await;
                    self.closed();
                }
            }
        }
        Ok(())
    }

    fn emit_all(&self, actions: Vec<Action>) {
        for action in actions {
            if let Action::Emit(event) = action {
                self.emit(event);
            }
        }
    }

    fn emit(&self, event: LinkEvent) {
        if let LinkEvent::StateChanged(state) = event {
            self.state.send_replace(state);
        }
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    async fn write_chunks(&self, chunks: Vec<Bytes>) -> Result<(), LinkError> {
        let _guard = self.writer.lock().await;
        for chunk in chunks {
            self.transport.write(chunk).await?;
        }
        Ok(())
    }

    /// Aborts the read loop of the previous connection so it cannot close
    /// a newer one.
    fn stop_reader(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    /// Transport is gone: fail the pending request and publish the state.
    fn closed(&self) {
        let actions = self.core.lock().on_transport_closed();
        self.emit_all(actions);
    }
}

/// Feeds notifications to the core until the transport closes.
async fn read_loop<T: PumpTransport>(inner: Arc<Inner<T>>, mut notifications: mpsc::Receiver<Bytes>) {
    tracing::debug!("read_loop started");
    while let Some(data) = notifications.recv().await {
        tracing::debug!("read_loop: received {} bytes: {}", data.len(), hex::encode(&data));
        let actions = inner.core.lock().on_notification(&data);
        if let Err(e) = inner.apply(actions).await {
            tracing::warn!("read_loop: failed to act on notification: {}", e);
        }
    }
    tracing::debug!("read_loop: connection closed");
    inner.closed();
}
