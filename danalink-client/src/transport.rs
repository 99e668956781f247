//! Transport boundary.
//!
//! The BLE stack lives outside this crate. A [`PumpTransport`] connects to
//! one peripheral, writes to its write characteristic and streams the
//! notifications of its read characteristic.

use crate::error::LinkError;
use bytes::Bytes;
use danalink_protocol::DEFAULT_WRITE_LIMIT;
use std::future::Future;
use tokio::sync::mpsc;

/// Service advertised by Dana pumps.
pub const SERVICE_UUID: u16 = 0xFFF0;
/// Characteristic the pump notifies on.
pub const READ_CHARACTERISTIC_UUID: u16 = 0xFFF1;
/// Characteristic the host writes to without response.
pub const WRITE_CHARACTERISTIC_UUID: u16 = 0xFFF2;

/// Byte-stream connection to one pump.
pub trait PumpTransport: Send + Sync + 'static {
    /// Connects and enables notifications.
    ///
    /// Each notification arrives as one item on the returned channel. The
    /// channel closing means the peripheral disconnected.
    fn connect(&self) -> impl Future<Output = Result<mpsc::Receiver<Bytes>, LinkError>> + Send;

    /// Writes one chunk without response.
    fn write(&self, chunk: Bytes) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Drops the connection. Closes the notification channel.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    /// Largest chunk accepted by [`write`](Self::write).
    fn max_write_len(&self) -> usize {
        DEFAULT_WRITE_LIMIT
    }

    /// Stable identity of the connected peripheral, if known.
    fn peripheral_id(&self) -> Option<String> {
        None
    }
}
