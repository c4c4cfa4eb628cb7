//! Transport layer
//!
//! Abstracts the physical serial link behind the [`Transport`] trait so the
//! scheduler and controller never touch tokio-serial directly. Exactly one
//! owner (the scheduler worker) ever holds a transport; the bus is
//! half-duplex and concurrent writes would corrupt it.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod mock;
pub mod serial;

pub use mock::{MockHandle, MockTransport};
pub use serial::SerialTransport;

/// Connection state of the relay bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No open handle to the bus
    Disconnected,
    /// Opening the serial device
    Connecting,
    /// Bus is healthy; commands are admitted
    Connected,
    /// Health probing failed repeatedly; commands are refused until a
    /// reconnect succeeds
    Degraded,
}

/// Physical link to the relay bus
///
/// Implementations own the OS-level handle. `receive` returns however many
/// bytes arrived within the timeout (possibly zero); framing is the
/// scheduler's concern.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Transport type identifier for logs
    fn kind(&self) -> &str;

    /// Open the link
    async fn connect(&mut self) -> Result<()>;

    /// Close the link
    async fn disconnect(&mut self) -> Result<()>;

    /// Write a complete frame to the bus
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Read available bytes into `buffer`, waiting at most `timeout`
    async fn receive(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Whether the link currently holds an open handle
    fn is_connected(&self) -> bool;
}
