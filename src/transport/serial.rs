//! Serial transport over tokio-serial
//!
//! Owns the serial handle for the RS-485 bus. The device identity is
//! resolved through `/dev/serial/by-id` where possible so that USB
//! replugging does not change the effective path; the configured path is the
//! fallback. Relay boards speak 8N1 at the configured baud rate.

use std::fs;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use super::Transport;
use crate::error::{RelayError, Result};

/// Directory of persistent serial device links on Linux
const SERIAL_BY_ID_DIR: &str = "/dev/serial/by-id";

/// Serial transport implementation
#[derive(Debug)]
pub struct SerialTransport {
    /// Configured (fallback) device path
    port: String,
    /// Baud rate
    baud_rate: u32,
    /// Write timeout for individual operations
    write_timeout: Duration,
    /// Open serial handle; `None` while disconnected
    connection: Option<SerialStream>,
}

impl SerialTransport {
    /// Create a new serial transport. The port is not opened until
    /// [`Transport::connect`] is called.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            write_timeout: Duration::from_millis(1000),
            connection: None,
        }
    }

    /// Resolve the device path to open.
    ///
    /// Prefers a stable `/dev/serial/by-id` link: one pointing at the
    /// configured device if present, otherwise the only link in the
    /// directory. Falls back to the configured path.
    fn resolve_device_path(&self) -> String {
        resolve_stable_path(&self.port, Path::new(SERIAL_BY_ID_DIR))
    }
}

/// Pick a stable device path for `configured`, searching `by_id_dir`.
fn resolve_stable_path(configured: &str, by_id_dir: &Path) -> String {
    let entries = match fs::read_dir(by_id_dir) {
        Ok(entries) => entries,
        Err(_) => return configured.to_string(),
    };

    let configured_target = fs::canonicalize(configured).ok();
    let mut links = Vec::new();

    for entry in entries.flatten() {
        let link = entry.path();
        if let Ok(target) = fs::canonicalize(&link) {
            if Some(&target) == configured_target.as_ref() {
                debug!("Resolved {} to stable path {}", configured, link.display());
                return link.to_string_lossy().into_owned();
            }
            links.push(link);
        }
    }

    // A single adapter on the machine is unambiguous even when the raw
    // device node has moved (e.g. ttyUSB0 -> ttyUSB1 after a replug)
    if links.len() == 1 {
        let link = &links[0];
        info!(
            "Configured port {} not found by-id; using the only stable link {}",
            configured,
            link.display()
        );
        return link.to_string_lossy().into_owned();
    }

    configured.to_string()
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> &str {
        "serial"
    }

    async fn connect(&mut self) -> Result<()> {
        let device = self.resolve_device_path();
        debug!("Opening serial port: {}", device);

        let port_result = tokio_serial::new(&device, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async();

        match port_result {
            Ok(port) => {
                #[cfg(unix)]
                {
                    let mut port = port;
                    port.set_exclusive(false).map_err(|e| {
                        RelayError::Connection(format!("Failed to set exclusive mode: {e}"))
                    })?;
                    self.connection = Some(port);
                }
                #[cfg(not(unix))]
                {
                    self.connection = Some(port);
                }

                info!("Opened serial port {} at {} baud", device, self.baud_rate);
                Ok(())
            },
            Err(e) => {
                let msg = format!("Failed to open serial port {device}: {e}");
                warn!("{msg}");
                Err(RelayError::Connection(msg))
            },
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.connection.take().is_some() {
            // The handle closes on drop
            info!("Closed serial port: {}", self.port);
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let port = self
            .connection
            .as_mut()
            .ok_or_else(|| RelayError::Connection("Serial port not connected".to_string()))?;

        let write = async {
            port.write_all(data).await?;
            port.flush().await?;
            Ok::<_, std::io::Error>(())
        };

        match timeout(self.write_timeout, write).await {
            Ok(Ok(())) => {
                debug!(
                    hex_data = %data.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" "),
                    length = data.len(),
                    direction = "send",
                    "[serial] raw frame"
                );
                Ok(())
            },
            Ok(Err(e)) => {
                // Broken handle; drop it so the next connect starts clean
                self.connection = None;
                Err(RelayError::Connection(format!("Failed to send data: {e}")))
            },
            Err(_) => Err(RelayError::Timeout(format!(
                "Send timed out after {:?}",
                self.write_timeout
            ))),
        }
    }

    async fn receive(&mut self, buffer: &mut [u8], recv_timeout: Duration) -> Result<usize> {
        let port = self
            .connection
            .as_mut()
            .ok_or_else(|| RelayError::Connection("Serial port not connected".to_string()))?;

        match timeout(recv_timeout, port.read(buffer)).await {
            Ok(Ok(0)) => Ok(0),
            Ok(Ok(n)) => {
                debug!(
                    hex_data = %buffer[..n].iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" "),
                    length = n,
                    direction = "recv",
                    "[serial] raw frame"
                );
                Ok(n)
            },
            Ok(Err(e)) => {
                self.connection = None;
                Err(RelayError::Connection(format!(
                    "Failed to receive data: {e}"
                )))
            },
            // Timeouts are often expected while polling for a frame tail
            Err(_) => Err(RelayError::Timeout(format!(
                "Receive timed out after {recv_timeout:?}"
            ))),
        }
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}
