//! Modbus RTU relay-control driver for RFID locker hardware
//!
//! This crate drives the solenoid relays of an electronic locker bank over a
//! half-duplex RS-485 bus shared by multiple 16-relay boards. It translates
//! logical locker identifiers into physical board/coil addresses, builds
//! CRC-checked RTU frames, serializes all bus traffic through a single
//! scheduler, pulses solenoids open instead of energizing them permanently,
//! verifies writes, and recovers from transient serial failures.
//!
//! The driver deliberately does not decide *when* a locker should open, does
//! not persist locker state, and implements only the Modbus subset these
//! relay boards speak (read coils, write single coil, write multiple coils,
//! plus a vendor timed-pulse extension).
//!
//! # Example
//!
//! ```no_run
//! use locker_relay::{ControllerConfig, RelayController};
//!
//! #[tokio::main]
//! async fn main() -> locker_relay::Result<()> {
//!     let config = ControllerConfig {
//!         port: "/dev/ttyUSB0".to_string(),
//!         ..ControllerConfig::default()
//!     };
//!     let controller = RelayController::connect(config).await?;
//!     controller.open_locker(17).await?;
//!     controller.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod mapping;
pub mod modbus;
pub mod scheduler;
pub mod transport;

pub use config::ControllerConfig;
pub use controller::RelayController;
pub use error::{RelayError, Result};
pub use mapping::{map_locker, LockerAddress};
pub use transport::ConnectionState;
