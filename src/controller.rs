//! Relay controller
//!
//! The orchestrating state machine of the driver. `open_locker` resolves the
//! physical address, pulses the solenoid through the command scheduler,
//! verifies the write, and retries transient failures with exponential
//! backoff. The solenoid is always de-energized within the pulse window: the
//! OFF command is scheduled as a detached task the moment the ON frame is on
//! the wire, independent of whether the caller keeps awaiting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::{RelayError, Result};
use crate::health::HealthMonitor;
use crate::mapping::{map_locker, LockerAddress};
use crate::modbus::constants::{read_coils_response_len, WRITE_ECHO_LEN};
use crate::modbus::{
    decode, decode_coil_status, encode_read_coils, encode_timed_pulse,
    encode_write_multiple_coils, encode_write_single_coil, FunctionCode,
};
use crate::scheduler::CommandScheduler;
use crate::transport::{ConnectionState, MockTransport, SerialTransport, Transport};

/// Relay controller for a bank of locker boards on one RS-485 bus
#[derive(Debug)]
pub struct RelayController {
    config: ControllerConfig,
    scheduler: CommandScheduler,
    state: Arc<RwLock<ConnectionState>>,
    health: HealthMonitor,
}

impl RelayController {
    /// Open the configured transport and start the driver.
    ///
    /// With `test_mode` set, an in-memory relay simulator replaces the
    /// serial port.
    pub async fn connect(config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let transport: Box<dyn Transport> = if config.test_mode {
            Box::new(MockTransport::new())
        } else {
            Box::new(SerialTransport::new(config.port.clone(), config.baud_rate))
        };
        Self::with_transport(config, transport).await
    }

    /// Start the driver on a caller-supplied transport.
    pub async fn with_transport(
        config: ControllerConfig,
        mut transport: Box<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;

        let state = Arc::new(RwLock::new(ConnectionState::Connecting));
        transport.connect().await?;
        *state.write().await = ConnectionState::Connected;

        let scheduler = CommandScheduler::start(
            transport,
            config.command_interval(),
            Arc::clone(&state),
        );
        let health = HealthMonitor::spawn(&config, scheduler.clone(), Arc::clone(&state));

        info!(
            "Relay controller started on {} ({} baud)",
            config.port, config.baud_rate
        );
        Ok(Self {
            config,
            scheduler,
            state,
            health,
        })
    }

    /// Current bus connection state
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Pulse a locker's solenoid open.
    pub async fn open_locker(&self, locker_id: u32) -> Result<()> {
        self.open_locker_with_cancel(locker_id, CancellationToken::new())
            .await
    }

    /// Pulse a locker's solenoid open, with caller-controlled cancellation.
    ///
    /// Cancellation removes the command while it is still queued; a command
    /// already on the wire runs to completion or timeout.
    pub async fn open_locker_with_cancel(
        &self,
        locker_id: u32,
        cancel: CancellationToken,
    ) -> Result<()> {
        let address = map_locker(locker_id)?;
        self.ensure_connected().await?;

        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.pulse_once(address, &cancel).await {
                Ok(()) => {
                    info!(
                        locker_id,
                        board = address.board,
                        coil = address.coil,
                        attempt,
                        "Locker opened"
                    );
                    return Ok(());
                },
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt >= max_attempts {
                        warn!(locker_id, attempts = attempt, "Giving up: {e}");
                        return Err(RelayError::RetryExhausted {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    let delay = backoff_delay(&self.config, attempt);
                    warn!(
                        locker_id,
                        attempt, "Attempt failed ({e}), retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                },
            }
        }
    }

    /// Repeatedly pulse a stuck locker for the configured burst window.
    ///
    /// Mechanical agitation mode: full ON/OFF pulse pairs spaced by
    /// `burst_interval_ms` until `burst_duration_seconds` elapses. Transient
    /// per-pulse failures are logged and the burst continues; the call only
    /// fails when no pulse in the window landed.
    pub async fn open_locker_burst(&self, locker_id: u32) -> Result<()> {
        let address = map_locker(locker_id)?;
        self.ensure_connected().await?;

        let window = Duration::from_secs(self.config.burst_duration_seconds);
        let spacing = Duration::from_millis(self.config.burst_interval_ms);
        let deadline = Instant::now() + window;
        let cancel = CancellationToken::new();

        let mut delivered = 0u32;
        let mut last_error: Option<RelayError> = None;
        loop {
            match self.pulse_pair(address, &cancel).await {
                Ok(()) => delivered += 1,
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(locker_id, "Burst pulse failed: {e}");
                    last_error = Some(e);
                },
            }

            if Instant::now() + spacing >= deadline {
                break;
            }
            tokio::time::sleep(spacing).await;
        }

        debug!(locker_id, delivered, "Burst window finished");
        match (delivered, last_error) {
            (0, Some(e)) => Err(RelayError::RetryExhausted {
                attempts: 0,
                last: Box::new(e),
            }),
            _ => Ok(()),
        }
    }

    /// Open several lockers.
    ///
    /// With `use_multiple_coils` set, lockers on the same board are actuated
    /// in a single write-multiple-coils transaction per board; otherwise each
    /// locker is pulsed sequentially through [`Self::open_locker`].
    pub async fn open_lockers(&self, locker_ids: &[u32]) -> Result<()> {
        if locker_ids.is_empty() {
            return Ok(());
        }
        // Resolve every address up front: one bad id fails the batch before
        // any bus traffic
        let addresses = locker_ids
            .iter()
            .map(|&id| map_locker(id))
            .collect::<Result<Vec<_>>>()?;
        self.ensure_connected().await?;

        if !self.config.use_multiple_coils {
            for address in addresses {
                self.open_locker(address.locker_id).await?;
            }
            return Ok(());
        }

        let mut boards: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
        for address in &addresses {
            boards.entry(address.board).or_default().push(address.coil);
        }

        let cancel = CancellationToken::new();
        for (board, mut coils) in boards {
            coils.sort_unstable();
            coils.dedup();
            let start = coils[0];
            let span = (coils[coils.len() - 1] - start + 1) as usize;
            let mut states = vec![false; span];
            for coil in &coils {
                states[(coil - start) as usize] = true;
            }
            self.open_board_run(board, start, &states, &cancel).await?;
        }
        Ok(())
    }

    /// Shut down the driver: stop health probing, cancel queued commands,
    /// and close the transport.
    pub async fn shutdown(&self) {
        self.health.stop().await;
        self.scheduler.shutdown().await;
        *self.state.write().await = ConnectionState::Disconnected;
        info!("Relay controller shut down");
    }

    /// Refuse commands unless the bus is known healthy
    async fn ensure_connected(&self) -> Result<()> {
        match *self.state.read().await {
            ConnectionState::Connected => Ok(()),
            _ => Err(RelayError::ConnectionUnavailable),
        }
    }

    /// One pulse attempt: ON write, detached OFF scheduling, optional
    /// read-back verification.
    async fn pulse_once(&self, address: LockerAddress, cancel: &CancellationToken) -> Result<()> {
        if self.config.firmware_pulse {
            // Board firmware reverts the coil on its own; no OFF command and
            // no read-back (the relay may legitimately already be off again)
            let request = encode_timed_pulse(
                address.board,
                address.coil,
                self.config.pulse_duration_ticks(),
            );
            let raw = self
                .scheduler
                .transact(
                    request.clone(),
                    WRITE_ECHO_LEN,
                    self.config.timeout(),
                    cancel.clone(),
                )
                .await?;
            return check_single_echo(&raw, &request);
        }

        let request = encode_write_single_coil(address.board, address.coil, true);
        // The release guard is armed before the ON frame is even queued:
        // whatever happens to this future afterwards, the coil cannot stay
        // energized past the pulse window. The guard enqueues after the ON
        // (FIFO), so it can never release the coil before it latches.
        let guard = self.schedule_off(address);
        let result = self
            .scheduler
            .transact(
                request.clone(),
                WRITE_ECHO_LEN,
                self.config.timeout(),
                cancel.clone(),
            )
            .await;

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                // Only when the ON frame provably never reached the wire is
                // the release redundant
                if matches!(e, RelayError::Cancelled | RelayError::Shutdown) {
                    guard.abort();
                }
                return Err(e);
            },
        };
        check_single_echo(&raw, &request)?;

        if self.config.verify_writes {
            self.verify_coil(address, true, cancel).await?;
        }
        Ok(())
    }

    /// A fully awaited ON/OFF pulse pair (burst mode building block)
    async fn pulse_pair(&self, address: LockerAddress, cancel: &CancellationToken) -> Result<()> {
        if self.config.firmware_pulse {
            let request = encode_timed_pulse(
                address.board,
                address.coil,
                self.config.pulse_duration_ticks(),
            );
            let raw = self
                .scheduler
                .transact(
                    request.clone(),
                    WRITE_ECHO_LEN,
                    self.config.timeout(),
                    cancel.clone(),
                )
                .await?;
            check_single_echo(&raw, &request)?;
            tokio::time::sleep(self.config.pulse_duration()).await;
            return Ok(());
        }

        let on = encode_write_single_coil(address.board, address.coil, true);
        let result = self
            .scheduler
            .transact(
                on.clone(),
                WRITE_ECHO_LEN,
                self.config.timeout(),
                cancel.clone(),
            )
            .await;
        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                // A lost echo leaves the coil state unknown; fall back to
                // the detached release guard
                if e.is_retryable() {
                    self.schedule_off(address);
                }
                return Err(e);
            },
        };
        if let Err(e) = check_single_echo(&raw, &on) {
            self.schedule_off(address);
            return Err(e);
        }

        tokio::time::sleep(self.config.pulse_duration()).await;

        let off = encode_write_single_coil(address.board, address.coil, false);
        let result = self
            .scheduler
            .transact(
                off.clone(),
                WRITE_ECHO_LEN,
                self.config.timeout(),
                cancel.clone(),
            )
            .await;
        match result {
            Ok(raw) => check_single_echo(&raw, &off),
            Err(e) => {
                if e.is_retryable() {
                    self.schedule_off(address);
                }
                Err(e)
            },
        }
    }

    /// Pulse a contiguous run of coils on one board with a single
    /// write-multiple-coils transaction, retrying like a single-coil pulse.
    async fn open_board_run(
        &self,
        board: u8,
        start_coil: u8,
        states: &[bool],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.board_run_once(board, start_coil, states, cancel).await {
                Ok(()) => {
                    info!(board, start_coil, coils = states.len(), "Board run actuated");
                    return Ok(());
                },
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt >= max_attempts {
                        return Err(RelayError::RetryExhausted {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    let delay = backoff_delay(&self.config, attempt);
                    warn!(board, attempt, "Board run failed ({e}), retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                },
            }
        }
    }

    async fn board_run_once(
        &self,
        board: u8,
        start_coil: u8,
        states: &[bool],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = encode_write_multiple_coils(board, start_coil, states)?;
        let guard = self.schedule_off_run(board, start_coil, states.len());
        let result = self
            .scheduler
            .transact(
                request,
                WRITE_ECHO_LEN,
                self.config.timeout(),
                cancel.clone(),
            )
            .await;

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                if matches!(e, RelayError::Cancelled | RelayError::Shutdown) {
                    guard.abort();
                }
                return Err(e);
            },
        };
        check_multi_echo(&raw, board, start_coil, states.len() as u16)?;

        if self.config.verify_writes {
            self.verify_run(board, start_coil, states, cancel).await?;
        }
        Ok(())
    }

    /// Detached software-timed OFF for a single coil
    fn schedule_off(&self, address: LockerAddress) -> tokio::task::JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        let pulse = self.config.pulse_duration();
        let timeout = self.config.timeout();
        tokio::spawn(async move {
            tokio::time::sleep(pulse).await;
            let off = encode_write_single_coil(address.board, address.coil, false);
            match scheduler
                .transact(off, WRITE_ECHO_LEN, timeout, CancellationToken::new())
                .await
            {
                Ok(_) => debug!(
                    board = address.board,
                    coil = address.coil,
                    "Pulse complete, coil released"
                ),
                // A stuck-ON solenoid needs manual intervention; make noise
                Err(e) => warn!(
                    board = address.board,
                    coil = address.coil,
                    "Failed to release coil after pulse: {e}"
                ),
            }
        })
    }

    /// Detached software-timed OFF for a board run
    fn schedule_off_run(&self, board: u8, start_coil: u8, span: usize) -> tokio::task::JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        let pulse = self.config.pulse_duration();
        let timeout = self.config.timeout();
        tokio::spawn(async move {
            tokio::time::sleep(pulse).await;
            let states = vec![false; span];
            let off = match encode_write_multiple_coils(board, start_coil, &states) {
                Ok(off) => off,
                Err(e) => {
                    warn!(board, "Could not encode release frame: {e}");
                    return;
                },
            };
            if let Err(e) = scheduler
                .transact(off, WRITE_ECHO_LEN, timeout, CancellationToken::new())
                .await
            {
                warn!(board, start_coil, "Failed to release board run: {e}");
            }
        })
    }

    /// Read one coil back and require it to match the commanded state
    async fn verify_coil(
        &self,
        address: LockerAddress,
        expect_on: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = encode_read_coils(address.board, address.coil, 1);
        let raw = self
            .scheduler
            .transact(
                request,
                read_coils_response_len(1),
                self.config.timeout(),
                cancel.clone(),
            )
            .await
            .map_err(|e| RelayError::VerificationFailed(format!("read-back failed: {e}")))?;
        let frame = decode(&raw)
            .map_err(|e| RelayError::VerificationFailed(format!("read-back invalid: {e}")))?;
        let states = decode_coil_status(&frame, 1)
            .map_err(|e| RelayError::VerificationFailed(format!("read-back invalid: {e}")))?;

        if states[0] != expect_on {
            return Err(RelayError::VerificationFailed(format!(
                "coil {}:{} reads {} after commanding {}",
                address.board,
                address.coil,
                if states[0] { "ON" } else { "OFF" },
                if expect_on { "ON" } else { "OFF" },
            )));
        }
        Ok(())
    }

    /// Read a board run back and require every commanded coil to be ON
    async fn verify_run(
        &self,
        board: u8,
        start_coil: u8,
        states: &[bool],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let count = states.len() as u16;
        let request = encode_read_coils(board, start_coil, count);
        let raw = self
            .scheduler
            .transact(
                request,
                read_coils_response_len(count),
                self.config.timeout(),
                cancel.clone(),
            )
            .await
            .map_err(|e| RelayError::VerificationFailed(format!("read-back failed: {e}")))?;
        let frame = decode(&raw)
            .map_err(|e| RelayError::VerificationFailed(format!("read-back invalid: {e}")))?;
        let actual = decode_coil_status(&frame, count)
            .map_err(|e| RelayError::VerificationFailed(format!("read-back invalid: {e}")))?;

        for (i, (&commanded, &read)) in states.iter().zip(actual.iter()).enumerate() {
            if commanded && !read {
                return Err(RelayError::VerificationFailed(format!(
                    "coil {}:{} reads OFF after commanding ON",
                    board,
                    start_coil + i as u8
                )));
            }
        }
        Ok(())
    }
}

/// Validate a write echo: CRC-checked and byte-identical to the request
fn check_single_echo(raw: &[u8], request: &[u8]) -> Result<()> {
    decode(raw)?;
    if raw != request {
        return Err(RelayError::MalformedFrame(format!(
            "Echo mismatch: sent {} bytes, echoed {}",
            request.len(),
            raw.len()
        )));
    }
    Ok(())
}

/// Validate a write-multiple-coils response: board, function, start, quantity
fn check_multi_echo(raw: &[u8], board: u8, start_coil: u8, quantity: u16) -> Result<()> {
    let frame = decode(raw)?;
    let start = u16::from(start_coil.saturating_sub(1));
    if frame.board != board
        || frame.function != FunctionCode::WriteMultipleCoils
        || frame.payload.len() < 4
        || frame.payload[..2] != start.to_be_bytes()
        || frame.payload[2..4] != quantity.to_be_bytes()
    {
        return Err(RelayError::MalformedFrame(
            "Write-multiple-coils response does not match request".to_string(),
        ));
    }
    Ok(())
}

/// Exponential backoff with cap and ±25% jitter; `attempt` counts failures
/// so far, so the first retry waits roughly the base delay.
fn backoff_delay(config: &ControllerConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16) as i32;
    let base = Duration::from_millis(config.retry_delay_base_ms);
    let cap = Duration::from_millis(config.retry_delay_max_ms);

    let mut delay = base.mul_f64(2f64.powi(exponent));
    if delay > cap {
        delay = cap;
    }

    let jitter_range = delay.as_millis() as f64 * 0.25;
    if jitter_range > 0.0 {
        let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
        delay = Duration::from_millis((delay.as_millis() as f64 + jitter).max(0.0) as u64);
    }
    delay
}
