//! Bus health monitoring
//!
//! Periodically issues a lightweight read-coils probe through the shared
//! command scheduler, so probes interleave with relay traffic instead of
//! competing for the serial handle. Repeated probe failures demote the
//! connection to [`ConnectionState::Degraded`] and trigger a transport
//! reconnect; a successful probe restores [`ConnectionState::Connected`].

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::modbus::constants::read_coils_response_len;
use crate::modbus::{decode, encode_read_coils};
use crate::scheduler::CommandScheduler;
use crate::transport::ConnectionState;

/// Board probed for liveness
const PROBE_BOARD: u8 = 1;
/// Coil read by the probe; one coil is the smallest legal read
const PROBE_COIL: u8 = 1;

/// Periodic health prober
#[derive(Debug)]
pub struct HealthMonitor {
    shutdown: CancellationToken,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl HealthMonitor {
    /// Spawn the monitoring task.
    ///
    /// The first probe runs one full interval after startup; the connection
    /// was just established, so there is nothing to learn sooner.
    pub fn spawn(
        config: &ControllerConfig,
        scheduler: CommandScheduler,
        state: Arc<RwLock<ConnectionState>>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let task_shutdown = shutdown.clone();
        let period = config.health_check_interval();
        let timeout = config.timeout();
        let failure_threshold = config.connection_retry_attempts.max(1);

        let handle = tokio::spawn(async move {
            let mut probe_interval = interval_at(Instant::now() + period, period);
            probe_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut consecutive_failures = 0u32;

            loop {
                tokio::select! {
                    _ = task_shutdown.cancelled() => break,
                    _ = probe_interval.tick() => {},
                }

                match probe(&scheduler, timeout).await {
                    Ok(()) => {
                        if consecutive_failures > 0 {
                            info!("Health probe recovered");
                        }
                        consecutive_failures = 0;
                        let mut current = state.write().await;
                        if *current != ConnectionState::Connected {
                            info!("Bus healthy again; resuming command admission");
                            *current = ConnectionState::Connected;
                        }
                    },
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(
                            "Health probe failed ({consecutive_failures}/{failure_threshold}): {e}"
                        );
                        if consecutive_failures >= failure_threshold {
                            *state.write().await = ConnectionState::Degraded;
                            match scheduler.reconnect().await {
                                Ok(()) => {
                                    info!("Transport reconnected after degraded bus");
                                    consecutive_failures = 0;
                                },
                                Err(e) => {
                                    warn!("Reconnect failed, bus stays degraded: {e}");
                                    *state.write().await = ConnectionState::Degraded;
                                },
                            }
                        }
                    },
                }
            }
            debug!("Health monitor stopped");
        });

        Self {
            shutdown,
            handle: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Stop the monitoring task and wait for it to finish
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// One probe transaction: read a single coil and validate the response frame
async fn probe(scheduler: &CommandScheduler, timeout: std::time::Duration) -> Result<()> {
    let request = encode_read_coils(PROBE_BOARD, PROBE_COIL, 1);
    let raw = scheduler
        .transact(
            request,
            read_coils_response_len(1),
            timeout,
            CancellationToken::new(),
        )
        .await?;
    decode(&raw).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::CommandScheduler;
    use crate::transport::{MockTransport, Transport};
    use std::time::Duration;

    fn test_config(interval_ms: u64, retry_attempts: u32) -> ControllerConfig {
        ControllerConfig {
            health_check_interval_ms: interval_ms,
            connection_retry_attempts: retry_attempts,
            timeout_ms: 100,
            command_interval_ms: 0,
            test_mode: true,
            ..ControllerConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_keeps_state_connected() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        transport.connect().await.expect("connect");
        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let scheduler = CommandScheduler::start(
            Box::new(transport),
            Duration::from_millis(0),
            Arc::clone(&state),
        );

        let monitor = HealthMonitor::spawn(&test_config(1000, 3), scheduler.clone(), Arc::clone(&state));

        // Three probe periods elapse; the mock answers every one
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(*state.read().await, ConnectionState::Connected);
        assert!(handle.sent_count() >= 3);

        monitor.stop().await;
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn test_consecutive_failures_degrade_then_recover() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        transport.connect().await.expect("connect");
        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let scheduler = CommandScheduler::start(
            Box::new(transport),
            Duration::from_millis(0),
            Arc::clone(&state),
        );

        // Two consecutive probe timeouts cross the threshold
        handle.drop_requests(2);
        let monitor = HealthMonitor::spawn(&test_config(1000, 2), scheduler.clone(), Arc::clone(&state));

        // Wait past two probes (each can burn its full timeout) and the reconnect
        tokio::time::sleep(Duration::from_millis(3500)).await;
        // Mock reconnect succeeds, so the worker restored Connected
        assert_eq!(*state.read().await, ConnectionState::Connected);
        assert!(logs_contain("Health probe failed"));

        // The next probe succeeds and keeps it there
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(*state.read().await, ConnectionState::Connected);

        monitor.stop().await;
        scheduler.shutdown().await;
    }
}
