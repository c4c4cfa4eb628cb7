//! Bus command scheduler
//!
//! Total ordering for all bus traffic. Callers enqueue transactions through
//! a cloneable handle; a single worker task owns the transport and processes
//! the queue strictly FIFO with exactly one command in flight, enforcing a
//! minimum quiescence window between the end of one transaction and the
//! start of the next (relay-board firmware requirement).
//!
//! Queued-but-unsent commands can be cancelled through their cancellation
//! token; a command already on the wire runs to its timeout so the bus is
//! never left mid-transaction for the next command.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::modbus::constants::{EXCEPTION_RESPONSE_LEN, RESPONSE_BUFFER_SIZE};
use crate::transport::{ConnectionState, Transport};

/// Queue depth; transactions beyond this apply backpressure to callers
const QUEUE_CAPACITY: usize = 32;

/// Poll interval while waiting for response bytes to trickle in
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A single request/response exchange on the bus
#[derive(Debug)]
pub struct BusTransaction {
    /// Complete wire-ready request frame
    pub request: Vec<u8>,
    /// Expected response length in bytes
    pub expected_len: usize,
    /// Response deadline measured from the moment the request hits the wire
    pub timeout: Duration,
    /// Cancels the transaction while it is still queued
    pub cancel: CancellationToken,
    /// Enqueue instant, for queue-latency diagnostics
    pub enqueued_at: Instant,
    /// Reply channel consumed on terminal success/failure
    pub respond_to: oneshot::Sender<Result<Vec<u8>>>,
}

#[derive(Debug)]
enum BusRequest {
    Transaction(BusTransaction),
    Reconnect {
        respond_to: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable handle to the scheduler worker
#[derive(Debug, Clone)]
pub struct CommandScheduler {
    tx: mpsc::Sender<BusRequest>,
    shutdown: CancellationToken,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CommandScheduler {
    /// Spawn the worker task that takes ownership of `transport`.
    ///
    /// The shared `state` is driven to `Disconnected` on transport failures
    /// and back to `Connected` on successful reconnects.
    pub fn start(
        mut transport: Box<dyn Transport>,
        command_interval: Duration,
        state: Arc<RwLock<ConnectionState>>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<BusRequest>(QUEUE_CAPACITY);
        let shutdown = CancellationToken::new();
        let worker_shutdown = shutdown.clone();

        let worker = tokio::spawn(async move {
            let mut last_end: Option<Instant> = None;

            loop {
                let request = tokio::select! {
                    _ = worker_shutdown.cancelled() => break,
                    request = rx.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };

                match request {
                    BusRequest::Transaction(txn) => {
                        if txn.cancel.is_cancelled() {
                            let _ = txn.respond_to.send(Err(RelayError::Cancelled));
                            continue;
                        }

                        // Firmware needs quiescence between transactions
                        if let Some(end) = last_end {
                            tokio::time::sleep_until(end + command_interval).await;
                        }

                        let queued_for = txn.enqueued_at.elapsed();
                        if queued_for > Duration::from_secs(1) {
                            debug!("Transaction queued for {:?} before dispatch", queued_for);
                        }

                        let result =
                            run_transaction(transport.as_mut(), &txn.request, txn.expected_len, txn.timeout)
                                .await;

                        if matches!(result, Err(RelayError::Connection(_))) {
                            *state.write().await = ConnectionState::Disconnected;
                        }

                        last_end = Some(Instant::now());
                        let _ = txn.respond_to.send(result);
                    },
                    BusRequest::Reconnect { respond_to } => {
                        info!("Reconnecting transport");
                        let _ = transport.disconnect().await;
                        let result = transport.connect().await;
                        match &result {
                            Ok(()) => *state.write().await = ConnectionState::Connected,
                            Err(e) => {
                                warn!("Reconnect failed: {e}");
                                *state.write().await = ConnectionState::Disconnected;
                            },
                        }
                        last_end = Some(Instant::now());
                        let _ = respond_to.send(result);
                    },
                }
            }

            // Drain whatever is still queued so callers unblock
            rx.close();
            while let Ok(request) = rx.try_recv() {
                match request {
                    BusRequest::Transaction(txn) => {
                        let _ = txn.respond_to.send(Err(RelayError::Shutdown));
                    },
                    BusRequest::Reconnect { respond_to } => {
                        let _ = respond_to.send(Err(RelayError::Shutdown));
                    },
                }
            }
            let _ = transport.disconnect().await;
            debug!("Scheduler worker stopped");
        });

        Self {
            tx,
            shutdown,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    /// Enqueue a request frame and await its response.
    pub async fn transact(
        &self,
        request: Vec<u8>,
        expected_len: usize,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>> {
        let (respond_to, response) = oneshot::channel();
        let txn = BusTransaction {
            request,
            expected_len,
            timeout,
            cancel,
            enqueued_at: Instant::now(),
            respond_to,
        };

        self.tx
            .send(BusRequest::Transaction(txn))
            .await
            .map_err(|_| RelayError::Shutdown)?;

        response.await.map_err(|_| RelayError::Shutdown)?
    }

    /// Ask the worker to drop and reopen the transport handle.
    pub async fn reconnect(&self) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.tx
            .send(BusRequest::Reconnect { respond_to })
            .await
            .map_err(|_| RelayError::Shutdown)?;
        response.await.map_err(|_| RelayError::Shutdown)?
    }

    /// Stop the worker; queued commands complete with [`RelayError::Shutdown`].
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Execute one request/response exchange against the transport.
///
/// Accumulates response bytes until `expected_len` is reached, switching to
/// the short exception length when the function code carries the error bit.
async fn run_transaction(
    transport: &mut dyn Transport,
    request: &[u8],
    expected_len: usize,
    timeout: Duration,
) -> Result<Vec<u8>> {
    transport.send(request).await?;

    let deadline = Instant::now() + timeout;
    let mut response: Vec<u8> = Vec::with_capacity(expected_len);
    let mut buffer = [0u8; RESPONSE_BUFFER_SIZE];

    loop {
        let wanted = if response.len() >= 2 && response[1] & 0x80 != 0 {
            EXCEPTION_RESPONSE_LEN
        } else {
            expected_len
        };
        if response.len() >= wanted {
            response.truncate(wanted);
            return Ok(response);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(RelayError::Timeout(format!(
                "No complete response within {timeout:?} ({} of {wanted} bytes)",
                response.len()
            )));
        }

        let remaining = deadline - now;
        match transport.receive(&mut buffer, remaining).await {
            Ok(0) => {
                // Nothing on the wire yet; poll again shortly
                tokio::time::sleep(RECEIVE_POLL_INTERVAL.min(remaining)).await;
            },
            Ok(n) => response.extend_from_slice(&buffer[..n]),
            Err(RelayError::Timeout(_)) => {
                return Err(RelayError::Timeout(format!(
                    "No complete response within {timeout:?} ({} of {wanted} bytes)",
                    response.len()
                )));
            },
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::constants::WRITE_ECHO_LEN;
    use crate::modbus::{crc16, encode_write_single_coil};
    use crate::transport::MockTransport;

    fn start_scheduler(
        transport: MockTransport,
        interval: Duration,
    ) -> (CommandScheduler, Arc<RwLock<ConnectionState>>) {
        let state = Arc::new(RwLock::new(ConnectionState::Connected));
        let scheduler = CommandScheduler::start(Box::new(transport), interval, Arc::clone(&state));
        (scheduler, state)
    }

    #[tokio::test]
    async fn test_transact_round_trip() {
        let mut transport = MockTransport::new();
        transport.connect().await.expect("connect");
        let (scheduler, _state) = start_scheduler(transport, Duration::from_millis(0));

        let request = encode_write_single_coil(1, 1, true);
        let response = scheduler
            .transact(
                request.clone(),
                WRITE_ECHO_LEN,
                Duration::from_millis(100),
                CancellationToken::new(),
            )
            .await
            .expect("echo response");
        assert_eq!(response, request);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_on_dropped_response() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        transport.connect().await.expect("connect");
        handle.drop_requests(1);
        let (scheduler, _state) = start_scheduler(transport, Duration::from_millis(0));

        let result = scheduler
            .transact(
                encode_write_single_coil(1, 1, true),
                WRITE_ECHO_LEN,
                Duration::from_millis(100),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(RelayError::Timeout(_))));

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let mut transport = MockTransport::new();
        transport.connect().await.expect("connect");
        let (scheduler, _state) = start_scheduler(transport, Duration::from_millis(0));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = scheduler
            .transact(
                encode_write_single_coil(1, 1, true),
                WRITE_ECHO_LEN,
                Duration::from_millis(100),
                cancel,
            )
            .await;
        assert!(matches!(result, Err(RelayError::Cancelled)));

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inter_command_spacing() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        transport.connect().await.expect("connect");
        let (scheduler, _state) = start_scheduler(transport, Duration::from_millis(50));

        let request = encode_write_single_coil(1, 1, true);
        let started = Instant::now();
        for _ in 0..3 {
            scheduler
                .transact(
                    request.clone(),
                    WRITE_ECHO_LEN,
                    Duration::from_millis(100),
                    CancellationToken::new(),
                )
                .await
                .expect("echo response");
        }
        // Two 50 ms gaps must separate the three transactions
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(handle.sent_count(), 3);
        assert_eq!(handle.exclusivity_violations(), 0);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_exception_length_short_circuit() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        transport.connect().await.expect("connect");

        // Script an exception response shorter than the expected echo
        let mut exception = vec![0x01, 0x85, 0x02];
        let crc = crc16(&exception);
        exception.extend_from_slice(&crc.to_le_bytes());
        handle.script_response(exception.clone());

        let (scheduler, _state) = start_scheduler(transport, Duration::from_millis(0));
        let response = scheduler
            .transact(
                encode_write_single_coil(1, 1, true),
                WRITE_ECHO_LEN,
                Duration::from_millis(100),
                CancellationToken::new(),
            )
            .await
            .expect("exception bytes are still a response");
        assert_eq!(response, exception);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_transact_after_shutdown() {
        let mut transport = MockTransport::new();
        transport.connect().await.expect("connect");
        let (scheduler, _state) = start_scheduler(transport, Duration::from_millis(0));
        scheduler.shutdown().await;

        let result = scheduler
            .transact(
                encode_write_single_coil(1, 1, true),
                WRITE_ECHO_LEN,
                Duration::from_millis(100),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(result, Err(RelayError::Shutdown)));
    }
}
