//! Mock transport and relay-board simulator
//!
//! Backs `test_mode` and the test suite. Behaves like a bank of 16-relay
//! boards: write commands are echoed and tracked, read-coils requests answer
//! from the tracked state. Tests inspect traffic and inject failures through
//! a [`MockHandle`] that shares state with the transport after the scheduler
//! has taken ownership of it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::Transport;
use crate::error::{RelayError, Result};
use crate::modbus::constants::PULSE_REGISTER_BASE;
use crate::modbus::crc16;

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    /// Bytes staged for the next receive calls
    read_buffer: VecDeque<u8>,
    /// Raw responses that override the simulator, oldest first
    scripted: VecDeque<Vec<u8>>,
    /// Every frame written to the bus, in order
    sent_frames: Vec<Vec<u8>>,
    /// Simulated coil states, keyed by (board, 1-indexed coil)
    coils: HashMap<(u8, u8), bool>,
    /// Swallow this many requests without responding (forces timeouts)
    drop_next: u32,
    /// Fail this many send calls with a connection error
    fail_send_next: u32,
    /// Make connect attempts fail
    fail_connect: bool,
    /// A request is on the bus and its response has not been read yet
    awaiting_response: bool,
    /// Sends observed while a previous transaction was still in flight
    exclusivity_violations: u32,
}

/// Shared inspection/injection handle for a [`MockTransport`]
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// All frames sent so far
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().expect("mock state poisoned").sent_frames.clone()
    }

    /// Number of frames sent so far
    pub fn sent_count(&self) -> usize {
        self.state.lock().expect("mock state poisoned").sent_frames.len()
    }

    /// Forget recorded traffic
    pub fn clear_sent(&self) {
        self.state
            .lock()
            .expect("mock state poisoned")
            .sent_frames
            .clear();
    }

    /// Current simulated state of a coil
    pub fn coil(&self, board: u8, coil: u8) -> bool {
        *self
            .state
            .lock()
            .expect("mock state poisoned")
            .coils
            .get(&(board, coil))
            .unwrap_or(&false)
    }

    /// Force a coil state (e.g., to make verification fail)
    pub fn set_coil(&self, board: u8, coil: u8, on: bool) {
        self.state
            .lock()
            .expect("mock state poisoned")
            .coils
            .insert((board, coil), on);
    }

    /// Queue a raw response for the next request, bypassing the simulator
    pub fn script_response(&self, response: Vec<u8>) {
        self.state
            .lock()
            .expect("mock state poisoned")
            .scripted
            .push_back(response);
    }

    /// Swallow the next `n` requests so their callers time out
    pub fn drop_requests(&self, n: u32) {
        self.state.lock().expect("mock state poisoned").drop_next = n;
    }

    /// Fail the next `n` send calls with a connection error
    pub fn fail_sends(&self, n: u32) {
        self.state.lock().expect("mock state poisoned").fail_send_next = n;
    }

    /// Control whether connect attempts succeed
    pub fn fail_connect(&self, fail: bool) {
        self.state.lock().expect("mock state poisoned").fail_connect = fail;
    }

    /// Sends observed while a previous transaction was still in flight
    pub fn exclusivity_violations(&self) -> u32 {
        self.state
            .lock()
            .expect("mock state poisoned")
            .exclusivity_violations
    }
}

/// Mock transport implementation
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a new mock transport simulating an all-coils-off relay bank
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Shared handle for inspection and failure injection
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Simulate the relay board's reply to `frame`, mutating coil state
    fn simulate_response(state: &mut MockState, frame: &[u8]) -> Option<Vec<u8>> {
        if frame.len() < 4 {
            return None;
        }
        let board = frame[0];
        let function = frame[1];

        match function {
            // Write single coil: echo, track state. Addresses at or above
            // the pulse register base are the vendor timed-pulse command.
            0x05 if frame.len() >= 8 => {
                let address = u16::from_be_bytes([frame[2], frame[3]]);
                let value = u16::from_be_bytes([frame[4], frame[5]]);
                if address >= PULSE_REGISTER_BASE {
                    let coil = (address - PULSE_REGISTER_BASE) as u8 + 1;
                    state.coils.insert((board, coil), true);
                } else {
                    let coil = address as u8 + 1;
                    state.coils.insert((board, coil), value == 0xFF00);
                }
                Some(frame.to_vec())
            },
            // Write multiple coils: track each bit, respond with addr+qty
            0x0F if frame.len() >= 9 => {
                let address = u16::from_be_bytes([frame[2], frame[3]]);
                let quantity = u16::from_be_bytes([frame[4], frame[5]]);
                let data = &frame[7..frame.len() - 2];
                for i in 0..quantity as usize {
                    let on = data
                        .get(i / 8)
                        .map(|byte| (byte >> (i % 8)) & 0x01 != 0)
                        .unwrap_or(false);
                    let coil = (address as usize + i) as u8 + 1;
                    state.coils.insert((board, coil), on);
                }
                let mut response = vec![board, 0x0F];
                response.extend_from_slice(&address.to_be_bytes());
                response.extend_from_slice(&quantity.to_be_bytes());
                let crc = crc16(&response);
                response.extend_from_slice(&crc.to_le_bytes());
                Some(response)
            },
            // Read coils: answer from tracked state
            0x01 if frame.len() >= 8 => {
                let address = u16::from_be_bytes([frame[2], frame[3]]);
                let count = u16::from_be_bytes([frame[4], frame[5]]);
                let byte_count = (count as usize).div_ceil(8);
                let mut data = vec![0u8; byte_count];
                for i in 0..count as usize {
                    let coil = (address as usize + i) as u8 + 1;
                    if *state.coils.get(&(board, coil)).unwrap_or(&false) {
                        data[i / 8] |= 1 << (i % 8);
                    }
                }
                let mut response = vec![board, 0x01, byte_count as u8];
                response.extend_from_slice(&data);
                let crc = crc16(&response);
                response.extend_from_slice(&crc.to_le_bytes());
                Some(response)
            },
            _ => None,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> &str {
        "mock"
    }

    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state.lock().expect("mock state poisoned");
        if state.fail_connect {
            return Err(RelayError::Connection(
                "Mock connection failure".to_string(),
            ));
        }
        state.connected = true;
        debug!("Mock transport connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut state = self.state.lock().expect("mock state poisoned");
        state.connected = false;
        state.read_buffer.clear();
        state.awaiting_response = false;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock().expect("mock state poisoned");

        if !state.connected {
            return Err(RelayError::Connection("Not connected".to_string()));
        }
        if state.fail_send_next > 0 {
            state.fail_send_next -= 1;
            return Err(RelayError::Connection("Mock send failure".to_string()));
        }

        if state.awaiting_response {
            state.exclusivity_violations += 1;
        }
        state.awaiting_response = true;
        state.sent_frames.push(data.to_vec());

        if state.drop_next > 0 {
            state.drop_next -= 1;
            debug!("Mock transport swallowing request");
            return Ok(());
        }

        let response = match state.scripted.pop_front() {
            Some(scripted) => Some(scripted),
            None => Self::simulate_response(&mut state, data),
        };
        if let Some(response) = response {
            state.read_buffer.extend(response);
        }

        Ok(())
    }

    async fn receive(&mut self, buffer: &mut [u8], _timeout: Duration) -> Result<usize> {
        let mut state = self.state.lock().expect("mock state poisoned");

        if !state.connected {
            return Err(RelayError::Connection("Not connected".to_string()));
        }

        let n = buffer.len().min(state.read_buffer.len());
        for slot in buffer.iter_mut().take(n) {
            *slot = state.read_buffer.pop_front().expect("length checked");
        }
        if n > 0 {
            state.awaiting_response = false;
        }
        Ok(n)
    }

    fn is_connected(&self) -> bool {
        self.state.lock().expect("mock state poisoned").connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::{encode_read_coils, encode_write_single_coil};

    #[tokio::test]
    async fn test_connect_disconnect() {
        let mut transport = MockTransport::new();
        assert!(!transport.is_connected());
        transport.connect().await.expect("connect");
        assert!(transport.is_connected());
        transport.disconnect().await.expect("disconnect");
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_write_single_coil_echo_and_tracking() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        transport.connect().await.expect("connect");

        let request = encode_write_single_coil(1, 3, true);
        transport.send(&request).await.expect("send");

        let mut buf = [0u8; 64];
        let n = transport
            .receive(&mut buf, Duration::from_millis(10))
            .await
            .expect("receive");
        assert_eq!(&buf[..n], request.as_slice());
        assert!(handle.coil(1, 3));
        assert_eq!(handle.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_read_coils_reflects_state() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        transport.connect().await.expect("connect");
        handle.set_coil(2, 1, true);

        let request = encode_read_coils(2, 1, 1);
        transport.send(&request).await.expect("send");

        let mut buf = [0u8; 64];
        let n = transport
            .receive(&mut buf, Duration::from_millis(10))
            .await
            .expect("receive");
        let frame = crate::modbus::decode(&buf[..n]).expect("valid response");
        let states = crate::modbus::frame::decode_coil_status(&frame, 1).expect("status");
        assert_eq!(states, vec![true]);
    }

    #[tokio::test]
    async fn test_dropped_request_yields_no_data() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        transport.connect().await.expect("connect");
        handle.drop_requests(1);

        let request = encode_write_single_coil(1, 1, true);
        transport.send(&request).await.expect("send");

        let mut buf = [0u8; 64];
        let n = transport
            .receive(&mut buf, Duration::from_millis(10))
            .await
            .expect("receive");
        assert_eq!(n, 0);

        // Next request responds again
        transport.send(&request).await.expect("send");
        let n = transport
            .receive(&mut buf, Duration::from_millis(10))
            .await
            .expect("receive");
        assert!(n > 0);
    }

    #[tokio::test]
    async fn test_scripted_response_overrides_simulator() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        transport.connect().await.expect("connect");

        handle.script_response(vec![0xDE, 0xAD]);
        transport
            .send(&encode_write_single_coil(1, 1, true))
            .await
            .expect("send");

        let mut buf = [0u8; 64];
        let n = transport
            .receive(&mut buf, Duration::from_millis(10))
            .await
            .expect("receive");
        assert_eq!(&buf[..n], &[0xDE, 0xAD]);
    }

    #[tokio::test]
    async fn test_exclusivity_accounting() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        transport.connect().await.expect("connect");

        let request = encode_write_single_coil(1, 1, true);
        transport.send(&request).await.expect("send");
        // Second send before reading the first response is a violation
        transport.send(&request).await.expect("send");
        assert_eq!(handle.exclusivity_violations(), 1);
    }
}
