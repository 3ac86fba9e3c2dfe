//! Mock sensor transport for testing.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{Notification, SensorTransport, TransportError};

#[derive(Default)]
struct MockState {
    /// One-shot read responses, consumed before the register value.
    read_queue: HashMap<u16, VecDeque<Vec<u8>>>,
    /// Last written (or preset) value per handle.
    registers: HashMap<u16, Vec<u8>>,
    /// Queued notifications.
    notifications: VecDeque<Notification>,
    /// Captured writes.
    write_log: Vec<(u16, Vec<u8>)>,
    /// Handles whose writes fail.
    failing_writes: HashSet<u16>,
    connected: bool,
    connect_count: usize,
}

/// Scripted transport for unit testing session logic.
///
/// Clones share state, so a test can keep a handle after moving the
/// transport into a controller.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    address: String,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                connected: true,
                ..MockState::default()
            })),
            address: "00:00:00:00:00:00".to_string(),
        }
    }

    /// Queue a one-shot response for the next read of `handle`.
    pub fn queue_read(&self, handle: u16, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .read_queue
            .entry(handle)
            .or_default()
            .push_back(data.to_vec());
    }

    /// Preset the value returned by reads of `handle` once its queue is empty.
    pub fn set_value(&self, handle: u16, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .registers
            .insert(handle, data.to_vec());
    }

    /// Queue a notification.
    pub fn queue_notification(&self, handle: u16, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .notifications
            .push_back(Notification::new(handle, data));
    }

    /// Make every write to `handle` fail.
    pub fn fail_writes_to(&self, handle: u16) {
        self.state.lock().unwrap().failing_writes.insert(handle);
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<(u16, Vec<u8>)> {
        self.state.lock().unwrap().write_log.clone()
    }

    /// Captured writes to a single handle.
    pub fn writes_to(&self, handle: u16) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .write_log
            .iter()
            .filter(|(h, _)| *h == handle)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.state.lock().unwrap().write_log.clear();
    }

    /// Simulate a link drop.
    pub fn drop_link(&self) {
        self.state.lock().unwrap().connected = false;
    }

    /// Number of successful `connect` calls.
    pub fn connect_count(&self) -> usize {
        self.state.lock().unwrap().connect_count
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorTransport for MockTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.connected = true;
        state.connect_count += 1;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.state.lock().unwrap().connected = false;
        Ok(())
    }

    fn read_characteristic(&mut self, handle: u16) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        if let Some(data) = state.read_queue.get_mut(&handle).and_then(|q| q.pop_front()) {
            return Ok(data);
        }
        state
            .registers
            .get(&handle)
            .cloned()
            .ok_or_else(|| TransportError::ReadFailed {
                handle,
                message: "no scripted value".into(),
            })
    }

    fn write_characteristic(&mut self, handle: u16, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        if state.failing_writes.contains(&handle) {
            return Err(TransportError::WriteFailed {
                handle,
                message: "scripted failure".into(),
            });
        }
        state.write_log.push((handle, data.to_vec()));
        state.registers.insert(handle, data.to_vec());
        Ok(())
    }

    fn wait_for_notification(
        &mut self,
        _timeout: Duration,
    ) -> Result<Option<Notification>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        Ok(state.notifications.pop_front())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn address(&self) -> &str {
        &self.address
    }
}
