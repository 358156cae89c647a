//! Scripted in-memory transport for driver tests.

use super::Transport;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

#[derive(Default)]
struct MockBus {
    open: bool,
    refuse_open: u32,
    inbox: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    responder: Option<Responder>,
}

/// Shared view of a [`MockTransport`], kept by tests after the transport is
/// moved into a driver.
#[derive(Clone, Default)]
pub struct MockHandle {
    bus: Arc<Mutex<MockBus>>,
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockBus> {
        // A poisoned lock only means another test thread panicked.
        self.bus.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues bytes to be returned by subsequent reads.
    pub fn push_reply(&self, bytes: &[u8]) {
        self.lock().inbox.extend(bytes.iter().copied());
    }

    /// Installs a callback that produces a reply for every write.
    pub fn respond_with(&self, responder: impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static) {
        self.lock().responder = Some(Box::new(responder));
    }

    /// Makes the next `count` calls to `open` fail.
    pub fn refuse_open(&self, count: u32) {
        self.lock().refuse_open = count;
    }

    /// Every frame written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    /// Whether the transport is currently open.
    pub fn is_open(&self) -> bool {
        self.lock().open
    }
}

/// [`Transport`] answering writes through a scripted responder.
pub struct MockTransport {
    name: String,
    handle: MockHandle,
}

impl MockTransport {
    /// Closed transport named `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            handle: MockHandle::default(),
        }
    }

    /// Shared control handle; stays valid after the transport is boxed.
    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }

    fn take(&self, len: usize) -> AppResult<Vec<u8>> {
        let mut bus = self.handle.lock();
        if !bus.open {
            return Err(DaqError::comm(self.describe(), "transport not open"));
        }
        if bus.inbox.len() < len {
            return Err(DaqError::comm(self.describe(), "read timed out"));
        }
        Ok(bus.inbox.drain(..len).collect())
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn describe(&self) -> String {
        format!("mock://{}", self.name)
    }

    async fn open(&mut self) -> AppResult<()> {
        let mut bus = self.handle.lock();
        if bus.refuse_open > 0 {
            bus.refuse_open -= 1;
            return Err(DaqError::connect(self.describe(), "connection refused"));
        }
        bus.open = true;
        Ok(())
    }

    async fn close(&mut self) {
        let mut bus = self.handle.lock();
        bus.open = false;
        bus.inbox.clear();
    }

    async fn write_all(&mut self, bytes: &[u8]) -> AppResult<()> {
        let mut bus = self.handle.lock();
        if !bus.open {
            return Err(DaqError::comm(self.describe(), "transport not open"));
        }
        bus.written.push(bytes.to_vec());
        let reply = bus.responder.as_mut().and_then(|respond| respond(bytes));
        if let Some(reply) = reply {
            bus.inbox.extend(reply);
        }
        Ok(())
    }

    async fn read_until(&mut self, delimiter: u8, _limit: Duration) -> AppResult<Vec<u8>> {
        let position = {
            let bus = self.handle.lock();
            bus.inbox.iter().position(|&b| b == delimiter)
        };
        match position {
            Some(index) => self.take(index + 1),
            None => Err(DaqError::comm(self.describe(), "read timed out")),
        }
    }

    async fn read_exact(&mut self, len: usize, _limit: Duration) -> AppResult<Vec<u8>> {
        self.take(len)
    }
}
