//! Mock BLE transport for testing.

use std::sync::{Arc, Mutex};

use super::traits::{BleTransport, Channel, EventSink, TransportError, TransportEvent};

/// Request issued by the session, as captured by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportRequest {
    Connect,
    RequestMtu(u16),
    DiscoverServices,
    EnableNotification(Channel),
    Write { channel: Channel, data: Vec<u8> },
    Disconnect,
}

/// Mock transport for unit testing state machine logic.
///
/// Records every request and never answers on its own; tests answer by
/// pushing events with [`MockTransport::emit`]. Clones share state.
#[derive(Clone)]
pub struct MockTransport {
    /// Captured requests.
    request_log: Arc<Mutex<Vec<TransportRequest>>>,
    /// Sink captured on connect.
    sink: Arc<Mutex<Option<EventSink>>>,
    /// Whether the link is "up".
    connected: Arc<Mutex<bool>>,
    /// Reject MTU requests synchronously.
    reject_mtu: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            request_log: Arc::new(Mutex::new(Vec::new())),
            sink: Arc::new(Mutex::new(None)),
            connected: Arc::new(Mutex::new(true)),
            reject_mtu: Arc::new(Mutex::new(false)),
        }
    }

    /// Deliver an event to the session, as the stack would.
    pub fn emit(&self, event: TransportEvent) -> bool {
        match self.sink.lock().unwrap().as_ref() {
            Some(sink) => sink.emit(event),
            None => false,
        }
    }

    /// Get all captured requests.
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.request_log.lock().unwrap().clone()
    }

    /// Data written to one channel, in order.
    pub fn writes_to(&self, channel: Channel) -> Vec<Vec<u8>> {
        self.request_log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| match r {
                TransportRequest::Write { channel: c, data } if *c == channel => {
                    Some(data.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Most recent request, if any.
    pub fn last_request(&self) -> Option<TransportRequest> {
        self.request_log.lock().unwrap().last().cloned()
    }

    /// Clear captured requests.
    pub fn clear_requests(&self) {
        self.request_log.lock().unwrap().clear();
    }

    /// Make `request_mtu` fail synchronously.
    pub fn reject_mtu_requests(&self) {
        *self.reject_mtu.lock().unwrap() = true;
    }

    /// Simulate link loss: later requests fail with `Disconnected`.
    pub fn drop_link(&self) {
        *self.connected.lock().unwrap() = false;
    }

    fn record(&self, request: TransportRequest) -> Result<(), TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Disconnected);
        }
        self.request_log.lock().unwrap().push(request);
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl BleTransport for MockTransport {
    fn connect(&self, sink: EventSink) -> Result<(), TransportError> {
        self.record(TransportRequest::Connect)?;
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn request_mtu(&self, mtu: u16) -> Result<(), TransportError> {
        if *self.reject_mtu.lock().unwrap() {
            return Err(TransportError::RequestRejected("MTU request".into()));
        }
        self.record(TransportRequest::RequestMtu(mtu))
    }

    fn discover_services(&self) -> Result<(), TransportError> {
        self.record(TransportRequest::DiscoverServices)
    }

    fn enable_notification(&self, channel: Channel) -> Result<(), TransportError> {
        self.record(TransportRequest::EnableNotification(channel))
    }

    fn write(&self, channel: Channel, data: &[u8]) -> Result<(), TransportError> {
        self.record(TransportRequest::Write {
            channel,
            data: data.to_vec(),
        })
    }

    fn disconnect(&self) {
        self.request_log
            .lock()
            .unwrap()
            .push(TransportRequest::Disconnect);
    }

    fn peer(&self) -> String {
        "mock".to_string()
    }
}
