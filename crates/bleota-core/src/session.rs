//! OTA Session - High-level orchestrator for the update.
//!
//! Every transport completion, the packetizer result and stop requests
//! funnel into one channel; the session consumes it on a single thread and
//! hands each event to the state handlers.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::config::OtaConfig;
use crate::error::OtaError;
use crate::events::{OtaEvent, OtaObserver, PacketDirection, TracingObserver};
use crate::payload::{FirmwareImage, PacketQueue, PacketizeError, Packetizer};
use crate::state::handlers::{HandleResult, HandlerContext, handle_event, handle_packets_ready};
use crate::state::machine::{OtaState, TransferContext};
use crate::transport::{BleTransport, Channel, EventSink, TransportError, TransportEvent};

/// Everything the session loop consumes.
#[derive(Debug)]
pub enum SessionEvent {
    /// Completion or notification from the transport.
    Transport(TransportEvent),
    /// Packetizer worker finished.
    PacketsReady {
        generation: u64,
        result: Result<PacketQueue, PacketizeError>,
    },
    /// External stop request.
    Stop,
}

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Device accepted the image.
    Completed,
    /// Stopped by the caller.
    Stopped,
}

pub type SessionResult = Result<SessionOutcome, OtaError>;

/// Cloneable handle that asks a running session to stop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    sender: Sender<SessionEvent>,
}

impl StopHandle {
    /// Returns `false` if the session is gone.
    pub fn stop(&self) -> bool {
        self.sender.send(SessionEvent::Stop).is_ok()
    }
}

/// OTA Session - drives one firmware update over one transport.
pub struct OtaSession<T: BleTransport, O: OtaObserver> {
    config: OtaConfig,
    transport: T,
    observer: Arc<O>,
    image: FirmwareImage,
    /// Present from `start` until teardown.
    context: Option<TransferContext>,
    last_state: OtaState,
    outcome: Option<SessionResult>,
    sender: Sender<SessionEvent>,
    receiver: Receiver<SessionEvent>,
    worker: Option<JoinHandle<()>>,
}

impl<T: BleTransport> OtaSession<T, TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: OtaConfig, transport: T, image: FirmwareImage) -> Self {
        Self::with_observer(config, transport, image, Arc::new(TracingObserver))
    }
}

impl<T: BleTransport, O: OtaObserver + 'static> OtaSession<T, O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(
        config: OtaConfig,
        transport: T,
        image: FirmwareImage,
        observer: Arc<O>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            config,
            transport,
            observer,
            image,
            context: None,
            last_state: OtaState::Idle,
            outcome: None,
            sender,
            receiver,
            worker: None,
        }
    }

    pub fn state(&self) -> OtaState {
        self.context
            .as_ref()
            .map_or(self.last_state, |ctx| ctx.state)
    }

    /// Final result, once the session has ended.
    pub fn outcome(&self) -> Option<&SessionResult> {
        self.outcome.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            sender: self.sender.clone(),
        }
    }

    /// Connect and begin the update. The rest happens as events arrive.
    #[instrument(skip(self), fields(peer = %self.transport.peer(), image_len = self.image.len()))]
    pub fn start(&mut self) -> Result<(), OtaError> {
        if self.context.is_some() || self.outcome.is_some() {
            warn!("Session already started; create a new session to retry");
            return Ok(());
        }
        if let Err(e) = self.config.validate() {
            return Err(self.fail(e.into()));
        }

        info!(sectors = self.image.sector_count(self.config.sector_size), "Starting OTA session");
        self.context = Some(TransferContext::new(
            self.image.len(),
            self.config.sector_size,
            self.config.fallback_packet_size,
        ));
        match self.transport.connect(EventSink::new(self.sender.clone())) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e.into())),
        }
    }

    /// Tear the session down. In-flight completions are ignored afterwards.
    pub fn stop(&mut self) {
        if self.outcome.is_some() {
            return;
        }
        info!(state = %self.state(), "Stopping OTA session");
        self.teardown();
        self.outcome = Some(Ok(SessionOutcome::Stopped));
    }

    /// Handle one event.
    pub fn dispatch(&mut self, event: SessionEvent) {
        if matches!(event, SessionEvent::Stop) {
            self.stop();
            return;
        }
        if let SessionEvent::PacketsReady { .. } = &event
            && let Some(worker) = self.worker.take()
        {
            let _ = worker.join();
        }
        let Some(state) = self.context.as_mut() else {
            debug!(?event, "No active transfer, dropping event");
            return;
        };

        let transport = ObservableTransport {
            inner: &self.transport,
            observer: &self.observer,
        };
        let mut ctx = HandlerContext {
            transport: &transport,
            observer: self.observer.as_ref(),
            state,
            config: &self.config,
        };
        let result = match event {
            SessionEvent::Transport(event) => handle_event(event, &mut ctx),
            SessionEvent::PacketsReady { generation, result } => {
                handle_packets_ready(generation, result, &mut ctx)
            }
            // handled above
            SessionEvent::Stop => Ok(HandleResult::Continue),
        };

        match result {
            Ok(HandleResult::Continue) => {}
            Ok(HandleResult::BuildPackets {
                generation,
                packet_size,
            }) => {
                if let Err(e) = self.spawn_packetizer(generation, packet_size) {
                    self.fail(e);
                }
            }
            Ok(HandleResult::Complete) => {
                info!("OTA session complete");
                self.teardown();
                self.outcome = Some(Ok(SessionOutcome::Completed));
            }
            Err(e) => {
                self.fail(e);
            }
        }
    }

    /// Wait up to `timeout` for one event and handle it.
    pub fn step(&mut self, timeout: Duration) -> Option<SessionResult> {
        if self.outcome.is_none() {
            match self.receiver.recv_timeout(timeout) {
                Ok(event) => self.dispatch(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.fail(OtaError::Disconnected);
                }
            }
        }
        self.outcome.clone()
    }

    /// Handle every queued event without blocking.
    pub fn poll(&mut self) -> Option<SessionResult> {
        while self.outcome.is_none() {
            match self.receiver.try_recv() {
                Ok(event) => self.dispatch(event),
                Err(_) => break,
            }
        }
        self.outcome.clone()
    }

    /// Run the session to the end, starting it if needed.
    #[instrument(skip(self))]
    pub fn run(&mut self) -> SessionResult {
        if self.context.is_none() && self.outcome.is_none() {
            self.start()?;
        }
        loop {
            if let Some(outcome) = &self.outcome {
                return outcome.clone();
            }
            match self.receiver.recv() {
                Ok(event) => self.dispatch(event),
                Err(_) => return Err(self.fail(OtaError::Disconnected)),
            }
        }
    }

    fn spawn_packetizer(&mut self, generation: u64, packet_size: usize) -> Result<(), OtaError> {
        let packetizer = Packetizer::new(packet_size, self.config.sector_size)?;
        let image = self.image.clone();
        let sender = self.sender.clone();
        debug!(generation, packet_size, "Spawning packetizer");
        let handle = thread::Builder::new()
            .name("ota-packetizer".into())
            .spawn(move || {
                let result = packetizer.packetize(image.as_bytes());
                let _ = sender.send(SessionEvent::PacketsReady { generation, result });
            })
            .map_err(|e| OtaError::Packetize(e.to_string()))?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Enter `Failed`, report, tear down. Returns the error for `?` sites.
    fn fail(&mut self, error: OtaError) -> OtaError {
        let from = self.state();
        if from != OtaState::Failed {
            if let Some(ctx) = self.context.as_mut() {
                ctx.goto_state(OtaState::Failed);
            }
            self.observer.on_event(&OtaEvent::StateChanged {
                from,
                to: OtaState::Failed,
            });
        }
        warn!(code = error.code(), error = %error, "OTA session failed");
        self.observer.on_event(&OtaEvent::Error {
            code: error.code(),
            message: error.to_string(),
        });
        self.last_state = OtaState::Failed;
        self.teardown();
        self.outcome = Some(Err(error.clone()));
        error
    }

    /// Release buffers and the link; drop the worker.
    fn teardown(&mut self) {
        if let Some(mut ctx) = self.context.take() {
            self.last_state = ctx.state;
            ctx.release();
            self.transport.disconnect();
        }
        // A late result fails the generation check.
        self.worker = None;
    }
}

/// Transport wrapper that emits packet events.
struct ObservableTransport<'a, T: BleTransport, O: OtaObserver> {
    inner: &'a T,
    observer: &'a Arc<O>,
}

impl<'a, T: BleTransport, O: OtaObserver> BleTransport for ObservableTransport<'a, T, O> {
    fn connect(&self, sink: EventSink) -> Result<(), TransportError> {
        self.inner.connect(sink)
    }

    fn request_mtu(&self, mtu: u16) -> Result<(), TransportError> {
        self.inner.request_mtu(mtu)
    }

    fn discover_services(&self) -> Result<(), TransportError> {
        self.inner.discover_services()
    }

    fn enable_notification(&self, channel: Channel) -> Result<(), TransportError> {
        self.inner.enable_notification(channel)
    }

    fn write(&self, channel: Channel, data: &[u8]) -> Result<(), TransportError> {
        let res = self.inner.write(channel, data);
        if res.is_ok() {
            self.observer.on_event(&OtaEvent::Packet {
                direction: PacketDirection::Tx,
                channel,
                length: data.len(),
            });
        }
        res
    }

    fn disconnect(&self) {
        self.inner.disconnect()
    }

    fn peer(&self) -> String {
        self.inner.peer()
    }
}
