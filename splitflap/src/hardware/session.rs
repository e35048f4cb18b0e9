use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, trace, warn};
use parking_lot::RwLock;
use prost::Message;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{timeout_at, Instant};

use crate::errors::{Error, ProtocolError, SessionError};
use crate::io::codec::{encode_frame, FrameDecoder};
use crate::io::serial::READ_TIMEOUT;
use crate::io::{
    from_splitflap, FromSplitflap, GeneralState, IoTransport, ModuleConfig, Serial,
    SplitflapConfig, SplitflapState, ToSplitflap,
};
use crate::utils::task::{ensure_runtime, TaskHandler, TaskResult};
use crate::utils::{format_as_hex, EventHandler, EventManager};

/// Size of a single transport read.
const READ_CHUNK: usize = 64;

/// How long the writer waits for an ack before resending a message.
pub const RETRY_TIMEOUT: Duration = Duration::from_millis(250);

/// How many times a message is written before giving up on its ack.
pub const MAX_ATTEMPTS: usize = 10;

/// Flap characters of the legacy 40-flap modules, in flap order.
pub const LEGACY_FLAPS: &str = " ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789.,'";

/// Lists all events a Splitflap can emit/listen: one per message type the device sends.
pub enum SplitflapEvent {
    /// Triggered with a [`SplitflapState`] whenever the device reports its modules.
    OnState,
    /// Triggered with a [`Log`](crate::io::Log) line printed by the firmware.
    OnLog,
    /// Triggered with the [`Ack`](crate::io::Ack) of a message sent by the host.
    OnAck,
    /// Triggered with a [`GeneralState`] (uptime, flap character set...).
    OnGeneralState,
}

/// Convert events to string to facilitate usage with [`EventManager`].
impl From<SplitflapEvent> for String {
    fn from(value: SplitflapEvent) -> Self {
        let event = match value {
            SplitflapEvent::OnState => "splitflap_state",
            SplitflapEvent::OnLog => "log",
            SplitflapEvent::OnAck => "ack",
            SplitflapEvent::OnGeneralState => "general_state",
        };
        event.into()
    }
}

/// What the session knows about the device.
#[derive(Clone, Debug, Default)]
pub struct SplitflapData {
    pub connected: bool,
    /// The latest state received.
    pub state: Option<SplitflapState>,
    /// The latest general state received.
    pub general_state: Option<GeneralState>,
    /// The configuration the host drives the modules with.
    pub config: Option<SplitflapConfig>,
}

impl SplitflapData {
    /// Number of modules reported by the latest state.
    pub fn num_modules(&self) -> Option<usize> {
        self.state.as_ref().map(|state| state.modules.len())
    }

    /// Stores a state: the configuration is (re)built from the current flaps when the module
    /// count changes, so untouched modules stay where they are.
    fn record_state(&mut self, state: &SplitflapState) {
        let known = self
            .config
            .as_ref()
            .is_some_and(|config| config.modules.len() == state.modules.len());
        if !known {
            debug!("Splitflap reports {} modules", state.modules.len());
            self.config = Some(SplitflapConfig {
                modules: state
                    .modules
                    .iter()
                    .map(|module| ModuleConfig {
                        target_flap_index: module.flap_index,
                        ..Default::default()
                    })
                    .collect(),
            });
        }
        self.state = Some(state.clone());
    }
}

#[derive(Debug)]
struct OutgoingMessage {
    nonce: u32,
    frame: Vec<u8>,
    state_request: bool,
}

/// A session with a splitflap display controller.
///
/// The session is not connected until [`Splitflap::open`] is called. Once open, it runs three
/// workers: a reader decoding incoming frames, a dispatcher feeding the registered handlers and
/// a writer sending queued messages until the device acknowledges them.
///
/// Dropping an open session shuts it down; [`Splitflap::close`] does the same and also waits for
/// the reader to finish.
#[derive(Debug)]
pub struct Splitflap {
    transport: Box<dyn IoTransport>,
    events: EventManager,
    data: Arc<RwLock<SplitflapData>>,
    outgoing: Option<UnboundedSender<OutgoingMessage>>,
    next_nonce: AtomicU32,
    running: Arc<AtomicBool>,
    /// Set while a state request waits in the queue.
    pending_request: Arc<AtomicBool>,
    read_timeout: Duration,
    retry_timeout: Duration,
    max_attempts: usize,
    reader: Option<TaskHandler>,
    workers: Vec<TaskHandler>,
}

impl Default for Splitflap {
    /// Creates a session on the first available serial port.
    ///
    /// **_/!\ The session will NOT be connected until the [`Splitflap::open`] method is called._**
    fn default() -> Self {
        Self::new(Serial::default())
    }
}

impl From<Serial> for Splitflap {
    fn from(transport: Serial) -> Self {
        Self::new(transport)
    }
}

/// Opens a session with the splitflap connected to `port`.
///
/// The session is released by [`Splitflap::close`] or when dropped.
///
/// # Errors
/// * `RuntimeError`: not called from inside a tokio runtime.
/// * `ProtocolError`: the port cannot be opened.
pub fn splitflap_context<P: Into<String>>(port: P) -> Result<Splitflap, Error> {
    Splitflap::from(Serial::new(port)).open()
}

impl Splitflap {
    /// Creates a session using a given transport.
    ///
    /// # Example
    /// ```no_run
    /// use splitflap::hardware::Splitflap;
    /// use splitflap::io::Serial;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let session = Splitflap::new(Serial::new("/dev/ttyUSB0")).open();
    /// }
    /// ```
    pub fn new<T: IoTransport + 'static>(transport: T) -> Self {
        Self {
            transport: Box::new(transport),
            events: EventManager::default(),
            data: Arc::new(RwLock::new(SplitflapData::default())),
            outgoing: None,
            next_nonce: AtomicU32::new(Utc::now().timestamp_subsec_nanos()),
            running: Arc::new(AtomicBool::new(false)),
            pending_request: Arc::new(AtomicBool::new(false)),
            read_timeout: READ_TIMEOUT,
            retry_timeout: RETRY_TIMEOUT,
            max_attempts: MAX_ATTEMPTS,
            reader: None,
            workers: vec![],
        }
    }

    /// Sets how long a transport read may block: the reader notices a shutdown within that delay.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Sets how long to wait for each ack and how many times a message is written.
    pub fn with_retry_policy(mut self, retry_timeout: Duration, max_attempts: usize) -> Self {
        self.retry_timeout = retry_timeout;
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Opens the transport and starts the session workers.
    ///
    /// # Errors
    /// * `RuntimeError`: not called from inside a tokio runtime.
    /// * `ProtocolError`: the transport cannot be opened.
    pub fn open(mut self) -> Result<Self, Error> {
        if self.outgoing.is_some() {
            return Ok(self);
        }
        let runtime = ensure_runtime()?;
        self.transport.open()?;
        self.transport.set_timeout(self.read_timeout)?;
        self.running.store(true, Ordering::SeqCst);
        self.pending_request.store(false, Ordering::SeqCst);
        self.data.write().connected = true;

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();

        let transport = self.transport.clone();
        let running = self.running.clone();
        self.reader = Some(
            runtime.spawn_blocking(move || read_loop(transport, running, ack_tx, message_tx)),
        );
        self.workers.push(runtime.spawn(dispatch_loop(
            self.events.clone(),
            self.data.clone(),
            message_rx,
        )));
        self.workers.push(runtime.spawn(write_loop(
            self.transport.clone(),
            self.running.clone(),
            self.pending_request.clone(),
            outgoing_rx,
            ack_rx,
            self.retry_timeout,
            self.max_attempts,
        )));
        self.outgoing = Some(outgoing_tx);

        trace!("Session opened: {}", self);
        Ok(self)
    }

    /// Stops the workers, waits for the reader and closes the transport.
    pub async fn close(mut self) -> Result<(), Error> {
        self.stop();
        if let Some(reader) = self.reader.take() {
            if let Err(error) = reader.await {
                warn!("Reader stopped abnormally: {}", error);
            }
        }
        self.data.write().connected = false;
        trace!("Session closed: {}", self);
        self.transport.close()
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.outgoing = None;
        for worker in self.workers.drain(..) {
            worker.abort();
        }
    }

    /// Registers a handler for a message type.
    ///
    /// # Parameters
    /// * `event` - a [`SplitflapEvent`] or the message-type name (`splitflap_state`, `log`, `ack`, `general_state`)
    /// * `callback` - an async callback receiving the message. It is only called when its parameter
    ///   type matches the message type.
    ///
    /// # Example
    /// ```no_run
    /// use splitflap::hardware::{splitflap_context, SplitflapEvent};
    /// use splitflap::io::SplitflapState;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let session = splitflap_context("/dev/ttyUSB0").unwrap();
    ///     session.on(SplitflapEvent::OnState, |state: SplitflapState| async move {
    ///         println!("{} modules", state.modules.len());
    ///     });
    /// }
    /// ```
    pub fn on<S, F, T, Fut>(&self, event: S, callback: F) -> EventHandler
    where
        S: Into<String>,
        T: 'static + Send + Sync + Clone,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: std::future::Future + Send + 'static,
        Fut::Output: Into<TaskResult>,
    {
        self.events.on(event, callback)
    }

    /// Removes a handler registered with [`Splitflap::on`].
    pub fn unregister(&self, handler: EventHandler) {
        self.events.unregister(handler)
    }

    /// Asks the device for a [`SplitflapState`].
    ///
    /// At most one request waits in the queue: asking again before the writer picks it up is a
    /// no-op, so a silent device never piles up stale requests.
    pub fn request_state(&self) -> Result<(), Error> {
        self.ensure_running()?;
        if self.pending_request.swap(true, Ordering::SeqCst) {
            trace!("State request already queued");
            return Ok(());
        }
        self.send(ToSplitflap::request_state, true).map_err(|error| {
            self.pending_request.store(false, Ordering::SeqCst);
            error
        })
    }

    /// Moves the first `positions.len()` modules to the given flap indices.
    ///
    /// # Parameters
    /// * `positions` - one target flap per module, `None` leaves the module untouched
    /// * `force_full_rotation` - rotate the targeted modules even if they already show their target
    ///   (except those sent to flap 0, the blank one)
    ///
    /// # Errors
    /// * `UnknownModuleCount`: no state has been received yet.
    /// * `TooManyModules`: more positions than modules.
    pub fn set_positions(
        &self,
        positions: &[Option<u32>],
        force_full_rotation: bool,
    ) -> Result<(), Error> {
        let config = {
            let mut data = self.data.write();
            let available = data
                .num_modules()
                .ok_or(SessionError::UnknownModuleCount)?;
            if positions.len() > available {
                return Err(SessionError::TooManyModules {
                    given: positions.len(),
                    available,
                }
                .into());
            }
            let config = data
                .config
                .as_mut()
                .ok_or(SessionError::UnknownModuleCount)?;
            for (module, position) in config.modules.iter_mut().zip(positions) {
                if let Some(position) = position {
                    module.target_flap_index = *position;
                    if force_full_rotation && *position != 0 {
                        module.movement_nonce = (module.movement_nonce + 1) % 256;
                    }
                }
            }
            config.clone()
        };
        self.send(|nonce| ToSplitflap::config(nonce, config), false)
    }

    /// Displays `text`, blanking (flap 0) every module past its end.
    ///
    /// Characters are looked up in the flap character set reported by the device (or
    /// [`LEGACY_FLAPS`] when none was reported), as-is first, then upper-cased.
    ///
    /// # Errors
    /// * `UnsupportedCharacter`: a character has no flap.
    /// * See [`Splitflap::set_positions`].
    pub fn set_text(&self, text: &str, force_full_rotation: bool) -> Result<(), Error> {
        let num_modules = self
            .get_num_modules()
            .ok_or(SessionError::UnknownModuleCount)?;
        let flaps: Vec<char> = match self.data.read().general_state.as_ref() {
            Some(general) if !general.flap_character_set.is_empty() => general
                .flap_character_set
                .iter()
                .map(|&byte| byte as char)
                .collect(),
            _ => LEGACY_FLAPS.chars().collect(),
        };

        let mut positions = text
            .chars()
            .map(|character| {
                flaps
                    .iter()
                    .position(|&flap| flap == character)
                    .or_else(|| {
                        let upper = character.to_ascii_uppercase();
                        flaps.iter().position(|&flap| flap == upper)
                    })
                    .map(|index| Some(index as u32))
                    .ok_or_else(|| Error::from(SessionError::UnsupportedCharacter { character }))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        if positions.len() < num_modules {
            positions.resize(num_modules, Some(0));
        }

        self.set_positions(&positions, force_full_rotation)
    }

    /// Asks module `index` to look for its home position again.
    ///
    /// # Errors
    /// * `UnknownModuleCount`: no state has been received yet.
    /// * `UnknownModule`: `index` is out of range.
    pub fn reset_module(&self, index: usize) -> Result<(), Error> {
        let config = {
            let mut data = self.data.write();
            let config = data
                .config
                .as_mut()
                .ok_or(SessionError::UnknownModuleCount)?;
            let module = config
                .modules
                .get_mut(index)
                .ok_or(SessionError::UnknownModule { index })?;
            module.reset_nonce = (module.reset_nonce + 1) % 256;
            config.clone()
        };
        self.send(|nonce| ToSplitflap::config(nonce, config), false)
    }

    /// Requests the state until the module count is known.
    ///
    /// # Errors
    /// * `UnknownModuleCount`: nothing was received before `timeout`.
    pub async fn wait_for_modules(&self, timeout: Duration) -> Result<usize, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(count) = self.get_num_modules() {
                return Ok(count);
            }
            if Instant::now() >= deadline {
                return Err(SessionError::UnknownModuleCount.into());
            }
            self.request_state()?;
            crate::pause!(100);
        }
    }

    fn ensure_running(&self) -> Result<&UnboundedSender<OutgoingMessage>, Error> {
        let outgoing = self
            .outgoing
            .as_ref()
            .ok_or(ProtocolError::NotInitialized)?;
        if !self.running.load(Ordering::SeqCst) {
            return Err(ProtocolError::ConnectionClosed.into());
        }
        Ok(outgoing)
    }

    /// Queues a message built around the next nonce.
    fn send<F: FnOnce(u32) -> ToSplitflap>(
        &self,
        build: F,
        state_request: bool,
    ) -> Result<(), Error> {
        let outgoing = self.ensure_running()?;
        let message = build(self.next_nonce.fetch_add(1, Ordering::SeqCst));
        trace!("Queueing {:?}", message);
        outgoing
            .send(OutgoingMessage {
                nonce: message.nonce,
                frame: encode_frame(&message.encode_to_vec()),
                state_request,
            })
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        Ok(())
    }

    // ########################################
    // Getters

    pub fn get_num_modules(&self) -> Option<usize> {
        self.data.read().num_modules()
    }

    pub fn get_state(&self) -> Option<SplitflapState> {
        self.data.read().state.clone()
    }

    pub fn get_general_state(&self) -> Option<GeneralState> {
        self.data.read().general_state.clone()
    }

    pub fn get_config(&self) -> Option<SplitflapConfig> {
        self.data.read().config.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.data.read().connected
    }
}

impl Display for Splitflap {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Splitflap ({})", self.transport)
    }
}

impl Drop for Splitflap {
    fn drop(&mut self) {
        if self.outgoing.is_none() {
            return;
        }
        self.stop();
        self.data.write().connected = false;
        if let Err(error) = self.transport.close() {
            warn!("Unable to close {}: {}", self.transport, error);
        }
    }
}

/// Decodes incoming frames until the session stops or the transport fails.
fn read_loop(
    mut transport: Box<dyn IoTransport>,
    running: Arc<AtomicBool>,
    acks: UnboundedSender<u32>,
    messages: UnboundedSender<from_splitflap::Payload>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; READ_CHUNK];

    while running.load(Ordering::SeqCst) {
        let count = match transport.read(&mut buf) {
            Ok(count) => count,
            Err(error) => {
                if running.swap(false, Ordering::SeqCst) {
                    error!("Read from {} failed: {}", transport, error);
                }
                break;
            }
        };

        if count > 0 {
            trace!("Read [{}]", format_as_hex(&buf[..count]));
        }
        for payload in buf[..count].iter().filter_map(|&byte| decoder.feed(byte)) {
            let message = payload.and_then(|payload| {
                FromSplitflap::decode(payload.as_slice()).map_err(Error::from)
            });
            match message {
                Ok(FromSplitflap {
                    payload: Some(payload),
                }) => {
                    trace!("Received {:?}", payload);
                    if let from_splitflap::Payload::Ack(ack) = &payload {
                        let _ = acks.send(ack.nonce);
                    }
                    if messages.send(payload).is_err() {
                        return;
                    }
                }
                Ok(_) => debug!("Dropping message without payload"),
                Err(error) => debug!("Dropping frame: {}", error),
            }
        }
    }
}

/// Records and hands every message to its handlers, in arrival order.
async fn dispatch_loop(
    events: EventManager,
    data: Arc<RwLock<SplitflapData>>,
    mut messages: UnboundedReceiver<from_splitflap::Payload>,
) {
    while let Some(payload) = messages.recv().await {
        let event = payload.name();
        match payload {
            from_splitflap::Payload::SplitflapState(state) => {
                data.write().record_state(&state);
                events.emit(event, state).await;
            }
            from_splitflap::Payload::Log(log) => {
                info!("Splitflap: {}", log.msg);
                events.emit(event, log).await;
            }
            from_splitflap::Payload::Ack(ack) => {
                events.emit(event, ack).await;
            }
            from_splitflap::Payload::GeneralState(general_state) => {
                data.write().general_state = Some(general_state.clone());
                events.emit(event, general_state).await;
            }
        }
    }
    data.write().connected = false;
}

/// Sends queued messages one at a time, each until acknowledged or out of attempts.
async fn write_loop(
    mut transport: Box<dyn IoTransport>,
    running: Arc<AtomicBool>,
    pending_request: Arc<AtomicBool>,
    mut outgoing: UnboundedReceiver<OutgoingMessage>,
    mut acks: UnboundedReceiver<u32>,
    retry_timeout: Duration,
    max_attempts: usize,
) {
    while let Some(message) = outgoing.recv().await {
        if message.state_request {
            pending_request.store(false, Ordering::SeqCst);
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }
        // Late acks of previous messages.
        while acks.try_recv().is_ok() {}

        match send_with_retries(
            transport.as_mut(),
            &message,
            &mut acks,
            retry_timeout,
            max_attempts,
        )
        .await
        {
            Ok(true) => trace!("Message {} acknowledged", message.nonce),
            Ok(false) => error!(
                "{}",
                Error::from(ProtocolError::AckTimeout {
                    nonce: message.nonce,
                    attempts: max_attempts,
                })
            ),
            Err(error) => {
                if running.swap(false, Ordering::SeqCst) {
                    error!("Write to {} failed: {}", transport, error);
                }
                break;
            }
        }
    }
}

/// Writes `message` until its ack arrives: `Ok(false)` when every attempt timed out.
async fn send_with_retries(
    transport: &mut dyn IoTransport,
    message: &OutgoingMessage,
    acks: &mut UnboundedReceiver<u32>,
    retry_timeout: Duration,
    max_attempts: usize,
) -> Result<bool, Error> {
    for attempt in 1..=max_attempts {
        trace!("Write [{}]", format_as_hex(&message.frame));
        transport.write(&message.frame)?;

        let deadline = Instant::now() + retry_timeout;
        loop {
            match timeout_at(deadline, acks.recv()).await {
                Ok(Some(nonce)) if nonce == message.nonce => return Ok(true),
                Ok(Some(nonce)) => trace!("Ignoring ack {} (waiting for {})", nonce, message.nonce),
                Ok(None) => return Err(ProtocolError::ConnectionClosed.into()),
                Err(_) => break,
            }
        }
        debug!(
            "Message {} not acknowledged (attempt {}/{})",
            message.nonce, attempt, max_attempts
        );
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use serial_test::serial;

    use crate::hardware::{Splitflap, SplitflapEvent, LEGACY_FLAPS};
    use crate::io::{
        from_splitflap, to_splitflap, GeneralState, Log, SplitflapConfig, SplitflapState,
        ToSplitflap,
    };
    use crate::mocks::create_test_state;
    use crate::mocks::transport_layer::MockTransportLayer;
    use crate::pause;

    fn sent_configs(transport: &MockTransportLayer) -> Vec<SplitflapConfig> {
        transport
            .sent_messages()
            .into_iter()
            .filter_map(|message| match message.payload {
                Some(to_splitflap::Payload::SplitflapConfig(config)) => Some(config),
                _ => None,
            })
            .collect()
    }

    fn targets(config: &SplitflapConfig) -> Vec<u32> {
        config
            .modules
            .iter()
            .map(|module| module.target_flap_index)
            .collect()
    }

    /// Opens a session on an acknowledging device that already reported `flaps`.
    async fn open_with_modules(flaps: &[u32]) -> (Splitflap, MockTransportLayer) {
        let transport = MockTransportLayer::default().with_auto_ack();
        transport.push_message(from_splitflap::Payload::SplitflapState(create_test_state(
            flaps,
            &[],
        )));
        let session = Splitflap::new(transport.clone()).open().unwrap();
        pause!(50);
        assert_eq!(session.get_num_modules(), Some(flaps.len()));
        (session, transport)
    }

    #[test]
    fn test_event_names() {
        assert_eq!(String::from(SplitflapEvent::OnState), "splitflap_state");
        assert_eq!(String::from(SplitflapEvent::OnLog), "log");
        assert_eq!(String::from(SplitflapEvent::OnAck), "ack");
        assert_eq!(String::from(SplitflapEvent::OnGeneralState), "general_state");
    }

    #[test]
    fn test_legacy_flaps() {
        assert_eq!(LEGACY_FLAPS.len(), 40);
        assert_eq!(LEGACY_FLAPS.find('A'), Some(1));
        assert_eq!(LEGACY_FLAPS.find('0'), Some(27));
    }

    #[test]
    fn test_open_outside_runtime() {
        let transport = MockTransportLayer::default();
        let result = Splitflap::new(transport.clone()).open();
        assert_eq!(
            result.err().unwrap().to_string(),
            "Runtime error: Are you sure your code runs inside a tokio runtime?"
        );
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_request_before_open() {
        let session = Splitflap::new(MockTransportLayer::default());
        assert!(!session.is_connected());
        assert_eq!(
            session.request_state().err().unwrap().to_string(),
            "Protocol error: Connection has not been initialized."
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_open_and_close() {
        let transport = MockTransportLayer::default();
        let session = Splitflap::new(transport.clone()).open().unwrap();
        assert!(transport.is_connected());
        assert!(session.is_connected());

        session.close().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    #[serial]
    async fn test_drop_closes_transport() {
        let transport = MockTransportLayer::default();
        let session = Splitflap::new(transport.clone()).open().unwrap();
        assert!(transport.is_connected());

        drop(session);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    #[serial]
    async fn test_state_dispatch() {
        let transport = MockTransportLayer::default()
            .with_auto_ack()
            .with_state_reply(create_test_state(&[1, 2, 3], &[1]));
        let session = Splitflap::new(transport.clone()).open().unwrap();
        assert_eq!(session.get_num_modules(), None);

        let received = Arc::new(Mutex::new(vec![]));
        let received_clone = received.clone();
        session.on(SplitflapEvent::OnState, move |state: SplitflapState| {
            let received = received_clone.clone();
            async move {
                received.lock().push(state);
            }
        });

        session.request_state().unwrap();
        pause!(100);

        let sent = transport.sent_messages();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            sent[0].payload,
            Some(to_splitflap::Payload::RequestState(_))
        ));

        assert_eq!(received.lock().len(), 1);
        assert_eq!(received.lock()[0].modules.len(), 3);
        assert!(received.lock()[0].modules[1].sensor_state);
        assert_eq!(session.get_num_modules(), Some(3));
        assert_eq!(session.get_state().unwrap().modules[2].flap_index, 3);
        assert_eq!(targets(&session.get_config().unwrap()), vec![1, 2, 3]);
    }

    #[tokio::test]
    #[serial]
    async fn test_unregister() {
        let transport = MockTransportLayer::default();
        let session = Splitflap::new(transport.clone()).open().unwrap();

        let count = Arc::new(Mutex::new(0));
        let count_clone = count.clone();
        let handler = session.on("splitflap_state", move |_: SplitflapState| {
            let count = count_clone.clone();
            async move {
                *count.lock() += 1;
            }
        });

        transport.push_message(from_splitflap::Payload::SplitflapState(create_test_state(
            &[0],
            &[],
        )));
        pause!(50);
        assert_eq!(*count.lock(), 1);

        session.unregister(handler);
        transport.push_message(from_splitflap::Payload::SplitflapState(create_test_state(
            &[0],
            &[],
        )));
        pause!(50);
        assert_eq!(*count.lock(), 1);
    }

    #[tokio::test]
    #[serial]
    async fn test_log_and_general_state_events() {
        let transport = MockTransportLayer::default();
        let session = Splitflap::new(transport.clone()).open().unwrap();

        let logs = Arc::new(Mutex::new(vec![]));
        let logs_clone = logs.clone();
        session.on(SplitflapEvent::OnLog, move |log: Log| {
            let logs = logs_clone.clone();
            async move {
                logs.lock().push(log.msg);
            }
        });

        transport.push_message(from_splitflap::Payload::Log(Log {
            msg: String::from("Booted"),
        }));
        transport.push_message(from_splitflap::Payload::GeneralState(GeneralState {
            uptime_millis: 1234,
            transient_connection: false,
            flap_character_set: b" ABC".to_vec(),
        }));
        pause!(50);

        assert_eq!(*logs.lock(), vec![String::from("Booted")]);
        let general_state = session.get_general_state().unwrap();
        assert_eq!(general_state.uptime_millis, 1234);
        assert_eq!(general_state.flap_character_set, b" ABC".to_vec());
    }

    #[tokio::test]
    #[serial]
    async fn test_corrupted_frames_are_dropped() {
        let transport = MockTransportLayer::default();
        let session = Splitflap::new(transport.clone()).open().unwrap();

        // Broken COBS block, then a valid frame with a flipped payload byte.
        transport.push_incoming(&[0x05, 0x01, 0x00]);
        let mut frame = crate::io::codec::encode_frame(&[0x0A, 0x02, 0x10, 0x07]);
        frame[2] ^= 0x01;
        transport.push_incoming(&frame);
        transport.push_message(from_splitflap::Payload::SplitflapState(create_test_state(
            &[7, 8],
            &[],
        )));
        pause!(50);

        assert!(session.is_connected());
        assert_eq!(session.get_num_modules(), Some(2));
    }

    #[tokio::test]
    #[serial]
    async fn test_resend_until_acknowledged() {
        let transport = MockTransportLayer::default()
            .with_auto_ack()
            .skipping_acks(2);
        let session = Splitflap::new(transport.clone())
            .with_retry_policy(Duration::from_millis(30), 10)
            .open()
            .unwrap();

        session.request_state().unwrap();
        pause!(300);

        let sent = transport.sent_messages();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|message| message.nonce == sent[0].nonce));
    }

    #[tokio::test]
    #[serial]
    async fn test_acks_with_other_nonces_are_ignored() {
        let transport = MockTransportLayer::default().acking_wrong_nonce();
        let session = Splitflap::new(transport.clone())
            .with_retry_policy(Duration::from_millis(20), 4)
            .open()
            .unwrap();

        session.request_state().unwrap();
        pause!(300);

        let sent = transport.sent_messages();
        assert_eq!(sent.len(), 4, "Resent until out of attempts");
        assert!(sent.iter().all(|message| message.nonce == sent[0].nonce));
        assert!(session.is_connected());
    }

    #[tokio::test]
    #[serial]
    async fn test_state_requests_do_not_pile_up() {
        let transport = MockTransportLayer::default();
        let session = Splitflap::new(transport.clone())
            .with_retry_policy(Duration::from_millis(20), 2)
            .open()
            .unwrap();

        // The device never answers: each message keeps the writer busy for 40ms.
        for _ in 0..40 {
            session.request_state().unwrap();
            pause!(10);
        }
        pause!(200);
        let settled = transport.sent_messages().len();
        pause!(200);

        assert_eq!(
            transport.sent_messages().len(),
            settled,
            "No stale requests left once polling stops"
        );
        assert!(settled <= 30, "{} writes for 40 requests", settled);
    }

    #[tokio::test]
    #[serial]
    async fn test_open_sets_read_timeout() {
        let transport = MockTransportLayer::default();
        let _session = Splitflap::new(transport.clone())
            .with_read_timeout(Duration::from_millis(20))
            .open()
            .unwrap();
        assert_eq!(transport.get_timeout(), Some(Duration::from_millis(20)));

        let transport = MockTransportLayer::default();
        let _session = Splitflap::new(transport.clone()).open().unwrap();
        assert_eq!(transport.get_timeout(), Some(Duration::from_millis(100)));
    }

    #[tokio::test]
    #[serial]
    async fn test_give_up_and_move_on() {
        let transport = MockTransportLayer::default();
        let session = Splitflap::new(transport.clone())
            .with_retry_policy(Duration::from_millis(10), 3)
            .open()
            .unwrap();

        session.request_state().unwrap();
        // Lets the writer take the first request, the second one is queued again.
        pause!(5);
        session.request_state().unwrap();
        pause!(300);

        let nonces: Vec<u32> = transport
            .sent_messages()
            .iter()
            .map(|message: &ToSplitflap| message.nonce)
            .collect();
        let first = nonces[0];
        assert_eq!(
            nonces,
            vec![
                first,
                first,
                first,
                first.wrapping_add(1),
                first.wrapping_add(1),
                first.wrapping_add(1)
            ]
        );
        assert!(session.is_connected());
    }

    #[tokio::test]
    #[serial]
    async fn test_write_failure_stops_session() {
        let transport = MockTransportLayer::default().with_failing_writes();
        let session = Splitflap::new(transport.clone()).open().unwrap();

        session.request_state().unwrap();
        pause!(100);

        assert!(!session.is_connected());
        assert_eq!(
            session.request_state().err().unwrap().to_string(),
            "Protocol error: Connection is closed."
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_set_positions() {
        let session = Splitflap::new(MockTransportLayer::default().with_auto_ack())
            .open()
            .unwrap();
        assert_eq!(
            session.set_positions(&[Some(1)], false).err().unwrap().to_string(),
            "Session error: Module count unknown: no state received from the splitflap yet."
        );

        let (session, transport) = open_with_modules(&[1, 2, 3]).await;
        session.set_positions(&[Some(5), None], false).unwrap();
        session.set_positions(&[Some(5)], true).unwrap();
        pause!(100);

        let configs = sent_configs(&transport);
        assert_eq!(configs.len(), 2);
        assert_eq!(targets(&configs[0]), vec![5, 2, 3]);
        assert_eq!(configs[0].modules[0].movement_nonce, 0);
        assert_eq!(targets(&configs[1]), vec![5, 2, 3]);
        assert_eq!(configs[1].modules[0].movement_nonce, 1);
        assert_eq!(configs[1].modules[1].movement_nonce, 0);

        assert_eq!(
            session
                .set_positions(&[None, None, None, None], false)
                .err()
                .unwrap()
                .to_string(),
            "Session error: Too many positions - 4 given, the splitflap has 3 modules."
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_movement_nonce_wraps() {
        let (session, _transport) = open_with_modules(&[0]).await;
        for _ in 0..256 {
            session.set_positions(&[Some(3)], true).unwrap();
        }
        assert_eq!(session.get_config().unwrap().modules[0].movement_nonce, 0);
    }

    #[tokio::test]
    #[serial]
    async fn test_set_text() {
        let (session, transport) = open_with_modules(&[0, 0, 0, 9]).await;

        session.set_text("ab1", false).unwrap();
        pause!(50);
        let configs = sent_configs(&transport);
        // Modules past the text are blanked.
        assert_eq!(targets(configs.last().unwrap()), vec![1, 2, 28, 0]);

        assert_eq!(
            session.set_text("a#", false).err().unwrap().to_string(),
            "Session error: Character '#' is not available on the flaps."
        );

        transport.push_message(from_splitflap::Payload::GeneralState(GeneralState {
            flap_character_set: b" 0123456789".to_vec(),
            ..Default::default()
        }));
        pause!(50);
        session.set_text("10", false).unwrap();
        pause!(50);
        let configs = sent_configs(&transport);
        assert_eq!(targets(configs.last().unwrap()), vec![2, 1, 0, 0]);
        assert!(session.set_text("A", false).is_err());
        assert_eq!(
            session.set_text("01234", false).err().unwrap().to_string(),
            "Session error: Too many positions - 5 given, the splitflap has 4 modules."
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_set_text_forced_rotation_skips_blanks() {
        let session = Splitflap::new(MockTransportLayer::default()).open().unwrap();
        assert_eq!(
            session.set_text("A", false).err().unwrap().to_string(),
            "Session error: Module count unknown: no state received from the splitflap yet."
        );

        let (session, transport) = open_with_modules(&[5, 5, 5]).await;
        session.set_text(" A", true).unwrap();
        pause!(50);

        let configs = sent_configs(&transport);
        let config = configs.last().unwrap();
        assert_eq!(targets(config), vec![0, 1, 0]);
        let nonces: Vec<u32> = config
            .modules
            .iter()
            .map(|module| module.movement_nonce)
            .collect();
        assert_eq!(nonces, vec![0, 1, 0]);
    }

    #[tokio::test]
    #[serial]
    async fn test_reset_module() {
        let (session, transport) = open_with_modules(&[4, 5]).await;

        session.reset_module(1).unwrap();
        pause!(50);
        let configs = sent_configs(&transport);
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].modules[0].reset_nonce, 0);
        assert_eq!(configs[0].modules[1].reset_nonce, 1);
        assert_eq!(targets(&configs[0]), vec![4, 5]);

        assert_eq!(
            session.reset_module(9).err().unwrap().to_string(),
            "Session error: Unknown module 9."
        );
    }

    #[tokio::test]
    #[serial]
    async fn test_wait_for_modules() {
        let transport = MockTransportLayer::default()
            .with_auto_ack()
            .with_state_reply(create_test_state(&[0, 0, 0], &[]));
        let session = Splitflap::new(transport).open().unwrap();
        assert_eq!(
            session
                .wait_for_modules(Duration::from_secs(1))
                .await
                .unwrap(),
            3
        );

        let session = Splitflap::new(MockTransportLayer::default().with_auto_ack())
            .open()
            .unwrap();
        assert!(session
            .wait_for_modules(Duration::from_millis(150))
            .await
            .is_err());
    }

    #[test]
    fn test_display() {
        let session = Splitflap::new(MockTransportLayer::default());
        assert_eq!(format!("{}", session), "Splitflap (MockTransportLayer)");
    }
}
