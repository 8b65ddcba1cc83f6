//! Client identity, callback traits and control-side client records.

use core::fmt;

use crossbeam_channel::{Receiver, Sender};

use crate::buffer::ProcessScope;
use crate::order::GraphOrder;
use crate::port::{Frames, PortId};

/// Handle to a client opened on an [`Engine`](crate::Engine).
///
/// Ids are handed out in registration order and never reused, so comparing
/// two ids compares registration sequence.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ClientId(u32);

impl ClientId {
    pub(crate) fn from_raw(raw: u32) -> Self {
        ClientId(raw)
    }

    /// Registration sequence number.
    pub fn sequence(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Activation state of a client.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClientState {
    Inactive,
    Active,
    /// Left the schedule; waiting for the processor to stop running it.
    Deactivating,
}

/// Returned by callbacks: keep going, or take this client out of the cycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Control {
    Continue,
    Quit,
}

/// Why a client received a shutdown notification.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShutdownReason {
    /// The engine was shut down or dropped.
    EngineShutdown,
    /// The process callback returned [`Control::Quit`] or panicked.
    ProcessFailed,
    /// The buffer size callback refused a new buffer size.
    BufferSizeRejected,
}

/// Real-time processing capability of a client.
///
/// Called once per cycle on the processor thread, in graph order. Must not
/// block, allocate or take locks. Returning [`Control::Quit`] (or panicking)
/// removes the client from subsequent cycles.
///
/// Any `FnMut(&mut ProcessScope) -> Control + Send` closure implements it;
/// install closures with [`Engine::set_process_callback`](crate::Engine::set_process_callback)
/// and other implementors with [`Engine::set_process_handler`](crate::Engine::set_process_handler).
///
/// ```
/// # use patchwork::{Control, Engine, EngineConfig, PortFlags, DEFAULT_AUDIO_TYPE};
/// let (mut engine, _processor) = Engine::new(EngineConfig::default()).unwrap();
/// let client = engine.open_client("thru").unwrap();
/// let input = engine.register_port(client, "in", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT, 0).unwrap();
/// let output = engine.register_port(client, "out", DEFAULT_AUDIO_TYPE, PortFlags::IS_OUTPUT, 0).unwrap();
///
/// engine.set_process_callback(client, move |scope| {
///     if let Some(samples) = scope.input(input) {
///         if let Some(out) = scope.output(output) {
///             out.copy_from_slice(samples);
///         }
///     }
///     Control::Continue
/// }).unwrap();
/// ```
pub trait ProcessHandler: Send + 'static {
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> Control;
}

impl<F> ProcessHandler for F
where
    F: FnMut(&mut ProcessScope<'_>) -> Control + Send + 'static,
{
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> Control {
        self(scope)
    }
}

pub(crate) type BufferSizeCallback = Box<dyn FnMut(Frames) -> Control + Send>;
pub(crate) type SampleRateCallback = Box<dyn FnMut(u32) -> Control + Send>;
pub(crate) type PortRegistrationCallback = Box<dyn FnMut(PortId, bool) + Send>;
pub(crate) type GraphOrderCallback = Box<dyn FnMut(&GraphOrder) + Send>;

/// Non-real-time callbacks, invoked from the control context.
#[derive(Default)]
pub(crate) struct Callbacks {
    pub buffer_size: Option<BufferSizeCallback>,
    pub sample_rate: Option<SampleRateCallback>,
    pub port_registration: Option<PortRegistrationCallback>,
    pub graph_order: Option<GraphOrderCallback>,
}

/// Sending half of a client's shutdown channel.
///
/// The channel is bounded to one slot and only ever `try_send`-ed, so
/// notifying never blocks or allocates and the first reason wins.
pub(crate) struct ShutdownNotifier {
    sender: Sender<ShutdownReason>,
}

impl ShutdownNotifier {
    pub fn channel() -> (Self, Receiver<ShutdownReason>) {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        (Self { sender }, receiver)
    }

    pub fn notify(&self, reason: ShutdownReason) {
        // Full: an earlier reason is still unread. Disconnected: nobody listens.
        let _ = self.sender.try_send(reason);
    }
}

/// Control-side bookkeeping for one client.
pub(crate) struct ClientRecord {
    pub name: String,
    /// Index into the processor's client table
    pub slot: usize,
    pub state: ClientState,
    /// Bumped on every activation; the processor skips a client that failed
    /// during the current activation.
    pub activation: u64,
    /// Schedule generation that first omitted this client while deactivating
    pub leaving_at: u64,
    pub ports: Vec<PortId>,
    pub callbacks: Callbacks,
    pub shutdown: Option<ShutdownNotifier>,
}

impl ClientRecord {
    pub fn new(name: &str, slot: usize) -> Self {
        Self {
            name: name.into(),
            slot,
            state: ClientState::Inactive,
            activation: 0,
            leaving_at: 0,
            ports: Vec::new(),
            callbacks: Callbacks::default(),
            shutdown: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ClientState::Active
    }

    pub fn notify_shutdown(&self, reason: ShutdownReason) {
        if let Some(notifier) = &self.shutdown {
            notifier.notify(reason);
        }
    }
}
