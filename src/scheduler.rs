//! Cycle scheduler - the real-time half of the engine
//!
//! The [`Processor`] owns everything touched during a cycle: the current
//! schedule, the port buffers and the clients' process handlers. The control
//! half changes any of these only by pushing a [`Command`] into a lock-free
//! ring; the processor drains that ring at the top of every cycle, so changes
//! land exactly on cycle boundaries. Anything the processor lets go of is
//! pushed back through the event ring to be freed off the real-time thread.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rtrb::{Consumer, Producer, PushError};

use crate::buffer::{self, BufferPool, CycleInfo, PortBuffer, ProcessScope};
use crate::client::{ClientId, Control, ProcessHandler};
use crate::clock::CycleClock;
use crate::config::EngineConfig;
use crate::port::{Frames, PortId};

/// Outputs feeding one input port, in summation order.
#[derive(Debug)]
pub(crate) struct InputBinding {
    pub port: PortId,
    pub sources: Vec<PortId>,
}

/// Everything the processor needs to run one client.
#[derive(Debug)]
pub(crate) struct ClientStep {
    pub client: ClientId,
    pub slot: usize,
    pub activation: u64,
    pub inputs: Vec<InputBinding>,
    pub outputs: Vec<PortId>,
    /// (input, output) pairs mirrored after the callback
    pub ties: Vec<(PortId, PortId)>,
}

impl ClientStep {
    pub fn owns_input(&self, port: PortId) -> bool {
        self.inputs.iter().any(|binding| binding.port == port)
    }

    pub fn owns_output(&self, port: PortId) -> bool {
        self.outputs.contains(&port)
    }
}

/// Immutable snapshot of graph order and buffer bindings.
#[derive(Debug, Default)]
pub(crate) struct Schedule {
    pub generation: u64,
    pub steps: Vec<ClientStep>,
}

pub(crate) enum Command {
    Schedule(Arc<Schedule>),
    Attach { port: PortId, input: bool, buffer: PortBuffer },
    Detach { port: PortId, input: bool },
    Install { slot: usize, client: ClientId, handler: Box<dyn ProcessHandler> },
    Uninstall { slot: usize },
    Configure { buffer_size: Frames, sample_rate: u32 },
    Timebase(Option<ClientId>),
    Shutdown,
}

/// Things released by the processor, to be dropped on the control side.
pub(crate) enum Garbage {
    Buffer(PortBuffer),
    Handler(Box<dyn ProcessHandler>),
}

pub(crate) enum Event {
    Report(CycleEvent),
    Applied { generation: u64, previous: Arc<Schedule> },
    Release(Garbage),
}

/// How a process callback failed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcessFailure {
    /// Returned [`Control::Quit`].
    Quit,
    Panicked,
}

/// Something that happened during a cycle, reported by
/// [`Engine::maintain`](crate::Engine::maintain).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CycleEvent {
    /// The client was skipped for the rest of the cycle's activation and
    /// will be deactivated.
    ClientFailed { client: ClientId, failure: ProcessFailure },
    /// The cycle took longer than the time its frames represent.
    DeadlineMiss { cycle: u64, elapsed: Duration, budget: Duration },
}

/// Scheduler state.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SchedulerState {
    Idle,
    Running,
    ShuttingDown,
}

struct RtClient {
    id: ClientId,
    handler: Box<dyn ProcessHandler>,
    /// Activation during which the handler failed
    failed: Option<u64>,
    failure: Option<ProcessFailure>,
    /// Whether that failure made it into the event ring or the stash
    reported: bool,
}

/// Real-time half of an [`Engine`](crate::Engine).
///
/// Move it to the audio driver's thread and call [`run_cycle`](Self::run_cycle)
/// once per buffer period:
///
/// ```no_run
/// # use patchwork::{Control, Engine, EngineConfig};
/// let (engine, mut processor) = Engine::new(EngineConfig::default()).unwrap();
///
/// let driver = std::thread::spawn(move || {
///     while processor.run_cycle(processor.buffer_size()) == Control::Continue {
///         // wait for the next period
///     }
/// });
/// # drop(engine);
/// # driver.join().unwrap();
/// ```
pub struct Processor {
    commands: Consumer<Command>,
    events: Producer<Event>,
    /// Events that found the ring full, oldest first. Never grows past its
    /// initial capacity.
    stash: VecDeque<Event>,
    clock: Arc<CycleClock>,
    frame_time: u64,
    timebase: Option<ClientId>,
    schedule: Arc<Schedule>,
    clients: Vec<Option<RtClient>>,
    inputs: BufferPool,
    outputs: BufferPool,
    buffer_size: Frames,
    sample_rate: u32,
    cycle: u64,
    state: SchedulerState,
}

impl Processor {
    pub(crate) fn new(
        config: &EngineConfig,
        clock: Arc<CycleClock>,
        commands: Consumer<Command>,
        events: Producer<Event>,
    ) -> Self {
        Self {
            commands,
            events,
            stash: VecDeque::with_capacity(config.queue_size),
            clock,
            frame_time: 0,
            timebase: None,
            schedule: Arc::new(Schedule::default()),
            clients: (0..config.max_clients).map(|_| None).collect(),
            inputs: BufferPool::with_capacity(config.max_ports),
            outputs: BufferPool::with_capacity(config.max_ports),
            buffer_size: config.buffer_size,
            sample_rate: config.sample_rate,
            cycle: 0,
            state: SchedulerState::Idle,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Largest frame count a cycle will run with.
    pub fn buffer_size(&self) -> Frames {
        self.buffer_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Cycles completed so far.
    pub fn cycles(&self) -> u64 {
        self.cycle
    }

    /// Run one processing cycle of `frames` frames (clamped to the buffer size).
    ///
    /// Picks up pending graph changes, then runs every scheduled client in
    /// graph order: mix its inputs, zero its outputs, call its process
    /// handler, mirror its ties. Returns [`Control::Quit`] once the engine
    /// has shut down.
    pub fn run_cycle(&mut self, frames: Frames) -> Control {
        self.flush_stash();
        self.apply_commands();
        if self.state == SchedulerState::ShuttingDown || self.commands.is_abandoned() {
            self.state = SchedulerState::ShuttingDown;
            return Control::Quit;
        }

        let frames = frames.min(self.buffer_size);
        let n = frames as usize;
        let started = Instant::now();
        self.clock.begin_cycle(started, self.frame_time);
        self.state = SchedulerState::Running;

        let schedule = Arc::clone(&self.schedule);
        for step in schedule.steps.iter() {
            for binding in &step.inputs {
                buffer::resolve_input(&mut self.inputs, &self.outputs, binding.port, &binding.sources, n);
            }
            for port in &step.outputs {
                if let Some(buffer) = self.outputs.get_mut(*port) {
                    buffer.clear(n);
                }
            }
            self.invoke(step, frames);
            for (input, output) in &step.ties {
                buffer::apply_tie(&self.inputs, &mut self.outputs, *input, *output, n);
            }
        }
        drop(schedule);

        let cycle = self.cycle;
        self.cycle += 1;
        self.frame_time += u64::from(frames);
        self.state = SchedulerState::Idle;

        if frames > 0 {
            let elapsed = started.elapsed();
            let budget = Duration::from_secs_f64(f64::from(frames) / f64::from(self.sample_rate.max(1)));
            if elapsed > budget {
                self.push(Event::Report(CycleEvent::DeadlineMiss { cycle, elapsed, budget }));
            }
        }
        Control::Continue
    }

    fn invoke(&mut self, step: &ClientStep, frames: Frames) {
        let client = match self.clients.get_mut(step.slot).and_then(Option::as_mut) {
            Some(client) if client.id == step.client => client,
            _ => return,
        };
        if client.failed == Some(step.activation) {
            // skipped until a schedule without it arrives; keep trying to say why
            if let (false, Some(failure)) = (client.reported, client.failure) {
                let report = Event::Report(CycleEvent::ClientFailed {
                    client: step.client,
                    failure,
                });
                client.reported = offer(&mut self.events, &mut self.stash, report);
            }
            return;
        }

        let mut scope = ProcessScope::new(
            CycleInfo {
                frames,
                sample_rate: self.sample_rate,
                cycle: self.cycle,
                frame_time: self.frame_time,
                timebase: self.timebase == Some(step.client),
            },
            &self.clock,
            &self.inputs,
            &mut self.outputs,
            step,
        );
        let handler = &mut client.handler;
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| handler.process(&mut scope))) {
            Ok(Control::Continue) => return,
            Ok(Control::Quit) => ProcessFailure::Quit,
            Err(_) => ProcessFailure::Panicked,
        };

        client.failed = Some(step.activation);
        client.failure = Some(failure);
        let report = Event::Report(CycleEvent::ClientFailed {
            client: step.client,
            failure,
        });
        client.reported = offer(&mut self.events, &mut self.stash, report);
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            match command {
                Command::Schedule(next) => {
                    let generation = next.generation;
                    let previous = core::mem::replace(&mut self.schedule, next);
                    self.push(Event::Applied { generation, previous });
                }
                Command::Attach { port, input, buffer } => {
                    let pool = if input { &mut self.inputs } else { &mut self.outputs };
                    if let Some(old) = pool.attach(port, buffer) {
                        self.release(Garbage::Buffer(old));
                    }
                }
                Command::Detach { port, input } => {
                    let pool = if input { &mut self.inputs } else { &mut self.outputs };
                    if let Some(old) = pool.detach(port) {
                        self.release(Garbage::Buffer(old));
                    }
                }
                Command::Install { slot, client, handler } => {
                    let displaced = match self.clients.get_mut(slot) {
                        Some(entry) => entry
                            .replace(RtClient {
                                id: client,
                                handler,
                                failed: None,
                                failure: None,
                                reported: false,
                            })
                            .map(|old| old.handler),
                        None => Some(handler),
                    };
                    if let Some(old) = displaced {
                        self.release(Garbage::Handler(old));
                    }
                }
                Command::Uninstall { slot } => {
                    if let Some(old) = self.clients.get_mut(slot).and_then(Option::take) {
                        self.release(Garbage::Handler(old.handler));
                    }
                }
                Command::Configure { buffer_size, sample_rate } => {
                    self.buffer_size = buffer_size;
                    self.sample_rate = sample_rate;
                }
                Command::Timebase(owner) => self.timebase = owner,
                Command::Shutdown => self.state = SchedulerState::ShuttingDown,
            }
        }
    }

    fn release(&mut self, garbage: Garbage) {
        self.push(Event::Release(garbage));
    }

    fn push(&mut self, event: Event) {
        let _ = offer(&mut self.events, &mut self.stash, event);
    }

    fn flush_stash(&mut self) {
        while let Some(event) = self.stash.pop_front() {
            if let Err(PushError::Full(event)) = self.events.push(event) {
                self.stash.push_front(event);
                break;
            }
        }
    }
}

/// Hand `event` to the control side, keeping it in `stash` while the ring is
/// full. Returns false only when both are full, in which case the event is
/// dropped here.
fn offer(events: &mut Producer<Event>, stash: &mut VecDeque<Event>, event: Event) -> bool {
    let event = if stash.is_empty() {
        match events.push(event) {
            Ok(()) => return true,
            Err(PushError::Full(event)) => event,
        }
    } else {
        event
    };
    if stash.len() < stash.capacity() {
        stash.push_back(event);
        true
    } else {
        false
    }
}
