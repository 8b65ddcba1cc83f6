//! Control half of the engine: clients, ports, connections and scheduling

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use hashbrown::HashMap;
use itertools::Itertools;
use rtrb::{Consumer, Producer, PushError, RingBuffer};
use tracing::{debug, info, warn};

use crate::buffer::{PortBuffer, ProcessScope};
use crate::client::{
    ClientId, ClientRecord, ClientState, Control, ProcessHandler, ShutdownNotifier, ShutdownReason,
};
use crate::clock::CycleClock;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::graph::ConnectionGraph;
use crate::latency;
use crate::monitor;
use crate::order::GraphOrder;
use crate::port::{check_client_name, Frames, Port, PortFlags, PortId, PortRegistry, Ports};
use crate::scheduler::{ClientStep, Command, CycleEvent, Event, InputBinding, Processor, Schedule};

/// The control half of the routing engine.
///
/// `Engine` owns the port registry, the connection graph and every client's
/// non-real-time callbacks. All of its methods run on the control context and
/// may allocate or block; none of them may be called from a process callback.
/// Whenever the graph changes it recomputes the graph order, builds a new
/// immutable schedule and hands it to the [`Processor`], which picks it up at
/// the next cycle boundary.
///
/// # Example
///
/// ```
/// use patchwork::{Control, Engine, EngineConfig, PortFlags, DEFAULT_AUDIO_TYPE};
///
/// let (mut engine, mut processor) = Engine::new(EngineConfig::default().with_buffer_size(4)).unwrap();
///
/// let synth = engine.open_client("synth").unwrap();
/// let out = engine.register_port(synth, "out", DEFAULT_AUDIO_TYPE, PortFlags::IS_OUTPUT, 0).unwrap();
/// engine.set_process_callback(synth, move |scope| {
///     if let Some(buffer) = scope.output(out) {
///         buffer.fill(0.25);
///     }
///     Control::Continue
/// }).unwrap();
///
/// let speaker = engine.open_client("speaker").unwrap();
/// engine.register_port(speaker, "in", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT, 0).unwrap();
///
/// engine.activate(synth).unwrap();
/// engine.activate(speaker).unwrap();
/// engine.connect(synth, "synth:out", "speaker:in").unwrap();
///
/// assert_eq!(engine.graph_order().as_slice(), &[synth, speaker]);
/// processor.run_cycle(4);
/// engine.maintain();
/// ```
pub struct Engine {
    config: EngineConfig,
    ports: PortRegistry,
    graph: ConnectionGraph,
    clients: BTreeMap<ClientId, ClientRecord>,
    names: HashMap<String, ClientId>,
    free_slots: Vec<usize>,
    next_client: u32,
    order: GraphOrder,
    timebase: Option<ClientId>,
    clock: Arc<CycleClock>,
    generation: u64,
    activations: u64,
    commands: Producer<Command>,
    backlog: VecDeque<Command>,
    events: Consumer<Event>,
    xruns: u64,
    shut_down: bool,
}

impl Engine {
    /// Create an engine and its real-time [`Processor`].
    pub fn new(config: EngineConfig) -> Result<(Engine, Processor)> {
        if config.buffer_size == 0 {
            return Err(Error::InvalidBufferSize(config.buffer_size));
        }
        if config.sample_rate == 0 {
            return Err(Error::InvalidSampleRate(config.sample_rate));
        }

        let (command_tx, command_rx) = RingBuffer::new(config.queue_size);
        let (event_tx, event_rx) = RingBuffer::new(config.queue_size);
        let clock = Arc::new(CycleClock::new());
        let processor = Processor::new(&config, Arc::clone(&clock), command_rx, event_tx);

        let engine = Engine {
            config,
            ports: PortRegistry::new(config.max_ports),
            graph: ConnectionGraph::new(),
            clients: BTreeMap::new(),
            names: HashMap::new(),
            free_slots: (0..config.max_clients).rev().collect(),
            next_client: 0,
            order: GraphOrder::default(),
            timebase: None,
            clock,
            generation: 0,
            activations: 0,
            commands: command_tx,
            backlog: VecDeque::new(),
            events: event_rx,
            xruns: 0,
            shut_down: false,
        };
        info!(
            sample_rate = config.sample_rate,
            buffer_size = config.buffer_size,
            "engine created"
        );
        Ok((engine, processor))
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// Largest frame count passed to process callbacks.
    pub fn buffer_size(&self) -> Frames {
        self.config.buffer_size
    }

    /// The order clients ran in as of the last graph change.
    pub fn graph_order(&self) -> &GraphOrder {
        &self.order
    }

    /// Estimated frames elapsed since the processor started its current cycle.
    pub fn frames_since_cycle_start(&self) -> Frames {
        self.clock.frames_since_cycle_start(self.config.sample_rate)
    }

    /// Frames processed before the current cycle.
    pub fn frame_time(&self) -> u64 {
        self.clock.frame_time()
    }

    /// Transport position as last reported by the timebase owner.
    pub fn transport_frame(&self) -> u64 {
        self.clock.transport()
    }

    pub fn timebase_owner(&self) -> Option<ClientId> {
        self.timebase
    }

    /// Make `client` the timebase owner. From the next cycle on its process
    /// callback reports transport time with
    /// [`ProcessScope::update_time`]. Fails while another client owns it.
    pub fn take_over_timebase(&mut self, client: ClientId) -> Result<()> {
        self.ensure_available()?;
        let name = self.record(client)?.name.clone();
        match self.timebase {
            Some(owner) if owner == client => return Ok(()),
            Some(owner) => {
                let owner = self.record(owner).map_or_else(|_| owner.to_string(), |r| r.name.clone());
                return Err(Error::TimebaseTaken(owner));
            }
            None => {}
        }
        self.timebase = Some(client);
        self.send(Command::Timebase(Some(client)));
        info!(client = %name, "timebase taken over");
        Ok(())
    }

    /// Give up the timebase. A no-op unless `client` owns it.
    pub fn release_timebase(&mut self, client: ClientId) -> Result<()> {
        self.record(client)?;
        if self.timebase == Some(client) {
            self.timebase = None;
            self.send(Command::Timebase(None));
            info!(%client, "timebase released");
        }
        Ok(())
    }

    /// Deadline misses reported so far.
    pub fn xruns(&self) -> u64 {
        self.xruns
    }

    pub fn is_available(&self) -> bool {
        !self.shut_down && !self.events.is_abandoned()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::EngineUnavailable)
        }
    }

    fn record(&self, client: ClientId) -> Result<&ClientRecord> {
        self.clients.get(&client).ok_or(Error::ClientNotFound(client))
    }

    fn record_mut(&mut self, client: ClientId) -> Result<&mut ClientRecord> {
        self.clients.get_mut(&client).ok_or(Error::ClientNotFound(client))
    }

    // ---- clients ----

    /// Open a client. Names are 1 to 32 bytes, without `:`, and unique.
    pub fn open_client(&mut self, name: &str) -> Result<ClientId> {
        self.ensure_available()?;
        check_client_name(name)?;
        if self.names.contains_key(name) {
            return Err(Error::NameCollision(name.into()));
        }
        let slot = self.free_slots.pop().ok_or(Error::CapacityExceeded("client"))?;

        let id = ClientId::from_raw(self.next_client);
        self.next_client += 1;
        self.clients.insert(id, ClientRecord::new(name, slot));
        self.names.insert(name.into(), id);

        info!(client = name, %id, "client opened");
        Ok(id)
    }

    /// Close a client, removing its ports and every connection and tie
    /// touching them.
    pub fn close_client(&mut self, client: ClientId) -> Result<()> {
        let record = self.clients.remove(&client).ok_or(Error::ClientNotFound(client))?;
        self.names.remove(&record.name);
        for port in &record.ports {
            self.drop_port(*port)?;
        }
        self.send(Command::Uninstall { slot: record.slot });
        self.free_slots.push(record.slot);
        if self.timebase == Some(client) {
            self.timebase = None;
            self.send(Command::Timebase(None));
        }

        info!(client = %record.name, ports = record.ports.len(), "client closed");
        self.reschedule();
        Ok(())
    }

    pub fn client_name(&self, client: ClientId) -> Result<&str> {
        Ok(&self.record(client)?.name)
    }

    pub fn client_by_name(&self, name: &str) -> Option<ClientId> {
        self.names.get(name).copied()
    }

    pub fn client_state(&self, client: ClientId) -> Result<ClientState> {
        Ok(self.record(client)?.state)
    }

    /// Ports owned by `client`, in registration order.
    pub fn client_ports(&self, client: ClientId) -> Result<&[PortId]> {
        Ok(&self.record(client)?.ports)
    }

    /// Subscribe to shutdown notifications for `client`.
    ///
    /// The engine delivers at most one pending [`ShutdownReason`] with a
    /// non-blocking send, so the receiver can be polled from anywhere,
    /// including a signal-handler-like context that must not block. A new
    /// subscription replaces the previous one.
    pub fn on_shutdown(&mut self, client: ClientId) -> Result<Receiver<ShutdownReason>> {
        let (notifier, receiver) = ShutdownNotifier::channel();
        self.record_mut(client)?.shutdown = Some(notifier);
        Ok(receiver)
    }

    /// Install a closure as the client's process callback, replacing any
    /// previous one.
    pub fn set_process_callback<F>(&mut self, client: ClientId, callback: F) -> Result<()>
    where
        F: FnMut(&mut ProcessScope<'_>) -> Control + Send + 'static,
    {
        self.set_process_handler(client, callback)
    }

    /// Install a [`ProcessHandler`], replacing any previous one.
    pub fn set_process_handler<H: ProcessHandler>(&mut self, client: ClientId, handler: H) -> Result<()> {
        self.ensure_available()?;
        let slot = self.record(client)?.slot;
        self.send(Command::Install {
            slot,
            client,
            handler: Box::new(handler),
        });
        debug!(%client, "process handler installed");
        Ok(())
    }

    /// Called from the control context when the buffer size changes.
    /// Returning [`Control::Quit`] deactivates the client.
    pub fn set_buffer_size_callback<F>(&mut self, client: ClientId, callback: F) -> Result<()>
    where
        F: FnMut(Frames) -> Control + Send + 'static,
    {
        self.record_mut(client)?.callbacks.buffer_size = Some(Box::new(callback));
        Ok(())
    }

    pub fn set_sample_rate_callback<F>(&mut self, client: ClientId, callback: F) -> Result<()>
    where
        F: FnMut(u32) -> Control + Send + 'static,
    {
        self.record_mut(client)?.callbacks.sample_rate = Some(Box::new(callback));
        Ok(())
    }

    /// Called with `(port, true)` on registration and `(port, false)` on
    /// removal of any port in the engine.
    pub fn set_port_registration_callback<F>(&mut self, client: ClientId, callback: F) -> Result<()>
    where
        F: FnMut(PortId, bool) + Send + 'static,
    {
        self.record_mut(client)?.callbacks.port_registration = Some(Box::new(callback));
        Ok(())
    }

    /// Called while the client is active whenever the graph order is recomputed.
    pub fn set_graph_order_callback<F>(&mut self, client: ClientId, callback: F) -> Result<()>
    where
        F: FnMut(&GraphOrder) + Send + 'static,
    {
        self.record_mut(client)?.callbacks.graph_order = Some(Box::new(callback));
        Ok(())
    }

    /// Enter the schedulable set. The client runs from the next cycle on.
    pub fn activate(&mut self, client: ClientId) -> Result<()> {
        self.ensure_available()?;
        let record = self.record(client)?;
        if record.state == ClientState::Active {
            return Err(Error::ActivationError {
                client: record.name.clone(),
                state: record.state,
            });
        }

        self.activations += 1;
        let activation = self.activations;
        let record = self.record_mut(client)?;
        record.state = ClientState::Active;
        record.activation = activation;
        info!(client = %record.name, "client activated");

        self.reschedule();
        Ok(())
    }

    /// Leave the schedulable set. The client stays
    /// [`Deactivating`](ClientState::Deactivating) until the processor has
    /// picked up a schedule without it, which [`maintain`](Self::maintain)
    /// observes.
    pub fn deactivate(&mut self, client: ClientId) -> Result<()> {
        let record = self.record(client)?;
        if record.state != ClientState::Active {
            return Err(Error::ActivationError {
                client: record.name.clone(),
                state: record.state,
            });
        }
        self.begin_deactivation(client);
        Ok(())
    }

    fn begin_deactivation(&mut self, client: ClientId) {
        match self.clients.get_mut(&client) {
            Some(record) => record.state = ClientState::Deactivating,
            None => return,
        }
        self.reschedule();
        let generation = self.generation;
        if let Some(record) = self.clients.get_mut(&client) {
            record.leaving_at = generation;
            debug!(client = %record.name, generation, "client deactivating");
        }
    }

    // ---- ports ----

    /// Register a port named `client:short_name`.
    ///
    /// `flags` must hold exactly one of [`PortFlags::IS_INPUT`] and
    /// [`PortFlags::IS_OUTPUT`]. `buffer_size` is ignored (pass 0) for
    /// [`DEFAULT_AUDIO_TYPE`](crate::DEFAULT_AUDIO_TYPE) and required, in
    /// bytes, for every other type.
    pub fn register_port(
        &mut self,
        client: ClientId,
        short_name: &str,
        type_name: &str,
        flags: PortFlags,
        buffer_size: usize,
    ) -> Result<PortId> {
        self.ensure_available()?;
        let record = self.record(client)?;
        let (client_name, active) = (record.name.clone(), record.is_active());

        let id = self
            .ports
            .register(client, &client_name, short_name, type_name, flags, buffer_size)?;
        let port = self.ports.get(id)?;
        let buffer = PortBuffer::new(port.port_type(), self.config.buffer_size);
        debug!(port = port.name(), port_type = port.type_name(), ?flags, "port registered");
        let input = port.is_input();

        self.send(Command::Attach { port: id, input, buffer });
        self.record_mut(client)?.ports.push(id);
        self.notify_port_registration(id, true);
        if active {
            self.reschedule();
        }
        Ok(id)
    }

    /// Remove one of `client`'s ports and every connection and tie touching it.
    pub fn unregister_port(&mut self, client: ClientId, port: PortId) -> Result<()> {
        self.check_owner(client, port)?;
        self.drop_port(port)?;
        self.record_mut(client)?.ports.retain(|p| *p != port);
        self.reschedule();
        Ok(())
    }

    fn check_owner(&self, client: ClientId, port: PortId) -> Result<&Port> {
        self.record(client)?;
        let record = self.ports.get(port)?;
        if record.client() != client {
            return Err(Error::NotOwner {
                client,
                port: record.name().into(),
            });
        }
        Ok(record)
    }

    fn drop_port(&mut self, port: PortId) -> Result<()> {
        let removed = self.graph.remove_port(port);
        let record = self.ports.unregister(port)?;
        self.send(Command::Detach {
            port,
            input: record.is_input(),
        });
        debug!(port = record.name(), connections = removed.len(), "port unregistered");
        self.notify_port_registration(port, false);
        Ok(())
    }

    pub fn port(&self, port: PortId) -> Result<&Port> {
        self.ports.get(port)
    }

    pub fn port_by_name(&self, full_name: &str) -> Result<&Port> {
        self.ports.lookup(full_name)
    }

    pub fn port_is_mine(&self, client: ClientId, port: PortId) -> bool {
        self.ports.get(port).map_or(false, |p| p.client() == client)
    }

    /// Change a port's short name; its full name follows.
    pub fn set_port_name(&mut self, port: PortId, short_name: &str) -> Result<()> {
        self.ports.rename(port, short_name)
    }

    /// Ports matching regular expressions on full name and type name and
    /// carrying all of `flags`. Empty patterns and empty flags match all.
    pub fn ports(&self, name_pattern: &str, type_pattern: &str, flags: PortFlags) -> Result<Ports<'_>> {
        self.ports.query(name_pattern, type_pattern, flags)
    }

    /// Full names of the ports [`ports`](Self::ports) would yield.
    pub fn port_names(&self, name_pattern: &str, type_pattern: &str, flags: PortFlags) -> Result<Vec<String>> {
        Ok(self.ports(name_pattern, type_pattern, flags)?.names())
    }

    /// Protect a port from connection changes by other clients.
    pub fn lock_port(&mut self, client: ClientId, port: PortId) -> Result<()> {
        self.check_owner(client, port)?;
        self.ports.get_mut(port)?.locked = true;
        Ok(())
    }

    pub fn unlock_port(&mut self, client: ClientId, port: PortId) -> Result<()> {
        self.check_owner(client, port)?;
        self.ports.get_mut(port)?.locked = false;
        Ok(())
    }

    // ---- connections ----

    /// Connect two ports by full name on behalf of `client`.
    pub fn connect(&mut self, client: ClientId, from: &str, to: &str) -> Result<()> {
        let from = self.ports.lookup(from)?.id();
        let to = self.ports.lookup(to)?.id();
        self.connect_ports(client, from, to)
    }

    pub fn disconnect(&mut self, client: ClientId, from: &str, to: &str) -> Result<()> {
        let from = self.ports.lookup(from)?.id();
        let to = self.ports.lookup(to)?.id();
        self.disconnect_ports(client, from, to)
    }

    /// Connect output `from` to input `to` on behalf of `client`.
    ///
    /// Fails with [`Error::TypeMismatch`] before anything else is checked,
    /// then on direction, duplicates and locks held by other clients.
    pub fn connect_ports(&mut self, client: ClientId, from: PortId, to: PortId) -> Result<()> {
        self.ensure_available()?;
        self.record(client)?;
        self.graph.connect(&self.ports, client, from, to)?;
        debug!(from = self.port_label(from), to = self.port_label(to), "connected");
        self.reschedule();
        Ok(())
    }

    pub fn disconnect_ports(&mut self, client: ClientId, from: PortId, to: PortId) -> Result<()> {
        self.ensure_available()?;
        self.record(client)?;
        self.graph.disconnect(&self.ports, client, from, to)?;
        debug!(from = self.port_label(from), to = self.port_label(to), "disconnected");
        self.reschedule();
        Ok(())
    }

    /// Remove every connection touching `port`.
    pub fn disconnect_port(&mut self, client: ClientId, port: PortId) -> Result<()> {
        self.ensure_available()?;
        self.record(client)?;
        let removed = self.graph.disconnect_all(&self.ports, client, port)?;
        if !removed.is_empty() {
            debug!(port = self.port_label(port), connections = removed.len(), "port disconnected");
            self.reschedule();
        }
        Ok(())
    }

    fn port_label(&self, port: PortId) -> &str {
        self.ports.get(port).map_or("?", |p| p.name())
    }

    /// Whether the port has any connection at all.
    pub fn port_connected(&self, port: PortId) -> bool {
        self.graph.connected(port)
    }

    /// Whether `port` is directly connected, either way, to the port named `other`.
    pub fn port_connected_to(&self, port: PortId, other: &str) -> bool {
        self.ports
            .lookup(other)
            .map_or(false, |other| self.graph.connected_to(port, other.id()))
    }

    pub fn port_connected_to_port(&self, port: PortId, other: PortId) -> bool {
        self.graph.connected_to(port, other)
    }

    /// Full names of the ports directly connected to `port`, in connection order.
    pub fn port_connections(&self, port: PortId) -> Result<Vec<String>> {
        self.ports.get(port)?;
        self.graph
            .connections(port)
            .map(|peer| self.ports.get(peer).map(|p| p.name().to_string()))
            .collect()
    }

    /// Mirror a client's `input` onto its `output` every cycle.
    pub fn tie(&mut self, input: PortId, output: PortId) -> Result<()> {
        self.graph.tie(&self.ports, input, output)?;
        debug!(input = self.port_label(input), output = self.port_label(output), "tied");
        self.reschedule();
        Ok(())
    }

    /// Undo a tie, given either of its ports. The output end is the usual
    /// handle; the input end works too.
    pub fn untie(&mut self, port: PortId) -> Result<()> {
        let peer = self.graph.untie(&self.ports, port)?;
        debug!(port = self.port_label(port), peer = self.port_label(peer), "untied");
        self.reschedule();
        Ok(())
    }

    // ---- latency & monitoring ----

    pub fn port_latency(&self, port: PortId) -> Result<Frames> {
        Ok(self.ports.get(port)?.latency())
    }

    pub fn set_port_latency(&mut self, port: PortId, frames: Frames) -> Result<()> {
        self.ports.get_mut(port)?.latency = frames;
        Ok(())
    }

    /// Largest latency sum along any path from `port` to a terminal port.
    pub fn total_latency(&self, port: PortId) -> Result<Frames> {
        latency::total_latency(&self.ports, &self.graph, port)
    }

    /// Add (`on`) or withdraw a monitoring request. No effect unless the port
    /// has [`PortFlags::CAN_MONITOR`].
    pub fn request_monitor(&mut self, port: PortId, on: bool) -> Result<()> {
        monitor::request_monitor(&mut self.ports, port, on)
    }

    pub fn request_monitor_by_name(&mut self, full_name: &str, on: bool) -> Result<()> {
        let port = self.ports.lookup(full_name)?.id();
        self.request_monitor(port, on)
    }

    /// Turn monitoring on if it is off, or off if exactly one request holds it on.
    pub fn ensure_monitor(&mut self, port: PortId, on: bool) -> Result<()> {
        monitor::ensure_monitor(&mut self.ports, port, on)
    }

    pub fn monitoring_input(&self, port: PortId) -> Result<bool> {
        monitor::monitoring(&self.ports, port)
    }

    // ---- engine-wide settings ----

    /// Change the buffer size between cycles.
    ///
    /// Every port gets a freshly sized buffer and every client's buffer size
    /// callback runs before the processor sees the new size. Clients whose
    /// callback returns [`Control::Quit`] are deactivated and notified.
    pub fn set_buffer_size(&mut self, frames: Frames) -> Result<()> {
        self.ensure_available()?;
        if frames == 0 {
            return Err(Error::InvalidBufferSize(frames));
        }
        if frames == self.config.buffer_size {
            return Ok(());
        }
        self.config.buffer_size = frames;

        let buffers: Vec<Command> = self
            .ports
            .iter()
            .map(|port| Command::Attach {
                port: port.id(),
                input: port.is_input(),
                buffer: PortBuffer::new(port.port_type(), frames),
            })
            .collect();
        for command in buffers {
            self.send(command);
        }

        let mut rejected = Vec::new();
        for (id, record) in self.clients.iter_mut() {
            if let Some(callback) = record.callbacks.buffer_size.as_mut() {
                if callback(frames) == Control::Quit {
                    rejected.push(*id);
                }
            }
        }
        for client in rejected {
            if let Some(record) = self.clients.get(&client) {
                warn!(client = %record.name, frames, "buffer size rejected");
                record.notify_shutdown(ShutdownReason::BufferSizeRejected);
                if record.is_active() {
                    self.begin_deactivation(client);
                }
            }
        }

        self.send(Command::Configure {
            buffer_size: frames,
            sample_rate: self.config.sample_rate,
        });
        info!(frames, "buffer size changed");
        Ok(())
    }

    /// Change the sample rate between cycles, notifying every client first.
    pub fn set_sample_rate(&mut self, sample_rate: u32) -> Result<()> {
        self.ensure_available()?;
        if sample_rate == 0 {
            return Err(Error::InvalidSampleRate(sample_rate));
        }
        if sample_rate == self.config.sample_rate {
            return Ok(());
        }
        self.config.sample_rate = sample_rate;

        for record in self.clients.values_mut() {
            if let Some(callback) = record.callbacks.sample_rate.as_mut() {
                if callback(sample_rate) == Control::Quit {
                    warn!(client = %record.name, sample_rate, "sample rate callback failed");
                }
            }
        }

        self.send(Command::Configure {
            buffer_size: self.config.buffer_size,
            sample_rate,
        });
        info!(sample_rate, "sample rate changed");
        Ok(())
    }

    // ---- scheduling ----

    /// Recompute the graph order and publish a matching schedule.
    fn reschedule(&mut self) {
        let active: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, record)| record.is_active())
            .map(|(id, _)| *id)
            .collect();
        let ports = &self.ports;
        let edges = self.graph.edges().filter_map(|(from, to)| {
            Some((ports.get(from).ok()?.client(), ports.get(to).ok()?.client()))
        });
        let order = GraphOrder::compute(active, edges);
        self.order = order;

        self.generation += 1;
        let steps: Vec<ClientStep> = self.order.iter().filter_map(|client| self.step(client)).collect();
        let schedule = Schedule {
            generation: self.generation,
            steps,
        };
        debug!(
            generation = self.generation,
            order = %self.order.iter().filter_map(|c| self.clients.get(&c)).map(|r| r.name.as_str()).join(" -> "),
            "rescheduled"
        );
        self.send(Command::Schedule(Arc::new(schedule)));

        let order = &self.order;
        for record in self.clients.values_mut().filter(|record| record.is_active()) {
            if let Some(callback) = record.callbacks.graph_order.as_mut() {
                callback(order);
            }
        }
    }

    fn step(&self, client: ClientId) -> Option<ClientStep> {
        let record = self.clients.get(&client)?;
        let mut step = ClientStep {
            client,
            slot: record.slot,
            activation: record.activation,
            inputs: Vec::new(),
            outputs: Vec::new(),
            ties: Vec::new(),
        };
        for port in record.ports.iter().copied() {
            let info = match self.ports.get(port) {
                Ok(info) => info,
                Err(_) => continue,
            };
            if info.is_output() {
                step.outputs.push(port);
                continue;
            }
            let sources = self
                .graph
                .sources(port)
                .iter()
                .copied()
                .filter(|source| self.owner_active(*source))
                .collect();
            step.inputs.push(InputBinding { port, sources });
            if let Some(output) = self.graph.tied(port) {
                step.ties.push((port, output));
            }
        }
        Some(step)
    }

    fn owner_active(&self, port: PortId) -> bool {
        self.ports
            .get(port)
            .ok()
            .and_then(|p| self.clients.get(&p.client()))
            .map_or(false, ClientRecord::is_active)
    }

    fn notify_port_registration(&mut self, port: PortId, registered: bool) {
        for record in self.clients.values_mut() {
            if let Some(callback) = record.callbacks.port_registration.as_mut() {
                callback(port, registered);
            }
        }
    }

    fn send(&mut self, command: Command) {
        self.flush();
        if !self.backlog.is_empty() {
            self.backlog.push_back(command);
            return;
        }
        if let Err(PushError::Full(command)) = self.commands.push(command) {
            self.backlog.push_back(command);
        }
    }

    fn flush(&mut self) {
        while let Some(command) = self.backlog.pop_front() {
            if let Err(PushError::Full(command)) = self.commands.push(command) {
                self.backlog.push_front(command);
                break;
            }
        }
    }

    /// Handle everything the processor reported since the last call.
    ///
    /// Failed clients are deactivated and sent
    /// [`ShutdownReason::ProcessFailed`]; deadline misses are counted;
    /// clients waiting in [`Deactivating`](ClientState::Deactivating) become
    /// inactive once the processor has moved past them; memory the processor
    /// let go of is freed here. If the processor itself is gone, the engine
    /// shuts down. Returns the cycle events seen.
    pub fn maintain(&mut self) -> Vec<CycleEvent> {
        self.flush();
        let mut reports = Vec::new();
        while let Ok(event) = self.events.pop() {
            match event {
                Event::Report(report) => {
                    self.handle_report(report);
                    reports.push(report);
                }
                Event::Applied { generation, previous } => {
                    drop(previous);
                    self.finish_deactivations(generation);
                }
                Event::Release(garbage) => drop(garbage),
            }
        }
        if self.events.is_abandoned() && !self.shut_down {
            warn!("processor dropped");
            self.shutdown();
        }
        reports
    }

    fn handle_report(&mut self, report: CycleEvent) {
        match report {
            CycleEvent::ClientFailed { client, failure } => {
                let record = match self.clients.get(&client) {
                    Some(record) => record,
                    None => return,
                };
                warn!(client = %record.name, ?failure, "process callback failed");
                if record.is_active() {
                    record.notify_shutdown(ShutdownReason::ProcessFailed);
                    self.begin_deactivation(client);
                }
            }
            CycleEvent::DeadlineMiss { cycle, elapsed, budget } => {
                self.xruns += 1;
                warn!(cycle, ?elapsed, ?budget, "cycle missed its deadline");
            }
        }
    }

    fn finish_deactivations(&mut self, generation: u64) {
        for record in self.clients.values_mut() {
            if record.state == ClientState::Deactivating && record.leaving_at <= generation {
                record.state = ClientState::Inactive;
                info!(client = %record.name, "client deactivated");
            }
        }
    }

    /// Stop the engine: notify every client with
    /// [`ShutdownReason::EngineShutdown`] and tell the processor to quit.
    /// Later operations fail with [`Error::EngineUnavailable`].
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        for record in self.clients.values() {
            record.notify_shutdown(ShutdownReason::EngineShutdown);
        }
        self.send(Command::Shutdown);
        info!("engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
