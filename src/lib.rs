//! Real-time audio routing between independent clients.
//!
//! Clients register named ports, connect outputs to inputs and supply a
//! process callback. Every cycle the [`Processor`] runs all active clients in
//! an order consistent with their connections, mixing whatever is connected
//! to each input. Everything else happens on the [`Engine`], the control half.

mod buffer;
mod client;
mod clock;
mod config;
mod engine;
mod error;
mod graph;
mod latency;
mod monitor;
mod order;
mod port;
mod scheduler;

pub use buffer::ProcessScope;
pub use client::{ClientId, ClientState, Control, ProcessHandler, ShutdownReason};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, Result};
pub use order::GraphOrder;
pub use port::{
    Frames, Port, PortFlags, PortId, PortType, Ports, Sample, DEFAULT_AUDIO_TYPE, MAX_CLIENT_NAME_LEN, MAX_PORT_NAME_LEN,
};
pub use scheduler::{CycleEvent, ProcessFailure, Processor, SchedulerState};
