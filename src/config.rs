//! Engine configuration.

use crate::port::Frames;

/// Construction-time settings for an [`Engine`](crate::Engine).
///
/// The capacities bound every table on the real-time side, so the
/// [`Processor`](crate::Processor) never reallocates while running.
///
/// ```
/// # use patchwork::EngineConfig;
/// let config = EngineConfig::default()
///     .with_sample_rate(44_100)
///     .with_buffer_size(256);
/// assert_eq!(config.buffer_size, 256);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Maximum frames passed to a single process callback
    pub buffer_size: Frames,
    pub max_clients: usize,
    pub max_ports: usize,
    /// Slots in each of the command and event rings
    pub queue_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            buffer_size: 1024,
            max_clients: 64,
            max_ports: 512,
            queue_size: 1024,
        }
    }
}

impl EngineConfig {
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_buffer_size(mut self, frames: Frames) -> Self {
        self.buffer_size = frames;
        self
    }

    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    pub fn with_max_ports(mut self, max_ports: usize) -> Self {
        self.max_ports = max_ports;
        self
    }

    /// Set the capacity of the rings between the control and real-time halves.
    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size.max(16);
        self
    }
}
