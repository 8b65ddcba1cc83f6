//! Port buffers, input mixing and the scope handed to process callbacks

use crate::clock::CycleClock;
use crate::port::{Frames, PortId, PortType, Sample};
use crate::scheduler::ClientStep;

/// Memory behind one port.
///
/// Audio buffers hold one sample per frame up to the engine's buffer size;
/// custom types hold their fixed byte size regardless of frame count.
#[derive(Debug)]
pub(crate) enum PortBuffer {
    Audio(Vec<Sample>),
    Raw(Vec<u8>),
}

impl PortBuffer {
    pub fn new(port_type: &PortType, frames: Frames) -> Self {
        match port_type {
            PortType::Audio => PortBuffer::Audio(vec![0.0; frames as usize]),
            PortType::Custom { buffer_size, .. } => PortBuffer::Raw(vec![0; *buffer_size]),
        }
    }

    pub fn clear(&mut self, frames: usize) {
        match self {
            PortBuffer::Audio(samples) => {
                let n = frames.min(samples.len());
                samples[..n].fill(0.0);
            }
            PortBuffer::Raw(bytes) => bytes.fill(0),
        }
    }

    pub fn copy_from(&mut self, other: &PortBuffer, frames: usize) {
        match (self, other) {
            (PortBuffer::Audio(dst), PortBuffer::Audio(src)) => {
                let n = frames.min(dst.len()).min(src.len());
                dst[..n].copy_from_slice(&src[..n]);
            }
            (PortBuffer::Raw(dst), PortBuffer::Raw(src)) => {
                let n = dst.len().min(src.len());
                dst[..n].copy_from_slice(&src[..n]);
            }
            // connections only join identical types
            _ => {}
        }
    }

    /// Element-wise sum into `self`. Only audio mixes.
    pub fn accumulate_from(&mut self, other: &PortBuffer, frames: usize) {
        if let (PortBuffer::Audio(dst), PortBuffer::Audio(src)) = (self, other) {
            for (d, s) in dst.iter_mut().zip(src.iter()).take(frames) {
                *d += *s;
            }
        }
    }

    pub fn audio(&self, frames: usize) -> Option<&[Sample]> {
        match self {
            PortBuffer::Audio(samples) => Some(&samples[..frames.min(samples.len())]),
            PortBuffer::Raw(_) => None,
        }
    }

    pub fn audio_mut(&mut self, frames: usize) -> Option<&mut [Sample]> {
        match self {
            PortBuffer::Audio(samples) => {
                let n = frames.min(samples.len());
                Some(&mut samples[..n])
            }
            PortBuffer::Raw(_) => None,
        }
    }

    pub fn raw(&self) -> Option<&[u8]> {
        match self {
            PortBuffer::Raw(bytes) => Some(bytes),
            PortBuffer::Audio(_) => None,
        }
    }

    pub fn raw_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            PortBuffer::Raw(bytes) => Some(bytes),
            PortBuffer::Audio(_) => None,
        }
    }
}

struct Attached {
    id: PortId,
    buffer: PortBuffer,
}

/// Fixed-capacity table of port buffers indexed by port slot.
///
/// Allocated once with the engine's port capacity; attaching and detaching
/// only move buffers in and out, so the table itself never reallocates.
pub(crate) struct BufferPool {
    slots: Vec<Option<Attached>>,
}

impl BufferPool {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Install `buffer` for `id`, returning whatever it displaced. A port
    /// outside the table's capacity gets its buffer handed straight back.
    pub fn attach(&mut self, id: PortId, buffer: PortBuffer) -> Option<PortBuffer> {
        match self.slots.get_mut(id.slot()) {
            Some(slot) => slot.replace(Attached { id, buffer }).map(|old| old.buffer),
            None => Some(buffer),
        }
    }

    pub fn detach(&mut self, id: PortId) -> Option<PortBuffer> {
        let slot = self.slots.get_mut(id.slot())?;
        if slot.as_ref().map_or(false, |attached| attached.id == id) {
            slot.take().map(|attached| attached.buffer)
        } else {
            None
        }
    }

    pub fn get(&self, id: PortId) -> Option<&PortBuffer> {
        self.slots
            .get(id.slot())?
            .as_ref()
            .filter(|attached| attached.id == id)
            .map(|attached| &attached.buffer)
    }

    pub fn get_mut(&mut self, id: PortId) -> Option<&mut PortBuffer> {
        self.slots
            .get_mut(id.slot())?
            .as_mut()
            .filter(|attached| attached.id == id)
            .map(|attached| &mut attached.buffer)
    }
}

/// Fill `input` from the outputs feeding it: silence for none, a copy for
/// one, the element-wise sum in `sources` order for several.
pub(crate) fn resolve_input(inputs: &mut BufferPool, outputs: &BufferPool, input: PortId, sources: &[PortId], frames: usize) {
    let target = match inputs.get_mut(input) {
        Some(target) => target,
        None => return,
    };
    let mut sources = sources.iter().filter_map(|source| outputs.get(*source));
    match sources.next() {
        None => target.clear(frames),
        Some(first) => {
            target.copy_from(first, frames);
            for source in sources {
                target.accumulate_from(source, frames);
            }
        }
    }
}

/// Copy a resolved input onto the output it is tied to.
pub(crate) fn apply_tie(inputs: &BufferPool, outputs: &mut BufferPool, input: PortId, output: PortId, frames: usize) {
    if let (Some(src), Some(dst)) = (inputs.get(input), outputs.get_mut(output)) {
        dst.copy_from(src, frames);
    }
}

/// What a process callback sees of the engine during one cycle.
///
/// Input buffers are already mixed when the callback runs and stay readable
/// for the whole callback. Output buffers start zeroed. Both are valid only
/// for the duration of the call; a client can only reach its own ports.
pub struct ProcessScope<'a> {
    info: CycleInfo,
    clock: &'a CycleClock,
    inputs: &'a BufferPool,
    outputs: &'a mut BufferPool,
    step: &'a ClientStep,
}

/// Per-cycle values copied into every [`ProcessScope`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct CycleInfo {
    pub frames: Frames,
    pub sample_rate: u32,
    pub cycle: u64,
    pub frame_time: u64,
    /// The client being run owns the timebase
    pub timebase: bool,
}

impl<'a> ProcessScope<'a> {
    pub(crate) fn new(
        info: CycleInfo,
        clock: &'a CycleClock,
        inputs: &'a BufferPool,
        outputs: &'a mut BufferPool,
        step: &'a ClientStep,
    ) -> Self {
        Self {
            info,
            clock,
            inputs,
            outputs,
            step,
        }
    }

    /// Frames to process this cycle.
    #[inline]
    pub fn frames(&self) -> Frames {
        self.info.frames
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.info.sample_rate
    }

    /// Index of the current cycle, counting from zero.
    #[inline]
    pub fn cycle(&self) -> u64 {
        self.info.cycle
    }

    /// Frames processed by the engine before this cycle.
    #[inline]
    pub fn frame_time(&self) -> u64 {
        self.info.frame_time
    }

    pub fn is_timebase_owner(&self) -> bool {
        self.info.timebase
    }

    /// Transport position as last reported by the timebase owner.
    pub fn transport_frame(&self) -> u64 {
        self.clock.transport()
    }

    /// Report the transport position. Only the timebase owner's report is
    /// taken; returns whether it was.
    pub fn update_time(&self, frame: u64) -> bool {
        if self.info.timebase {
            self.clock.set_transport(frame);
        }
        self.info.timebase
    }

    fn input_buffer(&self, port: PortId) -> Option<&'a PortBuffer> {
        let inputs: &'a BufferPool = self.inputs;
        if self.step.owns_input(port) {
            inputs.get(port)
        } else {
            None
        }
    }

    /// Mixed audio arriving at one of this client's input ports.
    ///
    /// `None` for ports the client does not own and for non-audio ports.
    pub fn input(&self, port: PortId) -> Option<&'a [Sample]> {
        self.input_buffer(port)?.audio(self.info.frames as usize)
    }

    /// Bytes arriving at one of this client's custom-type input ports.
    pub fn input_raw(&self, port: PortId) -> Option<&'a [u8]> {
        self.input_buffer(port)?.raw()
    }

    /// Writable audio region of one of this client's output ports.
    pub fn output(&mut self, port: PortId) -> Option<&mut [Sample]> {
        if !self.step.owns_output(port) {
            return None;
        }
        let frames = self.info.frames as usize;
        self.outputs.get_mut(port)?.audio_mut(frames)
    }

    /// Writable bytes of one of this client's custom-type output ports.
    pub fn output_raw(&mut self, port: PortId) -> Option<&mut [u8]> {
        if !self.step.owns_output(port) {
            return None;
        }
        self.outputs.get_mut(port)?.raw_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{PortFlags, PortRegistry, DEFAULT_AUDIO_TYPE};
    use crate::client::ClientId;

    fn audio_ports(n: usize) -> Vec<PortId> {
        let mut reg = PortRegistry::new(n);
        (0..n)
            .map(|i| {
                reg.register(ClientId::from_raw(0), "c", &format!("p{}", i), DEFAULT_AUDIO_TYPE, PortFlags::IS_OUTPUT, 0)
                    .unwrap()
            })
            .collect()
    }

    fn filled(values: &[Sample]) -> PortBuffer {
        PortBuffer::Audio(values.to_vec())
    }

    #[test]
    fn test_resolve_input_mixes_sources() {
        let ids = audio_ports(4);
        let (o1, o2, o3, input) = (ids[0], ids[1], ids[2], ids[3]);
        let mut outputs = BufferPool::with_capacity(4);
        let mut inputs = BufferPool::with_capacity(4);
        outputs.attach(o1, filled(&[1.0, 1.0, 1.0]));
        outputs.attach(o2, filled(&[2.0, 2.0, 2.0]));
        outputs.attach(o3, filled(&[0.5, -1.0, 4.0]));
        inputs.attach(input, filled(&[9.0, 9.0, 9.0]));

        resolve_input(&mut inputs, &outputs, input, &[], 3);
        assert_eq!(inputs.get(input).unwrap().audio(3), Some(&[0.0, 0.0, 0.0][..]));

        resolve_input(&mut inputs, &outputs, input, &[o1], 3);
        assert_eq!(inputs.get(input).unwrap().audio(3), Some(&[1.0, 1.0, 1.0][..]));

        resolve_input(&mut inputs, &outputs, input, &[o1, o2, o3], 3);
        assert_eq!(inputs.get(input).unwrap().audio(3), Some(&[3.5, 2.0, 7.0][..]));
    }

    #[test]
    fn test_partial_cycle_touches_only_requested_frames() {
        let ids = audio_ports(2);
        let mut outputs = BufferPool::with_capacity(2);
        let mut inputs = BufferPool::with_capacity(2);
        outputs.attach(ids[0], filled(&[1.0, 2.0, 3.0, 4.0]));
        inputs.attach(ids[1], filled(&[0.0; 4]));

        resolve_input(&mut inputs, &outputs, ids[1], &[ids[0]], 2);
        assert_eq!(inputs.get(ids[1]).unwrap().audio(4), Some(&[1.0, 2.0, 0.0, 0.0][..]));
    }

    #[test]
    fn test_pool_rejects_stale_ids() {
        let mut reg = PortRegistry::new(1);
        let client = ClientId::from_raw(0);
        let old = reg.register(client, "c", "p", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT, 0).unwrap();
        reg.unregister(old).unwrap();
        let new = reg.register(client, "c", "p", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT, 0).unwrap();

        let mut pool = BufferPool::with_capacity(1);
        assert!(pool.attach(new, filled(&[1.0])).is_none());
        assert!(pool.get(old).is_none());
        assert!(pool.detach(old).is_none());
        assert!(pool.detach(new).is_some());
    }
}
