//! Port records and the registry that owns them.

use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign};

use hashbrown::HashMap;
use regex::Regex;

use crate::client::ClientId;
use crate::error::{Error, Result};

/// Audio sample type carried by the built-in audio port type.
pub type Sample = f32;

/// Frame counts (buffer sizes, latencies).
pub type Frames = u32;

/// Type name of the built-in audio port type.
pub const DEFAULT_AUDIO_TYPE: &str = "32 bit float mono audio";

pub const MAX_CLIENT_NAME_LEN: usize = 32;
pub const MAX_PORT_NAME_LEN: usize = 256;

/// Stable handle to a registered port.
///
/// A slot index plus a generation: re-registering a port with a previously
/// used name yields a new id, and ids of unregistered ports never resolve.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct PortId {
    slot: u32,
    generation: u32,
}

impl PortId {
    #[inline]
    pub(crate) fn slot(self) -> usize {
        self.slot as usize
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}.{}", self.slot, self.generation)
    }
}

/// Port capability and direction bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PortFlags(u32);

impl PortFlags {
    pub const NONE: PortFlags = PortFlags(0);
    pub const IS_INPUT: PortFlags = PortFlags(0x1);
    pub const IS_OUTPUT: PortFlags = PortFlags(0x2);
    /// Refers to a physical connection.
    pub const IS_PHYSICAL: PortFlags = PortFlags(0x4);
    /// [`Engine::request_monitor`](crate::Engine::request_monitor) has an effect.
    pub const CAN_MONITOR: PortFlags = PortFlags(0x8);
    /// For an input: data received goes nowhere else in the graph.
    /// For an output: data does not originate from any other port.
    pub const IS_TERMINAL: PortFlags = PortFlags(0x10);

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Unknown bits are dropped.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        PortFlags(bits & 0x1f)
    }

    pub const fn contains(self, other: PortFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_input(self) -> bool {
        self.contains(Self::IS_INPUT)
    }

    pub const fn is_output(self) -> bool {
        self.contains(Self::IS_OUTPUT)
    }

    pub(crate) fn insert(&mut self, other: PortFlags) {
        self.0 |= other.0;
    }
}

impl BitOr for PortFlags {
    type Output = PortFlags;

    fn bitor(self, rhs: PortFlags) -> PortFlags {
        PortFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for PortFlags {
    fn bitor_assign(&mut self, rhs: PortFlags) {
        self.insert(rhs);
    }
}

impl BitAnd for PortFlags {
    type Output = PortFlags;

    fn bitand(self, rhs: PortFlags) -> PortFlags {
        PortFlags(self.0 & rhs.0)
    }
}

impl fmt::Debug for PortFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(PortFlags, &str); 5] = [
            (PortFlags::IS_INPUT, "IS_INPUT"),
            (PortFlags::IS_OUTPUT, "IS_OUTPUT"),
            (PortFlags::IS_PHYSICAL, "IS_PHYSICAL"),
            (PortFlags::CAN_MONITOR, "CAN_MONITOR"),
            (PortFlags::IS_TERMINAL, "IS_TERMINAL"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in NAMES.iter() {
            if self.contains(*flag) {
                set.entry(name);
            }
        }
        set.finish()
    }
}

/// The data type a port carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortType {
    /// [`DEFAULT_AUDIO_TYPE`]: one [`Sample`] per frame, mixed by summation.
    Audio,
    /// Any other type: an opaque region of `buffer_size` bytes, no mixdown.
    Custom { name: String, buffer_size: usize },
}

impl PortType {
    /// Resolve a type name and the explicit size given at registration.
    ///
    /// The built-in type ignores a zero size and rejects any size other than
    /// its element size. Other types must carry a non-zero size.
    pub fn resolve(name: &str, buffer_size: usize) -> Result<Self> {
        if name.is_empty() {
            return Err(Error::InvalidType("empty type name".into()));
        }
        if name == DEFAULT_AUDIO_TYPE {
            if buffer_size != 0 && buffer_size != core::mem::size_of::<Sample>() {
                return Err(Error::InvalidType(format!(
                    "{:?} has a fixed element size, got explicit size {}",
                    name, buffer_size
                )));
            }
            return Ok(PortType::Audio);
        }
        if buffer_size == 0 {
            return Err(Error::InvalidType(format!(
                "{:?} is not built in and needs a non-zero buffer size",
                name
            )));
        }
        Ok(PortType::Custom {
            name: name.into(),
            buffer_size,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            PortType::Audio => DEFAULT_AUDIO_TYPE,
            PortType::Custom { name, .. } => name,
        }
    }

    /// Whether several inbound connections can be mixed into one input.
    pub fn can_mix(&self) -> bool {
        matches!(self, PortType::Audio)
    }
}

/// A registered port. Read-only outside the engine.
#[derive(Clone, Debug)]
pub struct Port {
    id: PortId,
    client: ClientId,
    short_name: String,
    full_name: String,
    flags: PortFlags,
    port_type: PortType,
    pub(crate) locked: bool,
    pub(crate) latency: Frames,
    pub(crate) monitor_requests: u32,
}

impl Port {
    pub fn id(&self) -> PortId {
        self.id
    }

    /// Owning client.
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// `client:short`, unique engine-wide.
    pub fn name(&self) -> &str {
        &self.full_name
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn flags(&self) -> PortFlags {
        self.flags
    }

    pub fn port_type(&self) -> &PortType {
        &self.port_type
    }

    pub fn type_name(&self) -> &str {
        self.port_type.name()
    }

    pub fn is_input(&self) -> bool {
        self.flags.is_input()
    }

    pub fn is_output(&self) -> bool {
        self.flags.is_output()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Directly set latency in frames.
    pub fn latency(&self) -> Frames {
        self.latency
    }

    /// Locked ports refuse connection changes requested by anyone but the owner.
    pub(crate) fn blocks(&self, requester: ClientId) -> bool {
        self.locked && self.client != requester
    }

    fn client_prefix(&self) -> &str {
        &self.full_name[..self.full_name.len() - self.short_name.len()]
    }
}

struct Slot {
    generation: u32,
    port: Option<Port>,
}

/// Arena of port records addressed by [`PortId`].
pub(crate) struct PortRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_name: HashMap<String, PortId>,
    capacity: usize,
}

pub(crate) fn check_client_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_CLIENT_NAME_LEN || name.contains(':') {
        return Err(Error::InvalidName(name.into()));
    }
    Ok(())
}

fn check_short_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_PORT_NAME_LEN {
        return Err(Error::InvalidName(name.into()));
    }
    Ok(())
}

impl PortRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            by_name: HashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Register a port for `client`, whose name is `client_name`.
    pub fn register(
        &mut self,
        client: ClientId,
        client_name: &str,
        short_name: &str,
        type_name: &str,
        flags: PortFlags,
        buffer_size: usize,
    ) -> Result<PortId> {
        check_short_name(short_name)?;
        let port_type = PortType::resolve(type_name, buffer_size)?;
        if flags.is_input() == flags.is_output() {
            return Err(Error::DirectionError(format!(
                "{:?}: exactly one of IS_INPUT and IS_OUTPUT is required",
                short_name
            )));
        }

        let full_name = format!("{}:{}", client_name, short_name);
        if self.by_name.contains_key(&full_name) {
            return Err(Error::NameCollision(full_name));
        }

        let id = self.allocate()?;
        self.slots[id.slot()].port = Some(Port {
            id,
            client,
            short_name: short_name.into(),
            full_name: full_name.clone(),
            flags,
            port_type,
            locked: false,
            latency: 0,
            monitor_requests: 0,
        });
        self.by_name.insert(full_name, id);
        Ok(id)
    }

    fn allocate(&mut self) -> Result<PortId> {
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.generation = entry.generation.wrapping_add(1);
            return Ok(PortId {
                slot,
                generation: entry.generation,
            });
        }
        if self.slots.len() >= self.capacity {
            return Err(Error::CapacityExceeded("port"));
        }
        self.slots.push(Slot {
            generation: 0,
            port: None,
        });
        Ok(PortId {
            slot: (self.slots.len() - 1) as u32,
            generation: 0,
        })
    }

    /// Remove the record only. Connections are the graph's business.
    pub fn unregister(&mut self, id: PortId) -> Result<Port> {
        let port = self
            .slots
            .get_mut(id.slot())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.port.take())
            .ok_or_else(|| Error::PortNotFound(id.to_string()))?;
        self.by_name.remove(&port.full_name);
        self.free.push(id.slot);
        Ok(port)
    }

    pub fn rename(&mut self, id: PortId, short_name: &str) -> Result<()> {
        check_short_name(short_name)?;
        let port = self.get(id)?;
        let full_name = format!("{}{}", port.client_prefix(), short_name);
        if full_name == port.full_name {
            return Ok(());
        }
        if self.by_name.contains_key(&full_name) {
            return Err(Error::NameCollision(full_name));
        }

        let port = self.get_mut(id)?;
        let old = core::mem::replace(&mut port.full_name, full_name.clone());
        port.short_name = short_name.into();
        self.by_name.remove(&old);
        self.by_name.insert(full_name, id);
        Ok(())
    }

    pub fn get(&self, id: PortId) -> Result<&Port> {
        self.slots
            .get(id.slot())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.port.as_ref())
            .ok_or_else(|| Error::PortNotFound(id.to_string()))
    }

    pub fn get_mut(&mut self, id: PortId) -> Result<&mut Port> {
        self.slots
            .get_mut(id.slot())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.port.as_mut())
            .ok_or_else(|| Error::PortNotFound(id.to_string()))
    }

    pub fn lookup(&self, full_name: &str) -> Result<&Port> {
        self.by_name
            .get(full_name)
            .and_then(|id| self.get(*id).ok())
            .ok_or_else(|| Error::PortNotFound(full_name.into()))
    }

    /// Ports whose full name matches `name_pattern`, whose type name matches
    /// `type_pattern` and whose flags contain `flags`.
    ///
    /// Patterns are unanchored regular expressions; an empty pattern or empty
    /// flags select everything.
    pub fn query(&self, name_pattern: &str, type_pattern: &str, flags: PortFlags) -> Result<Ports<'_>> {
        Ok(Ports {
            slots: self.slots.iter(),
            name: compile(name_pattern)?,
            port_type: compile(type_pattern)?,
            flags,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Port> + '_ {
        self.slots.iter().filter_map(|slot| slot.port.as_ref())
    }
}

fn compile(pattern: &str) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|e| Error::InvalidPattern(e.to_string()))
}

/// Lazy, finite iterator over ports matching a query.
///
/// Cloning restarts from the clone point; a fresh query restarts from the top.
#[derive(Clone)]
pub struct Ports<'a> {
    slots: core::slice::Iter<'a, Slot>,
    name: Option<Regex>,
    port_type: Option<Regex>,
    flags: PortFlags,
}

impl<'a> Ports<'a> {
    fn matches(&self, port: &Port) -> bool {
        self.name.as_ref().map_or(true, |re| re.is_match(&port.full_name))
            && self.port_type.as_ref().map_or(true, |re| re.is_match(port.type_name()))
            && port.flags.contains(self.flags)
    }

    /// Collect the matching full names.
    pub fn names(self) -> Vec<String> {
        self.map(|port| port.full_name.clone()).collect()
    }
}

impl<'a> Iterator for Ports<'a> {
    type Item = &'a Port;

    fn next(&mut self) -> Option<&'a Port> {
        while let Some(slot) = self.slots.next() {
            if let Some(port) = slot.port.as_ref() {
                if self.matches(port) {
                    return Some(port);
                }
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.slots.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(n: u32) -> ClientId {
        ClientId::from_raw(n)
    }

    #[test]
    fn test_register_and_lookup() {
        let mut reg = PortRegistry::new(8);
        let id = reg
            .register(client(0), "synth", "out", DEFAULT_AUDIO_TYPE, PortFlags::IS_OUTPUT, 0)
            .unwrap();
        let port = reg.lookup("synth:out").unwrap();
        assert_eq!(port.id(), id);
        assert_eq!(port.short_name(), "out");
        assert_eq!(port.port_type(), &PortType::Audio);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_register_rejects_bad_input() {
        let mut reg = PortRegistry::new(8);
        let out = PortFlags::IS_OUTPUT;

        assert!(matches!(
            reg.register(client(0), "c", "p", "", out, 0),
            Err(Error::InvalidType(_))
        ));
        assert!(matches!(
            reg.register(client(0), "c", "p", DEFAULT_AUDIO_TYPE, out, 16),
            Err(Error::InvalidType(_))
        ));
        assert!(matches!(
            reg.register(client(0), "c", "p", "midi", out, 0),
            Err(Error::InvalidType(_))
        ));
        assert!(matches!(
            reg.register(client(0), "c", "p", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT | out, 0),
            Err(Error::DirectionError(_))
        ));
        assert!(matches!(
            reg.register(client(0), "c", "p", DEFAULT_AUDIO_TYPE, PortFlags::IS_PHYSICAL, 0),
            Err(Error::DirectionError(_))
        ));
        assert!(matches!(
            reg.register(client(0), "c", "", DEFAULT_AUDIO_TYPE, out, 0),
            Err(Error::InvalidName(_))
        ));

        reg.register(client(0), "c", "p", DEFAULT_AUDIO_TYPE, out, 4).unwrap();
        assert_eq!(
            reg.register(client(0), "c", "p", DEFAULT_AUDIO_TYPE, out, 0),
            Err(Error::NameCollision("c:p".into()))
        );
    }

    #[test]
    fn test_reregistration_gets_fresh_id() {
        let mut reg = PortRegistry::new(1);
        let first = reg
            .register(client(0), "c", "in", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT, 0)
            .unwrap();
        reg.unregister(first).unwrap();
        let second = reg
            .register(client(0), "c", "in", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT, 0)
            .unwrap();

        assert_ne!(first, second);
        assert!(reg.get(first).is_err());
        assert!(reg.get(second).is_ok());
        assert!(matches!(
            reg.register(client(0), "c", "other", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT, 0),
            Err(Error::CapacityExceeded(_))
        ));
    }

    #[test]
    fn test_rename() {
        let mut reg = PortRegistry::new(8);
        let a = reg
            .register(client(0), "c", "a", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT, 0)
            .unwrap();
        reg.register(client(0), "c", "b", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT, 0)
            .unwrap();

        assert_eq!(reg.rename(a, "b"), Err(Error::NameCollision("c:b".into())));
        reg.rename(a, "z").unwrap();
        assert_eq!(reg.lookup("c:z").unwrap().id(), a);
        assert!(reg.lookup("c:a").is_err());
    }

    #[test]
    fn test_query() {
        let mut reg = PortRegistry::new(8);
        reg.register(client(0), "sys", "capture_1", DEFAULT_AUDIO_TYPE, PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL, 0)
            .unwrap();
        reg.register(client(0), "sys", "playback_1", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT | PortFlags::IS_PHYSICAL, 0)
            .unwrap();
        reg.register(client(1), "seq", "midi_out", "midi", PortFlags::IS_OUTPUT, 1024)
            .unwrap();

        assert_eq!(reg.query("", "", PortFlags::NONE).unwrap().count(), 3);
        assert_eq!(
            reg.query("^sys:", "", PortFlags::NONE).unwrap().names(),
            vec!["sys:capture_1".to_string(), "sys:playback_1".to_string()]
        );
        assert_eq!(
            reg.query("", "audio", PortFlags::IS_OUTPUT).unwrap().names(),
            vec!["sys:capture_1".to_string()]
        );
        assert_eq!(reg.query("", "^midi$", PortFlags::NONE).unwrap().count(), 1);
        assert!(matches!(reg.query("(", "", PortFlags::NONE), Err(Error::InvalidPattern(_))));

        let query = reg.query("", "", PortFlags::IS_PHYSICAL).unwrap();
        let again = query.clone();
        assert_eq!(query.count(), 2);
        assert_eq!(again.count(), 2);
    }
}
