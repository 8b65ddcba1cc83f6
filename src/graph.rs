//! Connection graph - directed port-to-port edges and intra-client ties

use hashbrown::HashMap;

use crate::client::ClientId;
use crate::error::{Error, Result};
use crate::port::{Port, PortId, PortRegistry};

/// Edges between output and input ports, kept in connection order.
///
/// Adjacency is stored in both directions so that resolving an input's
/// sources and walking an output's destinations are both direct lookups.
/// Insertion order of `incoming` fixes the summation order of mixed inputs.
#[derive(Default)]
pub(crate) struct ConnectionGraph {
    outgoing: HashMap<PortId, Vec<PortId>>,
    incoming: HashMap<PortId, Vec<PortId>>,
    /// Both directions: input -> output and output -> input
    ties: HashMap<PortId, PortId>,
    edge_count: usize,
}

fn check_lock(port: &Port, requester: ClientId) -> Result<()> {
    if port.blocks(requester) {
        return Err(Error::Locked(port.name().into()));
    }
    Ok(())
}

fn remove_item(list: &mut Vec<PortId>, item: PortId) -> bool {
    match list.iter().position(|p| *p == item) {
        Some(index) => {
            list.remove(index);
            true
        }
        None => false,
    }
}

impl ConnectionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Connect output `from` to input `to` on behalf of `requester`.
    pub fn connect(&mut self, ports: &PortRegistry, requester: ClientId, from: PortId, to: PortId) -> Result<()> {
        let src = ports.get(from)?;
        let dst = ports.get(to)?;

        if src.port_type() != dst.port_type() {
            return Err(Error::TypeMismatch {
                from: src.name().into(),
                to: dst.name().into(),
                from_type: src.type_name().into(),
                to_type: dst.type_name().into(),
            });
        }
        if !src.is_output() {
            return Err(Error::DirectionError(format!("{} is not an output", src.name())));
        }
        if !dst.is_input() {
            return Err(Error::DirectionError(format!("{} is not an input", dst.name())));
        }
        if self.is_connected(from, to) {
            return Err(Error::AlreadyConnected {
                from: src.name().into(),
                to: dst.name().into(),
            });
        }
        check_lock(src, requester)?;
        check_lock(dst, requester)?;
        if !dst.port_type().can_mix() && !self.sources(to).is_empty() {
            return Err(Error::MixdownUnsupported(dst.name().into()));
        }

        self.outgoing.entry(from).or_default().push(to);
        self.incoming.entry(to).or_default().push(from);
        self.edge_count += 1;
        Ok(())
    }

    pub fn disconnect(&mut self, ports: &PortRegistry, requester: ClientId, from: PortId, to: PortId) -> Result<()> {
        let src = ports.get(from)?;
        let dst = ports.get(to)?;

        if !self.is_connected(from, to) {
            return Err(Error::NotConnected {
                from: src.name().into(),
                to: dst.name().into(),
            });
        }
        check_lock(src, requester)?;
        check_lock(dst, requester)?;

        self.remove_edge(from, to);
        Ok(())
    }

    /// Drop every connection touching `port`, honoring locks on it and on
    /// every peer. Returns the removed edges as `(from, to)`.
    pub fn disconnect_all(&mut self, ports: &PortRegistry, requester: ClientId, port: PortId) -> Result<Vec<(PortId, PortId)>> {
        check_lock(ports.get(port)?, requester)?;
        for peer in self.connections(port) {
            check_lock(ports.get(peer)?, requester)?;
        }
        Ok(self.remove_port(port))
    }

    /// Unconditionally drop every connection and tie touching `port`.
    pub fn remove_port(&mut self, port: PortId) -> Vec<(PortId, PortId)> {
        let mut removed = Vec::new();
        for to in self.outgoing.remove(&port).unwrap_or_default() {
            if let Some(list) = self.incoming.get_mut(&to) {
                remove_item(list, port);
            }
            removed.push((port, to));
        }
        for from in self.incoming.remove(&port).unwrap_or_default() {
            if let Some(list) = self.outgoing.get_mut(&from) {
                remove_item(list, port);
            }
            removed.push((from, port));
        }
        if let Some(peer) = self.ties.remove(&port) {
            self.ties.remove(&peer);
        }
        self.edge_count -= removed.len();
        removed
    }

    fn remove_edge(&mut self, from: PortId, to: PortId) {
        let removed = self
            .outgoing
            .get_mut(&from)
            .map_or(false, |list| remove_item(list, to));
        if let Some(list) = self.incoming.get_mut(&to) {
            remove_item(list, from);
        }
        if removed {
            self.edge_count -= 1;
        }
    }

    pub fn is_connected(&self, from: PortId, to: PortId) -> bool {
        self.destinations(from).contains(&to)
    }

    /// Outputs feeding `input`, in connection order.
    pub fn sources(&self, input: PortId) -> &[PortId] {
        self.incoming.get(&input).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Inputs fed by `output`, in connection order.
    pub fn destinations(&self, output: PortId) -> &[PortId] {
        self.outgoing.get(&output).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every port directly connected to `port`, whichever side it is on.
    pub fn connections(&self, port: PortId) -> impl Iterator<Item = PortId> + '_ {
        self.sources(port)
            .iter()
            .chain(self.destinations(port).iter())
            .copied()
    }

    pub fn connected(&self, port: PortId) -> bool {
        self.connections(port).next().is_some()
    }

    /// Direct-edge test in either direction.
    pub fn connected_to(&self, port: PortId, other: PortId) -> bool {
        self.is_connected(port, other) || self.is_connected(other, port)
    }

    pub fn edges(&self) -> impl Iterator<Item = (PortId, PortId)> + '_ {
        self.outgoing
            .iter()
            .flat_map(|(from, targets)| targets.iter().map(move |to| (*from, *to)))
    }

    /// Mirror `input` onto `output`. Both must belong to the same client and
    /// neither may already be tied.
    pub fn tie(&mut self, ports: &PortRegistry, input: PortId, output: PortId) -> Result<()> {
        let src = ports.get(input)?;
        let dst = ports.get(output)?;

        if src.client() != dst.client() {
            return Err(Error::TieError(format!(
                "{} and {} belong to different clients",
                src.name(),
                dst.name()
            )));
        }
        if !src.is_input() || !dst.is_output() {
            return Err(Error::TieError(format!(
                "{} must be an input and {} an output",
                src.name(),
                dst.name()
            )));
        }
        if src.port_type() != dst.port_type() {
            return Err(Error::TieError(format!(
                "{} and {} carry different types",
                src.name(),
                dst.name()
            )));
        }
        if let Some(tied) = [input, output].iter().find(|p| self.ties.contains_key(*p)) {
            return Err(Error::TieError(format!("{} is already tied", ports.get(*tied)?.name())));
        }

        self.ties.insert(input, output);
        self.ties.insert(output, input);
        Ok(())
    }

    /// Undo a tie. `port` may be either end: the output, which the tie
    /// mirrors into, or the input it mirrors from. Returns the former peer.
    pub fn untie(&mut self, ports: &PortRegistry, port: PortId) -> Result<PortId> {
        let name = ports.get(port)?.name();
        let peer = self
            .ties
            .remove(&port)
            .ok_or_else(|| Error::TieError(format!("{} is not tied", name)))?;
        self.ties.remove(&peer);
        Ok(peer)
    }

    /// The port tied to `port`, if any.
    pub fn tied(&self, port: PortId) -> Option<PortId> {
        self.ties.get(&port).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{PortFlags, DEFAULT_AUDIO_TYPE};

    struct Fixture {
        ports: PortRegistry,
        graph: ConnectionGraph,
        a: ClientId,
        b: ClientId,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                ports: PortRegistry::new(32),
                graph: ConnectionGraph::new(),
                a: ClientId::from_raw(0),
                b: ClientId::from_raw(1),
            }
        }

        fn port(&mut self, client: ClientId, name: &str, type_name: &str, flags: PortFlags) -> PortId {
            let client_name = if client == self.a { "a" } else { "b" };
            let size = if type_name == DEFAULT_AUDIO_TYPE { 0 } else { 8 };
            self.ports
                .register(client, client_name, name, type_name, flags, size)
                .unwrap()
        }
    }

    #[test]
    fn test_connect_validation_order() {
        let mut f = Fixture::new();
        let a_in = f.port(f.a, "in", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT);
        let b_midi = f.port(f.b, "midi", "midi", PortFlags::IS_OUTPUT);
        let a_out = f.port(f.a, "out", DEFAULT_AUDIO_TYPE, PortFlags::IS_OUTPUT);
        let b_in = f.port(f.b, "in", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT);

        // wrong direction *and* wrong type still reports the type
        assert!(matches!(
            f.graph.connect(&f.ports, f.a, a_in, b_midi),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(matches!(
            f.graph.connect(&f.ports, f.a, b_in, a_out),
            Err(Error::DirectionError(_))
        ));

        f.graph.connect(&f.ports, f.a, a_out, b_in).unwrap();
        assert!(matches!(
            f.graph.connect(&f.ports, f.a, a_out, b_in),
            Err(Error::AlreadyConnected { .. })
        ));
        assert_eq!(f.graph.edge_count(), 1);
        assert!(f.graph.connected_to(b_in, a_out));
        assert!(!f.graph.connected(a_in));
    }

    #[test]
    fn test_locks_only_block_other_clients() {
        let mut f = Fixture::new();
        let a_out = f.port(f.a, "out", DEFAULT_AUDIO_TYPE, PortFlags::IS_OUTPUT);
        let b_in = f.port(f.b, "in", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT);
        f.ports.get_mut(a_out).unwrap().locked = true;

        assert_eq!(
            f.graph.connect(&f.ports, f.b, a_out, b_in),
            Err(Error::Locked("a:out".into()))
        );
        f.graph.connect(&f.ports, f.a, a_out, b_in).unwrap();
        assert!(matches!(
            f.graph.disconnect(&f.ports, f.b, a_out, b_in),
            Err(Error::Locked(_))
        ));
        f.graph.disconnect(&f.ports, f.a, a_out, b_in).unwrap();
        assert!(matches!(
            f.graph.disconnect(&f.ports, f.a, a_out, b_in),
            Err(Error::NotConnected { .. })
        ));
    }

    #[test]
    fn test_custom_types_refuse_second_source() {
        let mut f = Fixture::new();
        let o1 = f.port(f.a, "o1", "midi", PortFlags::IS_OUTPUT);
        let o2 = f.port(f.a, "o2", "midi", PortFlags::IS_OUTPUT);
        let i = f.port(f.b, "i", "midi", PortFlags::IS_INPUT);

        f.graph.connect(&f.ports, f.a, o1, i).unwrap();
        assert!(matches!(
            f.graph.connect(&f.ports, f.a, o2, i),
            Err(Error::MixdownUnsupported(_))
        ));
    }

    #[test]
    fn test_remove_port_cascades() {
        let mut f = Fixture::new();
        let a_in = f.port(f.a, "in", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT);
        let a_out = f.port(f.a, "out", DEFAULT_AUDIO_TYPE, PortFlags::IS_OUTPUT);
        let b_in = f.port(f.b, "in", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT);
        let b_out = f.port(f.b, "out", DEFAULT_AUDIO_TYPE, PortFlags::IS_OUTPUT);

        f.graph.connect(&f.ports, f.a, a_out, b_in).unwrap();
        f.graph.connect(&f.ports, f.a, b_out, a_in).unwrap();
        f.graph.tie(&f.ports, a_in, a_out).unwrap();

        let removed = f.graph.remove_port(a_out);
        assert_eq!(removed, vec![(a_out, b_in)]);
        assert_eq!(f.graph.tied(a_in), None);
        assert!(f.graph.sources(b_in).is_empty());
        assert_eq!(f.graph.sources(a_in), &[b_out]);
        assert_eq!(f.graph.edge_count(), 1);
    }

    #[test]
    fn test_tie_rules() {
        let mut f = Fixture::new();
        let a_in = f.port(f.a, "in", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT);
        let a_out = f.port(f.a, "out", DEFAULT_AUDIO_TYPE, PortFlags::IS_OUTPUT);
        let a_out2 = f.port(f.a, "out2", DEFAULT_AUDIO_TYPE, PortFlags::IS_OUTPUT);
        let b_out = f.port(f.b, "out", DEFAULT_AUDIO_TYPE, PortFlags::IS_OUTPUT);

        assert!(matches!(f.graph.tie(&f.ports, a_in, b_out), Err(Error::TieError(_))));
        assert!(matches!(f.graph.tie(&f.ports, a_out, a_in), Err(Error::TieError(_))));

        f.graph.tie(&f.ports, a_in, a_out).unwrap();
        assert!(matches!(f.graph.tie(&f.ports, a_in, a_out2), Err(Error::TieError(_))));
        assert_eq!(f.graph.tied(a_out), Some(a_in));

        assert_eq!(f.graph.untie(&f.ports, a_out), Ok(a_in));
        assert!(matches!(f.graph.untie(&f.ports, a_in), Err(Error::TieError(_))));
        f.graph.tie(&f.ports, a_in, a_out2).unwrap();
    }

    #[test]
    fn test_untie_from_input_end() {
        let mut f = Fixture::new();
        let a_in = f.port(f.a, "in", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT);
        let a_out = f.port(f.a, "out", DEFAULT_AUDIO_TYPE, PortFlags::IS_OUTPUT);

        f.graph.tie(&f.ports, a_in, a_out).unwrap();
        assert_eq!(f.graph.untie(&f.ports, a_in), Ok(a_out));
        assert_eq!(f.graph.tied(a_out), None);
        assert_eq!(f.graph.tied(a_in), None);
    }
}
