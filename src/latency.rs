//! Latency propagation across connection paths

use hashbrown::HashSet;

use crate::error::Result;
use crate::graph::ConnectionGraph;
use crate::port::{Frames, PortFlags, PortId, PortRegistry};

/// Largest sum of per-port latencies along any path from `port` to a
/// terminal port, following the port's own direction.
///
/// Output ports look downstream (output, connected inputs, tied outputs,
/// and so on); input ports look upstream. A tie is a free hop between two
/// ports of one client, though both ports still count their own latency.
/// Only paths ending at a terminal port count; when none is reachable the
/// port reports its own latency. Edges that close a feedback loop are skipped.
pub(crate) fn total_latency(ports: &PortRegistry, graph: &ConnectionGraph, port: PortId) -> Result<Frames> {
    let record = ports.get(port)?;
    let mut on_path = HashSet::new();
    Ok(walk(ports, graph, port, record.is_output(), true, &mut on_path).unwrap_or(record.latency()))
}

/// `None` when no terminal port lies beyond `port`.
fn walk(
    ports: &PortRegistry,
    graph: &ConnectionGraph,
    port: PortId,
    downstream: bool,
    start: bool,
    on_path: &mut HashSet<PortId>,
) -> Option<Frames> {
    let record = ports.get(port).ok()?;
    if !start && record.flags().contains(PortFlags::IS_TERMINAL) {
        return Some(record.latency());
    }

    let hops: Vec<PortId> = match (downstream, record.is_output()) {
        (true, true) => graph.destinations(port).to_vec(),
        (false, false) => graph.sources(port).to_vec(),
        // crossing a client: only through a tie
        _ => graph.tied(port).into_iter().collect(),
    };

    on_path.insert(port);
    let mut longest = None;
    for hop in hops {
        if !on_path.contains(&hop) {
            if let Some(frames) = walk(ports, graph, hop, downstream, false, on_path) {
                longest = longest.max(Some(frames));
            }
        }
    }
    on_path.remove(&port);

    longest.map(|frames: Frames| record.latency().saturating_add(frames))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientId;
    use crate::port::DEFAULT_AUDIO_TYPE;

    struct Net {
        ports: PortRegistry,
        graph: ConnectionGraph,
    }

    impl Net {
        fn new() -> Self {
            Self {
                ports: PortRegistry::new(32),
                graph: ConnectionGraph::new(),
            }
        }

        fn port(&mut self, client: u32, name: &str, flags: PortFlags, latency: Frames) -> PortId {
            let client_name = format!("c{}", client);
            let id = self
                .ports
                .register(ClientId::from_raw(client), &client_name, name, DEFAULT_AUDIO_TYPE, flags, 0)
                .unwrap();
            self.ports.get_mut(id).unwrap().latency = latency;
            id
        }

        fn connect(&mut self, from: PortId, to: PortId) {
            self.graph
                .connect(&self.ports, ClientId::from_raw(0), from, to)
                .unwrap();
        }

        fn total(&self, port: PortId) -> Frames {
            total_latency(&self.ports, &self.graph, port).unwrap()
        }
    }

    #[test]
    fn test_unconnected_port_reports_own_latency() {
        let mut net = Net::new();
        let p = net.port(0, "in", PortFlags::IS_INPUT, 7);
        assert_eq!(net.total(p), 7);
    }

    #[test]
    fn test_playback_path_takes_the_longest_branch() {
        let mut net = Net::new();
        let out = net.port(0, "out", PortFlags::IS_OUTPUT, 1);
        let fast = net.port(1, "playback_1", PortFlags::IS_INPUT | PortFlags::IS_TERMINAL, 64);
        let fx_in = net.port(2, "in", PortFlags::IS_INPUT, 0);
        let fx_out = net.port(2, "out", PortFlags::IS_OUTPUT, 10);
        let slow = net.port(1, "playback_2", PortFlags::IS_INPUT | PortFlags::IS_TERMINAL, 128);

        net.connect(out, fast);
        net.connect(out, fx_in);
        net.connect(fx_out, slow);
        // without the tie the effect's input is a dead end and does not count
        assert_eq!(net.total(out), 65);

        net.graph.tie(&net.ports, fx_in, fx_out).unwrap();
        assert_eq!(net.total(out), 1 + 0 + 10 + 128);
    }

    #[test]
    fn test_capture_path_runs_upstream() {
        let mut net = Net::new();
        let capture = net.port(0, "capture_1", PortFlags::IS_OUTPUT | PortFlags::IS_TERMINAL, 256);
        let input = net.port(1, "in", PortFlags::IS_INPUT, 2);
        net.connect(capture, input);

        assert_eq!(net.total(input), 258);
        // nothing terminal downstream of the capture port
        assert_eq!(net.total(capture), 256);
    }

    #[test]
    fn test_dead_end_branches_do_not_count() {
        let mut net = Net::new();
        let out = net.port(0, "out", PortFlags::IS_OUTPUT, 1);
        let play = net.port(1, "playback_1", PortFlags::IS_INPUT | PortFlags::IS_TERMINAL, 10);
        let dead = net.port(2, "in", PortFlags::IS_INPUT, 500);
        net.connect(out, play);
        net.connect(out, dead);

        assert_eq!(net.total(out), 11);
        assert_eq!(net.total(dead), 500);
    }

    #[test]
    fn test_feedback_loop_terminates() {
        let mut net = Net::new();
        let a_in = net.port(0, "in", PortFlags::IS_INPUT, 1);
        let a_out = net.port(0, "out", PortFlags::IS_OUTPUT, 2);
        let b_in = net.port(1, "in", PortFlags::IS_INPUT, 3);
        let b_out = net.port(1, "out", PortFlags::IS_OUTPUT, 4);
        net.connect(a_out, b_in);
        net.connect(b_out, a_in);
        net.graph.tie(&net.ports, a_in, a_out).unwrap();
        net.graph.tie(&net.ports, b_in, b_out).unwrap();
        // no terminal anywhere: own latency only
        assert_eq!(net.total(a_out), 2);

        let play = net.port(2, "playback_1", PortFlags::IS_INPUT | PortFlags::IS_TERMINAL, 5);
        net.connect(b_out, play);
        // a_out -> b_in -> b_out -> playback; the loop back through a_in is skipped
        assert_eq!(net.total(a_out), 2 + 3 + 4 + 5);
    }
}
