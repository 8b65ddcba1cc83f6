//! Graph order - the running order of active clients for one cycle

use core::cmp::Reverse;
use std::collections::BinaryHeap;

use hashbrown::HashMap;
use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;

use crate::client::ClientId;

/// Total order over active clients, consistent with every acyclic
/// dependency between them.
///
/// Clients that feed each other (directly or through longer loops) are
/// grouped together and run in registration order; the ones running first
/// read their feedback sources' output from the previous cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GraphOrder {
    clients: Vec<ClientId>,
    feedback: Vec<ClientId>,
}

impl GraphOrder {
    pub fn as_slice(&self) -> &[ClientId] {
        &self.clients
    }

    pub fn iter(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.clients.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn position(&self, client: ClientId) -> Option<usize> {
        self.clients.iter().position(|c| *c == client)
    }

    /// Whether `client` sits on a feedback loop.
    pub fn in_feedback(&self, client: ClientId) -> bool {
        self.feedback.binary_search(&client).is_ok()
    }

    /// Order `clients` given client-level edges `(upstream, downstream)`.
    ///
    /// Edges touching clients outside `clients` and self-edges are ignored.
    /// Strongly connected components are found with Tarjan's algorithm, then
    /// the condensation is ordered with Kahn's algorithm, always releasing
    /// the ready component holding the earliest-registered client first. The
    /// result depends only on the sets given, never on their iteration order.
    pub fn compute<C, E>(clients: C, edges: E) -> Self
    where
        C: IntoIterator<Item = ClientId>,
        E: IntoIterator<Item = (ClientId, ClientId)>,
    {
        let mut nodes: Vec<ClientId> = clients.into_iter().collect();
        nodes.sort_unstable();
        nodes.dedup();

        let mut graph = DiGraphMap::<ClientId, ()>::with_capacity(nodes.len(), nodes.len());
        for client in &nodes {
            graph.add_node(*client);
        }
        for (from, to) in edges {
            if from != to && graph.contains_node(from) && graph.contains_node(to) {
                graph.add_edge(from, to, ());
            }
        }

        let mut components = tarjan_scc(&graph);
        let mut component_of = HashMap::with_capacity(nodes.len());
        let mut feedback = Vec::new();
        for (index, component) in components.iter_mut().enumerate() {
            component.sort_unstable();
            if component.len() > 1 {
                feedback.extend_from_slice(component);
            }
            for client in component.iter() {
                component_of.insert(*client, index);
            }
        }
        feedback.sort_unstable();

        let mut indegree = vec![0usize; components.len()];
        let mut successors = vec![Vec::new(); components.len()];
        for (from, to, _) in graph.all_edges() {
            let (a, b) = (component_of[&from], component_of[&to]);
            if a != b {
                successors[a].push(b);
                indegree[b] += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<(ClientId, usize)>> = components
            .iter()
            .enumerate()
            .filter(|(index, _)| indegree[*index] == 0)
            .map(|(index, component)| Reverse((component[0], index)))
            .collect();

        let mut clients = Vec::with_capacity(nodes.len());
        while let Some(Reverse((_, index))) = ready.pop() {
            clients.extend_from_slice(&components[index]);
            for &next in &successors[index] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push(Reverse((components[next][0], next)));
                }
            }
        }

        GraphOrder { clients, feedback }
    }
}
