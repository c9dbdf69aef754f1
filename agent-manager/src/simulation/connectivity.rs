//! Street connectivity between agents and courier destination selection.

use atlas::entity::{Entity, StreetData};
use atlas::spatial::geo::haversine_m;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

/// Agents with fewer connections than this are "weak".
const WEAK_DEGREE: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct AgentNode {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

impl From<&Entity> for AgentNode {
    fn from(e: &Entity) -> Self {
        Self {
            id: e.id.clone(),
            name: e.name.clone(),
            lat: e.lat,
            lon: e.lon,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    BridgeComponent,
    StrengthenWeakNode,
    ExpandCoverage,
    /// Set explicitly through `send_to` or waypoints
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    /// Target agent, when the destination is one
    pub agent_id: Option<String>,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub reason: SelectionReason,
}

/// Undirected graph of agents joined by walked streets.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<AgentNode>,
    edges: Vec<BTreeSet<usize>>,
}

impl Graph {
    /// Join two agents when a street has one endpoint within `connect_radius_m`
    /// of each.
    pub fn build(nodes: Vec<AgentNode>, streets: &[StreetData], connect_radius_m: f64) -> Self {
        let mut edges = vec![BTreeSet::new(); nodes.len()];
        let near = |p: [f64; 2]| -> Vec<usize> {
            nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| haversine_m(p[0], p[1], n.lat, n.lon) <= connect_radius_m)
                .map(|(i, _)| i)
                .collect()
        };

        for street in streets {
            let Some((start, end)) = street.endpoints() else {
                continue;
            };
            let (from, to) = (near(start), near(end));
            for &a in &from {
                for &b in &to {
                    if a != b {
                        edges[a].insert(b);
                        edges[b].insert(a);
                    }
                }
            }
        }

        Self { nodes, edges }
    }

    pub fn nodes(&self) -> &[AgentNode] {
        &self.nodes
    }

    pub fn degree(&self, index: usize) -> usize {
        self.edges.get(index).map_or(0, BTreeSet::len)
    }

    /// Component label per node (BFS).
    pub fn components(&self) -> Vec<usize> {
        let mut labels = vec![usize::MAX; self.nodes.len()];
        let mut next = 0;
        for root in 0..self.nodes.len() {
            if labels[root] != usize::MAX {
                continue;
            }
            labels[root] = next;
            let mut queue = VecDeque::from([root]);
            while let Some(n) = queue.pop_front() {
                for &m in &self.edges[n] {
                    if labels[m] == usize::MAX {
                        labels[m] = next;
                        queue.push_back(m);
                    }
                }
            }
            next += 1;
        }
        labels
    }

    fn distance(&self, index: usize, lat: f64, lon: f64) -> f64 {
        let n = &self.nodes[index];
        haversine_m(lat, lon, n.lat, n.lon)
    }

    pub fn nearest(&self, lat: f64, lon: f64) -> Option<usize> {
        (0..self.nodes.len()).min_by(|&a, &b| {
            self.distance(a, lat, lon)
                .total_cmp(&self.distance(b, lat, lon))
        })
    }
}

/// Pick where a courier at (`lat`, `lon`) should walk next.
///
/// First non-empty tier wins:
/// 1. bridge: for each component other than the courier's, its member nearest
///    the courier; the farthest of those
/// 2. weak node: fewest connections (below 3), ties to the farther agent
/// 3. coverage: the farthest agent
///
/// Agents within `exclude_radius_m` of the courier are never chosen.
pub fn select_destination(graph: &Graph, lat: f64, lon: f64, exclude_radius_m: f64) -> Option<Destination> {
    let home = graph.nearest(lat, lon)?;
    let labels = graph.components();
    let home_component = labels[home];

    let candidates: Vec<usize> = (0..graph.nodes.len())
        .filter(|&i| graph.distance(i, lat, lon) > exclude_radius_m)
        .collect();
    if candidates.is_empty() {
        return None;
    }

    // Tier 1: nearest member of each foreign component
    let mut bridge_targets = Vec::new();
    let mut seen = BTreeSet::new();
    for &i in &candidates {
        let component = labels[i];
        if component == home_component || !seen.insert(component) {
            continue;
        }
        let nearest_member = candidates
            .iter()
            .copied()
            .filter(|&j| labels[j] == component)
            .min_by(|&a, &b| {
                graph
                    .distance(a, lat, lon)
                    .total_cmp(&graph.distance(b, lat, lon))
            });
        bridge_targets.extend(nearest_member);
    }
    if let Some(target) = farthest(graph, bridge_targets, lat, lon) {
        return Some(destination(graph, target, SelectionReason::BridgeComponent));
    }

    // Tier 2: weakest node, farther first on ties
    let weak = candidates
        .iter()
        .copied()
        .filter(|&i| graph.degree(i) < WEAK_DEGREE)
        .min_by(|&a, &b| {
            graph.degree(a).cmp(&graph.degree(b)).then_with(|| {
                graph
                    .distance(b, lat, lon)
                    .total_cmp(&graph.distance(a, lat, lon))
            })
        });
    if let Some(target) = weak {
        return Some(destination(graph, target, SelectionReason::StrengthenWeakNode));
    }

    // Tier 3: farthest agent
    farthest(graph, candidates, lat, lon)
        .map(|target| destination(graph, target, SelectionReason::ExpandCoverage))
}

fn farthest(graph: &Graph, indices: Vec<usize>, lat: f64, lon: f64) -> Option<usize> {
    indices.into_iter().max_by(|&a, &b| {
        graph
            .distance(a, lat, lon)
            .total_cmp(&graph.distance(b, lat, lon))
    })
}

fn destination(graph: &Graph, index: usize, reason: SelectionReason) -> Destination {
    let node = &graph.nodes[index];
    Destination {
        agent_id: Some(node.id.clone()),
        name: node.name.clone(),
        lat: node.lat,
        lon: node.lon,
        reason,
    }
}
