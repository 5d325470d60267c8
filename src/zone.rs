//! Zones: same-lifetime groupings of tenured data, the cross-zone reference
//! graph, and the strongly-connected-component analysis that orders sweep
//! groups.
//!
//! A zone stays alive as long as any reachable cell inside it is alive.
//! Cross-zone edges are the unit the sweep-ordering algorithm tracks: zones
//! in a reference cycle must be swept together, and a zone is only swept
//! once every unswept zone that could reach it has been swept.

use ahash::AHashSet;

use crate::cell::ZoneId;
use crate::sweep::Liveness;
use crate::tenured::ArenaLists;
use crate::trace::Edge;

pub(crate) type WeakZoneCallback = Box<dyn FnMut(&Liveness<'_>)>;

pub(crate) struct Zone {
    pub id: ZoneId,
    pub alive: bool,
    pub queued_for_destruction: bool,
    pub arenas: ArenaLists,
    /// Locations nulled when their target dies; swept per group before
    /// finalization.
    pub weak_edges: Vec<*mut Edge>,
    /// Embedder weak-map/weak-cache sweeping, invoked at this zone's sweep
    /// boundary.
    pub weak_callbacks: Vec<WeakZoneCallback>,
    /// Outgoing edges of the zone-reference graph.
    pub gc_edges: AHashSet<ZoneId>,
    /// Counter for GC-triggering heuristics.
    pub malloc_bytes: usize,
    pub malloc_threshold: usize,
}

impl Zone {
    pub fn new(id: ZoneId, malloc_threshold: usize) -> Self {
        Self {
            id,
            alive: true,
            queued_for_destruction: false,
            arenas: ArenaLists::new(),
            weak_edges: Vec::new(),
            weak_callbacks: Vec::new(),
            gc_edges: AHashSet::new(),
            malloc_bytes: 0,
            malloc_threshold,
        }
    }

    pub fn record_edge_to(&mut self, target: ZoneId) {
        if target != self.id {
            self.gc_edges.insert(target);
        }
    }

    pub fn register_weak_edge(&mut self, location: *mut Edge) {
        self.weak_edges.push(location);
    }

    pub fn unregister_weak_edge(&mut self, location: *mut Edge) {
        self.weak_edges.retain(|&slot| slot != location);
    }

    /// Returns true when the counter crosses the trigger threshold.
    pub fn update_malloc_bytes(&mut self, nbytes: usize) -> bool {
        let before = self.malloc_bytes;
        self.malloc_bytes = before.saturating_add(nbytes);
        before < self.malloc_threshold && self.malloc_bytes >= self.malloc_threshold
    }
}

/// Compute sweep groups over the zones selected by `collected`, using
/// Tarjan's strongly-connected-components algorithm.
///
/// Components are returned in completion order, which for Tarjan is reverse
/// topological order of the condensation: every group precedes all groups
/// that can reach it, so groups with no outgoing edges to unswept groups are
/// swept first.
pub(crate) fn find_sweep_groups(zones: &[Zone], collected: &[bool]) -> Vec<Vec<ZoneId>> {
    let n = zones.len();
    let in_graph = |v: usize| collected.get(v).copied().unwrap_or(false) && zones[v].alive;

    // Adjacency restricted to collected zones; deterministic order.
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (v, zone) in zones.iter().enumerate() {
        if !in_graph(v) {
            continue;
        }
        let mut targets: Vec<usize> = zone
            .gc_edges
            .iter()
            .map(|id| id.index())
            .filter(|&w| in_graph(w))
            .collect();
        targets.sort_unstable();
        edges[v] = targets;
    }

    let mut index: Vec<Option<u32>> = vec![None; n];
    let mut low: Vec<u32> = vec![0; n];
    let mut on_stack: Vec<bool> = vec![false; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut next_index = 0u32;
    let mut groups: Vec<Vec<ZoneId>> = Vec::new();

    // (vertex, next outgoing edge to examine)
    let mut frames: Vec<(usize, usize)> = Vec::new();

    for root in 0..n {
        if !in_graph(root) || index[root].is_some() {
            continue;
        }
        frames.push((root, 0));
        index[root] = Some(next_index);
        low[root] = next_index;
        next_index += 1;
        stack.push(root);
        on_stack[root] = true;

        while !frames.is_empty() {
            let (v, next) = {
                let frame = frames.last_mut().expect("checked non-empty");
                let v = frame.0;
                let next = edges[v].get(frame.1).copied();
                if next.is_some() {
                    frame.1 += 1;
                }
                (v, next)
            };
            match next {
                Some(w) => match index[w] {
                    None => {
                        frames.push((w, 0));
                        index[w] = Some(next_index);
                        low[w] = next_index;
                        next_index += 1;
                        stack.push(w);
                        on_stack[w] = true;
                    }
                    Some(w_index) => {
                        if on_stack[w] {
                            low[v] = low[v].min(w_index);
                        }
                    }
                },
                None => {
                    if low[v] == index[v].expect("visited") {
                        let mut group = Vec::new();
                        loop {
                            let w = stack.pop().expect("component member on stack");
                            on_stack[w] = false;
                            group.push(zones[w].id);
                            if w == v {
                                break;
                            }
                        }
                        group.sort_unstable();
                        groups.push(group);
                    }
                    frames.pop();
                    if let Some(parent) = frames.last() {
                        let p = parent.0;
                        low[p] = low[p].min(low[v]);
                    }
                }
            }
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_zones(n: usize) -> Vec<Zone> {
        (0..n)
            .map(|i| Zone::new(ZoneId(i as u32), usize::MAX))
            .collect()
    }

    fn groups_of(zones: &[Zone]) -> Vec<Vec<u32>> {
        let collected = vec![true; zones.len()];
        find_sweep_groups(zones, &collected)
            .into_iter()
            .map(|group| group.into_iter().map(|id| id.0).collect())
            .collect()
    }

    #[test]
    fn cycle_is_one_group() {
        let mut zones = make_zones(2);
        zones[0].record_edge_to(ZoneId(1));
        zones[1].record_edge_to(ZoneId(0));
        let groups = groups_of(&zones);
        assert_eq!(groups, vec![vec![0, 1]]);
    }

    #[test]
    fn dag_sweeps_dependencies_first() {
        // A(0) -> B(1) -> C(2): C has no outgoing edges and is swept first.
        let mut zones = make_zones(3);
        zones[0].record_edge_to(ZoneId(1));
        zones[1].record_edge_to(ZoneId(2));
        let groups = groups_of(&zones);
        assert_eq!(groups, vec![vec![2], vec![1], vec![0]]);
    }

    #[test]
    fn self_edges_are_ignored() {
        let mut zones = make_zones(1);
        zones[0].record_edge_to(ZoneId(0));
        assert!(zones[0].gc_edges.is_empty());
        assert_eq!(groups_of(&zones), vec![vec![0]]);
    }

    #[test]
    fn mixed_cycle_and_tail() {
        // 0 <-> 1, both -> 2. Group {2} first, then {0, 1}.
        let mut zones = make_zones(3);
        zones[0].record_edge_to(ZoneId(1));
        zones[1].record_edge_to(ZoneId(0));
        zones[0].record_edge_to(ZoneId(2));
        zones[1].record_edge_to(ZoneId(2));
        let groups = groups_of(&zones);
        assert_eq!(groups, vec![vec![2], vec![0, 1]]);
    }

    #[test]
    fn uncollected_zones_are_excluded() {
        let mut zones = make_zones(3);
        zones[0].record_edge_to(ZoneId(1));
        zones[1].record_edge_to(ZoneId(2));
        let collected = vec![true, false, true];
        let groups = find_sweep_groups(&zones, &collected);
        let flat: Vec<u32> = groups.into_iter().flatten().map(|id| id.0).collect();
        assert_eq!(flat, vec![0, 2]);
    }

    #[test]
    fn malloc_counter_triggers_once() {
        let mut zone = Zone::new(ZoneId(0), 1024);
        assert!(!zone.update_malloc_bytes(512));
        assert!(zone.update_malloc_bytes(512));
        assert!(!zone.update_malloc_bytes(512));
    }
}
