use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

use crate::api::{ClusterTopology, GuestLocation};
use crate::core::migration::GuestId;

/// Result of a single `patch_guest_moved` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    Moved,
    UnknownGuest,
    UnknownNode,
}

/// Client-side copy of the cluster topology.
///
/// Every guest lives in exactly one node's index and the union of all node
/// indexes is the key set of the location view. Both mutators keep that true.
#[derive(Debug, Clone, Default)]
pub struct ClusterMirror {
    guests: HashMap<GuestId, GuestLocation>,
    nodes: BTreeMap<String, BTreeSet<GuestId>>,
}

impl ClusterMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_topology(topology: &ClusterTopology) -> Self {
        let mut mirror = Self::new();
        mirror.replace_snapshot(topology, &HashSet::new());
        mirror
    }

    pub fn location(&self, guest_id: GuestId) -> Option<&GuestLocation> {
        self.guests.get(&guest_id)
    }

    pub fn guests_on(&self, node: &str) -> Option<&BTreeSet<GuestId>> {
        self.nodes.get(node)
    }

    pub fn contains_node(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&String, &BTreeSet<GuestId>)> {
        self.nodes.iter()
    }

    pub fn guest_count(&self) -> usize {
        self.guests.len()
    }

    /// Moves a guest between node indexes and updates its location in one step.
    ///
    /// Unknown guests or target nodes make the patch a logged no-op. When the
    /// guest is no longer on `from_node` it is moved off whatever node it is on.
    pub fn patch_guest_moved(
        &mut self,
        guest_id: GuestId,
        from_node: &str,
        to_node: &str,
        new_status: &str,
    ) -> PatchOutcome {
        if !self.nodes.contains_key(to_node) {
            warn!(guest_id, to_node, "Target node not in cluster mirror, skipping patch");
            return PatchOutcome::UnknownNode;
        }
        let Some(location) = self.guests.get_mut(&guest_id) else {
            warn!(guest_id, to_node, "Guest not in cluster mirror, skipping patch");
            return PatchOutcome::UnknownGuest;
        };

        let current = std::mem::replace(
            location,
            GuestLocation {
                node: to_node.to_string(),
                status: new_status.to_string(),
            },
        );
        if current.node != from_node {
            debug!(guest_id, expected = from_node, actual = %current.node, "Guest moved from an unexpected node");
        }

        if let Some(index) = self.nodes.get_mut(&current.node) {
            index.remove(&guest_id);
        }
        self.nodes.entry(to_node.to_string()).or_default().insert(guest_id);
        PatchOutcome::Moved
    }

    /// Replaces the whole mirror with a fresh topology.
    ///
    /// Guests in `protected` keep their current entry: a refresh racing an
    /// in-flight migration must not undo or pre-empt the tracked move.
    pub fn replace_snapshot(&mut self, topology: &ClusterTopology, protected: &HashSet<GuestId>) {
        let mut guests: HashMap<GuestId, GuestLocation> = HashMap::with_capacity(topology.guests.len());
        let mut nodes: BTreeMap<String, BTreeSet<GuestId>> =
            topology.nodes.keys().map(|name| (name.clone(), BTreeSet::new())).collect();

        for (&guest_id, location) in &topology.guests {
            let kept = if protected.contains(&guest_id) {
                self.guests.get(&guest_id)
            } else {
                None
            };
            let location = match kept {
                Some(kept) => {
                    if kept.node != location.node {
                        debug!(guest_id, mirror = %kept.node, remote = %location.node, "Refresh conflicts with tracked migration, keeping mirror");
                    }
                    kept.clone()
                }
                None => location.clone(),
            };
            nodes.entry(location.node.clone()).or_default().insert(guest_id);
            guests.insert(guest_id, location);
        }

        // tracked guests the refresh did not report at all stay where they were
        for &guest_id in protected {
            if guests.contains_key(&guest_id) {
                continue;
            }
            if let Some(kept) = self.guests.get(&guest_id) {
                nodes.entry(kept.node.clone()).or_default().insert(guest_id);
                guests.insert(guest_id, kept.clone());
            }
        }

        self.guests = guests;
        self.nodes = nodes;
    }

    /// Checks the one-node-per-guest invariant. Returns the offending guest ids.
    pub fn inconsistencies(&self) -> Vec<GuestId> {
        let mut seen: HashMap<GuestId, usize> = HashMap::new();
        for index in self.nodes.values() {
            for &guest_id in index {
                *seen.entry(guest_id).or_default() += 1;
            }
        }

        let mut bad: BTreeSet<GuestId> = seen
            .iter()
            .filter(|(guest_id, count)| **count != 1 || !self.guests.contains_key(guest_id))
            .map(|(guest_id, _)| *guest_id)
            .collect();
        for (guest_id, location) in &self.guests {
            let indexed = self.nodes.get(&location.node).is_some_and(|idx| idx.contains(guest_id));
            if !indexed {
                bad.insert(*guest_id);
            }
        }
        bad.into_iter().collect()
    }
}
