use chord_lib::NodeId;

use crate::integration::TestHarness;

/// Properties a converged Chord ring must satisfy, checked against every live node's
/// local state.
pub struct NetworkInvariants;

#[derive(Debug)]
pub struct InvariantViolation {
    pub name: String,
    pub description: String,
    pub affected_nodes: Vec<NodeId>,
}

impl InvariantViolation {
    fn new(name: &str, node: NodeId, description: String) -> Self {
        Self {
            name: name.to_string(),
            description,
            affected_nodes: vec![node],
        }
    }
}

impl NetworkInvariants {
    /// Check all invariants and return any violations
    pub fn check_all(harness: &TestHarness) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();

        violations.extend(Self::check_successor_consistency(harness));
        violations.extend(Self::check_predecessor_consistency(harness));
        violations.extend(Self::check_successor_lists(harness));
        violations.extend(Self::check_finger_tables(harness));
        violations.extend(Self::check_departed_references(harness));
        violations.extend(Self::check_unique_ownership(harness));

        violations
    }

    /// The first successor-list entry is the next live id clockwise and agrees with finger 1.
    pub fn check_successor_consistency(harness: &TestHarness) -> Vec<InvariantViolation> {
        let ids = harness.node_ids();
        let mut violations = Vec::new();
        for (position, node) in harness.nodes().into_iter().enumerate() {
            let expected = ids[(position + 1) % ids.len()];
            let list = node.get_successor_list();
            let successor = list.first().map(|entry| entry.id);
            if successor != Some(expected) {
                violations.push(InvariantViolation::new(
                    "Successor Consistency",
                    node.info.id,
                    format!(
                        "node {} has successor {:?}, expected {}",
                        node.info.id, successor, expected
                    ),
                ));
            }
            let first_finger = node.get_finger_table().first().map(|entry| entry.id);
            if first_finger != successor {
                violations.push(InvariantViolation::new(
                    "Successor Consistency",
                    node.info.id,
                    format!(
                        "node {} has finger[1] {:?} but successor {:?}",
                        node.info.id, first_finger, successor
                    ),
                ));
            }
        }
        violations
    }

    /// Every predecessor is the previous live id; a lone node has none.
    pub fn check_predecessor_consistency(harness: &TestHarness) -> Vec<InvariantViolation> {
        let ids = harness.node_ids();
        let mut violations = Vec::new();
        for (position, node) in harness.nodes().into_iter().enumerate() {
            let predecessor = node.get_predecessor().map(|entry| entry.id);
            let consistent = if ids.len() == 1 {
                predecessor.is_none() || predecessor == Some(node.info.id)
            } else {
                predecessor == Some(ids[(position + ids.len() - 1) % ids.len()])
            };
            if !consistent {
                violations.push(InvariantViolation::new(
                    "Predecessor Consistency",
                    node.info.id,
                    format!("node {} has predecessor {:?}", node.info.id, predecessor),
                ));
            }
        }
        violations
    }

    /// Successor lists hold the next `r` live ids in ring order, without the node itself.
    pub fn check_successor_lists(harness: &TestHarness) -> Vec<InvariantViolation> {
        let ids = harness.node_ids();
        let mut violations = Vec::new();
        for (position, node) in harness.nodes().into_iter().enumerate() {
            let expected: Vec<NodeId> = if ids.len() == 1 {
                vec![node.info.id]
            } else {
                let length = node.config.successor_list_len.min(ids.len() - 1);
                (1..=length)
                    .map(|offset| ids[(position + offset) % ids.len()])
                    .collect()
            };
            let actual: Vec<NodeId> = node
                .get_successor_list()
                .iter()
                .map(|entry| entry.id)
                .collect();
            if actual != expected {
                violations.push(InvariantViolation::new(
                    "Successor List",
                    node.info.id,
                    format!(
                        "node {} has successor list {:?}, expected {:?}",
                        node.info.id, actual, expected
                    ),
                ));
            }
        }
        violations
    }

    /// Finger i points at the owner of `id + 2^(i-1)`.
    pub fn check_finger_tables(harness: &TestHarness) -> Vec<InvariantViolation> {
        let space = harness.id_space();
        let mut violations = Vec::new();
        for node in harness.nodes() {
            for (slot, finger) in node.get_finger_table().iter().enumerate() {
                let index = slot as u32 + 1;
                let start = space.finger_start(node.info.id, index);
                let expected = harness.expected_owner(start);
                if Some(finger.id) != expected {
                    violations.push(InvariantViolation::new(
                        "Finger Table",
                        node.info.id,
                        format!(
                            "node {} finger[{}] (start {}) is {}, expected {:?}",
                            node.info.id, index, start, finger.id, expected
                        ),
                    ));
                }
            }
        }
        violations
    }

    /// Nodes that left are gone from every predecessor, successor list and finger table.
    pub fn check_departed_references(harness: &TestHarness) -> Vec<InvariantViolation> {
        let departed = harness.departed();
        let mut violations = Vec::new();
        for node in harness.nodes() {
            let snapshot = node.snapshot();
            let mut referenced: Vec<NodeId> = snapshot
                .predecessor
                .iter()
                .chain(snapshot.successor_list.iter())
                .chain(snapshot.finger_table.iter())
                .map(|entry| entry.id)
                .filter(|id| departed.contains(id))
                .collect();
            referenced.sort_unstable();
            referenced.dedup();
            if !referenced.is_empty() {
                violations.push(InvariantViolation::new(
                    "Departed References",
                    node.info.id,
                    format!(
                        "node {} still references departed nodes {:?}",
                        node.info.id, referenced
                    ),
                ));
            }
        }
        violations
    }

    /// Each sampled key is owned by exactly one live node, the expected one.
    pub fn check_unique_ownership(harness: &TestHarness) -> Vec<InvariantViolation> {
        let size = harness.id_space().size();
        let step = (size / 512).max(1);
        let mut violations = Vec::new();
        let mut key: u128 = 0;
        while key < size {
            let id = key as NodeId;
            let owners: Vec<NodeId> = harness
                .nodes()
                .into_iter()
                .filter(|node| node.is_owner(id))
                .map(|node| node.info.id)
                .collect();
            let expected = harness.expected_owner(id);
            if owners.len() != 1 || owners.first().copied() != expected {
                violations.push(InvariantViolation {
                    name: "Unique Ownership".to_string(),
                    description: format!(
                        "key {} claimed by {:?}, expected {:?}",
                        id, owners, expected
                    ),
                    affected_nodes: owners,
                });
            }
            key += step;
        }
        violations
    }
}
