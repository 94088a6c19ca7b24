use super::types::*;
use std::collections::HashMap;

/// Columnar storage for one variable's operation graph.
///
/// Nodes are appended after their parents, so index order is always a valid
/// topological order. Structurally identical nodes are stored once.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    // One entry per node
    pub kinds: Vec<NodeKind>,
    pub annotations: Vec<Option<Annotation>>,

    // Upstream edges, flattened
    pub parents_flat: Vec<NodeId>,
    pub parents_ranges: Vec<(u32, u32)>,

    // Downstream edges as per-node linked lists
    pub first_child: Vec<u32>,
    pub child_targets: Vec<NodeId>,
    pub next_child: Vec<u32>,

    // Structural identity -> existing node
    interned: HashMap<(NodeKind, Vec<NodeId>), NodeId>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }
    pub fn count(&self) -> usize { self.kinds.len() }

    /// Adds a node, or returns the existing node with the same kind and parents.
    pub fn add_node(&mut self, kind: NodeKind, parents: &[NodeId]) -> NodeId {
        let key = (kind, parents.to_vec());
        if let Some(&existing) = self.interned.get(&key) {
            return existing;
        }
        let (kind, _) = key.clone();
        let id = NodeId(self.kinds.len() as u32);

        let start = self.parents_flat.len() as u32;
        let count = parents.len() as u32;
        self.parents_flat.extend_from_slice(parents);
        self.parents_ranges.push((start, count));

        // Link this node into each parent's child list.
        for &parent in parents {
            let p_idx = parent.index();
            let head = self.first_child[p_idx];
            let new_edge = self.child_targets.len() as u32;
            self.child_targets.push(id);
            self.next_child.push(head);
            self.first_child[p_idx] = new_edge;
        }

        self.kinds.push(kind);
        self.annotations.push(None);
        self.first_child.push(u32::MAX);
        self.interned.insert(key, id);

        id
    }

    pub fn add_annotated(&mut self, kind: NodeKind, parents: &[NodeId], annotation: Annotation) -> NodeId {
        let id = self.add_node(kind, parents);
        self.annotations[id.index()] = Some(annotation);
        id
    }

    #[inline(always)]
    pub fn get_parents(&self, id: NodeId) -> &[NodeId] {
        let (start, count) = self.parents_ranges[id.index()];
        &self.parents_flat[start as usize..(start + count) as usize]
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind { &self.kinds[id.index()] }

    pub fn annotation(&self, id: NodeId) -> Option<&Annotation> {
        self.annotations.get(id.index()).and_then(|a| a.as_ref())
    }

    /// Direct consumers of `id`. A consumer that uses `id` twice appears twice.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut edge_idx = self.first_child[id.index()];
        while edge_idx != u32::MAX {
            out.push(self.child_targets[edge_idx as usize]);
            edge_idx = self.next_child[edge_idx as usize];
        }
        out
    }

    /// Nodes reachable upstream from `root` (including it), in index order.
    pub fn reachable_from(&self, root: NodeId) -> Vec<NodeId> {
        let mut seen = vec![false; self.count()];
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if std::mem::replace(&mut seen[node.index()], true) {
                continue;
            }
            stack.extend_from_slice(self.get_parents(node));
        }
        seen.iter()
            .enumerate()
            .filter(|(_, &s)| s)
            .map(|(i, _)| NodeId::new(i))
            .collect()
    }

    /// Names of every raw input referenced upstream of `root`.
    pub fn operands(&self, root: NodeId) -> Vec<String> {
        let mut names: Vec<String> = self
            .reachable_from(root)
            .into_iter()
            .filter_map(|id| match self.kind(id) {
                NodeKind::Operand(name) => Some(name.clone()),
                _ => None,
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str) -> NodeKind {
        NodeKind::Formula(Operation::Call { function: name.into(), options: vec![] })
    }

    #[test]
    fn test_identical_subexpressions_are_interned() {
        let mut reg = Registry::new();
        let x = reg.add_node(NodeKind::Operand("x".into()), &[]);
        let y = reg.add_node(NodeKind::Operand("y".into()), &[]);
        let m1 = reg.add_node(call("*"), &[x, y]);
        let m2 = reg.add_node(call("*"), &[x, y]);
        let swapped = reg.add_node(call("*"), &[y, x]);
        assert_eq!(m1, m2);
        assert_ne!(m1, swapped);
        assert_eq!(reg.count(), 4);
    }

    #[test]
    fn test_children_and_reachability() {
        let mut reg = Registry::new();
        let x = reg.add_node(NodeKind::Operand("x".into()), &[]);
        let unused = reg.add_node(NodeKind::Operand("z".into()), &[]);
        let sq = reg.add_node(call("*"), &[x, x]);
        let root = reg.add_node(call("sqrt"), &[sq]);

        assert_eq!(reg.children(x), vec![sq, sq]);
        assert_eq!(reg.reachable_from(root), vec![x, sq, root]);
        assert!(!reg.reachable_from(root).contains(&unused));
        assert_eq!(reg.operands(root), vec!["x".to_string()]);
    }
}
