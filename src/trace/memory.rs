//! The tree-shaped symbolic memory.
//!
//! Memory is a tree of cells addressed by integer paths from the root. A
//! child that is referenced but missing is materialised with an opaque value,
//! which is what makes dereferencing an unknown pointer invent an arbitrarily
//! large region behind it.

use std::collections::HashSet;

use serde_json::{json, Value as Json};

use super::{MemId, Payload, Trace, TraceError, TraceResult, ValueId};

/// A node in the memory tree. Children are kept sorted by their trailing
/// address coordinate.
#[derive(Debug, Clone)]
pub struct MemNode {
    pub parent: Option<MemId>,
    pub address: Vec<i64>,
    pub children: Vec<MemId>,
    pub value: ValueId,
}

impl Trace {
    pub fn root(&self) -> MemId {
        self.root
    }

    pub fn node(&self, m: MemId) -> &MemNode {
        &self.nodes[m.idx()]
    }

    /// The child at `address`, which must extend this node's address by one
    /// step. Created with an opaque value if missing.
    pub fn child_at(&mut self, m: MemId, address: Vec<i64>) -> TraceResult<MemId> {
        let parent_address = self.node(m).address.clone();
        if address.len() != parent_address.len() + 1
            || address[..parent_address.len()] != parent_address[..]
        {
            return Err(TraceError::BadAddress(format!(
                "{address:?} is not a child address of {parent_address:?}"
            )));
        }

        let mut insert_at = self.node(m).children.len();
        for (i, &child) in self.node(m).children.iter().enumerate() {
            let child_address = &self.nodes[child.idx()].address;
            if *child_address == address {
                return Ok(child);
            }
            if child_address[..] > address[..] {
                insert_at = i;
                break;
            }
        }

        let value = self.opaque();
        let id = MemId(self.nodes.len() as u32);
        self.nodes.push(MemNode {
            parent: Some(m),
            address,
            children: vec![],
            value,
        });
        self.nodes[m.idx()].children.insert(insert_at, id);
        Ok(id)
    }

    /// The child one coordinate below this node.
    pub fn child(&mut self, m: MemId, coordinate: i64) -> TraceResult<MemId> {
        let mut address = self.node(m).address.clone();
        address.push(coordinate);
        self.child_at(m, address)
    }

    /// Pointer arithmetic: same parent, trailing coordinate shifted.
    pub fn mem_add(&mut self, m: MemId, offset: i64) -> TraceResult<MemId> {
        let node = self.node(m);
        let Some(parent) = node.parent else {
            return Err(TraceError::BadAddress(
                "pointer arithmetic on the memory root".into(),
            ));
        };
        let mut address = node.address.clone();
        match address.last_mut() {
            Some(last) => *last += offset,
            None => {
                return Err(TraceError::BadAddress(
                    "pointer arithmetic on an empty address".into(),
                ))
            }
        }
        self.child_at(parent, address)
    }

    /// The next free slot under this node: one past the last child, or the
    /// 0-child when there are none.
    pub fn append(&mut self, m: MemId) -> TraceResult<MemId> {
        match self.node(m).children.last().copied() {
            Some(last) => self.mem_add(last, 1),
            None => self.child(m, 0),
        }
    }

    /// Walk down to a node with the given address, creating the path.
    pub fn lookup(&mut self, m: MemId, address: &[i64]) -> TraceResult<MemId> {
        let own = self.node(m).address.clone();
        if address[..own.len().min(address.len())] != own[..] || address.len() < own.len() {
            return Err(TraceError::BadAddress(format!(
                "{address:?} is not under {own:?}"
            )));
        }
        if address.len() == own.len() {
            return Ok(m);
        }
        let child = self.child_at(m, address[..own.len() + 1].to_vec())?;
        self.lookup(child, address)
    }

    /// Load: a node with children yields a recursive-memory summary value;
    /// a leaf yields its own value.
    pub fn get_value(&mut self, m: MemId) -> ValueId {
        if self.node(m).children.is_empty() {
            return self.node(m).value;
        }
        let head = self.node(m).value;
        let children = self.node(m).children.clone();
        let mut parts = vec![];
        for child in children {
            let coordinate = self.node(child).address.last().copied().unwrap_or(0);
            let sub = self.get_value(child);
            parts.push((coordinate, sub));
        }
        let summary = self.new_value(Payload::Summary(head, parts), true);
        self.values[summary.idx()].recursive_mem = true;
        summary
    }

    /// Store: a recursive-memory summary is deconstructed back into the
    /// subtree, anything else is stored opaquely.
    pub fn set_value(&mut self, m: MemId, v: ValueId) -> TraceResult<()> {
        if self.values[v.idx()].recursive_mem {
            if let Payload::Summary(head, parts) = self.values[v.idx()].payload.clone() {
                self.nodes[m.idx()].value = head;
                for (coordinate, sub) in parts {
                    let child = self.child(m, coordinate)?;
                    self.set_value(child, sub)?;
                }
                return Ok(());
            }
        }
        self.nodes[m.idx()].value = v;
        Ok(())
    }

    /// Stable small-integer offset for a field name, assigned at first sight.
    pub fn field_offset(&mut self, name: &str) -> i64 {
        if let Some(&offset) = self.offsets.get(name) {
            return offset;
        }
        let offset = self.offsets.len() as i64;
        self.offsets.insert(name.to_string(), offset);
        offset
    }

    /// The child cell holding the named field of this node.
    pub fn field(&mut self, m: MemId, name: &str) -> TraceResult<MemId> {
        let offset = self.field_offset(name);
        self.child(m, offset)
    }

    /// Convert a memory subtree to a plain nested structure.
    pub fn pyify(&self, m: MemId) -> Json {
        self.pyify_inner(m, &mut HashSet::new())
    }

    fn pyify_inner(&self, m: MemId, seen: &mut HashSet<MemId>) -> Json {
        if !seen.insert(m) {
            return Json::String(format!("{:?}", self.node(m).address));
        }
        let node = self.node(m);
        if !node.children.is_empty() {
            let children = node
                .children
                .iter()
                .map(|&child| self.pyify_inner(child, seen))
                .collect();
            return Json::Array(children);
        }
        match self.cval(node.value) {
            Payload::Int(n) => json!(n),
            Payload::Str(s) => json!(s),
            Payload::Mem(pointee) => Json::Array(vec![self.pyify_inner(*pointee, seen)]),
            Payload::Opaque(id) => json!(["opaque", id]),
            Payload::Deferred(op, _) => json!(["deferred", op.symbol()]),
            other => Json::String(format!("{other:?}")),
        }
    }

    /// Indented text rendering of a memory subtree.
    pub fn print_pyify(&self, m: MemId) -> String {
        let mut out = String::new();
        self.print_pyify_inner(m, &mut HashSet::new(), 0, &mut out);
        out
    }

    fn print_pyify_inner(
        &self,
        m: MemId,
        seen: &mut HashSet<MemId>,
        depth: usize,
        out: &mut String,
    ) {
        let indent = "|   ".repeat(depth);
        let address = format!("{:?}", self.node(m).address);
        if !seen.insert(m) {
            out.push_str(&format!("{indent}{address}\n"));
            return;
        }
        let node = self.node(m);
        if !node.children.is_empty() {
            out.push_str(&format!("{indent}{address}\n"));
            for &child in node.children.clone().iter() {
                self.print_pyify_inner(child, seen, depth + 1, out);
            }
            return;
        }
        let value = self.render_payload(self.cval(node.value));
        out.push_str(&format!("{indent}{address} = {value}\n"));
        if let Payload::Mem(pointee) = self.cval(node.value) {
            self.print_pyify_inner(*pointee, seen, depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children_stay_sorted() {
        let mut trace = Trace::new();
        let root = trace.root();
        trace.child(root, 5).unwrap();
        trace.child(root, 1).unwrap();
        trace.child(root, 3).unwrap();

        let coords: Vec<i64> = trace
            .node(root)
            .children
            .iter()
            .map(|&c| *trace.node(c).address.last().unwrap())
            .collect();
        assert_eq!(vec![1, 3, 5], coords);
    }

    #[test]
    fn test_child_is_idempotent() {
        let mut trace = Trace::new();
        let root = trace.root();
        let a = trace.child(root, 2).unwrap();
        let b = trace.child(root, 2).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_mem_add_shifts_trailing_coordinate() {
        let mut trace = Trace::new();
        let root = trace.root();
        let base = trace.child(root, 4).unwrap();
        let shifted = trace.mem_add(base, 3).unwrap();
        assert_eq!(vec![7], trace.node(shifted).address);
    }

    #[test]
    fn test_append_after_children() {
        let mut trace = Trace::new();
        let root = trace.root();
        let first = trace.append(root).unwrap();
        assert_eq!(vec![0], trace.node(first).address);
        let second = trace.append(root).unwrap();
        assert_eq!(vec![1], trace.node(second).address);
    }

    #[test]
    fn test_summary_round_trip() {
        let mut trace = Trace::new();
        let root = trace.root();

        let source = trace.child(root, 0).unwrap();
        let field = trace.child(source, 2).unwrap();
        let seven = trace.imm_int(7);
        trace.set_value(field, seven).unwrap();

        let summary = trace.get_value(source);
        assert!(trace.values[summary.idx()].recursive_mem);

        let target = trace.child(root, 9).unwrap();
        trace.set_value(target, summary).unwrap();

        let copied = trace.child(target, 2).unwrap();
        let loaded = trace.get_value(copied);
        assert_eq!(Payload::Int(7), *trace.cval(loaded));

        // The copy is independent of later writes to the source.
        let nine = trace.imm_int(9);
        trace.set_value(field, nine).unwrap();
        assert_eq!(Payload::Int(7), *trace.cval(loaded));
    }

    #[test]
    fn test_field_offsets_are_stable() {
        let mut trace = Trace::new();
        let a = trace.field_offset("probe");
        let b = trace.field_offset("remove");
        assert_eq!(a, trace.field_offset("probe"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_field_is_the_child_at_the_offset() {
        let mut trace = Trace::new();
        let root = trace.root();
        let node = trace.child(root, 0).unwrap();

        let probe = trace.field(node, "probe").unwrap();
        let remove = trace.field(node, "remove").unwrap();
        assert_eq!(probe, trace.field(node, "probe").unwrap());
        assert_ne!(probe, remove);

        let offset = trace.field_offset("remove");
        assert_eq!(offset, *trace.node(remove).address.last().unwrap());
    }

    #[test]
    fn test_pyify_leaf_value() {
        let mut trace = Trace::new();
        let root = trace.root();
        let cell = trace.child(root, 0).unwrap();
        let value = trace.imm_int(5);
        trace.set_value(cell, value).unwrap();
        assert_eq!(serde_json::json!([5]), trace.pyify(root));
    }
}
