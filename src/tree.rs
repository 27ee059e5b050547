//
// Copyright (c) The heracles Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! The in-memory configuration tree.
//!
//! Nodes live in a generational arena owned by [`Tree`] and are addressed
//! by [`NodeId`]s. An id carries the generation of the slot it was minted
//! for, so an id taken before a node was unlinked can never resolve to a
//! node that later reuses the same slot. This is what makes node ids safe
//! to keep in the symbol table as weak references.
//!
//! To make dealing with parents uniform, even for top-level nodes, the
//! tree has a hidden *origin* node whose parent is itself and whose
//! children are the top-level entries (`/heracles`, `/files`, ...).
//!
//! The dirty flag tracks which parts of the tree may need to be saved.
//! For any dirty node, all of its ancestors are dirty too. Only
//! [`Tree::mark_dirty`] may set the flag.

use std::sync::Arc;

/// Handle to a node in a [`Tree`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct NodeId {
    index: u32,
    gen: u32,
}

/// Byte offsets of a node into the file it was parsed from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Span {
    pub filename: Arc<str>,
    pub label_start: u32,
    pub label_end: u32,
    pub value_start: u32,
    pub value_end: u32,
    pub span_start: u32,
    pub span_end: u32,
}

impl Span {
    pub(crate) fn new(filename: Arc<str>) -> Span {
        Span {
            filename,
            label_start: 0,
            label_end: 0,
            value_start: 0,
            value_end: 0,
            span_start: 0,
            span_end: 0,
        }
    }
}

/// A single entry in the configuration tree.
///
/// A node with no label is *hidden*: path expressions never match it by
/// name, and `match`/`rm` skip it, but it may anchor a subtree.
#[derive(Debug)]
pub(crate) struct Node {
    pub label: Option<String>,
    pub value: Option<String>,
    pub parent: NodeId,
    pub children: Vec<NodeId>,
    pub dirty: bool,
    pub span: Option<Span>,
}

#[derive(Debug)]
struct Slot {
    gen: u32,
    node: Option<Node>,
}

/// The arena holding all nodes of one engine handle.
#[derive(Debug)]
pub(crate) struct Tree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    origin: NodeId,
}

// ===== impl Tree =====

impl Tree {
    /// Create a tree holding only the origin sentinel.
    pub fn new() -> Tree {
        let mut tree = Tree {
            slots: Vec::new(),
            free: Vec::new(),
            origin: NodeId { index: 0, gen: 0 },
        };
        let origin = tree.alloc(Node {
            label: None,
            value: None,
            parent: NodeId { index: 0, gen: 0 },
            children: Vec::new(),
            dirty: true,
            span: None,
        });
        tree.origin = origin;
        tree.node_mut(origin).parent = origin;
        tree
    }

    pub fn origin(&self) -> NodeId {
        self.origin
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeId {
                    index,
                    gen: slot.gen,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    gen: 0,
                    node: Some(node),
                });
                NodeId { index, gen: 0 }
            }
        }
    }

    /// Look a node up, returning `None` for stale ids.
    pub fn get(&self, id: NodeId) -> Option<&Node> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.node.as_ref()
    }

    /// True when `id` still refers to a live node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        match self.get(id) {
            Some(node) => node,
            None => panic!("stale node id"),
        }
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        let slot = &mut self.slots[id.index as usize];
        match (slot.gen == id.gen, slot.node.as_mut()) {
            (true, Some(node)) => node,
            _ => panic!("stale node id"),
        }
    }

    /// Allocate a new node and mark it (and its ancestors) dirty.
    pub fn make_node(
        &mut self,
        label: Option<String>,
        value: Option<String>,
        parent: NodeId,
    ) -> NodeId {
        let id = self.alloc(Node {
            label,
            value,
            parent,
            children: Vec::new(),
            dirty: false,
            span: None,
        });
        self.mark_dirty(id);
        id
    }

    /// Make a new node and append it to `parent`'s children.
    pub fn append(
        &mut self,
        parent: NodeId,
        label: Option<String>,
        value: Option<String>,
    ) -> NodeId {
        let id = self.make_node(label, value, parent);
        self.node_mut(parent).children.push(id);
        id
    }

    /// Insert a new node with `label` right before or after `sibling`.
    pub fn insert_sibling(
        &mut self,
        sibling: NodeId,
        label: &str,
        before: bool,
    ) -> NodeId {
        let parent = self.node(sibling).parent;
        let id = self.make_node(Some(label.to_owned()), None, parent);
        let children = &mut self.node_mut(parent).children;
        let pos = children
            .iter()
            .position(|c| *c == sibling)
            .map(|p| if before { p } else { p + 1 })
            .unwrap_or(children.len());
        children.insert(pos, id);
        id
    }

    /// Mark a node and its ancestors dirty, stopping early once an
    /// already-dirty ancestor is found.
    pub fn mark_dirty(&mut self, id: NodeId) {
        let mut id = id;
        loop {
            let node = self.node_mut(id);
            node.dirty = true;
            let parent = node.parent;
            if parent == id || self.node(parent).dirty {
                self.node_mut(parent).dirty = true;
                return;
            }
            id = parent;
        }
    }

    /// Clear the dirty flag in the whole subtree below (and including) `id`.
    pub fn clean(&mut self, id: NodeId) {
        if self.node(id).dirty {
            let children = self.node(id).children.clone();
            for child in children {
                self.clean(child);
            }
        }
        self.node_mut(id).dirty = false;
    }

    /// Set the value, marking the node dirty. A no-op when the new value
    /// is byte-equal to the current one.
    pub fn set_value(&mut self, id: NodeId, value: Option<&str>) {
        let node = self.node_mut(id);
        if node.value.as_deref() == value {
            return;
        }
        node.value = value.map(str::to_owned);
        self.mark_dirty(id);
    }

    /// Relabel a node, marking it dirty.
    pub fn set_label(&mut self, id: NodeId, label: &str) {
        self.node_mut(id).label = Some(label.to_owned());
        self.mark_dirty(id);
    }

    /// Return the first child with the given label.
    pub fn find_child(&self, id: NodeId, label: &str) -> Option<NodeId> {
        self.node(id)
            .children
            .iter()
            .copied()
            .find(|c| self.node(*c).label.as_deref() == Some(label))
    }

    /// Return the first child with the given label, creating it if there
    /// is none.
    pub fn child_or_create(&mut self, id: NodeId, label: &str) -> NodeId {
        match self.find_child(id, label) {
            Some(child) => child,
            None => self.append(id, Some(label.to_owned()), None),
        }
    }

    /// Create a chain of labelled nodes below `id`, reusing existing
    /// children along the way, and return the deepest node.
    pub fn path_create(&mut self, id: NodeId, labels: &[&str]) -> NodeId {
        let mut id = id;
        for label in labels {
            id = self.child_or_create(id, label);
        }
        id
    }

    /// Unlink `id` from its parent and free the whole subtree. Returns the
    /// number of nodes freed; stale ids free nothing.
    pub fn unlink(&mut self, id: NodeId) -> usize {
        if !self.contains(id) {
            return 0;
        }
        let parent = self.node(id).parent;
        if parent != id {
            let children = &mut self.node_mut(parent).children;
            if let Some(pos) = children.iter().position(|c| *c == id) {
                children.remove(pos);
            }
            self.mark_dirty(parent);
        }
        self.free_subtree(id)
    }

    /// Free a detached subtree, invalidating every id inside it.
    pub fn free_subtree(&mut self, id: NodeId) -> usize {
        if self.slots[id.index as usize].gen != id.gen {
            return 0;
        }
        let node = match self.slots[id.index as usize].node.take() {
            Some(node) => node,
            None => return 0,
        };
        self.slots[id.index as usize].gen = self.slots[id.index as usize]
            .gen
            .wrapping_add(1);
        self.free.push(id.index);
        let mut count = 1;
        for child in node.children {
            count += self.free_subtree(child);
        }
        count
    }

    /// Cleanly remove all children of `id`, leaving `id` itself in place.
    pub fn unlink_children(&mut self, id: NodeId) {
        let children = std::mem::take(&mut self.node_mut(id).children);
        for child in children {
            self.free_subtree(child);
        }
        self.mark_dirty(id);
    }

    /// Structural equality on label, value and ordered children.
    #[allow(dead_code)]
    pub fn equal(&self, a: NodeId, b: NodeId) -> bool {
        let (na, nb) = (self.node(a), self.node(b));
        if na.label != nb.label || na.value != nb.value {
            return false;
        }
        if na.children.len() != nb.children.len() {
            return false;
        }
        na.children
            .iter()
            .zip(nb.children.iter())
            .all(|(ca, cb)| self.equal(*ca, *cb))
    }

    /// True when `id` is a descendant of `ancestor` (or equal to it).
    pub fn is_descendant(&self, id: NodeId, ancestor: NodeId) -> bool {
        let mut id = id;
        loop {
            if id == ancestor {
                return true;
            }
            let parent = self.node(id).parent;
            if parent == id {
                return false;
            }
            id = parent;
        }
    }

    /// 1-based position of `id` among the siblings sharing its label, and
    /// the number of such siblings.
    fn sibling_index(&self, id: NodeId) -> (usize, usize) {
        let node = self.node(id);
        let parent = self.node(node.parent);
        let mut index = 0;
        let mut total = 0;
        for child in &parent.children {
            if self.node(*child).label == node.label {
                total += 1;
                if *child == id {
                    index = total;
                }
            }
        }
        (index, total)
    }

    /// The absolute path of a node, with `[N]` suffixes wherever siblings
    /// share a label.
    pub fn path_of(&self, id: NodeId) -> String {
        let mut segments = Vec::new();
        let mut id = id;
        while id != self.origin {
            let node = self.node(id);
            let label = node.label.as_deref().unwrap_or("(none)");
            let (index, total) = self.sibling_index(id);
            if total > 1 {
                segments.push(format!("{}[{}]", label, index));
            } else {
                segments.push(label.to_owned());
            }
            id = node.parent;
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }
}

// ===== impl NodeRef =====

/// A borrowed reference to one node, carrying its tree.
#[derive(Clone, Copy, Debug)]
pub(crate) struct NodeRef<'a> {
    tree: &'a Tree,
    id: NodeId,
}

impl<'a> NodeRef<'a> {
    pub fn new(tree: &'a Tree, id: NodeId) -> NodeRef<'a> {
        NodeRef { tree, id }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Returns an iterator over the children of the node.
    pub fn children(&self) -> crate::iter::Siblings<'a, NodeRef<'a>> {
        crate::iter::Siblings::new(self.first_child())
    }

    pub fn parent(&self) -> Option<NodeRef<'a>> {
        let parent = self.tree.node(self.id).parent;
        if parent == self.id {
            None
        } else {
            Some(NodeRef::new(self.tree, parent))
        }
    }

    pub fn next_sibling(&self) -> Option<NodeRef<'a>> {
        let parent = self.tree.node(self.id).parent;
        if parent == self.id {
            return None;
        }
        let children = &self.tree.node(parent).children;
        let pos = children.iter().position(|c| *c == self.id)?;
        children
            .get(pos + 1)
            .map(|id| NodeRef::new(self.tree, *id))
    }

    pub fn first_child(&self) -> Option<NodeRef<'a>> {
        self.tree
            .node(self.id)
            .children
            .first()
            .map(|id| NodeRef::new(self.tree, *id))
    }
}

impl PartialEq for NodeRef<'_> {
    fn eq(&self, other: &NodeRef<'_>) -> bool {
        self.id == other.id
    }
}
