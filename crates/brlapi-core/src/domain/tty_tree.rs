//! Tree of virtual consoles ("ttys").
//!
//! # Shape of the tree (for beginners)
//!
//! The children of the root mirror the host's virtual consoles (1, 2, 3...).
//! A program running inside a console, such as a terminal multiplexer, can
//! attach clients deeper down by giving a longer path, e.g. `[2, 7]` for
//! window 7 inside console 2.  Every node records which child currently has
//! focus; following focus from the root gives the *focus path*, which decides
//! who owns the display and who receives keys.
//!
//! ```text
//! ROOT (focus = active console)          UNATTACHED
//!  ├─ 1                                   (clients that hold no tty yet)
//!  └─ 2 (focus = 7)
//!      ├─ 7   ← focus path is ROOT → 2 → 7
//!      └─ 9
//! ```
//!
//! # Ownership
//!
//! Nodes live in an arena keyed by [`TtyId`].  Parents and children refer to
//! each other by id, and clients are stored as opaque handles `C`, so there
//! are no reference cycles.  Ids are never reused: a node that is removed and
//! later re-created gets a fresh id.
//!
//! A node with no clients and no children is garbage and is removed by
//! [`TtyTree::collect_garbage`], walking upward.  The two roots are permanent.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

/// Handle to a node of a [`TtyTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TtyId(u64);

/// Errors from structural tree operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    /// The node limit was reached while creating a path.
    #[error("tty limit of {limit} nodes reached")]
    OutOfMemory { limit: usize },

    /// The id does not name a live node.
    #[error("no such tty {0:?}")]
    NoSuchTty(TtyId),
}

/// Outcome of walking a path from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathLookup {
    /// Every element matched an existing node.
    Found(TtyId),
    /// `path[matched]` has no node under `deepest`.
    Missing { deepest: TtyId, matched: usize },
}

/// One virtual console.
#[derive(Debug, Clone)]
pub struct TtyNode<C> {
    number: u32,
    focus: Option<u32>,
    parent: Option<TtyId>,
    children: Vec<TtyId>,
    connections: Vec<C>,
}

impl<C> TtyNode<C> {
    fn new(number: u32, parent: Option<TtyId>) -> Self {
        Self {
            number,
            focus: None,
            parent,
            children: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    /// The focused child number, or `None` to follow the host console.
    pub fn focus(&self) -> Option<u32> {
        self.focus
    }

    pub fn parent(&self) -> Option<TtyId> {
        self.parent
    }

    pub fn children(&self) -> &[TtyId] {
        &self.children
    }

    /// Clients attached to exactly this node, in attach order.
    pub fn connections(&self) -> &[C] {
        &self.connections
    }
}

/// Arena-backed tree of ttys holding client handles of type `C`.
#[derive(Debug, Clone)]
pub struct TtyTree<C> {
    nodes: HashMap<TtyId, TtyNode<C>>,
    next_id: u64,
    node_limit: usize,
}

impl<C: Copy + PartialEq> Default for TtyTree<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Copy + PartialEq> TtyTree<C> {
    /// Root of the console hierarchy.
    pub const ROOT: TtyId = TtyId(0);
    /// Holding area for clients that have not acquired a tty.
    pub const UNATTACHED: TtyId = TtyId(1);

    /// Creates a tree holding only the two permanent roots.
    pub fn new() -> Self {
        Self::with_node_limit(usize::MAX)
    }

    /// Creates a tree that refuses to grow beyond `limit` non-root nodes.
    pub fn with_node_limit(limit: usize) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(Self::ROOT, TtyNode::new(0, None));
        nodes.insert(Self::UNATTACHED, TtyNode::new(0, None));
        Self {
            nodes,
            next_id: 2,
            node_limit: limit,
        }
    }

    pub fn node(&self, id: TtyId) -> Option<&TtyNode<C>> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: TtyId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of live nodes other than the two roots.
    pub fn len(&self) -> usize {
        self.nodes.len() - 2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_permanent(id: TtyId) -> bool {
        id == Self::ROOT || id == Self::UNATTACHED
    }

    /// Finds the child of `parent` numbered `number`.
    pub fn find_child(&self, parent: TtyId, number: u32) -> Option<TtyId> {
        let node = self.nodes.get(&parent)?;
        node.children
            .iter()
            .copied()
            .find(|child| self.nodes.get(child).map(|n| n.number) == Some(number))
    }

    /// Walks `path` from the root.
    pub fn lookup(&self, path: &[u32]) -> PathLookup {
        let mut current = Self::ROOT;
        for (matched, &number) in path.iter().enumerate() {
            match self.find_child(current, number) {
                Some(child) => current = child,
                None => {
                    return PathLookup::Missing {
                        deepest: current,
                        matched,
                    }
                }
            }
        }
        PathLookup::Found(current)
    }

    /// Creates `rest` as a chain of new nodes under `parent`.
    ///
    /// Either the whole chain is created or, on failure, every node created by
    /// this call is removed again.
    ///
    /// # Errors
    ///
    /// [`TreeError::NoSuchTty`] if `parent` is not live;
    /// [`TreeError::OutOfMemory`] if the node limit or allocator is exhausted.
    pub fn create_path(&mut self, parent: TtyId, rest: &[u32]) -> Result<TtyId, TreeError> {
        if !self.nodes.contains_key(&parent) {
            return Err(TreeError::NoSuchTty(parent));
        }
        let mut created = Vec::with_capacity(rest.len());
        let mut current = parent;
        for &number in rest {
            match self.create_child(current, number) {
                Ok(child) => {
                    created.push(child);
                    current = child;
                }
                Err(e) => {
                    for id in created.into_iter().rev() {
                        self.unlink(id);
                    }
                    return Err(e);
                }
            }
        }
        Ok(current)
    }

    fn create_child(&mut self, parent: TtyId, number: u32) -> Result<TtyId, TreeError> {
        let limit = self.node_limit;
        if self.len() >= limit {
            return Err(TreeError::OutOfMemory { limit });
        }
        self.nodes
            .try_reserve(1)
            .map_err(|_| TreeError::OutOfMemory { limit })?;
        let id = TtyId(self.next_id);
        let parent_node = self
            .nodes
            .get_mut(&parent)
            .ok_or(TreeError::NoSuchTty(parent))?;
        parent_node
            .children
            .try_reserve(1)
            .map_err(|_| TreeError::OutOfMemory { limit })?;
        parent_node.children.push(id);
        self.next_id += 1;
        self.nodes.insert(id, TtyNode::new(number, Some(parent)));
        debug!(number, ?id, "created tty");
        Ok(id)
    }

    /// Removes a single node and its link from its parent.
    fn unlink(&mut self, id: TtyId) {
        if let Some(node) = self.nodes.remove(&id) {
            if let Some(parent) = node.parent.and_then(|p| self.nodes.get_mut(&p)) {
                parent.children.retain(|&c| c != id);
            }
        }
    }

    /// Adds `conn` to the clients of `tty`.
    ///
    /// # Errors
    ///
    /// [`TreeError::NoSuchTty`] if `tty` is not live.
    pub fn attach(&mut self, tty: TtyId, conn: C) -> Result<(), TreeError> {
        let node = self.nodes.get_mut(&tty).ok_or(TreeError::NoSuchTty(tty))?;
        node.connections.push(conn);
        Ok(())
    }

    /// Removes `conn` from `tty`.  Returns `true` if it was attached there.
    pub fn detach(&mut self, tty: TtyId, conn: C) -> bool {
        let Some(node) = self.nodes.get_mut(&tty) else {
            return false;
        };
        let before = node.connections.len();
        node.connections.retain(|&c| c != conn);
        node.connections.len() != before
    }

    /// Moves `conn` from one node's client list to another's.
    ///
    /// # Errors
    ///
    /// [`TreeError::NoSuchTty`] if `to` is not live; `conn` is then left
    /// where it was.
    pub fn move_connection(&mut self, conn: C, from: TtyId, to: TtyId) -> Result<(), TreeError> {
        if !self.nodes.contains_key(&to) {
            return Err(TreeError::NoSuchTty(to));
        }
        self.detach(from, conn);
        self.attach(to, conn)
    }

    /// Sets which child of `tty` has focus.
    pub fn set_focus(&mut self, tty: TtyId, focus: Option<u32>) -> Result<(), TreeError> {
        let node = self.nodes.get_mut(&tty).ok_or(TreeError::NoSuchTty(tty))?;
        node.focus = focus;
        Ok(())
    }

    /// Returns the child of `tty` that focus leads to.
    ///
    /// With an explicit focus, the child with that number.  With focus unset,
    /// the child matching the host's active console, or else the first child.
    pub fn focused_child(&self, tty: TtyId, active_console: u32) -> Option<TtyId> {
        let node = self.nodes.get(&tty)?;
        match node.focus {
            Some(focus) => self.find_child(tty, focus),
            None => self
                .find_child(tty, active_console)
                .or_else(|| node.children.first().copied()),
        }
    }

    /// Returns the nodes from the root along focus, root first.
    pub fn focus_path(&self, active_console: u32) -> Vec<TtyId> {
        let mut path = vec![Self::ROOT];
        let mut current = Self::ROOT;
        while let Some(child) = self.focused_child(current, active_console) {
            path.push(child);
            current = child;
        }
        path
    }

    /// Searches the focus path for the deepest node where `pick` finds a client.
    ///
    /// `pick` sees the clients of one node in attach order.  A deeper node's
    /// choice wins; an ancestor is only consulted when every node below it on
    /// the path declined.
    pub fn find_on_focus_path<R, F>(&self, active_console: u32, mut pick: F) -> Option<R>
    where
        F: FnMut(&[C]) -> Option<R>,
    {
        self.focus_path(active_console)
            .into_iter()
            .rev()
            .filter_map(|id| self.nodes.get(&id))
            .find_map(|node| pick(&node.connections))
    }

    /// Removes `start` and then each ancestor while it has no clients and no
    /// children.  Returns the ids removed, deepest first.
    pub fn collect_garbage(&mut self, start: TtyId) -> Vec<TtyId> {
        let mut removed = Vec::new();
        let mut current = start;
        while !Self::is_permanent(current) {
            let Some(node) = self.nodes.get(&current) else {
                break;
            };
            if !node.connections.is_empty() || !node.children.is_empty() {
                break;
            }
            let parent = node.parent;
            debug!(number = node.number, id = ?current, "freeing tty");
            self.unlink(current);
            removed.push(current);
            match parent {
                Some(p) => current = p,
                None => break,
            }
        }
        removed
    }

    /// Every client attached anywhere, including unattached clients.
    pub fn all_connections(&self) -> Vec<C> {
        self.nodes
            .values()
            .flat_map(|n| n.connections.iter().copied())
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
