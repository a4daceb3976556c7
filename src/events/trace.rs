/*!
 * Call-Trace Arena
 * Per-thread call stack addressed by small indices instead of linked nodes
 *
 * Nodes are `(site, parent index)` pairs that live as long as the arena. The
 * stack only holds indices, so popping never frees a node and a node id stays
 * valid as a historical key for events emitted under it.
 */

use crate::core::id::{AtomicGenerator, IdGenerator};
use crate::core::types::{SiteId, TraceNodeId};
use ahash::RandomState;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct Node {
    id: TraceNodeId,
    site: SiteId,
    parent: Option<u32>,
}

/// Result of entering a call site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entered {
    pub node: TraceNodeId,
    pub parent: TraceNodeId,
    /// First time this (parent, site) pair was seen by the thread
    pub created: bool,
}

/// Popped site was not on the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnbalancedPop {
    pub site: SiteId,
    pub depth: usize,
}

#[derive(Debug, Default)]
pub struct TraceArena {
    nodes: Vec<Node>,
    children: HashMap<(Option<u32>, SiteId), u32, RandomState>,
    stack: Vec<u32>,
}

impl TraceArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node the thread is currently executing in
    #[inline]
    pub fn current(&self) -> TraceNodeId {
        self.stack
            .last()
            .map(|&idx| self.nodes[idx as usize].id)
            .unwrap_or(TraceNodeId::ROOT)
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Number of distinct nodes ever created by this thread
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Enter `site` below the current node, reusing the node if it exists
    pub fn push(&mut self, site: SiteId, ids: &AtomicGenerator<TraceNodeId>) -> Entered {
        let parent_idx = self.stack.last().copied();
        let parent = self.current();

        if let Some(&idx) = self.children.get(&(parent_idx, site)) {
            self.stack.push(idx);
            return Entered {
                node: self.nodes[idx as usize].id,
                parent,
                created: false,
            };
        }

        let idx = self.nodes.len() as u32;
        let node = ids.next();
        self.nodes.push(Node {
            id: node,
            site,
            parent: parent_idx,
        });
        self.children.insert((parent_idx, site), idx);
        self.stack.push(idx);

        Entered {
            node,
            parent,
            created: true,
        }
    }

    /// Leave `site`, unwinding any frames above it that were never popped
    pub fn pop(&mut self, site: SiteId) -> Result<(), UnbalancedPop> {
        let position = self
            .stack
            .iter()
            .rposition(|&idx| self.nodes[idx as usize].site == site);

        match position {
            Some(pos) => {
                self.stack.truncate(pos);
                Ok(())
            }
            None => Err(UnbalancedPop {
                site,
                depth: self.stack.len(),
            }),
        }
    }

    /// Parent of a node created by this thread
    pub fn parent_of(&self, node: TraceNodeId) -> Option<TraceNodeId> {
        let found = self.nodes.iter().find(|n| n.id == node)?;
        Some(
            found
                .parent
                .map(|p| self.nodes[p as usize].id)
                .unwrap_or(TraceNodeId::ROOT),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop() {
        let ids = AtomicGenerator::default_start();
        let mut arena = TraceArena::new();
        assert_eq!(arena.current(), TraceNodeId::ROOT);

        let a = arena.push(SiteId(10), &ids);
        assert!(a.created);
        assert_eq!(a.parent, TraceNodeId::ROOT);

        let b = arena.push(SiteId(20), &ids);
        assert_eq!(b.parent, a.node);
        assert_eq!(arena.current(), b.node);
        assert_eq!(arena.parent_of(b.node), Some(a.node));

        arena.pop(SiteId(20)).unwrap();
        assert_eq!(arena.current(), a.node);
        arena.pop(SiteId(10)).unwrap();
        assert_eq!(arena.current(), TraceNodeId::ROOT);
    }

    #[test]
    fn test_nodes_are_reused() {
        let ids = AtomicGenerator::default_start();
        let mut arena = TraceArena::new();

        let first = arena.push(SiteId(1), &ids);
        arena.pop(SiteId(1)).unwrap();
        let again = arena.push(SiteId(1), &ids);

        assert_eq!(first.node, again.node);
        assert!(!again.created);
        assert_eq!(arena.node_count(), 1);
    }

    #[test]
    fn test_same_site_under_different_parents() {
        let ids = AtomicGenerator::default_start();
        let mut arena = TraceArena::new();

        let direct = arena.push(SiteId(5), &ids);
        arena.pop(SiteId(5)).unwrap();

        arena.push(SiteId(1), &ids);
        let nested = arena.push(SiteId(5), &ids);

        assert_ne!(direct.node, nested.node);
        assert_eq!(arena.node_count(), 3);
    }

    #[test]
    fn test_pop_unwinds_missing_frames() {
        let ids = AtomicGenerator::default_start();
        let mut arena = TraceArena::new();
        arena.push(SiteId(1), &ids);
        arena.push(SiteId(2), &ids);
        arena.push(SiteId(3), &ids);

        arena.pop(SiteId(1)).unwrap();
        assert_eq!(arena.depth(), 0);
    }

    #[test]
    fn test_unbalanced_pop() {
        let ids = AtomicGenerator::default_start();
        let mut arena = TraceArena::new();
        arena.push(SiteId(1), &ids);

        let err = arena.pop(SiteId(99)).unwrap_err();
        assert_eq!(err.site, SiteId(99));
        assert_eq!(arena.depth(), 1);
    }
}
