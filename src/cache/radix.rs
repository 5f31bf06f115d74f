//! Prefix index: an arena radix tree mapping token sequences to block chains.
//!
//! Nodes live in a `Vec` and refer to each other by `NodeId`, so splitting a
//! node only rewrites indices. Every node owns a key fragment and records the
//! page boundaries (absolute depths that are multiples of `page_size`) that
//! fall inside that fragment, each with the block backing the page ending
//! there. Sub-page matches are tracked but only whole pages are ever served.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tracing::{debug, trace};

use crate::cache::block::{BlockId, TokenId};

/// Index of a node in the arena.
pub type NodeId = usize;

/// The root node. Its key fragment is always empty.
pub const ROOT: NodeId = 0;

/// A violated structural invariant of the tree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("node {node} is reachable but its slot is free")]
    DanglingNode { node: NodeId },

    #[error("node {node} is stored under edge {edge} but its fragment starts with {first:?}")]
    EdgeMismatch {
        node: NodeId,
        edge: TokenId,
        first: Option<TokenId>,
    },

    #[error("node {node} starts at depth {found}, expected {expected}")]
    DepthMismatch {
        node: NodeId,
        expected: usize,
        found: usize,
    },

    #[error("node {node} records parent {found:?}, expected {expected}")]
    ParentMismatch {
        node: NodeId,
        expected: NodeId,
        found: Option<NodeId>,
    },

    #[error("page boundary {depth} recorded in node {node} lies outside its fragment")]
    PageOutOfRange { node: NodeId, depth: usize },

    #[error("block {block} backs more than one page (second at node {node})")]
    DuplicateBlock { node: NodeId, block: BlockId },
}

impl ConsistencyError {
    /// The node whose subtree should be invalidated to recover.
    pub fn node(&self) -> NodeId {
        match self {
            ConsistencyError::DanglingNode { node }
            | ConsistencyError::EdgeMismatch { node, .. }
            | ConsistencyError::DepthMismatch { node, .. }
            | ConsistencyError::ParentMismatch { node, .. }
            | ConsistencyError::PageOutOfRange { node, .. }
            | ConsistencyError::DuplicateBlock { node, .. } => *node,
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    key: Vec<TokenId>,
    /// Absolute depth of the first token of `key`.
    depth: usize,
    children: HashMap<TokenId, NodeId>,
    /// (end depth, backing block), sorted by depth.
    pages: Vec<(usize, Option<BlockId>)>,
}

impl Node {
    fn end(&self) -> usize {
        self.depth + self.key.len()
    }
}

/// Result of a longest-prefix match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixMatch {
    /// Longest common prefix length in tokens (may end mid-page).
    pub matched_len: usize,

    /// Blocks backing whole pages `0..blocks.len()` of the match, stopping at
    /// the first page without a block.
    pub blocks: Vec<BlockId>,
}

impl PrefixMatch {
    /// Matched length truncated to the pages that have a block.
    pub fn page_aligned_len(&self, page_size: usize) -> usize {
        self.blocks.len() * page_size
    }
}

/// What an insert changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Tokens that were not present in the tree before.
    pub new_tokens: usize,

    /// Offered blocks that are now associated with a page.
    pub attached: Vec<BlockId>,

    /// Offered blocks rejected because the page already had a block.
    pub duplicates: Vec<BlockId>,
}

/// The radix tree.
#[derive(Debug)]
pub struct PrefixIndex {
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
    page_size: usize,
    block_nodes: HashMap<BlockId, NodeId>,
    total_tokens: usize,
}

/// Length of the common prefix of two token slices.
pub fn common_prefix_len(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

impl PrefixIndex {
    pub fn new(page_size: usize) -> Self {
        assert!(page_size > 0, "page_size must be positive");
        let root = Node {
            parent: None,
            key: Vec::new(),
            depth: 0,
            children: HashMap::new(),
            pages: Vec::new(),
        };
        Self {
            nodes: vec![Some(root)],
            free: Vec::new(),
            page_size,
            block_nodes: HashMap::new(),
            total_tokens: 0,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of live nodes, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Number of distinct tokens stored across all fragments.
    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    fn node(&self, id: NodeId) -> &Node {
        self.nodes[id].as_ref().expect("live node id")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id].as_mut().expect("live node id")
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    /// Find the longest cached prefix of `tokens`.
    pub fn match_prefix(&self, tokens: &[TokenId]) -> PrefixMatch {
        let mut current = ROOT;
        let mut pos = 0;
        let mut blocks = Vec::new();
        let mut contiguous = true;

        while pos < tokens.len() {
            let Some(&child_id) = self.node(current).children.get(&tokens[pos]) else {
                break;
            };
            let child = self.node(child_id);
            let common = common_prefix_len(&child.key, &tokens[pos..]);
            let reached = pos + common;

            for &(end, block) in &child.pages {
                if end > reached || !contiguous {
                    break;
                }
                match block {
                    Some(id) if end == (blocks.len() + 1) * self.page_size => blocks.push(id),
                    _ => contiguous = false,
                }
            }

            pos = reached;
            if common < child.key.len() {
                break;
            }
            current = child_id;
        }

        trace!(matched = pos, pages = blocks.len(), "Prefix match");

        PrefixMatch {
            matched_len: pos,
            blocks,
        }
    }

    /// Register `tokens` with `blocks[i]` backing page `i` (None leaves a page
    /// without a block). Existing page associations win over offered ones.
    pub fn insert(&mut self, tokens: &[TokenId], blocks: &[Option<BlockId>]) -> InsertOutcome {
        let mut outcome = InsertOutcome::default();
        let mut current = ROOT;
        let mut pos = 0;

        while pos < tokens.len() {
            let next = self.node(current).children.get(&tokens[pos]).copied();
            match next {
                Some(child_id) => {
                    let common = common_prefix_len(&self.node(child_id).key, &tokens[pos..]);
                    let target = if common < self.node(child_id).key.len() {
                        self.split(child_id, common)
                    } else {
                        child_id
                    };
                    pos += common;
                    self.attach_pages(target, blocks, &mut outcome);
                    current = target;
                }
                None => {
                    let key = tokens[pos..].to_vec();
                    let end = tokens.len();
                    let pages = self
                        .boundaries(pos, end)
                        .map(|depth| {
                            let block = blocks.get(depth / self.page_size - 1).copied().flatten();
                            (depth, block)
                        })
                        .collect::<Vec<_>>();

                    let id = self.alloc(Node {
                        parent: Some(current),
                        key,
                        depth: pos,
                        children: HashMap::new(),
                        pages,
                    });
                    self.node_mut(current).children.insert(tokens[pos], id);

                    let attached: Vec<BlockId> =
                        self.node(id).pages.iter().filter_map(|(_, b)| *b).collect();
                    for block in attached {
                        self.block_nodes.insert(block, id);
                        outcome.attached.push(block);
                    }

                    outcome.new_tokens += end - pos;
                    self.total_tokens += end - pos;
                    pos = end;
                }
            }
        }

        debug!(
            new_tokens = outcome.new_tokens,
            attached = outcome.attached.len(),
            duplicates = outcome.duplicates.len(),
            "Inserted prefix"
        );
        outcome
    }

    /// Page boundaries in the half-open depth range (start, end].
    fn boundaries(&self, start: usize, end: usize) -> impl Iterator<Item = usize> {
        let ps = self.page_size;
        let first = (start / ps + 1) * ps;
        (first..=end).step_by(ps)
    }

    fn attach_pages(&mut self, id: NodeId, blocks: &[Option<BlockId>], outcome: &mut InsertOutcome) {
        let page_size = self.page_size;
        let mut newly = Vec::new();
        {
            let node = self.node_mut(id);
            for (end, slot) in node.pages.iter_mut() {
                let Some(offered) = blocks.get(*end / page_size - 1).copied().flatten() else {
                    continue;
                };
                match slot {
                    Some(existing) if *existing == offered => {}
                    Some(_) => outcome.duplicates.push(offered),
                    None => {
                        *slot = Some(offered);
                        newly.push(offered);
                    }
                }
            }
        }
        for block in newly {
            self.block_nodes.insert(block, id);
            outcome.attached.push(block);
        }
    }

    /// Split `id` so that its first `at` tokens move into a new parent node.
    /// Returns the new upper node; `id` keeps its slot and its children.
    fn split(&mut self, id: NodeId, at: usize) -> NodeId {
        let (parent, upper_key, lower_first, depth, upper_pages) = {
            let node = self.node_mut(id);
            debug_assert!(at > 0 && at < node.key.len());
            let lower_key = node.key.split_off(at);
            let upper_key = std::mem::replace(&mut node.key, lower_key);
            let depth = node.depth;
            node.depth += at;
            let split_depth = node.depth;
            let cut = node.pages.partition_point(|(end, _)| *end <= split_depth);
            let lower_pages = node.pages.split_off(cut);
            let upper_pages = std::mem::replace(&mut node.pages, lower_pages);
            (node.parent, upper_key, node.key[0], depth, upper_pages)
        };

        let edge = upper_key[0];
        let moved: Vec<BlockId> = upper_pages.iter().filter_map(|(_, b)| *b).collect();
        let upper = self.alloc(Node {
            parent,
            key: upper_key,
            depth,
            children: HashMap::from([(lower_first, id)]),
            pages: upper_pages,
        });
        for block in moved {
            self.block_nodes.insert(block, upper);
        }
        self.node_mut(id).parent = Some(upper);
        if let Some(parent) = parent {
            self.node_mut(parent).children.insert(edge, upper);
        }
        trace!(node = id, upper, at, "Split node");
        upper
    }

    /// Clear the page association of `block`. The node stays in the tree so
    /// later matches stop at this page instead of skipping it.
    pub fn clear_block(&mut self, block: BlockId) -> bool {
        let Some(id) = self.block_nodes.remove(&block) else {
            return false;
        };
        let Some(node) = self.nodes.get_mut(id).and_then(|n| n.as_mut()) else {
            return false;
        };
        for (_, slot) in node.pages.iter_mut() {
            if *slot == Some(block) {
                *slot = None;
                return true;
            }
        }
        false
    }

    /// Every block currently associated with a page.
    pub fn reachable_blocks(&self) -> Vec<BlockId> {
        self.block_nodes.keys().copied().collect()
    }

    pub fn is_attached(&self, block: BlockId) -> bool {
        self.block_nodes.contains_key(&block)
    }

    /// Remove `id` and all of its descendants, returning the blocks they
    /// referenced. Invalidating the root clears the whole tree.
    pub fn invalidate_subtree(&mut self, id: NodeId) -> Vec<BlockId> {
        let mut released = Vec::new();
        let mut stack = Vec::new();

        if id == ROOT {
            let children: Vec<NodeId> = self.node_mut(ROOT).children.drain().map(|(_, c)| c).collect();
            stack.extend(children);
        } else {
            let Some(node) = self.nodes.get(id).and_then(|n| n.as_ref()) else {
                return released;
            };
            let parent = node.parent;
            let edge = node.key.first().copied();
            if let (Some(parent), Some(edge)) = (parent, edge) {
                if let Some(p) = self.nodes.get_mut(parent).and_then(|n| n.as_mut()) {
                    if p.children.get(&edge) == Some(&id) {
                        p.children.remove(&edge);
                    }
                }
            }
            stack.push(id);
        }

        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get_mut(current).and_then(|n| n.take()) else {
                continue;
            };
            self.free.push(current);
            self.total_tokens = self.total_tokens.saturating_sub(node.key.len());
            for (_, block) in node.pages {
                if let Some(block) = block {
                    self.block_nodes.remove(&block);
                    released.push(block);
                }
            }
            stack.extend(node.children.into_values());
        }

        debug!(node = id, released = released.len(), "Invalidated subtree");
        released
    }

    /// Check every structural invariant of the tree.
    pub fn validate(&self) -> Result<(), ConsistencyError> {
        let mut seen_blocks = HashSet::new();
        let mut stack = vec![ROOT];

        while let Some(id) = stack.pop() {
            let node = self
                .nodes
                .get(id)
                .and_then(|n| n.as_ref())
                .ok_or(ConsistencyError::DanglingNode { node: id })?;

            for &(depth, block) in &node.pages {
                if depth <= node.depth || depth > node.end() || depth % self.page_size != 0 {
                    return Err(ConsistencyError::PageOutOfRange { node: id, depth });
                }
                if let Some(block) = block {
                    if !seen_blocks.insert(block) {
                        return Err(ConsistencyError::DuplicateBlock { node: id, block });
                    }
                }
            }

            for (&edge, &child_id) in &node.children {
                let child = self
                    .nodes
                    .get(child_id)
                    .and_then(|n| n.as_ref())
                    .ok_or(ConsistencyError::DanglingNode { node: child_id })?;
                if child.key.first() != Some(&edge) {
                    return Err(ConsistencyError::EdgeMismatch {
                        node: child_id,
                        edge,
                        first: child.key.first().copied(),
                    });
                }
                if child.depth != node.end() {
                    return Err(ConsistencyError::DepthMismatch {
                        node: child_id,
                        expected: node.end(),
                        found: child.depth,
                    });
                }
                if child.parent != Some(id) {
                    return Err(ConsistencyError::ParentMismatch {
                        node: child_id,
                        expected: id,
                        found: child.parent,
                    });
                }
                stack.push(child_id);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn corrupt_depth_for_test(&mut self, block: BlockId) -> Option<NodeId> {
        let id = *self.block_nodes.get(&block)?;
        self.node_mut(id).depth += 1;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(range: std::ops::Range<u32>) -> Vec<TokenId> {
        range.collect()
    }

    fn some(ids: &[BlockId]) -> Vec<Option<BlockId>> {
        ids.iter().copied().map(Some).collect()
    }

    #[test]
    fn test_empty_index_matches_nothing() {
        let index = PrefixIndex::new(4);
        let m = index.match_prefix(&[1, 2, 3]);
        assert_eq!(m.matched_len, 0);
        assert!(m.blocks.is_empty());
    }

    #[test]
    fn test_insert_then_match_whole_pages() {
        let mut index = PrefixIndex::new(4);
        let tokens = seq(0..10); // 2 full pages + 2 tokens
        let out = index.insert(&tokens, &some(&[100, 101]));
        assert_eq!(out.new_tokens, 10);
        assert_eq!(out.attached, vec![100, 101]);

        let m = index.match_prefix(&tokens);
        assert_eq!(m.matched_len, 10);
        assert_eq!(m.blocks, vec![100, 101]);
        assert_eq!(m.page_aligned_len(4), 8);
    }

    #[test]
    fn test_partial_page_is_tracked_but_not_served() {
        let mut index = PrefixIndex::new(4);
        index.insert(&seq(0..8), &some(&[1, 2]));

        // Diverges in the middle of page 1.
        let probe = vec![0, 1, 2, 3, 4, 5, 99, 99];
        let m = index.match_prefix(&probe);
        assert_eq!(m.matched_len, 6);
        assert_eq!(m.blocks, vec![1]);
    }

    #[test]
    fn test_split_preserves_paths_and_blocks() {
        let mut index = PrefixIndex::new(2);
        let a = vec![1, 2, 3, 4, 5, 6];
        let b = vec![1, 2, 3, 9, 9, 9];
        index.insert(&a, &some(&[10, 11, 12]));
        let before = index.node_count();
        let out = index.insert(&b, &[Some(10), Some(20), Some(21)]);

        // Split adds the upper node, the new branch adds one more.
        assert_eq!(index.node_count(), before + 2);
        assert!(out.duplicates.is_empty());
        assert_eq!(out.new_tokens, 3);

        assert_eq!(index.match_prefix(&a).blocks, vec![10, 11, 12]);
        assert_eq!(index.match_prefix(&b).blocks, vec![10, 20, 21]);
        assert_eq!(index.total_tokens(), 9);
        index.validate().unwrap();
    }

    #[test]
    fn test_existing_block_wins_and_offer_is_reported() {
        let mut index = PrefixIndex::new(2);
        index.insert(&[1, 2, 3, 4], &some(&[1, 2]));
        let out = index.insert(&[1, 2, 3, 4, 5, 6], &some(&[7, 8, 9]));
        assert_eq!(out.duplicates, vec![7, 8]);
        assert_eq!(out.attached, vec![9]);
        assert_eq!(index.match_prefix(&[1, 2, 3, 4, 5, 6]).blocks, vec![1, 2, 9]);
    }

    #[test]
    fn test_cleared_block_stops_match_without_losing_nodes() {
        let mut index = PrefixIndex::new(2);
        let tokens = seq(0..6);
        index.insert(&tokens, &some(&[1, 2, 3]));
        let nodes = index.node_count();

        assert!(index.clear_block(2));
        let m = index.match_prefix(&tokens);
        assert_eq!(m.matched_len, 6);
        assert_eq!(m.blocks, vec![1]);
        assert_eq!(index.node_count(), nodes);

        // Re-inserting fills the hole.
        let out = index.insert(&tokens, &some(&[1, 5, 3]));
        assert_eq!(out.attached, vec![5]);
        assert_eq!(index.match_prefix(&tokens).blocks, vec![1, 5, 3]);
    }

    #[test]
    fn test_match_is_idempotent() {
        let mut index = PrefixIndex::new(4);
        index.insert(&seq(0..16), &some(&[1, 2, 3, 4]));
        let probe = seq(0..13);
        assert_eq!(index.match_prefix(&probe), index.match_prefix(&probe));
    }

    #[test]
    fn test_validate_detects_corruption_and_invalidate_recovers() {
        let mut index = PrefixIndex::new(2);
        index.insert(&[1, 2, 3, 4], &some(&[1, 2]));
        index.insert(&[1, 2, 7, 7], &some(&[1, 3]));
        index.validate().unwrap();

        let bad = index.corrupt_depth_for_test(3).unwrap();
        let err = index.validate().unwrap_err();
        assert_eq!(err.node(), bad);

        let released = index.invalidate_subtree(err.node());
        assert_eq!(released, vec![3]);
        index.validate().unwrap();
        assert_eq!(index.match_prefix(&[1, 2, 7, 7]).blocks, vec![1]);
        assert_eq!(index.match_prefix(&[1, 2, 3, 4]).blocks, vec![1, 2]);
    }

    #[test]
    fn test_invalidate_root_clears_everything() {
        let mut index = PrefixIndex::new(2);
        index.insert(&[1, 2, 3, 4], &some(&[1, 2]));
        index.insert(&[5, 6], &some(&[3]));
        let mut released = index.invalidate_subtree(ROOT);
        released.sort();
        assert_eq!(released, vec![1, 2, 3]);
        assert_eq!(index.node_count(), 1);
        assert_eq!(index.total_tokens(), 0);
        assert!(index.reachable_blocks().is_empty());
    }
}
