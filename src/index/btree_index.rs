use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::buffer::{BufferPoolManager, WritePageGuard};
use crate::common::{PageId, RecordId, Result, StratumError, INVALID_PAGE_ID};

use super::btree_iterator::BTreeIterator;
use super::btree_page::{
    max_internal_capacity, max_leaf_capacity, BTreeNode, BTreeNodeRef, HeaderNode, HeaderNodeRef,
};
use super::key_comparator::{IntegerComparator, KeyComparator};

/// Write guards accumulated during a root-to-leaf descent. The header
/// guard is the tree latch: holding it in write mode keeps the root
/// pointer (and the whole structural operation) private to this caller.
struct Context {
    header: WritePageGuard,
    write_set: Vec<WritePageGuard>,
}

/// B+Tree index mapping `u32` keys to record identifiers, stored in the
/// buffer pool. Keys are unique. Readers couple read latches down the
/// tree; writers hold write latches on the full ancestor path (the
/// conservative discipline), so structural changes are atomic with
/// respect to every other operation.
pub struct BPlusTree<C: KeyComparator = IntegerComparator> {
    index_name: String,
    bpm: Arc<BufferPoolManager>,
    comparator: C,
    leaf_max_size: usize,
    internal_max_size: usize,
    header_page_id: PageId,
}

impl<C: KeyComparator> BPlusTree<C> {
    /// Creates a tree over a pre-allocated header page. The header is
    /// initialized to an empty tree.
    pub fn new(
        index_name: impl Into<String>,
        header_page_id: PageId,
        bpm: Arc<BufferPoolManager>,
        comparator: C,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self> {
        assert!(
            (3..=max_leaf_capacity()).contains(&leaf_max_size),
            "leaf_max_size out of range"
        );
        assert!(
            (3..=max_internal_capacity()).contains(&internal_max_size),
            "internal_max_size out of range"
        );

        {
            let mut guard = bpm.fetch_page_write(header_page_id)?;
            HeaderNode::new(guard.data_mut()).set_root_page_id(INVALID_PAGE_ID);
        }

        Ok(Self {
            index_name: index_name.into(),
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
            header_page_id,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// Reads the root page id under the header's read latch.
    pub fn get_root_page_id(&self) -> Result<PageId> {
        let guard = self.bpm.fetch_page_read(self.header_page_id)?;
        Ok(HeaderNodeRef::new(guard.data()).root_page_id())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.get_root_page_id()? == INVALID_PAGE_ID)
    }

    /// Point lookup. Appends the value to `result` and returns true when
    /// the key exists.
    pub fn get_value(&self, key: u32, result: &mut Vec<RecordId>) -> Result<bool> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_page_id = HeaderNodeRef::new(header_guard.data()).root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(false);
        }

        let mut guard = self.bpm.fetch_page_read(root_page_id)?;
        drop(header_guard);

        loop {
            let child_id = {
                let node = BTreeNodeRef::new(guard.data());
                if node.is_leaf() {
                    return Ok(match node.find_key(key, &self.comparator) {
                        Some(index) => {
                            result.push(node.rid_at(index));
                            true
                        }
                        None => false,
                    });
                }
                node.child_at(node.child_lookup(key, &self.comparator))
            };
            // Coupled: the parent latch is held until the child's is taken
            let child_guard = self.bpm.fetch_page_read(child_id)?;
            guard = child_guard;
        }
    }

    /// Inserts a key/value pair. Returns false (and changes nothing) when
    /// the key is already present.
    pub fn insert(&self, key: u32, rid: RecordId) -> Result<bool> {
        let mut ctx = Context {
            header: self.bpm.fetch_page_write(self.header_page_id)?,
            write_set: Vec::new(),
        };
        let root_page_id = HeaderNodeRef::new(ctx.header.data()).root_page_id();

        if root_page_id == INVALID_PAGE_ID {
            let mut root_guard = self.allocate_node()?;
            let root_id = root_guard.page_id();
            let mut root = BTreeNode::new(root_guard.data_mut());
            root.init_leaf(self.leaf_max_size);
            root.leaf_insert_at(0, key, rid);
            HeaderNode::new(ctx.header.data_mut()).set_root_page_id(root_id);
            debug!(index = %self.index_name, root = root_id.as_u32(), "started new tree");
            return Ok(true);
        }

        let mut leaf_guard = self.descend_for_write(&mut ctx, root_page_id, key)?;
        let leaf_id = leaf_guard.page_id();

        let (separator, sibling_id) = {
            let mut leaf = BTreeNode::new(leaf_guard.data_mut());

            let pos = leaf.lower_bound(key, &self.comparator);
            if pos < leaf.size() && self.comparator.compare(leaf.key_at(pos), key).is_eq() {
                return Ok(false);
            }
            leaf.leaf_insert_at(pos, key, rid);
            if leaf.size() < self.leaf_max_size {
                return Ok(true);
            }

            // Full leaf: the upper half moves into a fresh right sibling
            let split_at = (self.leaf_max_size + 1) / 2;
            let moved = leaf.leaf_entries(split_at);
            let old_next = leaf.next_page_id();
            leaf.leaf_truncate(split_at);

            let mut sibling_guard = self.allocate_node()?;
            let sibling_id = sibling_guard.page_id();
            {
                let mut sibling = BTreeNode::new(sibling_guard.data_mut());
                sibling.init_leaf(self.leaf_max_size);
                sibling.leaf_set_entries(&moved);
                sibling.set_next_page_id(old_next);
            }
            leaf.set_next_page_id(sibling_id);
            (moved[0].0, sibling_id)
        };
        drop(leaf_guard);

        debug!(
            index = %self.index_name,
            left = leaf_id.as_u32(),
            right = sibling_id.as_u32(),
            "split leaf"
        );
        self.insert_into_parent(&mut ctx, leaf_id, separator, sibling_id)?;
        Ok(true)
    }

    /// Removes a key if present. Underfull pages borrow from or merge
    /// with a sibling; merges may cascade to the root.
    pub fn remove(&self, key: u32) -> Result<()> {
        let mut ctx = Context {
            header: self.bpm.fetch_page_write(self.header_page_id)?,
            write_set: Vec::new(),
        };
        let root_page_id = HeaderNodeRef::new(ctx.header.data()).root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut leaf_guard = self.descend_for_write(&mut ctx, root_page_id, key)?;
        let leaf_id = leaf_guard.page_id();

        let underfull = {
            let mut leaf = BTreeNode::new(leaf_guard.data_mut());
            let Some(index) = leaf.find_key(key, &self.comparator) else {
                return Ok(());
            };
            leaf.leaf_remove_at(index);

            if ctx.write_set.is_empty() {
                // The root is a leaf; it may become empty but never merges
                if leaf.size() == 0 {
                    HeaderNode::new(ctx.header.data_mut()).set_root_page_id(INVALID_PAGE_ID);
                    debug!(index = %self.index_name, "tree emptied");
                }
                return Ok(());
            }

            // The deleted key was the leaf's minimum: refresh the parent
            // separator, except for slot 0 which carries none
            if index == 0 && leaf.size() > 0 {
                if let Some(parent_guard) = ctx.write_set.last_mut() {
                    let mut parent = BTreeNode::new(parent_guard.data_mut());
                    let child_idx = parent.child_index_of(leaf_id).ok_or_else(|| {
                        StratumError::IndexCorrupted(format!("{leaf_id} missing from its parent"))
                    })?;
                    if child_idx > 0 {
                        parent.set_key_at(child_idx, leaf.key_at(0));
                    }
                }
            }

            leaf.size() < leaf.min_size()
        };

        if underfull {
            self.fix_underflow(&mut ctx, leaf_guard)?;
        }
        Ok(())
    }

    /// Iterator positioned at the smallest key.
    pub fn begin(&self) -> Result<BTreeIterator> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_page_id = HeaderNodeRef::new(header_guard.data()).root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(BTreeIterator::end(Arc::clone(&self.bpm)));
        }

        let mut guard = self.bpm.fetch_page_read(root_page_id)?;
        drop(header_guard);

        loop {
            let child_id = {
                let node = BTreeNodeRef::new(guard.data());
                if node.is_leaf() {
                    break;
                }
                node.child_at(0)
            };
            let child_guard = self.bpm.fetch_page_read(child_id)?;
            guard = child_guard;
        }

        let basic = self.bpm.fetch_page_basic(guard.page_id())?;
        drop(guard);
        Ok(BTreeIterator::new(Arc::clone(&self.bpm), basic, 0))
    }

    /// Iterator positioned at `key`, or at the first larger key when
    /// `key` is absent.
    pub fn begin_at(&self, key: u32) -> Result<BTreeIterator> {
        let header_guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let root_page_id = HeaderNodeRef::new(header_guard.data()).root_page_id();
        if root_page_id == INVALID_PAGE_ID {
            return Ok(BTreeIterator::end(Arc::clone(&self.bpm)));
        }

        let mut guard = self.bpm.fetch_page_read(root_page_id)?;
        drop(header_guard);

        let index = loop {
            let child_id = {
                let node = BTreeNodeRef::new(guard.data());
                if node.is_leaf() {
                    break node.lower_bound(key, &self.comparator);
                }
                node.child_at(node.child_lookup(key, &self.comparator))
            };
            let child_guard = self.bpm.fetch_page_read(child_id)?;
            guard = child_guard;
        };

        let basic = self.bpm.fetch_page_basic(guard.page_id())?;
        drop(guard);
        Ok(BTreeIterator::new(Arc::clone(&self.bpm), basic, index))
    }

    /// The exhausted iterator.
    pub fn end(&self) -> BTreeIterator {
        BTreeIterator::end(Arc::clone(&self.bpm))
    }

    /// Collects every pair with `start_key <= key <= end_key`.
    pub fn range_scan(&self, start_key: u32, end_key: u32) -> Result<Vec<(u32, RecordId)>> {
        let mut results = Vec::new();
        let mut iter = self.begin_at(start_key)?;
        while let Some((key, rid)) = iter.next_entry()? {
            if self.comparator.compare(key, end_key) == Ordering::Greater {
                break;
            }
            results.push((key, rid));
        }
        Ok(results)
    }

    /// Writes a Graphviz rendering of the tree to `path`.
    pub fn draw<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut out = String::from("digraph G {\n  node [shape=record];\n");
        let root_page_id = self.get_root_page_id()?;
        if root_page_id == INVALID_PAGE_ID {
            warn!(index = %self.index_name, "drawing an empty tree");
        } else {
            self.draw_node(root_page_id, &mut out)?;
        }
        out.push_str("}\n");
        std::fs::write(path, out)?;
        Ok(())
    }

    /// Renders the tree as an indented text outline.
    pub fn pretty_print(&self) -> Result<String> {
        let root_page_id = self.get_root_page_id()?;
        if root_page_id == INVALID_PAGE_ID {
            return Ok("()".to_string());
        }
        let mut out = String::new();
        self.pretty_node(root_page_id, 0, &mut out)?;
        Ok(out)
    }

    /// Wraps pool allocation, surfacing exhaustion as an out-of-memory
    /// condition, and takes the new page's write latch.
    fn allocate_node(&self) -> Result<WritePageGuard> {
        let guard = self.bpm.new_page_guarded().map_err(|e| match e {
            StratumError::BufferPoolFull => StratumError::OutOfMemory,
            other => other,
        })?;
        Ok(guard.upgrade_write())
    }

    /// Root-to-leaf descent taking write latches, parking every ancestor
    /// in the context. Returns the leaf's guard.
    fn descend_for_write(
        &self,
        ctx: &mut Context,
        root_page_id: PageId,
        key: u32,
    ) -> Result<WritePageGuard> {
        let mut guard = self.bpm.fetch_page_write(root_page_id)?;
        loop {
            let child_id = {
                let node = BTreeNodeRef::new(guard.data());
                if node.is_leaf() {
                    return Ok(guard);
                }
                node.child_at(node.child_lookup(key, &self.comparator))
            };
            let child_guard = self.bpm.fetch_page_write(child_id)?;
            ctx.write_set.push(guard);
            guard = child_guard;
        }
    }

    /// Installs the separator of a finished split into the parent,
    /// splitting ancestors as long as they overflow.
    fn insert_into_parent(
        &self,
        ctx: &mut Context,
        left_id: PageId,
        key: u32,
        right_id: PageId,
    ) -> Result<()> {
        let mut left_id = left_id;
        let mut key = key;
        let mut right_id = right_id;

        loop {
            let Some(mut parent_guard) = ctx.write_set.pop() else {
                // The split reached the root: grow the tree by one level
                let mut root_guard = self.allocate_node()?;
                let new_root_id = root_guard.page_id();
                let mut root = BTreeNode::new(root_guard.data_mut());
                root.init_internal(self.internal_max_size);
                root.internal_set_entries(&[(0, left_id), (key, right_id)]);
                HeaderNode::new(ctx.header.data_mut()).set_root_page_id(new_root_id);
                debug!(
                    index = %self.index_name,
                    root = new_root_id.as_u32(),
                    "root split"
                );
                return Ok(());
            };

            let parent_id = parent_guard.page_id();
            let mut parent = BTreeNode::new(parent_guard.data_mut());

            if parent.size() < self.internal_max_size {
                let pos = parent.internal_upper_bound(key, &self.comparator);
                parent.internal_insert_at(pos, key, right_id);
                return Ok(());
            }

            // Full parent: materialize max_size + 1 entries in an overflow
            // buffer, then cut it in two. Pages never grow in place.
            let mut entries = parent.internal_entries(0);
            let pos = parent.internal_upper_bound(key, &self.comparator);
            entries.insert(pos, (key, right_id));

            let left_count = (self.internal_max_size + 2) / 2;
            parent.internal_set_entries(&entries[..left_count]);

            let mut sibling_guard = self.allocate_node()?;
            let sibling_id = sibling_guard.page_id();
            {
                let mut sibling = BTreeNode::new(sibling_guard.data_mut());
                sibling.init_internal(self.internal_max_size);
                // The first moved entry's key rides along as the promoted
                // separator; slot 0 keys are never consulted
                sibling.internal_set_entries(&entries[left_count..]);
            }

            debug!(
                index = %self.index_name,
                left = parent_id.as_u32(),
                right = sibling_id.as_u32(),
                "split internal node"
            );
            key = entries[left_count].0;
            left_id = parent_id;
            right_id = sibling_id;
        }
    }

    /// Repairs an underfull non-root node by borrowing from or merging
    /// with its preferred sibling, walking up while merges cascade.
    fn fix_underflow(&self, ctx: &mut Context, node_guard: WritePageGuard) -> Result<()> {
        let mut node_guard = node_guard;

        loop {
            let node_id = node_guard.page_id();
            let mut parent_guard = ctx.write_set.pop().ok_or_else(|| {
                StratumError::IndexCorrupted("underflow repair walked past the root".into())
            })?;

            let child_idx = BTreeNodeRef::new(parent_guard.data())
                .child_index_of(node_id)
                .ok_or_else(|| {
                    StratumError::IndexCorrupted(format!("{node_id} missing from its parent"))
                })?;

            let merged = if child_idx > 0 {
                // Prefer the left sibling
                let sibling_id = BTreeNodeRef::new(parent_guard.data()).child_at(child_idx - 1);
                let mut sibling_guard = self.bpm.fetch_page_write(sibling_id)?;
                let can_borrow = {
                    let sibling = BTreeNodeRef::new(sibling_guard.data());
                    sibling.size() > sibling.min_size()
                };
                if can_borrow {
                    Self::borrow_from_left(
                        &mut parent_guard,
                        &mut sibling_guard,
                        &mut node_guard,
                        child_idx,
                    );
                    false
                } else {
                    Self::merge(&mut parent_guard, &mut sibling_guard, &mut node_guard, child_idx);
                    true
                }
            } else {
                // Leftmost child: fall back to the right sibling
                let sibling_id = BTreeNodeRef::new(parent_guard.data()).child_at(1);
                let mut sibling_guard = self.bpm.fetch_page_write(sibling_id)?;
                let can_borrow = {
                    let sibling = BTreeNodeRef::new(sibling_guard.data());
                    sibling.size() > sibling.min_size()
                };
                if can_borrow {
                    Self::borrow_from_right(&mut parent_guard, &mut node_guard, &mut sibling_guard);
                    false
                } else {
                    Self::merge(&mut parent_guard, &mut node_guard, &mut sibling_guard, 1);
                    true
                }
            };

            if !merged {
                return Ok(());
            }
            debug!(index = %self.index_name, node = node_id.as_u32(), "merged node");

            if ctx.write_set.is_empty() {
                // The parent is the root: shrink the tree when only one
                // child remains
                let mut parent = BTreeNode::new(parent_guard.data_mut());
                if parent.size() == 1 {
                    let only_child = parent.child_at(0);
                    HeaderNode::new(ctx.header.data_mut()).set_root_page_id(only_child);
                    parent.reset();
                    debug!(
                        index = %self.index_name,
                        root = only_child.as_u32(),
                        "collapsed root"
                    );
                }
                return Ok(());
            }

            let parent_underfull = {
                let parent = BTreeNodeRef::new(parent_guard.data());
                parent.size() < parent.min_size()
            };
            if !parent_underfull {
                return Ok(());
            }
            node_guard = parent_guard;
        }
    }

    /// Moves the left sibling's last entry into the underfull node.
    /// `child_idx` is the node's slot in the parent.
    fn borrow_from_left(
        parent_guard: &mut WritePageGuard,
        left_guard: &mut WritePageGuard,
        node_guard: &mut WritePageGuard,
        child_idx: usize,
    ) {
        let mut parent = BTreeNode::new(parent_guard.data_mut());
        let mut left = BTreeNode::new(left_guard.data_mut());
        let mut node = BTreeNode::new(node_guard.data_mut());
        let last = left.size() - 1;

        if node.is_leaf() {
            let key = left.key_at(last);
            let rid = left.rid_at(last);
            left.leaf_remove_at(last);
            node.leaf_insert_at(0, key, rid);
            // The node's minimum changed
            parent.set_key_at(child_idx, key);
        } else {
            // The separator rotates: parent's comes down as the adopted
            // child's key, the left sibling's last key goes up
            let old_separator = parent.key_at(child_idx);
            let moved_child = left.child_at(last);
            let new_separator = left.key_at(last);
            left.internal_remove_at(last);
            node.internal_insert_at(0, 0, moved_child);
            node.set_key_at(1, old_separator);
            parent.set_key_at(child_idx, new_separator);
        }
    }

    /// Moves the right sibling's first entry into the underfull node.
    /// The node sits at slot 0, the sibling at slot 1.
    fn borrow_from_right(
        parent_guard: &mut WritePageGuard,
        node_guard: &mut WritePageGuard,
        right_guard: &mut WritePageGuard,
    ) {
        let mut parent = BTreeNode::new(parent_guard.data_mut());
        let mut node = BTreeNode::new(node_guard.data_mut());
        let mut right = BTreeNode::new(right_guard.data_mut());
        let node_size = node.size();

        if node.is_leaf() {
            let key = right.key_at(0);
            let rid = right.rid_at(0);
            right.leaf_remove_at(0);
            node.leaf_insert_at(node_size, key, rid);
            // The sibling's minimum changed
            parent.set_key_at(1, right.key_at(0));
        } else {
            let separator = parent.key_at(1);
            let moved_child = right.child_at(0);
            node.internal_insert_at(node_size, separator, moved_child);
            parent.set_key_at(1, right.key_at(1));
            right.internal_remove_at(0);
        }
    }

    /// Concatenates the right node into the left one and drops the
    /// right node's separator from the parent. `right_idx` is the right
    /// node's slot in the parent.
    fn merge(
        parent_guard: &mut WritePageGuard,
        left_guard: &mut WritePageGuard,
        right_guard: &mut WritePageGuard,
        right_idx: usize,
    ) {
        let mut parent = BTreeNode::new(parent_guard.data_mut());
        let mut left = BTreeNode::new(left_guard.data_mut());
        let mut right = BTreeNode::new(right_guard.data_mut());

        if left.is_leaf() {
            let entries = right.leaf_entries(0);
            left.leaf_extend(&entries);
            left.set_next_page_id(right.next_page_id());
        } else {
            // The separator comes down as the first adopted entry's key
            let separator = parent.key_at(right_idx);
            let mut entries = right.internal_entries(0);
            if let Some(first) = entries.first_mut() {
                first.0 = separator;
            }
            left.internal_extend(&entries);
        }
        // Emptied out; the page stays allocated but holds nothing
        right.reset();
        parent.internal_remove_at(right_idx);
    }

    fn draw_node(&self, page_id: PageId, out: &mut String) -> Result<()> {
        let guard = self.bpm.fetch_page_basic(page_id)?;
        let (is_leaf, keys, children, next) = guard.with_data(|data| {
            let node = BTreeNodeRef::new(data);
            if node.is_leaf() {
                (
                    true,
                    (0..node.size()).map(|i| node.key_at(i)).collect::<Vec<_>>(),
                    Vec::new(),
                    node.next_page_id(),
                )
            } else {
                (
                    false,
                    (1..node.size()).map(|i| node.key_at(i)).collect(),
                    (0..node.size()).map(|i| node.child_at(i)).collect(),
                    INVALID_PAGE_ID,
                )
            }
        });
        drop(guard);

        let labels: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        if is_leaf {
            out.push_str(&format!(
                "  leaf{} [label=\"P{}|{}\"];\n",
                page_id.as_u32(),
                page_id.as_u32(),
                labels.join("|")
            ));
            if next != INVALID_PAGE_ID {
                out.push_str(&format!(
                    "  leaf{} -> leaf{} [constraint=false];\n",
                    page_id.as_u32(),
                    next.as_u32()
                ));
            }
        } else {
            out.push_str(&format!(
                "  int{} [label=\"P{}|{}\"];\n",
                page_id.as_u32(),
                page_id.as_u32(),
                labels.join("|")
            ));
            for child in children {
                let child_is_leaf = {
                    let child_guard = self.bpm.fetch_page_basic(child)?;
                    child_guard.with_data(|data| BTreeNodeRef::new(data).is_leaf())
                };
                let prefix = if child_is_leaf { "leaf" } else { "int" };
                out.push_str(&format!(
                    "  int{} -> {}{};\n",
                    page_id.as_u32(),
                    prefix,
                    child.as_u32()
                ));
                self.draw_node(child, out)?;
            }
        }
        Ok(())
    }

    fn pretty_node(&self, page_id: PageId, depth: usize, out: &mut String) -> Result<()> {
        let guard = self.bpm.fetch_page_basic(page_id)?;
        let (is_leaf, keys, children) = guard.with_data(|data| {
            let node = BTreeNodeRef::new(data);
            if node.is_leaf() {
                (
                    true,
                    (0..node.size()).map(|i| node.key_at(i)).collect::<Vec<_>>(),
                    Vec::new(),
                )
            } else {
                (
                    false,
                    (1..node.size()).map(|i| node.key_at(i)).collect(),
                    (0..node.size()).map(|i| node.child_at(i)).collect(),
                )
            }
        });
        drop(guard);

        let indent = "    ".repeat(depth);
        let labels: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        let kind = if is_leaf { "Leaf" } else { "Internal" };
        out.push_str(&format!(
            "{}{} P{}: [{}]\n",
            indent,
            kind,
            page_id.as_u32(),
            labels.join(", ")
        ));
        for child in children {
            self.pretty_node(child, depth + 1, out)?;
        }
        Ok(())
    }
}
