//! In-memory view of the dirstate tree: on-disk node runs presented
//! through a uniform interface, with copy-on-write conversion to mutable
//! hash maps for the parts touched since load.

use crate::dirstate::entry::{
    DirstateEntry, DirstateV2Data, TruncatedTimestamp,
};
use crate::dirstate::on_disk::{
    self, IgnorePatternsHash, TreeMetadata, IGNORE_PATTERNS_HASH_LEN,
    NODE_SIZE,
};
use crate::dirstate::path_with_basename::WithBasename;
use crate::dirstate::{CopyMapIter, StateMapIter};
use crate::errors::{CorruptIndex, DirstateError};
use crate::utils::hg_path::{HgPath, HgPathBuf};
use crate::FastHashMap;
use std::borrow::Cow;

/// Fraction of the data file that may be unreachable from the root before
/// a commit rewrites a fresh file instead of appending.
const ACCEPTABLE_UNREACHABLE_BYTES_RATIO: f32 = 0.5;

pub struct DirstateMap<'on_disk> {
    /// Contents of the data file for the current generation, truncated to
    /// the docket's `used_size`.
    pub(super) on_disk: &'on_disk [u8],

    pub(super) root: ChildNodes<'on_disk>,

    /// Number of nodes anywhere in the tree whose entry has at least one
    /// of the three tracked-anywhere facts set.
    pub(super) nodes_with_entry_count: u32,

    /// Number of nodes anywhere in the tree that have a copy source.
    pub(super) nodes_with_copy_source_count: u32,

    /// See [`TreeMetadata::ignore_patterns_hash`].
    pub(super) ignore_patterns_hash: IgnorePatternsHash,

    /// Estimate of how many bytes of `on_disk` are no longer reachable
    /// from the root. Grows as the overlay shadows on-disk nodes.
    pub(super) unreachable_bytes: u32,

    /// Identifier of the data file this map was read from, if any.
    pub(super) old_uuid: Option<Vec<u8>>,
}

/// A map key that hashes and compares as the base name only: children of
/// a common node all share their parent path, so the base name is
/// unambiguous, and this avoids re-hashing the common prefix on every
/// lookup.
pub(super) type NodeKey<'on_disk> = WithBasename<Cow<'on_disk, HgPath>>;

/// Sibling nodes: either an untouched sorted run from the data file, or
/// the mutable form.
pub(super) enum ChildNodes<'on_disk> {
    InMemory(FastHashMap<NodeKey<'on_disk>, Node<'on_disk>>),
    OnDisk(&'on_disk [on_disk::Node]),
}

#[derive(Copy, Clone)]
pub(super) enum ChildNodesRef<'tree, 'on_disk> {
    InMemory(&'tree FastHashMap<NodeKey<'on_disk>, Node<'on_disk>>),
    OnDisk(&'on_disk [on_disk::Node]),
}

#[derive(Copy, Clone)]
pub(super) enum NodeRef<'tree, 'on_disk> {
    InMemory(&'tree NodeKey<'on_disk>, &'tree Node<'on_disk>),
    OnDisk(&'on_disk on_disk::Node),
}

/// Represents a file or a directory
#[derive(Default)]
pub(super) struct Node<'on_disk> {
    pub(super) data: NodeData,

    pub(super) copy_source: Option<Cow<'on_disk, HgPath>>,

    pub(super) children: ChildNodes<'on_disk>,

    /// How many (non-inclusive) descendants of this node have an entry.
    pub(super) descendants_with_entry_count: u32,

    /// How many (non-inclusive) descendants of this node are tracked in
    /// the working directory.
    pub(super) tracked_descendants_count: u32,
}

pub(super) enum NodeData {
    Entry(DirstateEntry),
    CachedDirectory(DirectoryCache),
    None,
}

/// What a past `status` run recorded about a directory, allowing a later
/// run to skip `read_dir` entirely when nothing changed.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct DirectoryCache {
    /// Modification time of the directory, observed strictly before the
    /// run's filesystem clock boundary.
    pub mtime: TruncatedTimestamp,
    /// Every directory entry seen by `read_dir` either had a dirstate
    /// node or was ignored: a walk listing unknown files loses nothing by
    /// iterating stored children instead.
    pub all_unknown_recorded: bool,
    /// Same guarantee, extended to a walk that also lists ignored files.
    pub all_ignored_recorded: bool,
}

impl Default for NodeData {
    fn default() -> Self {
        NodeData::None
    }
}

impl NodeData {
    pub(super) fn has_entry(&self) -> bool {
        matches!(self, NodeData::Entry(_))
    }

    pub(super) fn as_entry(&self) -> Option<&DirstateEntry> {
        match self {
            NodeData::Entry(entry) => Some(entry),
            _ => None,
        }
    }
}

impl Default for ChildNodes<'_> {
    fn default() -> Self {
        ChildNodes::InMemory(Default::default())
    }
}

impl<'on_disk> ChildNodes<'on_disk> {
    pub(super) fn as_ref<'tree>(
        &'tree self,
    ) -> ChildNodesRef<'tree, 'on_disk> {
        match self {
            ChildNodes::InMemory(nodes) => ChildNodesRef::InMemory(nodes),
            ChildNodes::OnDisk(nodes) => ChildNodesRef::OnDisk(nodes),
        }
    }

    pub(super) fn is_empty(&self) -> bool {
        match self {
            ChildNodes::InMemory(nodes) => nodes.is_empty(),
            ChildNodes::OnDisk(nodes) => nodes.is_empty(),
        }
    }

    /// Returns the mutable form, converting an on-disk run first if
    /// needed. The stranded on-disk node bytes are added to
    /// `unreachable_bytes`; path bytes stay borrowed and reusable.
    fn make_mut(
        &mut self,
        on_disk: &'on_disk [u8],
        unreachable_bytes: &mut u32,
    ) -> Result<
        &mut FastHashMap<NodeKey<'on_disk>, Node<'on_disk>>,
        CorruptIndex,
    > {
        match self {
            ChildNodes::InMemory(nodes) => Ok(nodes),
            ChildNodes::OnDisk(nodes) => {
                *unreachable_bytes += (nodes.len() * NODE_SIZE) as u32;
                let nodes = nodes
                    .iter()
                    .map(|node| {
                        Ok((
                            node.path(on_disk)?,
                            node.to_in_memory_node(on_disk)?,
                        ))
                    })
                    .collect::<Result<_, CorruptIndex>>()?;
                *self = ChildNodes::InMemory(nodes);
                match self {
                    ChildNodes::InMemory(nodes) => Ok(nodes),
                    ChildNodes::OnDisk(_) => unreachable!(),
                }
            }
        }
    }
}

impl<'tree, 'on_disk> ChildNodesRef<'tree, 'on_disk> {
    pub(super) fn get(
        &self,
        base_name: &HgPath,
        on_disk: &'on_disk [u8],
    ) -> Result<Option<NodeRef<'tree, 'on_disk>>, CorruptIndex> {
        match self {
            ChildNodesRef::InMemory(nodes) => Ok(nodes
                .get_key_value(base_name)
                .map(|(k, v)| NodeRef::InMemory(k, v))),
            ChildNodesRef::OnDisk(nodes) => {
                let mut parse_result = Ok(());
                let search_result = nodes.binary_search_by(|node| {
                    match node.base_name(on_disk) {
                        Ok(node_base_name) => node_base_name.cmp(base_name),
                        Err(e) => {
                            parse_result = Err(e);
                            // Dummy, not returned
                            std::cmp::Ordering::Equal
                        }
                    }
                });
                parse_result?;
                Ok(search_result.ok().map(|i| NodeRef::OnDisk(&nodes[i])))
            }
        }
    }

    /// Iterate in undefined order
    pub(super) fn iter(
        &self,
    ) -> impl Iterator<Item = NodeRef<'tree, 'on_disk>> {
        match self {
            ChildNodesRef::InMemory(nodes) => itertools::Either::Left(
                nodes.iter().map(|(k, v)| NodeRef::InMemory(k, v)),
            ),
            ChildNodesRef::OnDisk(nodes) => {
                itertools::Either::Right(nodes.iter().map(NodeRef::OnDisk))
            }
        }
    }

    pub(super) fn len(&self) -> usize {
        match self {
            ChildNodesRef::InMemory(nodes) => nodes.len(),
            ChildNodesRef::OnDisk(nodes) => nodes.len(),
        }
    }

    /// Sorted by ascending base name. On-disk runs are stored in that
    /// order already; the mutable form needs an actual sort.
    pub(super) fn sorted(&self) -> Vec<NodeRef<'tree, 'on_disk>> {
        match self {
            ChildNodesRef::InMemory(nodes) => {
                let mut vec: Vec<_> = nodes
                    .iter()
                    .map(|(k, v)| NodeRef::InMemory(k, v))
                    .collect();
                fn sort_key<'a>(node: &'a NodeRef) -> &'a HgPath {
                    match node {
                        NodeRef::InMemory(path, _node) => path.base_name(),
                        NodeRef::OnDisk(_) => unreachable!(),
                    }
                }
                // `sort_unstable_by_key` does not allow keys borrowing
                // from the value: https://github.com/rust-lang/rust/issues/34162
                vec.sort_unstable_by(|a, b| sort_key(a).cmp(sort_key(b)));
                vec
            }
            ChildNodesRef::OnDisk(nodes) => {
                nodes.iter().map(NodeRef::OnDisk).collect()
            }
        }
    }
}

impl<'tree, 'on_disk> NodeRef<'tree, 'on_disk> {
    pub(super) fn full_path(
        &self,
        on_disk: &'on_disk [u8],
    ) -> Result<&'tree HgPath, CorruptIndex> {
        match self {
            NodeRef::InMemory(path, _node) => Ok(path.full_path()),
            NodeRef::OnDisk(node) => node.full_path(on_disk),
        }
    }

    /// Returns a `Cow` that borrows from 'on_disk (not 'tree) whenever
    /// possible, so callers can detach results from the tree borrow.
    pub(super) fn full_path_borrowed(
        &self,
        on_disk: &'on_disk [u8],
    ) -> Result<Cow<'on_disk, HgPath>, CorruptIndex> {
        match self {
            NodeRef::InMemory(path, _node) => Ok(match *path.full_path() {
                Cow::Borrowed(borrowed) => Cow::Borrowed(borrowed),
                Cow::Owned(ref owned) => Cow::Owned(owned.clone()),
            }),
            NodeRef::OnDisk(node) => {
                Ok(Cow::Borrowed(node.full_path(on_disk)?))
            }
        }
    }

    pub(super) fn base_name(
        &self,
        on_disk: &'on_disk [u8],
    ) -> Result<&'tree HgPath, CorruptIndex> {
        match self {
            NodeRef::InMemory(path, _node) => Ok(path.base_name()),
            NodeRef::OnDisk(node) => node.base_name(on_disk),
        }
    }

    pub(super) fn children(
        &self,
        on_disk: &'on_disk [u8],
    ) -> Result<ChildNodesRef<'tree, 'on_disk>, CorruptIndex> {
        match self {
            NodeRef::InMemory(_path, node) => Ok(node.children.as_ref()),
            NodeRef::OnDisk(node) => {
                Ok(ChildNodesRef::OnDisk(node.children(on_disk)?))
            }
        }
    }

    pub(super) fn copy_source(
        &self,
        on_disk: &'on_disk [u8],
    ) -> Result<Option<&'tree HgPath>, CorruptIndex> {
        match self {
            NodeRef::InMemory(_path, node) => {
                Ok(node.copy_source.as_ref().map(|s| &**s))
            }
            NodeRef::OnDisk(node) => node.copy_source(on_disk),
        }
    }

    pub(super) fn has_entry(&self) -> Result<bool, CorruptIndex> {
        Ok(match self {
            NodeRef::InMemory(_path, node) => node.data.has_entry(),
            NodeRef::OnDisk(node) => node.entry()?.is_some(),
        })
    }

    pub(super) fn entry(
        &self,
    ) -> Result<Option<DirstateEntry>, CorruptIndex> {
        match self {
            NodeRef::InMemory(_path, node) => {
                Ok(node.data.as_entry().copied())
            }
            NodeRef::OnDisk(node) => node.entry(),
        }
    }

    pub(super) fn cached_directory(
        &self,
    ) -> Result<Option<DirectoryCache>, CorruptIndex> {
        match self {
            NodeRef::InMemory(_path, node) => match &node.data {
                NodeData::CachedDirectory(cache) => Ok(Some(*cache)),
                _ => Ok(None),
            },
            NodeRef::OnDisk(node) => node.cached_directory(),
        }
    }

    pub(super) fn descendants_with_entry_count(&self) -> u32 {
        match self {
            NodeRef::InMemory(_path, node) => {
                node.descendants_with_entry_count
            }
            NodeRef::OnDisk(node) => {
                node.descendants_with_entry_count.get()
            }
        }
    }

    pub(super) fn tracked_descendants_count(&self) -> u32 {
        match self {
            NodeRef::InMemory(_path, node) => node.tracked_descendants_count,
            NodeRef::OnDisk(node) => node.tracked_descendants_count.get(),
        }
    }
}

/// Counts the bytes of a path about to become unreachable, if it lives in
/// the data file. (An owned path never had on-disk bytes to strand.)
fn count_dropped_path(unreachable_bytes: &mut u32, path: &Cow<HgPath>) {
    if let Cow::Borrowed(path) = *path {
        *unreachable_bytes += path.len() as u32
    }
}

impl<'on_disk> DirstateMap<'on_disk> {
    pub fn empty(on_disk: &'on_disk [u8]) -> Self {
        Self {
            on_disk,
            root: ChildNodes::default(),
            nodes_with_entry_count: 0,
            nodes_with_copy_source_count: 0,
            ignore_patterns_hash: [0; IGNORE_PATTERNS_HASH_LEN],
            unreachable_bytes: 0,
            old_uuid: None,
        }
    }

    /// Builds the tree from a data-file slice already truncated to the
    /// docket's `used_size`, and the docket's tree metadata.
    pub fn read(
        on_disk: &'on_disk [u8],
        metadata: &TreeMetadata,
    ) -> Result<Self, CorruptIndex> {
        on_disk::read(on_disk, metadata)
    }

    pub fn old_uuid(&self) -> Option<&[u8]> {
        self.old_uuid.as_deref()
    }

    pub(crate) fn set_old_uuid(&mut self, uuid: Vec<u8>) {
        self.old_uuid = Some(uuid);
    }

    pub fn ignore_patterns_hash(&self) -> &IgnorePatternsHash {
        &self.ignore_patterns_hash
    }

    pub fn unreachable_bytes(&self) -> u32 {
        self.unreachable_bytes
    }

    /// Number of entries in the map (nodes that are tracked anywhere).
    pub fn len(&self) -> usize {
        self.nodes_with_entry_count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(super) fn get_node<'tree>(
        &'tree self,
        path: &HgPath,
    ) -> Result<Option<NodeRef<'tree, 'on_disk>>, CorruptIndex> {
        let mut children = self.root.as_ref();
        let mut components = path.components();
        let mut component = components
            .next()
            .expect("expected at least one component");
        loop {
            if let Some(child) = children.get(component, self.on_disk)? {
                if let Some(next_component) = components.next() {
                    component = next_component;
                    children = child.children(self.on_disk)?;
                } else {
                    return Ok(Some(child));
                }
            } else {
                return Ok(None);
            }
        }
    }

    /// Returns a mutable reference to the node at `path` if it exists.
    ///
    /// Takes `root` and the accounting fields instead of `&mut self` so
    /// that callers can mutate disjoint fields while the borrow lives.
    fn get_node_mut<'tree>(
        on_disk: &'on_disk [u8],
        unreachable_bytes: &mut u32,
        root: &'tree mut ChildNodes<'on_disk>,
        path: &HgPath,
    ) -> Result<Option<&'tree mut Node<'on_disk>>, CorruptIndex> {
        let mut children = root;
        let mut components = path.components();
        let mut component = components
            .next()
            .expect("expected at least one component");
        loop {
            if let Some(child) = children
                .make_mut(on_disk, unreachable_bytes)?
                .get_mut(component)
            {
                if let Some(next_component) = components.next() {
                    component = next_component;
                    children = &mut child.children;
                } else {
                    return Ok(Some(child));
                }
            } else {
                return Ok(None);
            }
        }
    }

    fn get_or_insert_node<'tree>(
        on_disk: &'on_disk [u8],
        unreachable_bytes: &mut u32,
        root: &'tree mut ChildNodes<'on_disk>,
        path: &HgPath,
        mut each_ancestor: impl FnMut(&mut Node),
    ) -> Result<&'tree mut Node<'on_disk>, CorruptIndex> {
        let mut child_nodes = root;
        let mut inclusive_ancestor_paths =
            WithBasename::inclusive_ancestors_of(path);
        let mut ancestor_path = inclusive_ancestor_paths
            .next()
            .expect("expected at least one inclusive ancestor");
        loop {
            let child_node = child_nodes
                .make_mut(on_disk, unreachable_bytes)?
                .entry(ancestor_path.to_cow_owned())
                .or_default();
            if let Some(next) = inclusive_ancestor_paths.next() {
                each_ancestor(child_node);
                ancestor_path = next;
                child_nodes = &mut child_node.children;
            } else {
                return Ok(child_node);
            }
        }
    }

    pub fn contains_key(&self, path: &HgPath) -> Result<bool, CorruptIndex> {
        Ok(self.get(path)?.is_some())
    }

    pub fn get(
        &self,
        path: &HgPath,
    ) -> Result<Option<DirstateEntry>, CorruptIndex> {
        match self.get_node(path)? {
            Some(node) => node.entry(),
            None => Ok(None),
        }
    }

    /// Stores `entry` at `path`, creating ancestor nodes as needed, and
    /// keeps every aggregate counter exact.
    ///
    /// `entry` must be tracked anywhere; dropping an entry goes through
    /// [`Self::drop_entry_and_copy_source`].
    pub fn set_entry(
        &mut self,
        path: &HgPath,
        entry: DirstateEntry,
    ) -> Result<(), CorruptIndex> {
        debug_assert!(entry.any_tracked());
        let old_entry = self.get(path)?;
        let had_entry = old_entry.is_some();
        let was_tracked = old_entry.map_or(false, |e| e.tracked());
        // The counters are unsigned; using explicit increments and
        // decrements lets debug builds catch accidental underflow.
        let tracked_count_increment =
            match (was_tracked, entry.tracked()) {
                (false, true) => 1,
                (true, false) => -1,
                _ => 0,
            };
        let node = Self::get_or_insert_node(
            self.on_disk,
            &mut self.unreachable_bytes,
            &mut self.root,
            path,
            |ancestor| {
                match tracked_count_increment {
                    1 => ancestor.tracked_descendants_count += 1,
                    -1 => ancestor.tracked_descendants_count -= 1,
                    _ => {}
                }
                if !had_entry {
                    ancestor.descendants_with_entry_count += 1
                }
            },
        )?;
        if !had_entry {
            self.nodes_with_entry_count += 1
        }
        node.data = NodeData::Entry(entry);
        Ok(())
    }

    /// Starts tracking `path` in the working directory. Returns whether
    /// it was untracked before.
    pub fn set_tracked(&mut self, path: &HgPath) -> Result<bool, CorruptIndex> {
        let mut entry = self.get(path)?.unwrap_or_else(|| {
            DirstateEntry::from_v2_data(DirstateV2Data::default())
        });
        let was_tracked = entry.tracked();
        entry.set_tracked();
        self.set_entry(path, entry)?;
        Ok(!was_tracked)
    }

    /// Stops tracking `path`. Returns false if it had no entry.
    pub fn set_untracked(
        &mut self,
        path: &HgPath,
    ) -> Result<bool, CorruptIndex> {
        match self.get(path)? {
            None => Ok(false),
            Some(mut entry) => {
                entry.set_untracked();
                if entry.any_tracked() {
                    self.set_entry(path, entry)?;
                } else {
                    self.drop_entry_and_copy_source(path)?;
                }
                Ok(true)
            }
        }
    }

    /// Records that `path` was found clean, with the given metadata
    /// observed strictly before the current filesystem clock tick.
    pub fn set_clean(
        &mut self,
        path: &HgPath,
        mode: u32,
        size: u32,
        mtime: TruncatedTimestamp,
    ) -> Result<(), CorruptIndex> {
        let mut entry = match self.get(path)? {
            Some(entry) => entry,
            None => {
                debug_assert!(false, "set_clean on an unknown path");
                return Ok(());
            }
        };
        entry.set_clean(mode, size, mtime);
        self.set_entry(path, entry)
    }

    /// Drops the cached metadata of `path` so the next status looks at
    /// the file again.
    pub fn set_possibly_dirty(
        &mut self,
        path: &HgPath,
    ) -> Result<(), CorruptIndex> {
        let mut entry = match self.get(path)? {
            Some(entry) => entry,
            None => return Ok(()),
        };
        entry.set_possibly_dirty();
        self.set_entry(path, entry)
    }

    /// Records that `path` has contents differing from the parent even
    /// though its cached metadata matches, so future runs can report
    /// "modified" without re-reading the file.
    pub fn set_expected_state_is_modified(
        &mut self,
        path: &HgPath,
    ) -> Result<(), CorruptIndex> {
        let mut entry = match self.get(path)? {
            Some(entry) => entry,
            None => return Ok(()),
        };
        entry.set_expected_state_is_modified(true);
        self.set_entry(path, entry)
    }

    /// Removes the entry and copy source at `path`, pruning tree nodes
    /// that no longer hold anything.
    pub fn drop_entry_and_copy_source(
        &mut self,
        path: &HgPath,
    ) -> Result<(), CorruptIndex> {
        struct Dropped {
            was_tracked: bool,
            had_entry: bool,
            had_copy_source: bool,
        }
        fn recur<'on_disk>(
            on_disk: &'on_disk [u8],
            unreachable_bytes: &mut u32,
            nodes: &mut ChildNodes<'on_disk>,
            path: &HgPath,
        ) -> Result<Option<Dropped>, CorruptIndex> {
            let (first_component, rest_of_path) =
                path.split_first_component();
            let nodes = nodes.make_mut(on_disk, unreachable_bytes)?;
            let node = match nodes.get_mut(first_component) {
                Some(node) => node,
                None => return Ok(None),
            };
            let dropped;
            if let Some(rest) = rest_of_path {
                match recur(on_disk, unreachable_bytes, &mut node.children, rest)? {
                    Some(d) => {
                        dropped = d;
                        if dropped.was_tracked {
                            node.tracked_descendants_count -= 1;
                        }
                        if dropped.had_entry {
                            node.descendants_with_entry_count -= 1;
                        }
                    }
                    None => return Ok(None),
                }
            } else {
                dropped = Dropped {
                    was_tracked: node
                        .data
                        .as_entry()
                        .map_or(false, |entry| entry.tracked()),
                    had_entry: node.data.has_entry(),
                    had_copy_source: node.copy_source.is_some(),
                };
                if dropped.had_entry {
                    node.data = NodeData::None;
                }
                if let Some(source) = node.copy_source.take() {
                    count_dropped_path(unreachable_bytes, &source);
                }
            }
            // After recursion, for both leaf and parent nodes, remove the
            // node if it just became empty.
            if matches!(node.data, NodeData::None)
                && node.copy_source.is_none()
                && node.children.is_empty()
            {
                let (key, _node) =
                    nodes.remove_entry(first_component).unwrap();
                count_dropped_path(unreachable_bytes, key.full_path());
            }
            Ok(Some(dropped))
        }

        if let Some(dropped) = recur(
            self.on_disk,
            &mut self.unreachable_bytes,
            &mut self.root,
            path,
        )? {
            if dropped.had_entry {
                self.nodes_with_entry_count -= 1
            }
            if dropped.had_copy_source {
                self.nodes_with_copy_source_count -= 1
            }
        }
        Ok(())
    }

    /// Caches the result of a `read_dir` reconciliation for the directory
    /// at `path`. Replaces any previous cache; does nothing if `path`
    /// holds a file entry.
    pub fn set_cached_directory(
        &mut self,
        path: &HgPath,
        cache: DirectoryCache,
    ) -> Result<(), CorruptIndex> {
        let node = Self::get_or_insert_node(
            self.on_disk,
            &mut self.unreachable_bytes,
            &mut self.root,
            path,
            |_ancestor| {},
        )?;
        if !node.data.has_entry() {
            node.data = NodeData::CachedDirectory(cache);
        }
        Ok(())
    }

    /// The recorded cache for the directory at `path`, if any.
    pub fn cached_directory(
        &self,
        path: &HgPath,
    ) -> Result<Option<DirectoryCache>, CorruptIndex> {
        match self.get_node(path)? {
            Some(node) => node.cached_directory(),
            None => Ok(None),
        }
    }

    /// Invalidates a stale directory cache.
    pub fn clear_cached_directory(
        &mut self,
        path: &HgPath,
    ) -> Result<(), CorruptIndex> {
        if let Some(node) = Self::get_node_mut(
            self.on_disk,
            &mut self.unreachable_bytes,
            &mut self.root,
            path,
        )? {
            if matches!(node.data, NodeData::CachedDirectory(_)) {
                node.data = NodeData::None;
            }
        }
        Ok(())
    }

    /// Is `path` a directory of the tree (a node without an entry of its
    /// own, holding child nodes)?
    pub fn has_dir(&self, path: &HgPath) -> Result<bool, CorruptIndex> {
        match self.get_node(path)? {
            Some(node) => Ok(!node.has_entry()?),
            None => Ok(false),
        }
    }

    /// Like `has_dir`, requiring at least one tracked descendant.
    pub fn has_tracked_dir(
        &self,
        path: &HgPath,
    ) -> Result<bool, CorruptIndex> {
        match self.get_node(path)? {
            Some(node) => {
                Ok(!node.has_entry()? && node.tracked_descendants_count() > 0)
            }
            None => Ok(false),
        }
    }

    pub fn copy_map_len(&self) -> usize {
        self.nodes_with_copy_source_count as usize
    }

    pub fn copy_map_get(
        &self,
        path: &HgPath,
    ) -> Result<Option<&HgPath>, CorruptIndex> {
        match self.get_node(path)? {
            Some(node) => node.copy_source(self.on_disk),
            None => Ok(None),
        }
    }

    pub fn copy_map_insert(
        &mut self,
        path: &HgPath,
        source: HgPathBuf,
    ) -> Result<Option<HgPathBuf>, CorruptIndex> {
        let node = Self::get_or_insert_node(
            self.on_disk,
            &mut self.unreachable_bytes,
            &mut self.root,
            path,
            |_ancestor| {},
        )?;
        if node.copy_source.is_none() {
            self.nodes_with_copy_source_count += 1
        }
        Ok(node
            .copy_source
            .replace(source.into())
            .map(Cow::into_owned))
    }

    pub fn copy_map_remove(
        &mut self,
        path: &HgPath,
    ) -> Result<Option<HgPathBuf>, CorruptIndex> {
        let count = &mut self.nodes_with_copy_source_count;
        let unreachable_bytes = &mut self.unreachable_bytes;
        Ok(Self::get_node_mut(
            self.on_disk,
            unreachable_bytes,
            &mut self.root,
            path,
        )?
        .and_then(|node| {
            if let Some(source) = &node.copy_source {
                count_dropped_path(unreachable_bytes, source);
                *count -= 1;
            }
            node.copy_source.take().map(Cow::into_owned)
        }))
    }

    /// Depth-first traversal, parents before children, siblings in
    /// ascending base-name order.
    pub(super) fn iter_nodes<'tree>(
        &'tree self,
    ) -> impl Iterator<
        Item = Result<NodeRef<'tree, 'on_disk>, CorruptIndex>,
    > + 'tree {
        let mut stack = vec![(self.root.as_ref().sorted(), 0)];
        std::iter::from_fn(move || loop {
            let (nodes, index) = stack.last_mut()?;
            if *index < nodes.len() {
                let node = nodes[*index];
                *index += 1;
                let children = match node.children(self.on_disk) {
                    Ok(children) => children,
                    Err(e) => {
                        stack.clear();
                        return Some(Err(e));
                    }
                };
                if children.len() > 0 {
                    stack.push((children.sorted(), 0));
                }
                return Some(Ok(node));
            }
            stack.pop();
            if stack.is_empty() {
                return None;
            }
        })
    }

    /// All entries, keyed by full path, in path order.
    pub fn iter(&self) -> StateMapIter<'_> {
        Box::new(self.iter_nodes().filter_map(move |node| {
            let node = match node {
                Ok(node) => node,
                Err(e) => return Some(Err(e)),
            };
            match (node.entry(), node.full_path(self.on_disk)) {
                (Ok(Some(entry)), Ok(path)) => Some(Ok((path, entry))),
                (Ok(None), _) => None,
                (Err(e), _) | (_, Err(e)) => Some(Err(e)),
            }
        }))
    }

    /// All (path, copy source) pairs, in path order.
    pub fn copy_map_iter(&self) -> CopyMapIter<'_> {
        Box::new(self.iter_nodes().filter_map(move |node| {
            let node = match node {
                Ok(node) => node,
                Err(e) => return Some(Err(e)),
            };
            match (
                node.copy_source(self.on_disk),
                node.full_path(self.on_disk),
            ) {
                (Ok(Some(source)), Ok(path)) => Some(Ok((path, source))),
                (Ok(None), _) => None,
                (Err(e), _) | (_, Err(e)) => Some(Err(e)),
            }
        }))
    }

    /// Whether the next commit should append to the current data file
    /// rather than start a fresh one: appending stays cheap until half of
    /// the file is unreachable garbage.
    pub(super) fn write_should_append(&self) -> bool {
        let ratio = self.unreachable_bytes as f32
            / self.on_disk.len().max(1) as f32;
        ratio < ACCEPTABLE_UNREACHABLE_BYTES_RATIO
    }

    /// Serializes the tree. See [`on_disk::write`].
    pub fn pack_v2(
        &mut self,
        can_append: bool,
    ) -> Result<(Vec<u8>, TreeMetadata, bool), DirstateError> {
        on_disk::write(self, can_append)
    }

    /// Records the hash of the ignore-pattern corpus the next written
    /// docket should carry.
    pub fn set_ignore_patterns_hash(&mut self, hash: IgnorePatternsHash) {
        self.ignore_patterns_hash = hash;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked_entry() -> DirstateEntry {
        DirstateEntry::from_v2_data(DirstateV2Data {
            wc_tracked: true,
            ..Default::default()
        })
    }

    fn removed_entry() -> DirstateEntry {
        DirstateEntry::from_v2_data(DirstateV2Data {
            p1_tracked: true,
            ..Default::default()
        })
    }

    #[test]
    fn test_insert_lookup_remove() -> Result<(), CorruptIndex> {
        let mut map = DirstateMap::empty(b"");
        assert_eq!(map.len(), 0);

        map.set_entry(HgPath::new(b"dir/sub/file"), tracked_entry())?;
        map.set_entry(HgPath::new(b"dir/other"), tracked_entry())?;
        assert_eq!(map.len(), 2);

        let entry = map.get(HgPath::new(b"dir/sub/file"))?.unwrap();
        assert!(entry.tracked());
        assert!(map.get(HgPath::new(b"dir/sub"))?.is_none());
        assert!(map.get(HgPath::new(b"missing"))?.is_none());
        assert!(map.has_dir(HgPath::new(b"dir"))?);
        assert!(map.has_tracked_dir(HgPath::new(b"dir/sub"))?);
        assert!(!map.has_dir(HgPath::new(b"dir/other"))?);

        map.drop_entry_and_copy_source(HgPath::new(b"dir/sub/file"))?;
        assert_eq!(map.len(), 1);
        assert!(map.get(HgPath::new(b"dir/sub/file"))?.is_none());
        // The empty intermediate directory is pruned
        assert!(!map.has_dir(HgPath::new(b"dir/sub"))?);
        assert!(map.has_dir(HgPath::new(b"dir"))?);
        Ok(())
    }

    fn tracked_in_p1_entry() -> DirstateEntry {
        DirstateEntry::from_v2_data(DirstateV2Data {
            wc_tracked: true,
            p1_tracked: true,
            ..Default::default()
        })
    }

    #[test]
    fn test_descendant_counters() -> Result<(), CorruptIndex> {
        let mut map = DirstateMap::empty(b"");
        map.set_entry(HgPath::new(b"a/x"), tracked_in_p1_entry())?;
        map.set_entry(HgPath::new(b"a/y"), tracked_entry())?;
        map.set_entry(HgPath::new(b"a/z"), removed_entry())?;

        let a = map.get_node(HgPath::new(b"a"))?.unwrap();
        assert_eq!(a.tracked_descendants_count(), 2);
        assert_eq!(a.descendants_with_entry_count(), 3);

        // Untracking an entry that stays known to p1 keeps the node but
        // drops the tracked count
        map.set_untracked(HgPath::new(b"a/x"))?;
        let a = map.get_node(HgPath::new(b"a"))?.unwrap();
        assert_eq!(a.tracked_descendants_count(), 1);
        assert_eq!(a.descendants_with_entry_count(), 3);

        // An added file has nothing to keep its node alive once
        // untracked
        map.set_untracked(HgPath::new(b"a/y"))?;
        assert_eq!(map.len(), 2);
        let a = map.get_node(HgPath::new(b"a"))?.unwrap();
        assert_eq!(a.tracked_descendants_count(), 0);
        assert_eq!(a.descendants_with_entry_count(), 2);
        Ok(())
    }

    #[test]
    fn test_copy_map() -> Result<(), CorruptIndex> {
        let mut map = DirstateMap::empty(b"");
        map.set_entry(HgPath::new(b"b"), tracked_entry())?;
        assert_eq!(
            map.copy_map_insert(HgPath::new(b"b"), HgPath::new(b"a").into())?,
            None
        );
        assert_eq!(map.copy_map_len(), 1);
        assert_eq!(
            map.copy_map_get(HgPath::new(b"b"))?,
            Some(HgPath::new(b"a"))
        );
        let previous = map
            .copy_map_insert(HgPath::new(b"b"), HgPath::new(b"a2").into())?;
        assert_eq!(previous.as_deref(), Some(HgPath::new(b"a")));
        assert_eq!(map.copy_map_len(), 1);
        let removed = map.copy_map_remove(HgPath::new(b"b"))?;
        assert_eq!(removed.as_deref(), Some(HgPath::new(b"a2")));
        assert_eq!(map.copy_map_len(), 0);
        Ok(())
    }

    #[test]
    fn test_iteration_order() -> Result<(), CorruptIndex> {
        let mut map = DirstateMap::empty(b"");
        for path in ["b", "a/z", "a/b/c", "c", "a/b/a"] {
            map.set_entry(HgPath::new(path), tracked_entry())?;
        }
        let paths: Vec<String> = map
            .iter()
            .map(|item| item.map(|(path, _entry)| path.to_string()))
            .collect::<Result<_, _>>()?;
        assert_eq!(paths, ["a/b/a", "a/b/c", "a/z", "b", "c"]);
        Ok(())
    }

    #[test]
    fn test_cached_directory() -> Result<(), CorruptIndex> {
        let mut map = DirstateMap::empty(b"");
        map.set_entry(HgPath::new(b"d/f"), tracked_entry())?;
        let cache = DirectoryCache {
            mtime: TruncatedTimestamp::from_already_truncated(12, 34, false)
                .unwrap(),
            all_unknown_recorded: true,
            all_ignored_recorded: false,
        };
        map.set_cached_directory(HgPath::new(b"d"), cache)?;
        let node = map.get_node(HgPath::new(b"d"))?.unwrap();
        assert_eq!(node.cached_directory()?, Some(cache));

        map.clear_cached_directory(HgPath::new(b"d"))?;
        let node = map.get_node(HgPath::new(b"d"))?.unwrap();
        assert_eq!(node.cached_directory()?, None);

        // A file entry is never replaced by a directory cache
        map.set_cached_directory(HgPath::new(b"d/f"), cache)?;
        assert!(map.get(HgPath::new(b"d/f"))?.is_some());
        Ok(())
    }
}
