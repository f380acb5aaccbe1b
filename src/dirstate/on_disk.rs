//! The on-disk representation of the dirstate-v2 data file.
//!
//! A `.hg/dirstate.{uid}` data file is an append-only blob of bytes holding,
//! in no particular order, raw path bytes and fixed-size node records laid
//! out as defined by the [`Node`] struct. The docket (see the sibling
//! `docket` module) names the current data file and carries the
//! [`TreeMetadata`] with the root pseudo-pointer.
//!
//! Sibling nodes always occupy one contiguous run, sorted by ascending base
//! name, so that each level of a path lookup is a binary search. Everything
//! else about placement is up to the writer: readers only ever follow the
//! (offset, length) slices stored in their parent.

use crate::dirstate::dirstate_map::{
    self, DirectoryCache, DirstateMap, NodeData, NodeRef,
};
use crate::dirstate::entry::{
    mode_is_exec, mode_is_symlink, DirstateEntry, DirstateV2Data,
    TruncatedTimestamp,
};
use crate::dirstate::path_with_basename::WithBasename;
use crate::errors::{CorruptIndex, DirstateError};
use crate::utils::hg_path::HgPath;
use bitflags::bitflags;
use bytes_cast::unaligned::{U16Be, U32Be};
use bytes_cast::BytesCast;
use std::borrow::Cow;

pub const IGNORE_PATTERNS_HASH_LEN: usize = 20;
pub type IgnorePatternsHash = [u8; IGNORE_PATTERNS_HASH_LEN];

/// Size in bytes of the inline tree metadata carried by the docket.
pub(super) const TREE_METADATA_SIZE: usize = 44;

/// Size in bytes of one node record in the data file.
pub const NODE_SIZE: usize = 44;

/// Make sure that size-affecting changes are made knowingly
#[allow(unused)]
fn static_assert_size_of() {
    let _ = std::mem::transmute::<TreeMetadata, [u8; TREE_METADATA_SIZE]>;
    let _ = std::mem::transmute::<Node, [u8; NODE_SIZE]>;
}

/// Counted in bytes from the start of the data file.
///
/// Data files larger than 4 GiB are not supported.
pub(super) type Offset = U32Be;

/// Counted in number of items.
///
/// More than 4 billion nodes anywhere is not supported.
pub(super) type Size = U32Be;

/// Counted in bytes.
///
/// Paths longer than 64 KiB are not supported.
pub(super) type PathSize = U16Be;

/// A contiguous run of `len` [`Node`]s: the children of some node, or of
/// the repository root.
///
/// Always sorted by ascending base name, to allow binary search. Children
/// of a common parent share their parent path, so comparing base names is
/// enough.
#[derive(BytesCast, Copy, Clone)]
#[repr(C)]
pub(super) struct ChildNodes {
    pub(super) start: Offset,
    pub(super) len: Size,
}

/// A path of `len` bytes, stored without delimiters.
#[derive(BytesCast, Copy, Clone)]
#[repr(C)]
pub(super) struct PathSlice {
    pub(super) start: Offset,
    pub(super) len: PathSize,
}

/// Either nothing if `start == 0`, or a path of `len` bytes.
type OptPathSlice = PathSlice;

/// The tree metadata embedded in the docket: the root pseudo-pointer plus
/// the aggregate counters that must stay exact over the live tree.
#[derive(BytesCast, Copy, Clone)]
#[repr(C)]
pub struct TreeMetadata {
    pub(super) root_nodes: ChildNodes,
    pub(super) nodes_with_entry_count: Size,
    pub(super) nodes_with_copy_source_count: Size,

    /// An upper-bound estimate of how many bytes within `used_size` are no
    /// longer reachable from the root. Only ever grows while appending;
    /// reset to zero by a rewrite to a fresh data file.
    pub(super) unreachable_bytes: Size,

    /// Always zeroed by this version. A future version could assign
    /// meaning to some bits, to be relied on only by versions that know
    /// how to maintain them.
    pub(super) unused: [u8; 4],

    /// If non-zero, a hash of the expanded contents of the root ignore
    /// files that the last `status` run used, as maintained by
    /// `IgnorePatternsHasher`. All-zero means no hash was recorded.
    pub(super) ignore_patterns_hash: IgnorePatternsHash,
}

impl TreeMetadata {
    /// Metadata for an empty tree.
    pub fn empty() -> Self {
        TreeMetadata {
            root_nodes: ChildNodes {
                start: 0.into(),
                len: 0.into(),
            },
            nodes_with_entry_count: 0.into(),
            nodes_with_copy_source_count: 0.into(),
            unreachable_bytes: 0.into(),
            unused: [0; 4],
            ignore_patterns_hash: [0; IGNORE_PATTERNS_HASH_LEN],
        }
    }

    pub fn node_count(&self) -> u32 {
        self.nodes_with_entry_count.get()
    }

    pub fn copy_source_count(&self) -> u32 {
        self.nodes_with_copy_source_count.get()
    }

    pub fn unreachable_bytes(&self) -> u32 {
        self.unreachable_bytes.get()
    }

    pub fn ignore_patterns_hash(&self) -> &IgnorePatternsHash {
        &self.ignore_patterns_hash
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, CorruptIndex> {
        let (meta, _rest) = <Self as BytesCast>::from_bytes(bytes)
            .map_err(|_| CorruptIndex)?;
        Ok(*meta)
    }
}

bitflags! {
    /// The 16-bit flag set of a node record. Bits not listed here are
    /// reserved: ignored when reading, zeroed when the node is next
    /// written.
    #[repr(C)]
    pub(super) struct Flags: u16 {
        const WDIR_TRACKED = 1 << 0;
        const P1_TRACKED = 1 << 1;
        const P2_INFO = 1 << 2;
        const MODE_EXEC_PERM = 1 << 3;
        const MODE_IS_SYMLINK = 1 << 4;
        const HAS_FALLBACK_EXEC = 1 << 5;
        const FALLBACK_EXEC = 1 << 6;
        const HAS_FALLBACK_SYMLINK = 1 << 7;
        const FALLBACK_SYMLINK = 1 << 8;
        const EXPECTED_STATE_IS_MODIFIED = 1 << 9;
        const HAS_MODE_AND_SIZE = 1 << 10;
        const HAS_MTIME = 1 << 11;
        const MTIME_SECOND_AMBIGUOUS = 1 << 12;
        const DIRECTORY = 1 << 13;
        const ALL_UNKNOWN_RECORDED = 1 << 14;
        const ALL_IGNORED_RECORDED = 1 << 15;
    }
}

/// One fixed-size record of the data file.
#[derive(BytesCast)]
#[repr(C)]
pub(super) struct Node {
    pub(super) full_path: PathSlice,

    /// In bytes from `self.full_path.start`: the index right after the
    /// last slash, or zero when the path has a single component.
    pub(super) base_name_start: PathSize,

    pub(super) copy_source: OptPathSlice,
    pub(super) children: ChildNodes,
    pub(super) descendants_with_entry_count: Size,
    pub(super) tracked_descendants_count: Size,
    pub(super) flags: U16Be,

    /// Meaningful only when `HAS_MODE_AND_SIZE` is set.
    pub(super) size: U32Be,

    /// Meaningful only when `HAS_MTIME` is set.
    pub(super) mtime: PackedTruncatedTimestamp,
}

/// Duration since the Unix epoch, truncated like
/// [`TruncatedTimestamp`]. Whether the second is ambiguous is carried by
/// the owning node's `MTIME_SECOND_AMBIGUOUS` flag.
#[derive(BytesCast, Copy, Clone)]
#[repr(C)]
pub(super) struct PackedTruncatedTimestamp {
    truncated_seconds: U32Be,
    nanoseconds: U32Be,
}

impl Node {
    pub(super) fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.flags.get())
    }

    pub(super) fn full_path<'on_disk>(
        &self,
        on_disk: &'on_disk [u8],
    ) -> Result<&'on_disk HgPath, CorruptIndex> {
        read_hg_path(on_disk, self.full_path)
    }

    pub(super) fn base_name_start(&self) -> Result<usize, CorruptIndex> {
        let start = self.base_name_start.get();
        if start <= self.full_path.len.get() {
            Ok(start as usize)
        } else {
            Err(CorruptIndex)
        }
    }

    pub(super) fn base_name<'on_disk>(
        &self,
        on_disk: &'on_disk [u8],
    ) -> Result<&'on_disk HgPath, CorruptIndex> {
        let full_path = self.full_path(on_disk)?;
        let base_name_start = self.base_name_start()?;
        Ok(HgPath::new(&full_path.as_bytes()[base_name_start..]))
    }

    pub(super) fn path<'on_disk>(
        &self,
        on_disk: &'on_disk [u8],
    ) -> Result<dirstate_map::NodeKey<'on_disk>, CorruptIndex> {
        Ok(WithBasename::from_raw_parts(
            Cow::Borrowed(self.full_path(on_disk)?),
            self.base_name_start()?,
        ))
    }

    pub(super) fn has_copy_source(&self) -> bool {
        self.copy_source.start.get() != 0
    }

    pub(super) fn copy_source<'on_disk>(
        &self,
        on_disk: &'on_disk [u8],
    ) -> Result<Option<&'on_disk HgPath>, CorruptIndex> {
        Ok(if self.has_copy_source() {
            Some(read_hg_path(on_disk, self.copy_source)?)
        } else {
            None
        })
    }

    pub(super) fn children<'on_disk>(
        &self,
        on_disk: &'on_disk [u8],
    ) -> Result<&'on_disk [Node], CorruptIndex> {
        read_nodes(on_disk, self.children)
    }

    fn has_entry(&self) -> bool {
        self.flags().intersects(
            Flags::WDIR_TRACKED | Flags::P1_TRACKED | Flags::P2_INFO,
        )
    }

    pub(super) fn node_data(&self) -> Result<NodeData, CorruptIndex> {
        if self.has_entry() {
            Ok(NodeData::Entry(self.assume_entry()?))
        } else {
            // An untracked node may only hold child nodes and,
            // optionally, a cached directory mtime.
            let flags = self.flags();
            if flags.intersects(
                Flags::HAS_MODE_AND_SIZE | Flags::EXPECTED_STATE_IS_MODIFIED,
            ) || self.size.get() != 0
            {
                return Err(CorruptIndex);
            }
            if let Some(cache) = self.cached_directory()? {
                Ok(NodeData::CachedDirectory(cache))
            } else {
                Ok(NodeData::None)
            }
        }
    }

    pub(super) fn cached_directory(
        &self,
    ) -> Result<Option<DirectoryCache>, CorruptIndex> {
        let flags = self.flags();
        if flags.contains(Flags::DIRECTORY | Flags::HAS_MTIME) {
            Ok(Some(DirectoryCache {
                mtime: self.packed_mtime()?,
                all_unknown_recorded: flags
                    .contains(Flags::ALL_UNKNOWN_RECORDED),
                all_ignored_recorded: flags
                    .contains(Flags::ALL_IGNORED_RECORDED),
            }))
        } else {
            Ok(None)
        }
    }

    fn packed_mtime(&self) -> Result<TruncatedTimestamp, CorruptIndex> {
        TruncatedTimestamp::from_already_truncated(
            self.mtime.truncated_seconds.get(),
            self.mtime.nanoseconds.get(),
            self.flags().contains(Flags::MTIME_SECOND_AMBIGUOUS),
        )
    }

    fn assume_entry(&self) -> Result<DirstateEntry, CorruptIndex> {
        let flags = self.flags();
        let mode_size = if flags.contains(Flags::HAS_MODE_AND_SIZE) {
            // The exact permission bits are not stored, only whether the
            // file is executable and whether it is a symlink. Synthesize
            // a mode with the same meaning.
            let mode = if flags.contains(Flags::MODE_EXEC_PERM) {
                0o755
            } else {
                0o644
            };
            let mode = if flags.contains(Flags::MODE_IS_SYMLINK) {
                mode | 0o120000
            } else {
                mode
            };
            Some((mode, self.size.get()))
        } else {
            None
        };
        let mtime = if flags.contains(Flags::HAS_MTIME) {
            Some(self.packed_mtime()?)
        } else {
            None
        };
        let fallback_exec = if flags.contains(Flags::HAS_FALLBACK_EXEC) {
            Some(flags.contains(Flags::FALLBACK_EXEC))
        } else {
            None
        };
        let fallback_symlink = if flags.contains(Flags::HAS_FALLBACK_SYMLINK)
        {
            Some(flags.contains(Flags::FALLBACK_SYMLINK))
        } else {
            None
        };
        Ok(DirstateEntry::from_v2_data(DirstateV2Data {
            wc_tracked: flags.contains(Flags::WDIR_TRACKED),
            p1_tracked: flags.contains(Flags::P1_TRACKED),
            p2_info: flags.contains(Flags::P2_INFO),
            mode_size,
            mtime,
            fallback_exec,
            fallback_symlink,
            expected_state_is_modified: flags
                .contains(Flags::EXPECTED_STATE_IS_MODIFIED),
        }))
    }

    pub(super) fn entry(
        &self,
    ) -> Result<Option<DirstateEntry>, CorruptIndex> {
        if self.has_entry() {
            Ok(Some(self.assume_entry()?))
        } else {
            Ok(None)
        }
    }

    pub(super) fn to_in_memory_node<'on_disk>(
        &self,
        on_disk: &'on_disk [u8],
    ) -> Result<dirstate_map::Node<'on_disk>, CorruptIndex> {
        Ok(dirstate_map::Node {
            children: dirstate_map::ChildNodes::OnDisk(
                self.children(on_disk)?,
            ),
            copy_source: self.copy_source(on_disk)?.map(Cow::Borrowed),
            data: self.node_data()?,
            descendants_with_entry_count: self
                .descendants_with_entry_count
                .get(),
            tracked_descendants_count: self.tracked_descendants_count.get(),
        })
    }

    fn from_dirstate_entry(
        entry: &DirstateEntry,
    ) -> (Flags, U32Be, PackedTruncatedTimestamp) {
        let DirstateV2Data {
            wc_tracked,
            p1_tracked,
            p2_info,
            mode_size,
            mtime,
            fallback_exec,
            fallback_symlink,
            expected_state_is_modified,
        } = entry.v2_data();
        let mut flags = Flags::empty();
        flags.set(Flags::WDIR_TRACKED, wc_tracked);
        flags.set(Flags::P1_TRACKED, p1_tracked);
        flags.set(Flags::P2_INFO, p2_info);
        let size = if let Some((mode, size)) = mode_size {
            flags.insert(Flags::HAS_MODE_AND_SIZE);
            flags.set(Flags::MODE_EXEC_PERM, mode_is_exec(mode));
            flags.set(Flags::MODE_IS_SYMLINK, mode_is_symlink(mode));
            size.into()
        } else {
            0.into()
        };
        let mtime = if let Some(mtime) = mtime {
            flags.insert(Flags::HAS_MTIME);
            flags
                .set(Flags::MTIME_SECOND_AMBIGUOUS, mtime.second_ambiguous());
            mtime.into()
        } else {
            PackedTruncatedTimestamp::null()
        };
        if let Some(exec) = fallback_exec {
            flags.insert(Flags::HAS_FALLBACK_EXEC);
            flags.set(Flags::FALLBACK_EXEC, exec);
        }
        if let Some(symlink) = fallback_symlink {
            flags.insert(Flags::HAS_FALLBACK_SYMLINK);
            flags.set(Flags::FALLBACK_SYMLINK, symlink);
        }
        flags.set(
            Flags::EXPECTED_STATE_IS_MODIFIED,
            expected_state_is_modified,
        );
        (flags, size, mtime)
    }

    fn from_directory_cache(
        cache: &DirectoryCache,
    ) -> (Flags, U32Be, PackedTruncatedTimestamp) {
        let mut flags = Flags::DIRECTORY | Flags::HAS_MTIME;
        flags.set(
            Flags::MTIME_SECOND_AMBIGUOUS,
            cache.mtime.second_ambiguous(),
        );
        flags
            .set(Flags::ALL_UNKNOWN_RECORDED, cache.all_unknown_recorded);
        flags
            .set(Flags::ALL_IGNORED_RECORDED, cache.all_ignored_recorded);
        (flags, 0.into(), cache.mtime.into())
    }
}

impl PackedTruncatedTimestamp {
    fn null() -> Self {
        Self {
            truncated_seconds: 0.into(),
            nanoseconds: 0.into(),
        }
    }
}

impl From<TruncatedTimestamp> for PackedTruncatedTimestamp {
    fn from(timestamp: TruncatedTimestamp) -> Self {
        Self {
            truncated_seconds: timestamp.truncated_seconds().into(),
            nanoseconds: timestamp.nanoseconds().into(),
        }
    }
}

fn read_hg_path(
    on_disk: &[u8],
    slice: PathSlice,
) -> Result<&HgPath, CorruptIndex> {
    read_slice(on_disk, slice.start, slice.len.get()).map(HgPath::new)
}

fn read_nodes(
    on_disk: &[u8],
    slice: ChildNodes,
) -> Result<&[Node], CorruptIndex> {
    read_slice(on_disk, slice.start, slice.len.get())
}

fn read_slice<T, Len>(
    on_disk: &[u8],
    start: Offset,
    len: Len,
) -> Result<&[T], CorruptIndex>
where
    T: BytesCast,
    Len: TryInto<usize>,
{
    // `usize::MAX` would fail the bounds check below, since a single
    // `&[u8]` cannot occupy the entire address space.
    let start = start.get().try_into().unwrap_or(usize::MAX);
    let len = len.try_into().unwrap_or(usize::MAX);
    on_disk
        .get(start..)
        .and_then(|bytes| T::slice_from_bytes(bytes, len).ok())
        .map(|(slice, _rest)| slice)
        .ok_or(CorruptIndex)
}

/// Builds the in-memory tree from a data-file slice already truncated to
/// the docket's `used_size`, and the docket's tree metadata.
pub(super) fn read<'on_disk>(
    on_disk: &'on_disk [u8],
    metadata: &TreeMetadata,
) -> Result<DirstateMap<'on_disk>, CorruptIndex> {
    if on_disk.is_empty() {
        let mut map = DirstateMap::empty(on_disk);
        map.ignore_patterns_hash = metadata.ignore_patterns_hash;
        return Ok(map);
    }
    Ok(DirstateMap {
        on_disk,
        root: dirstate_map::ChildNodes::OnDisk(read_nodes(
            on_disk,
            metadata.root_nodes,
        )?),
        nodes_with_entry_count: metadata.nodes_with_entry_count.get(),
        nodes_with_copy_source_count: metadata
            .nodes_with_copy_source_count
            .get(),
        ignore_patterns_hash: metadata.ignore_patterns_hash,
        unreachable_bytes: metadata.unreachable_bytes.get(),
        old_uuid: None,
    })
}

/// Serializes the tree.
///
/// Returns new data and metadata, together with whether that data should
/// be appended to the existing data file whose content is at
/// `dirstate_map.on_disk` (true), or written to a new data file (false).
pub(super) fn write(
    dirstate_map: &mut DirstateMap,
    can_append: bool,
) -> Result<(Vec<u8>, TreeMetadata, bool), DirstateError> {
    let append = can_append && dirstate_map.write_should_append();
    if !append && can_append {
        log::debug!(
            "dirstate-v2: too many unreachable bytes ({} of {}), \
             rewriting the data file",
            dirstate_map.unreachable_bytes,
            dirstate_map.on_disk.len(),
        );
    }

    // This ignores the space for paths and for nodes without an entry.
    let size_guess =
        NODE_SIZE * dirstate_map.nodes_with_entry_count as usize;

    let mut writer = Writer {
        dirstate_map,
        append,
        out: Vec::with_capacity(size_guess),
    };
    let root_nodes = writer.write_nodes(dirstate_map.root.as_ref())?;
    let out = writer.out;

    if !append {
        // The fresh data file contains the live tree and nothing else.
        dirstate_map.unreachable_bytes = 0;
    }
    let meta = TreeMetadata {
        root_nodes,
        nodes_with_entry_count: dirstate_map.nodes_with_entry_count.into(),
        nodes_with_copy_source_count: dirstate_map
            .nodes_with_copy_source_count
            .into(),
        unreachable_bytes: dirstate_map.unreachable_bytes.into(),
        unused: [0; 4],
        ignore_patterns_hash: dirstate_map.ignore_patterns_hash,
    };
    Ok((out, meta, append))
}

struct Writer<'dmap, 'on_disk> {
    dirstate_map: &'dmap DirstateMap<'on_disk>,
    append: bool,
    out: Vec<u8>,
}

impl Writer<'_, '_> {
    fn write_nodes(
        &mut self,
        nodes: dirstate_map::ChildNodesRef,
    ) -> Result<ChildNodes, DirstateError> {
        // An on-disk sibling run that was never touched keeps its
        // position when appending.
        if self.append {
            if let dirstate_map::ChildNodesRef::OnDisk(nodes_slice) = nodes {
                let start = self
                    .on_disk_offset_of(nodes_slice)
                    .expect("dirstate-v2 on-disk nodes not within the data");
                let len = size_from_usize(nodes_slice.len());
                return Ok(ChildNodes { start, len });
            }
        }

        // In-memory children are stored in a `HashMap` with undefined
        // iteration order. Sort to enable binary search in the written
        // file.
        let nodes = nodes.sorted();
        let nodes_len = nodes.len();

        // First accumulate serialized nodes in a `Vec` …
        let mut on_disk_nodes = Vec::with_capacity(nodes_len);
        for node in nodes {
            let children =
                self.write_nodes(node.children(self.dirstate_map.on_disk)?)?;
            let full_path = node.full_path(self.dirstate_map.on_disk)?;
            let full_path = self.write_path(full_path.as_bytes());
            let copy_source = if let Some(source) =
                node.copy_source(self.dirstate_map.on_disk)?
            {
                self.write_path(source.as_bytes())
            } else {
                PathSlice {
                    start: 0.into(),
                    len: 0.into(),
                }
            };
            on_disk_nodes.push(match node {
                NodeRef::InMemory(path, node) => {
                    let (flags, size, mtime) = match &node.data {
                        NodeData::Entry(entry) => {
                            Node::from_dirstate_entry(entry)
                        }
                        NodeData::CachedDirectory(cache) => {
                            Node::from_directory_cache(cache)
                        }
                        NodeData::None => (
                            Flags::DIRECTORY,
                            0.into(),
                            PackedTruncatedTimestamp::null(),
                        ),
                    };
                    Node {
                        children,
                        copy_source,
                        full_path,
                        base_name_start: u16::try_from(path.base_name_start())
                            // Could only panic for paths over 64 KiB
                            .expect("dirstate-v2 path length overflow")
                            .into(),
                        descendants_with_entry_count: node
                            .descendants_with_entry_count
                            .into(),
                        tracked_descendants_count: node
                            .tracked_descendants_count
                            .into(),
                        flags: flags.bits().into(),
                        size,
                        mtime,
                    }
                }
                NodeRef::OnDisk(node) => Node {
                    children,
                    copy_source,
                    full_path,
                    // Reserved flag bits are not propagated: this version
                    // cannot maintain their meaning.
                    flags: node.flags().bits().into(),
                    ..*node
                },
            })
        }
        // … so we can write them contiguously, after writing everything
        // else they refer to.
        let start = self.current_offset();
        let len = size_from_usize(nodes_len);
        self.out.extend(on_disk_nodes.as_bytes());
        Ok(ChildNodes { start, len })
    }

    /// If the given slice of items is within the mapped data file, returns
    /// its offset from the start of that file.
    fn on_disk_offset_of<T>(&self, slice: &[T]) -> Option<Offset>
    where
        T: BytesCast,
    {
        fn address_range(slice: &[u8]) -> std::ops::RangeInclusive<usize> {
            let start = slice.as_ptr() as usize;
            let end = start + slice.len();
            start..=end
        }
        let slice_addresses = address_range(slice.as_bytes());
        let on_disk_addresses = address_range(self.dirstate_map.on_disk);
        if on_disk_addresses.contains(slice_addresses.start())
            && on_disk_addresses.contains(slice_addresses.end())
        {
            let offset = slice_addresses.start() - on_disk_addresses.start();
            Some(offset_from_usize(offset))
        } else {
            None
        }
    }

    fn current_offset(&mut self) -> Offset {
        let mut offset = self.out.len();
        if self.append {
            offset += self.dirstate_map.on_disk.len()
        }
        offset_from_usize(offset)
    }

    fn write_path(&mut self, slice: &[u8]) -> PathSlice {
        let len = path_len_from_usize(slice.len());
        // Reuse an already-stored path if possible
        if self.append {
            if let Some(start) = self.on_disk_offset_of(slice) {
                return PathSlice { start, len };
            }
        }
        let start = self.current_offset();
        self.out.extend(slice);
        PathSlice { start, len }
    }
}

fn offset_from_usize(x: usize) -> Offset {
    u32::try_from(x)
        // Could only panic for a data file larger than 4 GiB
        .expect("dirstate-v2 offset overflow")
        .into()
}

fn size_from_usize(x: usize) -> Size {
    u32::try_from(x)
        // Could only panic with over 4 billion nodes
        .expect("dirstate-v2 slice length overflow")
        .into()
}

fn path_len_from_usize(x: usize) -> PathSize {
    u16::try_from(x)
        // Could only panic for paths over 64 KiB
        .expect("dirstate-v2 path length overflow")
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(std::mem::size_of::<Node>(), NODE_SIZE);
        assert_eq!(std::mem::size_of::<TreeMetadata>(), TREE_METADATA_SIZE);
        assert_eq!(std::mem::size_of::<PackedTruncatedTimestamp>(), 8);
    }

    #[test]
    fn test_flag_bits_are_stable() {
        // These values are part of the on-disk format and must never
        // change.
        assert_eq!(Flags::WDIR_TRACKED.bits(), 1 << 0);
        assert_eq!(Flags::P1_TRACKED.bits(), 1 << 1);
        assert_eq!(Flags::P2_INFO.bits(), 1 << 2);
        assert_eq!(Flags::MODE_EXEC_PERM.bits(), 1 << 3);
        assert_eq!(Flags::MODE_IS_SYMLINK.bits(), 1 << 4);
        assert_eq!(Flags::HAS_FALLBACK_EXEC.bits(), 1 << 5);
        assert_eq!(Flags::FALLBACK_EXEC.bits(), 1 << 6);
        assert_eq!(Flags::HAS_FALLBACK_SYMLINK.bits(), 1 << 7);
        assert_eq!(Flags::FALLBACK_SYMLINK.bits(), 1 << 8);
        assert_eq!(Flags::EXPECTED_STATE_IS_MODIFIED.bits(), 1 << 9);
        assert_eq!(Flags::HAS_MODE_AND_SIZE.bits(), 1 << 10);
        assert_eq!(Flags::HAS_MTIME.bits(), 1 << 11);
        assert_eq!(Flags::MTIME_SECOND_AMBIGUOUS.bits(), 1 << 12);
        assert_eq!(Flags::DIRECTORY.bits(), 1 << 13);
        assert_eq!(Flags::ALL_UNKNOWN_RECORDED.bits(), 1 << 14);
        assert_eq!(Flags::ALL_IGNORED_RECORDED.bits(), 1 << 15);
    }

    #[test]
    fn test_read_slice_bounds() {
        let buffer = [0_u8; 10];
        // In bounds
        assert!(
            read_slice::<u8, _>(&buffer, 2.into(), 8_u16).is_ok()
        );
        // Runs past the end
        assert!(
            read_slice::<u8, _>(&buffer, 2.into(), 9_u16).is_err()
        );
        // Starts past the end
        assert!(
            read_slice::<u8, _>(&buffer, 11.into(), 0_u16).is_err()
        );
    }
}
