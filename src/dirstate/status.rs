//! The working-directory walk that `status` drives against the dirstate
//! tree: the filesystem and the tree are traversed together, and cached
//! metadata settles most files without opening them.
//!
//! The ignore-pattern *parser* is an external collaborator: the caller
//! hands in a predicate built from the patterns, plus (optionally) the
//! hash of the pattern corpus maintained with [`IgnorePatternsHasher`].
//! Directory-level caches recorded by a previous run are only honoured
//! when that hash still matches.

use crate::dirstate::dirstate_map::{
    ChildNodesRef, DirectoryCache, DirstateMap, NodeRef,
};
use crate::dirstate::entry::{
    has_exec_bit, mode_is_exec, mode_is_symlink, TruncatedTimestamp,
};
use crate::dirstate::on_disk::{
    IgnorePatternsHash, IGNORE_PATTERNS_HASH_LEN,
};
use crate::errors::CorruptIndex;
use crate::utils::get_bytes_from_os_string;
use crate::utils::hg_path::{HgPath, HgPathBuf};
use rayon::prelude::*;
use sha1::{Digest, Sha1};
use std::borrow::Cow;
use std::fmt;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

/// Returns whether the given path is ignored, according to patterns this
/// crate never parses itself.
pub type IgnoreFnType<'a> =
    Box<dyn for<'r> Fn(&'r HgPath) -> bool + Sync + 'a>;

/// The ignore state established by the caller's pattern parser for this
/// run.
pub struct IgnoreConfig<'a> {
    pub ignore_fn: IgnoreFnType<'a>,

    /// Hash of the expanded contents of the root ignore files behind
    /// `ignore_fn`, from [`IgnorePatternsHasher`]. `None` (or all-zero)
    /// disables every recorded-hint optimisation for this run.
    pub patterns_hash: Option<IgnorePatternsHash>,
}

impl Default for IgnoreConfig<'_> {
    /// Nothing is ignored, and directory hints cannot be trusted.
    fn default() -> Self {
        IgnoreConfig {
            ignore_fn: Box::new(|_| false),
            patterns_hash: None,
        }
    }
}

/// Incremental hasher for the ignore-pattern corpus: the concatenation,
/// in sorted root-file order, of the expanded contents of each root
/// ignore file. Feeding chunks as they are read means the concatenation
/// is never materialised.
#[derive(Default)]
pub struct IgnorePatternsHasher {
    hasher: Sha1,
}

impl IgnorePatternsHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of expanded contents.
    pub fn write(&mut self, file_chunk: &[u8]) {
        self.hasher.update(file_chunk)
    }

    pub fn finish(self) -> IgnorePatternsHash {
        self.hasher.finalize().into()
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct StatusOptions {
    /// Whether the filesystem supports exec permissions worth comparing.
    pub check_exec: bool,
    pub list_clean: bool,
    pub list_unknown: bool,
    pub list_ignored: bool,
    /// Whether to collect traversed dirs for applying a caller-side
    /// cache to them.
    pub collect_traversed_dirs: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BadMatch {
    OsError(i32),
}

/// What the walk concluded about each path it considered.
#[derive(Debug, Default)]
pub struct DirstateStatus<'on_disk> {
    pub modified: Vec<Cow<'on_disk, HgPath>>,
    pub added: Vec<Cow<'on_disk, HgPath>>,
    pub removed: Vec<Cow<'on_disk, HgPath>>,
    /// Tracked but missing from the filesystem.
    pub deleted: Vec<Cow<'on_disk, HgPath>>,
    pub clean: Vec<Cow<'on_disk, HgPath>>,
    pub ignored: Vec<Cow<'on_disk, HgPath>>,
    pub unknown: Vec<Cow<'on_disk, HgPath>>,

    /// Cached metadata was inconclusive: the caller must compare file
    /// contents, then record the verdict with
    /// [`DirstateMap::set_clean`] or
    /// [`DirstateMap::set_expected_state_is_modified`].
    pub unsure: Vec<Cow<'on_disk, HgPath>>,

    /// Paths that could not be examined at all.
    pub bad: Vec<(Cow<'on_disk, HgPath>, BadMatch)>,

    /// Only filled when `collect_traversed_dirs` is set.
    pub traversed: Vec<Cow<'on_disk, HgPath>>,
}

#[derive(Debug, derive_more::From)]
pub enum StatusError {
    #[from]
    CorruptIndex(CorruptIndex),
    #[from]
    IO(io::Error),
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StatusError::CorruptIndex(error) => error.fmt(f),
            StatusError::IO(error) => error.fmt(f),
        }
    }
}

/// Compares the working directory against the dirstate tree.
///
/// The tree is traversed together with `read_dir` results, in base-name
/// order, so that each side is visited once. Directories whose cached
/// mtime and recorded hints still hold are not `read_dir`ed at all:
/// their stored children are statted individually instead.
///
/// On the way out, stale directory caches are cleared and fresh ones
/// recorded, so the next run starts from what this one learned.
pub fn status<'on_disk>(
    dmap: &mut DirstateMap<'on_disk>,
    root_dir: &Path,
    ignore: IgnoreConfig,
    options: StatusOptions,
) -> Result<DirstateStatus<'on_disk>, StatusError> {
    let zero_hash = [0; IGNORE_PATTERNS_HASH_LEN];
    let new_hash = match ignore.patterns_hash {
        Some(hash) if hash != zero_hash => Some(hash),
        _ => None,
    };
    let stored_hash = *dmap.ignore_patterns_hash();
    let ignore_patterns_have_changed = match new_hash {
        Some(hash) => stored_hash == zero_hash || stored_hash != hash,
        // Without a hash for this run, recorded hints cannot be
        // validated.
        None => true,
    };
    if ignore_patterns_have_changed && stored_hash != zero_hash {
        log::debug!(
            "dirstate-v2: ignore patterns changed, \
             directory caches are disabled for this run"
        );
    }

    // The probe file goes under `.hg` so the walk below never sees it.
    let filesystem_time_at_status_start = filesystem_now(&root_dir.join(".hg"))
        .ok()
        .map(TruncatedTimestamp::from);

    let common = StatusCommon {
        dmap: &*dmap,
        options,
        ignore_fn: ignore.ignore_fn,
        ignore_patterns_have_changed,
        can_record_hints: new_hash.is_some(),
        filesystem_time_at_status_start,
        outcome: Mutex::new(DirstateStatus::default()),
        outdated_cached_directories: Mutex::new(Vec::new()),
        new_cacheable_directories: Mutex::new(Vec::new()),
    };
    common.traverse_fs_directory_and_dirstate(
        false,
        dmap.root.as_ref(),
        HgPath::new(""),
        root_dir,
        None,
        None,
        true,
    )?;
    let outdated = common.outdated_cached_directories.into_inner().unwrap();
    let new_cacheable =
        common.new_cacheable_directories.into_inner().unwrap();
    let outcome = common.outcome.into_inner().unwrap();

    for path in outdated {
        dmap.clear_cached_directory(&path)?;
    }
    for (path, cache) in new_cacheable {
        dmap.set_cached_directory(&path, cache)?;
    }
    if let Some(hash) = new_hash {
        dmap.set_ignore_patterns_hash(hash);
    }
    Ok(outcome)
}

/// Bag of random things needed by various parts of the traversal. Reduces
/// the number of parameters passed to functions.
struct StatusCommon<'a, 'tree, 'on_disk: 'tree> {
    dmap: &'tree DirstateMap<'on_disk>,
    options: StatusOptions,
    ignore_fn: IgnoreFnType<'a>,
    ignore_patterns_have_changed: bool,
    /// Whether hints recorded this run can be validated by a later one
    /// (requires a pattern hash for this run).
    can_record_hints: bool,
    filesystem_time_at_status_start: Option<TruncatedTimestamp>,
    outcome: Mutex<DirstateStatus<'on_disk>>,

    /// Directory caches found stale during the walk, to be cleared.
    outdated_cached_directories: Mutex<Vec<HgPathBuf>>,
    /// Directories whose `read_dir` fully reconciled, to be cached.
    new_cacheable_directories: Mutex<Vec<(HgPathBuf, DirectoryCache)>>,
}

impl<'a, 'tree, 'on_disk> StatusCommon<'a, 'tree, 'on_disk> {
    fn read_dir(
        &self,
        hg_path: &HgPath,
        fs_path: &Path,
        is_at_repo_root: bool,
    ) -> Result<Vec<DirEntry>, ()> {
        DirEntry::read_dir(fs_path, is_at_repo_root).map_err(|error| {
            let errno = error.raw_os_error().expect("expected real OS error");
            self.outcome
                .lock()
                .unwrap()
                .bad
                .push((hg_path.to_owned().into(), BadMatch::OsError(errno)))
        })
    }

    /// Whether a directory's cache lets this run skip its `read_dir`.
    /// Stale caches are queued for clearing as a side effect.
    fn can_skip_fs_readdir(
        &self,
        directory_hg_path: &HgPath,
        directory_metadata: Option<&std::fs::Metadata>,
        cached_directory: DirectoryCache,
    ) -> bool {
        if self.ignore_patterns_have_changed {
            // What used to be ignored may now be unknown: the recorded
            // hints no longer mean anything.
            self.outdated_cached_directories
                .lock()
                .unwrap()
                .push(directory_hg_path.to_owned());
            return false;
        }
        let mtime_matches = directory_metadata
            .and_then(|metadata| {
                TruncatedTimestamp::for_mtime_of(metadata).ok()
            })
            .map_or(false, |fs_mtime| {
                cached_directory.mtime.likely_equal(fs_mtime)
            });
        if !mtime_matches {
            self.outdated_cached_directories
                .lock()
                .unwrap()
                .push(directory_hg_path.to_owned());
            return false;
        }
        // The cache is valid; it is only *useful* if it covers what this
        // run must list.
        (!self.options.list_unknown || cached_directory.all_unknown_recorded)
            && (!self.options.list_ignored
                || cached_directory.all_ignored_recorded)
    }

    #[allow(clippy::too_many_arguments)]
    fn traverse_fs_directory_and_dirstate(
        &self,
        has_ignored_ancestor: bool,
        dirstate_nodes: ChildNodesRef<'tree, 'on_disk>,
        directory_hg_path: &HgPath,
        directory_fs_path: &Path,
        directory_metadata: Option<&std::fs::Metadata>,
        cached_directory: Option<DirectoryCache>,
        is_at_repo_root: bool,
    ) -> Result<(), CorruptIndex> {
        if let Some(cache) = cached_directory {
            if self.can_skip_fs_readdir(
                directory_hg_path,
                directory_metadata,
                cache,
            ) {
                return self.traverse_dirstate_children_with_stat(
                    has_ignored_ancestor,
                    dirstate_nodes,
                    directory_fs_path,
                );
            }
        }

        let mut fs_entries = if let Ok(entries) = self.read_dir(
            directory_hg_path,
            directory_fs_path,
            is_at_repo_root,
        ) {
            entries
        } else {
            return Ok(());
        };

        // `merge_join_by` requires both its input iterators to be sorted:
        let dirstate_nodes = dirstate_nodes.sorted();
        // `sort_unstable_by_key` does not allow keys borrowing from the
        // value: https://github.com/rust-lang/rust/issues/34162
        fs_entries.sort_unstable_by(|e1, e2| e1.base_name.cmp(&e2.base_name));

        // Propagate here any error that would happen inside the
        // comparison callback below
        for dirstate_node in &dirstate_nodes {
            dirstate_node.base_name(self.dmap.on_disk)?;
        }

        // A direct child without a dirstate node makes this directory
        // uncacheable for the corresponding view.
        let has_unrecorded_unknown = AtomicBool::new(false);
        let has_unrecorded_ignored = AtomicBool::new(false);

        itertools::merge_join_by(
            dirstate_nodes,
            &fs_entries,
            |dirstate_node, fs_entry| {
                // This `unwrap` never panics since we already propagated
                // those errors above
                dirstate_node
                    .base_name(self.dmap.on_disk)
                    .unwrap()
                    .cmp(&fs_entry.base_name)
            },
        )
        .par_bridge()
        .map(|pair| {
            use itertools::EitherOrBoth::*;
            match pair {
                Both(dirstate_node, fs_entry) => self
                    .traverse_fs_and_dirstate(
                        fs_entry,
                        dirstate_node,
                        has_ignored_ancestor,
                    ),
                Left(dirstate_node) => {
                    self.traverse_dirstate_only(dirstate_node)
                }
                Right(fs_entry) => {
                    let hg_path =
                        directory_hg_path.join(&fs_entry.base_name);
                    let is_ignored = has_ignored_ancestor
                        || (self.ignore_fn)(&hg_path);
                    if is_ignored {
                        has_unrecorded_ignored
                            .store(true, Ordering::Relaxed);
                    } else {
                        has_unrecorded_unknown
                            .store(true, Ordering::Relaxed);
                    }
                    self.traverse_fs_only(is_ignored, hg_path, fs_entry);
                    Ok(())
                }
            }
        })
        .collect::<Result<(), CorruptIndex>>()?;

        // Cannot cache the repository root: it has no node to hang the
        // cache on.
        if !is_at_repo_root {
            self.consider_caching_directory(
                directory_hg_path,
                directory_metadata,
                has_unrecorded_unknown.into_inner(),
                has_unrecorded_ignored.into_inner(),
            );
        }
        Ok(())
    }

    /// After a fully reconciled `read_dir`, record what the next run may
    /// rely on.
    fn consider_caching_directory(
        &self,
        directory_hg_path: &HgPath,
        directory_metadata: Option<&std::fs::Metadata>,
        has_unrecorded_unknown: bool,
        has_unrecorded_ignored: bool,
    ) {
        // Unknown files must have been looked for, and all found ones
        // must have dirstate nodes, otherwise skipping `read_dir` next
        // time would lose them.
        if !self.options.list_unknown
            || !self.can_record_hints
            || has_unrecorded_unknown
        {
            return;
        }
        let boundary = match &self.filesystem_time_at_status_start {
            Some(boundary) => boundary,
            None => return,
        };
        let mtime = directory_metadata.and_then(|metadata| {
            TruncatedTimestamp::for_reliable_mtime_of(metadata, boundary)
                .ok()
                .flatten()
        });
        if let Some(mtime) = mtime {
            let cache = DirectoryCache {
                mtime,
                all_unknown_recorded: true,
                all_ignored_recorded: !has_unrecorded_ignored,
            };
            self.new_cacheable_directories
                .lock()
                .unwrap()
                .push((directory_hg_path.to_owned(), cache));
        }
    }

    /// Skipping `read_dir`: the stored children are the directory
    /// listing, but each still needs its own `stat`.
    fn traverse_dirstate_children_with_stat(
        &self,
        has_ignored_ancestor: bool,
        dirstate_nodes: ChildNodesRef<'tree, 'on_disk>,
        directory_fs_path: &Path,
    ) -> Result<(), CorruptIndex> {
        dirstate_nodes
            .sorted()
            .into_par_iter()
            .map(|dirstate_node| {
                let base_name = dirstate_node.base_name(self.dmap.on_disk)?;
                let fs_path = base_name.to_fs_path(directory_fs_path);
                match std::fs::symlink_metadata(&fs_path) {
                    Ok(metadata) => {
                        let fs_entry = DirEntry {
                            base_name: base_name.to_owned(),
                            full_path: fs_path,
                            metadata,
                        };
                        self.traverse_fs_and_dirstate(
                            &fs_entry,
                            dirstate_node,
                            has_ignored_ancestor,
                        )
                    }
                    Err(error)
                        if error.kind() == io::ErrorKind::NotFound =>
                    {
                        self.traverse_dirstate_only(dirstate_node)
                    }
                    Err(error) => {
                        let hg_path = dirstate_node
                            .full_path_borrowed(self.dmap.on_disk)?;
                        let errno = error
                            .raw_os_error()
                            .expect("expected real OS error");
                        self.outcome
                            .lock()
                            .unwrap()
                            .bad
                            .push((hg_path, BadMatch::OsError(errno)));
                        Ok(())
                    }
                }
            })
            .collect()
    }

    fn traverse_fs_and_dirstate(
        &self,
        fs_entry: &DirEntry,
        dirstate_node: NodeRef<'tree, 'on_disk>,
        has_ignored_ancestor: bool,
    ) -> Result<(), CorruptIndex> {
        let hg_path =
            dirstate_node.full_path_borrowed(self.dmap.on_disk)?;
        let file_type = fs_entry.metadata.file_type();
        let file_or_symlink = file_type.is_file() || file_type.is_symlink();
        if !file_or_symlink {
            // If we previously had a file here, it was removed (with
            // `hg rm` or similar) or deleted before it could be replaced
            // by a directory or something else.
            self.mark_removed_or_deleted_if_file(&hg_path, dirstate_node)?;
        }
        if file_type.is_dir() {
            if self.options.collect_traversed_dirs {
                self.outcome
                    .lock()
                    .unwrap()
                    .traversed
                    .push(hg_path.clone());
            }
            let is_ignored =
                has_ignored_ancestor || (self.ignore_fn)(&hg_path);
            self.traverse_fs_directory_and_dirstate(
                is_ignored,
                dirstate_node.children(self.dmap.on_disk)?,
                &hg_path,
                &fs_entry.full_path,
                Some(&fs_entry.metadata),
                dirstate_node.cached_directory()?,
                false,
            )?;
        } else {
            if file_or_symlink {
                if let Some(entry) = dirstate_node.entry()? {
                    if !entry.tracked() {
                        self.outcome
                            .lock()
                            .unwrap()
                            .removed
                            .push(hg_path.clone())
                    } else if entry.added() {
                        self.outcome
                            .lock()
                            .unwrap()
                            .added
                            .push(hg_path.clone())
                    } else if entry.modified() {
                        self.outcome
                            .lock()
                            .unwrap()
                            .modified
                            .push(hg_path.clone())
                    } else if entry.p2_info() {
                        // From the merged-in parent only: known to differ
                        // from p1.
                        self.outcome
                            .lock()
                            .unwrap()
                            .modified
                            .push(hg_path.clone())
                    } else {
                        self.handle_maybe_clean_file(
                            hg_path.clone(),
                            &entry,
                            dirstate_node,
                            fs_entry,
                        )?;
                    }
                } else {
                    // The node is a directory of the tree, but the
                    // filesystem has a file
                    self.mark_unknown_or_ignored(
                        has_ignored_ancestor,
                        hg_path.clone(),
                    );
                }
            }

            for child_node in
                dirstate_node.children(self.dmap.on_disk)?.iter()
            {
                self.traverse_dirstate_only(child_node)?;
            }
        }
        Ok(())
    }

    /// A file that could be clean: settle it from `stat` output alone if
    /// possible.
    fn handle_maybe_clean_file(
        &self,
        hg_path: Cow<'on_disk, HgPath>,
        entry: &crate::dirstate::DirstateEntry,
        dirstate_node: NodeRef<'tree, 'on_disk>,
        fs_entry: &DirEntry,
    ) -> Result<(), CorruptIndex> {
        // Keep the low 31 bits
        fn truncate_u64(value: u64) -> u32 {
            (value & 0x7FFF_FFFF) as u32
        }

        if dirstate_node.copy_source(self.dmap.on_disk)?.is_some() {
            self.outcome.lock().unwrap().modified.push(hg_path);
            return Ok(());
        }
        let (mode, size) = match entry.mode_size() {
            Some(mode_size) => mode_size,
            None => {
                self.outcome.lock().unwrap().unsure.push(hg_path);
                return Ok(());
            }
        };
        let fs_is_symlink = fs_entry.metadata.file_type().is_symlink();
        let size_changed = size != truncate_u64(fs_entry.metadata.len());
        if fs_is_symlink != mode_is_symlink(mode) {
            self.outcome.lock().unwrap().modified.push(hg_path);
        } else if size_changed && fs_is_symlink {
            // issue6456: the reported length of a symlink may be inflated
            // by encryption (EXT4 fscrypt), so it proves nothing.
            self.outcome.lock().unwrap().unsure.push(hg_path);
        } else if size_changed {
            self.outcome.lock().unwrap().modified.push(hg_path);
        } else if self.options.check_exec
            && has_exec_bit(&fs_entry.metadata) != mode_is_exec(mode)
        {
            self.outcome.lock().unwrap().modified.push(hg_path);
        } else {
            let mtime_matches = match entry.truncated_mtime() {
                Some(mtime) => {
                    match TruncatedTimestamp::for_mtime_of(&fs_entry.metadata)
                    {
                        Ok(fs_mtime) => mtime.likely_equal(fs_mtime),
                        Err(_) => false,
                    }
                }
                None => false,
            };
            if !mtime_matches {
                self.outcome.lock().unwrap().unsure.push(hg_path);
            } else if entry.expected_state_is_modified() {
                // Contents were already compared by a previous run and
                // found to differ.
                self.outcome.lock().unwrap().modified.push(hg_path);
            } else if self.options.list_clean {
                self.outcome.lock().unwrap().clean.push(hg_path);
            }
        }
        Ok(())
    }

    /// A node in the dirstate tree has no corresponding filesystem entry
    fn traverse_dirstate_only(
        &self,
        dirstate_node: NodeRef<'tree, 'on_disk>,
    ) -> Result<(), CorruptIndex> {
        let hg_path =
            dirstate_node.full_path_borrowed(self.dmap.on_disk)?;
        self.mark_removed_or_deleted_if_file(&hg_path, dirstate_node)?;
        dirstate_node
            .children(self.dmap.on_disk)?
            .sorted()
            .into_par_iter()
            .map(|child_node| self.traverse_dirstate_only(child_node))
            .collect()
    }

    /// A node with no corresponding *file* on the filesystem: does
    /// nothing on a "directory" node.
    fn mark_removed_or_deleted_if_file(
        &self,
        hg_path: &Cow<'on_disk, HgPath>,
        dirstate_node: NodeRef<'tree, 'on_disk>,
    ) -> Result<(), CorruptIndex> {
        if let Some(entry) = dirstate_node.entry()? {
            if entry.removed() {
                self.outcome
                    .lock()
                    .unwrap()
                    .removed
                    .push(hg_path.clone())
            } else {
                self.outcome
                    .lock()
                    .unwrap()
                    .deleted
                    .push(hg_path.clone())
            }
        }
        Ok(())
    }

    /// Something on the filesystem has no corresponding dirstate node.
    fn traverse_fs_only(
        &self,
        is_ignored: bool,
        hg_path: HgPathBuf,
        fs_entry: &DirEntry,
    ) {
        let file_type = fs_entry.metadata.file_type();
        let file_or_symlink = file_type.is_file() || file_type.is_symlink();
        if file_type.is_dir() {
            let traverse_children = if is_ignored {
                // Descendants of an ignored directory are all ignored
                self.options.list_ignored
            } else {
                // Descendants of an unknown directory may be either
                // unknown or ignored
                self.options.list_unknown || self.options.list_ignored
            };
            if traverse_children {
                if let Ok(children_fs_entries) =
                    self.read_dir(&hg_path, &fs_entry.full_path, false)
                {
                    children_fs_entries.par_iter().for_each(
                        |child_fs_entry| {
                            let child_hg_path =
                                hg_path.join(&child_fs_entry.base_name);
                            let child_is_ignored = is_ignored
                                || (self.ignore_fn)(&child_hg_path);
                            self.traverse_fs_only(
                                child_is_ignored,
                                child_hg_path,
                                child_fs_entry,
                            )
                        },
                    )
                }
            }
            if self.options.collect_traversed_dirs {
                self.outcome
                    .lock()
                    .unwrap()
                    .traversed
                    .push(Cow::Owned(hg_path))
            }
        } else if file_or_symlink {
            self.mark_unknown_or_ignored_known(
                is_ignored,
                Cow::Owned(hg_path),
            )
        }
    }

    fn mark_unknown_or_ignored(
        &self,
        has_ignored_ancestor: bool,
        hg_path: Cow<'on_disk, HgPath>,
    ) {
        let is_ignored =
            has_ignored_ancestor || (self.ignore_fn)(&hg_path);
        self.mark_unknown_or_ignored_known(is_ignored, hg_path)
    }

    fn mark_unknown_or_ignored_known(
        &self,
        is_ignored: bool,
        hg_path: Cow<'on_disk, HgPath>,
    ) {
        if is_ignored {
            if self.options.list_ignored {
                self.outcome.lock().unwrap().ignored.push(hg_path)
            }
        } else if self.options.list_unknown {
            self.outcome.lock().unwrap().unknown.push(hg_path)
        }
    }
}

/// Samples the filesystem clock by writing a throwaway file: the mtime it
/// gets is the boundary under which cached mtimes are trustworthy.
fn filesystem_now(repo_root: &Path) -> Result<SystemTime, io::Error> {
    let mut temp = tempfile::NamedTempFile::new_in(repo_root)?;
    temp.flush()?;
    temp.as_file().metadata()?.modified()
}

struct DirEntry {
    base_name: HgPathBuf,
    full_path: PathBuf,
    metadata: std::fs::Metadata,
}

impl DirEntry {
    /// Returns **unsorted** entries in the given directory, with name and
    /// metadata.
    ///
    /// If a `.hg` sub-directory is encountered:
    ///
    /// * At the repository root, ignore that sub-directory
    /// * Elsewhere, we're listing the content of a sub-repo. Return an
    ///   empty list instead.
    fn read_dir(path: &Path, is_at_repo_root: bool) -> io::Result<Vec<Self>> {
        let mut results = Vec::new();
        for entry in path.read_dir()? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            let name = get_bytes_from_os_string(entry.file_name());
            if name == b".hg" {
                if is_at_repo_root {
                    // Skip the repository's own .hg (might be a symlink)
                    continue;
                } else if metadata.is_dir() {
                    // A .hg sub-directory at another location means a
                    // subrepo, skip it entirely.
                    return Ok(Vec::new());
                }
            }
            results.push(DirEntry {
                base_name: HgPathBuf::from(name),
                full_path: entry.path(),
                metadata,
            })
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hasher_is_incremental() {
        let mut all_at_once = IgnorePatternsHasher::new();
        all_at_once.write(b"*.orig\nsyntax: glob\nbuild/");
        let mut chunked = IgnorePatternsHasher::new();
        chunked.write(b"*.orig\n");
        chunked.write(b"syntax: glob\n");
        chunked.write(b"build/");
        assert_eq!(all_at_once.finish(), chunked.finish());
    }

    #[test]
    fn test_hasher_matches_sha1() {
        let mut hasher = IgnorePatternsHasher::new();
        hasher.write(b"");
        // SHA-1 of the empty string
        assert_eq!(
            hasher.finish(),
            [
                0xda, 0x39, 0xa3, 0xee, 0x5e, 0x6b, 0x4b, 0x0d, 0x32, 0x55,
                0xbf, 0xef, 0x95, 0x60, 0x18, 0x90, 0xaf, 0xd8, 0x07, 0x09,
            ]
        );
    }
}
