// Copyright 2021-2022 Raphaël Gomès <rgomes@octobus.net>
//           and Mercurial contributors
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2 or any later version.

//! The "dirstate-v2" working-directory state index: a content-addressed,
//! append-only, memory-mappable on-disk tree recording, for every path
//! that is or was tracked, which of the working directory and the two
//! parent changesets know about it, along with cached `stat` output that
//! lets `status` avoid opening unchanged files (and cached directory
//! mtimes that let it avoid `read_dir` for clean subtrees).
//!
//! Two files per repository: a small fixed-layout docket at
//! `.hg/dirstate` naming the current generation, and an append-only data
//! file `.hg/dirstate.{id}`. See the `dirstate::docket` and
//! `dirstate::on_disk` modules for the byte-level format, and
//! `repo::Repo` for the read/commit orchestration.

pub mod dirstate;
pub mod errors;
pub mod repo;
pub mod utils;
pub mod vfs;

// Export very common types to make discovery easier
pub use dirstate::dirstate_map::{DirectoryCache, DirstateMap};
pub use dirstate::owning::OwningDirstateMap;
pub use dirstate::{
    DirstateEntry, DirstateParents, DirstateV2Data, NodeId,
    TruncatedTimestamp,
};
pub use errors::{CorruptIndex, DirstateError};

use std::collections::HashMap;
use twox_hash::RandomXxHashBuilder64;

/// Rust's default hasher is too slow because it tries to prevent
/// collision attacks. We are not concerned about those: if an ill-minded
/// person has write access to your repository, you have other issues.
pub type FastHashMap<K, V> = HashMap<K, V, RandomXxHashBuilder64>;
