// dirstate module
//
// Copyright 2019 Raphaël Gomès <rgomes@octobus.net>
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2 or any later version.

use crate::errors::CorruptIndex;
use crate::utils::hg_path::HgPath;
use bytes_cast::BytesCast;
use std::fmt;

pub mod dirstate_map;
pub mod docket;
pub mod entry;
pub mod on_disk;
pub mod owning;
pub mod path_with_basename;
pub mod status;

pub use self::entry::{DirstateEntry, DirstateV2Data, TruncatedTimestamp};

/// Keep space for 256-bit hashes
pub const STORED_NODE_ID_BYTES: usize = 32;

/// A changeset identifier, as stored in the docket: a natural identifier
/// (20 bytes for SHA-1) left-aligned in 32 bytes, zero-padded.
#[derive(BytesCast, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct NodeId([u8; STORED_NODE_ID_BYTES]);

impl NodeId {
    pub const NULL: Self = Self([0; STORED_NODE_ID_BYTES]);

    /// Pads a shorter natural identifier with trailing zeroes.
    ///
    /// Returns `None` for identifiers longer than the stored width.
    pub fn from_id_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > STORED_NODE_ID_BYTES {
            return None;
        }
        let mut id = [0; STORED_NODE_ID_BYTES];
        id[..bytes.len()].copy_from_slice(bytes);
        Some(Self(id))
    }

    /// Like `from_id_bytes`, from hexadecimal digits.
    pub fn from_hex_prefix(hex: &[u8]) -> Option<Self> {
        fn nibble(digit: u8) -> Option<u8> {
            (digit as char).to_digit(16).map(|d| d as u8)
        }
        if hex.len() % 2 != 0 || hex.len() / 2 > STORED_NODE_ID_BYTES {
            return None;
        }
        let mut id = [0; STORED_NODE_ID_BYTES];
        for (i, pair) in hex.chunks(2).enumerate() {
            id[i] = (nibble(pair[0])? << 4) | nibble(pair[1])?;
        }
        Some(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; STORED_NODE_ID_BYTES] {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// The two changesets the working directory is based on: the checked-out
/// parent and, during a merge, the merged-in one (null otherwise).
#[derive(Debug, PartialEq, Eq, Copy, Clone, BytesCast)]
#[repr(C)]
pub struct DirstateParents {
    pub p1: NodeId,
    pub p2: NodeId,
}

impl DirstateParents {
    pub const NULL: Self = Self {
        p1: NodeId::NULL,
        p2: NodeId::NULL,
    };

    pub fn is_merge(&self) -> bool {
        self.p2 != NodeId::NULL
    }
}

pub type StateMapIter<'a> = Box<
    dyn Iterator<Item = Result<(&'a HgPath, DirstateEntry), CorruptIndex>>
        + Send
        + 'a,
>;

pub type CopyMapIter<'a> = Box<
    dyn Iterator<Item = Result<(&'a HgPath, &'a HgPath), CorruptIndex>>
        + Send
        + 'a,
>;
