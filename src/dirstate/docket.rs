//! The dirstate docket: a small fixed-layout file (`.hg/dirstate`) naming
//! the current data file and carrying the tree metadata.
//!
//! The docket is the only mutable file of the dirstate; it is rewritten
//! whole, through an atomic rename, on every commit. Everything else is
//! append-only, so a reader holding the data file named by a docket it
//! read keeps a self-consistent view no matter what a concurrent writer
//! does.

use crate::dirstate::on_disk::{TreeMetadata, TREE_METADATA_SIZE};
use crate::dirstate::{DirstateParents, NodeId};
use crate::errors::DirstateError;
use bytes_cast::unaligned::U32Be;
use bytes_cast::BytesCast;
use format_bytes::format_bytes;
use rand::Rng;

/// Added at the start of `.hg/dirstate` when the "v2" format is used.
/// This is a redundant sanity check more than an actual "magic number"
/// since `.hg/requires` already governs which format should be used.
pub const V2_FORMAT_MARKER: &[u8; 12] = b"dirstate-v2\n";

/// Number of hex digits in a data file identifier.
const UID_LENGTH: usize = 8;

/// Make sure that size-affecting changes are made knowingly
#[allow(unused)]
fn static_assert_size_of() {
    let _ =
        std::mem::transmute::<DocketHeader, [u8; TREE_METADATA_SIZE + 81]>;
}

#[derive(BytesCast)]
#[repr(C)]
struct DocketHeader {
    marker: [u8; V2_FORMAT_MARKER.len()],
    parent_1: NodeId,
    parent_2: NodeId,
    metadata: TreeMetadata,

    /// Counted in bytes: how much of the data file belongs to the current
    /// generation. The file on disk may be longer (an in-flight append by
    /// a concurrent writer); the excess is ignored.
    data_size: U32Be,

    uuid_size: u8,
}

pub struct Docket<'on_disk> {
    header: &'on_disk DocketHeader,
    pub uuid: &'on_disk [u8],
}

impl<'on_disk> Docket<'on_disk> {
    pub fn parents(&self) -> DirstateParents {
        DirstateParents {
            p1: self.header.parent_1,
            p2: self.header.parent_2,
        }
    }

    pub fn tree_metadata(&self) -> TreeMetadata {
        self.header.metadata
    }

    pub fn data_size(&self) -> usize {
        // This `unwrap` could only panic on a 16-bit CPU
        self.header.data_size.get().try_into().unwrap()
    }

    pub fn data_filename(&self) -> String {
        String::from_utf8(format_bytes!(b"dirstate.{}", self.uuid)).unwrap()
    }

    /// Generates a random identifier for a new data file: 8 lowercase hex
    /// digits.
    pub fn new_uid() -> String {
        let mut id = String::with_capacity(UID_LENGTH);
        let mut rng = rand::thread_rng();
        for _ in 0..UID_LENGTH {
            id.push(std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        }
        id
    }

    /// Assembles the bytes of a new docket.
    ///
    /// Errors if `data_size` does not fit the on-disk representation.
    /// Any reserved trailing bytes a previous writer may have left are
    /// dropped, by construction.
    pub fn serialize(
        parents: DirstateParents,
        tree_metadata: TreeMetadata,
        data_size: u64,
        uuid: &[u8],
    ) -> Result<Vec<u8>, std::num::TryFromIntError> {
        let header = DocketHeader {
            marker: *V2_FORMAT_MARKER,
            parent_1: parents.p1,
            parent_2: parents.p2,
            metadata: tree_metadata,
            data_size: u32::try_from(data_size)?.into(),
            uuid_size: uuid.len().try_into()?,
        };
        let mut bytes = Vec::with_capacity(
            std::mem::size_of::<DocketHeader>() + uuid.len(),
        );
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(uuid);
        Ok(bytes)
    }
}

pub fn read_docket(on_disk: &[u8]) -> Result<Docket<'_>, DirstateError> {
    let (header, rest) = DocketHeader::from_bytes(on_disk)
        .map_err(|_| DirstateError::ShortDocket)?;
    if header.marker != *V2_FORMAT_MARKER {
        return Err(DirstateError::InvalidMagic);
    }
    let uuid_size = header.uuid_size as usize;
    if rest.len() < uuid_size {
        return Err(DirstateError::ShortDocket);
    }
    // Bytes past the identifier are reserved for future versions and
    // ignored.
    Ok(Docket {
        header,
        uuid: &rest[..uuid_size],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docket_size() {
        // 125 bytes of header, then the identifier.
        assert_eq!(std::mem::size_of::<DocketHeader>(), 125);
    }

    #[test]
    fn test_serialize_read_roundtrip() {
        let parents = DirstateParents {
            p1: NodeId::from_hex_prefix(b"12ab").unwrap(),
            p2: NodeId::NULL,
        };
        let bytes = Docket::serialize(
            parents,
            TreeMetadata::empty(),
            0,
            b"0123abcd",
        )
        .unwrap();
        assert_eq!(bytes.len(), 125 + 8);

        let docket = read_docket(&bytes).unwrap();
        assert_eq!(docket.parents(), parents);
        assert_eq!(docket.data_size(), 0);
        assert_eq!(docket.uuid, b"0123abcd");
        assert_eq!(docket.data_filename(), "dirstate.0123abcd");
    }

    #[test]
    fn test_read_errors() {
        assert!(matches!(
            read_docket(b"dirstate-v2\n"),
            Err(DirstateError::ShortDocket)
        ));

        let mut bytes = Docket::serialize(
            DirstateParents::NULL,
            TreeMetadata::empty(),
            0,
            b"deadbeef",
        )
        .unwrap();

        // Truncated identifier
        bytes.pop();
        assert!(matches!(
            read_docket(&bytes),
            Err(DirstateError::ShortDocket)
        ));
        bytes.push(b'f');

        // Trailing reserved bytes are tolerated
        bytes.extend_from_slice(b"reserved for future use");
        assert!(read_docket(&bytes).is_ok());

        // Bad marker
        bytes[0] = b'D';
        assert!(matches!(
            read_docket(&bytes),
            Err(DirstateError::InvalidMagic)
        ));
    }

    #[test]
    fn test_new_uid() {
        let uid = Docket::new_uid();
        assert_eq!(uid.len(), UID_LENGTH);
        assert!(uid.bytes().all(|byte| byte.is_ascii_hexdigit()));
    }
}
