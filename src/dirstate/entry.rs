use crate::errors::CorruptIndex;
use bitflags::bitflags;
use std::fs;
use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

bitflags! {
    /// In-memory representation of the per-file facts tracked by the
    /// dirstate. Independent from the on-disk bit assignment.
    pub(crate) struct Flags: u8 {
        const WDIR_TRACKED = 1 << 0;
        const P1_TRACKED = 1 << 1;
        const P2_INFO = 1 << 2;
        const HAS_FALLBACK_EXEC = 1 << 3;
        const FALLBACK_EXEC = 1 << 4;
        const HAS_FALLBACK_SYMLINK = 1 << 5;
        const FALLBACK_SYMLINK = 1 << 6;
        const EXPECTED_STATE_IS_MODIFIED = 1 << 7;
    }
}

/// The state of a file in the working directory: the cross-product of
/// "tracked in the working directory", "present in the first parent" and
/// "involved in a merge with the second parent", plus cached filesystem
/// metadata.
///
/// `size` and `mtime.truncated_seconds` are truncated to 31 bits.
#[derive(Debug, Copy, Clone)]
pub struct DirstateEntry {
    pub(crate) flags: Flags,
    mode_size: Option<(u32, u32)>,
    mtime: Option<TruncatedTimestamp>,
}

/// The decomposed fields of an entry, used for construction and
/// serialization.
#[derive(Debug, Default, Copy, Clone)]
pub struct DirstateV2Data {
    pub wc_tracked: bool,
    pub p1_tracked: bool,
    pub p2_info: bool,
    pub mode_size: Option<(u32, u32)>,
    pub mtime: Option<TruncatedTimestamp>,
    pub fallback_exec: Option<bool>,
    pub fallback_symlink: Option<bool>,
    /// A previous run already established that the file contents differ
    /// from the parent despite matching cached metadata, so the next
    /// status can report "modified" without re-reading the file.
    pub expected_state_is_modified: bool,
}

pub const NSEC_PER_SEC: u32 = 1_000_000_000;
const RANGE_MASK_31BIT: u32 = 0x7FFF_FFFF;

/// A Unix timestamp with nanosecond precision, with its seconds component
/// truncated to its lower 31 bits.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TruncatedTimestamp {
    truncated_seconds: u32,
    /// Always in `0 .. 1_000_000_000`.
    nanoseconds: u32,
    /// The timestamp was observed in the same filesystem-clock second as
    /// some later event (such as the start of a `status` run), so equal
    /// whole seconds alone are not proof that a file is unchanged.
    second_ambiguous: bool,
}

impl TruncatedTimestamp {
    /// Constructs from a possibly out-of-range timestamp, truncating the
    /// seconds component to its lower 31 bits.
    ///
    /// Panics if the nanoseconds component is out of range.
    pub fn new_truncate(
        seconds: i64,
        nanoseconds: u32,
        second_ambiguous: bool,
    ) -> Self {
        assert!(nanoseconds < NSEC_PER_SEC);
        Self {
            truncated_seconds: seconds as u32 & RANGE_MASK_31BIT,
            nanoseconds,
            second_ambiguous,
        }
    }

    /// Construct from components stored on disk. Returns an error if they
    /// are not in the expected range.
    pub fn from_already_truncated(
        truncated_seconds: u32,
        nanoseconds: u32,
        second_ambiguous: bool,
    ) -> Result<Self, CorruptIndex> {
        if truncated_seconds & !RANGE_MASK_31BIT == 0
            && nanoseconds < NSEC_PER_SEC
        {
            Ok(Self {
                truncated_seconds,
                nanoseconds,
                second_ambiguous,
            })
        } else {
            Err(CorruptIndex)
        }
    }

    pub fn for_mtime_of(metadata: &fs::Metadata) -> io::Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let seconds = metadata.mtime();
            // i64 -> u32 with a value always in `0 .. NSEC_PER_SEC`
            let nanoseconds = metadata.mtime_nsec().try_into().unwrap();
            Ok(Self::new_truncate(seconds, nanoseconds, false))
        }
        #[cfg(not(unix))]
        {
            metadata.modified().map(Self::from)
        }
    }

    /// Like `for_mtime_of`, but returns `None` or a value with
    /// `second_ambiguous` set if the mtime is not usable as a "the file
    /// was clean at this time" cache.
    ///
    /// A modification time can only be cached when it is strictly in the
    /// past relative to `boundary` (the filesystem clock when the caller
    /// started looking): a later write in the same clock tick would
    /// produce the same mtime and go undetected.
    pub fn for_reliable_mtime_of(
        metadata: &fs::Metadata,
        boundary: &Self,
    ) -> io::Result<Option<Self>> {
        Ok(Self::for_mtime_of(metadata)?.for_reliable_mtime_of_self(boundary))
    }

    /// Decide whether `self` can be cached, given the clock `boundary`.
    pub fn for_reliable_mtime_of_self(&self, boundary: &Self) -> Option<Self> {
        let mut new = *self;
        let reliable = if self.truncated_seconds < boundary.truncated_seconds {
            true
        } else if self.truncated_seconds == boundary.truncated_seconds {
            // Same second as the boundary: a racy write right after the
            // walk could reuse this mtime. Only sub-second precision on
            // both sides can still tell such a write apart.
            new.second_ambiguous = true;
            self.nanoseconds != 0
                && boundary.nanoseconds != 0
                && self.nanoseconds < boundary.nanoseconds
        } else {
            // Mtime in the future of the boundary: clock skew, do not
            // trust it.
            false
        };
        if reliable {
            Some(new)
        } else {
            None
        }
    }

    /// The lower 31 bits of the number of seconds since the epoch.
    pub fn truncated_seconds(&self) -> u32 {
        self.truncated_seconds
    }

    /// Always in `0 .. 1_000_000_000`. Zero means "precision unknown".
    pub fn nanoseconds(&self) -> u32 {
        self.nanoseconds
    }

    pub fn second_ambiguous(&self) -> bool {
        self.second_ambiguous
    }

    /// Returns whether two timestamps compare equal modulo 2**31 seconds.
    ///
    /// Sub-second precision is ignored when it is zero on either side,
    /// since many APIs return zero when more precision is not available.
    /// A `second_ambiguous` timestamp never compares equal to a value
    /// without sub-second precision: whole seconds alone cannot
    /// distinguish it from a racy write.
    pub fn likely_equal(self, other: Self) -> bool {
        if self.truncated_seconds != other.truncated_seconds {
            false
        } else if self.nanoseconds == 0 || other.nanoseconds == 0 {
            !self.second_ambiguous
        } else {
            self.nanoseconds == other.nanoseconds
        }
    }

    pub fn likely_equal_to_mtime_of(
        self,
        metadata: &fs::Metadata,
    ) -> io::Result<bool> {
        Ok(self.likely_equal(Self::for_mtime_of(metadata)?))
    }
}

impl From<SystemTime> for TruncatedTimestamp {
    fn from(system_time: SystemTime) -> Self {
        let seconds;
        let nanoseconds;
        match system_time.duration_since(UNIX_EPOCH) {
            Ok(duration) => {
                seconds = duration.as_secs() as i64;
                nanoseconds = duration.subsec_nanos();
            }
            Err(error) => {
                // `system_time` is before the epoch. A duration of
                // `(-4, -0.3)` seconds needs to become `(-5, +0.7)` since
                // nanoseconds always count forward.
                let negative = error.duration();
                let negative_secs = negative.as_secs() as i64;
                let negative_nanos = negative.subsec_nanos();
                if negative_nanos == 0 {
                    seconds = -negative_secs;
                    nanoseconds = 0;
                } else {
                    seconds = -1 - negative_secs;
                    nanoseconds = NSEC_PER_SEC - negative_nanos;
                }
            }
        };
        Self::new_truncate(seconds, nanoseconds, false)
    }
}

impl DirstateEntry {
    pub fn from_v2_data(v2_data: DirstateV2Data) -> Self {
        let DirstateV2Data {
            wc_tracked,
            p1_tracked,
            p2_info,
            mode_size,
            mtime,
            fallback_exec,
            fallback_symlink,
            expected_state_is_modified,
        } = v2_data;
        if let Some((mode, size)) = mode_size {
            // TODO: return an error for out of range values?
            assert!(mode & !RANGE_MASK_31BIT == 0);
            assert!(size & !RANGE_MASK_31BIT == 0);
        }
        let mut flags = Flags::empty();
        flags.set(Flags::WDIR_TRACKED, wc_tracked);
        flags.set(Flags::P1_TRACKED, p1_tracked);
        flags.set(Flags::P2_INFO, p2_info);
        flags.set(
            Flags::EXPECTED_STATE_IS_MODIFIED,
            expected_state_is_modified,
        );
        let mut entry = Self {
            flags,
            mode_size,
            mtime,
        };
        entry.set_fallback_exec(fallback_exec);
        entry.set_fallback_symlink(fallback_symlink);
        entry
    }

    /// Decomposes the entry back into its serializable fields.
    pub fn v2_data(&self) -> DirstateV2Data {
        DirstateV2Data {
            wc_tracked: self.flags.contains(Flags::WDIR_TRACKED),
            p1_tracked: self.flags.contains(Flags::P1_TRACKED),
            p2_info: self.flags.contains(Flags::P2_INFO),
            mode_size: self.mode_size,
            mtime: self.mtime,
            fallback_exec: self.get_fallback_exec(),
            fallback_symlink: self.get_fallback_symlink(),
            expected_state_is_modified: self
                .flags
                .contains(Flags::EXPECTED_STATE_IS_MODIFIED),
        }
    }

    pub fn tracked(&self) -> bool {
        self.flags.contains(Flags::WDIR_TRACKED)
    }

    pub fn p1_tracked(&self) -> bool {
        self.flags.contains(Flags::P1_TRACKED)
    }

    pub fn p2_info(&self) -> bool {
        self.flags.contains(Flags::P2_INFO)
    }

    fn in_either_parent(&self) -> bool {
        self.flags.intersects(Flags::P1_TRACKED | Flags::P2_INFO)
    }

    /// Present in a parent but no longer tracked in the working directory.
    pub fn removed(&self) -> bool {
        self.in_either_parent() && !self.flags.contains(Flags::WDIR_TRACKED)
    }

    /// Tracked in the working directory but in neither parent.
    pub fn added(&self) -> bool {
        self.flags.contains(Flags::WDIR_TRACKED) && !self.in_either_parent()
    }

    /// Known to differ from the first parent: tracked on both sides of a
    /// merge.
    pub fn modified(&self) -> bool {
        self.flags.contains(
            Flags::WDIR_TRACKED | Flags::P1_TRACKED | Flags::P2_INFO,
        )
    }

    /// The entry could be clean, so cached metadata can settle the
    /// question without reading file contents.
    pub fn maybe_clean(&self) -> bool {
        self.flags.contains(Flags::WDIR_TRACKED | Flags::P1_TRACKED)
            && !self.flags.contains(Flags::P2_INFO)
    }

    pub fn any_tracked(&self) -> bool {
        self.flags.intersects(
            Flags::WDIR_TRACKED | Flags::P1_TRACKED | Flags::P2_INFO,
        )
    }

    pub fn mode_size(&self) -> Option<(u32, u32)> {
        self.mode_size
    }

    pub fn truncated_mtime(&self) -> Option<TruncatedTimestamp> {
        self.mtime
    }

    pub fn expected_state_is_modified(&self) -> bool {
        self.flags.contains(Flags::EXPECTED_STATE_IS_MODIFIED)
    }

    /// Records (or clears) the knowledge that this file's contents differ
    /// from the parent even though its cached metadata matches.
    pub fn set_expected_state_is_modified(&mut self, value: bool) {
        self.flags.set(Flags::EXPECTED_STATE_IS_MODIFIED, value);
    }

    pub fn get_fallback_exec(&self) -> Option<bool> {
        if self.flags.contains(Flags::HAS_FALLBACK_EXEC) {
            Some(self.flags.contains(Flags::FALLBACK_EXEC))
        } else {
            None
        }
    }

    pub fn set_fallback_exec(&mut self, value: Option<bool>) {
        match value {
            None => {
                self.flags.remove(Flags::HAS_FALLBACK_EXEC);
                self.flags.remove(Flags::FALLBACK_EXEC);
            }
            Some(exec) => {
                self.flags.insert(Flags::HAS_FALLBACK_EXEC);
                self.flags.set(Flags::FALLBACK_EXEC, exec);
            }
        }
    }

    pub fn get_fallback_symlink(&self) -> Option<bool> {
        if self.flags.contains(Flags::HAS_FALLBACK_SYMLINK) {
            Some(self.flags.contains(Flags::FALLBACK_SYMLINK))
        } else {
            None
        }
    }

    pub fn set_fallback_symlink(&mut self, value: Option<bool>) {
        match value {
            None => {
                self.flags.remove(Flags::HAS_FALLBACK_SYMLINK);
                self.flags.remove(Flags::FALLBACK_SYMLINK);
            }
            Some(symlink) => {
                self.flags.insert(Flags::HAS_FALLBACK_SYMLINK);
                self.flags.set(Flags::FALLBACK_SYMLINK, symlink);
            }
        }
    }

    /// Forget the information brought by a merge in progress.
    pub fn drop_merge_data(&mut self) {
        if self.flags.contains(Flags::P2_INFO) {
            self.flags.remove(Flags::P2_INFO);
            self.mode_size = None;
            self.mtime = None;
        }
    }

    /// Next status must look at the file, metadata notwithstanding.
    pub fn set_possibly_dirty(&mut self) {
        self.mtime = None;
        self.flags.remove(Flags::EXPECTED_STATE_IS_MODIFIED);
    }

    pub fn set_clean(
        &mut self,
        mode: u32,
        size: u32,
        mtime: TruncatedTimestamp,
    ) {
        let size = size & RANGE_MASK_31BIT;
        self.flags.insert(Flags::WDIR_TRACKED | Flags::P1_TRACKED);
        self.flags.remove(Flags::EXPECTED_STATE_IS_MODIFIED);
        self.mode_size = Some((mode, size));
        self.mtime = Some(mtime);
    }

    pub fn set_tracked(&mut self) {
        self.flags.insert(Flags::WDIR_TRACKED);
        // The newly tracked file needs a fresh look from the next status.
        self.mtime = None;
    }

    pub fn set_untracked(&mut self) {
        self.flags.remove(Flags::WDIR_TRACKED);
        self.mode_size = None;
        self.mtime = None;
    }
}

const EXEC_BIT_MASK: u32 = 0o100;
const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

pub(crate) fn mode_is_exec(mode: u32) -> bool {
    mode & EXEC_BIT_MASK != 0
}

pub(crate) fn mode_is_symlink(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

#[cfg(unix)]
pub fn has_exec_bit(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    metadata.mode() & EXEC_BIT_MASK != 0
}

#[cfg(not(unix))]
pub fn has_exec_bit(_metadata: &fs::Metadata) -> bool {
    // There is no comparable permission bit to check; callers are
    // expected to rely on the fallback flags instead.
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(seconds: u32, nanoseconds: u32) -> TruncatedTimestamp {
        TruncatedTimestamp::from_already_truncated(
            seconds,
            nanoseconds,
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_timestamp_range_checks() {
        assert!(TruncatedTimestamp::from_already_truncated(
            1 << 31,
            0,
            false
        )
        .is_err());
        assert!(TruncatedTimestamp::from_already_truncated(
            0,
            NSEC_PER_SEC,
            false
        )
        .is_err());
        assert!(
            TruncatedTimestamp::from_already_truncated(0x7FFF_FFFF, 0, false)
                .is_ok()
        );
    }

    #[test]
    fn test_likely_equal_ignores_missing_precision() {
        assert!(ts(100, 500).likely_equal(ts(100, 500)));
        assert!(ts(100, 500).likely_equal(ts(100, 0)));
        assert!(ts(100, 0).likely_equal(ts(100, 500)));
        assert!(!ts(100, 500).likely_equal(ts(100, 501)));
        assert!(!ts(100, 500).likely_equal(ts(101, 500)));
    }

    #[test]
    fn test_second_ambiguous_needs_subsecond_precision() {
        let ambiguous =
            TruncatedTimestamp::from_already_truncated(100, 500, true)
                .unwrap();
        // Without sub-second precision on the other side, an ambiguous
        // timestamp proves nothing.
        assert!(!ambiguous.likely_equal(ts(100, 0)));
        assert!(ambiguous.likely_equal(ts(100, 500)));
    }

    #[test]
    fn test_reliable_mtime_boundary() {
        // Strictly older second: reliable as-is.
        let t = ts(100, 500).for_reliable_mtime_of_self(&ts(101, 0));
        assert_eq!(t, Some(ts(100, 500)));

        // Same second, smaller nanoseconds: reliable but ambiguous.
        let t = ts(100, 500).for_reliable_mtime_of_self(&ts(100, 600));
        let t = t.unwrap();
        assert!(t.second_ambiguous());

        // Same second without sub-second precision: not reliable.
        assert_eq!(ts(100, 0).for_reliable_mtime_of_self(&ts(100, 0)), None);

        // In the future of the boundary: not reliable.
        assert_eq!(
            ts(101, 0).for_reliable_mtime_of_self(&ts(100, 999)),
            None
        );
    }

    #[test]
    fn test_entry_states() {
        let added = DirstateEntry::from_v2_data(DirstateV2Data {
            wc_tracked: true,
            ..Default::default()
        });
        assert!(added.added() && added.tracked() && !added.removed());

        let removed = DirstateEntry::from_v2_data(DirstateV2Data {
            p1_tracked: true,
            ..Default::default()
        });
        assert!(removed.removed() && !removed.tracked());

        let merged = DirstateEntry::from_v2_data(DirstateV2Data {
            wc_tracked: true,
            p1_tracked: true,
            p2_info: true,
            ..Default::default()
        });
        assert!(merged.modified() && !merged.maybe_clean());

        let clean = DirstateEntry::from_v2_data(DirstateV2Data {
            wc_tracked: true,
            p1_tracked: true,
            mode_size: Some((0o644, 42)),
            mtime: Some(ts(100, 0)),
            ..Default::default()
        });
        assert!(clean.maybe_clean());
        assert_eq!(clean.mode_size(), Some((0o644, 42)));
    }

    #[test]
    fn test_fallback_flags_roundtrip() {
        let mut entry = DirstateEntry::from_v2_data(DirstateV2Data {
            wc_tracked: true,
            ..Default::default()
        });
        assert_eq!(entry.get_fallback_exec(), None);
        entry.set_fallback_exec(Some(true));
        assert_eq!(entry.get_fallback_exec(), Some(true));
        entry.set_fallback_exec(Some(false));
        assert_eq!(entry.get_fallback_exec(), Some(false));
        entry.set_fallback_exec(None);
        assert_eq!(entry.get_fallback_exec(), None);
        assert_eq!(entry.get_fallback_symlink(), None);
    }
}
