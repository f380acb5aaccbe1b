use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// An invariant of the dirstate data file or its tree metadata does not
/// hold: out-of-range pseudo-pointer, bad length, nanoseconds not below
/// one billion, or an impossible flag combination.
///
/// This should only happen if the writing side is buggy or the repository
/// is corrupted. The indexed state cannot be trusted anymore; callers are
/// expected to rebuild it by re-scanning the working directory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CorruptIndex;

impl fmt::Display for CorruptIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "dirstate-v2 parse error")
    }
}

/// Common error type for everything that can go wrong when reading or
/// writing a dirstate.
///
/// The first four variants are fatal for this dirstate: partial recovery is
/// never attempted, the caller should fall back to a full working-directory
/// scan. I/O errors are propagated unchanged, with some context about the
/// operation that failed.
#[derive(Debug, derive_more::From)]
pub enum DirstateError {
    /// The docket does not start with the expected format marker.
    InvalidMagic,

    /// The docket is smaller than its fixed layout requires.
    ShortDocket,

    #[from]
    CorruptIndex(CorruptIndex),

    /// The docket names a data file that does not exist.
    UnknownIdentifier { uid: Vec<u8> },

    #[from]
    Io(IoError),

    /// The repository requires a feature this implementation does not
    /// handle (for example, a missing `dirstate-v2` requirement).
    Unsupported(String),
}

impl fmt::Display for DirstateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DirstateError::InvalidMagic => {
                write!(f, "invalid dirstate docket marker")
            }
            DirstateError::ShortDocket => {
                write!(f, "dirstate docket is too short")
            }
            DirstateError::CorruptIndex(e) => e.fmt(f),
            DirstateError::UnknownIdentifier { uid } => {
                write!(
                    f,
                    "missing dirstate data file for id '{}'",
                    String::from_utf8_lossy(uid)
                )
            }
            DirstateError::Io(e) => e.fmt(f),
            DirstateError::Unsupported(explanation) => {
                write!(f, "unsupported feature: {}", explanation)
            }
        }
    }
}

/// A low-level I/O error together with the operation that triggered it,
/// so that "file not found" can become "file not found when reading
/// .hg/dirstate".
#[derive(Debug)]
pub struct IoError {
    pub error: std::io::Error,
    pub context: IoErrorContext,
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.error)
    }
}

#[derive(Debug)]
pub enum IoErrorContext {
    ReadingFile(PathBuf),
    WritingFile(PathBuf),
    RemovingFile(PathBuf),
    /// `std::fs::symlink_metadata`
    ReadingMetadata(PathBuf),
}

impl fmt::Display for IoErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IoErrorContext::ReadingFile(path) => {
                write!(f, "when reading {}", path.display())
            }
            IoErrorContext::WritingFile(path) => {
                write!(f, "when writing {}", path.display())
            }
            IoErrorContext::RemovingFile(path) => {
                write!(f, "when removing {}", path.display())
            }
            IoErrorContext::ReadingMetadata(path) => {
                write!(f, "when reading metadata of {}", path.display())
            }
        }
    }
}

pub trait IoResultExt<T> {
    /// Annotate a possible I/O error as related to reading the file at the
    /// given path and convert it to an [`IoError`].
    fn when_reading_file(self, path: impl AsRef<Path>) -> Result<T, IoError>;

    fn when_writing_file(self, path: impl AsRef<Path>) -> Result<T, IoError>;

    fn with_context(
        self,
        context: impl FnOnce() -> IoErrorContext,
    ) -> Result<T, IoError>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn when_reading_file(self, path: impl AsRef<Path>) -> Result<T, IoError> {
        self.with_context(|| {
            IoErrorContext::ReadingFile(path.as_ref().to_owned())
        })
    }

    fn when_writing_file(self, path: impl AsRef<Path>) -> Result<T, IoError> {
        self.with_context(|| {
            IoErrorContext::WritingFile(path.as_ref().to_owned())
        })
    }

    fn with_context(
        self,
        context: impl FnOnce() -> IoErrorContext,
    ) -> Result<T, IoError> {
        self.map_err(|error| IoError {
            error,
            context: context(),
        })
    }
}

pub trait ResultExt<T> {
    /// Handle missing files separately from other I/O error cases.
    ///
    /// * `Ok(x)` becomes `Ok(Some(x))`
    /// * An I/O "not found" error becomes `Ok(None)`
    /// * Other errors are unchanged
    fn io_not_found_as_none(self) -> Result<Option<T>, IoError>;
}

impl<T> ResultExt<T> for Result<T, IoError> {
    fn io_not_found_as_none(self) -> Result<Option<T>, IoError> {
        match self {
            Ok(x) => Ok(Some(x)),
            Err(IoError { error, .. })
                if error.kind() == ErrorKind::NotFound =>
            {
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }
}
