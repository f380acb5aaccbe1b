use crate::errors::{IoError, IoErrorContext, IoResultExt};
use memmap2::{Mmap, MmapOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Filesystem access abstraction for the contents of a given "base"
/// directory (here, `.hg`).
#[derive(Copy, Clone)]
pub struct Vfs<'a> {
    pub base: &'a Path,
}

impl Vfs<'_> {
    pub fn join(&self, relative_path: impl AsRef<Path>) -> PathBuf {
        self.base.join(relative_path)
    }

    pub fn read(
        &self,
        relative_path: impl AsRef<Path>,
    ) -> Result<Vec<u8>, IoError> {
        let path = self.join(relative_path);
        std::fs::read(&path).when_reading_file(&path)
    }

    /// Returns `Ok(None)` if the file does not exist.
    pub fn mmap_open_opt(
        &self,
        relative_path: impl AsRef<Path>,
    ) -> Result<Option<Mmap>, IoError> {
        let path = self.join(relative_path);
        let file = match std::fs::File::open(&path) {
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(None)
            }
            other => other.when_reading_file(&path)?,
        };
        // Safety is "enforced" by the repository lock and assuming other
        // processes are well-behaved: the docket only ever references
        // bytes of the data file that no writer will touch again.
        let mmap =
            unsafe { MmapOptions::new().map(&file) }.when_reading_file(&path)?;
        Ok(Some(mmap))
    }

    pub fn remove_file(
        &self,
        relative_path: impl AsRef<Path>,
    ) -> Result<(), IoError> {
        let path = self.join(relative_path);
        std::fs::remove_file(&path)
            .with_context(|| IoErrorContext::RemovingFile(path.to_owned()))
    }

    /// Write `contents` to a temporary file, flush it all the way to the
    /// disk, then rename over `relative_path`.
    ///
    /// A reader opening that path sees either the previous contents or
    /// the complete new ones, never a torn write; and once this returns,
    /// the new contents survive power loss.
    pub fn atomic_write(
        &self,
        relative_path: impl AsRef<Path>,
        contents: &[u8],
    ) -> Result<(), IoError> {
        let mut tmp = tempfile::NamedTempFile::new_in(self.base)
            .when_writing_file(self.base)?;
        tmp.write_all(contents)
            .and_then(|()| tmp.as_file().sync_all())
            .when_writing_file(tmp.path())?;
        let path = self.join(relative_path);
        tmp.persist(&path)
            .map_err(|e| e.error)
            .when_writing_file(&path)?;
        Ok(())
    }
}
