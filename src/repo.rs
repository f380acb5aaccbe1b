use crate::dirstate::docket::{read_docket, Docket};
use crate::dirstate::owning::OwningDirstateMap;
use crate::dirstate::DirstateParents;
use crate::errors::{
    CorruptIndex, DirstateError, IoResultExt, ResultExt,
};
use crate::vfs::Vfs;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// The `.hg/requires` token that selects the dirstate-v2 format. Without
/// it, the repository uses the legacy flat dirstate, which this crate
/// does not read.
pub const DIRSTATE_V2_REQUIREMENT: &str = "dirstate-v2";

/// A repository on disk, reduced to what the dirstate needs: the `.hg`
/// directory and the requirements gating the format.
pub struct Repo {
    working_directory: PathBuf,
    dot_hg: PathBuf,
    requirements: HashSet<String>,
}

impl Repo {
    /// Opens the repository whose working directory is at the given path
    /// (which must contain a `.hg` sub-directory).
    pub fn open(
        working_directory: impl Into<PathBuf>,
    ) -> Result<Self, DirstateError> {
        let working_directory = working_directory.into();
        let dot_hg = working_directory.join(".hg");
        let requirements =
            load_requirements_if_exists(Vfs { base: &dot_hg })?;
        Ok(Self {
            working_directory,
            dot_hg,
            requirements,
        })
    }

    /// Creates a new `.hg` with the `dirstate-v2` requirement and an
    /// empty dirstate.
    pub fn init(
        working_directory: impl Into<PathBuf>,
    ) -> Result<Self, DirstateError> {
        let working_directory = working_directory.into();
        let dot_hg = working_directory.join(".hg");
        std::fs::create_dir_all(&dot_hg).when_writing_file(&dot_hg)?;
        let vfs = Vfs { base: &dot_hg };
        vfs.atomic_write(
            "requires",
            format!("{}\n", DIRSTATE_V2_REQUIREMENT).as_bytes(),
        )?;
        Self::open(working_directory)
    }

    pub fn working_directory_path(&self) -> &Path {
        &self.working_directory
    }

    /// For accessing repository files (in `.hg`).
    pub fn hg_vfs(&self) -> Vfs<'_> {
        Vfs { base: &self.dot_hg }
    }

    pub fn requirements(&self) -> &HashSet<String> {
        &self.requirements
    }

    pub fn has_dirstate_v2(&self) -> bool {
        self.requirements.contains(DIRSTATE_V2_REQUIREMENT)
    }

    fn require_dirstate_v2(&self) -> Result<(), DirstateError> {
        if self.has_dirstate_v2() {
            Ok(())
        } else {
            Err(DirstateError::Unsupported(format!(
                "repository is missing the '{}' requirement",
                DIRSTATE_V2_REQUIREMENT
            )))
        }
    }

    fn dirstate_file_contents(&self) -> Result<Vec<u8>, DirstateError> {
        Ok(self
            .hg_vfs()
            .read("dirstate")
            .io_not_found_as_none()?
            .unwrap_or_default())
    }

    pub fn dirstate_parents(
        &self,
    ) -> Result<DirstateParents, DirstateError> {
        self.require_dirstate_v2()?;
        let dirstate = self.dirstate_file_contents()?;
        if dirstate.is_empty() {
            Ok(DirstateParents::NULL)
        } else {
            Ok(read_docket(&dirstate)?.parents())
        }
    }

    /// Loads the dirstate tree for the current generation: reads the
    /// docket, memory-maps the data file it names, and hands both to an
    /// owning map.
    pub fn open_dirstate_map(
        &self,
    ) -> Result<OwningDirstateMap, DirstateError> {
        self.require_dirstate_v2()?;
        let dirstate_file_contents = self.dirstate_file_contents()?;
        if dirstate_file_contents.is_empty() {
            return Ok(OwningDirstateMap::new_empty(Vec::new()));
        }
        let docket = read_docket(&dirstate_file_contents)?;
        let uuid = docket.uuid.to_owned();
        let data_size = docket.data_size();
        let metadata = docket.tree_metadata();
        if data_size == 0 {
            // Nothing reachable yet; no point mapping the file (it may
            // not even have a single page).
            return Ok(OwningDirstateMap::new_v2(
                Vec::new(),
                0,
                metadata,
                uuid,
            )?);
        }
        match self.hg_vfs().mmap_open_opt(docket.data_filename())? {
            Some(data_mmap) => Ok(OwningDirstateMap::new_v2(
                data_mmap, data_size, metadata, uuid,
            )?),
            None => Err(DirstateError::UnknownIdentifier { uid: uuid }),
        }
    }

    /// Writes back any changes made through the map, under the exclusive
    /// repository lock the caller is assumed to hold.
    ///
    /// The data file is extended (or replaced, once too much of it has
    /// become unreachable) and synced before the docket is atomically
    /// swapped; a crash anywhere in between leaves the previous
    /// generation fully intact.
    pub fn write_dirstate(
        &self,
        map: &mut OwningDirstateMap,
        parents: DirstateParents,
    ) -> Result<(), DirstateError> {
        self.require_dirstate_v2()?;
        let old_uuid = map.old_uuid().map(|uuid| uuid.to_vec());
        let old_data_size = map.old_data_size();
        let can_append = old_uuid.is_some();
        let (data, tree_metadata, append) =
            map.with_dmap_mut(|dmap| dmap.pack_v2(can_append))?;

        let uuid = if append {
            String::from_utf8(old_uuid.clone().expect("can_append held"))
                .map_err(|_| CorruptIndex)?
        } else {
            Docket::new_uid()
        };
        let data_filename = format!("dirstate.{}", uuid);
        let data_path = self.hg_vfs().join(&data_filename);

        let mut options = OpenOptions::new();
        options.write(true).create(append).create_new(!append);
        let data_size = (|| {
            let mut file = options.open(&data_path)?;
            if append {
                // The file may be longer than the previous generation's
                // used size if an earlier writer was interrupted
                // mid-append; those orphaned bytes are dead, overwrite
                // them.
                file.seek(SeekFrom::Start(old_data_size as u64))?;
            }
            file.write_all(&data)?;
            file.sync_all()?;
            file.stream_position()
        })()
        .when_writing_file(&data_path)?;

        let docket =
            Docket::serialize(parents, tree_metadata, data_size, uuid.as_bytes())
                .map_err(|_| CorruptIndex)?;
        self.hg_vfs().atomic_write("dirstate", &docket)?;
        log::trace!(
            "wrote dirstate docket: id {}, {} bytes used",
            uuid,
            data_size,
        );

        if !append {
            if let Some(old_uuid) = old_uuid {
                // Unlinked only after the new docket is durable. A
                // reader that mapped the old generation beforehand keeps
                // its pages through the unlink.
                let old_filename = format!(
                    "dirstate.{}",
                    String::from_utf8_lossy(&old_uuid)
                );
                self.hg_vfs()
                    .remove_file(old_filename)
                    .io_not_found_as_none()?;
            }
        }
        Ok(())
    }
}

fn parse_requirements(bytes: &[u8]) -> Result<HashSet<String>, DirstateError> {
    // The reference implementation reads this file with `str.splitlines`
    // but only ever writes `\n`.
    bytes
        .split(|&byte| byte == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| {
            // Feature names are all ASCII
            if line[0].is_ascii_alphanumeric() && line.is_ascii() {
                Ok(String::from_utf8(line.into()).unwrap())
            } else {
                Err(DirstateError::Unsupported(
                    "parse error in 'requires' file".to_owned(),
                ))
            }
        })
        .collect()
}

fn load_requirements_if_exists(
    hg_vfs: Vfs,
) -> Result<HashSet<String>, DirstateError> {
    if let Some(bytes) = hg_vfs.read("requires").io_not_found_as_none()? {
        parse_requirements(&bytes)
    } else {
        // Very old repositories may not have a requires file at all;
        // that means no requirements.
        Ok(HashSet::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_requirements() {
        let reqs =
            parse_requirements(b"dirstate-v2\nstore\n\n").unwrap();
        assert!(reqs.contains("dirstate-v2"));
        assert!(reqs.contains("store"));
        assert_eq!(reqs.len(), 2);

        assert!(parse_requirements(b"\xffbad\n").is_err());
    }
}
