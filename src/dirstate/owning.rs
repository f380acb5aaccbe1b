use crate::dirstate::dirstate_map::DirstateMap;
use crate::dirstate::on_disk::TreeMetadata;
use crate::errors::CorruptIndex;
use self_cell::self_cell;
use std::ops::Deref;

self_cell!(
    /// Keeps a `DirstateMap<'owner>` next to the `owner` buffer (a memory
    /// map of the data file, or a plain byte vector) that it borrows.
    pub struct OwningDirstateMap {
        owner: Box<dyn Deref<Target = [u8]> + Send + Sync>,
        #[covariant]
        dependent: DirstateMap,
    }
);

impl OwningDirstateMap {
    pub fn new_empty<OnDisk>(on_disk: OnDisk) -> Self
    where
        OnDisk: Deref<Target = [u8]> + Send + Sync + 'static,
    {
        let on_disk = Box::new(on_disk);
        OwningDirstateMap::new(on_disk, |bytes| DirstateMap::empty(bytes))
    }

    /// Builds the tree from the current generation's data, truncated to
    /// the docket's `used_size`, and the docket's tree metadata.
    pub fn new_v2<OnDisk>(
        on_disk: OnDisk,
        data_size: usize,
        metadata: TreeMetadata,
        uuid: Vec<u8>,
    ) -> Result<Self, CorruptIndex>
    where
        OnDisk: Deref<Target = [u8]> + Send + Sync + 'static,
    {
        let on_disk = Box::new(on_disk);
        OwningDirstateMap::try_new(on_disk, |bytes| {
            // A file longer than `used_size` has an in-flight append from
            // a concurrent writer; the excess bytes are not ours to read.
            let bytes = bytes.get(..data_size).ok_or(CorruptIndex)?;
            let mut map = DirstateMap::read(bytes, &metadata)?;
            map.set_old_uuid(uuid);
            Ok(map)
        })
    }

    pub fn get_map(&self) -> &DirstateMap {
        self.borrow_dependent()
    }

    pub fn with_dmap_mut<R>(
        &mut self,
        f: impl FnOnce(&mut DirstateMap) -> R,
    ) -> R {
        self.with_dependent_mut(|_owner, dmap| f(dmap))
    }

    pub fn on_disk(&self) -> &[u8] {
        self.borrow_owner()
    }

    pub fn old_uuid(&self) -> Option<&[u8]> {
        self.get_map().old_uuid()
    }

    pub fn old_data_size(&self) -> usize {
        self.get_map().on_disk.len()
    }
}
