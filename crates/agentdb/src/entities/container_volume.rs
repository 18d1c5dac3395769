//! Docker volumes created for workloads, kept until they are removed from the host.

use agentdb_core::epoch_secs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::Record;
use crate::error::StateResult;
use crate::filter::RecordFilter;
use crate::store::{Store, put_record};
use crate::tables::CONTAINER_VOLUMES;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerVolume {
    pub record_id: String,
    pub name: String,
    pub creation_time: u64,
    pub archive_time: u64,
}

impl ContainerVolume {
    pub fn new(name: &str) -> Self {
        Self {
            record_id: String::new(),
            name: name.to_string(),
            creation_time: epoch_secs(),
            archive_time: 0,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archive_time != 0
    }
}

impl Record for ContainerVolume {}

pub enum ContainerVolumeFilter {
    Unarchived,
    Name(String),
}

impl RecordFilter<ContainerVolume> for ContainerVolumeFilter {
    fn matches(&self, volume: &ContainerVolume) -> bool {
        match self {
            ContainerVolumeFilter::Unarchived => !volume.is_archived(),
            ContainerVolumeFilter::Name(name) => volume.name == *name,
        }
    }
}

impl Store {
    /// Store `volume`, minting a record id when it has none.
    pub fn save_container_volume(&self, volume: &mut ContainerVolume) -> StateResult<()> {
        self.with_write(|txn| {
            if volume.record_id.is_empty() {
                volume.record_id = txn.next_sequence(CONTAINER_VOLUMES)?.to_string();
            }
            put_record(txn, CONTAINER_VOLUMES, &volume.record_id, &*volume)
        })?;
        debug!(id = %volume.record_id, name = %volume.name, "container volume saved");
        Ok(())
    }

    pub fn save_container_volume_by_name(&self, name: &str) -> StateResult<ContainerVolume> {
        let mut volume = ContainerVolume::new(name);
        self.save_container_volume(&mut volume)?;
        Ok(volume)
    }

    pub fn find_container_volumes(
        &self,
        filters: &[ContainerVolumeFilter],
    ) -> StateResult<Vec<ContainerVolume>> {
        self.find_many(CONTAINER_VOLUMES, filters)
    }

    pub fn find_all_undeleted_container_volumes(&self) -> StateResult<Vec<ContainerVolume>> {
        self.find_container_volumes(&[ContainerVolumeFilter::Unarchived])
    }

    /// Stamp the volume archived now and store it.
    pub fn archive_container_volume(&self, volume: &mut ContainerVolume) -> StateResult<()> {
        volume.archive_time = epoch_secs();
        self.save_container_volume(volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volumes_get_ids_and_archive() {
        let store = Store::open_in_memory().unwrap();
        let mut a = store.save_container_volume_by_name("vol-a").unwrap();
        let b = store.save_container_volume_by_name("vol-b").unwrap();
        assert_ne!(a.record_id, b.record_id);

        store.archive_container_volume(&mut a).unwrap();
        let undeleted = store.find_all_undeleted_container_volumes().unwrap();
        assert_eq!(undeleted, vec![b]);

        let named = store
            .find_container_volumes(&[ContainerVolumeFilter::Name("vol-a".into())])
            .unwrap();
        assert_eq!(named.len(), 1);
        assert!(named[0].is_archived());
        assert_eq!(named[0].record_id, a.record_id);
    }
}
