// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Volume snapshots.
//!
//! Snapshots are looked up by display name among the snapshots the device
//! lists. A rollback is requested by bumping the snapshot's rollback counter;
//! the device acts on the change the next time it is configured.

use edge_api_types::config::{DeviceOpsCmd, Snapshot, Volume};
use edge_api_types::Kind;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::device::Device;
use crate::store::{ConfigStore, StoreError};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("device has no volume named {0}")]
    NoVolume(String),

    #[error("device has no snapshot named {0}")]
    NotFound(String),

    #[error("rollback counter of snapshot {0} is exhausted")]
    CounterOverflow(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn find_snapshot(
    store: &ConfigStore,
    device: &Device,
    name: &str,
) -> Result<String, SnapshotError> {
    for id in device.ids(Kind::Snapshot) {
        if store.get::<Snapshot>(id)?.display_name == name {
            return Ok(id.clone());
        }
    }
    Err(SnapshotError::NotFound(name.to_owned()))
}

/// Snapshots the device volume named `volume_name`. A name is generated if
/// `name` is `None`. Returns the new snapshot's ID.
pub fn create_snapshot(
    store: &mut ConfigStore,
    device: &mut Device,
    volume_name: &str,
    name: Option<&str>,
) -> Result<String, SnapshotError> {
    let mut volume_id = None;
    for id in device.ids(Kind::Volume) {
        if store.get::<Volume>(id)?.display_name == volume_name {
            volume_id = Some(id.clone());
            break;
        }
    }
    let volume_id =
        volume_id.ok_or_else(|| SnapshotError::NoVolume(volume_name.to_owned()))?;

    let id = Uuid::new_v4().to_string();
    let display_name = match name {
        Some(name) => name.to_owned(),
        None => format!("snapshot-{}", &id[..8]),
    };
    info!(id, name = display_name, volume = volume_name, "creating snapshot");

    store.add(Snapshot { id: id.clone(), volume_id, display_name, rollback: None })?;
    device.push(Kind::Snapshot, &id);
    Ok(id)
}

/// Drops the snapshot named `name` from the device. The entity stays in the
/// store.
pub fn delete_snapshot(
    store: &ConfigStore,
    device: &mut Device,
    name: &str,
) -> Result<String, SnapshotError> {
    let id = find_snapshot(store, device, name)?;
    device.remove(Kind::Snapshot, &id);
    info!(id, name, "deleted snapshot");
    Ok(id)
}

/// Requests a rollback to the snapshot named `name`. Returns the new value
/// of its rollback counter.
pub fn rollback_snapshot(
    store: &mut ConfigStore,
    device: &Device,
    name: &str,
) -> Result<u32, SnapshotError> {
    let id = find_snapshot(store, device, name)?;
    let snapshot = store.get_mut::<Snapshot>(&id)?;

    let counter = match snapshot.rollback {
        None => 1,
        Some(cmd) => cmd
            .counter
            .checked_add(1)
            .ok_or_else(|| SnapshotError::CounterOverflow(name.to_owned()))?,
    };
    snapshot.rollback = Some(DeviceOpsCmd { counter });
    info!(id, name, counter, "requested snapshot rollback");
    Ok(counter)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::expect::fakes::Fixture;
    use crate::expect::Expectation;

    fn fixture_with_app() -> Fixture {
        let mut fx = Fixture::new();
        fx.resolve_app(&Expectation::new("docker://nginx", "web").unwrap())
            .unwrap();
        fx
    }

    #[test]
    fn snapshots_target_named_volumes() {
        let mut fx = fixture_with_app();
        let id =
            create_snapshot(&mut fx.store, &mut fx.device, "web_0_m_0", Some("before"))
                .unwrap();

        let snap = fx.store.get::<Snapshot>(&id).unwrap();
        assert_eq!(snap.display_name, "before");
        assert!(fx.device.has(Kind::Snapshot, &id));
        assert!(fx.device.has(Kind::Volume, &snap.volume_id));

        assert!(matches!(
            create_snapshot(&mut fx.store, &mut fx.device, "nope", None),
            Err(SnapshotError::NoVolume(_))
        ));

        let generated =
            create_snapshot(&mut fx.store, &mut fx.device, "web_0_m_0", None)
                .unwrap();
        assert!(fx
            .store
            .get::<Snapshot>(&generated)
            .unwrap()
            .display_name
            .starts_with("snapshot-"));
    }

    #[test]
    fn rollback_counts_up_and_refuses_to_wrap() {
        let mut fx = fixture_with_app();
        let id =
            create_snapshot(&mut fx.store, &mut fx.device, "web_0_m_0", Some("s"))
                .unwrap();

        assert_eq!(rollback_snapshot(&mut fx.store, &fx.device, "s").unwrap(), 1);
        assert_eq!(rollback_snapshot(&mut fx.store, &fx.device, "s").unwrap(), 2);

        fx.store.get_mut::<Snapshot>(&id).unwrap().rollback =
            Some(DeviceOpsCmd { counter: u32::MAX });
        assert!(matches!(
            rollback_snapshot(&mut fx.store, &fx.device, "s"),
            Err(SnapshotError::CounterOverflow(_))
        ));
        assert_eq!(
            fx.store.get::<Snapshot>(&id).unwrap().rollback,
            Some(DeviceOpsCmd { counter: u32::MAX })
        );
    }

    #[test]
    fn deleted_snapshots_leave_the_device() {
        let mut fx = fixture_with_app();
        let id =
            create_snapshot(&mut fx.store, &mut fx.device, "web_0_m_0", Some("s"))
                .unwrap();

        assert_eq!(delete_snapshot(&fx.store, &mut fx.device, "s").unwrap(), id);
        assert!(!fx.device.has(Kind::Snapshot, &id));
        assert!(matches!(
            delete_snapshot(&fx.store, &mut fx.device, "s"),
            Err(SnapshotError::NotFound(_))
        ));
        assert!(matches!(
            rollback_snapshot(&mut fx.store, &fx.device, "s"),
            Err(SnapshotError::NotFound(_))
        ));
    }
}
