// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rendering a device's configuration document.
//!
//! Assembly is where referential integrity is enforced: every ID a device
//! lists, and every ID those entities refer to, must resolve in the config
//! store. The first dangling reference aborts assembly.

use std::collections::BTreeSet;

use edge_api_types::config::{
    AppInstanceConfig, BaseOsConfig, ContentTree, Datastore, NetworkConfig,
    NetworkInstanceConfig, PhysicalIo, Snapshot, SystemAdapter,
    UuidAndVersion, Volume,
};
use edge_api_types::{DeviceConfigDocument, Entity, Kind};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::device::Device;
use crate::store::{ConfigStore, Stored};

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("{referrer} refers to {kind} {id}, which is not in the config store")]
    Missing { referrer: String, kind: Kind, id: String },

    #[error("base OS {base_os} has a drive with no image")]
    EmptyDrive { base_os: String },

    #[error("failed to serialize configuration for device {device}")]
    Serialize {
        device: Uuid,
        #[source]
        source: serde_json::Error,
    },
}

fn lookup<'s, E: Stored>(
    store: &'s ConfigStore,
    referrer: &dyn Fn() -> String,
    id: &str,
) -> Result<&'s E, AssemblyError> {
    store.get::<E>(id).map_err(|_| AssemblyError::Missing {
        referrer: referrer(),
        kind: E::KIND,
        id: id.to_owned(),
    })
}

fn referrer<E: Entity>(entity: &E) -> impl Fn() -> String + '_ {
    move || format!("{} {}", E::KIND, entity.id())
}

fn members<E: Stored>(
    store: &ConfigStore,
    device: &Device,
) -> Result<Vec<E>, AssemblyError> {
    let this_device = || format!("device {}", device.id());
    device
        .ids(E::KIND)
        .iter()
        .map(|id| lookup::<E>(store, &this_device, id).cloned())
        .collect()
}

/// Appends `datastore` to `out` unless a datastore with its ID is already
/// there.
fn push_datastore(
    out: &mut Vec<Datastore>,
    seen: &mut BTreeSet<String>,
    datastore: &Datastore,
) {
    if seen.insert(datastore.id.clone()) {
        out.push(datastore.clone());
    }
}

/// Renders the complete configuration document for `device`.
pub fn assemble(
    store: &ConfigStore,
    device: &Device,
) -> Result<DeviceConfigDocument, AssemblyError> {
    let base = members::<BaseOsConfig>(store, device)?;
    let networks = members::<NetworkConfig>(store, device)?;
    let network_instances = members::<NetworkInstanceConfig>(store, device)?;
    let device_io_list = members::<PhysicalIo>(store, device)?;
    let system_adapter_list = members::<SystemAdapter>(store, device)?;
    let apps = members::<AppInstanceConfig>(store, device)?;
    let snapshots = members::<Snapshot>(store, device)?;
    let volumes = members::<Volume>(store, device)?;
    let content_info = members::<ContentTree>(store, device)?;

    let mut datastores = Vec::new();
    let mut seen = BTreeSet::new();

    for os in &base {
        for drive in &os.drives {
            let image = drive.image.as_ref().ok_or_else(|| {
                AssemblyError::EmptyDrive {
                    base_os: os.uuid_and_version.uuid.clone(),
                }
            })?;
            let ds = lookup::<Datastore>(store, &referrer(os), &image.datastore_id)?;
            push_datastore(&mut datastores, &mut seen, ds);
        }
        if let Some(volume_id) = &os.volume_id {
            lookup::<Volume>(store, &referrer(os), volume_id)?;
        }
    }

    for ct in &content_info {
        let ds = lookup::<Datastore>(store, &referrer(ct), &ct.datastore_id)?;
        push_datastore(&mut datastores, &mut seen, ds);
    }

    for vol in &volumes {
        if let Some(ct_id) = vol.content_tree_id() {
            let ct = lookup::<ContentTree>(store, &referrer(vol), ct_id)?;
            lookup::<Datastore>(store, &referrer(ct), &ct.datastore_id)?;
        }
    }

    for app in &apps {
        for volume_ref in &app.volume_refs {
            lookup::<Volume>(store, &referrer(app), &volume_ref.uuid)?;
        }
        for iface in &app.interfaces {
            lookup::<NetworkInstanceConfig>(
                store,
                &referrer(app),
                &iface.network_id,
            )?;
        }
    }

    for snapshot in &snapshots {
        lookup::<Volume>(store, &referrer(snapshot), &snapshot.volume_id)?;
    }

    for adapter in &system_adapter_list {
        lookup::<NetworkConfig>(store, &referrer(adapter), &adapter.network_uuid)?;
    }

    debug!(
        device = %device.id(),
        generation = device.generation(),
        apps = apps.len(),
        datastores = datastores.len(),
        "assembled device configuration"
    );

    Ok(DeviceConfigDocument {
        id: UuidAndVersion::new(
            device.id().to_string(),
            &device.generation().to_string(),
        ),
        base,
        networks,
        network_instances,
        device_io_list,
        system_adapter_list,
        apps,
        snapshots,
        volumes,
        content_info,
        datastores,
    })
}

/// Serializes a document into the bytes pushed to the controller.
pub fn to_json_bytes(
    doc: &DeviceConfigDocument,
) -> Result<Vec<u8>, AssemblyError> {
    serde_json::to_vec(doc).map_err(|source| AssemblyError::Serialize {
        device: doc.id.uuid.parse().unwrap_or(Uuid::nil()),
        source,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::expect::fakes::Fixture;
    use crate::expect::Expectation;

    #[test]
    fn documents_list_entities_in_device_order() {
        let mut fx = Fixture::new();
        fx.resolve_app(&Expectation::new("docker://nginx", "a").unwrap())
            .unwrap();
        fx.resolve_app(&Expectation::new("docker://redis", "b").unwrap())
            .unwrap();

        let doc = assemble(&fx.store, &fx.device).unwrap();
        let names: Vec<_> = doc.apps.iter().map(|a| a.display_name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(doc.networks.len(), 2);
        assert_eq!(doc.device_io_list.len(), 2);
        assert_eq!(doc.system_adapter_list.len(), 2);
        assert_eq!(doc.volumes.len(), 2);
        assert_eq!(doc.content_info.len(), 2);
        assert_eq!(doc.datastores.len(), 1);
        assert_eq!(doc.id.uuid, fx.device.id().to_string());
        assert_eq!(doc.id.version, "1");

        let bytes = to_json_bytes(&doc).unwrap();
        let back: DeviceConfigDocument = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn base_os_datastores_are_deduplicated() {
        let mut fx = Fixture::new();
        for tag in ["9.0.0-kvm-amd64", "9.1.0-kvm-amd64"] {
            let exp =
                Expectation::new(&format!("docker://lfedge/eve:{tag}"), "eve")
                    .unwrap();
            fx.resolve_base_os(&exp, false).unwrap();
        }

        let doc = assemble(&fx.store, &fx.device).unwrap();
        assert_eq!(doc.base.len(), 2);
        assert_eq!(doc.datastores.len(), 1);
        assert_eq!(doc.datastores[0].fqdn, "docker://registry-1.docker.io");
    }

    #[test]
    fn unknown_device_members_abort_assembly() {
        let mut fx = Fixture::new();
        fx.resolve_app(&Expectation::new("docker://nginx", "a").unwrap())
            .unwrap();
        fx.device.push(Kind::Volume, "no-such-volume");

        match assemble(&fx.store, &fx.device) {
            Err(AssemblyError::Missing { kind, id, referrer }) => {
                assert_eq!(kind, Kind::Volume);
                assert_eq!(id, "no-such-volume");
                assert!(referrer.starts_with("device "));
            }
            other => panic!("expected a missing volume, got {other:?}"),
        }
    }

    #[test]
    fn dangling_entity_references_abort_assembly() {
        let mut fx = Fixture::new();
        let resolved = fx
            .resolve_app(&Expectation::new("docker://nginx", "a").unwrap())
            .unwrap();

        // Drop the datastore out from under the content tree.
        let ds_id = fx.store.list::<Datastore>().next().unwrap().id.clone();
        fx.store.remove::<Datastore>(&ds_id).unwrap();

        match assemble(&fx.store, &fx.device) {
            Err(AssemblyError::Missing { kind: Kind::Datastore, referrer, .. }) => {
                assert!(referrer.starts_with("ContentTree "));
            }
            other => panic!("expected a missing datastore, got {other:?}"),
        }

        // An app pointing at a removed volume fails too.
        let mut fx = Fixture::new();
        let resolved_b = fx
            .resolve_app(&Expectation::new("docker://nginx", "b").unwrap())
            .unwrap();
        let app = fx.store.get::<AppInstanceConfig>(&resolved_b.app_id).unwrap();
        let vol = app.volume_refs[0].uuid.clone();
        fx.store.remove::<Volume>(&vol).unwrap();
        fx.device.remove(Kind::Volume, &vol);
        assert!(matches!(
            assemble(&fx.store, &fx.device),
            Err(AssemblyError::Missing { kind: Kind::Volume, .. })
        ));
        assert!(resolved.created);
    }

    #[test]
    fn snapshots_must_name_existing_volumes() {
        let mut fx = Fixture::new();
        fx.store
            .add(Snapshot {
                id: "snap".into(),
                volume_id: "gone".into(),
                display_name: "snap".into(),
                rollback: None,
            })
            .unwrap();
        fx.device.push(Kind::Snapshot, "snap");

        assert!(matches!(
            assemble(&fx.store, &fx.device),
            Err(AssemblyError::Missing { kind: Kind::Volume, .. })
        ));
    }
}
