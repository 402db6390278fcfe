// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use base64::Engine;
use edge_api_types::config::{
    Adapter, AppInstanceConfig, ContentTree, FixedResources, ImageFormat,
    MetadataType, NetworkAdapter, PhysicalIoKind, UuidAndVersion,
    VirtualizationMode, Volume, VolumeRef,
};
use edge_api_types::Kind;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::content::{format_name, ArtifactRequest, ContentSpec};
use super::{
    network, ArtifactLocator, EnrichmentError, Expectation, ExpectationError,
    ExpectationResolver, Txn, VolumesType,
};

const ANNOTATION_ROLE: &str = "org.lfedge.eci.role";
const ANNOTATION_MEDIA_TYPE: &str = "org.lfedge.eci.mediaType";
const ROLE_ROOT_DISK: &str = "disk-root";

const PV_ROOTDEV: &str = "/dev/xvda1";
const PV_BOOTLOADER: &str = "/usr/lib/xen/boot/ovmf.bin";

/// Maps the media type of a root-disk layer to the disk format it carries.
fn root_disk_format(media_type: &str) -> Option<ImageFormat> {
    match media_type {
        "application/vnd.lfedge.disk.raw" => Some(ImageFormat::Raw),
        "application/vnd.lfedge.disk.qcow" => Some(ImageFormat::Qcow),
        "application/vnd.lfedge.disk.qcow2" => Some(ImageFormat::Qcow2),
        "application/vnd.lfedge.disk.vhd" => Some(ImageFormat::Vhd),
        "application/vnd.lfedge.disk.vmdk" => Some(ImageFormat::Vmdk),
        "application/vnd.lfedge.disk.ova" => Some(ImageFormat::Ova),
        "application/vnd.lfedge.disk.vhdx" => Some(ImageFormat::Vhdx),
        _ => None,
    }
}

/// Splits a disk expression into a locator and an optional mount point.
/// Accepts a bare locator or a comma-separated list of `key=value` pairs.
fn parse_disk(expr: &str) -> Result<(String, Option<String>), ExpectationError> {
    if !expr.contains(',') {
        return Ok((expr.to_owned(), None));
    }

    let mut source = None;
    let mut mount = None;
    for part in expr.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| ExpectationError::BadDiskExpression(expr.to_owned()))?;
        match key.trim() {
            "source" | "src" => source = Some(value.to_owned()),
            "destination" | "dst" | "target" => mount = Some(value.to_owned()),
            _ => {}
        }
    }

    let source =
        source.ok_or_else(|| ExpectationError::BadDiskExpression(expr.to_owned()))?;
    Ok((source, mount))
}

/// The volumes attached to an app under construction, with the ones created
/// during this resolution remembered so they can be dropped again.
///
/// Volume indices are never reused within one app, even when a disk replaces
/// an earlier volume.
#[derive(Default)]
struct AppVolumes {
    refs: Vec<VolumeRef>,
    created: Vec<String>,
    next_index: usize,
}

impl AppVolumes {
    fn next_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn attach(&mut self, (id, created): (String, bool), mount_dir: &str) {
        if created {
            self.created.push(id.clone());
        }
        self.refs.push(VolumeRef { uuid: id, mount_dir: mount_dir.to_owned() });
    }

    /// Detaches everything mounted at `mount_dir`, deleting volumes this
    /// resolution created.
    fn replace_mount(
        &mut self,
        txn: &mut Txn,
        mount_dir: &str,
    ) -> Result<(), ExpectationError> {
        let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.refs)
            .into_iter()
            .partition(|r| r.mount_dir == mount_dir);
        self.refs = kept;

        for r in dropped {
            debug!(volume = r.uuid, mount_dir, "disk replaces volume");
            if self.created.contains(&r.uuid) {
                txn.store.remove::<Volume>(&r.uuid)?;
                txn.device.remove(Kind::Volume, &r.uuid);
                self.created.retain(|id| id != &r.uuid);
            }
        }

        Ok(())
    }
}

impl ExpectationResolver<'_> {
    pub(super) fn app(
        &self,
        txn: &mut Txn,
        exp: &Expectation,
    ) -> Result<(String, bool), ExpectationError> {
        for id in txn.device.ids(Kind::AppInstanceConfig) {
            let app = txn.store.get::<AppInstanceConfig>(id)?;
            if app.display_name == exp.name
                && exp.old_name.as_deref() != Some(app.display_name.as_str())
            {
                debug!(id, name = exp.name, "app already deployed");
                return Ok((id.clone(), false));
            }
        }

        let mut spec = self.describe(&ArtifactRequest::from_expectation(exp))?;
        let mount_points = match exp.locator {
            ArtifactLocator::Docker(_) => {
                self.enrich(txn, &mut spec, exp.format.is_none())
            }
            _ => Vec::new(),
        };

        let container = exp.locator.is_container();
        let volume_size =
            exp.volume_size.unwrap_or(self.config.default_volume_size_bytes);

        let mut volumes = AppVolumes::default();
        let root = self.volume(txn, &exp.name, volumes.next_index(), |txn| {
            let ct_id = self.content_tree(txn, &spec)?;
            let size = match exp.disk_size {
                Some(size) => size,
                None if container => 0,
                None => txn.store.get::<ContentTree>(&ct_id)?.max_size_bytes,
            };
            Ok((ct_id, size))
        })?;
        volumes.attach(root, "/");

        if !mount_points.is_empty() {
            if let Some(empty) = self.empty_volume_spec(txn, exp.volumes_type)? {
                for mount_dir in &mount_points {
                    let index = volumes.next_index();
                    let vol = self.volume(txn, &exp.name, index, |txn| {
                        Ok((self.content_tree(txn, &empty)?, volume_size))
                    })?;
                    volumes.attach(vol, mount_dir);
                }
            }
        }

        for disk in &exp.disks {
            let (source, mount_dir) = parse_disk(disk)?;
            if let Some(mount_dir) = &mount_dir {
                volumes.replace_mount(txn, mount_dir)?;
            }

            let locator = ArtifactLocator::parse(&source)?;
            let format = match locator {
                ArtifactLocator::Docker(_) => None,
                _ => exp.volumes_type.image_format().map(format_name),
            };
            let spec = self.describe(&ArtifactRequest::bare(&locator, format))?;
            let index = volumes.next_index();
            let vol = self.volume(txn, &exp.name, index, |txn| {
                Ok((self.content_tree(txn, &spec)?, volume_size))
            })?;
            volumes.attach(vol, mount_dir.as_deref().unwrap_or_default());
        }

        let mut interfaces = Vec::with_capacity(exp.networks.len());
        for request in &exp.networks {
            interfaces.push(NetworkAdapter {
                name: "default".to_owned(),
                network_id: self.network_instance(txn, request)?,
                acls: network::acls(request)?,
                mac_address: request.mac_address.clone(),
                access_vlan_id: request.access_vlan_id,
            });
        }

        let app = self.app_config(exp, volumes.refs, interfaces);
        let id = app.uuid_and_version.uuid.clone();
        info!(
            id,
            name = app.display_name,
            container,
            volumes = app.volume_refs.len(),
            "created app instance"
        );

        txn.store.add(app)?;
        txn.device.push(Kind::AppInstanceConfig, &id);
        Ok((id, true))
    }

    fn app_config(
        &self,
        exp: &Expectation,
        volume_refs: Vec<VolumeRef>,
        interfaces: Vec<NetworkAdapter>,
    ) -> AppInstanceConfig {
        let memory_kib =
            exp.memory_mib.unwrap_or(self.config.default_memory_mib) * 1024;
        let pv = exp.virtualization_mode == VirtualizationMode::Pv;

        let fixed_resources = FixedResources {
            memory_kib,
            max_memory_kib: memory_kib,
            vcpus: exp.cpus.unwrap_or(self.config.default_cpus),
            virtualization_mode: exp.virtualization_mode,
            rootdev: pv.then(|| PV_ROOTDEV.to_owned()),
            bootloader: pv.then(|| PV_BOOTLOADER.to_owned()),
            enable_vnc: exp.vnc_display != 0,
            vnc_display: exp.vnc_display,
            vnc_password: if exp.vnc_display != 0 {
                exp.vnc_password.clone()
            } else {
                None
            },
        };

        let adapters = exp
            .adapters
            .iter()
            .map(|name| Adapter {
                kind: if name.starts_with("eth") {
                    PhysicalIoKind::NetEth
                } else {
                    PhysicalIoKind::Usb
                },
                name: name.clone(),
            })
            .collect();

        AppInstanceConfig {
            uuid_and_version: UuidAndVersion::new(Uuid::new_v4().to_string(), "1"),
            display_name: exp.name.clone(),
            activate: true,
            fixed_resources,
            volume_refs,
            interfaces,
            adapters,
            user_data: exp
                .user_data
                .as_ref()
                .map(|d| base64::engine::general_purpose::STANDARD.encode(d)),
            metadata_type: if exp.openstack_metadata {
                MetadataType::OpenStack
            } else {
                MetadataType::Default
            },
            start_delay_secs: exp.start_delay_secs,
            profiles: exp.profiles.clone(),
        }
    }

    /// Reads the image's declared volumes and root-disk annotations. Returns
    /// the mount points; failures become warnings.
    fn enrich(
        &self,
        txn: &mut Txn,
        spec: &mut ContentSpec,
        detect_format: bool,
    ) -> Vec<String> {
        let Some(reference) = spec.reference.clone() else {
            return Vec::new();
        };
        let inspector = &self.collaborators.inspector;

        let mount_points = match inspector.config(&reference) {
            Ok(config) => config.volumes,
            Err(source) => {
                let e = EnrichmentError::Config {
                    reference: reference.to_string(),
                    source,
                };
                warn!(error = %e, "cannot obtain volume info, continuing without");
                txn.warnings.push(e);
                Vec::new()
            }
        };

        if detect_format {
            match inspector.manifest(&reference) {
                Ok(manifest) => {
                    let root = manifest.layers.iter().find_map(|layer| {
                        if layer.annotations.get(ANNOTATION_ROLE).map(String::as_str)
                            != Some(ROLE_ROOT_DISK)
                        {
                            return None;
                        }
                        layer
                            .annotations
                            .get(ANNOTATION_MEDIA_TYPE)
                            .and_then(|m| root_disk_format(m))
                    });
                    if let Some(format) = root {
                        debug!(%reference, ?format, "image carries a root disk");
                        spec.format = format;
                    }
                }
                Err(source) => {
                    let e = EnrichmentError::Manifest {
                        reference: reference.to_string(),
                        source,
                    };
                    warn!(error = %e, "cannot obtain disk info, continuing without");
                    txn.warnings.push(e);
                }
            }
        }

        mount_points
    }

    /// Describes the artifact that backs blank volumes of type `ty`, if blank
    /// volumes are enabled and an artifact is configured for them.
    fn empty_volume_spec(
        &self,
        txn: &mut Txn,
        ty: VolumesType,
    ) -> Result<Option<ContentSpec>, ExpectationError> {
        let Some(format) = ty.image_format() else {
            return Ok(None);
        };
        let Some(link) = self.config.empty_volume_links.get(&ty) else {
            let e = EnrichmentError::NoEmptyVolumeLink(ty);
            warn!(error = %e, "skipping volumes for image mount points");
            txn.warnings.push(e);
            return Ok(None);
        };

        let locator = ArtifactLocator::parse(link)?;
        self.describe(&ArtifactRequest::bare(&locator, Some(format_name(format))))
            .map(Some)
    }
}
