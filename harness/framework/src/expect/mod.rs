// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Turning declarative expectations into configuration entities.
//!
//! An [`Expectation`] says what a test wants a device to run ("this container,
//! named `app1`, with two CPUs"). The [`ExpectationResolver`] maps it onto the
//! datastores, content trees, volumes, network instances and top-level
//! app/base OS configs the device needs, reusing entities that already exist
//! so that resolving the same expectation twice yields the same IDs.
//!
//! Each resolution runs against a private copy of the config store and device.
//! The copy replaces the caller's state only if resolution succeeds, so a
//! structural error never leaves half of an entity graph behind.

use std::fmt;

use camino::Utf8PathBuf;
use edge_api_types::config::{ImageFormat, NetworkInstanceKind, VirtualizationMode};
use serde::Deserialize;
use thiserror::Error;

use crate::artifacts::{ArtifactError, Collaborators};
use crate::config::HarnessConfig;
use crate::device::Device;
use crate::store::{ConfigStore, StoreError};

mod application;
mod base_os;
mod content;
mod locator;
mod network;

#[cfg(test)]
pub(crate) mod fakes;

pub use locator::ArtifactLocator;

/// The format of the volumes created for an app's extra disks and declared
/// mount points.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum VolumesType {
    #[default]
    Qcow2,
    Qcow,
    Raw,
    Vmdk,
    Vhdx,
    Oci,

    /// Don't create volumes for declared mount points.
    None,
}

impl VolumesType {
    pub fn image_format(self) -> Option<ImageFormat> {
        match self {
            VolumesType::Qcow2 => Some(ImageFormat::Qcow2),
            VolumesType::Qcow => Some(ImageFormat::Qcow),
            VolumesType::Raw => Some(ImageFormat::Raw),
            VolumesType::Vmdk => Some(ImageFormat::Vmdk),
            VolumesType::Vhdx => Some(ImageFormat::Vhdx),
            VolumesType::Oci => Some(ImageFormat::Container),
            VolumesType::None => None,
        }
    }
}

/// A request to attach an app to a network instance.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NetworkRequest {
    /// Name of the network instance. Instances are matched by name when one
    /// is given, and by kind and subnet otherwise.
    #[serde(default)]
    pub name: Option<String>,

    pub kind: NetworkInstanceKind,

    #[serde(default)]
    pub subnet: Option<String>,

    /// Port mappings of the form `outer:inner`.
    #[serde(default)]
    pub port_publish: Vec<String>,

    #[serde(default)]
    pub mac_address: Option<String>,

    #[serde(default)]
    pub access_vlan_id: u32,

    /// Logical label of the device port a switch instance bridges onto.
    /// Defaults to the device model's first switch-capable adapter.
    #[serde(default)]
    pub uplink: Option<String>,
}

impl NetworkRequest {
    pub fn new(kind: NetworkInstanceKind) -> Self {
        Self {
            name: None,
            kind,
            subnet: None,
            port_publish: Vec::new(),
            mac_address: None,
            access_vlan_id: 0,
            uplink: None,
        }
    }
}

/// A declarative description of an artifact a device should run.
///
/// Setters follow the builder pattern; an expectation is never modified by
/// resolving it.
#[derive(Clone, Debug)]
pub struct Expectation {
    pub(crate) locator: ArtifactLocator,
    pub(crate) name: String,
    pub(crate) old_name: Option<String>,
    pub(crate) cpus: Option<u32>,
    pub(crate) memory_mib: Option<u32>,
    pub(crate) disk_size: Option<u64>,
    pub(crate) volume_size: Option<u64>,
    pub(crate) disks: Vec<String>,
    pub(crate) networks: Vec<NetworkRequest>,
    pub(crate) adapters: Vec<String>,
    pub(crate) user_data: Option<String>,
    pub(crate) vnc_display: u32,
    pub(crate) vnc_password: Option<String>,
    pub(crate) version: Option<String>,
    pub(crate) registry: Option<String>,
    pub(crate) datastore_override: Option<String>,
    pub(crate) format: Option<String>,
    pub(crate) volumes_type: VolumesType,
    pub(crate) virtualization_mode: VirtualizationMode,
    pub(crate) start_delay_secs: u32,
    pub(crate) profiles: Vec<String>,
    pub(crate) openstack_metadata: bool,
    pub(crate) sftp_load: bool,
}

impl Expectation {
    /// Creates an expectation for the artifact at `locator`, to be deployed
    /// under `name`.
    pub fn new(locator: &str, name: &str) -> Result<Self, ExpectationError> {
        Ok(Self {
            locator: ArtifactLocator::parse(locator)?,
            name: name.to_owned(),
            old_name: None,
            cpus: None,
            memory_mib: None,
            disk_size: None,
            volume_size: None,
            disks: Vec::new(),
            networks: Vec::new(),
            adapters: Vec::new(),
            user_data: None,
            vnc_display: 0,
            vnc_password: None,
            version: None,
            registry: None,
            datastore_override: None,
            format: None,
            volumes_type: VolumesType::default(),
            virtualization_mode: VirtualizationMode::default(),
            start_delay_secs: 0,
            profiles: Vec::new(),
            openstack_metadata: false,
            sftp_load: false,
        })
    }

    pub fn locator(&self) -> &ArtifactLocator {
        &self.locator
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name the app was previously deployed under. An existing app with
    /// this name is not considered a match.
    pub fn old_name(&mut self, name: &str) -> &mut Self {
        self.old_name = Some(name.to_owned());
        self
    }

    pub fn cpus(&mut self, cpus: u32) -> &mut Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn memory_mib(&mut self, mib: u32) -> &mut Self {
        self.memory_mib = Some(mib);
        self
    }

    /// Sets the size of the artifact's own volume.
    pub fn disk_size(&mut self, bytes: u64) -> &mut Self {
        self.disk_size = Some(bytes);
        self
    }

    /// Sets the size of volumes created for extra disks and mount points.
    pub fn volume_size(&mut self, bytes: u64) -> &mut Self {
        self.volume_size = Some(bytes);
        self
    }

    /// Adds an extra disk, either a bare locator or `src=<locator>,dst=<dir>`.
    pub fn disk(&mut self, disk: &str) -> &mut Self {
        self.disks.push(disk.to_owned());
        self
    }

    pub fn network(&mut self, request: NetworkRequest) -> &mut Self {
        self.networks.push(request);
        self
    }

    /// Passes the named host adapter through to the app.
    pub fn adapter(&mut self, name: &str) -> &mut Self {
        self.adapters.push(name.to_owned());
        self
    }

    pub fn user_data(&mut self, data: &str) -> &mut Self {
        self.user_data = Some(data.to_owned());
        self
    }

    pub fn vnc(&mut self, display: u32, password: Option<&str>) -> &mut Self {
        self.vnc_display = display;
        self.vnc_password = password.map(str::to_owned);
        self
    }

    /// Overrides the artifact's version (the image tag, or the base OS
    /// version).
    pub fn version(&mut self, version: &str) -> &mut Self {
        self.version = Some(version.to_owned());
        self
    }

    /// Overrides the registry a docker reference is fetched from.
    pub fn registry(&mut self, registry: &str) -> &mut Self {
        self.registry = Some(registry.to_owned());
        self
    }

    /// Replaces the FQDN of the datastore the artifact is fetched from.
    pub fn datastore_override(&mut self, fqdn: &str) -> &mut Self {
        self.datastore_override = Some(fqdn.to_owned());
        self
    }

    pub fn format(&mut self, format: &str) -> &mut Self {
        self.format = Some(format.to_owned());
        self
    }

    pub fn volumes_type(&mut self, ty: VolumesType) -> &mut Self {
        self.volumes_type = ty;
        self
    }

    pub fn virtualization_mode(
        &mut self,
        mode: VirtualizationMode,
    ) -> &mut Self {
        self.virtualization_mode = mode;
        self
    }

    pub fn start_delay_secs(&mut self, secs: u32) -> &mut Self {
        self.start_delay_secs = secs;
        self
    }

    pub fn profile(&mut self, profile: &str) -> &mut Self {
        self.profiles.push(profile.to_owned());
        self
    }

    pub fn openstack_metadata(&mut self, enabled: bool) -> &mut Self {
        self.openstack_metadata = enabled;
        self
    }

    /// Has the device fetch `file://` artifacts over SFTP.
    pub fn sftp_load(&mut self, enabled: bool) -> &mut Self {
        self.sftp_load = enabled;
        self
    }
}

/// Errors that make an expectation impossible to resolve.
#[derive(Debug, Error)]
pub enum ExpectationError {
    #[error("malformed locator {locator:?}: {reason}")]
    MalformedLocator { locator: String, reason: String },

    #[error("unsupported artifact {locator}: {reason}")]
    UnsupportedArtifact { locator: String, reason: String },

    #[error("cannot parse disk {0:?} (expected src=<locator>,dst=<dir>)")]
    BadDiskExpression(String),

    #[error("unknown image format {0:?}")]
    UnknownFormat(String),

    #[error("invalid subnet {0:?}")]
    BadSubnet(String),

    #[error("cannot parse port mapping {0:?} (expected <outer>:<inner>)")]
    BadPortMapping(String),

    #[error("device has no physical adapter {adapter:?} to bridge a switch onto")]
    MissingSwitchAdapter { adapter: String },

    #[error(
        "file server holds {path} with sha256 {actual}, expected {expected}"
    )]
    UploadMismatch { path: Utf8PathBuf, expected: String, actual: String },

    #[error("cannot determine base OS version for {locator}")]
    UnknownVersion { locator: String },

    #[error("invalid rootfs version pattern")]
    VersionPattern(#[from] regex::Error),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A failure to look up optional metadata about an artifact. Resolution
/// carries on with default values and reports these alongside its result.
#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("cannot read manifest of {reference}")]
    Manifest {
        reference: String,
        #[source]
        source: ArtifactError,
    },

    #[error("cannot read image config of {reference}")]
    Config {
        reference: String,
        #[source]
        source: ArtifactError,
    },

    #[error("no empty-volume artifact configured for {0:?} volumes")]
    NoEmptyVolumeLink(VolumesType),
}

#[derive(Debug)]
pub struct ResolvedApp {
    pub app_id: String,
    /// False if an existing app satisfied the expectation.
    pub created: bool,
    pub warnings: Vec<EnrichmentError>,
}

#[derive(Debug)]
pub struct ResolvedBaseOs {
    pub base_os_id: String,
    pub created: bool,
    /// The volume provisioned for the base OS drive, if one was requested.
    pub volume_id: Option<String>,
}

#[derive(Debug)]
pub struct ResolvedVolume {
    pub volume_id: String,
    pub created: bool,
}

/// Scratch copies of the config store and device that a resolution mutates
/// before they are committed.
struct Txn {
    store: ConfigStore,
    device: Device,
    warnings: Vec<EnrichmentError>,
}

impl Txn {
    fn begin(store: &ConfigStore, device: &Device) -> Self {
        Self { store: store.clone(), device: device.clone(), warnings: Vec::new() }
    }

    fn commit(
        self,
        store: &mut ConfigStore,
        device: &mut Device,
    ) -> Vec<EnrichmentError> {
        *store = self.store;
        *device = self.device;
        self.warnings
    }
}

/// Resolves expectations against a config store and device.
pub struct ExpectationResolver<'a> {
    config: &'a HarnessConfig,
    collaborators: &'a Collaborators,
}

impl fmt::Debug for ExpectationResolver<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpectationResolver")
            .field("collaborators", self.collaborators)
            .finish_non_exhaustive()
    }
}

impl<'a> ExpectationResolver<'a> {
    pub fn new(
        config: &'a HarnessConfig,
        collaborators: &'a Collaborators,
    ) -> Self {
        Self { config, collaborators }
    }

    /// Ensures `device` runs an app matching `exp`, creating whatever entities
    /// are missing.
    pub fn resolve_app(
        &self,
        store: &mut ConfigStore,
        device: &mut Device,
        exp: &Expectation,
    ) -> Result<ResolvedApp, ExpectationError> {
        let mut txn = Txn::begin(store, device);
        let (app_id, created) = self.app(&mut txn, exp)?;
        let warnings = txn.commit(store, device);
        Ok(ResolvedApp { app_id, created, warnings })
    }

    /// Ensures a base OS config matching `exp` exists and is assigned to
    /// `device`. With `with_drive`, a content tree and volume backing the
    /// base OS drive are provisioned as well.
    pub fn resolve_base_os(
        &self,
        store: &mut ConfigStore,
        device: &mut Device,
        exp: &Expectation,
        with_drive: bool,
    ) -> Result<ResolvedBaseOs, ExpectationError> {
        let mut txn = Txn::begin(store, device);
        let resolved = self.base_os(&mut txn, exp, with_drive)?;
        txn.commit(store, device);
        Ok(resolved)
    }

    /// Ensures `device` has a volume downloaded from the artifact in `exp`.
    pub fn resolve_volume(
        &self,
        store: &mut ConfigStore,
        device: &mut Device,
        exp: &Expectation,
    ) -> Result<ResolvedVolume, ExpectationError> {
        let mut txn = Txn::begin(store, device);
        let resolved = self.standalone_volume(&mut txn, exp)?;
        txn.commit(store, device);
        Ok(resolved)
    }
}
