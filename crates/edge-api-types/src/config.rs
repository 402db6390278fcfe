// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration entities.
//!
//! Entities refer to one another by ID only. Nothing here checks that a
//! reference resolves; that happens when a device's configuration document is
//! assembled.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Entity, Kind};

macro_rules! entity {
    ($ty:ty, $kind:expr, $($field:ident).+) => {
        impl Entity for $ty {
            const KIND: Kind = $kind;

            fn id(&self) -> &str {
                &self.$($field).+
            }
        }
    };
}

/// An entity ID together with the configuration generation it belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct UuidAndVersion {
    pub uuid: String,
    pub version: String,
}

impl UuidAndVersion {
    pub fn new(uuid: impl Into<String>, version: &str) -> Self {
        Self { uuid: uuid.into(), version: version.to_owned() }
    }
}

/// The transport a datastore serves artifacts over.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum DatastoreKind {
    ContainerRegistry,
    Http,
    Https,
    Sftp,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Datastore {
    pub id: String,
    pub kind: DatastoreKind,
    pub fqdn: String,
    /// Path prefix under `fqdn` at which artifacts live. Empty for registries.
    pub dpath: String,
    pub api_key: String,
    pub password: String,
}
entity!(Datastore, Kind::Datastore, id);

/// On-disk formats an artifact can be delivered in.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Container,
    Qcow2,
    Qcow,
    Raw,
    Vhd,
    Vmdk,
    Vhdx,
    Ova,
}

impl std::str::FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "container" | "oci" => Ok(ImageFormat::Container),
            "qcow2" => Ok(ImageFormat::Qcow2),
            "qcow" => Ok(ImageFormat::Qcow),
            "raw" => Ok(ImageFormat::Raw),
            "vhd" => Ok(ImageFormat::Vhd),
            "vmdk" => Ok(ImageFormat::Vmdk),
            "vhdx" => Ok(ImageFormat::Vhdx),
            "ova" => Ok(ImageFormat::Ova),
            _ => Err(s.to_owned()),
        }
    }
}

/// A downloadable artifact, located relative to a datastore.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ContentTree {
    pub id: String,
    pub datastore_id: String,
    pub url: String,
    pub display_name: String,
    pub format: ImageFormat,
    pub sha256: Option<String>,
    pub max_size_bytes: u64,
}
entity!(ContentTree, Kind::ContentTree, id);

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum VolumeOrigin {
    /// The volume is filled by downloading the referenced content tree.
    Download { content_tree_id: String },
    /// A blank volume.
    Blank,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Volume {
    pub id: String,
    pub display_name: String,
    pub origin: VolumeOrigin,
    pub max_size_bytes: u64,
}
entity!(Volume, Kind::Volume, id);

impl Volume {
    pub fn content_tree_id(&self) -> Option<&str> {
        match &self.origin {
            VolumeOrigin::Download { content_tree_id } => Some(content_tree_id),
            VolumeOrigin::Blank => None,
        }
    }
}

/// The image a base OS drive is written from.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct DriveImage {
    pub id: String,
    pub name: String,
    pub datastore_id: String,
    pub sha256: Option<String>,
    pub format: ImageFormat,
    pub size_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Drive {
    pub image: Option<DriveImage>,
    pub readonly: bool,
    pub max_size_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct BaseOsConfig {
    pub uuid_and_version: UuidAndVersion,
    pub drives: Vec<Drive>,
    pub activate: bool,
    pub base_os_version: String,
    pub volume_id: Option<String>,
}
entity!(BaseOsConfig, Kind::BaseOsConfig, uuid_and_version.uuid);

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum VirtualizationMode {
    Pv,
    #[default]
    Hvm,
    Filler,
    Fml,
    NoHyper,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct FixedResources {
    pub memory_kib: u32,
    pub max_memory_kib: u32,
    pub vcpus: u32,
    pub virtualization_mode: VirtualizationMode,
    pub rootdev: Option<String>,
    pub bootloader: Option<String>,
    pub enable_vnc: bool,
    pub vnc_display: u32,
    pub vnc_password: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct VolumeRef {
    pub uuid: String,
    pub mount_dir: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AclAction {
    /// Forward traffic arriving on the uplink port to the app port.
    PortMap { outer_port: u16, app_port: u16 },
    /// Permit everything the match allows.
    Allow,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct AclMatch {
    pub kind: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct AclEntry {
    pub id: u32,
    pub matches: Vec<AclMatch>,
    pub actions: Vec<AclAction>,
}

/// An app's attachment to a network instance.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct NetworkAdapter {
    pub name: String,
    pub network_id: String,
    pub acls: Vec<AclEntry>,
    pub mac_address: Option<String>,
    pub access_vlan_id: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PhysicalIoKind {
    NetEth,
    Usb,
    Noop,
}

/// A host adapter passed directly through to an app or used as a port.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Adapter {
    pub kind: PhysicalIoKind,
    pub name: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MetadataType {
    #[default]
    Default,
    OpenStack,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct AppInstanceConfig {
    pub uuid_and_version: UuidAndVersion,
    pub display_name: String,
    pub activate: bool,
    pub fixed_resources: FixedResources,
    pub volume_refs: Vec<VolumeRef>,
    pub interfaces: Vec<NetworkAdapter>,
    pub adapters: Vec<Adapter>,
    /// Base64-encoded user data handed to the app's metadata service.
    pub user_data: Option<String>,
    pub metadata_type: MetadataType,
    pub start_delay_secs: u32,
    pub profiles: Vec<String>,
}
entity!(AppInstanceConfig, Kind::AppInstanceConfig, uuid_and_version.uuid);

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum NetworkInstanceKind {
    Switch,
    Local,
    Cloud,
}

impl std::str::FromStr for NetworkInstanceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "switch" => Ok(NetworkInstanceKind::Switch),
            "local" => Ok(NetworkInstanceKind::Local),
            "cloud" => Ok(NetworkInstanceKind::Cloud),
            _ => Err(s.to_owned()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct IpRange {
    pub start: String,
    pub end: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DhcpMode {
    None,
    Static,
    Server,
    Client,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct IpSpec {
    pub dhcp: DhcpMode,
    pub subnet: String,
    pub gateway: String,
    pub dns: Vec<String>,
    pub dhcp_range: Option<IpRange>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct NetworkInstanceConfig {
    pub uuid_and_version: UuidAndVersion,
    pub display_name: String,
    pub kind: NetworkInstanceKind,
    pub activate: bool,
    pub port: Adapter,
    pub ip: Option<IpSpec>,
}
entity!(
    NetworkInstanceConfig,
    Kind::NetworkInstanceConfig,
    uuid_and_version.uuid
);

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct NetworkConfig {
    pub id: String,
    pub ip: IpSpec,
}
entity!(NetworkConfig, Kind::NetworkConfig, id);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PhysicalIoUsage {
    MgmtOnly,
    Shared,
    Dedicated,
    MgmtAndApps,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct PhysicalIo {
    pub id: String,
    pub kind: PhysicalIoKind,
    pub phy_label: String,
    pub logical_label: String,
    pub usage: PhysicalIoUsage,
    pub free_uplink: bool,
}
entity!(PhysicalIo, Kind::PhysicalIo, id);

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct SystemAdapter {
    pub id: String,
    pub name: String,
    pub uplink: bool,
    pub free_uplink: bool,
    pub network_uuid: String,
    pub lower_layer_name: String,
}
entity!(SystemAdapter, Kind::SystemAdapter, id);

/// A counter the device compares against its last-seen value to decide
/// whether to perform an operation again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct DeviceOpsCmd {
    pub counter: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Snapshot {
    pub id: String,
    pub volume_id: String,
    pub display_name: String,
    pub rollback: Option<DeviceOpsCmd>,
}
entity!(Snapshot, Kind::Snapshot, id);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn image_format_parses_aliases() {
        assert_eq!("oci".parse::<ImageFormat>(), Ok(ImageFormat::Container));
        assert_eq!("QCOW2".parse::<ImageFormat>(), Ok(ImageFormat::Qcow2));
        assert!("iso".parse::<ImageFormat>().is_err());
    }

    #[test]
    fn nested_ids_are_entity_ids() {
        let ni = NetworkInstanceConfig {
            uuid_and_version: UuidAndVersion::new("ni-1", "1"),
            display_name: "local".to_owned(),
            kind: NetworkInstanceKind::Local,
            activate: true,
            port: Adapter { kind: PhysicalIoKind::Noop, name: "uplink".into() },
            ip: None,
        };
        assert_eq!(ni.id(), "ni-1");
        assert_eq!(NetworkInstanceConfig::KIND, Kind::NetworkInstanceConfig);
    }

    #[test]
    fn volume_origin_serializes_tagged() {
        let vol = Volume {
            id: "v".to_owned(),
            display_name: "app_0_m_0".to_owned(),
            origin: VolumeOrigin::Download { content_tree_id: "ct".to_owned() },
            max_size_bytes: 0,
        };
        let json = serde_json::to_value(&vol).unwrap();
        assert_eq!(json["origin"]["type"], "download");
        assert_eq!(vol.content_tree_id(), Some("ct"));
    }
}
