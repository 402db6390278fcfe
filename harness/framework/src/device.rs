// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Devices under test and the hardware models they emulate.

use std::collections::BTreeMap;

use edge_api_types::config::{
    DhcpMode, IpRange, IpSpec, NetworkConfig, PhysicalIo, PhysicalIoKind,
    PhysicalIoUsage, SystemAdapter,
};
use edge_api_types::Kind;
use tracing::info;
use uuid::Uuid;

use crate::store::{ConfigStore, StoreError};

/// A device's desired state, expressed as lists of entity IDs in the config
/// store.
///
/// A device never owns the entities it refers to. The lists keep the order in
/// which IDs were added, which is the order they appear in the device's
/// configuration document.
#[derive(Clone, Debug)]
pub struct Device {
    id: Uuid,
    model: DeviceModel,
    members: BTreeMap<Kind, Vec<String>>,
    generation: u64,
}

impl Device {
    pub fn new(id: Uuid, model: DeviceModel) -> Self {
        Self { id, model, members: BTreeMap::new(), generation: 1 }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The version stamped on the next configuration document rendered for
    /// this device.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Moves to a new configuration generation, so the device notices the
    /// next document differs from the last one it applied.
    pub fn bump_generation(&mut self) {
        self.generation += 1;
    }

    pub fn model(&self) -> &DeviceModel {
        &self.model
    }

    /// The IDs of the entities of `kind` this device should have.
    pub fn ids(&self, kind: Kind) -> &[String] {
        self.members.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn has(&self, kind: Kind, id: &str) -> bool {
        self.ids(kind).iter().any(|x| x == id)
    }

    /// Appends `id` to the list for `kind` unless it is already present.
    pub fn push(&mut self, kind: Kind, id: &str) {
        let list = self.members.entry(kind).or_default();
        if !list.iter().any(|x| x == id) {
            list.push(id.to_owned());
        }
    }

    /// Removes `id` from the list for `kind`. Returns whether it was present.
    pub fn remove(&mut self, kind: Kind, id: &str) -> bool {
        let Some(list) = self.members.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|x| x != id);
        list.len() != before
    }
}

/// The physical topology of a kind of device: the network ports it exposes
/// and how they are wired up by default.
#[derive(Clone, Debug)]
pub struct DeviceModel {
    pub name: String,
    pub physical_ios: Vec<PhysicalIo>,
    pub networks: Vec<NetworkConfig>,
    pub system_adapters: Vec<SystemAdapter>,

    /// Logical labels of the ports switch network instances may bridge onto.
    pub adapters_for_switch: Vec<String>,
}

const NET_DHCP_ID: &str = "6822e35f-c1b8-43ca-b344-0bbc0ece8cf1";
const NET_NO_DHCP_ID: &str = "6822e35f-c1b8-43ca-b344-0bbc0ece8cf2";

impl DeviceModel {
    /// The two-port virtual machine model the emulator boots by default.
    pub fn qemu() -> Self {
        let eth = |label: &str| PhysicalIo {
            id: String::new(),
            kind: PhysicalIoKind::NetEth,
            phy_label: label.to_owned(),
            logical_label: label.to_owned(),
            usage: PhysicalIoUsage::MgmtAndApps,
            free_uplink: true,
        };
        let network = |id: &str, dhcp| NetworkConfig {
            id: id.to_owned(),
            ip: IpSpec {
                dhcp,
                subnet: String::new(),
                gateway: String::new(),
                dns: Vec::new(),
                dhcp_range: Some(IpRange {
                    start: String::new(),
                    end: String::new(),
                }),
            },
        };
        let adapter = |name: &str, network: &str| SystemAdapter {
            id: String::new(),
            name: name.to_owned(),
            uplink: true,
            free_uplink: true,
            network_uuid: network.to_owned(),
            lower_layer_name: name.to_owned(),
        };

        Self {
            name: "qemu".to_owned(),
            physical_ios: vec![eth("eth0"), eth("eth1")],
            networks: vec![
                network(NET_DHCP_ID, DhcpMode::Client),
                network(NET_NO_DHCP_ID, DhcpMode::None),
            ],
            system_adapters: vec![
                adapter("eth0", NET_DHCP_ID),
                adapter("eth1", NET_NO_DHCP_ID),
            ],
            adapters_for_switch: vec!["eth1".to_owned()],
        }
    }

    /// Registers this model's networks, adapters and physical IOs in `store`
    /// and points `device` at them.
    ///
    /// Network configs use the model's fixed IDs and are shared between
    /// devices of the same model; adapters and physical IOs get fresh IDs per
    /// device.
    pub fn apply(
        &self,
        store: &mut ConfigStore,
        device: &mut Device,
    ) -> Result<(), StoreError> {
        for network in &self.networks {
            if !store.contains::<NetworkConfig>(&network.id) {
                store.add(network.clone())?;
            }
            device.push(Kind::NetworkConfig, &network.id);
        }

        for adapter in &self.system_adapters {
            let adapter = SystemAdapter {
                id: Uuid::new_v4().to_string(),
                ..adapter.clone()
            };
            device.push(Kind::SystemAdapter, &adapter.id);
            store.add(adapter)?;
        }

        for pio in &self.physical_ios {
            let pio = PhysicalIo { id: Uuid::new_v4().to_string(), ..pio.clone() };
            device.push(Kind::PhysicalIo, &pio.id);
            store.add(pio)?;
        }

        info!(device = %device.id(), model = self.name, "applied device model");
        Ok(())
    }

    pub fn first_adapter_for_switch(&self) -> Option<&str> {
        self.adapters_for_switch.first().map(String::as_str)
    }
}
