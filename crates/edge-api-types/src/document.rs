// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::{
    AppInstanceConfig, BaseOsConfig, ContentTree, Datastore,
    NetworkConfig, NetworkInstanceConfig, PhysicalIo, Snapshot, SystemAdapter,
    UuidAndVersion, Volume,
};

/// The complete configuration a controller hands to one device.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct DeviceConfigDocument {
    pub id: UuidAndVersion,
    pub base: Vec<BaseOsConfig>,
    pub networks: Vec<NetworkConfig>,
    pub network_instances: Vec<NetworkInstanceConfig>,
    pub device_io_list: Vec<PhysicalIo>,
    pub system_adapter_list: Vec<SystemAdapter>,
    pub apps: Vec<AppInstanceConfig>,
    pub snapshots: Vec<Snapshot>,
    pub volumes: Vec<Volume>,
    pub content_info: Vec<ContentTree>,
    pub datastores: Vec<Datastore>,
}
