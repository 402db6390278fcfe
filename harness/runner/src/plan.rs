// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Plans: TOML descriptions of what a device should run.
//!
//! ```toml
//! [[base_os]]
//! locator = "docker://lfedge/eve:9.1.0-kvm-amd64"
//!
//! [[apps]]
//! locator = "docker://nginx"
//! name = "web"
//! networks = [{ kind = "local", port_publish = ["8028:80"] }]
//!
//! [[snapshots]]
//! volume = "web_0_m_0"
//! name = "fresh"
//! ```

use anyhow::Context;
use camino::Utf8Path;
use edge_api_types::config::VirtualizationMode;
use harness_framework::expect::{Expectation, NetworkRequest, VolumesType};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    #[serde(default)]
    pub base_os: Vec<BaseOsPlan>,
    #[serde(default)]
    pub apps: Vec<AppPlan>,
    #[serde(default)]
    pub volumes: Vec<VolumePlan>,
    #[serde(default)]
    pub snapshots: Vec<SnapshotPlan>,
}

impl Plan {
    pub fn from_toml_path(path: &Utf8Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading plan {path}"))?;
        toml::from_str(&contents).with_context(|| format!("parsing plan {path}"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BaseOsPlan {
    pub locator: String,
    pub version: Option<String>,
    pub format: Option<String>,
    pub datastore: Option<String>,
    #[serde(default)]
    pub with_drive: bool,
    #[serde(default)]
    pub sftp: bool,
}

impl BaseOsPlan {
    pub fn expectation(&self) -> anyhow::Result<Expectation> {
        let mut exp = Expectation::new(&self.locator, "eve")?;
        if let Some(version) = &self.version {
            exp.version(version);
        }
        if let Some(format) = &self.format {
            exp.format(format);
        }
        if let Some(datastore) = &self.datastore {
            exp.datastore_override(datastore);
        }
        exp.sftp_load(self.sftp);
        Ok(exp)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppPlan {
    pub locator: String,
    pub name: String,
    pub old_name: Option<String>,
    pub cpus: Option<u32>,
    pub memory_mib: Option<u32>,
    pub disk_size: Option<u64>,
    pub volume_size: Option<u64>,
    #[serde(default)]
    pub disks: Vec<String>,
    #[serde(default)]
    pub networks: Vec<NetworkRequest>,
    #[serde(default)]
    pub adapters: Vec<String>,
    pub user_data: Option<String>,
    pub vnc_display: Option<u32>,
    pub vnc_password: Option<String>,
    pub version: Option<String>,
    pub registry: Option<String>,
    pub datastore: Option<String>,
    pub format: Option<String>,
    pub volumes_type: Option<VolumesType>,
    pub virtualization_mode: Option<VirtualizationMode>,
    #[serde(default)]
    pub start_delay_secs: u32,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub openstack_metadata: bool,
    #[serde(default)]
    pub sftp: bool,
}

impl AppPlan {
    pub fn expectation(&self) -> anyhow::Result<Expectation> {
        let mut exp = Expectation::new(&self.locator, &self.name)?;
        if let Some(old) = &self.old_name {
            exp.old_name(old);
        }
        if let Some(cpus) = self.cpus {
            exp.cpus(cpus);
        }
        if let Some(mib) = self.memory_mib {
            exp.memory_mib(mib);
        }
        if let Some(bytes) = self.disk_size {
            exp.disk_size(bytes);
        }
        if let Some(bytes) = self.volume_size {
            exp.volume_size(bytes);
        }
        for disk in &self.disks {
            exp.disk(disk);
        }
        for net in &self.networks {
            exp.network(net.clone());
        }
        for adapter in &self.adapters {
            exp.adapter(adapter);
        }
        if let Some(data) = &self.user_data {
            exp.user_data(data);
        }
        if let Some(display) = self.vnc_display {
            exp.vnc(display, self.vnc_password.as_deref());
        }
        if let Some(version) = &self.version {
            exp.version(version);
        }
        if let Some(registry) = &self.registry {
            exp.registry(registry);
        }
        if let Some(datastore) = &self.datastore {
            exp.datastore_override(datastore);
        }
        if let Some(format) = &self.format {
            exp.format(format);
        }
        if let Some(ty) = self.volumes_type {
            exp.volumes_type(ty);
        }
        if let Some(mode) = self.virtualization_mode {
            exp.virtualization_mode(mode);
        }
        for profile in &self.profiles {
            exp.profile(profile);
        }
        exp.start_delay_secs(self.start_delay_secs)
            .openstack_metadata(self.openstack_metadata)
            .sftp_load(self.sftp);
        Ok(exp)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumePlan {
    pub locator: String,
    pub name: String,
    pub size: Option<u64>,
    pub format: Option<String>,
}

impl VolumePlan {
    pub fn expectation(&self) -> anyhow::Result<Expectation> {
        let mut exp = Expectation::new(&self.locator, &self.name)?;
        if let Some(size) = self.size {
            exp.disk_size(size);
        }
        if let Some(format) = &self.format {
            exp.format(format);
        }
        Ok(exp)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotPlan {
    pub volume: String,
    pub name: Option<String>,
}
