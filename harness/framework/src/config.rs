// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Settings shared by every component of a harness run.
//!
//! A [`HarnessConfig`] is built once (usually from a TOML file) and passed by
//! reference to the components that need it.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use camino::Utf8Path;
use serde::Deserialize;

use crate::expect::VolumesType;

/// The address of a service the harness talks to.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self { host: host.to_owned(), port }
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// The static file server that serves `file://` artifacts to the device.
    pub file_server: Endpoint,

    /// The registry `directory://` artifacts are pushed into.
    pub local_registry: Endpoint,

    /// The registry used for docker references that don't name one.
    pub default_registry: String,

    /// Prefix to apply to uploaded file names when the device fetches them
    /// over SFTP rather than HTTP.
    pub sftp_prefix: Option<String>,

    pub default_cpus: u32,
    pub default_memory_mib: u32,

    /// Size given to volumes created for image mount points and extra disks.
    pub default_volume_size_bytes: u64,

    /// Artifacts used to back blank volumes, keyed by volume type.
    pub empty_volume_links: BTreeMap<VolumesType, String>,

    /// Subnet to use for local network instances that don't specify one.
    pub default_local_subnet: String,

    /// Pattern a rootfs file stem must match to be used as a base OS version.
    pub rootfs_version_pattern: String,

    /// How long `config_sync` keeps retrying a controller that is refusing
    /// configuration.
    #[serde(with = "secs")]
    pub controller_retry: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let empty_volume_links = [
            (VolumesType::Qcow2, "file:///var/lib/harness/empty.qcow2"),
            (VolumesType::Qcow, "file:///var/lib/harness/empty.qcow"),
            (VolumesType::Raw, "file:///var/lib/harness/empty.raw"),
            (VolumesType::Vmdk, "file:///var/lib/harness/empty.vmdk"),
            (VolumesType::Vhdx, "file:///var/lib/harness/empty.vhdx"),
            (VolumesType::Oci, "docker://lfedge/eden-docker-empty:latest"),
        ]
        .into_iter()
        .map(|(k, v)| (k, v.to_owned()))
        .collect();

        Self {
            file_server: Endpoint::new("127.0.0.1", 8888),
            local_registry: Endpoint::new("127.0.0.1", 5050),
            default_registry: "registry-1.docker.io".to_owned(),
            sftp_prefix: None,
            default_cpus: 1,
            default_memory_mib: 1024,
            default_volume_size_bytes: 200 * 1024 * 1024,
            empty_volume_links,
            default_local_subnet: "10.11.12.0/24".to_owned(),
            rootfs_version_pattern:
                r"^(\d+\.\d+\.\d+|0\.0\.0-[\w.-]+)-(kvm|xen|acrn|kubevirt)-(amd64|arm64|riscv64)$"
                    .to_owned(),
            controller_retry: Duration::from_secs(30),
        }
    }
}

impl HarnessConfig {
    pub fn from_toml_path(path: &Utf8Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading harness config {path}"))?;
        toml::from_str(&contents)
            .with_context(|| format!("parsing harness config {path}"))
    }

    pub fn file_server_url(&self) -> String {
        format!("http://{}", self.file_server.authority())
    }
}

mod secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
