// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The edge device test harness: interfaces for declaring the state a device
//! should reach, pushing it through a controller, and asserting on what the
//! device reports back.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use edge_api_types::DeviceConfigDocument;
use tracing::{error, info};
use uuid::Uuid;

pub mod artifacts;
pub mod assemble;
pub mod config;
pub mod controller;
pub mod device;
pub mod expect;
pub mod snapshot;
pub mod store;
pub mod telemetry;

use artifacts::Collaborators;
use config::HarnessConfig;
use controller::{ConfigEndpoint, ControllerError, TelemetryStreams};
use device::{Device, DeviceModel};
use expect::{
    Expectation, ExpectationResolver, ResolvedApp, ResolvedBaseOs,
    ResolvedVolume,
};
use store::ConfigStore;
use telemetry::{AssertionSession, TelemetryBus};

/// Everything a test needs to drive devices: the desired configuration of
/// each device, the services artifacts come from, and the controller that
/// carries configuration to devices and telemetry back.
pub struct Framework {
    config: HarnessConfig,
    collaborators: Collaborators,
    store: ConfigStore,
    devices: BTreeMap<Uuid, Device>,
    controller: Arc<dyn ConfigEndpoint>,
    bus: TelemetryBus,
}

impl Framework {
    pub fn new(
        config: HarnessConfig,
        collaborators: Collaborators,
        controller: Arc<dyn ConfigEndpoint>,
        telemetry: Arc<dyn TelemetryStreams>,
    ) -> Self {
        Self {
            config,
            collaborators,
            store: ConfigStore::new(),
            devices: BTreeMap::new(),
            controller,
            bus: TelemetryBus::new(telemetry),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn device(&self, id: Uuid) -> anyhow::Result<&Device> {
        self.devices.get(&id).ok_or_else(|| anyhow!("no device {id}"))
    }

    /// Registers a device of the given model.
    pub fn add_device(
        &mut self,
        id: Uuid,
        model: DeviceModel,
    ) -> anyhow::Result<()> {
        if self.devices.contains_key(&id) {
            anyhow::bail!("device {id} already registered");
        }

        let mut device = Device::new(id, model.clone());
        model
            .apply(&mut self.store, &mut device)
            .with_context(|| format!("applying {} model to {id}", model.name))?;
        self.devices.insert(id, device);
        Ok(())
    }

    /// Splits the borrow of `self` so a resolver can run against one device.
    fn parts(
        &mut self,
        id: Uuid,
    ) -> anyhow::Result<(ExpectationResolver<'_>, &mut ConfigStore, &mut Device)>
    {
        let device =
            self.devices.get_mut(&id).ok_or_else(|| anyhow!("no device {id}"))?;
        Ok((
            ExpectationResolver::new(&self.config, &self.collaborators),
            &mut self.store,
            device,
        ))
    }

    pub fn resolve_app(
        &mut self,
        device: Uuid,
        exp: &Expectation,
    ) -> anyhow::Result<ResolvedApp> {
        let (resolver, store, dev) = self.parts(device)?;
        resolver
            .resolve_app(store, dev, exp)
            .with_context(|| format!("resolving app {}", exp.name()))
    }

    pub fn resolve_base_os(
        &mut self,
        device: Uuid,
        exp: &Expectation,
        with_drive: bool,
    ) -> anyhow::Result<ResolvedBaseOs> {
        let (resolver, store, dev) = self.parts(device)?;
        resolver
            .resolve_base_os(store, dev, exp, with_drive)
            .with_context(|| format!("resolving base OS {}", exp.locator()))
    }

    pub fn resolve_volume(
        &mut self,
        device: Uuid,
        exp: &Expectation,
    ) -> anyhow::Result<ResolvedVolume> {
        let (resolver, store, dev) = self.parts(device)?;
        resolver
            .resolve_volume(store, dev, exp)
            .with_context(|| format!("resolving volume {}", exp.name()))
    }

    pub fn create_snapshot(
        &mut self,
        device: Uuid,
        volume_name: &str,
        name: Option<&str>,
    ) -> anyhow::Result<String> {
        let (_, store, dev) = self.parts(device)?;
        Ok(snapshot::create_snapshot(store, dev, volume_name, name)?)
    }

    pub fn delete_snapshot(
        &mut self,
        device: Uuid,
        name: &str,
    ) -> anyhow::Result<String> {
        let (_, store, dev) = self.parts(device)?;
        Ok(snapshot::delete_snapshot(store, dev, name)?)
    }

    pub fn rollback_snapshot(
        &mut self,
        device: Uuid,
        name: &str,
    ) -> anyhow::Result<u32> {
        let (_, store, dev) = self.parts(device)?;
        Ok(snapshot::rollback_snapshot(store, dev, name)?)
    }

    /// Renders the document the device would be sent by the next
    /// [`config_sync`](Self::config_sync), without sending it.
    pub fn render(&self, device: Uuid) -> anyhow::Result<DeviceConfigDocument> {
        let device = self.device(device)?;
        Ok(assemble::assemble(&self.store, device)?)
    }

    /// Assembles the device's configuration under a new generation and
    /// pushes it to the controller, retrying transport failures for up to
    /// the configured retry budget.
    pub async fn config_sync(&mut self, device: Uuid) -> anyhow::Result<()> {
        let mut next = self.device(device)?.clone();
        next.bump_generation();

        let doc = assemble::assemble(&self.store, &next)?;
        let bytes = assemble::to_json_bytes(&doc)?;

        let controller = &self.controller;
        let push = || async {
            controller.config_set(device, bytes.clone()).await.map_err(|e| {
                match e {
                    ControllerError::Transport(_) => {
                        info!(%e, "retriable error from config_set");
                        backoff::Error::transient(e)
                    }
                    _ => {
                        error!(%e, "permanent error from config_set");
                        backoff::Error::permanent(e)
                    }
                }
            })
        };

        backoff::future::retry(
            backoff::ExponentialBackoff {
                max_elapsed_time: Some(self.config.controller_retry),
                ..Default::default()
            },
            push,
        )
        .await
        .with_context(|| format!("pushing configuration to {device}"))?;

        info!(
            %device,
            generation = next.generation(),
            bytes = bytes.len(),
            "configuration pushed"
        );
        self.devices.insert(device, next);
        Ok(())
    }

    /// Starts a session for asserting on device telemetry.
    pub fn session(&self) -> AssertionSession {
        self.bus.session()
    }

    /// Stops every telemetry reader and cancels every waiting session.
    pub async fn shutdown(&self) {
        self.bus.shutdown().await;
    }
}
