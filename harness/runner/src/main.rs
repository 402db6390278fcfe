// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod config;
mod plan;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use config::{ProcessArgs, RenderOptions};
use edge_api_types::DeviceConfigDocument;
use harness_framework::artifacts::{
    Collaborators, EServerClient, RegistryInspector,
};
use harness_framework::assemble;
use harness_framework::config::HarnessConfig;
use harness_framework::device::{Device, DeviceModel};
use harness_framework::expect::ExpectationResolver;
use harness_framework::snapshot;
use harness_framework::store::ConfigStore;
use plan::Plan;
use tracing::{info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};
use uuid::Uuid;

fn main() -> anyhow::Result<()> {
    let runner_args = ProcessArgs::parse();
    set_tracing_subscriber(&runner_args);

    info!(?runner_args);

    match &runner_args.command {
        config::Command::Render(opts) => render(opts),
        config::Command::Schema => {
            let schema = schemars::schema_for!(DeviceConfigDocument);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
    }
}

fn render(opts: &RenderOptions) -> anyhow::Result<()> {
    let config = match &opts.config {
        Some(path) => HarnessConfig::from_toml_path(path)?,
        None => HarnessConfig::default(),
    };
    let plan = Plan::from_toml_path(&opts.plan)?;

    let timeout = Duration::from_secs(opts.request_timeout_secs);
    let mut inspector = RegistryInspector::new(timeout)?;
    for registry in &opts.insecure_registries {
        inspector.insecure_registry(registry);
    }
    let collaborators = Collaborators {
        file_server: Arc::new(EServerClient::new(
            &config.file_server_url(),
            timeout,
        )?),
        inspector: Arc::new(inspector),
        pusher: None,
    };

    let model = DeviceModel::qemu();
    let mut store = ConfigStore::new();
    let mut device =
        Device::new(opts.device_id.unwrap_or_else(Uuid::new_v4), model.clone());
    model.apply(&mut store, &mut device)?;

    let resolver = ExpectationResolver::new(&config, &collaborators);
    for base in &plan.base_os {
        let exp = base.expectation()?;
        let resolved = resolver
            .resolve_base_os(&mut store, &mut device, &exp, base.with_drive)
            .with_context(|| format!("resolving base OS {}", base.locator))?;
        info!(id = resolved.base_os_id, created = resolved.created, "base OS");
    }
    for app in &plan.apps {
        let exp = app.expectation()?;
        let resolved = resolver
            .resolve_app(&mut store, &mut device, &exp)
            .with_context(|| format!("resolving app {}", app.name))?;
        for w in &resolved.warnings {
            warn!(app = app.name, warning = %w, "app resolved with warnings");
        }
        info!(id = resolved.app_id, created = resolved.created, "app");
    }
    for volume in &plan.volumes {
        let exp = volume.expectation()?;
        let resolved = resolver
            .resolve_volume(&mut store, &mut device, &exp)
            .with_context(|| format!("resolving volume {}", volume.name))?;
        info!(id = resolved.volume_id, created = resolved.created, "volume");
    }
    for snap in &plan.snapshots {
        snapshot::create_snapshot(
            &mut store,
            &mut device,
            &snap.volume,
            snap.name.as_deref(),
        )?;
    }

    let doc = assemble::assemble(&store, &device)?;
    let json = serde_json::to_string_pretty(&doc)?;
    match &opts.output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("writing document to {path}"))?,
        None => println!("{json}"),
    }

    Ok(())
}

fn set_tracing_subscriber(args: &ProcessArgs) {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into());
    let subscriber = Registry::default().with(filter.from_env_lossy());
    if args.emit_bunyan {
        let bunyan_layer =
            BunyanFormattingLayer::new("harness-runner".into(), std::io::stderr);
        let subscriber = subscriber.with(JsonStorageLayer).with(bunyan_layer);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    } else {
        let stderr_log = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_line_number(true)
            .with_ansi(!args.disable_ansi);
        let subscriber = subscriber.with(stderr_log);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    }
}
