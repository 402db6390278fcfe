// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve a plan against a fresh device and print the resulting
    /// configuration document.
    Render(RenderOptions),

    /// Print the JSON schema of the device configuration document.
    Schema,
}

/// Runtime configuration options for the runner.
#[derive(Debug, Parser)]
#[clap(verbatim_doc_comment)]
pub struct ProcessArgs {
    #[clap(subcommand)]
    pub command: Command,

    /// Suppress emission of terminal control codes in the runner's log output.
    #[clap(long, conflicts_with = "emit_bunyan")]
    pub disable_ansi: bool,

    /// Emit Bunyan-formatted logs.
    #[clap(long)]
    pub emit_bunyan: bool,
}

#[derive(Args, Debug)]
#[clap(verbatim_doc_comment)]
pub struct RenderOptions {
    /// The plan to resolve: a TOML file listing the base OS images, apps,
    /// volumes and snapshots the device should have.
    #[clap(long, value_parser)]
    pub plan: Utf8PathBuf,

    /// Harness settings (file server and registry addresses, defaults for
    /// new apps, and so on). Built-in defaults are used if omitted.
    #[clap(long, value_parser)]
    pub config: Option<Utf8PathBuf>,

    /// The ID of the device to render for. A random ID is used if omitted.
    #[clap(long)]
    pub device_id: Option<Uuid>,

    /// Registries to reach over plain HTTP rather than HTTPS.
    #[clap(long = "insecure-registry")]
    pub insecure_registries: Vec<String>,

    /// Per-request timeout for the file server and registries, in seconds.
    #[clap(long, default_value_t = 60)]
    pub request_timeout_secs: u64,

    /// Write the document here instead of to stdout.
    #[clap(long, value_parser)]
    pub output: Option<Utf8PathBuf>,
}
