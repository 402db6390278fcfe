// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions for the configuration entities a controller holds for an edge
//! device, the document a device is configured with, and the telemetry a
//! device reports back.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod document;
pub mod telemetry;

pub use document::DeviceConfigDocument;

/// The kinds of configuration entity a controller can hold. Entity IDs are
/// unique within a kind.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    JsonSchema,
    strum::Display,
    strum::EnumIter,
)]
pub enum Kind {
    Datastore,
    ContentTree,
    Volume,
    #[strum(to_string = "BaseOSConfig")]
    BaseOsConfig,
    AppInstanceConfig,
    NetworkInstanceConfig,
    NetworkConfig,
    #[strum(to_string = "PhysicalIO")]
    PhysicalIo,
    SystemAdapter,
    Snapshot,
}

/// Implemented by every configuration entity so that stores can key it.
pub trait Entity: Clone + std::fmt::Debug {
    const KIND: Kind;

    fn id(&self) -> &str;
}
