// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the services that host the artifacts a device downloads.
//!
//! The resolver treats each of these as an opaque blocking call that returns
//! size, digest or manifest metadata. Implementations that speak HTTP to a
//! file server and to a registry live in the submodules.

use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8Path;
use serde::Deserialize;
use thiserror::Error;

pub mod digest;
mod eserver;
mod reference;
mod registry;

pub use eserver::EServerClient;
pub use reference::DockerReference;
pub use registry::RegistryInspector;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned status {status}")]
    Status { url: String, status: reqwest::StatusCode },

    #[error("failed to read {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },

    #[error("{0}")]
    Unsupported(String),
}

/// What a file server knows about one of its files.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileStatus {
    pub file_name: String,
    pub sha256: String,
    pub size: u64,
    #[serde(alias = "ISReady")]
    pub is_ready: bool,
}

/// A static file server from which a device downloads `file://` artifacts.
pub trait FileServer: Send + Sync {
    /// Returns the status of the file named `name`, or `None` if the server
    /// doesn't have it.
    fn status(&self, name: &str) -> Result<Option<FileStatus>, ArtifactError>;

    /// Uploads the local file at `path` and returns its status once stored.
    fn upload(&self, path: &Utf8Path) -> Result<FileStatus, ArtifactError>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManifestLayer {
    pub media_type: String,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageManifest {
    pub layers: Vec<ManifestLayer>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageConfig {
    /// Mount points the image declares as volumes.
    pub volumes: Vec<String>,
}

/// Fetches container image metadata from a registry.
pub trait ImageInspector: Send + Sync {
    fn manifest(
        &self,
        reference: &DockerReference,
    ) -> Result<ImageManifest, ArtifactError>;

    fn config(
        &self,
        reference: &DockerReference,
    ) -> Result<ImageConfig, ArtifactError>;
}

/// Packages a local directory as a container image and pushes it.
pub trait ImagePusher: Send + Sync {
    fn push_directory(
        &self,
        dir: &Utf8Path,
        tag: &str,
        registry: &str,
    ) -> Result<(), ArtifactError>;
}

/// The set of artifact services the resolver may call on.
#[derive(Clone)]
pub struct Collaborators {
    pub file_server: Arc<dyn FileServer>,
    pub inspector: Arc<dyn ImageInspector>,

    /// `None` if this run can't package directories; `directory://`
    /// expectations are then rejected.
    pub pusher: Option<Arc<dyn ImagePusher>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("pusher", &self.pusher.is_some())
            .finish_non_exhaustive()
    }
}
