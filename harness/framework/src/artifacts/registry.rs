// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reads image manifests and configs from an OCI distribution registry.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{
    ArtifactError, DockerReference, ImageConfig, ImageInspector,
    ImageManifest, ManifestLayer,
};

const MANIFEST_TYPES: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDescriptor {
    #[serde(default)]
    media_type: String,
    #[serde(default)]
    digest: String,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    #[serde(default)]
    platform: Option<RawPlatform>,
}

#[derive(Deserialize)]
struct RawPlatform {
    architecture: String,
    os: String,
}

#[derive(Deserialize)]
struct RawManifest {
    #[serde(default)]
    config: Option<RawDescriptor>,
    #[serde(default)]
    layers: Vec<RawDescriptor>,

    /// Present only when the reference names a multi-platform index.
    #[serde(default)]
    manifests: Vec<RawDescriptor>,
}

#[derive(Deserialize)]
struct RawConfigFile {
    #[serde(default)]
    config: RawContainerConfig,
}

#[derive(Default, Deserialize)]
struct RawContainerConfig {
    #[serde(rename = "Volumes", default)]
    volumes: Option<BTreeMap<String, serde_json::Value>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token")]
    token: String,
}

/// An [`ImageInspector`] that speaks the registry HTTP API v2.
///
/// Registries listed as insecure are contacted over plain HTTP. Anonymous
/// bearer tokens are fetched on demand when a registry challenges a request.
#[derive(Debug)]
pub struct RegistryInspector {
    client: reqwest::blocking::Client,
    insecure: BTreeSet<String>,
    architecture: String,
}

impl RegistryInspector {
    pub fn new(timeout: Duration) -> Result<Self, ArtifactError> {
        let client = reqwest::blocking::ClientBuilder::new()
            .timeout(timeout)
            .build()
            .map_err(|source| ArtifactError::Http {
                url: "<registry client>".to_owned(),
                source,
            })?;

        Ok(Self {
            client,
            insecure: BTreeSet::new(),
            architecture: "amd64".to_owned(),
        })
    }

    /// Marks `registry` (a `host:port` authority) as served over plain HTTP.
    pub fn insecure_registry(&mut self, registry: &str) -> &mut Self {
        self.insecure.insert(registry.to_owned());
        self
    }

    /// Sets the architecture to pick out of multi-platform indexes.
    pub fn architecture(&mut self, arch: &str) -> &mut Self {
        self.architecture = arch.to_owned();
        self
    }

    fn base_url(&self, reference: &DockerReference) -> String {
        let scheme =
            if self.insecure.contains(&reference.registry) { "http" } else { "https" };
        format!("{scheme}://{}/v2/{}", reference.registry, reference.repository)
    }

    fn fetch<T: DeserializeOwned>(
        &self,
        url: &str,
        accept: &str,
    ) -> Result<T, ArtifactError> {
        let http_err =
            |source| ArtifactError::Http { url: url.to_owned(), source };

        let mut response = self
            .client
            .get(url)
            .header(ACCEPT, accept)
            .send()
            .map_err(http_err)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let Some(challenge) = challenge else {
                return Err(ArtifactError::Status {
                    url: url.to_owned(),
                    status: response.status(),
                });
            };

            let token = self.anonymous_token(url, &challenge)?;
            response = self
                .client
                .get(url)
                .header(ACCEPT, accept)
                .bearer_auth(token)
                .send()
                .map_err(http_err)?;
        }

        if !response.status().is_success() {
            return Err(ArtifactError::Status {
                url: url.to_owned(),
                status: response.status(),
            });
        }

        response.json::<T>().map_err(|e| ArtifactError::Malformed {
            url: url.to_owned(),
            reason: e.to_string(),
        })
    }

    fn anonymous_token(
        &self,
        url: &str,
        challenge: &str,
    ) -> Result<String, ArtifactError> {
        let params = parse_bearer_challenge(challenge).ok_or_else(|| {
            ArtifactError::Malformed {
                url: url.to_owned(),
                reason: format!("unsupported auth challenge {challenge:?}"),
            }
        })?;
        let realm = params.get("realm").cloned().unwrap_or_default();
        let query: Vec<(&str, &str)> = params
            .iter()
            .filter(|(k, _)| k.as_str() != "realm")
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        debug!(%realm, "requesting anonymous registry token");
        let response = self
            .client
            .get(&realm)
            .query(&query)
            .send()
            .map_err(|source| ArtifactError::Http { url: realm.clone(), source })?;
        if !response.status().is_success() {
            return Err(ArtifactError::Status {
                url: realm,
                status: response.status(),
            });
        }

        response.json::<TokenResponse>().map(|t| t.token).map_err(|e| {
            ArtifactError::Malformed { url: realm, reason: e.to_string() }
        })
    }

    fn raw_manifest(
        &self,
        reference: &DockerReference,
    ) -> Result<RawManifest, ArtifactError> {
        let base = self.base_url(reference);
        let url = format!("{base}/manifests/{}", reference.manifest_ref());
        let manifest: RawManifest = self.fetch(&url, MANIFEST_TYPES)?;
        if manifest.manifests.is_empty() {
            return Ok(manifest);
        }

        let chosen = manifest
            .manifests
            .iter()
            .find(|m| {
                m.platform.as_ref().is_some_and(|p| {
                    p.os == "linux" && p.architecture == self.architecture
                })
            })
            .or_else(|| manifest.manifests.first())
            .ok_or_else(|| ArtifactError::Malformed {
                url: url.clone(),
                reason: "empty image index".to_owned(),
            })?;

        debug!(%url, digest = chosen.digest, "following image index entry");
        let url = format!("{base}/manifests/{}", chosen.digest);
        self.fetch(&url, MANIFEST_TYPES)
    }
}

impl ImageInspector for RegistryInspector {
    fn manifest(
        &self,
        reference: &DockerReference,
    ) -> Result<ImageManifest, ArtifactError> {
        let raw = self.raw_manifest(reference)?;
        Ok(ImageManifest {
            layers: raw
                .layers
                .into_iter()
                .map(|l| ManifestLayer {
                    media_type: l.media_type,
                    annotations: l.annotations,
                })
                .collect(),
        })
    }

    fn config(
        &self,
        reference: &DockerReference,
    ) -> Result<ImageConfig, ArtifactError> {
        let raw = self.raw_manifest(reference)?;
        let base = self.base_url(reference);
        let Some(config) = raw.config else {
            return Err(ArtifactError::Malformed {
                url: base,
                reason: "manifest has no config descriptor".to_owned(),
            });
        };

        let url = format!("{base}/blobs/{}", config.digest);
        let file: RawConfigFile = self.fetch(&url, "*/*")?;
        Ok(ImageConfig {
            volumes: file
                .config
                .volumes
                .map(|v| v.into_keys().collect())
                .unwrap_or_default(),
        })
    }
}

/// Parses `Bearer realm="...",service="...",scope="..."` into its parameters.
fn parse_bearer_challenge(challenge: &str) -> Option<BTreeMap<String, String>> {
    let rest = challenge.strip_prefix("Bearer ")?;
    let mut params = BTreeMap::new();
    for part in rest.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        params.insert(key.to_owned(), value.trim_matches('"').to_owned());
    }
    params.contains_key("realm").then_some(params)
}
