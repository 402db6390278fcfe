// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Datastore, content tree and volume resolution shared by every kind of
//! expectation.

use camino::{Utf8Path, Utf8PathBuf};
use edge_api_types::config::{
    ContentTree, Datastore, DatastoreKind, ImageFormat, Volume, VolumeOrigin,
};
use edge_api_types::Kind;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ArtifactLocator, Expectation, ExpectationError, ExpectationResolver, Txn};
use crate::artifacts::{digest, DockerReference};

/// The parts of an expectation that determine which artifact it names.
pub(super) struct ArtifactRequest<'e> {
    pub locator: &'e ArtifactLocator,
    pub version: Option<&'e str>,
    pub registry: Option<&'e str>,
    pub datastore_override: Option<&'e str>,
    pub format: Option<&'e str>,
    pub sftp_load: bool,
}

impl<'e> ArtifactRequest<'e> {
    pub fn from_expectation(exp: &'e Expectation) -> Self {
        Self {
            locator: &exp.locator,
            version: exp.version.as_deref(),
            registry: exp.registry.as_deref(),
            datastore_override: exp.datastore_override.as_deref(),
            format: exp.format.as_deref(),
            sftp_load: exp.sftp_load,
        }
    }

    /// A request for an auxiliary artifact (an extra disk or an empty volume)
    /// that inherits nothing from the expectation that mentions it.
    pub fn bare(locator: &'e ArtifactLocator, format: Option<&'e str>) -> Self {
        Self {
            locator,
            version: None,
            registry: None,
            datastore_override: None,
            format,
            sftp_load: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct DatastoreSpec {
    pub kind: DatastoreKind,
    pub fqdn: String,
    pub dpath: String,
}

/// What has to happen before a newly created content tree can be downloaded.
#[derive(Clone, Debug)]
pub(super) enum Source {
    /// Nothing: the artifact is already hosted somewhere.
    Hosted,
    /// A local file to put on the file server.
    File { path: Utf8PathBuf },
    /// A local directory to package and push to the local registry.
    Directory { path: Utf8PathBuf },
}

/// A fully described artifact, ready to be matched against existing content
/// trees.
#[derive(Clone, Debug)]
pub(super) struct ContentSpec {
    pub datastore: DatastoreSpec,
    /// Canonical URL relative to the datastore.
    pub url: String,
    pub format: ImageFormat,
    pub sha256: Option<String>,
    pub size_bytes: u64,
    pub source: Source,

    /// Set for artifacts that live in a container registry.
    pub reference: Option<DockerReference>,
}

impl ContentSpec {
    fn matches(&self, datastore_id: &str, ct: &ContentTree) -> bool {
        let digests_agree = match (&self.sha256, &ct.sha256) {
            (Some(ours), Some(theirs)) => ours.eq_ignore_ascii_case(theirs),
            _ => true,
        };

        ct.datastore_id == datastore_id
            && ct.url == self.url
            && ct.format == self.format
            && digests_agree
    }
}

pub(super) fn format_name(format: ImageFormat) -> &'static str {
    match format {
        ImageFormat::Container => "container",
        ImageFormat::Qcow2 => "qcow2",
        ImageFormat::Qcow => "qcow",
        ImageFormat::Raw => "raw",
        ImageFormat::Vhd => "vhd",
        ImageFormat::Vmdk => "vmdk",
        ImageFormat::Vhdx => "vhdx",
        ImageFormat::Ova => "ova",
    }
}

pub(super) fn parse_format(
    requested: Option<&str>,
    default: ImageFormat,
) -> Result<ImageFormat, ExpectationError> {
    match requested {
        None | Some("") => Ok(default),
        Some(s) => s.parse().map_err(ExpectationError::UnknownFormat),
    }
}

impl ExpectationResolver<'_> {
    /// Works out which datastore and URL an artifact request refers to,
    /// without touching the config store.
    pub(super) fn describe(
        &self,
        request: &ArtifactRequest<'_>,
    ) -> Result<ContentSpec, ExpectationError> {
        let mut spec = match request.locator {
            ArtifactLocator::Docker(raw) => {
                let reference =
                    DockerReference::parse(raw, &self.config.default_registry)
                        .map_err(|reason| ExpectationError::MalformedLocator {
                            locator: request.locator.to_string(),
                            reason,
                        })?;
                let version = request
                    .version
                    .unwrap_or_else(|| reference.version())
                    .to_owned();
                let registry = request
                    .registry
                    .unwrap_or(reference.registry.as_str())
                    .to_owned();
                let url = reference.repository_with_version(&version);
                let reference = DockerReference {
                    registry: registry.clone(),
                    tag: Some(version),
                    ..reference
                };

                ContentSpec {
                    datastore: DatastoreSpec {
                        kind: DatastoreKind::ContainerRegistry,
                        fqdn: format!("docker://{registry}"),
                        dpath: String::new(),
                    },
                    url,
                    format: parse_format(request.format, ImageFormat::Container)?,
                    sha256: None,
                    size_bytes: 0,
                    source: Source::Hosted,
                    reference: Some(reference),
                }
            }

            ArtifactLocator::Http(url) => {
                let host = url.host_str().unwrap_or_default();
                let authority = match url.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_owned(),
                };
                let mut segments: Vec<&str> =
                    url.path_segments().map(|s| s.collect()).unwrap_or_default();
                let file = segments.pop().unwrap_or_default();
                let kind = match url.scheme() {
                    "https" => DatastoreKind::Https,
                    _ => DatastoreKind::Http,
                };

                ContentSpec {
                    datastore: DatastoreSpec {
                        kind,
                        fqdn: format!("{}://{authority}", url.scheme()),
                        dpath: segments.join("/"),
                    },
                    url: match url.query() {
                        Some(query) => format!("{file}?{query}"),
                        None => file.to_owned(),
                    },
                    format: parse_format(request.format, ImageFormat::Qcow2)?,
                    sha256: None,
                    size_bytes: 0,
                    source: Source::Hosted,
                    reference: None,
                }
            }

            ArtifactLocator::File(path) => {
                let name = path.file_name().ok_or_else(|| {
                    ExpectationError::MalformedLocator {
                        locator: request.locator.to_string(),
                        reason: "path has no file name".to_owned(),
                    }
                })?;
                let size_bytes = std::fs::metadata(path)
                    .map_err(|source| crate::artifacts::ArtifactError::Io {
                        path: path.to_string(),
                        source,
                    })?
                    .len();
                let sha256 = digest::sha256_file(path)?;

                let (datastore, url) = match (
                    request.sftp_load,
                    self.config.sftp_prefix.as_deref(),
                ) {
                    (true, prefix) => (
                        DatastoreSpec {
                            kind: DatastoreKind::Sftp,
                            fqdn: self.config.file_server.authority(),
                            dpath: String::new(),
                        },
                        match prefix {
                            Some(prefix) => format!("{prefix}/{name}"),
                            None => name.to_owned(),
                        },
                    ),
                    (false, _) => (
                        DatastoreSpec {
                            kind: DatastoreKind::Http,
                            fqdn: self.config.file_server_url(),
                            dpath: "eserver".to_owned(),
                        },
                        name.to_owned(),
                    ),
                };

                ContentSpec {
                    datastore,
                    url,
                    format: parse_format(request.format, ImageFormat::Qcow2)?,
                    sha256: Some(sha256),
                    size_bytes,
                    source: Source::File { path: path.clone() },
                    reference: None,
                }
            }

            ArtifactLocator::Directory(path) => {
                let name = path.file_name().ok_or_else(|| {
                    ExpectationError::MalformedLocator {
                        locator: request.locator.to_string(),
                        reason: "path has no directory name".to_owned(),
                    }
                })?;
                let hash = digest::sha256_tree(path)?;
                let registry = self.config.local_registry.authority();
                let url = format!("harness/{name}:{hash}");
                let reference = DockerReference::parse(
                    &format!("{registry}/{url}"),
                    &self.config.default_registry,
                )
                .map_err(|reason| ExpectationError::MalformedLocator {
                    locator: request.locator.to_string(),
                    reason,
                })?;

                ContentSpec {
                    datastore: DatastoreSpec {
                        kind: DatastoreKind::ContainerRegistry,
                        fqdn: format!("docker://{registry}"),
                        dpath: String::new(),
                    },
                    url,
                    format: ImageFormat::Container,
                    sha256: None,
                    size_bytes: 0,
                    source: Source::Directory { path: path.clone() },
                    reference: Some(reference),
                }
            }
        };

        if let Some(fqdn) = request.datastore_override {
            spec.datastore.fqdn = fqdn.to_owned();
        }

        Ok(spec)
    }

    /// Returns the ID of a datastore matching `spec`, creating one if none
    /// exists.
    pub(super) fn datastore(
        &self,
        txn: &mut Txn,
        spec: &DatastoreSpec,
    ) -> Result<String, ExpectationError> {
        let existing = txn.store.list::<Datastore>().find(|ds| {
            ds.kind == spec.kind && ds.fqdn == spec.fqdn && ds.dpath == spec.dpath
        });
        if let Some(ds) = existing {
            debug!(id = ds.id, fqdn = ds.fqdn, "reusing datastore");
            return Ok(ds.id.clone());
        }

        let ds = Datastore {
            id: Uuid::new_v4().to_string(),
            kind: spec.kind,
            fqdn: spec.fqdn.clone(),
            dpath: spec.dpath.clone(),
            api_key: String::new(),
            password: String::new(),
        };
        info!(id = ds.id, fqdn = ds.fqdn, "created datastore");
        let id = ds.id.clone();
        txn.store.add(ds)?;
        Ok(id)
    }

    /// Returns the ID of a content tree on the device that matches `spec`,
    /// creating (and if necessary uploading) one if none does.
    pub(super) fn content_tree(
        &self,
        txn: &mut Txn,
        spec: &ContentSpec,
    ) -> Result<String, ExpectationError> {
        let datastore_id = self.datastore(txn, &spec.datastore)?;

        for ct_id in reachable_content_trees(txn) {
            let ct = txn.store.get::<ContentTree>(&ct_id)?;
            if spec.matches(&datastore_id, ct) {
                debug!(id = ct.id, url = ct.url, "reusing content tree");
                return Ok(ct_id);
            }
        }

        let (sha256, size_bytes) = self.materialize(spec)?;
        let ct = ContentTree {
            id: Uuid::new_v4().to_string(),
            datastore_id,
            url: spec.url.clone(),
            display_name: spec.url.clone(),
            format: spec.format,
            sha256,
            max_size_bytes: size_bytes,
        };
        info!(id = ct.id, url = ct.url, format = ?ct.format, "created content tree");

        let id = ct.id.clone();
        txn.store.add(ct)?;
        txn.device.push(Kind::ContentTree, &id);
        Ok(id)
    }

    /// Makes a new artifact available to the device. Returns the digest and
    /// size the content tree should advertise.
    pub(super) fn materialize(
        &self,
        spec: &ContentSpec,
    ) -> Result<(Option<String>, u64), ExpectationError> {
        match &spec.source {
            Source::Hosted => Ok((spec.sha256.clone(), spec.size_bytes)),
            Source::File { path } => self.upload(path, spec),
            Source::Directory { path } => {
                let pusher = self.collaborators.pusher.as_ref().ok_or_else(|| {
                    ExpectationError::UnsupportedArtifact {
                        locator: format!("directory://{path}"),
                        reason: "no image pusher is configured".to_owned(),
                    }
                })?;
                let registry = self.config.local_registry.authority();
                info!(%path, tag = spec.url, %registry, "pushing directory image");
                pusher.push_directory(path, &spec.url, &registry)?;
                Ok((None, 0))
            }
        }
    }

    fn upload(
        &self,
        path: &Utf8Path,
        spec: &ContentSpec,
    ) -> Result<(Option<String>, u64), ExpectationError> {
        let expected = spec.sha256.clone().unwrap_or_default();
        let server = &self.collaborators.file_server;
        let name = path.file_name().unwrap_or(path.as_str());

        let status = match server.status(name)? {
            Some(s)
                if s.is_ready
                    && s.size == spec.size_bytes
                    && s.sha256.eq_ignore_ascii_case(&expected) =>
            {
                debug!(%path, "file server already holds artifact");
                s
            }
            _ => server.upload(path)?,
        };

        if !status.sha256.eq_ignore_ascii_case(&expected)
            || status.size != spec.size_bytes
        {
            return Err(ExpectationError::UploadMismatch {
                path: path.to_owned(),
                expected,
                actual: status.sha256,
            });
        }

        info!(%path, size = status.size, sha256 = status.sha256, "artifact on file server");
        Ok((Some(status.sha256), status.size))
    }

    /// Returns the ID of the device volume named `{name}_{index}_m_0`. If
    /// there is none, `backing` supplies the content tree and maximum size
    /// for a new one; it is not called when a volume is reused.
    pub(super) fn volume(
        &self,
        txn: &mut Txn,
        name: &str,
        index: usize,
        backing: impl FnOnce(&mut Txn) -> Result<(String, u64), ExpectationError>,
    ) -> Result<(String, bool), ExpectationError> {
        let display_name = format!("{name}_{index}_m_0");
        for id in txn.device.ids(Kind::Volume) {
            let vol = txn.store.get::<Volume>(id)?;
            if vol.display_name == display_name {
                debug!(id = vol.id, name = display_name, "reusing volume");
                return Ok((vol.id.clone(), false));
            }
        }

        let (content_tree_id, max_size_bytes) = backing(txn)?;
        let vol = Volume {
            id: Uuid::new_v4().to_string(),
            display_name,
            origin: VolumeOrigin::Download { content_tree_id },
            max_size_bytes,
        };
        info!(id = vol.id, name = vol.display_name, "created volume");

        let id = vol.id.clone();
        txn.store.add(vol)?;
        txn.device.push(Kind::Volume, &id);
        Ok((id, true))
    }

    /// Resolves a standalone volume: one volume downloaded from the
    /// expectation's artifact.
    pub(super) fn standalone_volume(
        &self,
        txn: &mut Txn,
        exp: &Expectation,
    ) -> Result<super::ResolvedVolume, ExpectationError> {
        let spec = self.describe(&ArtifactRequest::from_expectation(exp))?;
        let (volume_id, created) = self.volume(txn, &exp.name, 0, |txn| {
            let ct_id = self.content_tree(txn, &spec)?;
            let size = match exp.disk_size {
                Some(size) => size,
                None => txn.store.get::<ContentTree>(&ct_id)?.max_size_bytes,
            };
            Ok((ct_id, size))
        })?;
        Ok(super::ResolvedVolume { volume_id, created })
    }
}

/// The content trees a device already downloads, in device order: those
/// behind its volumes first, then those behind its base OS volumes.
fn reachable_content_trees(txn: &Txn) -> Vec<String> {
    use edge_api_types::config::BaseOsConfig;

    let mut volume_ids: Vec<&str> =
        txn.device.ids(Kind::Volume).iter().map(String::as_str).collect();
    for id in txn.device.ids(Kind::BaseOsConfig) {
        if let Ok(base) = txn.store.get::<BaseOsConfig>(id) {
            if let Some(vol) = &base.volume_id {
                volume_ids.push(vol);
            }
        }
    }

    let mut out: Vec<String> = Vec::new();
    for id in volume_ids {
        let Ok(vol) = txn.store.get::<Volume>(id) else {
            continue;
        };
        if let Some(ct) = vol.content_tree_id() {
            if !out.iter().any(|x| x == ct) && txn.store.contains::<ContentTree>(ct) {
                out.push(ct.to_owned());
            }
        }
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::expect::fakes::Fixture;
    use crate::expect::Expectation;

    #[test]
    fn docker_references_share_a_datastore_per_registry() {
        let fx = Fixture::new();
        let resolver = fx.resolver();

        let nginx = Expectation::new("docker://nginx", "a").unwrap();
        let redis = Expectation::new("docker://docker.io/library/redis:7", "b")
            .unwrap();
        let a = resolver.describe(&ArtifactRequest::from_expectation(&nginx)).unwrap();
        let b = resolver.describe(&ArtifactRequest::from_expectation(&redis)).unwrap();

        assert_eq!(a.datastore, b.datastore);
        assert_eq!(a.datastore.fqdn, "docker://registry-1.docker.io");
        assert_eq!(a.url, "library/nginx:latest");
        assert_eq!(b.url, "library/redis:7");
    }

    #[test]
    fn version_and_registry_overrides_apply() {
        let fx = Fixture::new();
        let resolver = fx.resolver();

        let mut exp = Expectation::new("docker://nginx:1.0", "a").unwrap();
        exp.version("1.25").registry("mirror.local:5000");
        let spec =
            resolver.describe(&ArtifactRequest::from_expectation(&exp)).unwrap();
        assert_eq!(spec.url, "library/nginx:1.25");
        assert_eq!(spec.datastore.fqdn, "docker://mirror.local:5000");
        assert_eq!(
            spec.reference.unwrap().to_string(),
            "mirror.local:5000/library/nginx:1.25"
        );

        let mut exp = Expectation::new("docker://nginx", "a").unwrap();
        exp.datastore_override("docker://override.example");
        let spec =
            resolver.describe(&ArtifactRequest::from_expectation(&exp)).unwrap();
        assert_eq!(spec.datastore.fqdn, "docker://override.example");
    }

    #[test]
    fn http_locators_split_into_datastore_and_file() {
        let fx = Fixture::new();
        let exp =
            Expectation::new("https://images.example.com/vm/disk.img", "vm")
                .unwrap();
        let spec = fx
            .resolver()
            .describe(&ArtifactRequest::from_expectation(&exp))
            .unwrap();

        assert_eq!(spec.datastore.kind, DatastoreKind::Https);
        assert_eq!(spec.datastore.fqdn, "https://images.example.com");
        assert_eq!(spec.datastore.dpath, "vm");
        assert_eq!(spec.url, "disk.img");
        assert_eq!(spec.format, ImageFormat::Qcow2);

        // Ports stay on the datastore; the query travels with the file.
        let exp = Expectation::new(
            "http://images.example.com:8080/a/b/disk.img?sig=abc#part",
            "vm",
        )
        .unwrap();
        let spec = fx
            .resolver()
            .describe(&ArtifactRequest::from_expectation(&exp))
            .unwrap();
        assert_eq!(spec.datastore.kind, DatastoreKind::Http);
        assert_eq!(spec.datastore.fqdn, "http://images.example.com:8080");
        assert_eq!(spec.datastore.dpath, "a/b");
        assert_eq!(spec.url, "disk.img?sig=abc");
    }

    #[test]
    fn unknown_formats_are_rejected() {
        let fx = Fixture::new();
        let mut exp = Expectation::new("docker://nginx", "a").unwrap();
        exp.format("floppy");
        assert!(matches!(
            fx.resolver().describe(&ArtifactRequest::from_expectation(&exp)),
            Err(ExpectationError::UnknownFormat(f)) if f == "floppy"
        ));
    }

    #[test]
    fn files_are_uploaded_once() {
        let mut fx = Fixture::new();
        let path = fx.write_file("disk.qcow2", b"not really a disk");
        let exp = Expectation::new(&format!("file://{path}"), "vm").unwrap();

        fx.resolve_volume(&exp).unwrap();
        assert_eq!(fx.file_server.uploads(), 1);

        // The second resolution finds the content tree on the device, so the
        // file server isn't consulted again.
        let again = fx.resolve_volume(&exp).unwrap();
        assert!(!again.created);
        assert_eq!(fx.file_server.uploads(), 1);

        let ct = fx.store.list::<ContentTree>().next().unwrap();
        assert_eq!(ct.url, "disk.qcow2");
        assert_eq!(ct.max_size_bytes, 17);
        assert!(ct.sha256.is_some());

        let ds = fx.store.get::<Datastore>(&ct.datastore_id).unwrap();
        assert_eq!(ds.fqdn, "http://127.0.0.1:8888");
        assert_eq!(ds.dpath, "eserver");
    }

    #[test]
    fn reused_volumes_do_not_pull_new_content() {
        let mut fx = Fixture::new();
        let first = fx.write_file("v1.qcow2", b"first");
        let second = fx.write_file("v2.qcow2", b"second");

        let a = fx
            .resolve_volume(&Expectation::new(&format!("file://{first}"), "data").unwrap())
            .unwrap();
        let b = fx
            .resolve_volume(&Expectation::new(&format!("file://{second}"), "data").unwrap())
            .unwrap();

        assert_eq!(b.volume_id, a.volume_id);
        assert!(!b.created);
        assert_eq!(fx.store.len::<ContentTree>(), 1);
        assert_eq!(fx.device.ids(Kind::ContentTree).len(), 1);
        assert_eq!(fx.file_server.uploads(), 1);
    }

    #[test]
    fn corrupted_uploads_are_structural_errors() {
        let mut fx = Fixture::new();
        fx.file_server.corrupt_uploads();
        let path = fx.write_file("disk.raw", b"contents");
        let exp = Expectation::new(&format!("file://{path}"), "vm").unwrap();

        assert!(matches!(
            fx.resolve_volume(&exp),
            Err(ExpectationError::UploadMismatch { .. })
        ));
        assert_eq!(fx.store.len::<ContentTree>(), 0);
        assert_eq!(fx.store.len::<Datastore>(), 0);
    }

    #[test]
    fn directories_need_a_pusher() {
        let mut fx = Fixture::without_pusher();
        let dir = fx.write_dir("webapp");
        let exp = Expectation::new(&format!("directory://{dir}"), "web").unwrap();
        assert!(matches!(
            fx.resolve_volume(&exp),
            Err(ExpectationError::UnsupportedArtifact { .. })
        ));
    }
}
