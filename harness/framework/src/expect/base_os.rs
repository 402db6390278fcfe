// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::{Utf8Path, Utf8PathBuf};
use edge_api_types::config::{
    BaseOsConfig, ContentTree, Drive, DriveImage, UuidAndVersion,
};
use edge_api_types::Kind;
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::content::ArtifactRequest;
use super::{
    ArtifactLocator, Expectation, ExpectationError, ExpectationResolver,
    ResolvedBaseOs, Txn,
};
use crate::artifacts::DockerReference;

/// The file name stem of a rootfs image, less any `rootfs-` prefix.
fn rootfs_stem(file_name: &str) -> &str {
    let stem = match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => file_name,
    };
    stem.strip_prefix("rootfs-").unwrap_or(stem)
}

fn read_trimmed(path: &Utf8Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let trimmed = contents.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

impl ExpectationResolver<'_> {
    pub(super) fn base_os(
        &self,
        txn: &mut Txn,
        exp: &Expectation,
        with_drive: bool,
    ) -> Result<ResolvedBaseOs, ExpectationError> {
        if let ArtifactLocator::Directory(_) = exp.locator {
            return Err(ExpectationError::UnsupportedArtifact {
                locator: exp.locator.to_string(),
                reason: "base OS images cannot be built from a directory"
                    .to_owned(),
            });
        }

        let version = self.base_os_version(exp)?;
        let spec = self.describe(&ArtifactRequest::from_expectation(exp))?;

        let existing = txn
            .store
            .list::<BaseOsConfig>()
            .find(|b| b.base_os_version == version)
            .map(|b| b.uuid_and_version.uuid.clone());

        let (id, created) = match existing {
            Some(id) => {
                debug!(id, version, "base OS already configured");
                (id, false)
            }
            None => {
                for other in txn.store.list_mut::<BaseOsConfig>() {
                    other.activate = false;
                }

                let datastore_id = self.datastore(txn, &spec.datastore)?;
                let (sha256, size_bytes) = self.materialize(&spec)?;
                let id = Uuid::new_v4().to_string();
                let base = BaseOsConfig {
                    uuid_and_version: UuidAndVersion::new(id.clone(), "1"),
                    drives: vec![Drive {
                        image: Some(DriveImage {
                            id: id.clone(),
                            name: spec.url.clone(),
                            datastore_id,
                            sha256,
                            format: spec.format,
                            size_bytes,
                        }),
                        readonly: false,
                        max_size_bytes: size_bytes,
                    }],
                    activate: true,
                    base_os_version: version,
                    volume_id: None,
                };
                info!(id, version = base.base_os_version, "created base OS");
                txn.store.add(base)?;
                (id, true)
            }
        };
        txn.device.push(Kind::BaseOsConfig, &id);

        let base = txn.store.get::<BaseOsConfig>(&id)?;
        let mut volume_id = base.volume_id.clone();
        if with_drive && volume_id.is_none() && base.drives.len() == 1 {
            let (vol, _) = self.volume(txn, &exp.name, 0, |txn| {
                let ct_id = self.content_tree(txn, &spec)?;
                let size = txn.store.get::<ContentTree>(&ct_id)?.max_size_bytes;
                Ok((ct_id, size))
            })?;
            txn.store.get_mut::<BaseOsConfig>(&id)?.volume_id = Some(vol.clone());
            volume_id = Some(vol);
        }

        Ok(ResolvedBaseOs { base_os_id: id, created, volume_id })
    }

    /// Works out the version a base OS image reports.
    ///
    /// In order of preference: the expectation's explicit version, the image
    /// tag, a `<file>.ver` correction file, the file name if it matches the
    /// configured rootfs version pattern, and an `eve_version` file next to
    /// the image.
    fn base_os_version(
        &self,
        exp: &Expectation,
    ) -> Result<String, ExpectationError> {
        if let Some(version) = &exp.version {
            return Ok(version.clone());
        }

        let unknown = || ExpectationError::UnknownVersion {
            locator: exp.locator.to_string(),
        };
        let pattern = Regex::new(&self.config.rootfs_version_pattern)?;

        match &exp.locator {
            ArtifactLocator::Docker(raw) => {
                let reference =
                    DockerReference::parse(raw, &self.config.default_registry)
                        .map_err(|reason| ExpectationError::MalformedLocator {
                            locator: exp.locator.to_string(),
                            reason,
                        })?;
                Ok(reference.version().to_owned())
            }

            ArtifactLocator::Http(_) => {
                let name = exp.locator.file_name().ok_or_else(unknown)?;
                let stem = rootfs_stem(name);
                if pattern.is_match(stem) {
                    Ok(stem.to_owned())
                } else {
                    Err(unknown())
                }
            }

            ArtifactLocator::File(path) => {
                let correction = Utf8PathBuf::from(format!("{path}.ver"));
                if let Some(version) = read_trimmed(&correction) {
                    return Ok(version);
                }

                let name = path.file_name().ok_or_else(unknown)?;
                let stem = rootfs_stem(name);
                if pattern.is_match(stem) {
                    return Ok(stem.to_owned());
                }

                warn!(
                    stem,
                    pattern = self.config.rootfs_version_pattern,
                    "rootfs file name does not match version pattern"
                );
                let eve_version =
                    path.parent().map(|dir| dir.join("eve_version"));
                match eve_version.as_deref().and_then(read_trimmed) {
                    Some(version) => {
                        warn!(version, "using version from eve_version file");
                        Ok(version)
                    }
                    None => Err(unknown()),
                }
            }

            ArtifactLocator::Directory(_) => Err(unknown()),
        }
    }
}
