// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

const DOCKER_HUB: &str = "registry-1.docker.io";
const DOCKER_HUB_ALIASES: &[&str] = &["docker.io", "index.docker.io", DOCKER_HUB];

/// A parsed container image reference such as `nginx`,
/// `docker.io/library/nginx:1.25` or `localhost:5000/team/app@sha256:...`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DockerReference {
    /// Registry host (and port), e.g. `registry-1.docker.io`.
    pub registry: String,

    /// Repository path within the registry, e.g. `library/nginx`.
    pub repository: String,

    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl DockerReference {
    /// Parses `reference`, filling in `default_registry` when the reference
    /// names none. Docker Hub references are normalized so that `nginx` and
    /// `docker.io/library/nginx` parse identically.
    pub fn parse(reference: &str, default_registry: &str) -> Result<Self, String> {
        let reference = reference.strip_prefix("docker://").unwrap_or(reference);
        if reference.is_empty() {
            return Err("empty image reference".to_owned());
        }

        let (rest, digest) = match reference.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.to_owned())),
            None => (reference, None),
        };

        let (registry, remainder) = match rest.split_once('/') {
            Some((first, remainder))
                if first.contains('.')
                    || first.contains(':')
                    || first == "localhost" =>
            {
                (Some(first), remainder)
            }
            _ => (None, rest),
        };

        // A tag follows the last colon, provided no path separator follows it;
        // otherwise the colon belonged to a registry port.
        let (repository, tag) = match remainder.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => {
                (repo, Some(tag.to_owned()))
            }
            _ => (remainder, None),
        };

        if repository.is_empty()
            || !repository.chars().all(|c| {
                c.is_ascii_lowercase()
                    || c.is_ascii_digit()
                    || matches!(c, '.' | '_' | '-' | '/')
            })
        {
            return Err(format!("invalid repository name in {reference:?}"));
        }
        if tag.as_deref() == Some("") {
            return Err(format!("empty tag in {reference:?}"));
        }

        let registry = registry.unwrap_or(default_registry);
        let is_hub = DOCKER_HUB_ALIASES.contains(&registry);
        let registry = if is_hub { DOCKER_HUB } else { registry }.to_owned();
        let repository = if is_hub && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository.to_owned()
        };

        Ok(Self { registry, repository, tag, digest })
    }

    /// The tag to use when the caller doesn't override it.
    pub fn version(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }

    /// `repository:version`, the form a registry datastore expects.
    pub fn repository_with_version(&self, version: &str) -> String {
        format!("{}:{}", self.repository, version)
    }

    /// The reference to use when fetching this image's manifest: the digest if
    /// there is one, otherwise the tag.
    pub fn manifest_ref(&self) -> &str {
        self.digest.as_deref().unwrap_or_else(|| self.version())
    }
}

impl fmt::Display for DockerReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const HUB: &str = "registry-1.docker.io";

    #[test]
    fn short_names_resolve_to_library_on_hub() {
        let r = DockerReference::parse("docker://nginx", HUB).unwrap();
        assert_eq!(r.registry, HUB);
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.version(), "latest");
        assert_eq!(r.repository_with_version("latest"), "library/nginx:latest");
    }

    #[test]
    fn hub_aliases_normalize() {
        let a = DockerReference::parse("docker.io/library/nginx:1.25", HUB)
            .unwrap();
        let b = DockerReference::parse("nginx:1.25", HUB).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn explicit_hub_references_ignore_a_mirror_default() {
        let mirror = "mirror.local:5000";
        let r = DockerReference::parse("docker.io/nginx", mirror).unwrap();
        assert_eq!(r.registry, HUB);
        assert_eq!(r.repository, "library/nginx");

        let r = DockerReference::parse("nginx", mirror).unwrap();
        assert_eq!(r.registry, mirror);
        assert_eq!(r.repository, "nginx");

        let r = DockerReference::parse("nginx", "docker.io").unwrap();
        assert_eq!(r.registry, HUB);
        assert_eq!(r.repository, "library/nginx");
    }

    #[test]
    fn registry_with_port_is_not_a_tag() {
        let r = DockerReference::parse("localhost:5000/team/app", HUB).unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag, None);

        let r =
            DockerReference::parse("10.0.0.1:5000/app:v2@sha256:abcd", HUB)
                .unwrap();
        assert_eq!(r.tag.as_deref(), Some("v2"));
        assert_eq!(r.manifest_ref(), "sha256:abcd");
        assert_eq!(r.to_string(), "10.0.0.1:5000/app:v2@sha256:abcd");
    }

    #[test]
    fn malformed_references_are_rejected() {
        assert!(DockerReference::parse("", HUB).is_err());
        assert!(DockerReference::parse("docker://", HUB).is_err());
        assert!(DockerReference::parse("Upper/Case", HUB).is_err());
        assert!(DockerReference::parse("nginx:", HUB).is_err());
    }
}
