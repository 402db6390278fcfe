// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A blocking client for the harness's static file server.

use std::fs::File;
use std::time::Duration;

use camino::Utf8Path;
use reqwest::StatusCode;
use tracing::info;

use super::{ArtifactError, FileServer, FileStatus};

/// Talks to a file server's admin API:
///
/// - `GET /admin/status/{name}` returns a [`FileStatus`] as JSON
/// - `POST /admin/add-from-file/{name}` stores the request body as `name`
#[derive(Debug)]
pub struct EServerClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl EServerClient {
    /// Creates a client for the server at `base_url` (e.g.
    /// `http://10.0.2.2:8888`). `timeout` bounds each request, uploads
    /// included.
    pub fn new(
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, ArtifactError> {
        let client = reqwest::blocking::ClientBuilder::new()
            .timeout(timeout)
            .build()
            .map_err(|source| ArtifactError::Http {
                url: base_url.to_owned(),
                source,
            })?;

        Ok(Self { base_url: base_url.trim_end_matches('/').to_owned(), client })
    }

    fn parse_status(
        url: &str,
        response: reqwest::blocking::Response,
    ) -> Result<FileStatus, ArtifactError> {
        response.json::<FileStatus>().map_err(|e| ArtifactError::Malformed {
            url: url.to_owned(),
            reason: e.to_string(),
        })
    }
}

impl FileServer for EServerClient {
    fn status(&self, name: &str) -> Result<Option<FileStatus>, ArtifactError> {
        let url = format!("{}/admin/status/{name}", self.base_url);
        let response = self.client.get(&url).send().map_err(|source| {
            ArtifactError::Http { url: url.clone(), source }
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let status = Self::parse_status(&url, response)?;

                // The server answers with an empty record for files it has
                // never heard of.
                if status.file_name.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(status))
                }
            }
            status => Err(ArtifactError::Status { url, status }),
        }
    }

    fn upload(&self, path: &Utf8Path) -> Result<FileStatus, ArtifactError> {
        let name = path.file_name().ok_or_else(|| {
            ArtifactError::Unsupported(format!("{path} has no file name"))
        })?;
        let url = format!("{}/admin/add-from-file/{name}", self.base_url);
        let file = File::open(path).map_err(|source| ArtifactError::Io {
            path: path.to_string(),
            source,
        })?;

        info!(%path, %url, "uploading artifact to file server");
        let response =
            self.client.post(&url).body(file).send().map_err(|source| {
                ArtifactError::Http { url: url.clone(), source }
            })?;

        if !response.status().is_success() {
            return Err(ArtifactError::Status { url, status: response.status() });
        }

        Self::parse_status(&url, response)
    }
}
