// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory stand-ins for the artifact services, for resolver tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use uuid::Uuid;

use super::{
    Expectation, ExpectationError, ExpectationResolver, ResolvedApp,
    ResolvedBaseOs, ResolvedVolume,
};
use crate::artifacts::{
    digest, ArtifactError, Collaborators, DockerReference, FileServer,
    FileStatus, ImageConfig, ImageInspector, ImageManifest, ImagePusher,
};
use crate::config::HarnessConfig;
use crate::device::{Device, DeviceModel};
use crate::store::ConfigStore;

#[derive(Default)]
struct FileServerState {
    files: BTreeMap<String, FileStatus>,
    uploads: usize,
    corrupt: bool,
}

#[derive(Default)]
pub struct FakeFileServer {
    state: Mutex<FileServerState>,
}

impl FakeFileServer {
    pub fn uploads(&self) -> usize {
        self.state.lock().unwrap().uploads
    }

    /// Makes every later upload report a digest that doesn't match the file.
    pub fn corrupt_uploads(&self) {
        self.state.lock().unwrap().corrupt = true;
    }
}

impl FileServer for FakeFileServer {
    fn status(&self, name: &str) -> Result<Option<FileStatus>, ArtifactError> {
        Ok(self.state.lock().unwrap().files.get(name).cloned())
    }

    fn upload(&self, path: &Utf8Path) -> Result<FileStatus, ArtifactError> {
        let mut state = self.state.lock().unwrap();
        state.uploads += 1;

        let name = path.file_name().unwrap().to_owned();
        let sha256 = if state.corrupt {
            "0".repeat(64)
        } else {
            digest::sha256_file(path)?
        };
        let status = FileStatus {
            file_name: name.clone(),
            sha256,
            size: std::fs::metadata(path).unwrap().len(),
            is_ready: true,
        };
        state.files.insert(name, status.clone());
        Ok(status)
    }
}

#[derive(Default)]
struct InspectorState {
    unreachable: bool,
    manifest: ImageManifest,
    volumes: Vec<String>,
    calls: usize,
}

#[derive(Default)]
pub struct FakeInspector {
    state: Mutex<InspectorState>,
}

impl FakeInspector {
    pub fn set_manifest(&self, manifest: ImageManifest) {
        self.state.lock().unwrap().manifest = manifest;
    }

    pub fn set_volumes(&self, volumes: &[&str]) {
        self.state.lock().unwrap().volumes =
            volumes.iter().map(|v| v.to_string()).collect();
    }

    pub fn go_offline(&self) {
        self.state.lock().unwrap().unreachable = true;
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    fn check(&self, reference: &DockerReference) -> Result<(), ArtifactError> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if state.unreachable {
            Err(ArtifactError::Unsupported(format!("{reference} unreachable")))
        } else {
            Ok(())
        }
    }
}

impl ImageInspector for FakeInspector {
    fn manifest(
        &self,
        reference: &DockerReference,
    ) -> Result<ImageManifest, ArtifactError> {
        self.check(reference)?;
        Ok(self.state.lock().unwrap().manifest.clone())
    }

    fn config(
        &self,
        reference: &DockerReference,
    ) -> Result<ImageConfig, ArtifactError> {
        self.check(reference)?;
        Ok(ImageConfig { volumes: self.state.lock().unwrap().volumes.clone() })
    }
}

#[derive(Default)]
pub struct FakePusher {
    pushed: Mutex<Vec<(Utf8PathBuf, String, String)>>,
}

impl FakePusher {
    pub fn pushed(&self) -> Vec<(Utf8PathBuf, String, String)> {
        self.pushed.lock().unwrap().clone()
    }
}

impl ImagePusher for FakePusher {
    fn push_directory(
        &self,
        dir: &Utf8Path,
        tag: &str,
        registry: &str,
    ) -> Result<(), ArtifactError> {
        self.pushed.lock().unwrap().push((
            dir.to_owned(),
            tag.to_owned(),
            registry.to_owned(),
        ));
        Ok(())
    }
}

/// A harness config, a fresh qemu device and fake artifact services.
pub struct Fixture {
    pub config: HarnessConfig,
    pub collaborators: Collaborators,
    pub file_server: Arc<FakeFileServer>,
    pub inspector: Arc<FakeInspector>,
    pub pusher: Arc<FakePusher>,
    pub store: ConfigStore,
    pub device: Device,
    dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self::build(true)
    }

    pub fn without_pusher() -> Self {
        Self::build(false)
    }

    fn build(with_pusher: bool) -> Self {
        let file_server = Arc::new(FakeFileServer::default());
        let inspector = Arc::new(FakeInspector::default());
        let pusher = Arc::new(FakePusher::default());
        let collaborators = Collaborators {
            file_server: file_server.clone(),
            inspector: inspector.clone(),
            pusher: with_pusher
                .then(|| pusher.clone() as Arc<dyn ImagePusher>),
        };

        let model = DeviceModel::qemu();
        let mut store = ConfigStore::new();
        let mut device = Device::new(Uuid::new_v4(), model.clone());
        model.apply(&mut store, &mut device).unwrap();

        Self {
            config: HarnessConfig::default(),
            collaborators,
            file_server,
            inspector,
            pusher,
            store,
            device,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn resolver(&self) -> ExpectationResolver<'_> {
        ExpectationResolver::new(&self.config, &self.collaborators)
    }

    pub fn resolve_app(
        &mut self,
        exp: &Expectation,
    ) -> Result<ResolvedApp, ExpectationError> {
        ExpectationResolver::new(&self.config, &self.collaborators)
            .resolve_app(&mut self.store, &mut self.device, exp)
    }

    pub fn resolve_base_os(
        &mut self,
        exp: &Expectation,
        with_drive: bool,
    ) -> Result<ResolvedBaseOs, ExpectationError> {
        ExpectationResolver::new(&self.config, &self.collaborators)
            .resolve_base_os(&mut self.store, &mut self.device, exp, with_drive)
    }

    pub fn resolve_volume(
        &mut self,
        exp: &Expectation,
    ) -> Result<ResolvedVolume, ExpectationError> {
        ExpectationResolver::new(&self.config, &self.collaborators)
            .resolve_volume(&mut self.store, &mut self.device, exp)
    }

    pub fn path(&self, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::try_from(self.dir.path().join(name)).unwrap()
    }

    pub fn write_file(&self, name: &str, contents: &[u8]) -> Utf8PathBuf {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub fn write_dir(&self, name: &str) -> Utf8PathBuf {
        let path = self.path(name);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("index.html"), b"<html></html>").unwrap();
        path
    }
}
