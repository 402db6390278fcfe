// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SHA-256 digests of local artifacts.

use std::fs::File;
use std::io::{BufReader, Read};

use camino::{Utf8Path, Utf8PathBuf};
use ring::digest::{Context, Digest, SHA256};

use super::ArtifactError;

fn io_error(path: &Utf8Path, source: std::io::Error) -> ArtifactError {
    ArtifactError::Io { path: path.to_string(), source }
}

fn update_from_file(
    context: &mut Context,
    path: &Utf8Path,
) -> Result<(), ArtifactError> {
    let file = File::open(path).map_err(|e| io_error(path, e))?;
    let mut reader = BufReader::new(file);
    let mut buffer = [0; 1024];

    loop {
        let count = reader.read(&mut buffer).map_err(|e| io_error(path, e))?;
        if count == 0 {
            break;
        }
        context.update(&buffer[..count]);
    }

    Ok(())
}

fn finish(context: Context) -> String {
    let digest: Digest = context.finish();
    hex::encode(digest.as_ref())
}

/// Returns the hex-encoded SHA-256 digest of the file at `path`.
pub fn sha256_file(path: &Utf8Path) -> Result<String, ArtifactError> {
    let mut context = Context::new(&SHA256);
    update_from_file(&mut context, path)?;
    Ok(finish(context))
}

/// Returns a hex-encoded SHA-256 digest covering the relative path and
/// contents of every file under `dir`.
///
/// Files are visited in sorted order so the digest depends only on the tree's
/// contents.
pub fn sha256_tree(dir: &Utf8Path) -> Result<String, ArtifactError> {
    let mut files = Vec::new();
    collect_files(dir, &mut files)?;
    files.sort();

    let mut context = Context::new(&SHA256);
    for path in &files {
        let relative = path.strip_prefix(dir).unwrap_or(path.as_path());
        context.update(relative.as_str().as_bytes());
        context.update(&[0]);
        update_from_file(&mut context, path)?;
    }

    Ok(finish(context))
}

fn collect_files(
    dir: &Utf8Path,
    out: &mut Vec<Utf8PathBuf>,
) -> Result<(), ArtifactError> {
    let entries = dir.read_dir_utf8().map_err(|e| io_error(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_error(dir, e))?;
        let file_type = entry.file_type().map_err(|e| io_error(entry.path(), e))?;
        if file_type.is_dir() {
            collect_files(entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path().to_owned());
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    // SHA-256 of the empty input.
    const EMPTY: &str =
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn empty_file_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("empty")).unwrap();
        std::fs::write(&path, b"").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), EMPTY);
    }

    #[test]
    fn tree_digest_tracks_names_and_contents() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("a.txt"), b"alpha").unwrap();
        std::fs::write(root.join("sub/b.txt"), b"beta").unwrap();

        let first = sha256_tree(&root).unwrap();
        assert_eq!(first, sha256_tree(&root).unwrap());

        std::fs::rename(root.join("a.txt"), root.join("c.txt")).unwrap();
        let renamed = sha256_tree(&root).unwrap();
        assert_ne!(first, renamed);

        std::fs::write(root.join("sub/b.txt"), b"gamma").unwrap();
        assert_ne!(renamed, sha256_tree(&root).unwrap());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = sha256_file(Utf8Path::new("/nonexistent/file")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/file"));
    }
}
