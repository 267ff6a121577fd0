//! Layer extraction and creation.
//!
//! Layers may be gzip-compressed or plain tar. Whiteouts follow the OCI
//! convention: `.wh.<name>` deletes `<name>` from lower layers and
//! `.wh..wh..opq` clears the directory it sits in.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use cdbox_core::error::{BoxError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, EntryType, Header};

use super::layout::sha256_digest;
use super::{ChangeKind, FileChange};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Extract one layer on top of `target_dir`.
pub fn extract_layer(layer_path: &Path, target_dir: &Path) -> Result<()> {
    if !layer_path.exists() {
        return Err(BoxError::Other(format!(
            "layer file not found: {}",
            layer_path.display()
        )));
    }
    std::fs::create_dir_all(target_dir)?;

    let mut file = BufReader::new(File::open(layer_path)?);
    let mut magic = [0u8; 2];
    let gzip = {
        let buf = std::io::BufRead::fill_buf(&mut file)?;
        if buf.len() >= 2 {
            magic.copy_from_slice(&buf[..2]);
        }
        magic == [0x1f, 0x8b]
    };

    let result = if gzip {
        unpack(Archive::new(GzDecoder::new(file)), target_dir)
    } else {
        unpack(Archive::new(file), target_dir)
    };
    result.map_err(|e| {
        BoxError::Other(format!(
            "failed to extract {} to {}: {}",
            layer_path.display(),
            target_dir.display(),
            e
        ))
    })?;

    tracing::debug!(
        layer = %layer_path.display(),
        target = %target_dir.display(),
        "extracted layer"
    );
    Ok(())
}

fn unpack<R: Read>(mut archive: Archive<R>, target: &Path) -> std::io::Result<()> {
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(rel) = sanitize(&path) else { continue };

        let file_name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parent = rel.parent().map(Path::to_path_buf).unwrap_or_default();

        if file_name == OPAQUE_WHITEOUT {
            let dir = target.join(&parent);
            if let Ok(children) = std::fs::read_dir(&dir) {
                for child in children.flatten() {
                    remove_any(&child.path());
                }
            }
            continue;
        }
        if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            remove_any(&target.join(&parent).join(hidden));
            continue;
        }

        // A non-directory replacing a directory (or the reverse) must clear the old entry.
        let dest = target.join(&rel);
        if let Ok(meta) = std::fs::symlink_metadata(&dest) {
            let incoming_dir = entry.header().entry_type() == EntryType::Directory;
            if meta.is_dir() != incoming_dir || meta.file_type().is_symlink() {
                remove_any(&dest);
            }
        }
        entry.unpack_in(target)?;
    }
    Ok(())
}

/// Strip leading `/` and `./`, reject `..`.
fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn remove_any(path: &Path) {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            let _ = std::fs::remove_dir_all(path);
        }
        Ok(_) => {
            let _ = std::fs::remove_file(path);
        }
        Err(_) => {}
    }
}

/// A freshly built layer.
#[derive(Debug, Clone)]
pub struct LayerBlob {
    /// gzip-compressed tar.
    pub data: Vec<u8>,
    /// Digest of `data`.
    pub digest: String,
    /// Digest of the uncompressed tar.
    pub diff_id: String,
}

/// Build a layer holding `changes` relative to `rootfs`.
///
/// Added and changed paths are copied in; deleted paths become whiteouts.
pub fn create_layer(rootfs: &Path, changes: &[FileChange]) -> Result<LayerBlob> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    let mut sorted: Vec<&FileChange> = changes.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    for change in sorted {
        let rel = change.path.trim_start_matches('/');
        if rel.is_empty() {
            continue;
        }
        let rel_path = Path::new(rel);
        match change.kind {
            ChangeKind::Deleted => {
                let parent = rel_path.parent().unwrap_or(Path::new(""));
                let name = rel_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let mut header = Header::new_gnu();
                header.set_size(0);
                header.set_mode(0o644);
                header.set_entry_type(EntryType::Regular);
                header.set_cksum();
                builder.append_data(
                    &mut header,
                    parent.join(format!("{WHITEOUT_PREFIX}{name}")),
                    std::io::empty(),
                )?;
            }
            ChangeKind::Added | ChangeKind::Changed => {
                let full = rootfs.join(rel_path);
                let meta = match std::fs::symlink_metadata(&full) {
                    Ok(meta) => meta,
                    Err(_) => continue,
                };
                if meta.is_dir() {
                    builder.append_dir(rel_path, &full)?;
                } else {
                    builder.append_path_with_name(&full, rel_path)?;
                }
            }
        }
    }

    let tar = builder.into_inner()?;
    let diff_id = sha256_digest(&tar);

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    std::io::Write::write_all(&mut encoder, &tar)?;
    let data = encoder.finish()?;
    let digest = sha256_digest(&data);

    Ok(LayerBlob {
        data,
        digest,
        diff_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn make_layer(path: &Path, files: &[(&str, &[u8])], gzip: bool) {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        let tar = builder.into_inner().unwrap();
        if gzip {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            std::io::Write::write_all(&mut enc, &tar).unwrap();
            fs::write(path, enc.finish().unwrap()).unwrap();
        } else {
            fs::write(path, tar).unwrap();
        }
    }

    #[test]
    fn test_extract_gzip_and_plain() {
        let tmp = TempDir::new().unwrap();
        let l1 = tmp.path().join("l1");
        let l2 = tmp.path().join("l2");
        make_layer(&l1, &[("etc/hostname", b"one"), ("bin/sh", b"#!")], true);
        make_layer(&l2, &[("etc/hostname", b"two")], false);

        let target = tmp.path().join("rootfs");
        extract_layer(&l1, &target).unwrap();
        extract_layer(&l2, &target).unwrap();
        assert_eq!(fs::read_to_string(target.join("etc/hostname")).unwrap(), "two");
        assert!(target.join("bin/sh").exists());
    }

    #[test]
    fn test_whiteouts() {
        let tmp = TempDir::new().unwrap();
        let l1 = tmp.path().join("l1");
        let l2 = tmp.path().join("l2");
        make_layer(
            &l1,
            &[("a/keep", b"k"), ("a/gone", b"g"), ("b/x", b"x"), ("b/y", b"y")],
            true,
        );
        make_layer(&l2, &[("a/.wh.gone", b""), ("b/.wh..wh..opq", b""), ("b/z", b"z")], true);

        let target = tmp.path().join("rootfs");
        extract_layer(&l1, &target).unwrap();
        extract_layer(&l2, &target).unwrap();
        assert!(target.join("a/keep").exists());
        assert!(!target.join("a/gone").exists());
        assert!(!target.join("a/.wh.gone").exists());
        assert!(!target.join("b/x").exists());
        assert!(target.join("b/z").exists());
    }

    #[test]
    fn test_extract_missing_layer() {
        let tmp = TempDir::new().unwrap();
        let err = extract_layer(&tmp.path().join("nope"), &tmp.path().join("t")).unwrap_err();
        assert!(err.to_string().contains("layer file not found"));
    }

    #[test]
    fn test_create_layer_applies_cleanly() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(rootfs.join("app")).unwrap();
        fs::write(rootfs.join("app/new.txt"), "fresh").unwrap();

        let changes = vec![
            FileChange {
                kind: ChangeKind::Added,
                path: "/app/new.txt".to_string(),
            },
            FileChange {
                kind: ChangeKind::Deleted,
                path: "/etc/motd".to_string(),
            },
        ];
        let layer = create_layer(&rootfs, &changes).unwrap();
        assert_ne!(layer.digest, layer.diff_id);

        let base = tmp.path().join("base");
        fs::create_dir_all(base.join("etc")).unwrap();
        fs::write(base.join("etc/motd"), "hi").unwrap();
        let blob = tmp.path().join("layer.tgz");
        fs::write(&blob, &layer.data).unwrap();
        extract_layer(&blob, &base).unwrap();

        assert_eq!(fs::read_to_string(base.join("app/new.txt")).unwrap(), "fresh");
        assert!(!base.join("etc/motd").exists());
    }
}
