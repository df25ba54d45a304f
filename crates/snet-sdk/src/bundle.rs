//! Service schema bundles: `.proto` sources expanded from a tar or tar.gz
//! archive, keyed by their relative path.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::EntryType;

use crate::constants::PROTO_EXTENSION;
use crate::{Result, SdkError};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Expand a schema archive into `relative path -> source text`.
///
/// Regular `.proto` files are kept, other regular files are dropped,
/// directories are ignored, and any other entry type is rejected.
pub fn extract_archive(bytes: &[u8]) -> Result<BTreeMap<String, String>> {
    if bytes.starts_with(&GZIP_MAGIC) {
        read_tar(GzDecoder::new(bytes))
    } else {
        read_tar(Cursor::new(bytes))
    }
}

fn read_tar<R: Read>(reader: R) -> Result<BTreeMap<String, String>> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| SdkError::Archive(format!("unreadable archive: {e}")))?;

    let mut files = BTreeMap::new();
    for entry in entries {
        let mut entry = entry.map_err(|e| SdkError::Archive(format!("bad archive entry: {e}")))?;
        let name = entry
            .path()
            .map_err(|e| SdkError::Archive(format!("bad entry path: {e}")))?
            .to_string_lossy()
            .into_owned();

        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Continuous => {
                if !name.ends_with(PROTO_EXTENSION) {
                    tracing::debug!(file = %name, "skipping non-proto file");
                    continue;
                }
                let mut source = String::new();
                entry
                    .read_to_string(&mut source)
                    .map_err(|e| SdkError::Archive(format!("reading {name} failed: {e}")))?;
                files.insert(name.trim_start_matches("./").to_string(), source);
            }
            EntryType::Directory => {
                tracing::warn!(dir = %name, "ignoring directory entry in schema archive");
            }
            other => {
                return Err(SdkError::Archive(format!(
                    "unsupported entry type {other:?} for {name}"
                )));
            }
        }
    }
    Ok(files)
}

/// The schema sources of a service.
#[derive(Debug, Clone, Default)]
pub struct ProtoBundle {
    files: BTreeMap<String, String>,
}

impl ProtoBundle {
    pub fn new(files: BTreeMap<String, String>) -> Self {
        Self { files }
    }

    pub fn from_archive(bytes: &[u8]) -> Result<Self> {
        Ok(Self::new(extract_archive(bytes)?))
    }

    pub fn get(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Write every file under `dir`, preserving relative paths.
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        self.ensure_not_empty()?;
        let dir = dir.as_ref();
        let mut written = Vec::with_capacity(self.files.len());
        for (name, source) in &self.files {
            let path = dir.join(safe_relative(name)?);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, source)?;
            written.push(path);
        }
        Ok(written)
    }

    /// Write every file into a zip archive at `path`.
    pub fn save_as_zip(&self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_not_empty()?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::File::create(path.as_ref())?;
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, source) in &self.files {
            safe_relative(name)?;
            zip.start_file(name.as_str(), options)
                .map_err(|e| SdkError::Archive(format!("zip entry {name}: {e}")))?;
            zip.write_all(source.as_bytes())?;
        }
        zip.finish()
            .map_err(|e| SdkError::Archive(format!("finishing zip failed: {e}")))?;
        Ok(())
    }

    fn ensure_not_empty(&self) -> Result<()> {
        if self.files.is_empty() {
            return Err(SdkError::Archive("schema bundle is empty".to_string()));
        }
        Ok(())
    }
}

/// Reject absolute paths and `..` so a bundle cannot write outside its target.
fn safe_relative(name: &str) -> Result<&Path> {
    let path = Path::new(name);
    let ok = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !ok {
        return Err(SdkError::Archive(format!("unsafe path in bundle: {name}")));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn append_file(builder: &mut tar::Builder<Vec<u8>>, name: &str, body: &str) {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, body.as_bytes()).unwrap();
    }

    fn append_dir(builder: &mut tar::Builder<Vec<u8>>, name: &str) {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, name, std::io::empty()).unwrap();
    }

    fn sample_tar() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        append_dir(&mut builder, "protos/");
        append_file(&mut builder, "protos/example.proto", "syntax = \"proto3\";");
        append_file(&mut builder, "README.md", "docs");
        append_file(&mut builder, "root.proto", "syntax = \"proto3\";");
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_extract_plain_tar_keeps_only_proto_files() {
        let files = extract_archive(&sample_tar()).unwrap();
        let names: Vec<&str> = files.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["protos/example.proto", "root.proto"]);
    }

    #[test]
    fn test_extract_gzip_tar() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&sample_tar()).unwrap();
        let gz = enc.finish().unwrap();
        assert_eq!(&gz[..2], &GZIP_MAGIC);

        let files = extract_archive(&gz).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.contains_key("root.proto"));
    }

    #[test]
    fn test_extract_rejects_symlink_entries() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_cksum();
        builder
            .append_link(&mut header, "link.proto", "root.proto")
            .unwrap();
        let bytes = builder.into_inner().unwrap();

        assert!(matches!(extract_archive(&bytes), Err(SdkError::Archive(_))));
    }

    #[test]
    fn test_save_preserves_relative_paths() {
        let bundle = ProtoBundle::from_archive(&sample_tar()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let written = bundle.save(dir.path()).unwrap();
        assert_eq!(written.len(), 2);
        let nested = std::fs::read_to_string(dir.path().join("protos/example.proto")).unwrap();
        assert_eq!(nested, "syntax = \"proto3\";");
    }

    #[test]
    fn test_save_as_zip() {
        let bundle = ProtoBundle::from_archive(&sample_tar()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/schema.zip");
        bundle.save_as_zip(&path).unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let mut zip = zip::ZipArchive::new(file).unwrap();
        assert_eq!(zip.len(), 2);
        let mut source = String::new();
        zip.by_name("protos/example.proto")
            .unwrap()
            .read_to_string(&mut source)
            .unwrap();
        assert_eq!(source, "syntax = \"proto3\";");
    }

    #[test]
    fn test_empty_bundle_fails_cleanly() {
        let bundle = ProtoBundle::default();
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(bundle.save(dir.path()), Err(SdkError::Archive(_))));
        assert!(matches!(
            bundle.save_as_zip(dir.path().join("x.zip")),
            Err(SdkError::Archive(_))
        ));
    }

    #[test]
    fn test_unsafe_paths_rejected() {
        let mut files = BTreeMap::new();
        files.insert("../escape.proto".to_string(), String::new());
        let dir = tempfile::tempdir().unwrap();
        assert!(ProtoBundle::new(files).save(dir.path()).is_err());
    }
}
