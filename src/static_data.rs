//! Read-only geospatial artefacts the hub serves to clients on demand.
//!
//! Loaders and format parsing are out of scope: each resource exposes a
//! last-write cache stamp and a raw-bytes download, nothing else. Clients
//! poll the stamp and refetch when it changes.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

/// One on-disk artefact: a single file, or a directory bundled as a zip.
#[derive(Debug, Clone)]
pub enum StaticResource {
    /// E.g. the boundaries file or the OSM PBF extract.
    File(PathBuf),
    /// E.g. the directory of topology shape files.
    Directory(PathBuf),
}

impl StaticResource {
    /// Last-write instant, used as the cache key. For a directory this is
    /// the newest write among its files.
    pub async fn last_write(&self) -> Result<DateTime<Utc>> {
        match self {
            StaticResource::File(path) => {
                let meta = tokio::fs::metadata(path)
                    .await
                    .with_context(|| format!("stat {}", path.display()))?;
                Ok(meta.modified()?.into())
            }
            StaticResource::Directory(dir) => {
                let mut newest = tokio::fs::metadata(dir)
                    .await
                    .with_context(|| format!("stat {}", dir.display()))?
                    .modified()?;
                let mut entries = tokio::fs::read_dir(dir)
                    .await
                    .with_context(|| format!("read {}", dir.display()))?;
                while let Some(entry) = entries.next_entry().await? {
                    let modified = entry.metadata().await?.modified()?;
                    if modified > newest {
                        newest = modified;
                    }
                }
                Ok(newest.into())
            }
        }
    }

    /// The raw download body: file contents, or a zip of the directory.
    pub async fn bytes(&self) -> Result<Vec<u8>> {
        match self {
            StaticResource::File(path) => tokio::fs::read(path)
                .await
                .with_context(|| format!("read {}", path.display())),
            StaticResource::Directory(dir) => {
                let dir = dir.clone();
                tokio::task::spawn_blocking(move || zip_directory(&dir))
                    .await
                    .context("zip task panicked")?
            }
        }
    }

    pub fn content_type(&self) -> String {
        match self {
            StaticResource::File(path) => mime_guess::from_path(path)
                .first_or_octet_stream()
                .to_string(),
            StaticResource::Directory(_) => "application/zip".to_string(),
        }
    }
}

/// Bundle every regular file at the top of `dir` into one zip archive.
fn zip_directory(dir: &Path) -> Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();

    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("read {}", dir.display()))?
        .collect::<std::io::Result<_>>()?;
    // Stable archive layout regardless of directory iteration order
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        writer.start_file(name, options)?;
        let contents = std::fs::read(entry.path())?;
        writer.write_all(&contents)?;
    }

    Ok(writer.finish()?.into_inner())
}

/// The set of resources this hub instance was configured with.
#[derive(Debug, Clone, Default)]
pub struct StaticData {
    boundaries: Option<StaticResource>,
    topologies: Option<StaticResource>,
    geos: Option<StaticResource>,
}

impl StaticData {
    pub fn new(
        boundaries: Option<PathBuf>,
        topologies: Option<PathBuf>,
        geos: Option<PathBuf>,
    ) -> Self {
        Self {
            boundaries: boundaries.map(StaticResource::File),
            topologies: topologies.map(StaticResource::Directory),
            geos: geos.map(StaticResource::File),
        }
    }

    /// Look a resource up by its URL name. Unknown names and resources the
    /// hub was not configured with both come back `None`.
    pub fn get(&self, name: &str) -> Option<&StaticResource> {
        match name {
            "boundaries" => self.boundaries.as_ref(),
            "topologies" => self.topologies.as_ref(),
            "geos" => self.geos.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[tokio::test]
    async fn file_resource_serves_bytes_and_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boundaries.json");
        std::fs::write(&path, b"[]").unwrap();

        let resource = StaticResource::File(path);
        assert_eq!(resource.bytes().await.unwrap(), b"[]");
        let stamp = resource.last_write().await.unwrap();
        assert!(stamp <= Utc::now());
    }

    #[tokio::test]
    async fn directory_resource_zips_its_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("alpha.shp"), b"shape-a").unwrap();
        std::fs::write(dir.path().join("bravo.shp"), b"shape-b").unwrap();

        let resource = StaticResource::Directory(dir.path().to_path_buf());
        let bytes = resource.bytes().await.unwrap();

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        let mut contents = String::new();
        archive
            .by_name("alpha.shp")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "shape-a");
    }

    #[test]
    fn unknown_resource_names_are_none() {
        let data = StaticData::default();
        assert!(data.get("boundaries").is_none());
        assert!(data.get("fixes").is_none());
    }
}
