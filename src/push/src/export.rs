//! Image export: demultiplex a runtime archive into hashed temp files.
//!
//! Every archive entry is streamed into its own file inside the run's
//! workspace directory through a [`HashingWriter`], so its sha256 is known
//! as soon as it is on disk without a second read.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read};
use std::path::{Component, Path, PathBuf};

use kra_core::error::{KraError, Result};
use kra_core::ContentId;
use tar::{Archive, EntryType};

use crate::hashing::HashingWriter;
use crate::progress::{Progress, ProgressReader};
use crate::source::{LocalImage, LocalImageSource};

/// One archive entry persisted to a temp file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedEntry {
    /// Archive entry name (e.g. `manifest.json`, `<id>/layer.tar`)
    pub name: String,
    /// Temp file holding the entry's bytes
    pub temp_path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// sha256 of the entry's bytes
    pub content_hash: ContentId,
}

/// Extracted entries keyed by archive entry name.
#[derive(Debug, Default)]
pub struct ExtractedEntries {
    entries: HashMap<String, ExtractedEntry>,
}

impl ExtractedEntries {
    pub fn get(&self, name: &str) -> Option<&ExtractedEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all entry sizes.
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

/// Export `image` from `source` into `dir`.
///
/// The archive is read on the blocking pool. On error, files already
/// written stay in `dir` and are removed with the workspace.
pub async fn export_image(
    source: &dyn LocalImageSource,
    image: &LocalImage,
    dir: &Path,
    progress: Progress,
) -> Result<ExtractedEntries> {
    let stream = source.export(&image.id).await?;
    let dir = dir.to_path_buf();

    progress.begin("Extracting", image.size);
    let joined = tokio::task::spawn_blocking({
        let progress = progress.clone();
        move || extract_archive(stream, &dir, &progress)
    })
    .await;
    progress.finish();

    let entries = joined.map_err(|e| KraError::Other(format!("export task failed: {e}")))??;

    tracing::info!(
        image = %image.id,
        entries = entries.len(),
        bytes = entries.total_size(),
        "Extracted image archive"
    );

    Ok(entries)
}

/// Demultiplex a tar archive into one hashed file per regular entry.
///
/// Symlinked entries resolve to the entry they point at. Directories and
/// other special entries carry no content and are skipped.
pub fn extract_archive<R: Read>(
    reader: R,
    dir: &Path,
    progress: &Progress,
) -> Result<ExtractedEntries> {
    let mut archive = Archive::new(ProgressReader::new(reader, progress.clone()));
    let mut extracted = ExtractedEntries::default();
    let mut links: Vec<(String, String)> = Vec::new();

    let entries = archive
        .entries()
        .map_err(|e| KraError::ArchiveDecode(format!("Failed to read image archive: {e}")))?;

    for (index, entry) in entries.enumerate() {
        let mut entry = entry
            .map_err(|e| KraError::ArchiveDecode(format!("Failed to read archive entry: {e}")))?;

        let name = entry
            .path()
            .map(|p| normalize_entry_name(&p))
            .map_err(|e| KraError::ArchiveDecode(format!("Invalid archive entry name: {e}")))?;

        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Continuous => {}
            EntryType::Symlink => {
                if let Ok(Some(target)) = entry.link_name() {
                    let base = Path::new(&name)
                        .parent()
                        .map(normalize_entry_name)
                        .unwrap_or_default();
                    links.push((name.clone(), resolve_link(&base, &target)));
                }
                continue;
            }
            // Hard link targets are relative to the archive root
            EntryType::Link => {
                if let Ok(Some(target)) = entry.link_name() {
                    links.push((name.clone(), normalize_entry_name(&target)));
                }
                continue;
            }
            _ => continue,
        }

        let expected = entry.size();
        let temp_path = dir.join(format!("entry-{index:04}"));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;

        let mut writer = HashingWriter::new(BufWriter::new(file));
        io::copy(&mut entry, &mut writer).map_err(|e| {
            KraError::ArchiveDecode(format!("Failed to read archive entry {name}: {e}"))
        })?;
        let (buffered, content_hash, size) = writer.finish()?;
        buffered.into_inner().map_err(|e| e.into_error())?;

        if size != expected {
            return Err(KraError::ArchiveDecode(format!(
                "Archive truncated in entry {name}: got {size} of {expected} bytes"
            )));
        }

        tracing::debug!(entry = %name, size, digest = %content_hash, "Extracted archive entry");

        extracted.entries.insert(
            name.clone(),
            ExtractedEntry {
                name,
                temp_path,
                size,
                content_hash,
            },
        );
    }

    // Drain trailing bytes so a runtime failure after the end-of-archive
    // marker still surfaces.
    io::copy(&mut archive.into_inner(), &mut io::sink())
        .map_err(|e| KraError::ArchiveDecode(format!("Image export failed: {e}")))?;

    for (name, target) in links {
        if let Some(found) = extracted.entries.get(&target).cloned() {
            extracted.entries.insert(
                name.clone(),
                ExtractedEntry {
                    name,
                    ..found
                },
            );
        } else {
            tracing::debug!(entry = %name, target = %target, "Dangling archive link ignored");
        }
    }

    if extracted.is_empty() {
        return Err(KraError::ArchiveDecode(
            "Image archive contains no entries".to_string(),
        ));
    }

    Ok(extracted)
}

/// Resolve a link target relative to the directory holding the link.
fn resolve_link(base: &str, target: &Path) -> String {
    let joined = if target.is_absolute() {
        target.to_path_buf()
    } else {
        Path::new(base).join(target)
    };
    normalize_entry_name(&joined)
}

/// Canonical entry name: `/`-separated, no `.` components, `..` collapsed.
fn normalize_entry_name(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    parts.join("/")
}

/// Open an extracted entry for reading.
pub fn open_entry(entry: &ExtractedEntry) -> Result<File> {
    File::open(&entry.temp_path).map_err(|e| {
        KraError::ArchiveDecode(format!(
            "Extracted entry {} is unreadable at {}: {}",
            entry.name,
            entry.temp_path.display(),
            e
        ))
    })
}
