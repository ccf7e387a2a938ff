//! Manifest interpretation for runtime image archives.
//!
//! Recovers the config entry, the ordered layer entries and the ordered
//! diff ids from `manifest.json` and the image config, and pairs them.

use kra_core::error::{KraError, Result};
use kra_core::ContentId;
use serde::Deserialize;
use serde_json::value::RawValue;

use crate::export::{ExtractedEntries, ExtractedEntry};

/// Well-known name of the archive manifest entry.
pub const MANIFEST_ENTRY: &str = "manifest.json";

/// Config and layer entry names from `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerManifestEntry {
    pub config_ref: String,
    pub layer_refs: Vec<String>,
}

/// The parts of the image config the catalog needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    pub architecture: String,
    /// Raw JSON of the config's `config` object (runtime defaults)
    pub raw_config: Vec<u8>,
    /// Uncompressed layer content ids, bottom to top
    pub diff_ids: Vec<ContentId>,
}

/// A layer entry paired with its diff id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInput {
    /// Position in the image, bottom layer is 0
    pub index: usize,
    pub entry: ExtractedEntry,
    pub diff_id: ContentId,
}

/// Everything the publisher and registrar need from one archive.
#[derive(Debug, Clone)]
pub struct InterpretedImage {
    pub manifest: LayerManifestEntry,
    pub config: ImageConfig,
    /// `sha256:` of the raw config entry
    pub config_content_id: ContentId,
    /// Layers in manifest order, paired index-wise with `config.diff_ids`
    pub layers: Vec<LayerInput>,
}

#[derive(Deserialize)]
struct ManifestItem {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "Layers", default)]
    layers: Vec<String>,
}

#[derive(Deserialize)]
struct ConfigDocument {
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    config: Option<Box<RawValue>>,
    rootfs: RootFs,
}

#[derive(Deserialize)]
struct RootFs {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    diff_ids: Vec<ContentId>,
}

/// Interpret an extracted archive.
///
/// Any missing entry, decode failure or layer/diff-id count mismatch is an
/// [`KraError::ArchiveDecode`]; nothing has been uploaded at that point.
pub fn interpret(entries: &ExtractedEntries) -> Result<InterpretedImage> {
    let manifest = read_manifest(entries)?;

    let config_entry = entries.get(&manifest.config_ref).ok_or_else(|| {
        KraError::ArchiveDecode(format!("config entry missing: {}", manifest.config_ref))
    })?;
    let config = read_config(config_entry)?;

    if manifest.layer_refs.len() != config.diff_ids.len() {
        return Err(KraError::ArchiveDecode(format!(
            "manifest lists {} layers but config declares {} diff ids",
            manifest.layer_refs.len(),
            config.diff_ids.len()
        )));
    }

    let mut layers = Vec::with_capacity(manifest.layer_refs.len());
    for (index, (layer_ref, diff_id)) in manifest
        .layer_refs
        .iter()
        .zip(config.diff_ids.iter())
        .enumerate()
    {
        let entry = entries
            .get(layer_ref)
            .ok_or_else(|| KraError::ArchiveDecode(format!("layer missing {layer_ref}")))?;

        if &entry.content_hash != diff_id {
            tracing::warn!(
                layer = %layer_ref,
                diff_id = %diff_id,
                content = %entry.content_hash,
                "Layer content does not hash to its declared diff id"
            );
        }

        layers.push(LayerInput {
            index,
            entry: entry.clone(),
            diff_id: diff_id.clone(),
        });
    }

    tracing::debug!(
        config = %manifest.config_ref,
        layers = layers.len(),
        architecture = %config.architecture,
        "Interpreted image manifest"
    );

    Ok(InterpretedImage {
        config_content_id: config_entry.content_hash.clone(),
        manifest,
        config,
        layers,
    })
}

fn read_manifest(entries: &ExtractedEntries) -> Result<LayerManifestEntry> {
    let entry = entries
        .get(MANIFEST_ENTRY)
        .ok_or_else(|| KraError::ArchiveDecode(format!("{MANIFEST_ENTRY} not found")))?;

    let data = std::fs::read(&entry.temp_path)?;
    let items: Vec<ManifestItem> = serde_json::from_slice(&data)
        .map_err(|e| KraError::ArchiveDecode(format!("invalid {MANIFEST_ENTRY}: {e}")))?;

    if items.len() > 1 {
        tracing::warn!(
            images = items.len(),
            "Archive describes several images, using the first"
        );
    }

    let first = items
        .into_iter()
        .next()
        .ok_or_else(|| KraError::ArchiveDecode(format!("{MANIFEST_ENTRY} is empty")))?;

    Ok(LayerManifestEntry {
        config_ref: first.config,
        layer_refs: first.layers,
    })
}

fn read_config(entry: &ExtractedEntry) -> Result<ImageConfig> {
    let data = std::fs::read(&entry.temp_path)?;
    let doc: ConfigDocument = serde_json::from_slice(&data).map_err(|e| {
        KraError::ArchiveDecode(format!("invalid image config {}: {}", entry.name, e))
    })?;

    if !doc.rootfs.kind.is_empty() && doc.rootfs.kind != "layers" {
        tracing::warn!(kind = %doc.rootfs.kind, "Unexpected rootfs type in image config");
    }

    let raw_config = doc
        .config
        .map(|raw| raw.get().as_bytes().to_vec())
        .unwrap_or_else(|| b"{}".to_vec());

    Ok(ImageConfig {
        architecture: doc.architecture,
        raw_config,
        diff_ids: doc.rootfs.diff_ids,
    })
}
