//! Layer publishing: compress every layer and upload it to the layer store.
//!
//! Each layer is its own task. Compression is a blocking whole-file pass
//! that always runs to completion; only the upload reacts to cancellation.
//! Tasks are bounded by a semaphore and all of them are joined before the
//! result is known, so the caller can remove the workspace afterwards.

use std::fs::OpenOptions;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use kra_core::error::{KraError, Result};
use kra_core::ContentId;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::export::open_entry;
use crate::hashing::HashingWriter;
use crate::manifest::LayerInput;
use crate::progress::{Progress, ProgressReader};
use crate::remote::{LayerPutOutcome, LayerStore, LayerUpload, RemoteLayer};

/// A layer compressed into the workspace, not yet uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedLayer {
    pub index: usize,
    pub diff_id: ContentId,
    pub compressed_path: PathBuf,
    pub compressed_size: u64,
    /// sha256 of the compressed bytes
    pub transport_hash: ContentId,
}

impl PublishedLayer {
    fn to_upload(&self) -> LayerUpload {
        LayerUpload {
            object_id: self.diff_id.clone(),
            size: self.compressed_size,
            transport_hash: self.transport_hash.clone(),
            path: self.compressed_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// The store accepted fresh bytes
    Uploaded,
    /// The store already had the layer
    AlreadyPresent,
}

/// Outcome for one successfully published layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerReport {
    pub index: usize,
    pub diff_id: ContentId,
    pub compressed_size: u64,
    pub transport_hash: ContentId,
    pub status: UploadStatus,
}

/// Gzip a layer's extracted file into `dir`, hashing the output as it is written.
pub fn compress_layer(
    layer: &LayerInput,
    dir: &Path,
    level: u32,
    progress: &Progress,
) -> Result<PublishedLayer> {
    let compressed_path = dir.join(format!("layer-{:03}.tar.gz", layer.index));
    let source = open_entry(&layer.entry)?;
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&compressed_path)?;

    let mut encoder = GzEncoder::new(
        HashingWriter::new(BufWriter::new(file)),
        Compression::new(level),
    );
    let mut reader = ProgressReader::new(BufReader::new(source), progress.clone());
    io::copy(&mut reader, &mut encoder)?;

    let (buffered, transport_hash, compressed_size) = encoder.finish()?.finish()?;
    buffered.into_inner().map_err(|e| e.into_error())?;

    tracing::debug!(
        layer = layer.index,
        diff_id = %layer.diff_id,
        size = layer.entry.size,
        compressed = compressed_size,
        digest = %transport_hash,
        "Compressed layer"
    );

    Ok(PublishedLayer {
        index: layer.index,
        diff_id: layer.diff_id.clone(),
        compressed_path,
        compressed_size,
        transport_hash,
    })
}

/// Compresses and uploads the layers of one image.
#[derive(Clone)]
pub struct LayerPublisher {
    store: Arc<dyn LayerStore>,
    work_dir: PathBuf,
    compression_level: u32,
    permits: Arc<Semaphore>,
    progress: Progress,
    cancel: CancellationToken,
}

impl LayerPublisher {
    pub fn new(
        store: Arc<dyn LayerStore>,
        work_dir: impl Into<PathBuf>,
        compression_level: u32,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            work_dir: work_dir.into(),
            compression_level,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            progress: Progress::disabled(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Publish all layers and wait for every task.
    ///
    /// A failing layer does not stop its siblings; the first error is
    /// returned once all tasks are done. Reports are ordered by layer index.
    pub async fn publish_all(&self, layers: Vec<LayerInput>) -> Result<Vec<LayerReport>> {
        let total: u64 = layers.iter().map(|l| l.entry.size).sum();
        let count = layers.len();
        self.progress.begin("Pushing layers", total);

        let mut tasks = JoinSet::new();
        for layer in layers {
            tasks.spawn(self.clone().publish_one(layer));
        }

        let mut reports = Vec::with_capacity(count);
        let mut first_error: Option<KraError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .map_err(|e| KraError::Other(format!("layer task failed: {e}")))
                .and_then(|r| r);
            match result {
                Ok(report) => reports.push(report),
                Err(e) => match &first_error {
                    None => first_error = Some(e),
                    Some(_) => tracing::debug!(error = %e, "Additional layer failure"),
                },
            }
        }
        self.progress.finish();

        if let Some(e) = first_error {
            return Err(e);
        }

        reports.sort_by_key(|r| r.index);

        let uploaded = reports
            .iter()
            .filter(|r| r.status == UploadStatus::Uploaded)
            .count();
        tracing::info!(
            layers = reports.len(),
            uploaded,
            present = reports.len() - uploaded,
            "Published layers"
        );

        Ok(reports)
    }

    async fn publish_one(self, layer: LayerInput) -> Result<LayerReport> {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(KraError::Cancelled),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| KraError::Cancelled)?
            }
        };

        let published = tokio::task::spawn_blocking({
            let dir = self.work_dir.clone();
            let level = self.compression_level;
            let progress = self.progress.clone();
            move || compress_layer(&layer, &dir, level, &progress)
        })
        .await
        .map_err(|e| KraError::Other(format!("compression task failed: {e}")))??;

        self.progress.extend(published.compressed_size);

        let upload = published.to_upload();
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(KraError::Cancelled),
            result = self.store.put_layer(&upload, &self.progress) => result,
        };

        if let Err(e) = tokio::fs::remove_file(&published.compressed_path).await {
            tracing::debug!(
                path = %published.compressed_path.display(),
                error = %e,
                "Could not remove compressed layer"
            );
        }

        let status = match outcome? {
            LayerPutOutcome::Accepted(remote) => {
                verify_remote(&published, &remote)?;
                UploadStatus::Uploaded
            }
            LayerPutOutcome::AlreadyPresent => UploadStatus::AlreadyPresent,
        };

        tracing::debug!(
            layer = published.index,
            digest = %published.diff_id,
            size = published.compressed_size,
            status = ?status,
            "Layer published"
        );

        Ok(LayerReport {
            index: published.index,
            diff_id: published.diff_id,
            compressed_size: published.compressed_size,
            transport_hash: published.transport_hash,
            status,
        })
    }
}

/// Compare what the store says it received with what was sent.
fn verify_remote(layer: &PublishedLayer, remote: &RemoteLayer) -> Result<()> {
    if let Some(reported) = remote.sha256.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let hex = reported.strip_prefix("sha256:").unwrap_or(reported);
        if ContentId::from_hex(hex).ok().as_ref() != Some(&layer.transport_hash) {
            return Err(KraError::IntegrityMismatch {
                object: layer.diff_id.to_string(),
                expected: layer.transport_hash.to_string(),
                actual: reported.to_string(),
            });
        }
    }

    if let Some(size) = remote.size {
        if size != layer.compressed_size {
            return Err(KraError::IntegrityMismatch {
                object: layer.diff_id.to_string(),
                expected: format!("{} bytes", layer.compressed_size),
                actual: format!("{size} bytes"),
            });
        }
    }

    Ok(())
}
