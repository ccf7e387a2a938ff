//! Push orchestration.
//!
//! [`Pusher`] decides per image whether anything needs to happen, and if so
//! runs export → interpret → publish → register inside a private workspace
//! that is removed when the image is done, whatever the outcome.

use std::path::Path;
use std::sync::Arc;

use kra_core::error::{KraError, Result};
use kra_core::PushConfig;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::export::export_image;
use crate::manifest::interpret;
use crate::progress::Progress;
use crate::publish::LayerPublisher;
use crate::register::{ImageDescriptor, Registrar, RenamedImage};
use crate::remote::{ImageCatalog, LayerStore, RemoteClient, RemoteImage};
use crate::source::{DockerCli, LocalImage, LocalImageSource};

/// Architecture name of the machine running the push, in runtime naming.
pub fn default_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// One image to push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    pub reference: String,
    /// Service the image belongs to, used to prefix status output
    pub label: String,
    /// Push even when the remote already has this exact image
    pub force: bool,
}

impl PushRequest {
    pub fn new(reference: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            label: label.into(),
            force: false,
        }
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushStatus {
    /// A new record was created; `renamed` lists superseded references
    Created { renamed: Vec<RenamedImage> },
    /// The remote already has the local image
    UpToDate,
    /// The remote has the reference but the local runtime does not
    NotAvailableLocally,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    /// Remote image id, new or existing
    pub aid: String,
    pub status: PushStatus,
}

#[derive(Debug)]
pub struct PushReport {
    pub request: PushRequest,
    pub result: Result<PushOutcome>,
}

/// Pushes images from a local runtime to the remote catalog.
pub struct Pusher {
    config: PushConfig,
    source: Arc<dyn LocalImageSource>,
    store: Arc<dyn LayerStore>,
    catalog: Arc<dyn ImageCatalog>,
    registrar: Registrar,
    progress: Progress,
    cancel: CancellationToken,
}

impl Pusher {
    pub fn new(
        config: PushConfig,
        source: Arc<dyn LocalImageSource>,
        store: Arc<dyn LayerStore>,
        catalog: Arc<dyn ImageCatalog>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registrar: Registrar::new(catalog.clone()),
            config,
            source,
            store,
            catalog,
            progress: Progress::disabled(),
            cancel: CancellationToken::new(),
        })
    }

    /// A pusher using the docker CLI and the HTTP API named in `config`.
    pub fn from_config(config: PushConfig) -> Result<Self> {
        let client = Arc::new(RemoteClient::new(&config)?);
        let source = Arc::new(DockerCli::new(config.docker_bin.clone()));
        Self::new(config, source, client.clone(), client)
    }

    pub fn with_progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &PushConfig {
        &self.config
    }

    /// Push one image, or report why nothing had to be pushed.
    pub async fn push_image(&self, reference: &str, label: &str, force: bool) -> Result<PushOutcome> {
        self.check_cancelled()?;

        let remote = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(KraError::Cancelled),
            remote = self.catalog.inspect_image(reference) => remote?,
        };
        let local = self.source.inspect(reference).await?;

        match (remote, local) {
            (None, None) => Err(KraError::NotFoundLocally {
                reference: reference.to_string(),
            }),
            (Some(remote), None) => {
                tracing::info!(label, reference, aid = %remote.aid, "Image not available locally, keeping remote");
                Ok(PushOutcome {
                    aid: remote.aid,
                    status: PushStatus::NotAvailableLocally,
                })
            }
            (Some(remote), Some(local)) if !force && is_up_to_date(&remote, &local) => {
                tracing::info!(label, reference, aid = %remote.aid, "Image up to date");
                Ok(PushOutcome {
                    aid: remote.aid,
                    status: PushStatus::UpToDate,
                })
            }
            (_, Some(local)) => self.publish(reference, label, &local).await,
        }
    }

    /// Push images one after another.
    ///
    /// A failing image does not stop the ones after it; once cancelled,
    /// the remaining images are reported as cancelled without being tried.
    pub async fn push_images(&self, requests: &[PushRequest]) -> Vec<PushReport> {
        let mut reports = Vec::with_capacity(requests.len());
        for request in requests {
            let result = if self.cancel.is_cancelled() {
                Err(KraError::Cancelled)
            } else {
                self.push_image(&request.reference, &request.label, request.force)
                    .await
            };
            if let Err(e) = &result {
                tracing::warn!(
                    label = %request.label,
                    reference = %request.reference,
                    error = %e,
                    "Image push failed"
                );
            }
            reports.push(PushReport {
                request: request.clone(),
                result,
            });
        }
        reports
    }

    async fn publish(&self, reference: &str, label: &str, local: &LocalImage) -> Result<PushOutcome> {
        let workspace = self.workspace()?;
        let result = self.run(reference, label, local, workspace.path()).await;

        let path = workspace.path().to_path_buf();
        if let Err(e) = workspace.close() {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove push workspace");
        }
        result
    }

    async fn run(
        &self,
        reference: &str,
        label: &str,
        local: &LocalImage,
        dir: &Path,
    ) -> Result<PushOutcome> {
        tracing::info!(label, reference, image = %local.id, "Pushing image");

        let entries = export_image(self.source.as_ref(), local, dir, self.progress.clone()).await?;
        self.check_cancelled()?;

        let image = interpret(&entries)?;

        LayerPublisher::new(
            self.store.clone(),
            dir,
            self.config.compression_level,
            self.config.max_concurrent_uploads,
        )
        .with_progress(self.progress.clone())
        .with_cancellation(self.cancel.clone())
        .publish_all(image.layers.clone())
        .await?;

        let mut descriptor = ImageDescriptor::new(reference, &image);
        if descriptor.architecture.is_empty() {
            descriptor.architecture = default_architecture().to_string();
        }

        let registered = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(KraError::Cancelled),
            registered = self.registrar.register(&descriptor) => registered?,
        };

        Ok(PushOutcome {
            aid: registered.created.aid,
            status: PushStatus::Created {
                renamed: registered.renamed,
            },
        })
    }

    fn workspace(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("kra-push-");
        let dir = match &self.config.work_dir {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        tracing::debug!(path = %dir.path().display(), "Created push workspace");
        Ok(dir)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(KraError::Cancelled);
        }
        Ok(())
    }
}

fn is_up_to_date(remote: &RemoteImage, local: &LocalImage) -> bool {
    remote
        .arch(default_architecture())
        .is_some_and(|arch| arch.oci_id == local.id)
}
