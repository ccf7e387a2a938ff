//! Image registration with the remote catalog.

use std::sync::Arc;

use kra_core::error::{KraError, Result};
use kra_core::ContentId;

use crate::manifest::InterpretedImage;
use crate::remote::{CreateImageRequest, ImageCatalog, LayerReference};

/// What the catalog needs to create an image record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub reference: String,
    /// Raw JSON of the image's runtime defaults
    pub config: Vec<u8>,
    pub config_content_id: ContentId,
    pub architecture: String,
    /// Layer object ids in `diff_ids` order
    pub layers: Vec<ContentId>,
}

impl ImageDescriptor {
    /// Build the descriptor for `reference` from an interpreted archive.
    ///
    /// Layer order always follows the config's diff ids, independent of the
    /// order in which uploads completed.
    pub fn new(reference: impl Into<String>, image: &InterpretedImage) -> Self {
        Self {
            reference: reference.into(),
            config: image.config.raw_config.clone(),
            config_content_id: image.config_content_id.clone(),
            architecture: image.config.architecture.clone(),
            layers: image.config.diff_ids.clone(),
        }
    }

    pub fn to_request(&self) -> CreateImageRequest {
        CreateImageRequest {
            reference: self.reference.clone(),
            config: String::from_utf8_lossy(&self.config).into_owned(),
            oci_id: self.config_content_id.to_string(),
            architecture: self.architecture.clone(),
            layers: self
                .layers
                .iter()
                .map(|id| LayerReference {
                    oci_id: id.to_string(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedImage {
    pub aid: String,
}

/// An older record that now carries a different reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamedImage {
    pub old_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResult {
    pub created: CreatedImage,
    pub renamed: Vec<RenamedImage>,
}

/// Submits image descriptors to the catalog.
#[derive(Clone)]
pub struct Registrar {
    catalog: Arc<dyn ImageCatalog>,
}

impl Registrar {
    pub fn new(catalog: Arc<dyn ImageCatalog>) -> Self {
        Self { catalog }
    }

    pub async fn register(&self, descriptor: &ImageDescriptor) -> Result<RegistrationResult> {
        let response = self
            .catalog
            .create_image(&descriptor.to_request())
            .await
            .map_err(|e| match e {
                KraError::Api { message, .. } | KraError::Transport { message, .. } => {
                    KraError::Registration {
                        reference: descriptor.reference.clone(),
                        message,
                    }
                }
                KraError::SerializationError(message) => KraError::Registration {
                    reference: descriptor.reference.clone(),
                    message: format!("unreadable catalog response: {message}"),
                },
                other => other,
            })?;

        let renamed: Vec<RenamedImage> = response
            .renamed
            .into_iter()
            .map(|r| RenamedImage { old_ref: r.reference })
            .collect();
        for r in &renamed {
            tracing::warn!(
                reference = %descriptor.reference,
                old_ref = %r.old_ref,
                "Existing image was renamed"
            );
        }

        tracing::info!(
            reference = %descriptor.reference,
            aid = %response.created.aid,
            layers = descriptor.layers.len(),
            "Registered image"
        );

        Ok(RegistrationResult {
            created: CreatedImage {
                aid: response.created.aid,
            },
            renamed,
        })
    }
}
