//! kra push - publish container images from a local runtime to kraud.
//!
//! The pipeline per image:
//!
//! 1. [`export`]: stream the runtime's archive into hashed temp files
//! 2. [`manifest`]: find the config and pair layer entries with diff ids
//! 3. [`publish`]: gzip and upload each layer, concurrently
//! 4. [`register`]: create the image record in the catalog
//!
//! [`pipeline::Pusher`] ties the stages together and skips images the
//! remote already has.

pub mod export;
pub mod hashing;
pub mod manifest;
pub mod pipeline;
pub mod progress;
pub mod publish;
pub mod register;
pub mod remote;
pub mod source;

pub use pipeline::{default_architecture, PushOutcome, PushReport, PushRequest, PushStatus, Pusher};
pub use progress::{Progress, ProgressSink};
pub use publish::{LayerPublisher, LayerReport, UploadStatus};
pub use register::{ImageDescriptor, Registrar, RegistrationResult, RenamedImage};
pub use remote::{
    ImageCatalog, LayerPutOutcome, LayerStore, LayerUpload, RemoteClient, RemoteImage, RemoteLayer,
};
pub use source::{DockerCli, LocalImage, LocalImageSource};
