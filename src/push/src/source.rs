//! Local container runtime access.
//!
//! The pipeline only needs two things from the runtime: whether an image
//! exists (and its id), and a full archive of it. [`LocalImageSource`]
//! captures exactly that; [`DockerCli`] implements it by shelling out to the
//! `docker` command.

use std::io::{self, Read};
use std::process::{Child, ChildStderr, ChildStdout, Stdio};
use std::thread::JoinHandle;

use async_trait::async_trait;
use kra_core::error::{KraError, Result};
use serde::Deserialize;

/// Bytes of exporter stderr kept for error messages.
const STDERR_LIMIT: u64 = 64 * 1024;

/// An image as seen by the local runtime.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LocalImage {
    /// Runtime image id, `sha256:` + config digest
    #[serde(rename = "Id")]
    pub id: String,

    /// Uncompressed size in bytes
    #[serde(rename = "Size", default)]
    pub size: u64,
}

/// Blocking byte stream of a `docker save`-style archive.
pub type ArchiveStream = Box<dyn Read + Send>;

/// Capability to inspect and export images from a local container runtime.
#[async_trait]
pub trait LocalImageSource: Send + Sync {
    /// Look up an image. `Ok(None)` means the runtime does not know it.
    async fn inspect(&self, reference: &str) -> Result<Option<LocalImage>>;

    /// Start exporting an image as a tar archive.
    ///
    /// Read errors on the returned stream include runtime failures that
    /// only become visible once the export has finished.
    async fn export(&self, image_id: &str) -> Result<ArchiveStream>;
}

/// [`LocalImageSource`] backed by the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl LocalImageSource for DockerCli {
    async fn inspect(&self, reference: &str) -> Result<Option<LocalImage>> {
        let output = tokio::process::Command::new(&self.bin)
            .args(["image", "inspect", "--format", "{{json .}}", reference])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| KraError::Runtime(format!("Failed to run {}: {}", self.bin, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_image(&stderr) {
                return Ok(None);
            }
            return Err(KraError::Runtime(format!(
                "{} image inspect {} failed ({}): {}",
                self.bin,
                reference,
                output.status,
                stderr.trim()
            )));
        }

        parse_inspect_output(&output.stdout).map(Some)
    }

    async fn export(&self, image_id: &str) -> Result<ArchiveStream> {
        let mut child = std::process::Command::new(&self.bin)
            .args(["save", image_id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| KraError::Runtime(format!("Failed to run {} save: {}", self.bin, e)))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            KraError::Runtime(format!("{} save did not expose stdout", self.bin))
        })?;
        let stderr = child.stderr.take().map(drain_stderr);

        tracing::debug!(image = %image_id, "Started image export");

        Ok(Box::new(ChildReader {
            child,
            stdout,
            stderr,
            finished: false,
        }))
    }
}

/// Whether runtime stderr says the image does not exist.
fn is_missing_image(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such image") || lower.contains("no such object")
}

/// Parse `docker image inspect --format '{{json .}}'` output.
fn parse_inspect_output(stdout: &[u8]) -> Result<LocalImage> {
    let text = std::str::from_utf8(stdout)
        .map_err(|e| KraError::Runtime(format!("image inspect output is not UTF-8: {e}")))?;
    let image: LocalImage = serde_json::from_str(text.trim())?;
    if image.id.is_empty() {
        return Err(KraError::Runtime(
            "image inspect returned an empty id".to_string(),
        ));
    }
    Ok(image)
}

/// Read a child's stderr to EOF on its own thread, keeping the first
/// [`STDERR_LIMIT`] bytes. Runs while stdout is read so the child never
/// stalls on a full stderr pipe.
fn drain_stderr(mut pipe: ChildStderr) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut kept = Vec::new();
        let _ = (&mut pipe).take(STDERR_LIMIT).read_to_end(&mut kept);
        let _ = io::copy(&mut pipe, &mut io::sink());
        String::from_utf8_lossy(&kept).into_owned()
    })
}

/// Reads a child's stdout and turns a failed exit into a read error at EOF.
struct ChildReader {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    finished: bool,
}

impl ChildReader {
    fn check_exit(&mut self) -> io::Result<()> {
        self.finished = true;
        let status = self.child.wait()?;
        let stderr = self
            .stderr
            .take()
            .and_then(|drain| drain.join().ok())
            .unwrap_or_default();
        if status.success() {
            return Ok(());
        }
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("image export exited with {}: {}", status, stderr.trim()),
        ))
    }
}

impl Read for ChildReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.check_exit()?;
        }
        Ok(n)
    }
}

impl Drop for ChildReader {
    fn drop(&mut self) {
        if !self.finished {
            // Aborted mid-stream: do not leave the exporter running.
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
