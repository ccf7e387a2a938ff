//! Byte-count progress reporting.
//!
//! Progress is advisory: every stage works the same with a disabled
//! [`Progress`]. When enabled, one sink is shared by all concurrent layer
//! tasks and every call goes through a mutex so updates never interleave.

use std::io::{self, Read};
use std::sync::Arc;

use parking_lot::Mutex;

/// Receiver of progress updates, implemented by the CLI.
pub trait ProgressSink: Send {
    /// A new phase started, `total` bytes are expected.
    fn begin(&mut self, label: &str, total: u64);

    /// `bytes` more bytes were processed.
    fn advance(&mut self, bytes: u64);

    /// The current phase turned out to need `bytes` more than announced.
    fn extend(&mut self, _bytes: u64) {}

    /// The current phase ended.
    fn finish(&mut self);
}

/// Cloneable, optionally disabled handle to a shared [`ProgressSink`].
#[derive(Clone, Default)]
pub struct Progress {
    sink: Option<Arc<Mutex<Box<dyn ProgressSink>>>>,
}

impl Progress {
    pub fn new(sink: impl ProgressSink + 'static) -> Self {
        Self {
            sink: Some(Arc::new(Mutex::new(Box::new(sink)))),
        }
    }

    /// A handle that drops every update.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn begin(&self, label: &str, total: u64) {
        if let Some(sink) = &self.sink {
            sink.lock().begin(label, total);
        }
    }

    pub fn advance(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        if let Some(sink) = &self.sink {
            sink.lock().advance(bytes);
        }
    }

    pub fn extend(&self, bytes: u64) {
        if let Some(sink) = &self.sink {
            sink.lock().extend(bytes);
        }
    }

    pub fn finish(&self) {
        if let Some(sink) = &self.sink {
            sink.lock().finish();
        }
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Reader adapter that reports every byte read.
pub struct ProgressReader<R> {
    inner: R,
    progress: Progress,
}

impl<R: Read> ProgressReader<R> {
    pub fn new(inner: R, progress: Progress) -> Self {
        Self { inner, progress }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.progress.advance(n as u64);
        Ok(n)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Sink that records everything it receives.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        pub events: Arc<Mutex<Vec<String>>>,
        pub bytes: Arc<Mutex<u64>>,
    }

    impl ProgressSink for RecordingSink {
        fn begin(&mut self, label: &str, total: u64) {
            self.events.lock().push(format!("begin {label} {total}"));
        }

        fn advance(&mut self, bytes: u64) {
            *self.bytes.lock() += bytes;
        }

        fn extend(&mut self, bytes: u64) {
            self.events.lock().push(format!("extend {bytes}"));
        }

        fn finish(&mut self) {
            self.events.lock().push("finish".to_string());
        }
    }

    #[test]
    fn test_disabled_progress_is_noop() {
        let progress = Progress::disabled();
        assert!(!progress.is_enabled());
        progress.begin("nothing", 10);
        progress.advance(5);
        progress.finish();
    }

    #[test]
    fn test_reader_reports_bytes() {
        let sink = RecordingSink::default();
        let progress = Progress::new(sink.clone());

        let mut reader = ProgressReader::new(&b"0123456789"[..], progress.clone());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();

        assert_eq!(out.len(), 10);
        assert_eq!(*sink.bytes.lock(), 10);
    }

    #[test]
    fn test_concurrent_advances_are_serialized() {
        let sink = RecordingSink::default();
        let progress = Progress::new(sink.clone());
        progress.begin("upload", 8000);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let progress = progress.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        progress.advance(1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        progress.finish();

        assert_eq!(*sink.bytes.lock(), 8000);
        assert_eq!(
            *sink.events.lock(),
            vec!["begin upload 8000".to_string(), "finish".to_string()]
        );
    }
}
