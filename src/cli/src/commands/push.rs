//! `kra push` command - push local images to the kraud catalog.

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::Args;
use kra_core::PushConfig;
use kra_push::{Progress, PushReport, PushRequest, PushStatus, Pusher};
use tokio_util::sync::CancellationToken;

use crate::output::ProgressBarSink;

#[derive(Args)]
pub struct PushArgs {
    /// Image references to push (e.g. "svc:v2")
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Push even if the remote already has the same image
    #[arg(long)]
    pub push_always: bool,

    /// Service label for status lines (default: image name)
    #[arg(long)]
    pub label: Option<String>,

    /// Maximum concurrent layer uploads
    #[arg(long)]
    pub max_uploads: Option<usize>,

    /// gzip compression level (0-9)
    #[arg(long)]
    pub compression_level: Option<u32>,

    /// Directory for temporary files
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(
    args: PushArgs,
    mut config: PushConfig,
    cancel: CancellationToken,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(max) = args.max_uploads {
        config.max_concurrent_uploads = max;
    }
    if let Some(level) = args.compression_level {
        config.compression_level = level;
    }
    if args.work_dir.is_some() {
        config.work_dir = args.work_dir.clone();
    }

    let mut pusher = Pusher::from_config(config)?.with_cancellation(cancel);
    if !args.quiet && std::io::stderr().is_terminal() {
        pusher = pusher.with_progress(Progress::new(ProgressBarSink::new()));
    }

    let requests: Vec<PushRequest> = args
        .images
        .iter()
        .map(|reference| {
            let label = args
                .label
                .clone()
                .unwrap_or_else(|| service_label(reference));
            PushRequest::new(reference, label).force(args.push_always)
        })
        .collect();

    let reports = pusher.push_images(&requests).await;

    let mut failed = 0;
    for report in &reports {
        for line in status_lines(report) {
            eprintln!("{line}");
        }
        match &report.result {
            Ok(outcome) => println!("{}", outcome.aid),
            Err(_) => failed += 1,
        }
    }

    if failed > 0 {
        return Err(format!("{failed} of {} images failed to push", reports.len()).into());
    }
    Ok(())
}

/// Default label: the image name without registry, path or tag.
fn service_label(reference: &str) -> String {
    let name = reference.rsplit('/').next().unwrap_or(reference);
    let name = name.split(['@', ':']).next().unwrap_or(name);
    if name.is_empty() {
        reference.to_string()
    } else {
        name.to_string()
    }
}

/// Human-readable result of one push, prefixed with the service label.
fn status_lines(report: &PushReport) -> Vec<String> {
    let label = &report.request.label;
    let reference = &report.request.reference;
    match &report.result {
        Ok(outcome) => match &outcome.status {
            PushStatus::Created { renamed } => {
                let mut lines: Vec<String> = renamed
                    .iter()
                    .map(|r| format!("{label}: warning: existing image renamed to {}", r.old_ref))
                    .collect();
                lines.push(format!("{label}: pushed {reference} ({})", outcome.aid));
                lines
            }
            PushStatus::UpToDate => {
                vec![format!("{label}: {reference} is up to date ({})", outcome.aid)]
            }
            PushStatus::NotAvailableLocally => vec![format!(
                "{label}: {reference} not available locally, using remote ({})",
                outcome.aid
            )],
        },
        Err(e) => vec![format!("{label}: {reference}: {e}")],
    }
}
