//! # cv-decode
//!
//! Transcribes every clip in a Common Voice style manifest through a running
//! asr-backend and writes the results into its `generated_text` column.
//!
//! Settings come from the shared configuration (`[batch]` section,
//! `APP_BATCH__*` variables); flags override them for one run.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use asr_backend::batch::{BatchOrchestrator, HttpTranscriptionClient, MergePolicy};
use asr_backend::config::AppConfig;
use asr_backend::init_tracing;

#[derive(Debug, Parser)]
#[command(name = "cv-decode", about = "Batch-transcribe a CSV manifest via the ASR service")]
struct Args {
    /// Manifest to read and rewrite in place.
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Directory the manifest's `filename` values are relative to.
    #[arg(long)]
    audio_root: Option<PathBuf>,

    /// Base URL of the transcription service.
    #[arg(long)]
    service_url: Option<String>,

    /// `overwrite` or `preserve_on_failure`.
    #[arg(long)]
    merge_policy: Option<MergePolicy>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing("asr_backend=info,cv_decode=info");

    let args = Args::parse();
    let mut config = AppConfig::load()?;
    config.validate()?;

    let batch = &mut config.batch;
    if let Some(manifest) = args.manifest {
        batch.manifest_path = manifest;
    }
    if let Some(audio_root) = args.audio_root {
        batch.audio_root = audio_root;
    }
    if let Some(service_url) = args.service_url {
        batch.service_url = service_url;
    }
    if let Some(policy) = args.merge_policy {
        batch.merge_policy = policy;
    }

    let client = HttpTranscriptionClient::new(&batch.service_url, batch.request_timeout())?;
    info!("Using transcription endpoint {}", client.endpoint());

    let orchestrator = BatchOrchestrator::new(client, batch.merge_policy);
    let report = orchestrator
        .run(&batch.manifest_path, &batch.audio_root)
        .await?;

    info!(
        "Done: {}/{} records transcribed",
        report.succeeded, report.total
    );
    Ok(())
}
