use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info};

use crate::batch::{BatchError, BatchItemError, Manifest, MergePolicy, TranscriptionClient};

pub const FILENAME_COLUMN: &str = "filename";
pub const OUTPUT_COLUMN: &str = "generated_text";

/// Counts for one pass over a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchReport {
    fn from_outcomes(outcomes: &[Result<String, BatchItemError>]) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.is_ok()).count();
        Self {
            total: outcomes.len(),
            succeeded,
            failed: outcomes.len() - succeeded,
        }
    }
}

/// Sequential batch driver.
///
/// Records are processed strictly one at a time in manifest order.
pub struct BatchOrchestrator<C> {
    client: C,
    merge_policy: MergePolicy,
}

impl<C: TranscriptionClient> BatchOrchestrator<C> {
    pub fn new(client: C, merge_policy: MergePolicy) -> Self {
        Self {
            client,
            merge_policy,
        }
    }

    /// Transcribe every record and rewrite `manifest_path` with the
    /// `generated_text` column filled in.
    pub async fn run(&self, manifest_path: &Path, audio_root: &Path) -> Result<BatchReport, BatchError> {
        let start_time = Instant::now();
        let mut manifest = Manifest::load(manifest_path)?;
        let filenames = manifest.column(FILENAME_COLUMN)?;
        let total = filenames.len();

        info!(
            "Decoding {} records from {} (audio root {})",
            total,
            manifest_path.display(),
            audio_root.display()
        );

        let mut outcomes = Vec::with_capacity(total);
        for (index, filename) in filenames.iter().enumerate() {
            let outcome = self.process_record(audio_root, filename).await;
            match &outcome {
                Ok(text) => info!("[{}/{}] {}: {}", index + 1, total, filename, text),
                Err(e) => error!("[{}/{}] {} failed: {}", index + 1, total, filename, e),
            }
            outcomes.push(outcome);
        }

        let report = BatchReport::from_outcomes(&outcomes);
        let previous = manifest.column(OUTPUT_COLUMN).ok();
        let merged = merge_outcomes(outcomes, previous.as_deref(), self.merge_policy);

        manifest.set_column(OUTPUT_COLUMN, merged)?;
        manifest.persist(manifest_path)?;

        info!(
            "Batch finished in {:.1}s: {} total, {} succeeded, {} failed; wrote {}",
            start_time.elapsed().as_secs_f64(),
            report.total,
            report.succeeded,
            report.failed,
            manifest_path.display()
        );

        Ok(report)
    }

    async fn process_record(&self, audio_root: &Path, filename: &str) -> Result<String, BatchItemError> {
        let path = resolve_audio_path(audio_root, filename);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| BatchItemError::Io {
                path: path.clone(),
                source,
            })?;

        // The service only sees the base name, as a browser upload would send it
        let upload_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(filename);

        self.client.transcribe(upload_name, bytes).await
    }
}

/// Manifest paths are always relative to the audio root, even with a leading `/`.
pub fn resolve_audio_path(audio_root: &Path, filename: &str) -> PathBuf {
    audio_root.join(filename.trim_start_matches('/'))
}

/// Turn per-record outcomes into the final column values.
///
/// `previous` is the column's content before the run, if it existed.
pub fn merge_outcomes(
    outcomes: Vec<Result<String, BatchItemError>>,
    previous: Option<&[String]>,
    policy: MergePolicy,
) -> Vec<String> {
    outcomes
        .into_iter()
        .enumerate()
        .map(|(index, outcome)| match (outcome, policy) {
            (Ok(text), _) => text,
            (Err(_), MergePolicy::Overwrite) => String::new(),
            (Err(_), MergePolicy::PreserveOnFailure) => previous
                .and_then(|values| values.get(index))
                .cloned()
                .unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Answers from a fixed table keyed by upload name; records call order.
    struct FakeClient {
        answers: HashMap<String, Result<String, u16>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeClient {
        fn new(answers: &[(&str, Result<&str, u16>)]) -> Self {
            Self {
                answers: answers
                    .iter()
                    .map(|(name, answer)| (name.to_string(), answer.map(str::to_string)))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TranscriptionClient for FakeClient {
        async fn transcribe(&self, filename: &str, _bytes: Vec<u8>) -> Result<String, BatchItemError> {
            self.calls.lock().unwrap().push(filename.to_string());
            match self.answers.get(filename) {
                Some(Ok(text)) => Ok(text.clone()),
                Some(Err(status)) => Err(BatchItemError::Rejected {
                    status: *status,
                    message: "rejected".to_string(),
                }),
                None => Err(BatchItemError::Transport("no route".to_string())),
            }
        }
    }

    /// Five clips under `clips/`, the third one absent from disk.
    fn scratch_manifest(extra_column: &str) -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let audio_root = dir.path().join("audio");
        std::fs::create_dir_all(audio_root.join("clips")).unwrap();

        let mut csv = format!("filename,text,up_votes{}\n", extra_column);
        for i in 1..=5 {
            if i != 3 {
                std::fs::write(audio_root.join(format!("clips/s{}.mp3", i)), [i as u8; 16]).unwrap();
            }
            let tail = if extra_column.is_empty() {
                String::new()
            } else {
                format!(",old {}", i)
            };
            csv.push_str(&format!("clips/s{}.mp3,\"sentence, {}\",{}{}\n", i, i, i, tail));
        }

        let manifest_path = dir.path().join("cv-valid-dev.csv");
        std::fs::write(&manifest_path, csv).unwrap();
        (dir, manifest_path, audio_root)
    }

    fn all_ok() -> FakeClient {
        FakeClient::new(&[
            ("s1.mp3", Ok("ONE")),
            ("s2.mp3", Ok("TWO")),
            ("s3.mp3", Ok("THREE")),
            ("s4.mp3", Ok("FOUR")),
            ("s5.mp3", Ok("FIVE")),
        ])
    }

    #[tokio::test]
    async fn test_missing_file_is_isolated() {
        let (_dir, manifest_path, audio_root) = scratch_manifest("");
        let orchestrator = BatchOrchestrator::new(all_ok(), MergePolicy::Overwrite);

        let report = orchestrator.run(&manifest_path, &audio_root).await.unwrap();
        assert_eq!(
            report,
            BatchReport {
                total: 5,
                succeeded: 4,
                failed: 1
            }
        );

        // record 3 never reached the service, the others went in order
        assert_eq!(orchestrator.client.calls(), vec!["s1.mp3", "s2.mp3", "s4.mp3", "s5.mp3"]);

        let manifest = Manifest::load(&manifest_path).unwrap();
        assert_eq!(
            manifest.column(OUTPUT_COLUMN).unwrap(),
            vec!["ONE", "TWO", "", "FOUR", "FIVE"]
        );
    }

    #[tokio::test]
    async fn test_untouched_columns_are_byte_identical() {
        let (_dir, manifest_path, audio_root) = scratch_manifest("");
        let before = std::fs::read_to_string(&manifest_path).unwrap();

        BatchOrchestrator::new(all_ok(), MergePolicy::Overwrite)
            .run(&manifest_path, &audio_root)
            .await
            .unwrap();

        let after = std::fs::read_to_string(&manifest_path).unwrap();
        let before_lines: Vec<_> = before.lines().collect();
        let after_lines: Vec<_> = after.lines().collect();
        assert_eq!(before_lines.len(), after_lines.len());

        for (old, new) in before_lines.iter().zip(&after_lines) {
            let (prefix, appended) = new.rsplit_once(',').unwrap();
            assert_eq!(prefix, *old);
            assert!(!appended.contains('"'));
        }
        assert_eq!(after_lines[0], "filename,text,up_votes,generated_text");
    }

    #[test]
    fn test_absolute_filename_stays_under_audio_root() {
        let root = Path::new("/data/cv-corpus");
        assert_eq!(
            resolve_audio_path(root, "/cv-valid-dev/sample-000000.mp3"),
            PathBuf::from("/data/cv-corpus/cv-valid-dev/sample-000000.mp3")
        );
        assert_eq!(
            resolve_audio_path(root, "cv-valid-dev/sample-000001.mp3"),
            PathBuf::from("/data/cv-corpus/cv-valid-dev/sample-000001.mp3")
        );
    }

    #[tokio::test]
    async fn test_absolute_manifest_entry_is_read_from_audio_root() {
        let dir = tempfile::tempdir().unwrap();
        let audio_root = dir.path().join("audio");
        std::fs::create_dir_all(audio_root.join("clips")).unwrap();
        std::fs::write(audio_root.join("clips/s1.mp3"), [1u8; 16]).unwrap();

        let manifest_path = dir.path().join("manifest.csv");
        std::fs::write(&manifest_path, "filename\n/clips/s1.mp3\n").unwrap();

        let client = FakeClient::new(&[("s1.mp3", Ok("ONE"))]);
        let orchestrator = BatchOrchestrator::new(client, MergePolicy::Overwrite);
        let report = orchestrator.run(&manifest_path, &audio_root).await.unwrap();
        assert_eq!(report.succeeded, 1);

        let written = std::fs::read_to_string(&manifest_path).unwrap();
        assert_eq!(written, "filename,generated_text\n/clips/s1.mp3,ONE\n");
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let (_dir, manifest_path, audio_root) = scratch_manifest("");

        BatchOrchestrator::new(all_ok(), MergePolicy::Overwrite)
            .run(&manifest_path, &audio_root)
            .await
            .unwrap();
        let first = std::fs::read(&manifest_path).unwrap();

        BatchOrchestrator::new(all_ok(), MergePolicy::Overwrite)
            .run(&manifest_path, &audio_root)
            .await
            .unwrap();
        let second = std::fs::read(&manifest_path).unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_existing_column() {
        let (_dir, manifest_path, audio_root) = scratch_manifest(",generated_text");
        let client = FakeClient::new(&[
            ("s1.mp3", Ok("ONE")),
            ("s2.mp3", Err(500)),
            ("s4.mp3", Ok("FOUR")),
            ("s5.mp3", Err(400)),
        ]);

        let report = BatchOrchestrator::new(client, MergePolicy::Overwrite)
            .run(&manifest_path, &audio_root)
            .await
            .unwrap();
        assert_eq!(report.failed, 3);

        let manifest = Manifest::load(&manifest_path).unwrap();
        assert_eq!(manifest.headers().len(), 4);
        assert_eq!(
            manifest.column(OUTPUT_COLUMN).unwrap(),
            vec!["ONE", "", "", "FOUR", ""]
        );
    }

    #[tokio::test]
    async fn test_preserve_on_failure_keeps_previous_values() {
        let (_dir, manifest_path, audio_root) = scratch_manifest(",generated_text");
        let client = FakeClient::new(&[
            ("s1.mp3", Ok("ONE")),
            ("s2.mp3", Err(500)),
            ("s4.mp3", Ok("FOUR")),
            ("s5.mp3", Ok("FIVE")),
        ]);

        BatchOrchestrator::new(client, MergePolicy::PreserveOnFailure)
            .run(&manifest_path, &audio_root)
            .await
            .unwrap();

        let manifest = Manifest::load(&manifest_path).unwrap();
        assert_eq!(
            manifest.column(OUTPUT_COLUMN).unwrap(),
            vec!["ONE", "old 2", "old 3", "FOUR", "FIVE"]
        );
    }

    #[tokio::test]
    async fn test_manifest_without_filename_column_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("bad.csv");
        std::fs::write(&manifest_path, "path,text\na.mp3,hello\n").unwrap();

        let err = BatchOrchestrator::new(all_ok(), MergePolicy::Overwrite)
            .run(&manifest_path, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::MissingColumn(ref c) if c == "filename"));

        // the manifest is left alone
        assert_eq!(
            std::fs::read_to_string(&manifest_path).unwrap(),
            "path,text\na.mp3,hello\n"
        );
    }

    #[test]
    fn test_merge_without_previous_column() {
        let outcomes = vec![
            Ok("A".to_string()),
            Err(BatchItemError::Transport("down".to_string())),
        ];
        assert_eq!(
            merge_outcomes(outcomes, None, MergePolicy::PreserveOnFailure),
            vec!["A", ""]
        );
    }
}
