//! # Transcription Pipeline
//!
//! Runs one job end to end:
//!
//! ```text
//! Queued ──acquire──> Admitted ──> Running ──exit 0──> Normalizing ──┐
//!   │                                 │                              │
//!   └──cancelled───┐        non-zero / spawn error / cancelled       │
//!                  ▼                  ▼                              ▼
//!               Cleaning <────────────┴──────────────────────────────┘
//!                  │
//!                  ▼
//!                Done
//! ```
//!
//! ## Guarantees:
//! - The gate slot lives only inside the admitted section and is dropped on
//!   every exit from it, panics included
//! - Every artifact of the job is deleted on every path into `Done`
//! - Every submission resolves to exactly one [`TranscriptResult`]

use crate::transcription::artifacts::ArtifactSet;
use crate::transcription::convert::AudioConverter;
use crate::transcription::gate::ConcurrencyGate;
use crate::transcription::normalizer::normalize;
use crate::transcription::request::{build_arguments, TranscriptionRequest};
use crate::transcription::runner::{CommandRunner, ProcessOutcome, ProcessRunner, RunError};
use crate::transcription::transcript::{Transcript, TranscriptResult, TranscriptionFailure};
use futures_util::FutureExt;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// Characters of stderr kept in a `ProcessFailed` report.
const STDERR_TAIL_CHARS: usize = 2000;

/// Lifecycle states of a job, logged as it moves through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Admitted,
    Running,
    Normalizing,
    Cleaning,
    Done,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Queued => "queued",
            JobState::Admitted => "admitted",
            JobState::Running => "running",
            JobState::Normalizing => "normalizing",
            JobState::Cleaning => "cleaning",
            JobState::Done => "done",
        };
        f.write_str(name)
    }
}

fn enter(state: JobState) {
    tracing::debug!(state = %state, "Job state changed");
}

/// Bounded-concurrency front end to the speech-to-text engine.
///
/// ## Thread Safety:
/// Shared behind an `Arc` by every caller. The gate is the only state
/// mutated across jobs; everything else a job touches is its own.
pub struct TranscriptionPipeline<R = CommandRunner> {
    executable: PathBuf,
    gate: ConcurrencyGate,
    runner: R,
    converter: Option<AudioConverter>,
}

impl TranscriptionPipeline<CommandRunner> {
    /// Pipeline running `executable` as a real child process.
    pub fn new(executable: impl Into<PathBuf>, max_concurrent_jobs: usize) -> Self {
        Self::with_runner(
            executable,
            ConcurrencyGate::new(max_concurrent_jobs),
            CommandRunner,
        )
    }
}

impl<R: ProcessRunner> TranscriptionPipeline<R> {
    pub fn with_runner(executable: impl Into<PathBuf>, gate: ConcurrencyGate, runner: R) -> Self {
        Self {
            executable: executable.into(),
            gate,
            runner,
            converter: None,
        }
    }

    /// Convert every input with `converter` before handing it to the engine.
    pub fn with_converter(mut self, converter: AudioConverter) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Transcribe `request.audio_path()` and delete everything the job touched.
    ///
    /// The input audio is considered owned by the job from this call on and
    /// is removed whatever the outcome.
    pub async fn submit(
        &self,
        request: TranscriptionRequest,
        cancel: &CancellationToken,
    ) -> TranscriptResult {
        let job_id = Uuid::new_v4();
        let span = tracing::info_span!("job", %job_id, model = %request.model());

        async move {
            let started = Instant::now();
            let mut artifacts = ArtifactSet::new();
            artifacts.track(request.audio_path());
            enter(JobState::Queued);

            let outcome = AssertUnwindSafe(self.run_admitted(&request, cancel, &mut artifacts))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let cause = format!("job panicked: {}", panic_message(panic.as_ref()));
                    tracing::error!(%cause, "Transcription job faulted");
                    Err(TranscriptionFailure::ProcessCrashed { cause })
                });

            enter(JobState::Cleaning);
            let report = artifacts.cleanup();
            if !report.is_clean() {
                report.log_warnings();
            }
            tracing::debug!(
                removed = report.removed,
                missing = report.missing,
                warnings = report.warnings.len(),
                "Artifacts cleaned up"
            );

            let processing_time_ms = started.elapsed().as_millis() as u64;
            let result = outcome.map(|text| Transcript {
                job_id,
                text,
                model: request.model().to_string(),
                language: request.language().map(str::to_string),
                processing_time_ms,
                timestamp: chrono::Utc::now().timestamp().max(0) as u64,
            });

            match &result {
                Ok(transcript) => tracing::info!(
                    chars = transcript.text.chars().count(),
                    processing_time_ms,
                    "Transcription completed"
                ),
                Err(TranscriptionFailure::Cancelled) => {
                    tracing::info!(processing_time_ms, "Transcription cancelled")
                }
                Err(failure @ TranscriptionFailure::ProcessFailed { stderr, .. }) => tracing::warn!(
                    kind = failure.kind(),
                    error = %failure,
                    %stderr,
                    processing_time_ms,
                    "Transcription failed"
                ),
                Err(failure) => tracing::warn!(
                    kind = failure.kind(),
                    error = %failure,
                    processing_time_ms,
                    "Transcription failed"
                ),
            }

            enter(JobState::Done);
            result
        }
        .instrument(span)
        .await
    }

    /// Everything that happens while the job holds a gate slot.
    async fn run_admitted(
        &self,
        request: &TranscriptionRequest,
        cancel: &CancellationToken,
        artifacts: &mut ArtifactSet,
    ) -> Result<String, TranscriptionFailure> {
        let slot = self
            .gate
            .acquire(cancel)
            .await
            .map_err(|_| TranscriptionFailure::Cancelled)?;
        enter(JobState::Admitted);

        tokio::fs::create_dir_all(request.output_dir())
            .await
            .map_err(|e| TranscriptionFailure::ProcessCrashed {
                cause: format!(
                    "cannot create output directory {}: {}",
                    request.output_dir().display(),
                    e
                ),
            })?;

        let engine_request = match &self.converter {
            Some(converter) => {
                let converted = converter.output_path(request.audio_path());
                artifacts.track(&converted);
                let args = converter.arguments(request.audio_path(), &converted);
                let outcome = self
                    .runner
                    .run(converter.executable(), &args, cancel)
                    .await
                    .map_err(failure_from_run)?;
                ensure_success(converter.executable(), &outcome)?;
                request.with_engine_input(converted)
            }
            None => request.clone(),
        };

        for path in engine_request.engine_output_paths() {
            artifacts.track(path);
        }

        enter(JobState::Running);
        let args = build_arguments(&engine_request);
        let outcome = self
            .runner
            .run(&self.executable, &args, cancel)
            .await
            .map_err(failure_from_run)?;
        ensure_success(&self.executable, &outcome)?;

        enter(JobState::Normalizing);
        let text = match normalize(&outcome.stdout) {
            Some(text) if !text.trim().is_empty() => text,
            _ => {
                tracing::debug!(stdout = %outcome.stdout, "Engine output has no transcript");
                return Err(TranscriptionFailure::EmptyOutput);
            }
        };

        slot.release();
        Ok(text)
    }
}

fn failure_from_run(error: RunError) -> TranscriptionFailure {
    match error {
        RunError::Cancelled => TranscriptionFailure::Cancelled,
        other => TranscriptionFailure::ProcessCrashed {
            cause: other.to_string(),
        },
    }
}

fn ensure_success(program: &Path, outcome: &ProcessOutcome) -> Result<(), TranscriptionFailure> {
    if outcome.success() {
        return Ok(());
    }

    Err(TranscriptionFailure::ProcessFailed {
        program: program.display().to_string(),
        exit_code: outcome.exit_code,
        stderr: tail(&outcome.stderr, STDERR_TAIL_CHARS),
    })
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    const TRANSCRIPT: &str = "Detected language: English\n[00:00.000 --> 00:01.000] Hello\n";

    /// What the fake engine does when invoked.
    #[derive(Clone)]
    enum Behavior {
        Exit { code: i32, stdout: &'static str },
        Sleep(Duration),
        UntilCancelled,
        Panic,
    }

    #[derive(Default)]
    struct Probe {
        calls: Mutex<Vec<(PathBuf, Vec<String>)>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
        events: Mutex<Vec<&'static str>>,
    }

    impl Probe {
        fn engine_calls(&self) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(program, _)| program == Path::new("whisper"))
                .count()
        }
    }

    /// Stands in for whisper and ffmpeg, writing the files they would write.
    struct ScriptedRunner {
        behavior: Behavior,
        probe: Arc<Probe>,
    }

    impl ProcessRunner for ScriptedRunner {
        async fn run(
            &self,
            program: &Path,
            args: &[String],
            cancel: &CancellationToken,
        ) -> Result<ProcessOutcome, RunError> {
            self.probe
                .calls
                .lock()
                .unwrap()
                .push((program.to_path_buf(), args.to_vec()));

            if program == Path::new("ffmpeg") {
                std::fs::write(args.last().unwrap(), b"RIFF").unwrap();
                return Ok(exit(0, ""));
            }

            write_engine_outputs(args);
            let now = self.probe.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.max_running.fetch_max(now, Ordering::SeqCst);
            self.probe.events.lock().unwrap().push("start");

            let result = match &self.behavior {
                Behavior::Exit { code, stdout } => Ok(exit(*code, stdout)),
                Behavior::Sleep(duration) => tokio::select! {
                    _ = tokio::time::sleep(*duration) => Ok(exit(0, TRANSCRIPT)),
                    _ = cancel.cancelled() => Err(RunError::Cancelled),
                },
                Behavior::UntilCancelled => {
                    cancel.cancelled().await;
                    Err(RunError::Cancelled)
                }
                Behavior::Panic => panic!("engine double exploded"),
            };

            self.probe.events.lock().unwrap().push("end");
            self.probe.running.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn exit(code: i32, stdout: &str) -> ProcessOutcome {
        ProcessOutcome {
            exit_code: code,
            stdout: stdout.to_string(),
            stderr: if code == 0 { String::new() } else { "boom".to_string() },
        }
    }

    /// Mimic whisper writing `<output_dir>/<stem>.<format>`.
    fn write_engine_outputs(args: &[String]) {
        let value_of = |flag: &str| {
            let at = args.iter().position(|a| a == flag).unwrap();
            args[at + 1].clone()
        };
        let stem = Path::new(&args[0]).file_stem().unwrap().to_os_string();
        let mut name = stem;
        name.push(".");
        name.push(value_of("--output_format"));
        // Fails harmlessly when a test has put a directory in the way
        let _ = std::fs::write(Path::new(&value_of("--output_dir")).join(name), b"{}");
    }

    struct Fixture {
        dir: TempDir,
        probe: Arc<Probe>,
        pipeline: Arc<TranscriptionPipeline<ScriptedRunner>>,
    }

    impl Fixture {
        fn new(behavior: Behavior, capacity: usize) -> Self {
            let probe = Arc::new(Probe::default());
            let runner = ScriptedRunner {
                behavior,
                probe: Arc::clone(&probe),
            };
            let pipeline =
                TranscriptionPipeline::with_runner("whisper", ConcurrencyGate::new(capacity), runner);
            Self::assemble(pipeline, probe)
        }

        fn with_converter(behavior: Behavior) -> Self {
            let probe = Arc::new(Probe::default());
            let runner = ScriptedRunner {
                behavior,
                probe: Arc::clone(&probe),
            };
            let pipeline = TranscriptionPipeline::with_runner("whisper", ConcurrencyGate::new(1), runner)
                .with_converter(AudioConverter::new("ffmpeg"));
            Self::assemble(pipeline, probe)
        }

        fn assemble(pipeline: TranscriptionPipeline<ScriptedRunner>, probe: Arc<Probe>) -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir(dir.path().join("audio")).unwrap();
            Self {
                dir,
                probe,
                pipeline: Arc::new(pipeline),
            }
        }

        fn out_dir(&self) -> PathBuf {
            self.dir.path().join("out")
        }

        fn request(&self, name: &str) -> TranscriptionRequest {
            let audio = self.dir.path().join("audio").join(format!("{}.oga", name));
            std::fs::write(&audio, b"OggS").unwrap();
            TranscriptionRequest::new(audio, self.out_dir(), "small").unwrap()
        }

        /// Files left behind in the audio and output directories.
        fn leftovers(&self) -> Vec<PathBuf> {
            let mut files = Vec::new();
            for dir in [self.dir.path().join("audio"), self.out_dir()] {
                if let Ok(entries) = std::fs::read_dir(dir) {
                    files.extend(entries.map(|e| e.unwrap().path()));
                }
            }
            files
        }

        fn spawn(
            &self,
            request: TranscriptionRequest,
            token: CancellationToken,
        ) -> tokio::task::JoinHandle<TranscriptResult> {
            let pipeline = Arc::clone(&self.pipeline);
            tokio::spawn(async move { pipeline.submit(request, &token).await })
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_successful_job() {
        let fx = Fixture::new(Behavior::Exit { code: 0, stdout: TRANSCRIPT }, 1);
        let request = fx.request("voice").with_language("en");
        let audio = request.audio_path().to_path_buf();

        let transcript = fx
            .pipeline
            .submit(request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(transcript.text, "Hello");
        assert_eq!(transcript.model, "small");
        assert_eq!(transcript.language.as_deref(), Some("en"));

        let calls = fx.probe.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1[0], audio.to_string_lossy());
        assert!(calls[0].1.contains(&"--language".to_string()));

        assert!(fx.out_dir().is_dir());
        assert!(fx.leftovers().is_empty());
        assert_eq!(fx.pipeline.gate().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_process_failed() {
        let fx = Fixture::new(Behavior::Exit { code: 2, stdout: TRANSCRIPT }, 1);
        let result = fx
            .pipeline
            .submit(fx.request("voice"), &CancellationToken::new())
            .await;

        assert_eq!(
            result.unwrap_err(),
            TranscriptionFailure::ProcessFailed {
                program: "whisper".to_string(),
                exit_code: 2,
                stderr: "boom".to_string(),
            }
        );
        assert!(fx.leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_unrecognizable_output_is_empty_output() {
        for stdout in ["random text with no markers", "[00:00.000 --> 00:02.000] Detected language: English\n"] {
            let fx = Fixture::new(Behavior::Exit { code: 0, stdout }, 1);
            let result = fx
                .pipeline
                .submit(fx.request("voice"), &CancellationToken::new())
                .await;

            assert_eq!(result.unwrap_err(), TranscriptionFailure::EmptyOutput);
            assert!(fx.leftovers().is_empty());
        }
    }

    #[tokio::test]
    async fn test_missing_engine_is_process_crashed() {
        let dir = TempDir::new().unwrap();
        let audio = dir.path().join("voice.oga");
        std::fs::write(&audio, b"OggS").unwrap();
        let request = TranscriptionRequest::new(&audio, dir.path().join("out"), "small").unwrap();

        let pipeline = TranscriptionPipeline::new("/nonexistent/whisper", 1);
        let result = pipeline.submit(request, &CancellationToken::new()).await;

        match result {
            Err(TranscriptionFailure::ProcessCrashed { cause }) => {
                assert!(cause.contains("/nonexistent/whisper"));
            }
            other => panic!("expected ProcessCrashed, got {:?}", other),
        }
        assert!(!audio.exists());
        assert_eq!(pipeline.gate().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panicking_job_releases_slot_and_cleans_up() {
        let fx = Fixture::new(Behavior::Panic, 1);
        let result = fx
            .pipeline
            .submit(fx.request("voice"), &CancellationToken::new())
            .await;

        match result {
            Err(TranscriptionFailure::ProcessCrashed { cause }) => {
                assert!(cause.contains("engine double exploded"));
            }
            other => panic!("expected ProcessCrashed, got {:?}", other),
        }
        assert_eq!(fx.pipeline.gate().in_flight(), 0);
        assert!(fx.leftovers().is_empty());

        // The pipeline keeps serving
        let again = fx
            .pipeline
            .submit(fx.request("second"), &CancellationToken::new())
            .await;
        assert!(matches!(again, Err(TranscriptionFailure::ProcessCrashed { .. })));
    }

    #[tokio::test]
    async fn test_cancel_while_running() {
        let fx = Fixture::new(Behavior::UntilCancelled, 1);
        let token = CancellationToken::new();
        let job = fx.spawn(fx.request("voice"), token.clone());

        let probe = Arc::clone(&fx.probe);
        wait_until(|| probe.running.load(Ordering::SeqCst) == 1).await;
        assert_eq!(fx.pipeline.gate().in_flight(), 1);

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), job)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.unwrap_err(), TranscriptionFailure::Cancelled);
        assert_eq!(fx.pipeline.gate().in_flight(), 0);
        assert!(fx.leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_queued_never_runs_engine() {
        let fx = Fixture::new(Behavior::UntilCancelled, 1);
        let first_token = CancellationToken::new();
        let first = fx.spawn(fx.request("first"), first_token.clone());

        let probe = Arc::clone(&fx.probe);
        wait_until(|| probe.running.load(Ordering::SeqCst) == 1).await;

        let second_token = CancellationToken::new();
        let second_request = fx.request("second");
        let second_audio = second_request.audio_path().to_path_buf();
        let second = fx.spawn(second_request, second_token.clone());

        let pipeline = Arc::clone(&fx.pipeline);
        wait_until(|| pipeline.gate().waiting() == 1).await;

        second_token.cancel();
        assert_eq!(second.await.unwrap().unwrap_err(), TranscriptionFailure::Cancelled);
        assert!(!second_audio.exists());
        assert_eq!(fx.probe.engine_calls(), 1);
        assert_eq!(fx.pipeline.gate().in_flight(), 1);

        first_token.cancel();
        assert_eq!(first.await.unwrap().unwrap_err(), TranscriptionFailure::Cancelled);
        assert_eq!(fx.probe.engine_calls(), 1);
        assert!(fx.leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_extra_job_waits_for_a_free_slot() {
        let fx = Fixture::new(Behavior::Sleep(Duration::from_millis(150)), 2);
        let jobs: Vec<_> = (0..3)
            .map(|i| fx.spawn(fx.request(&format!("job{}", i)), CancellationToken::new()))
            .collect();

        for job in jobs {
            assert_eq!(job.await.unwrap().unwrap().text, "Hello");
        }

        assert_eq!(fx.probe.max_running.load(Ordering::SeqCst), 2);
        let events = fx.probe.events.lock().unwrap().clone();
        let third_start = events
            .iter()
            .enumerate()
            .filter(|(_, e)| **e == "start")
            .nth(2)
            .map(|(i, _)| i)
            .unwrap();
        assert!(events[..third_start].contains(&"end"));
        assert!(fx.leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_converter_output_is_transcribed_and_removed() {
        let fx = Fixture::with_converter(Behavior::Exit { code: 0, stdout: TRANSCRIPT });
        let result = fx
            .pipeline
            .submit(fx.request("voice"), &CancellationToken::new())
            .await;
        assert_eq!(result.unwrap().text, "Hello");

        let calls = fx.probe.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, PathBuf::from("ffmpeg"));
        assert!(calls[1].1[0].ends_with("voice.16k.wav"));
        assert!(fx.leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_failed_artifact_deletion_keeps_outcome() {
        let fx = Fixture::new(Behavior::Exit { code: 0, stdout: TRANSCRIPT }, 1);
        let request = fx.request("voice");
        let audio = request.audio_path().to_path_buf();
        // A directory where the engine output file should be cannot be removed
        std::fs::create_dir_all(fx.out_dir().join("voice.txt")).unwrap();

        let result = fx.pipeline.submit(request, &CancellationToken::new()).await;

        assert_eq!(result.unwrap().text, "Hello");
        assert!(!audio.exists());
        assert_eq!(fx.leftovers(), vec![fx.out_dir().join("voice.txt")]);
    }

    #[test]
    fn test_stderr_tail_keeps_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
        assert_eq!(tail("привет", 2), "ет");
    }
}
