//! Terminal values of a transcription job.

use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// A successful transcription.
///
/// ## API Integration:
/// Serialized as-is in the HTTP response body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcript {
    pub job_id: Uuid,

    /// Normalized transcript text
    pub text: String,

    /// Engine model used
    pub model: String,

    /// Language forced on the engine, `None` when auto-detected
    pub language: Option<String>,

    /// Wall time from submission to completion, queueing included (milliseconds)
    pub processing_time_ms: u64,

    /// Unix timestamp of completion
    pub timestamp: u64,
}

/// Why a job did not produce a transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptionFailure {
    /// A process ran and exited non-zero
    ProcessFailed {
        program: String,
        exit_code: i32,
        /// Tail of the process's stderr
        stderr: String,
    },

    /// The engine could not be started, or the job faulted unexpectedly
    ProcessCrashed { cause: String },

    /// The engine exited cleanly but printed nothing transcript-shaped
    EmptyOutput,

    /// The caller withdrew interest (or the service is shutting down)
    Cancelled,
}

impl TranscriptionFailure {
    /// Stable machine-readable name, used in metrics and error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            TranscriptionFailure::ProcessFailed { .. } => "process_failed",
            TranscriptionFailure::ProcessCrashed { .. } => "process_crashed",
            TranscriptionFailure::EmptyOutput => "empty_output",
            TranscriptionFailure::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TranscriptionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptionFailure::ProcessFailed {
                program, exit_code, ..
            } => write!(f, "'{}' exited with code {}", program, exit_code),
            TranscriptionFailure::ProcessCrashed { cause } => {
                write!(f, "Transcription crashed: {}", cause)
            }
            TranscriptionFailure::EmptyOutput => {
                write!(f, "No speech could be recognized in the audio")
            }
            TranscriptionFailure::Cancelled => write!(f, "Transcription was cancelled"),
        }
    }
}

impl std::error::Error for TranscriptionFailure {}

pub type TranscriptResult = Result<Transcript, TranscriptionFailure>;
