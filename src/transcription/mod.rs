//! # Transcription Module
//!
//! Bounded-concurrency pipeline around an external speech-to-text engine
//! (the `whisper` CLI by default). Audio never gets decoded in-process; the
//! engine is a child process and its stdout is the transcript.
//!
//! ## Key Components:
//! - **Requests**: Immutable job descriptions and the engine argument contract
//! - **Runner**: Child process execution with cancellation
//! - **Gate**: FIFO admission control bounding concurrent engine runs
//! - **Normalizer**: Scrubs timestamps and banners from engine output
//! - **Artifacts**: Scoped deletion of every temporary file a job touches
//! - **Pipeline**: Ties the above into one job lifecycle
//!
//! ## Job Flow:
//! ```text
//! submit(request, token)
//!   → gate.acquire → [convert] → engine → normalize
//!   → release slot → delete artifacts → Transcript | TranscriptionFailure
//! ```

pub mod artifacts;   // Temporary file ownership and cleanup
pub mod convert;     // Optional ffmpeg pre-conversion
pub mod gate;        // Concurrency limiting
pub mod normalizer;  // Engine output scrubbing
pub mod pipeline;    // Job lifecycle
pub mod request;     // Request model and argument construction
pub mod runner;      // External process execution
pub mod transcript;  // Job results

pub use convert::AudioConverter;
pub use pipeline::TranscriptionPipeline;
pub use request::{OutputFormat, RequestError, TranscriptionRequest};
pub use transcript::{Transcript, TranscriptResult, TranscriptionFailure};
