//! # Transcription Requests
//!
//! Describes a single transcription job and turns it into the argument list
//! handed to the speech-to-text engine.
//!
//! ## Argument Contract:
//! ```text
//! <exe> <audio> --model <name> --output_dir <dir> --output_format <fmt>
//!       [--language <lang>] [--initial_prompt <text>]
//! ```
//! Every value is passed as its own argv entry. No shell ever sees the
//! command line, so prompts with spaces or metacharacters stay one token.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Output formats understood by the whisper CLI.
///
/// Serialized lowercase; parsed case-insensitively from every source
/// (config file, environment, form field, JSON update).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum OutputFormat {
    #[default]
    Txt,
    Vtt,
    Srt,
    Tsv,
    Json,
    /// Every format above, one file each
    All,
}

impl OutputFormat {
    const CONCRETE: [OutputFormat; 5] = [
        OutputFormat::Txt,
        OutputFormat::Vtt,
        OutputFormat::Srt,
        OutputFormat::Tsv,
        OutputFormat::Json,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Txt => "txt",
            OutputFormat::Vtt => "vtt",
            OutputFormat::Srt => "srt",
            OutputFormat::Tsv => "tsv",
            OutputFormat::Json => "json",
            OutputFormat::All => "all",
        }
    }

    /// File extensions the engine writes for this format.
    pub fn extensions(&self) -> Vec<&'static str> {
        match self {
            OutputFormat::All => Self::CONCRETE.iter().map(|f| f.as_str()).collect(),
            other => vec![other.as_str()],
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "txt" => Ok(OutputFormat::Txt),
            "vtt" => Ok(OutputFormat::Vtt),
            "srt" => Ok(OutputFormat::Srt),
            "tsv" => Ok(OutputFormat::Tsv),
            "json" => Ok(OutputFormat::Json),
            "all" => Ok(OutputFormat::All),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl TryFrom<String> for OutputFormat {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Reasons a request cannot be built.
#[derive(Debug)]
pub enum RequestError {
    /// The audio file was not found at submission time
    MissingAudio(PathBuf),
    /// Model name was empty
    EmptyModel,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::MissingAudio(path) => {
                write!(f, "Audio file does not exist: {}", path.display())
            }
            RequestError::EmptyModel => write!(f, "Model name must not be empty"),
        }
    }
}

impl std::error::Error for RequestError {}

/// Immutable description of one transcription job.
///
/// ## Construction:
/// Built with [`TranscriptionRequest::new`] and refined with the `with_*`
/// methods. The audio file must exist when `new` is called. Empty or
/// whitespace-only language and prompt values are treated as absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionRequest {
    audio_path: PathBuf,
    output_dir: PathBuf,
    model: String,
    output_format: OutputFormat,
    language: Option<String>,
    initial_prompt: Option<String>,
}

impl TranscriptionRequest {
    pub fn new(
        audio_path: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        model: impl Into<String>,
    ) -> Result<Self, RequestError> {
        let audio_path = audio_path.into();
        if !audio_path.is_file() {
            return Err(RequestError::MissingAudio(audio_path));
        }

        let model = model.into();
        if model.trim().is_empty() {
            return Err(RequestError::EmptyModel);
        }

        Ok(Self {
            audio_path,
            output_dir: output_dir.into(),
            model,
            output_format: OutputFormat::default(),
            language: None,
            initial_prompt: None,
        })
    }

    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = non_empty(language.into());
        self
    }

    pub fn with_initial_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.initial_prompt = non_empty(prompt.into());
        self
    }

    pub fn audio_path(&self) -> &Path {
        &self.audio_path
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn output_format(&self) -> OutputFormat {
        self.output_format
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    pub fn initial_prompt(&self) -> Option<&str> {
        self.initial_prompt.as_deref()
    }

    /// Copy of this request pointing the engine at a different input file.
    ///
    /// Used when the source audio has been converted before transcription.
    pub(crate) fn with_engine_input(&self, audio_path: PathBuf) -> Self {
        Self {
            audio_path,
            ..self.clone()
        }
    }

    /// Paths the engine writes into `output_dir` for this request.
    ///
    /// Whisper names its outputs after the input file stem, so
    /// `audio/abc.oga` with `txt` output becomes `<output_dir>/abc.txt`.
    pub fn engine_output_paths(&self) -> Vec<PathBuf> {
        let stem = self
            .audio_path
            .file_stem()
            .map(|s| s.to_os_string())
            .unwrap_or_default();

        self.output_format
            .extensions()
            .into_iter()
            .map(|ext| {
                let mut name = stem.clone();
                name.push(".");
                name.push(ext);
                self.output_dir.join(name)
            })
            .collect()
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Build the engine's argument list for a request.
pub fn build_arguments(request: &TranscriptionRequest) -> Vec<String> {
    let mut args = vec![
        request.audio_path.to_string_lossy().into_owned(),
        "--model".to_string(),
        request.model.clone(),
        "--output_dir".to_string(),
        request.output_dir.to_string_lossy().into_owned(),
        "--output_format".to_string(),
        request.output_format.to_string(),
    ];

    if let Some(language) = &request.language {
        args.push("--language".to_string());
        args.push(language.clone());
    }

    if let Some(prompt) = &request.initial_prompt {
        args.push("--initial_prompt".to_string());
        args.push(prompt.clone());
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn audio_fixture(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"OggS").unwrap();
        path
    }

    fn count(args: &[String], flag: &str) -> usize {
        args.iter().filter(|a| a.as_str() == flag).count()
    }

    #[test]
    fn test_missing_audio_is_rejected() {
        let dir = TempDir::new().unwrap();
        let result = TranscriptionRequest::new(dir.path().join("nope.oga"), dir.path(), "small");
        assert!(matches!(result, Err(RequestError::MissingAudio(_))));
    }

    #[test]
    fn test_empty_model_is_rejected() {
        let dir = TempDir::new().unwrap();
        let audio = audio_fixture(&dir, "clip.oga");
        let result = TranscriptionRequest::new(audio, dir.path(), "  ");
        assert!(matches!(result, Err(RequestError::EmptyModel)));
    }

    #[test]
    fn test_arguments_without_optional_flags() {
        let dir = TempDir::new().unwrap();
        let audio = audio_fixture(&dir, "clip.oga");
        let request = TranscriptionRequest::new(&audio, "/tmp/out", "small")
            .unwrap()
            .with_language("")
            .with_initial_prompt("   ");

        let args = build_arguments(&request);
        assert_eq!(
            args,
            vec![
                audio.to_string_lossy().into_owned(),
                "--model".to_string(),
                "small".to_string(),
                "--output_dir".to_string(),
                "/tmp/out".to_string(),
                "--output_format".to_string(),
                "txt".to_string(),
            ]
        );
        assert_eq!(count(&args, "--language"), 0);
        assert_eq!(count(&args, "--initial_prompt"), 0);
    }

    #[test]
    fn test_optional_flags_appear_once_in_order() {
        let dir = TempDir::new().unwrap();
        let audio = audio_fixture(&dir, "clip.oga");
        let prompt = "Names: O'Brien; $(rm -rf /) && `echo hi`";
        let request = TranscriptionRequest::new(&audio, "/tmp/out", "medium")
            .unwrap()
            .with_output_format(OutputFormat::Json)
            .with_language("ru")
            .with_initial_prompt(prompt);

        let args = build_arguments(&request);
        assert_eq!(count(&args, "--language"), 1);
        assert_eq!(count(&args, "--initial_prompt"), 1);
        assert_eq!(&args[7..], &["--language", "ru", "--initial_prompt", prompt]);
        assert_eq!(args[6], "json");
    }

    #[test]
    fn test_output_paths_follow_input_stem() {
        let dir = TempDir::new().unwrap();
        let audio = audio_fixture(&dir, "AgADBAAD.oga");
        let request = TranscriptionRequest::new(&audio, "/srv/whisper", "small").unwrap();
        assert_eq!(
            request.engine_output_paths(),
            vec![PathBuf::from("/srv/whisper/AgADBAAD.txt")]
        );

        let all = request.with_output_format(OutputFormat::All);
        assert_eq!(all.engine_output_paths().len(), 5);
    }

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("txt".parse::<OutputFormat>().unwrap(), OutputFormat::Txt);
        assert!("mp3".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_output_format_deserializes_any_case() {
        let format: OutputFormat = serde_json::from_str("\"JSON\"").unwrap();
        assert_eq!(format, OutputFormat::Json);
        assert!(serde_json::from_str::<OutputFormat>("\"mp3\"").is_err());
        assert_eq!(serde_json::to_string(&OutputFormat::Srt).unwrap(), "\"srt\"");
    }
}
