//! Optional pre-conversion of uploaded audio to 16 kHz mono WAV with an
//! external tool (ffmpeg by default). The tool runs through the same
//! [`ProcessRunner`](super::runner::ProcessRunner) and gate slot as the engine.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AudioConverter {
    executable: PathBuf,
}

impl AudioConverter {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Where the converted copy of `input` is written.
    ///
    /// `audio/abc.oga` becomes `audio/abc.16k.wav`, which never collides
    /// with the input even when the upload already is a WAV file.
    pub fn output_path(&self, input: &Path) -> PathBuf {
        input.with_extension("16k.wav")
    }

    pub fn arguments(&self, input: &Path, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-ar".to_string(),
            "16000".to_string(),
            "-ac".to_string(),
            "1".to_string(),
            output.to_string_lossy().into_owned(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_never_overwrites_input() {
        let converter = AudioConverter::new("ffmpeg");
        assert_eq!(
            converter.output_path(Path::new("audio/abc.oga")),
            PathBuf::from("audio/abc.16k.wav")
        );
        assert_eq!(
            converter.output_path(Path::new("audio/abc.wav")),
            PathBuf::from("audio/abc.16k.wav")
        );
    }

    #[test]
    fn test_arguments_end_with_output() {
        let converter = AudioConverter::new("ffmpeg");
        let args = converter.arguments(Path::new("in.oga"), Path::new("in.16k.wav"));
        assert_eq!(args.first().map(String::as_str), Some("-y"));
        assert_eq!(args.last().map(String::as_str), Some("in.16k.wav"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "in.oga"));
    }
}
