// Capture layer: produces an `Artifact` either by running an external
// screenshot program or by reading an image the user already has on disk.
// Capturing is a single best-effort attempt; there is no retry here.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Local, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

/// Image container format, detected from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Bmp,
    Unknown,
}

impl ImageFormat {
    /// Detect the format from magic bytes.
    pub fn sniff(data: &[u8]) -> Self {
        if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
            ImageFormat::Png
        } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            ImageFormat::Jpeg
        } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            ImageFormat::Gif
        } else if data.starts_with(b"BM") {
            ImageFormat::Bmp
        } else {
            ImageFormat::Unknown
        }
    }

    pub fn from_extension(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("png") => ImageFormat::Png,
            Some("jpg") | Some("jpeg") => ImageFormat::Jpeg,
            Some("gif") => ImageFormat::Gif,
            Some("bmp") => ImageFormat::Bmp,
            _ => ImageFormat::Unknown,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Bmp => "image/bmp",
            ImageFormat::Unknown => "application/octet-stream",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Gif => "gif",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Unknown => "bin",
        }
    }
}

/// A captured image waiting to be uploaded.
#[derive(Debug, Clone)]
pub struct Artifact {
    data: Vec<u8>,
    format: ImageFormat,
    captured_at: DateTime<Utc>,
    path: Option<PathBuf>,
}

impl Artifact {
    /// Wrap raw image bytes. Empty payloads are rejected.
    pub fn new(data: Vec<u8>, format: ImageFormat) -> Result<Self, CaptureError> {
        if data.is_empty() {
            return Err(CaptureError::Empty);
        }
        Ok(Self {
            data,
            format,
            captured_at: Utc::now(),
            path: None,
        })
    }

    /// Load an artifact from a file, sniffing the format and falling back to
    /// the extension when the magic bytes are not recognised.
    pub fn from_file(path: &Path) -> Result<Self, CaptureError> {
        let data = fs::read(path).map_err(|source| CaptureError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let format = match ImageFormat::sniff(&data) {
            ImageFormat::Unknown => ImageFormat::from_extension(path),
            known => known,
        };
        let mut artifact = Artifact::new(data, format)?;
        artifact.path = Some(path.to_path_buf());
        Ok(artifact)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// File name used for the upload form part.
    pub fn file_name(&self) -> String {
        self.path
            .as_ref()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!(
                    "{}.{}",
                    self.captured_at.with_timezone(&Local).format("%Y-%m-%d_%H-%M-%S"),
                    self.format.extension()
                )
            })
    }
}

/// Anything that can produce an artifact with a single blocking call.
pub trait Capturer {
    fn capture(&self) -> Result<Artifact, CaptureError>;

    /// Whether the file behind a captured artifact belongs to the capturer
    /// and may be removed once the pipeline is finished with it.
    fn owns_output(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    Full,
    Area,
    Window,
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureMode::Full => write!(f, "full screen"),
            CaptureMode::Area => write!(f, "area"),
            CaptureMode::Window => write!(f, "window"),
        }
    }
}

/// External screenshot program and how to drive it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CaptureTool {
    Named(NamedTool),
    /// Any program; `{output}` in `args` is replaced by the target path.
    Custom { program: String, args: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamedTool {
    Scrot,
    Maim,
    Grim,
    Import,
}

impl Default for CaptureTool {
    fn default() -> Self {
        CaptureTool::Named(NamedTool::Scrot)
    }
}

impl CaptureTool {
    pub fn program(&self) -> &str {
        match self {
            CaptureTool::Named(NamedTool::Scrot) => "scrot",
            CaptureTool::Named(NamedTool::Maim) => "maim",
            CaptureTool::Named(NamedTool::Grim) => "grim",
            CaptureTool::Named(NamedTool::Import) => "import",
            CaptureTool::Custom { program, .. } => program,
        }
    }

    /// Command line arguments for `mode`, or `None` if the tool cannot do it.
    fn args(&self, mode: CaptureMode, output: &Path) -> Option<Vec<OsString>> {
        let out = output.as_os_str().to_os_string();
        let flags: &[&str] = match (self, mode) {
            (CaptureTool::Custom { args, .. }, _) => {
                return Some(
                    args.iter()
                        .map(|a| {
                            if a.contains("{output}") {
                                OsString::from(a.replace("{output}", &output.to_string_lossy()))
                            } else {
                                OsString::from(a)
                            }
                        })
                        .collect(),
                );
            }
            (CaptureTool::Named(NamedTool::Scrot), CaptureMode::Full) => &[],
            (CaptureTool::Named(NamedTool::Scrot), CaptureMode::Area) => &["-s"],
            (CaptureTool::Named(NamedTool::Scrot), CaptureMode::Window) => &["-u"],
            (CaptureTool::Named(NamedTool::Maim), CaptureMode::Full) => &[],
            (CaptureTool::Named(NamedTool::Maim), CaptureMode::Area) => &["-s"],
            (CaptureTool::Named(NamedTool::Maim), CaptureMode::Window) => return None,
            (CaptureTool::Named(NamedTool::Grim), CaptureMode::Full) => &[],
            (CaptureTool::Named(NamedTool::Grim), _) => return None,
            (CaptureTool::Named(NamedTool::Import), CaptureMode::Full) => &["-window", "root"],
            (CaptureTool::Named(NamedTool::Import), CaptureMode::Area) => &[],
            (CaptureTool::Named(NamedTool::Import), CaptureMode::Window) => return None,
        };
        let mut args: Vec<OsString> = flags.iter().map(OsString::from).collect();
        args.push(out);
        Some(args)
    }
}

/// Runs an external screenshot program and reads back what it wrote.
pub struct CommandCapturer {
    tool: CaptureTool,
    mode: CaptureMode,
    output_dir: PathBuf,
    keep_output: bool,
}

impl CommandCapturer {
    pub fn new(tool: CaptureTool, mode: CaptureMode, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            mode,
            output_dir: output_dir.into(),
            keep_output: true,
        }
    }

    /// Whether screenshots should stay on disk after the upload.
    pub fn keep_output(mut self, keep: bool) -> Self {
        self.keep_output = keep;
        self
    }

    fn output_path(&self) -> PathBuf {
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let mut path = self.output_dir.join(format!("{stamp}.png"));
        let mut n = 1;
        while path.exists() {
            path = self.output_dir.join(format!("{stamp}_{n}.png"));
            n += 1;
        }
        path
    }
}

impl Capturer for CommandCapturer {
    fn capture(&self) -> Result<Artifact, CaptureError> {
        fs::create_dir_all(&self.output_dir).map_err(|source| CaptureError::Io {
            path: self.output_dir.clone(),
            source,
        })?;
        let output = self.output_path();
        let program = self.tool.program().to_string();
        let args = self
            .tool
            .args(self.mode, &output)
            .ok_or_else(|| CaptureError::Unsupported {
                tool: program.clone(),
                mode: self.mode.to_string(),
            })?;

        debug!("running {} {:?}", program, args);
        let status = Command::new(&program).args(&args).status().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                CaptureError::Unavailable(program.clone())
            } else {
                CaptureError::Failed(format!("{program}: {e}"))
            }
        })?;
        if !status.success() {
            let _ = fs::remove_file(&output);
            return Err(CaptureError::Failed(format!("{program} exited with {status}")));
        }

        let artifact = Artifact::from_file(&output).map_err(|e| {
            let _ = fs::remove_file(&output);
            match e {
                // Some tools exit 0 without writing anything when the user
                // dismisses the selection.
                CaptureError::Io { source, .. } if source.kind() == ErrorKind::NotFound => {
                    CaptureError::Empty
                }
                other => other,
            }
        })?;
        info!(
            "captured {} ({} bytes) to {}",
            self.mode,
            artifact.data().len(),
            output.display()
        );
        Ok(artifact)
    }

    fn owns_output(&self) -> bool {
        !self.keep_output
    }
}

/// Uploads an existing file instead of taking a screenshot.
pub struct FileCapturer {
    path: PathBuf,
}

impl FileCapturer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Capturer for FileCapturer {
    fn capture(&self) -> Result<Artifact, CaptureError> {
        let artifact = Artifact::from_file(&self.path)?;
        info!("loaded {} ({} bytes)", self.path.display(), artifact.data().len());
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PNG_HEADER: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn sniffs_common_formats() {
        assert_eq!(ImageFormat::sniff(&PNG_HEADER), ImageFormat::Png);
        assert_eq!(ImageFormat::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), ImageFormat::Jpeg);
        assert_eq!(ImageFormat::sniff(b"GIF89a...."), ImageFormat::Gif);
        assert_eq!(ImageFormat::sniff(b"hello"), ImageFormat::Unknown);
    }

    #[test]
    fn empty_artifact_is_rejected() {
        assert!(matches!(
            Artifact::new(Vec::new(), ImageFormat::Png),
            Err(CaptureError::Empty)
        ));
    }

    #[test]
    fn file_capturer_falls_back_to_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shot.jpeg");
        fs::write(&path, b"not really a jpeg").unwrap();

        let artifact = FileCapturer::new(&path).capture().unwrap();
        assert_eq!(artifact.format(), ImageFormat::Jpeg);
        assert_eq!(artifact.file_name(), "shot.jpeg");
        assert_eq!(artifact.path(), Some(path.as_path()));
    }

    #[test]
    fn file_capturer_rejects_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.png");
        fs::write(&path, b"").unwrap();

        assert!(matches!(FileCapturer::new(&path).capture(), Err(CaptureError::Empty)));
        assert!(!FileCapturer::new(&path).owns_output());
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempdir().unwrap();
        let err = FileCapturer::new(dir.path().join("nope.png")).capture().unwrap_err();
        assert!(matches!(err, CaptureError::Io { .. }));
    }

    #[test]
    fn scrot_arguments_follow_the_mode() {
        let tool = CaptureTool::Named(NamedTool::Scrot);
        let out = Path::new("/tmp/x.png");
        assert_eq!(tool.args(CaptureMode::Full, out).unwrap(), vec![OsString::from("/tmp/x.png")]);
        assert_eq!(
            tool.args(CaptureMode::Area, out).unwrap(),
            vec![OsString::from("-s"), OsString::from("/tmp/x.png")]
        );
        assert!(CaptureTool::Named(NamedTool::Grim).args(CaptureMode::Area, out).is_none());
        assert!(CaptureTool::Named(NamedTool::Maim).args(CaptureMode::Window, out).is_none());
    }

    #[test]
    fn custom_tool_substitutes_output() {
        let tool = CaptureTool::Custom {
            program: "spectacle".into(),
            args: vec!["-b".into(), "-o".into(), "{output}".into()],
        };
        let args = tool.args(CaptureMode::Window, Path::new("/tmp/y.png")).unwrap();
        assert_eq!(args.last().unwrap(), &OsString::from("/tmp/y.png"));
    }

    #[test]
    fn missing_program_is_unavailable() {
        let dir = tempdir().unwrap();
        let tool = CaptureTool::Custom {
            program: "puush-test-no-such-program".into(),
            args: vec!["{output}".into()],
        };
        let err = CommandCapturer::new(tool, CaptureMode::Full, dir.path())
            .capture()
            .unwrap_err();
        assert!(matches!(err, CaptureError::Unavailable(_)));
    }

    #[cfg(unix)]
    #[test]
    fn command_capturer_reads_program_output() {
        let dir = tempdir().unwrap();
        let tool = CaptureTool::Custom {
            program: "sh".into(),
            args: vec!["-c".into(), "printf 'GIF89a-data' > \"$0\"".into(), "{output}".into()],
        };
        let capturer = CommandCapturer::new(tool, CaptureMode::Full, dir.path()).keep_output(false);
        let artifact = capturer.capture().unwrap();

        assert_eq!(artifact.data(), b"GIF89a-data");
        assert_eq!(artifact.format(), ImageFormat::Gif);
        assert!(artifact.path().unwrap().starts_with(dir.path()));
        assert!(capturer.owns_output());
    }

    #[cfg(unix)]
    #[test]
    fn command_capturer_reports_empty_and_failed_runs() {
        let dir = tempdir().unwrap();
        let empty = CaptureTool::Custom {
            program: "sh".into(),
            args: vec!["-c".into(), ": > \"$0\"".into(), "{output}".into()],
        };
        assert!(matches!(
            CommandCapturer::new(empty, CaptureMode::Area, dir.path()).capture(),
            Err(CaptureError::Empty)
        ));

        let aborted = CaptureTool::Custom {
            program: "sh".into(),
            args: vec!["-c".into(), "exit 1".into()],
        };
        assert!(matches!(
            CommandCapturer::new(aborted, CaptureMode::Area, dir.path()).capture(),
            Err(CaptureError::Failed(_))
        ));
    }
}
