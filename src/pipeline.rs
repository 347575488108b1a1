// Capture -> upload -> record, as one blocking operation.
//
// The pipeline owns the artifact for its whole life and drops it when it
// reaches `Done` or `Failed`. Run it on a worker thread if the caller needs
// to stay responsive; cancel through the `CancelToken`.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use log::{debug, warn};

use crate::api::{Credentials, UploadResult, Uploader};
use crate::capture::{Artifact, Capturer};
use crate::error::{PipelineError, UploadError};
use crate::history::{HistoryRecord, HistoryStore};
use crate::retry::CancelToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Capturing,
    Uploading,
    Recording,
    Done,
    Failed(String),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed(_))
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Idle => write!(f, "idle"),
            PipelineState::Capturing => write!(f, "capturing"),
            PipelineState::Uploading => write!(f, "uploading"),
            PipelineState::Recording => write!(f, "recording"),
            PipelineState::Done => write!(f, "done"),
            PipelineState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub upload: UploadResult,
    pub record: HistoryRecord,
}

pub struct Pipeline<'a, C, U> {
    capturer: C,
    uploader: U,
    history: &'a HistoryStore,
    credentials: Credentials,
    state: PipelineState,
    observer: Option<Box<dyn FnMut(&PipelineState) + 'a>>,
}

impl<'a, C: Capturer, U: Uploader> Pipeline<'a, C, U> {
    pub fn new(
        capturer: C,
        uploader: U,
        history: &'a HistoryStore,
        credentials: Credentials,
    ) -> Self {
        Self {
            capturer,
            uploader,
            history,
            credentials,
            state: PipelineState::Idle,
            observer: None,
        }
    }

    /// Called on every state change, e.g. to drive a spinner message.
    pub fn on_transition(mut self, observer: impl FnMut(&PipelineState) + 'a) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn run(&mut self, cancel: &CancelToken) -> Result<PipelineReport, PipelineError> {
        let result = self.run_stages(cancel);
        match &result {
            Ok(_) => self.transition(PipelineState::Done),
            Err(e) => self.transition(PipelineState::Failed(e.to_string())),
        }
        result
    }

    fn run_stages(&mut self, cancel: &CancelToken) -> Result<PipelineReport, PipelineError> {
        if self.state.is_terminal() {
            // A pipeline is single use; a new capture is a new pipeline.
            self.state = PipelineState::Idle;
        }

        self.transition(PipelineState::Capturing);
        let artifact = self.capturer.capture()?;
        let captured_at = artifact.captured_at();
        let scratch = self.scratch_file(&artifact);

        if cancel.is_cancelled() {
            discard(scratch);
            return Err(UploadError::Cancelled.into());
        }

        self.transition(PipelineState::Uploading);
        let uploaded = self.uploader.upload(&artifact, &self.credentials, cancel);
        let local_path = if scratch.is_some() {
            None
        } else {
            artifact.path().map(|p| p.to_path_buf())
        };
        drop(artifact);
        discard(scratch);
        let upload = uploaded?;

        self.transition(PipelineState::Recording);
        let record = HistoryRecord::from_upload(&upload, captured_at, local_path);
        if let Err(source) = self.history.append(&record) {
            return Err(PipelineError::Storage { upload, source });
        }
        Ok(PipelineReport { upload, record })
    }

    /// The capture file to delete once the run is over, if the capturer
    /// does not want to keep it.
    fn scratch_file(&self, artifact: &Artifact) -> Option<PathBuf> {
        if self.capturer.owns_output() {
            artifact.path().map(|p| p.to_path_buf())
        } else {
            None
        }
    }

    fn transition(&mut self, next: PipelineState) {
        debug!("pipeline {} -> {}", self.state, next);
        self.state = next;
        if let Some(observer) = self.observer.as_mut() {
            observer(&self.state);
        }
    }
}

fn discard(scratch: Option<PathBuf>) {
    if let Some(path) = scratch {
        if let Err(e) = fs::remove_file(&path) {
            warn!("could not remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ImageFormat;
    use crate::error::CaptureError;
    use std::cell::Cell;
    use tempfile::tempdir;

    struct StaticCapturer(Option<Vec<u8>>);

    impl Capturer for StaticCapturer {
        fn capture(&self) -> Result<Artifact, CaptureError> {
            match &self.0 {
                Some(data) => Artifact::new(data.clone(), ImageFormat::Png),
                None => Err(CaptureError::Unavailable("scrot".into())),
            }
        }
    }

    struct FixedUploader {
        url: &'static str,
        calls: Cell<u32>,
    }

    impl Uploader for FixedUploader {
        fn upload(
            &self,
            _artifact: &Artifact,
            _credentials: &Credentials,
            _cancel: &CancelToken,
        ) -> Result<UploadResult, UploadError> {
            self.calls.set(self.calls.get() + 1);
            UploadResult::new(self.url, 0).ok_or(UploadError::Protocol("empty".into()))
        }
    }

    fn uploader() -> FixedUploader {
        FixedUploader {
            url: "https://puu.sh/ok.png",
            calls: Cell::new(0),
        }
    }

    #[test]
    fn walks_every_state_on_success() {
        let dir = tempdir().unwrap();
        let history = HistoryStore::new(dir.path().join("history.jsonl"));
        let mut seen = Vec::new();
        let report = {
            let mut pipeline = Pipeline::new(
                StaticCapturer(Some(b"png".to_vec())),
                uploader(),
                &history,
                Credentials::new("KEY").unwrap(),
            )
            .on_transition(|s| seen.push(s.clone()));
            pipeline.run(&CancelToken::new()).unwrap()
        };

        assert_eq!(
            seen,
            vec![
                PipelineState::Capturing,
                PipelineState::Uploading,
                PipelineState::Recording,
                PipelineState::Done,
            ]
        );
        assert_eq!(report.record.url, "https://puu.sh/ok.png");
        assert_eq!(history.list().unwrap().count(), 1);
    }

    #[test]
    fn capture_failure_skips_upload() {
        let dir = tempdir().unwrap();
        let history = HistoryStore::new(dir.path().join("history.jsonl"));
        let mut pipeline = Pipeline::new(
            StaticCapturer(None),
            uploader(),
            &history,
            Credentials::new("KEY").unwrap(),
        );

        let err = pipeline.run(&CancelToken::new()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(matches!(pipeline.state(), PipelineState::Failed(_)));
        assert_eq!(pipeline.uploader.calls.get(), 0);
        assert_eq!(history.list().unwrap().count(), 0);
    }

    #[test]
    fn cancelled_before_upload() {
        let dir = tempdir().unwrap();
        let history = HistoryStore::new(dir.path().join("history.jsonl"));
        let mut pipeline = Pipeline::new(
            StaticCapturer(Some(b"png".to_vec())),
            uploader(),
            &history,
            Credentials::new("KEY").unwrap(),
        );
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = pipeline.run(&cancel).unwrap_err();
        assert!(matches!(err, PipelineError::Upload(UploadError::Cancelled)));
        assert_eq!(pipeline.uploader.calls.get(), 0);
    }

    #[test]
    fn storage_failure_still_reports_the_url() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();
        let history = HistoryStore::new(blocker.join("history.jsonl"));
        let mut pipeline = Pipeline::new(
            StaticCapturer(Some(b"png".to_vec())),
            uploader(),
            &history,
            Credentials::new("KEY").unwrap(),
        );

        let err = pipeline.run(&CancelToken::new()).unwrap_err();
        assert_eq!(err.uploaded_url(), Some("https://puu.sh/ok.png"));
        assert_eq!(err.exit_code(), 6);
        assert!(matches!(pipeline.state(), PipelineState::Failed(_)));
    }
}
