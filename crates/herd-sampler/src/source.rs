use herd_core::FrameFormat;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source not found: {0}")]
    NotFound(PathBuf),
    #[error("source {0} contains no jpg/png frames")]
    Empty(PathBuf),
    #[error("unsupported frame file: {0}")]
    Unsupported(PathBuf),
    #[error("source is not open")]
    NotOpen,
    #[error("failed reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A rewindable stream of encoded frames.
pub trait FrameSource: Send {
    fn open(&mut self) -> Result<(), SourceError>;

    /// `Ok(None)` marks the end of the stream.
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, SourceError>;

    fn rewind(&mut self) -> Result<(), SourceError>;

    fn release(&mut self);

    /// Native frame rate, when the source knows it.
    fn frames_per_second(&self) -> Option<f64>;

    fn describe(&self) -> String;
}

/// Still frames played back as video: either a directory of `.jpg/.jpeg/.png`
/// files in lexicographic order, or a single image repeated forever.
#[derive(Debug)]
pub struct ImageSequenceSource {
    root: PathBuf,
    fps: Option<f64>,
    frames: Vec<PathBuf>,
    cursor: usize,
    opened: bool,
}

impl ImageSequenceSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            fps: None,
            frames: Vec::new(),
            cursor: 0,
            opened: false,
        }
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = (fps > 0.0).then_some(fps);
        self
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn io_error(path: &Path, source: io::Error) -> SourceError {
        SourceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn list_frames(&self) -> Result<Vec<PathBuf>, SourceError> {
        let metadata = match std::fs::metadata(&self.root) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound(self.root.clone()))
            }
            Err(err) => return Err(Self::io_error(&self.root, err)),
        };

        if metadata.is_file() {
            if FrameFormat::from_path(&self.root).is_none() {
                return Err(SourceError::Unsupported(self.root.clone()));
            }
            return Ok(vec![self.root.clone()]);
        }

        let mut frames = Vec::new();
        let entries =
            std::fs::read_dir(&self.root).map_err(|err| Self::io_error(&self.root, err))?;
        for entry in entries {
            let path = entry.map_err(|err| Self::io_error(&self.root, err))?.path();
            if path.is_file() && FrameFormat::from_path(&path).is_some() {
                frames.push(path);
            }
        }
        frames.sort();
        if frames.is_empty() {
            return Err(SourceError::Empty(self.root.clone()));
        }
        Ok(frames)
    }
}

impl FrameSource for ImageSequenceSource {
    fn open(&mut self) -> Result<(), SourceError> {
        self.frames = self.list_frames()?;
        self.cursor = 0;
        self.opened = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
        if !self.opened {
            return Err(SourceError::NotOpen);
        }
        let Some(path) = self.frames.get(self.cursor) else {
            return Ok(None);
        };
        let bytes = std::fs::read(path).map_err(|err| Self::io_error(path, err))?;
        self.cursor += 1;
        Ok(Some(bytes))
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        if !self.opened {
            return Err(SourceError::NotOpen);
        }
        self.cursor = 0;
        Ok(())
    }

    fn release(&mut self) {
        self.frames.clear();
        self.cursor = 0;
        self.opened = false;
    }

    fn frames_per_second(&self) -> Option<f64> {
        self.fps
    }

    fn describe(&self) -> String {
        format!("images:{}", self.root.display())
    }
}
