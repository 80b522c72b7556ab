pub mod runtime;
pub mod source;

pub use runtime::{
    Sampler, SamplerConfig, SamplerError, SamplerPhase, SamplerReport, DEFAULT_ANALYSIS_INTERVAL,
    DEFAULT_FPS, DEFAULT_OPEN_TIMEOUT_MS,
};
pub use source::{FrameSource, ImageSequenceSource, SourceError};
