pub mod error;
pub mod ffmpeg;
pub mod frame;
pub mod observability;
pub mod pipeline;
pub mod probe;
pub mod server;
pub mod transform;

pub use error::{PipelineError, Stage};
pub use frame::{Frame, MediaGeometry};
pub use pipeline::{CancelToken, Pipeline, PipelineConfig, PipelineReport};
pub use transform::Transform;
