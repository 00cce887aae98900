pub mod config;
pub mod detection;
pub mod error;
pub mod faces;
pub mod formatter;
pub mod heuristics;
pub mod overlay;
pub mod pipeline;
pub mod provider;
pub mod queue;
pub mod rate_limit;
pub mod remote_model;
pub mod sampler;
pub mod scene;

pub use config::NarratorConfig;
pub use error::{DetectionError, NarratorError, NarratorResult};
pub use formatter::{CommentaryFormatter, fallback_description};
pub use pipeline::{Commentary, CommentaryPipeline};
pub use provider::{DescriptionProvider, ProviderError};
pub use queue::DescriptionQueue;
pub use scene::SceneDescriptor;
