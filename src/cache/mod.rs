//! Cached artifacts and the logic that keeps them in step with upstream.

pub mod fingerprint;
pub mod pipeline;
pub mod state;

pub use pipeline::{Outcome, Pipeline, PipelineKind, RefreshPolicy};
