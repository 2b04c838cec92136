//! Narrative generator boundary.
//!
//! The engine only ever sees [`NarrativeGenerator::generate`]: a prompt goes
//! in, free text comes out. Callers parse and validate that text themselves
//! and fall back when it is unusable.

mod client;
mod types;

pub use client::{PipeGeneratorClient, RetryPolicy};
pub use types::*;

use async_trait::async_trait;

use crate::error::GeneratorResult;

/// Text generator used for story content, consequences and risk judgements.
///
/// Timeouts are owned by the implementation and reported as errors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NarrativeGenerator: Send + Sync {
    /// Generate a completion for the given prompt.
    async fn generate(&self, prompt: &str) -> GeneratorResult<String>;
}
