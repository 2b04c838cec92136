//! Narrative branch graph and delayed consequence engine.
//!
//! - [`BranchManager`]: story tree, path rows, rewind and branch restore
//! - [`ConsequenceScheduler`]: action evaluation, pending cache, periodic sweep
//! - [`PermadeathEvaluator`]: danger level, lethal judgement, death and near-death
//! - [`NarrativeEngine`]: one player turn across all three
//! - [`Sweeper`]: background task running the sweep on an interval
//!
//! All components share infrastructure through [`EngineCore`] composition.

mod branch;
mod consequence;
mod locks;
mod narrative;
mod permadeath;
mod sweeper;

pub use branch::*;
pub use consequence::*;
pub use locks::{SessionGuard, SessionLocks};
pub use narrative::*;
pub use permadeath::*;
pub use sweeper::*;

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::error::{EngineError, EngineResult};
use crate::generator::NarrativeGenerator;
use crate::memory::MemoryRecorder;
use crate::storage::{Character, Session, Storage};

/// Core infrastructure shared by all engine components.
///
/// Cloning is cheap; clones share the same storage, generator, memory sink,
/// clock and lock registry.
#[derive(Clone)]
pub struct EngineCore {
    storage: Arc<dyn Storage>,
    generator: Arc<dyn NarrativeGenerator>,
    memory: Arc<dyn MemoryRecorder>,
    clock: Arc<dyn Clock>,
    locks: SessionLocks,
}

impl EngineCore {
    /// Create a core using the system clock.
    pub fn new(
        storage: Arc<dyn Storage>,
        generator: Arc<dyn NarrativeGenerator>,
        memory: Arc<dyn MemoryRecorder>,
    ) -> Self {
        Self {
            storage,
            generator,
            memory,
            clock: Arc::new(SystemClock),
            locks: SessionLocks::new(),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[inline]
    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    #[inline]
    pub fn generator(&self) -> &dyn NarrativeGenerator {
        self.generator.as_ref()
    }

    #[inline]
    pub fn memory(&self) -> &dyn MemoryRecorder {
        self.memory.as_ref()
    }

    #[inline]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    #[inline]
    pub fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    pub(crate) async fn load_session(&self, session_id: &str) -> EngineResult<Session> {
        self.storage
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Session", session_id))
    }

    /// Load a session and fail with `InvalidState` once it has ended.
    pub(crate) async fn load_active_session(&self, session_id: &str) -> EngineResult<Session> {
        let session = self.load_session(session_id).await?;
        if !session.active {
            return Err(EngineError::invalid_state(format!(
                "Session {} is no longer active",
                session_id
            )));
        }
        Ok(session)
    }

    pub(crate) async fn load_character(&self, character_id: &str) -> EngineResult<Character> {
        self.storage
            .get_character(character_id)
            .await?
            .ok_or_else(|| EngineError::not_found("Character", character_id))
    }
}

// ============================================================================
// Shared Utilities
// ============================================================================

/// Extract JSON from a completion string, handling markdown code blocks.
///
/// Attempts extraction in this order:
/// 1. Raw JSON object or array
/// 2. ```json ... ``` code blocks
/// 3. ``` ... ``` code blocks
pub(crate) fn extract_json_from_completion(completion: &str) -> Result<&str, String> {
    let trimmed = completion.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    if completion.contains("```json") {
        return completion
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ```json block but content was empty or malformed".to_string());
    }

    if completion.contains("```") {
        return completion
            .split("```")
            .nth(1)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ``` block but content was empty or malformed".to_string());
    }

    Err(format!(
        "No JSON found in response. First 100 chars: '{}'",
        preview(completion, 100)
    ))
}

/// First `max` characters of `text`.
pub(crate) fn preview(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Truncate to at most `max` characters, never splitting a code point.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Short title for a consequence: the first sentence when it fits in 50
/// characters, otherwise the first 50 characters.
pub(crate) fn derive_title(description: &str) -> String {
    const MAX_TITLE_CHARS: usize = 50;

    let trimmed = description.trim();
    let first_sentence = trimmed
        .split(['.', '!', '?'])
        .next()
        .map(str::trim)
        .unwrap_or_default();

    if !first_sentence.is_empty() && first_sentence.chars().count() <= MAX_TITLE_CHARS {
        first_sentence.to_string()
    } else {
        truncate_chars(trimmed, MAX_TITLE_CHARS)
    }
}
