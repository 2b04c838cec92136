//! Memory records written when consequences fire, characters die or
//! narrowly escape death.
//!
//! Recording is fire-and-forget from the engine's point of view: a failing
//! recorder is logged by [`record_best_effort`] and never aborts the operation
//! that produced the memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::StorageResult;

/// Importance of the memory written for a permanent death.
pub const DEATH_MEMORY_IMPORTANCE: f64 = 1.0;

/// Importance of the memory written for a near-death experience.
pub const NEAR_DEATH_MEMORY_IMPORTANCE: f64 = 0.8;

/// What produced a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Consequence,
    Death,
    NearDeath,
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryKind::Consequence => write!(f, "consequence"),
            MemoryKind::Death => write!(f, "death"),
            MemoryKind::NearDeath => write!(f, "near_death"),
        }
    }
}

impl std::str::FromStr for MemoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "consequence" => Ok(MemoryKind::Consequence),
            "death" => Ok(MemoryKind::Death),
            "near_death" => Ok(MemoryKind::NearDeath),
            _ => Err(format!("Unknown memory kind: {}", s)),
        }
    }
}

/// A memory handed to the [`MemoryRecorder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub session_id: String,
    pub character_id: String,
    pub title: String,
    pub content: String,
    pub kind: MemoryKind,
    /// Importance in `[0.0, 1.0]`.
    pub importance: f64,
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// Create a new memory record. Importance is clamped to `[0.0, 1.0]`.
    pub fn new(
        session_id: impl Into<String>,
        character_id: impl Into<String>,
        kind: MemoryKind,
        title: impl Into<String>,
        content: impl Into<String>,
        importance: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            character_id: character_id.into(),
            title: title.into(),
            content: content.into(),
            kind,
            importance: importance.clamp(0.0, 1.0),
            created_at: Utc::now(),
        }
    }

    /// Override the creation time
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Sink for memory records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MemoryRecorder: Send + Sync {
    async fn record_memory(&self, memory: &MemoryRecord) -> StorageResult<()>;
}

/// Record each memory, logging failures instead of returning them.
pub async fn record_best_effort(recorder: &dyn MemoryRecorder, memories: &[MemoryRecord]) {
    for memory in memories {
        if let Err(e) = recorder.record_memory(memory).await {
            warn!(
                session_id = %memory.session_id,
                kind = %memory.kind,
                error = %e,
                "Failed to record memory"
            );
        }
    }
}
