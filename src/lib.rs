//! # Narrative Branch Engine
//!
//! Branching story timelines, delayed consequence scheduling and permadeath
//! evaluation for choice-driven role-playing sessions whose text comes from
//! an LLM-backed narrative generator.
//!
//! ## Features
//!
//! - **Story tree**: node memoization per (parent, choice), so replaying a
//!   choice never forks duplicate content
//! - **Rewind and restore**: abandoned continuations are archived as named
//!   branches and can be made live again
//! - **Delayed consequences**: actions become immediate or time-delayed
//!   effects that fire exactly once from a periodic sweep
//! - **Permadeath**: difficulty-adjusted lethal judgements with protection
//!   items, near-death tracking and death snapshots
//!
//! ## Architecture
//!
//! ```text
//! API layer → NarrativeEngine → BranchManager / ConsequenceScheduler / PermadeathEvaluator
//!                                     ↓                    ↓
//!                              SQLite (State)     Narrative generator (HTTP)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use narrative_branch_engine::{Config, EngineCore, NarrativeEngine};
//! use narrative_branch_engine::generator::PipeGeneratorClient;
//! use narrative_branch_engine::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = Arc::new(SqliteStorage::new(&config.database).await?);
//!     let generator = PipeGeneratorClient::new(&config.generator, config.request.clone())?;
//!     let core = EngineCore::new(storage.clone(), Arc::new(generator), storage);
//!     let engine = NarrativeEngine::new(core, &config.permadeath);
//!     let outcome = engine.take_choice("session-id", "choice-id").await?;
//!     println!("{}", outcome.node.content);
//!     Ok(())
//! }
//! ```

/// Command line interface for the engine binary.
pub mod cli;
/// Injectable time source.
pub mod clock;
/// Configuration management.
pub mod config;
/// Branch, consequence and permadeath engines.
pub mod engine;
/// Error types and result aliases for the application.
pub mod error;
/// Narrative generator trait and HTTP client.
pub mod generator;
/// Memory records and the memory collaborator.
pub mod memory;
/// Prompt templates for the narrative generator.
pub mod prompts;
/// SQLite storage layer for persistence.
pub mod storage;

pub use config::Config;
pub use engine::{EngineCore, NarrativeEngine};
pub use error::{AppError, AppResult, EngineError, EngineResult};
