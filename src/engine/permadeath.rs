//! Permadeath risk evaluation.
//!
//! Every path here fails safe: a malformed or failed generator response never
//! kills a character.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::{extract_json_from_completion, preview, truncate_chars, EngineCore};
use crate::error::{EngineError, EngineResult};
use crate::memory::{
    record_best_effort, MemoryKind, MemoryRecord, DEATH_MEMORY_IMPORTANCE,
    NEAR_DEATH_MEMORY_IMPORTANCE,
};
use crate::prompts::{DANGER_LEVEL_PROMPT, EPITAPH_PROMPT, LETHAL_SITUATION_PROMPT};
use crate::storage::{Character, CharacterDeath, Difficulty, Session, StoreBatch};

/// Danger level assumed when the generator gives no usable rating.
pub const DEFAULT_DANGER_LEVEL: u8 = 5;

/// Highest possible death threshold.
pub const MAX_DEATH_THRESHOLD: f64 = 0.90;

/// Width of the band under the threshold that counts as a near-death.
pub const NEAR_DEATH_MARGIN: f64 = 0.2;

const MAX_DEATH_REASON_CHARS: usize = 200;

/// Probability above which a decision kills a character.
pub fn death_threshold(difficulty: Difficulty, level: u32) -> f64 {
    let base = match difficulty {
        Difficulty::Easy => 0.85,
        Difficulty::Normal => 0.70,
        Difficulty::Hard => 0.60,
        Difficulty::Hardcore => 0.50,
    };
    let level_bonus = (f64::from(level) * 0.01).min(0.10);
    (base - level_bonus).min(MAX_DEATH_THRESHOLD)
}

/// True when an item or ability keeps the character from dying.
pub fn has_death_protection(character: &Character) -> bool {
    let protective_item = character.inventory.iter().any(|item| {
        let name = item.name.to_lowercase();
        name.contains("resurrection")
            || name.contains("protection")
            || item
                .effects
                .get("preventDeath")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
    });

    let protective_ability = character.special_abilities.iter().any(|ability| {
        let name = ability.name.to_lowercase();
        name.contains("survival") || name.contains("invulnerability")
    });

    protective_item || protective_ability
}

/// Parse a danger rating, falling back to [`DEFAULT_DANGER_LEVEL`].
pub fn parse_danger_level(completion: &str) -> u8 {
    let cleaned = completion.trim().trim_end_matches('.');
    match cleaned.parse::<i64>() {
        Ok(level) if (0..=10).contains(&level) => level as u8,
        _ => {
            warn!(
                completion_preview = %preview(completion, 200),
                "Invalid danger level, using default"
            );
            DEFAULT_DANGER_LEVEL
        }
    }
}

/// Structured lethal judgement from the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LethalJudgement {
    #[serde(default)]
    pub should_die: bool,
    pub death_probability: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub death_description: Option<String>,
    #[serde(default)]
    pub last_words: Vec<String>,
}

impl LethalJudgement {
    /// Parse and validate; `None` when the response is unusable.
    pub fn from_completion(completion: &str) -> Option<Self> {
        let parsed = extract_json_from_completion(completion)
            .and_then(|json| serde_json::from_str::<Self>(json).map_err(|e| e.to_string()));

        match parsed {
            Ok(judgement) if (0.0..=1.0).contains(&judgement.death_probability) => Some(judgement),
            Ok(judgement) => {
                warn!(
                    probability = judgement.death_probability,
                    "Death probability out of range, treating as no death"
                );
                None
            }
            Err(e) => {
                warn!(
                    error = %e,
                    completion_preview = %preview(completion, 200),
                    "Failed to parse lethal judgement, treating as no death"
                );
                None
            }
        }
    }
}

/// Result of a lethal situation check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LethalOutcome {
    pub died: bool,
    /// True when the character narrowly escaped.
    pub near_death: bool,
    pub description: Option<String>,
    pub last_words: Option<Vec<String>>,
    pub probability: Option<f64>,
    pub reasoning: Option<String>,
}

impl LethalOutcome {
    fn survived() -> Self {
        Self::default()
    }
}

/// Evaluates danger and executes death or near-death transitions.
#[derive(Clone)]
pub struct PermadeathEvaluator {
    core: EngineCore,
}

impl PermadeathEvaluator {
    pub fn new(core: EngineCore) -> Self {
        Self { core }
    }

    /// Rate the danger of the current scene (0-10) and cache it on the session.
    pub async fn danger_level(&self, session_id: &str) -> EngineResult<u8> {
        let session = self.core.load_active_session(session_id).await?;
        let content = match session.current_node_id.as_deref() {
            Some(node_id) => self
                .core
                .storage()
                .get_node(node_id)
                .await?
                .map(|n| n.content)
                .unwrap_or_default(),
            None => String::new(),
        };

        let prompt = format!("{}\n\nScene:\n{}", DANGER_LEVEL_PROMPT, content);
        let level = match self.core.generator().generate(&prompt).await {
            Ok(completion) => parse_danger_level(&completion),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Danger assessment failed, using default");
                DEFAULT_DANGER_LEVEL
            }
        };

        let _guard = self.core.locks().acquire(session_id).await;
        let mut session = self.core.load_active_session(session_id).await?;
        if session.danger_level != level {
            session.danger_level = level;
            session.updated_at = self.core.clock().now();
            let mut batch = StoreBatch::new();
            batch.upsert_session(session);
            self.core.storage().apply(batch).await?;
        }

        Ok(level)
    }

    /// Judge whether `decision` kills the character, and act on it.
    pub async fn evaluate_lethal_situation(
        &self,
        session_id: &str,
        decision: &str,
        danger_level: u8,
    ) -> EngineResult<LethalOutcome> {
        let session = self.core.load_active_session(session_id).await?;
        if !session.permadeath_enabled {
            return Ok(LethalOutcome::survived());
        }
        let character = self.core.load_character(&session.character_id).await?;

        let prompt = format!(
            "{}\n\nCharacter: {} (level {}, health {})\nDanger level: {}/10\nDecision: {}",
            LETHAL_SITUATION_PROMPT,
            character.name,
            character.level,
            character.health,
            danger_level,
            decision
        );
        let judgement = match self.core.generator().generate(&prompt).await {
            Ok(completion) => LethalJudgement::from_completion(&completion),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Lethal judgement failed, treating as no death");
                None
            }
        };
        let Some(judgement) = judgement else {
            return Ok(LethalOutcome::survived());
        };

        let threshold = death_threshold(session.difficulty, character.level);
        let protected = has_death_protection(&character);
        let probability = judgement.death_probability;

        info!(
            session_id = %session_id,
            probability,
            threshold,
            protected,
            should_die = judgement.should_die,
            "Lethal situation judged"
        );

        let description = judgement
            .death_description
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| format!("Fell after deciding to {}", decision));

        let mut outcome = LethalOutcome {
            died: false,
            near_death: false,
            description: Some(description.clone()),
            last_words: Some(judgement.last_words.clone()),
            probability: Some(probability),
            reasoning: Some(judgement.reasoning.clone()),
        };

        if probability > threshold && !protected {
            self.execute_death(session_id, &description, &judgement.last_words, decision)
                .await?;
            outcome.died = true;
        } else if probability > threshold - NEAR_DEATH_MARGIN {
            self.record_near_death(session_id, &description).await?;
            outcome.near_death = true;
        }

        Ok(outcome)
    }

    /// Kill the character and end the session. Irreversible.
    pub async fn execute_death(
        &self,
        session_id: &str,
        description: &str,
        last_words: &[String],
        last_decision: &str,
    ) -> EngineResult<CharacterDeath> {
        let start = Instant::now();
        let session = self.core.load_active_session(session_id).await?;
        let character = self.core.load_character(&session.character_id).await?;
        let epitaph = self.epitaph(&character, description).await;

        let _guard = self.core.locks().acquire(session_id).await;
        let mut session = self.core.load_active_session(session_id).await?;
        let mut character = self.core.load_character(&session.character_id).await?;
        if !character.is_alive {
            return Err(EngineError::invalid_state(format!(
                "Character {} is already dead",
                character.id
            )));
        }

        let now = self.core.clock().now();
        character.is_alive = false;
        character.death_date = Some(now);
        character.updated_at = now;

        session.active = false;
        session.ended_at = Some(now);
        session.updated_at = now;
        session.death_reason = Some(truncate_chars(description, MAX_DEATH_REASON_CHARS));

        let death = CharacterDeath {
            id: Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            character_id: character.id.clone(),
            cause: description.to_string(),
            last_node_id: session.current_node_id.clone(),
            last_decision: last_decision.to_string(),
            last_words: last_words.to_vec(),
            level: character.level,
            days_survived: (now - character.created_at).num_days().max(0),
            quests_completed: session.quests_completed,
            significant_decisions: session.significant_decisions,
            epitaph,
            died_at: now,
        };

        let memory = MemoryRecord::new(
            &session.id,
            &character.id,
            MemoryKind::Death,
            format!("The death of {}", character.name),
            description,
            DEATH_MEMORY_IMPORTANCE,
        )
        .with_created_at(now);

        let mut batch = StoreBatch::new();
        batch
            .upsert_character(character.clone())
            .upsert_session(session)
            .insert_death(death.clone());
        self.core.storage().apply(batch).await?;

        record_best_effort(self.core.memory(), &[memory]).await;

        info!(
            session_id = %session_id,
            character_id = %character.id,
            days_survived = death.days_survived,
            latency_ms = start.elapsed().as_millis(),
            "Character died"
        );

        Ok(death)
    }

    /// Count a narrow escape on both session and character.
    pub async fn record_near_death(
        &self,
        session_id: &str,
        description: &str,
    ) -> EngineResult<Session> {
        let _guard = self.core.locks().acquire(session_id).await;
        let mut session = self.core.load_active_session(session_id).await?;
        let mut character = self.core.load_character(&session.character_id).await?;

        let now = self.core.clock().now();
        session.near_death_count += 1;
        session.updated_at = now;
        character.near_death_experiences += 1;
        character.updated_at = now;

        let memory = MemoryRecord::new(
            &session.id,
            &character.id,
            MemoryKind::NearDeath,
            "A brush with death",
            description,
            NEAR_DEATH_MEMORY_IMPORTANCE,
        )
        .with_created_at(now);

        let mut batch = StoreBatch::new();
        batch
            .upsert_character(character.clone())
            .upsert_session(session.clone());
        self.core.storage().apply(batch).await?;

        record_best_effort(self.core.memory(), &[memory]).await;

        info!(
            session_id = %session_id,
            character_id = %character.id,
            near_death_count = session.near_death_count,
            "Near-death recorded"
        );

        Ok(session)
    }

    async fn epitaph(&self, character: &Character, cause: &str) -> String {
        let prompt = format!(
            "{}\n\nName: {}\nLevel: {}\nCause of death: {}",
            EPITAPH_PROMPT, character.name, character.level, cause
        );
        match self.core.generator().generate(&prompt).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => fallback_epitaph(character),
            Err(e) => {
                warn!(character_id = %character.id, error = %e, "Epitaph generation failed, using template");
                fallback_epitaph(character)
            }
        }
    }
}

fn fallback_epitaph(character: &Character) -> String {
    format!(
        "Here lies {}, a level {} adventurer whose story ended too soon.",
        character.name, character.level
    )
}
