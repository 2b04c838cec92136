//! Consequence scheduling: turn a player action into delayed effects, keep the
//! session's pending cache bounded and fire due consequences exactly once.

use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{derive_title, extract_json_from_completion, preview, truncate_chars, EngineCore};
use crate::error::{EngineError, EngineResult};
use crate::memory::{record_best_effort, MemoryKind, MemoryRecord};
use crate::prompts::CONSEQUENCE_EVALUATION_PROMPT;
use crate::storage::{
    Character, Consequence, PendingConsequence, Session, Severity, StoreBatch, TimeToTrigger,
    PENDING_CACHE_LIMIT,
};

/// Most consequences kept from one evaluation.
pub const MAX_CONSEQUENCES_PER_ACTION: usize = 3;

/// Characters of description kept in a pending cache entry.
const PENDING_DESCRIPTION_CHARS: usize = 100;

// ============================================================================
// Trigger times
// ============================================================================

/// Trigger instant for a delay class, relative to `now`.
///
/// | class     | offset            |
/// |-----------|-------------------|
/// | immediate | 0                 |
/// | short     | [1h, 3h)          |
/// | medium    | [6h, 24h)         |
/// | long      | [2d, 7d)          |
pub fn trigger_time_at<R: Rng + ?Sized>(
    now: DateTime<Utc>,
    time_to_trigger: TimeToTrigger,
    rng: &mut R,
) -> DateTime<Utc> {
    const HOUR_MS: i64 = 60 * 60 * 1000;
    const DAY_MS: i64 = 24 * HOUR_MS;

    let offset_ms = match time_to_trigger {
        TimeToTrigger::Immediate => 0,
        TimeToTrigger::Short => rng.gen_range(HOUR_MS..3 * HOUR_MS),
        TimeToTrigger::Medium => rng.gen_range(6 * HOUR_MS..24 * HOUR_MS),
        TimeToTrigger::Long => rng.gen_range(2 * DAY_MS..7 * DAY_MS),
    };
    now + Duration::milliseconds(offset_ms)
}

// ============================================================================
// Candidates
// ============================================================================

/// A validated consequence proposed for an action, not persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsequenceCandidate {
    pub description: String,
    pub time_to_trigger: TimeToTrigger,
    pub severity: Severity,
    pub is_permanent: bool,
    #[serde(default)]
    pub affected_entities: Vec<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Outcome of validating one generated candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateParse {
    Accepted(ConsequenceCandidate),
    Rejected(String),
}

impl CandidateParse {
    /// Validate a single candidate field by field.
    pub fn from_value(value: &serde_json::Value) -> Self {
        let Some(obj) = value.as_object() else {
            return CandidateParse::Rejected("candidate is not an object".to_string());
        };

        let description = match obj.get("description").and_then(|v| v.as_str()) {
            Some(text) if !text.trim().is_empty() => text.trim().to_string(),
            _ => return CandidateParse::Rejected("description missing or empty".to_string()),
        };

        let time_to_trigger = match obj
            .get("timeToTrigger")
            .and_then(|v| v.as_str())
            .map(str::parse::<TimeToTrigger>)
        {
            Some(Ok(ttt)) => ttt,
            _ => return CandidateParse::Rejected("invalid timeToTrigger".to_string()),
        };

        let severity = match obj
            .get("severity")
            .and_then(|v| v.as_str())
            .map(str::parse::<Severity>)
        {
            Some(Ok(severity)) => severity,
            _ => return CandidateParse::Rejected("invalid severity".to_string()),
        };

        let Some(is_permanent) = obj.get("isPermanent").and_then(|v| v.as_bool()) else {
            return CandidateParse::Rejected("isPermanent must be a boolean".to_string());
        };

        let affected_entities = obj
            .get("affectedEntities")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let title = obj
            .get("title")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);

        CandidateParse::Accepted(ConsequenceCandidate {
            description,
            time_to_trigger,
            severity,
            is_permanent,
            affected_entities,
            title,
        })
    }
}

impl ConsequenceCandidate {
    /// The single consequence used when evaluation yields nothing usable.
    pub fn fallback(action: &str) -> Self {
        Self {
            description: format!(
                "The choice to \"{}\" will have consequences that ripple through the world.",
                preview(action.trim(), 100)
            ),
            time_to_trigger: TimeToTrigger::Medium,
            severity: Severity::Minor,
            is_permanent: false,
            affected_entities: Vec::new(),
            title: None,
        }
    }

    fn title(&self) -> String {
        self.title
            .clone()
            .unwrap_or_else(|| derive_title(&self.description))
    }
}

/// Parse generator output into accepted candidates, capped at
/// [`MAX_CONSEQUENCES_PER_ACTION`]. Errors when nothing is usable.
pub fn parse_candidates(completion: &str) -> Result<Vec<ConsequenceCandidate>, String> {
    let json = extract_json_from_completion(completion)?;
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| format!("Invalid JSON: {}", e))?;

    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut obj) => match obj.remove("consequences") {
            Some(serde_json::Value::Array(items)) => items,
            _ => return Err("Expected a JSON array of consequences".to_string()),
        },
        _ => return Err("Expected a JSON array of consequences".to_string()),
    };

    let mut accepted = Vec::new();
    for (index, item) in items.iter().enumerate() {
        match CandidateParse::from_value(item) {
            CandidateParse::Accepted(candidate) => accepted.push(candidate),
            CandidateParse::Rejected(reason) => {
                debug!(index, reason = %reason, "Rejected consequence candidate");
            }
        }
    }

    if accepted.is_empty() {
        return Err(format!("No valid consequences among {} candidates", items.len()));
    }

    accepted.truncate(MAX_CONSEQUENCES_PER_ACTION);
    Ok(accepted)
}

// ============================================================================
// Pending cache
// ============================================================================

/// Drop entries beyond [`PENDING_CACHE_LIMIT`], keeping the most severe and
/// then the soonest. The list is left untouched while it fits.
pub fn evict_pending(pending: &mut Vec<PendingConsequence>) {
    if pending.len() <= PENDING_CACHE_LIMIT {
        return;
    }
    pending.sort_by(|a, b| {
        b.severity
            .weight()
            .cmp(&a.severity.weight())
            .then_with(|| a.trigger_time.cmp(&b.trigger_time))
    });
    pending.truncate(PENDING_CACHE_LIMIT);
}

// ============================================================================
// Permanent effects
// ============================================================================

/// Keyword class of a permanent effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectCategory {
    Combat,
    Magic,
    Health,
}

const COMBAT_KEYWORDS: &[&str] = &[
    "wound", "scar", "injury", "combat", "battle", "fight", "sword", "weapon",
];
const MAGIC_KEYWORDS: &[&str] = &[
    "spell",
    "magic",
    "curse",
    "arcane",
    "wizard",
    "sorcery",
    "enchantment",
];
const HEALTH_KEYWORDS: &[&str] = &[
    "disease", "illness", "sickness", "health", "injury", "poison", "wound",
];

const STRENGTH_FLOOR: i32 = 1;
const MANA_FLOOR: i32 = 10;
const HEALTH_FLOOR: i32 = 10;

impl EffectCategory {
    /// First matching category, checked in combat, magic, health order.
    pub fn detect(description: &str) -> Option<Self> {
        let lower = description.to_lowercase();
        let matches = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

        if matches(COMBAT_KEYWORDS) {
            Some(EffectCategory::Combat)
        } else if matches(MAGIC_KEYWORDS) {
            Some(EffectCategory::Magic)
        } else if matches(HEALTH_KEYWORDS) {
            Some(EffectCategory::Health)
        } else {
            None
        }
    }
}

/// What a permanent consequence did to a character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermanentEffect {
    pub consequence_id: String,
    pub category: Option<EffectCategory>,
    pub strength_delta: i32,
    pub mana_delta: i32,
    pub health_delta: i32,
}

/// Subtract `penalty` without going below `floor`, and never raise a stat
/// that is already under it.
fn floored(value: i32, penalty: i32, floor: i32) -> i32 {
    (value - penalty).max(floor.min(value))
}

/// Apply a permanent consequence to a character.
///
/// The description is always appended to the character's permanent effects.
/// Only major and critical consequences whose description matches a keyword
/// category cost stats.
pub fn apply_permanent_effect(
    consequence: &Consequence,
    character: &mut Character,
) -> PermanentEffect {
    let category = EffectCategory::detect(&consequence.description);
    let scale = match consequence.severity {
        Severity::Critical => 2,
        Severity::Major => 1,
        Severity::Minor | Severity::Moderate => 0,
    };

    let (strength_penalty, mana_penalty, health_penalty) = match category {
        Some(EffectCategory::Combat) => (scale, 0, 0),
        Some(EffectCategory::Magic) => (0, 10 * scale, 0),
        Some(EffectCategory::Health) => (0, 0, 10 * scale),
        None => (0, 0, 0),
    };

    let before = (character.strength, character.mana, character.health);
    character.strength = floored(character.strength, strength_penalty, STRENGTH_FLOOR);
    character.mana = floored(character.mana, mana_penalty, MANA_FLOOR);
    character.health = floored(character.health, health_penalty, HEALTH_FLOOR);
    character.permanent_effects.push(consequence.description.clone());

    PermanentEffect {
        consequence_id: consequence.id.clone(),
        category,
        strength_delta: character.strength - before.0,
        mana_delta: character.mana - before.1,
        health_delta: character.health - before.2,
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// The situation an action is evaluated in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionContext {
    pub session_id: String,
    /// Id recorded as `source_action_id` on every resulting consequence.
    pub action_id: String,
    /// Scene description; the current node's content when absent.
    pub situation: Option<String>,
}

impl ActionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            action_id: Uuid::new_v4().to_string(),
            situation: None,
        }
    }

    /// Set the action id
    pub fn with_action_id(mut self, action_id: impl Into<String>) -> Self {
        self.action_id = action_id.into();
        self
    }

    /// Set the situation text
    pub fn with_situation(mut self, situation: impl Into<String>) -> Self {
        self.situation = Some(situation.into());
        self
    }
}

/// Totals of one sweep run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Session groups processed successfully.
    pub sessions: usize,
    /// Consequences marked triggered.
    pub triggered: usize,
    /// Session groups that failed and were skipped.
    pub failed: usize,
}

/// Evaluates actions into consequences and fires them when due.
#[derive(Clone)]
pub struct ConsequenceScheduler {
    core: EngineCore,
}

impl ConsequenceScheduler {
    pub fn new(core: EngineCore) -> Self {
        Self { core }
    }

    /// Ask the generator what an action leads to.
    ///
    /// Never returns an empty list: an unusable or failed generation yields
    /// exactly one minor, medium-delay fallback consequence.
    pub async fn evaluate(
        &self,
        action: &str,
        context: &ActionContext,
    ) -> EngineResult<Vec<ConsequenceCandidate>> {
        if action.trim().is_empty() {
            return Err(EngineError::Validation {
                field: "action".to_string(),
                reason: "cannot be empty".to_string(),
            });
        }

        let start = Instant::now();
        let session = self.core.load_active_session(&context.session_id).await?;
        let situation = match &context.situation {
            Some(situation) => situation.clone(),
            None => self.current_content(&session).await?,
        };

        let prompt = format!(
            "{}\n\nAction: {}\nSituation: {}\nDifficulty: {}",
            CONSEQUENCE_EVALUATION_PROMPT, action, situation, session.difficulty
        );

        let candidates = match self.core.generator().generate(&prompt).await {
            Ok(completion) => match parse_candidates(&completion) {
                Ok(candidates) => candidates,
                Err(reason) => {
                    warn!(
                        session_id = %session.id,
                        reason = %reason,
                        completion_preview = %preview(&completion, 200),
                        "Failed to parse consequences, using fallback"
                    );
                    vec![ConsequenceCandidate::fallback(action)]
                }
            },
            Err(e) => {
                warn!(
                    session_id = %session.id,
                    error = %e,
                    "Consequence generation failed, using fallback"
                );
                vec![ConsequenceCandidate::fallback(action)]
            }
        };

        info!(
            session_id = %session.id,
            action_id = %context.action_id,
            consequences = candidates.len(),
            latency_ms = start.elapsed().as_millis(),
            "Action evaluated"
        );

        Ok(candidates)
    }

    /// Trigger instant for a delay class, relative to the engine clock.
    pub fn trigger_time(&self, time_to_trigger: TimeToTrigger) -> DateTime<Utc> {
        trigger_time_at(self.core.clock().now(), time_to_trigger, &mut rand::thread_rng())
    }

    /// Store evaluated consequences in one transaction.
    ///
    /// Immediate ones are stored as triggered, produce a memory and apply
    /// their permanent effect right away; the rest join the session's
    /// pending cache.
    pub async fn persist(
        &self,
        context: &ActionContext,
        candidates: &[ConsequenceCandidate],
    ) -> EngineResult<Vec<Consequence>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = self.core.locks().acquire(&context.session_id).await;
        let mut session = self.core.load_active_session(&context.session_id).await?;
        let now = self.core.clock().now();

        let consequences: Vec<Consequence> = {
            let mut rng = rand::thread_rng();
            candidates
                .iter()
                .map(|candidate| {
                    let immediate = candidate.time_to_trigger == TimeToTrigger::Immediate;
                    let mut consequence = Consequence::new(
                        &session.id,
                        &candidate.description,
                        candidate.severity,
                        candidate.time_to_trigger,
                        trigger_time_at(now, candidate.time_to_trigger, &mut rng),
                    )
                    .with_permanent(candidate.is_permanent)
                    .with_source_action(&context.action_id)
                    .with_affected_entities(candidate.affected_entities.clone())
                    .with_metadata(json!({ "title": candidate.title() }));
                    consequence.created_at = now;
                    if immediate {
                        consequence.is_triggered = true;
                        consequence.triggered_at = Some(now);
                    }
                    consequence
                })
                .collect()
        };

        let mut character = if consequences.iter().any(|c| c.is_triggered && c.is_permanent) {
            self.core
                .storage()
                .get_character(&session.character_id)
                .await?
        } else {
            None
        };

        let mut memories = Vec::new();
        let mut effects = 0;
        let mut batch = StoreBatch::new();
        for (consequence, candidate) in consequences.iter().zip(candidates) {
            batch.insert_consequence(consequence.clone());
            if consequence.is_triggered {
                memories.push(consequence_memory(&session, consequence, candidate.title(), now));
                if consequence.is_permanent {
                    if let Some(character) = character.as_mut() {
                        apply_permanent_effect(consequence, character);
                        effects += 1;
                    }
                }
            } else {
                session.pending_consequences.push(PendingConsequence {
                    id: consequence.id.clone(),
                    title: candidate.title(),
                    trigger_time: consequence.trigger_time,
                    severity: consequence.severity,
                    description: truncate_chars(&consequence.description, PENDING_DESCRIPTION_CHARS),
                });
            }
        }
        evict_pending(&mut session.pending_consequences);

        session.significant_decisions += 1;
        session.updated_at = now;
        batch.upsert_session(session.clone());
        if let Some(mut character) = character.filter(|_| effects > 0) {
            character.updated_at = now;
            batch.upsert_character(character);
        }
        self.core.storage().apply(batch).await?;

        record_best_effort(self.core.memory(), &memories).await;

        info!(
            session_id = %session.id,
            action_id = %context.action_id,
            stored = consequences.len(),
            immediate = memories.len(),
            permanent_effects = effects,
            pending = session.pending_consequences.len(),
            "Consequences persisted"
        );

        Ok(consequences)
    }

    /// Fire every consequence that is due, one session group at a time.
    ///
    /// A failing group is logged and skipped; the others still run.
    pub async fn sweep(&self) -> EngineResult<SweepReport> {
        let start = Instant::now();
        let now = self.core.clock().now();
        let due = self.core.storage().get_due_consequences(now).await?;

        let session_ids: Vec<String> = due
            .iter()
            .map(|c| c.session_id.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut report = SweepReport::default();
        for session_id in session_ids {
            match self.sweep_session(&session_id, now).await {
                Ok(triggered) => {
                    report.sessions += 1;
                    report.triggered += triggered;
                }
                Err(e) => {
                    report.failed += 1;
                    error!(
                        session_id = %session_id,
                        error = %e,
                        "Sweep failed for session, continuing"
                    );
                }
            }
        }

        info!(
            sessions = report.sessions,
            triggered = report.triggered,
            failed = report.failed,
            latency_ms = start.elapsed().as_millis(),
            "Consequence sweep completed"
        );

        Ok(report)
    }

    /// Fire the due consequences of one session under its lock.
    async fn sweep_session(&self, session_id: &str, now: DateTime<Utc>) -> EngineResult<usize> {
        let _guard = self.core.locks().acquire(session_id).await;

        // Re-read under the lock so a concurrent sweep cannot fire twice.
        let due: Vec<Consequence> = self
            .core
            .storage()
            .get_untriggered_consequences(session_id)
            .await?
            .into_iter()
            .filter(|c| c.trigger_time <= now)
            .collect();
        if due.is_empty() {
            return Ok(0);
        }

        let session = self
            .core
            .storage()
            .get_session(session_id)
            .await?
            .filter(|s| s.active);

        let mut batch = StoreBatch::new();
        for consequence in &due {
            batch.mark_triggered(&consequence.id, now);
        }

        let Some(mut session) = session else {
            self.core.storage().apply(batch).await?;
            debug!(
                session_id = %session_id,
                triggered = due.len(),
                "Marked consequences of inactive session triggered"
            );
            return Ok(due.len());
        };

        let mut character = self
            .core
            .storage()
            .get_character(&session.character_id)
            .await?;
        if character.is_none() && due.iter().any(|c| c.is_permanent) {
            warn!(
                session_id = %session_id,
                character_id = %session.character_id,
                "Character missing, permanent effects skipped"
            );
        }

        let fired: HashSet<&str> = due.iter().map(|c| c.id.as_str()).collect();
        session
            .pending_consequences
            .retain(|p| !fired.contains(p.id.as_str()));

        let mut memories = Vec::new();
        let mut effects = Vec::new();
        for consequence in &due {
            let title = consequence
                .metadata
                .as_ref()
                .and_then(|m| m.get("title"))
                .and_then(|t| t.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| derive_title(&consequence.description));
            memories.push(consequence_memory(&session, consequence, title, now));

            if consequence.is_permanent {
                if let Some(character) = character.as_mut() {
                    effects.push(apply_permanent_effect(consequence, character));
                }
            }
        }

        session.updated_at = now;
        batch.upsert_session(session);
        if let Some(mut character) = character.filter(|_| !effects.is_empty()) {
            character.updated_at = now;
            batch.upsert_character(character);
        }
        self.core.storage().apply(batch).await?;

        record_best_effort(self.core.memory(), &memories).await;

        info!(
            session_id = %session_id,
            triggered = due.len(),
            permanent_effects = effects.len(),
            "Consequences triggered"
        );

        Ok(due.len())
    }

    /// Drop pending cache entries whose consequence is no longer untriggered.
    ///
    /// Returns the session's untriggered consequences.
    pub async fn reconcile(&self, session_id: &str) -> EngineResult<Vec<Consequence>> {
        let _guard = self.core.locks().acquire(session_id).await;
        let mut session = self.core.load_session(session_id).await?;
        let untriggered = self
            .core
            .storage()
            .get_untriggered_consequences(session_id)
            .await?;

        let live: HashSet<&str> = untriggered.iter().map(|c| c.id.as_str()).collect();
        let before = session.pending_consequences.len();
        session
            .pending_consequences
            .retain(|p| live.contains(p.id.as_str()));
        let dropped = before - session.pending_consequences.len();

        if dropped > 0 {
            session.updated_at = self.core.clock().now();
            let mut batch = StoreBatch::new();
            batch.upsert_session(session);
            self.core.storage().apply(batch).await?;
            warn!(
                session_id = %session_id,
                dropped,
                "Pending consequence cache drifted, reconciled"
            );
        }

        Ok(untriggered)
    }

    /// The session's pending cache after reconciliation.
    pub async fn pending_consequences(
        &self,
        session_id: &str,
    ) -> EngineResult<Vec<PendingConsequence>> {
        self.reconcile(session_id).await?;
        Ok(self.core.load_session(session_id).await?.pending_consequences)
    }

    async fn current_content(&self, session: &Session) -> EngineResult<String> {
        let Some(node_id) = session.current_node_id.as_deref() else {
            return Ok(String::new());
        };
        Ok(self
            .core
            .storage()
            .get_node(node_id)
            .await?
            .map(|node| node.content)
            .unwrap_or_default())
    }
}

fn consequence_memory(
    session: &Session,
    consequence: &Consequence,
    title: String,
    now: DateTime<Utc>,
) -> MemoryRecord {
    MemoryRecord::new(
        &session.id,
        &session.character_id,
        MemoryKind::Consequence,
        title,
        &consequence.description,
        consequence.severity.memory_importance(),
    )
    .with_created_at(now)
}
