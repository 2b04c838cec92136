use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{
    ActionContext, BranchManager, ConsequenceScheduler, EngineCore, LethalOutcome,
    PermadeathEvaluator,
};
use crate::config::PermadeathConfig;
use crate::error::{EngineError, EngineResult};
use crate::storage::{Consequence, StoryNode};

/// Everything that happened during one player turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutcome {
    /// Node the player arrived at.
    pub node: StoryNode,
    pub consequences: Vec<Consequence>,
    pub danger_level: u8,
    /// Present when the lethal check ran.
    pub lethal: Option<LethalOutcome>,
}

impl TurnOutcome {
    pub fn died(&self) -> bool {
        self.lethal.as_ref().is_some_and(|l| l.died)
    }
}

/// Runs a full player turn across branch, consequence and permadeath engines.
#[derive(Clone)]
pub struct NarrativeEngine {
    core: EngineCore,
    branches: BranchManager,
    consequences: ConsequenceScheduler,
    permadeath: PermadeathEvaluator,
    lethal_check_min_danger: u8,
}

impl NarrativeEngine {
    pub fn new(core: EngineCore, config: &PermadeathConfig) -> Self {
        Self {
            branches: BranchManager::new(core.clone()),
            consequences: ConsequenceScheduler::new(core.clone()),
            permadeath: PermadeathEvaluator::new(core.clone()),
            core,
            lethal_check_min_danger: config.lethal_check_min_danger,
        }
    }

    pub fn branches(&self) -> &BranchManager {
        &self.branches
    }

    pub fn consequences(&self) -> &ConsequenceScheduler {
        &self.consequences
    }

    pub fn permadeath(&self) -> &PermadeathEvaluator {
        &self.permadeath
    }

    /// Take a choice: advance the story, schedule the action's consequences,
    /// reassess danger and, when dangerous enough, judge whether it was fatal.
    pub async fn take_choice(&self, session_id: &str, choice_id: &str) -> EngineResult<TurnOutcome> {
        let start = Instant::now();
        let session = self.core.load_active_session(session_id).await?;
        let choice = self
            .core
            .storage()
            .get_choice(choice_id)
            .await?
            .filter(|c| session.current_node_id.as_deref() == Some(c.node_id.as_str()))
            .ok_or_else(|| {
                EngineError::invalid_state(format!(
                    "Choice {} does not belong to the current node",
                    choice_id
                ))
            })?;

        let node = self.branches.advance(session_id, choice_id).await?;

        let context = ActionContext::new(session_id)
            .with_action_id(&choice.id)
            .with_situation(&node.content);
        let candidates = self.consequences.evaluate(&choice.text, &context).await?;
        let consequences = self.consequences.persist(&context, &candidates).await?;

        let danger_level = self.permadeath.danger_level(session_id).await?;
        let lethal = if session.permadeath_enabled && danger_level >= self.lethal_check_min_danger
        {
            Some(
                self.permadeath
                    .evaluate_lethal_situation(session_id, &choice.text, danger_level)
                    .await?,
            )
        } else {
            None
        };

        let outcome = TurnOutcome {
            node,
            consequences,
            danger_level,
            lethal,
        };

        info!(
            session_id = %session_id,
            node_id = %outcome.node.id,
            consequences = outcome.consequences.len(),
            danger_level,
            died = outcome.died(),
            latency_ms = start.elapsed().as_millis(),
            "Turn completed"
        );

        Ok(outcome)
    }
}
