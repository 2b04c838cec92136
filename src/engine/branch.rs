//! Story tree bookkeeping: node creation, path rows, rewind and branch restore.
//!
//! A path row records one taken step (the node reached and the choice that led
//! there). Rows sharing a `branch_id` form a branch; the rows with
//! `is_active = true` form the live timeline. Rewinding never deletes rows, it
//! relabels the abandoned continuation under a fresh archive id so it can be
//! restored later.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{extract_json_from_completion, preview, EngineCore};
use crate::error::{EngineError, EngineResult};
use crate::prompts::{CONTINUATION_PROMPT, OPENING_SCENE_PROMPT};
use crate::storage::{
    Character, Choice, ChoiceConsequences, Difficulty, Session, StoreBatch, StoryNode, StoryPath,
    MAIN_BRANCH_ID,
};

/// Choice text added when generated content offers no usable choice.
pub const CONTINUE_CHOICE_TEXT: &str = "Continue";

/// Fresh id for an archived branch.
pub(crate) fn archive_branch_id() -> String {
    format!("archive-{}", Uuid::new_v4())
}

// ============================================================================
// Generated content
// ============================================================================

/// A choice as produced by the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedChoice {
    pub text: String,
    #[serde(default)]
    pub next_prompt: Option<String>,
    #[serde(default)]
    pub consequences: ChoiceConsequences,
}

/// Story content for a node that does not exist yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedScene {
    pub content: String,
    pub choices: Vec<GeneratedChoice>,
}

#[derive(Deserialize)]
struct RawScene {
    #[serde(default)]
    content: String,
    #[serde(default)]
    choices: Vec<serde_json::Value>,
}

impl GeneratedScene {
    /// Create a scene from plain content
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            choices: Vec::new(),
        }
    }

    /// Add a choice
    pub fn with_choice(mut self, text: impl Into<String>) -> Self {
        self.choices.push(GeneratedChoice {
            text: text.into(),
            next_prompt: None,
            consequences: ChoiceConsequences::default(),
        });
        self
    }

    /// Parse generator output. Malformed choices are dropped one by one;
    /// text that is not JSON becomes the content itself.
    pub fn from_completion(completion: &str) -> Option<Self> {
        let trimmed = completion.trim();
        if trimmed.is_empty() {
            return None;
        }

        let parsed = extract_json_from_completion(trimmed)
            .ok()
            .and_then(|json| serde_json::from_str::<RawScene>(json).ok());

        let scene = match parsed {
            Some(raw) if !raw.content.trim().is_empty() => {
                let total = raw.choices.len();
                let choices: Vec<GeneratedChoice> = raw
                    .choices
                    .into_iter()
                    .filter_map(|value| serde_json::from_value::<GeneratedChoice>(value).ok())
                    .filter(|choice| !choice.text.trim().is_empty())
                    .collect();
                if choices.len() < total {
                    debug!(
                        dropped = total - choices.len(),
                        "Dropped malformed generated choices"
                    );
                }
                Self {
                    content: raw.content.trim().to_string(),
                    choices,
                }
            }
            _ => {
                warn!(
                    completion_preview = %preview(trimmed, 200),
                    "Generated scene is not structured, using text as content"
                );
                Self::new(trimmed)
            }
        };

        Some(scene.ensure_choice())
    }

    /// Templated scene used when generation fails entirely.
    pub fn fallback(choice_text: Option<&str>) -> Self {
        let content = match choice_text {
            Some(text) => format!(
                "You decide to {}. The world shifts around you as the consequences of that choice begin to unfold.",
                text.trim().trim_end_matches('.').to_lowercase()
            ),
            None => "Your adventure begins at a crossroads, the road ahead uncertain.".to_string(),
        };
        Self::new(content).ensure_choice()
    }

    fn ensure_choice(mut self) -> Self {
        if self.choices.is_empty() {
            self = self.with_choice(CONTINUE_CHOICE_TEXT);
        }
        self
    }

    /// Attach this scene's choices to `node`.
    fn apply_to(self, mut node: StoryNode) -> StoryNode {
        let scene = self.ensure_choice();
        node.content = scene.content;
        node.choices = scene
            .choices
            .into_iter()
            .enumerate()
            .map(|(order, generated)| {
                let mut choice = Choice::new(&node.id, generated.text.trim(), order as u32)
                    .with_consequences(generated.consequences);
                choice.next_prompt = generated.next_prompt;
                choice
            })
            .collect();
        node
    }
}

// ============================================================================
// Query results
// ============================================================================

/// Options for a new session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub difficulty: Difficulty,
    pub permadeath_enabled: bool,
}

impl SessionOptions {
    pub fn new(difficulty: Difficulty) -> Self {
        Self {
            difficulty,
            permadeath_enabled: false,
        }
    }

    /// Enable or disable permadeath
    pub fn with_permadeath(mut self, enabled: bool) -> Self {
        self.permadeath_enabled = enabled;
        self
    }
}

/// One node of the story tree view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: String,
    pub parent_node_id: Option<String>,
    pub depth: u32,
    pub content: String,
    pub selected_choice_id: Option<String>,
    pub is_visited: bool,
    /// Reached by an active path row, or the root.
    pub on_current_path: bool,
    /// Child node ids in creation order.
    pub children: Vec<String>,
}

/// Adjacency view over every node of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryTree {
    pub session_id: String,
    pub root_id: Option<String>,
    pub current_node_id: Option<String>,
    pub nodes: Vec<TreeNode>,
}

impl StoryTree {
    pub fn node(&self, id: &str) -> Option<&TreeNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// All path rows sharing a branch id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub branch_id: String,
    pub is_active: bool,
    /// Rows ordered by step order.
    pub paths: Vec<StoryPath>,
}

/// Live branch plus archived ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchListing {
    pub active: Option<Branch>,
    pub archived: Vec<Branch>,
}

// ============================================================================
// Branch manager
// ============================================================================

/// Owns the story tree and path history of sessions.
#[derive(Clone)]
pub struct BranchManager {
    core: EngineCore,
}

impl BranchManager {
    pub fn new(core: EngineCore) -> Self {
        Self { core }
    }

    /// Persist a new character.
    pub async fn create_character(&self, mut character: Character) -> EngineResult<Character> {
        if character.name.trim().is_empty() {
            return Err(EngineError::Validation {
                field: "name".to_string(),
                reason: "cannot be empty".to_string(),
            });
        }

        let now = self.core.clock().now();
        character.created_at = now;
        character.updated_at = now;

        let mut batch = StoreBatch::new();
        batch.upsert_character(character.clone());
        self.core.storage().apply(batch).await?;

        info!(character_id = %character.id, name = %character.name, "Character created");
        Ok(character)
    }

    /// Start a session for an existing, living character and generate its root node.
    pub async fn start_session(
        &self,
        character_id: &str,
        options: SessionOptions,
    ) -> EngineResult<Session> {
        let start = Instant::now();
        let character = self.core.load_character(character_id).await?;
        if !character.is_alive {
            return Err(EngineError::invalid_state(format!(
                "Character {} is dead",
                character.id
            )));
        }

        let prompt = format!(
            "{}\n\nCharacter: {} (level {})\nDifficulty: {}",
            OPENING_SCENE_PROMPT, character.name, character.level, options.difficulty
        );
        let scene = self.generate_scene(&prompt, None).await;

        let now = self.core.clock().now();
        let mut session = Session::new(&character.id)
            .with_difficulty(options.difficulty)
            .with_permadeath(options.permadeath_enabled);
        session.created_at = now;
        session.updated_at = now;

        let mut root = StoryNode::root(&session.id, "");
        root.created_at = now;
        let root = scene.apply_to(root);
        session.current_node_id = Some(root.id.clone());

        let mut batch = StoreBatch::new();
        batch.upsert_session(session.clone()).insert_node(root.clone());
        self.core.storage().apply(batch).await?;

        info!(
            session_id = %session.id,
            character_id = %character.id,
            root_node_id = %root.id,
            difficulty = %session.difficulty,
            permadeath = session.permadeath_enabled,
            latency_ms = start.elapsed().as_millis(),
            "Session started"
        );

        Ok(session)
    }

    /// End an active session without a death.
    pub async fn end_session(&self, session_id: &str, reason: &str) -> EngineResult<Session> {
        let _guard = self.core.locks().acquire(session_id).await;
        let mut session = self.core.load_active_session(session_id).await?;

        let now = self.core.clock().now();
        session.active = false;
        session.ended_at = Some(now);
        session.updated_at = now;

        let mut batch = StoreBatch::new();
        batch.upsert_session(session.clone());
        self.core.storage().apply(batch).await?;

        info!(session_id = %session_id, reason = %reason, "Session ended");
        Ok(session)
    }

    /// Return the child of `parent` reached through `choice`, creating it from
    /// `scene` only when no such child exists yet.
    pub async fn create_or_reuse_node(
        &self,
        session: &Session,
        parent: &StoryNode,
        choice: &Choice,
        scene: GeneratedScene,
    ) -> EngineResult<StoryNode> {
        if !session.active {
            return Err(EngineError::invalid_state(format!(
                "Session {} is no longer active",
                session.id
            )));
        }
        if parent.session_id != session.id {
            return Err(EngineError::not_found("StoryNode", &parent.id));
        }
        if parent.choice(&choice.id).is_none() {
            return Err(EngineError::invalid_state(format!(
                "Choice {} does not belong to node {}",
                choice.id, parent.id
            )));
        }

        let _guard = self.core.locks().acquire(&session.id).await;
        let (node, created) = self.resolve_child(parent, choice, scene).await?;
        if created {
            let mut batch = StoreBatch::new();
            batch.insert_node(node.clone());
            self.core.storage().apply(batch).await?;
            debug!(session_id = %session.id, node_id = %node.id, "Story node created");
        }
        Ok(node)
    }

    /// Take `choice_id` from the session's current node and move to the
    /// resulting node, reusing it if that choice was taken before.
    pub async fn advance(&self, session_id: &str, choice_id: &str) -> EngineResult<StoryNode> {
        let start = Instant::now();

        // Generation happens before the lock; the result is discarded if the
        // child turns out to exist by the time the lock is held.
        let session = self.core.load_active_session(session_id).await?;
        let (current, choice) = self.current_choice(&session, choice_id).await?;
        let scene = match self.core.storage().get_child_node(&current.id, &choice.id).await? {
            Some(_) => None,
            None => Some(self.generate_continuation(&current, &choice).await),
        };

        let _guard = self.core.locks().acquire(session_id).await;
        let mut session = self.core.load_active_session(session_id).await?;
        let (mut current, choice) = self.current_choice(&session, choice_id).await?;

        let scene = scene.unwrap_or_else(|| GeneratedScene::fallback(Some(&choice.text)));
        let (target, created) = self.resolve_child(&current, &choice, scene).await?;

        let active = self.core.storage().get_active_paths(session_id).await?;
        let latest = active
            .iter()
            .max_by(|a, b| a.step_order.cmp(&b.step_order).then_with(|| b.id.cmp(&a.id)));
        let (step_order, branch_id, parent_path_id) = match latest {
            Some(path) => (
                path.step_order + 1,
                path.branch_id.clone(),
                Some(path.id.clone()),
            ),
            None => (0, MAIN_BRANCH_ID.to_string(), None),
        };

        let now = self.core.clock().now();
        let mut path = StoryPath::new(session_id, &target.id, &choice.id, step_order, branch_id);
        path.parent_path_id = parent_path_id;
        path.created_at = now;

        current.is_visited = true;
        current.selected_choice_id = Some(choice.id.clone());
        current.selected_choice_text = Some(choice.text.clone());

        session.current_node_id = Some(target.id.clone());
        session.updated_at = now;

        let mut batch = StoreBatch::new();
        batch.update_node(current.clone());
        if created {
            batch.insert_node(target.clone());
        }
        batch.upsert_path(path.clone()).upsert_session(session);
        self.core.storage().apply(batch).await?;

        info!(
            session_id = %session_id,
            from_node_id = %current.id,
            to_node_id = %target.id,
            branch_id = %path.branch_id,
            step_order = path.step_order,
            reused = !created,
            latency_ms = start.elapsed().as_millis(),
            "Advanced story"
        );

        Ok(target)
    }

    /// Go back to an earlier node on the live timeline, archiving everything
    /// after it as a restorable branch.
    pub async fn rewind(&self, session_id: &str, target_node_id: &str) -> EngineResult<Session> {
        let _guard = self.core.locks().acquire(session_id).await;
        let mut session = self.core.load_active_session(session_id).await?;

        let target = self
            .core
            .storage()
            .get_node(target_node_id)
            .await?
            .filter(|node| node.session_id == session.id)
            .ok_or_else(|| EngineError::not_found("StoryNode", target_node_id))?;

        let active = self.core.storage().get_active_paths(session_id).await?;
        let archived: Vec<StoryPath> = if target.is_root() {
            active
        } else {
            let anchor_step = active
                .iter()
                .find(|path| path.node_id == target.id)
                .map(|path| path.step_order)
                .ok_or_else(|| EngineError::not_found("StoryPath", target_node_id))?;
            active
                .into_iter()
                .filter(|path| path.step_order > anchor_step)
                .collect()
        };

        let archive_id = archive_branch_id();
        let now = self.core.clock().now();
        let mut batch = StoreBatch::new();
        for mut path in archived.iter().cloned() {
            path.is_active = false;
            path.branch_id = archive_id.clone();
            batch.upsert_path(path);
        }

        session.current_node_id = Some(target.id.clone());
        session.updated_at = now;
        batch.upsert_session(session.clone());
        self.core.storage().apply(batch).await?;

        info!(
            session_id = %session_id,
            target_node_id = %target_node_id,
            archived_rows = archived.len(),
            archive_branch_id = %archive_id,
            "Rewound story"
        );

        Ok(session)
    }

    /// Make an archived branch the live timeline again.
    pub async fn restore_branch(&self, session_id: &str, branch_id: &str) -> EngineResult<Session> {
        let _guard = self.core.locks().acquire(session_id).await;
        let mut session = self.core.load_active_session(session_id).await?;

        let branch_rows = self
            .core
            .storage()
            .get_branch_paths(session_id, branch_id)
            .await?;
        if branch_rows.is_empty() {
            return Err(EngineError::not_found("Branch", branch_id));
        }
        if branch_rows.iter().all(|path| path.is_active) {
            debug!(session_id = %session_id, branch_id = %branch_id, "Branch already live");
            return Ok(session);
        }

        let max_step = branch_rows
            .iter()
            .map(|path| path.step_order)
            .max()
            .unwrap_or_default();
        let mut tips: Vec<&StoryPath> = branch_rows
            .iter()
            .filter(|path| path.step_order == max_step)
            .collect();
        tips.sort_by(|a, b| a.id.cmp(&b.id));
        if tips.len() > 1 {
            warn!(
                session_id = %session_id,
                branch_id = %branch_id,
                step_order = max_step,
                candidates = tips.len(),
                "Branch has several rows at its last step, selecting lowest path id"
            );
        }
        let tip_node_id = tips[0].node_id.clone();

        let active = self.core.storage().get_active_paths(session_id).await?;
        let archive_id = archive_branch_id();
        let mut batch = StoreBatch::new();
        for mut path in active.into_iter().filter(|p| p.branch_id != branch_id) {
            path.is_active = false;
            path.branch_id = archive_id.clone();
            batch.upsert_path(path);
        }
        let displaced = batch.len();
        for mut path in branch_rows.into_iter().filter(|p| !p.is_active) {
            path.is_active = true;
            batch.upsert_path(path);
        }

        session.current_node_id = Some(tip_node_id.clone());
        session.updated_at = self.core.clock().now();
        batch.upsert_session(session.clone());
        self.core.storage().apply(batch).await?;

        info!(
            session_id = %session_id,
            branch_id = %branch_id,
            current_node_id = %tip_node_id,
            displaced_rows = displaced,
            archive_branch_id = %archive_id,
            "Restored branch"
        );

        Ok(session)
    }

    /// Active path rows ordered by step order.
    pub async fn current_path(&self, session_id: &str) -> EngineResult<Vec<StoryPath>> {
        self.core.load_session(session_id).await?;
        Ok(self.core.storage().get_active_paths(session_id).await?)
    }

    /// Parent to children view of every node, with the live timeline tagged.
    ///
    /// A node is tagged when an active path row reached it. Path rows record
    /// the node a choice led to, so no row ever names the root; the tree view
    /// extends the rule and always tags the root as the start of every
    /// timeline, including one with no steps yet.
    pub async fn story_tree(&self, session_id: &str) -> EngineResult<StoryTree> {
        let session = self.core.load_session(session_id).await?;
        let nodes = self.core.storage().get_session_nodes(session_id).await?;
        let active = self.core.storage().get_active_paths(session_id).await?;

        let on_path: std::collections::HashSet<&str> =
            active.iter().map(|path| path.node_id.as_str()).collect();

        let mut children: HashMap<&str, Vec<String>> = HashMap::new();
        for node in &nodes {
            if let Some(parent) = node.parent_node_id.as_deref() {
                children.entry(parent).or_default().push(node.id.clone());
            }
        }

        let root_id = nodes.iter().find(|n| n.is_root()).map(|n| n.id.clone());
        let tree_nodes = nodes
            .iter()
            .map(|node| TreeNode {
                id: node.id.clone(),
                parent_node_id: node.parent_node_id.clone(),
                depth: node.depth,
                content: node.content.clone(),
                selected_choice_id: node.selected_choice_id.clone(),
                is_visited: node.is_visited,
                on_current_path: node.is_root() || on_path.contains(node.id.as_str()),
                children: children.remove(node.id.as_str()).unwrap_or_default(),
            })
            .collect();

        Ok(StoryTree {
            session_id: session.id,
            root_id,
            current_node_id: session.current_node_id,
            nodes: tree_nodes,
        })
    }

    /// Node ids referenced by more than one path row, on any branch.
    pub async fn branch_points(&self, session_id: &str) -> EngineResult<Vec<String>> {
        self.core.load_session(session_id).await?;
        let paths = self.core.storage().get_session_paths(session_id).await?;

        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for path in &paths {
            *counts.entry(path.node_id.as_str()).or_default() += 1;
        }

        Ok(counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(node_id, _)| node_id.to_string())
            .collect())
    }

    /// Path rows grouped by branch, live branch first.
    pub async fn all_branches(&self, session_id: &str) -> EngineResult<BranchListing> {
        self.core.load_session(session_id).await?;
        let paths = self.core.storage().get_session_paths(session_id).await?;

        let mut groups: BTreeMap<String, Vec<StoryPath>> = BTreeMap::new();
        for path in paths {
            groups.entry(path.branch_id.clone()).or_default().push(path);
        }

        let mut active = None;
        let mut archived = Vec::new();
        for (branch_id, paths) in groups {
            let is_active = paths.iter().any(|path| path.is_active);
            let branch = Branch {
                branch_id,
                is_active,
                paths,
            };
            if is_active {
                if active.is_some() {
                    warn!(
                        session_id = %session_id,
                        branch_id = %branch.branch_id,
                        "More than one live branch found"
                    );
                    archived.push(branch);
                } else {
                    active = Some(branch);
                }
            } else {
                archived.push(branch);
            }
        }

        Ok(BranchListing { active, archived })
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// The session's current node and one of its choices.
    async fn current_choice(
        &self,
        session: &Session,
        choice_id: &str,
    ) -> EngineResult<(StoryNode, Choice)> {
        let current_id = session
            .current_node_id
            .as_deref()
            .ok_or_else(|| EngineError::invalid_state("Session has no current node"))?;
        let current = self
            .core
            .storage()
            .get_node(current_id)
            .await?
            .ok_or_else(|| EngineError::not_found("StoryNode", current_id))?;
        let choice = current.choice(choice_id).cloned().ok_or_else(|| {
            EngineError::invalid_state(format!(
                "Choice {} does not belong to current node {}",
                choice_id, current.id
            ))
        })?;
        Ok((current, choice))
    }

    /// Existing child for (parent, choice), or a new unsaved node built from `scene`.
    async fn resolve_child(
        &self,
        parent: &StoryNode,
        choice: &Choice,
        scene: GeneratedScene,
    ) -> EngineResult<(StoryNode, bool)> {
        if let Some(existing) = self
            .core
            .storage()
            .get_child_node(&parent.id, &choice.id)
            .await?
        {
            return Ok((existing, false));
        }

        let mut node = StoryNode::child(parent, choice, "");
        node.created_at = self.core.clock().now();
        Ok((scene.apply_to(node), true))
    }

    async fn generate_continuation(&self, current: &StoryNode, choice: &Choice) -> GeneratedScene {
        let mut prompt = format!(
            "{}\n\nPrevious scene:\n{}\n\nPlayer choice: {}",
            CONTINUATION_PROMPT, current.content, choice.text
        );
        if let Some(hint) = choice.next_prompt.as_deref() {
            prompt.push_str(&format!("\nDirection: {}", hint));
        }
        self.generate_scene(&prompt, Some(&choice.text)).await
    }

    async fn generate_scene(&self, prompt: &str, choice_text: Option<&str>) -> GeneratedScene {
        match self.core.generator().generate(prompt).await {
            Ok(completion) => GeneratedScene::from_completion(&completion).unwrap_or_else(|| {
                warn!("Generator returned empty scene, using fallback");
                GeneratedScene::fallback(choice_text)
            }),
            Err(e) => {
                warn!(error = %e, "Scene generation failed, using fallback");
                GeneratedScene::fallback(choice_text)
            }
        }
    }
}
