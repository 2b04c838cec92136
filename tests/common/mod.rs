//! Shared fixtures for engine integration tests: a scripted generator, a
//! manually driven clock and an in-memory engine harness.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use narrative_branch_engine::clock::Clock;
use narrative_branch_engine::config::PermadeathConfig;
use narrative_branch_engine::engine::{EngineCore, NarrativeEngine, SessionOptions};
use narrative_branch_engine::error::{GeneratorError, GeneratorResult, StorageError, StorageResult};
use narrative_branch_engine::generator::NarrativeGenerator;
use narrative_branch_engine::memory::MemoryRecord;
use narrative_branch_engine::prompts::{
    CONSEQUENCE_EVALUATION_PROMPT, CONTINUATION_PROMPT, DANGER_LEVEL_PROMPT, EPITAPH_PROMPT,
    LETHAL_SITUATION_PROMPT, OPENING_SCENE_PROMPT,
};
use narrative_branch_engine::storage::{
    Character, CharacterDeath, Choice, Consequence, Session, SqliteStorage, Storage, StoreBatch,
    StoreOp, StoryNode, StoryPath,
};

/// Which engine request a prompt belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    Opening,
    Continuation,
    Consequences,
    Danger,
    Lethal,
    Epitaph,
    Unknown,
}

impl PromptKind {
    pub fn of(prompt: &str) -> Self {
        if prompt.starts_with(OPENING_SCENE_PROMPT) {
            PromptKind::Opening
        } else if prompt.starts_with(CONTINUATION_PROMPT) {
            PromptKind::Continuation
        } else if prompt.starts_with(CONSEQUENCE_EVALUATION_PROMPT) {
            PromptKind::Consequences
        } else if prompt.starts_with(DANGER_LEVEL_PROMPT) {
            PromptKind::Danger
        } else if prompt.starts_with(LETHAL_SITUATION_PROMPT) {
            PromptKind::Lethal
        } else if prompt.starts_with(EPITAPH_PROMPT) {
            PromptKind::Epitaph
        } else {
            PromptKind::Unknown
        }
    }
}

/// Generator double answering each prompt kind with a configurable response.
pub struct ScriptedGenerator {
    responses: Mutex<HashMap<PromptKind, String>>,
    failing: Mutex<HashSet<PromptKind>>,
    calls: Mutex<Vec<PromptKind>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        let mut responses = HashMap::new();
        responses.insert(
            PromptKind::Opening,
            json!({
                "content": "You wake at the edge of a misty forest.",
                "choices": [
                    {"text": "Enter the forest", "nextPrompt": "the trees close in"},
                    {"text": "Follow the river"}
                ]
            })
            .to_string(),
        );
        responses.insert(
            PromptKind::Continuation,
            json!({
                "content": "The path twists onward.",
                "choices": [
                    {"text": "Press on"},
                    {"text": "Make camp"}
                ]
            })
            .to_string(),
        );
        responses.insert(
            PromptKind::Consequences,
            json!([{
                "description": "Rumours of your passage spread.",
                "timeToTrigger": "short",
                "severity": "minor",
                "isPermanent": false,
                "affectedEntities": ["village"]
            }])
            .to_string(),
        );
        responses.insert(PromptKind::Danger, "2".to_string());
        responses.insert(
            PromptKind::Lethal,
            json!({"shouldDie": false, "deathProbability": 0.0, "reasoning": "safe"}).to_string(),
        );
        responses.insert(PromptKind::Epitaph, "They walked bravely.".to_string());

        Self {
            responses: Mutex::new(responses),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Replace the response for a prompt kind.
    pub fn respond(&self, kind: PromptKind, response: impl Into<String>) {
        self.failing.lock().unwrap().remove(&kind);
        self.responses.lock().unwrap().insert(kind, response.into());
    }

    /// Make a prompt kind fail with a generator error.
    pub fn fail(&self, kind: PromptKind) {
        self.failing.lock().unwrap().insert(kind);
    }

    pub fn calls(&self, kind: PromptKind) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|k| **k == kind)
            .count()
    }
}

#[async_trait]
impl NarrativeGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> GeneratorResult<String> {
        let kind = PromptKind::of(prompt);
        self.calls.lock().unwrap().push(kind);

        if self.failing.lock().unwrap().contains(&kind) {
            return Err(GeneratorError::Timeout { timeout_ms: 10 });
        }

        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or_default())
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
}

/// Storage delegate whose writes fail for chosen sessions.
pub struct FlakyStorage {
    inner: Arc<SqliteStorage>,
    failing: Mutex<HashSet<String>>,
}

impl FlakyStorage {
    pub fn new(inner: Arc<SqliteStorage>) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Reject every batch that touches the session.
    pub fn fail_session(&self, session_id: &str) {
        self.failing.lock().unwrap().insert(session_id.to_string());
    }

    fn touches_failing_session(&self, batch: &StoreBatch) -> bool {
        let failing = self.failing.lock().unwrap();
        batch.ops().iter().any(|op| {
            let session_id = match op {
                StoreOp::UpsertSession(session) => &session.id,
                StoreOp::InsertConsequence(consequence) => &consequence.session_id,
                StoreOp::InsertDeath(death) => &death.session_id,
                _ => return false,
            };
            failing.contains(session_id)
        })
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn apply(&self, batch: StoreBatch) -> StorageResult<()> {
        if self.touches_failing_session(&batch) {
            return Err(StorageError::Query {
                message: "disk I/O error".to_string(),
            });
        }
        self.inner.apply(batch).await
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>> {
        self.inner.get_session(id).await
    }

    async fn get_character(&self, id: &str) -> StorageResult<Option<Character>> {
        self.inner.get_character(id).await
    }

    async fn get_node(&self, id: &str) -> StorageResult<Option<StoryNode>> {
        self.inner.get_node(id).await
    }

    async fn get_child_node(
        &self,
        parent_node_id: &str,
        choice_id: &str,
    ) -> StorageResult<Option<StoryNode>> {
        self.inner.get_child_node(parent_node_id, choice_id).await
    }

    async fn get_session_nodes(&self, session_id: &str) -> StorageResult<Vec<StoryNode>> {
        self.inner.get_session_nodes(session_id).await
    }

    async fn get_choice(&self, id: &str) -> StorageResult<Option<Choice>> {
        self.inner.get_choice(id).await
    }

    async fn get_session_paths(&self, session_id: &str) -> StorageResult<Vec<StoryPath>> {
        self.inner.get_session_paths(session_id).await
    }

    async fn get_active_paths(&self, session_id: &str) -> StorageResult<Vec<StoryPath>> {
        self.inner.get_active_paths(session_id).await
    }

    async fn get_branch_paths(
        &self,
        session_id: &str,
        branch_id: &str,
    ) -> StorageResult<Vec<StoryPath>> {
        self.inner.get_branch_paths(session_id, branch_id).await
    }

    async fn get_consequence(&self, id: &str) -> StorageResult<Option<Consequence>> {
        self.inner.get_consequence(id).await
    }

    async fn get_session_consequences(&self, session_id: &str) -> StorageResult<Vec<Consequence>> {
        self.inner.get_session_consequences(session_id).await
    }

    async fn get_untriggered_consequences(
        &self,
        session_id: &str,
    ) -> StorageResult<Vec<Consequence>> {
        self.inner.get_untriggered_consequences(session_id).await
    }

    async fn get_due_consequences(&self, now: DateTime<Utc>) -> StorageResult<Vec<Consequence>> {
        self.inner.get_due_consequences(now).await
    }

    async fn get_character_death(
        &self,
        session_id: &str,
    ) -> StorageResult<Option<CharacterDeath>> {
        self.inner.get_character_death(session_id).await
    }

    async fn get_session_memories(&self, session_id: &str) -> StorageResult<Vec<MemoryRecord>> {
        self.inner.get_session_memories(session_id).await
    }
}

/// In-memory engine with scripted collaborators.
///
/// The engine writes through `flaky`; `storage` reads and writes the same
/// database directly.
pub struct Harness {
    pub storage: Arc<SqliteStorage>,
    pub flaky: Arc<FlakyStorage>,
    pub generator: Arc<ScriptedGenerator>,
    pub clock: Arc<ManualClock>,
    pub core: EngineCore,
    pub engine: NarrativeEngine,
}

impl Harness {
    pub async fn new() -> Self {
        let storage = Arc::new(
            SqliteStorage::new_in_memory()
                .await
                .expect("Failed to create in-memory storage"),
        );
        let generator = Arc::new(ScriptedGenerator::new());
        let clock = Arc::new(ManualClock::new(start_time()));

        let flaky = Arc::new(FlakyStorage::new(storage.clone()));

        let core = EngineCore::new(flaky.clone(), generator.clone(), storage.clone())
            .with_clock(clock.clone());
        let engine = NarrativeEngine::new(
            core.clone(),
            &PermadeathConfig {
                lethal_check_min_danger: 6,
            },
        );

        Self {
            storage,
            flaky,
            generator,
            clock,
            core,
            engine,
        }
    }

    /// Create a character and start a session for it.
    pub async fn start(&self, character: Character, options: SessionOptions) -> (Character, Session) {
        let character = self
            .engine
            .branches()
            .create_character(character)
            .await
            .expect("create character");
        let session = self
            .engine
            .branches()
            .start_session(&character.id, options)
            .await
            .expect("start session");
        (character, session)
    }

    pub async fn session(&self, id: &str) -> Session {
        self.storage.get_session(id).await.unwrap().expect("session exists")
    }

    pub async fn character(&self, id: &str) -> Character {
        self.storage
            .get_character(id)
            .await
            .unwrap()
            .expect("character exists")
    }

    /// Id of the choice at `index` on the session's current node.
    pub async fn choice_id(&self, session_id: &str, index: usize) -> String {
        let session = self.session(session_id).await;
        let node = self
            .storage
            .get_node(session.current_node_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        node.choices[index].id.clone()
    }

    /// Current node id of a session.
    pub async fn current_node(&self, session_id: &str) -> String {
        self.session(session_id).await.current_node_id.unwrap()
    }
}
