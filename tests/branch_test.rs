//! Integration tests for story tree bookkeeping, rewind and branch restore.

mod common;

use std::collections::HashSet;

use chrono::Duration;
use pretty_assertions::assert_eq;

use common::{Harness, PromptKind};
use narrative_branch_engine::engine::{GeneratedScene, SessionOptions, CONTINUE_CHOICE_TEXT};
use narrative_branch_engine::error::EngineError;
use narrative_branch_engine::storage::{Character, Storage, StoryPath, MAIN_BRANCH_ID};

async fn active_branch_ids(h: &Harness, session_id: &str) -> HashSet<String> {
    h.storage
        .get_active_paths(session_id)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.branch_id)
        .collect()
}

fn assert_contiguous(paths: &[StoryPath]) {
    for pair in paths.windows(2) {
        assert_eq!(pair[1].step_order, pair[0].step_order + 1, "gap in live timeline");
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_start_session_creates_root() {
        let h = Harness::new().await;
        let (character, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;

        assert!(session.active);
        assert_eq!(session.character_id, character.id);

        let root = h
            .storage
            .get_node(session.current_node_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(root.is_root());
        assert_eq!(root.depth, 0);
        assert_eq!(root.content, "You wake at the edge of a misty forest.");
        assert_eq!(root.choices.len(), 2);
        assert_eq!(root.choices[0].next_prompt.as_deref(), Some("the trees close in"));
    }

    #[tokio::test]
    async fn test_start_session_falls_back_when_generator_fails() {
        let h = Harness::new().await;
        h.generator.fail(PromptKind::Opening);
        let (_, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;

        let root = h
            .storage
            .get_node(session.current_node_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(!root.content.is_empty());
        assert_eq!(root.choices.len(), 1);
        assert_eq!(root.choices[0].text, CONTINUE_CHOICE_TEXT);
    }

    #[tokio::test]
    async fn test_start_session_unknown_character() {
        let h = Harness::new().await;
        let err = h
            .engine
            .branches()
            .start_session("ghost", SessionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { entity: "Character", .. }));
    }

    #[tokio::test]
    async fn test_end_session_is_terminal() {
        let h = Harness::new().await;
        let (_, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;

        let ended = h.engine.branches().end_session(&session.id, "player quit").await.unwrap();
        assert!(!ended.active);
        assert!(ended.ended_at.is_some());

        let err = h
            .engine
            .branches()
            .end_session(&session.id, "again")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));

        let choice = h.choice_id(&session.id, 0).await;
        let err = h.engine.branches().advance(&session.id, &choice).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
    }
}

#[cfg(test)]
mod advance_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_advance_records_path_and_marks_node() {
        let h = Harness::new().await;
        let (_, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;
        let root_id = h.current_node(&session.id).await;
        let choice = h.choice_id(&session.id, 0).await;

        let node = h.engine.branches().advance(&session.id, &choice).await.unwrap();

        assert_eq!(node.depth, 1);
        assert_eq!(node.parent_node_id.as_deref(), Some(root_id.as_str()));
        assert_eq!(node.choice_id_from_parent.as_deref(), Some(choice.as_str()));
        assert_eq!(h.current_node(&session.id).await, node.id);

        let root = h.storage.get_node(&root_id).await.unwrap().unwrap();
        assert!(root.is_visited);
        assert_eq!(root.selected_choice_id.as_deref(), Some(choice.as_str()));
        assert_eq!(root.selected_choice_text.as_deref(), Some("Enter the forest"));

        let paths = h.engine.branches().current_path(&session.id).await.unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].node_id, node.id);
        assert_eq!(paths[0].choice_id, choice);
        assert_eq!(paths[0].step_order, 0);
        assert_eq!(paths[0].branch_id, MAIN_BRANCH_ID);
        assert!(paths[0].parent_path_id.is_none());
    }

    #[tokio::test]
    async fn test_advance_chains_parent_paths() {
        let h = Harness::new().await;
        let (_, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;

        for _ in 0..3 {
            let choice = h.choice_id(&session.id, 0).await;
            h.engine.branches().advance(&session.id, &choice).await.unwrap();
        }

        let paths = h.engine.branches().current_path(&session.id).await.unwrap();
        assert_eq!(paths.len(), 3);
        assert_contiguous(&paths);
        assert_eq!(paths[1].parent_path_id.as_deref(), Some(paths[0].id.as_str()));
        assert_eq!(paths[2].parent_path_id.as_deref(), Some(paths[1].id.as_str()));
        assert!(paths.iter().all(|p| p.branch_id == MAIN_BRANCH_ID));
    }

    #[tokio::test]
    async fn test_advance_rejects_foreign_choice() {
        let h = Harness::new().await;
        let (_, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;

        let err = h
            .engine
            .branches()
            .advance(&session.id, "not-a-choice")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { .. }));
        assert!(h.engine.branches().current_path(&session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_same_choice_twice_reuses_child() {
        let h = Harness::new().await;
        let (_, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;
        let root_id = h.current_node(&session.id).await;
        let choice = h.choice_id(&session.id, 0).await;

        let first = h.engine.branches().advance(&session.id, &choice).await.unwrap();
        h.engine.branches().rewind(&session.id, &root_id).await.unwrap();
        let second = h.engine.branches().advance(&session.id, &choice).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.content, second.content);
        assert_eq!(h.generator.calls(PromptKind::Continuation), 1);

        let nodes = h.storage.get_session_nodes(&session.id).await.unwrap();
        assert_eq!(nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_create_or_reuse_node_is_idempotent() {
        let h = Harness::new().await;
        let (_, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;
        let root = h
            .storage
            .get_node(&h.current_node(&session.id).await)
            .await
            .unwrap()
            .unwrap();
        let choice = root.choices[1].clone();

        let created = h
            .engine
            .branches()
            .create_or_reuse_node(&session, &root, &choice, GeneratedScene::new("By the river."))
            .await
            .unwrap();
        let reused = h
            .engine
            .branches()
            .create_or_reuse_node(&session, &root, &choice, GeneratedScene::new("Different text"))
            .await
            .unwrap();

        assert_eq!(created.id, reused.id);
        assert_eq!(reused.content, "By the river.");
        assert_eq!(reused.choices[0].text, CONTINUE_CHOICE_TEXT);
    }

    #[tokio::test]
    async fn test_continuation_plain_text_becomes_content() {
        let h = Harness::new().await;
        h.generator
            .respond(PromptKind::Continuation, "A crow watches you silently.");
        let (_, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;
        let choice = h.choice_id(&session.id, 0).await;

        let node = h.engine.branches().advance(&session.id, &choice).await.unwrap();
        assert_eq!(node.content, "A crow watches you silently.");
        assert_eq!(node.choices.len(), 1);
    }
}

#[cfg(test)]
mod rewind_restore_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_rewind_then_restore_scenario() {
        let h = Harness::new().await;
        let (_, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;
        let node_a = h.current_node(&session.id).await;
        let c1 = h.choice_id(&session.id, 0).await;
        let c2 = h.choice_id(&session.id, 1).await;

        // A --C1--> B on "main" at step 0
        let node_b = h.engine.branches().advance(&session.id, &c1).await.unwrap();
        let original = h.engine.branches().current_path(&session.id).await.unwrap();
        assert_eq!(original[0].branch_id, MAIN_BRANCH_ID);
        assert_eq!(original[0].step_order, 0);

        // Rewind to A archives the B row
        let rewound = h.engine.branches().rewind(&session.id, &node_a).await.unwrap();
        assert_eq!(rewound.current_node_id.as_deref(), Some(node_a.as_str()));
        assert!(h.engine.branches().current_path(&session.id).await.unwrap().is_empty());
        let archived_id = h.storage.get_session_paths(&session.id).await.unwrap()[0]
            .branch_id
            .clone();
        assert!(archived_id.starts_with("archive-"));

        // A --C2--> D restarts "main" at step 0
        let node_d = h.engine.branches().advance(&session.id, &c2).await.unwrap();
        let live = h.engine.branches().current_path(&session.id).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].node_id, node_d.id);
        assert_eq!(live[0].branch_id, MAIN_BRANCH_ID);
        assert_eq!(live[0].step_order, 0);

        // Restoring the archive brings B back
        let restored = h
            .engine
            .branches()
            .restore_branch(&session.id, &archived_id)
            .await
            .unwrap();
        assert_eq!(restored.current_node_id.as_deref(), Some(node_b.id.as_str()));

        let live = h.engine.branches().current_path(&session.id).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, original[0].id);
        assert!(live[0].is_active);
        assert_eq!(active_branch_ids(&h, &session.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_rewind_mid_timeline_then_restore_returns_to_tip() {
        let h = Harness::new().await;
        let (_, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;

        let mut visited = Vec::new();
        for _ in 0..4 {
            let choice = h.choice_id(&session.id, 0).await;
            visited.push(h.engine.branches().advance(&session.id, &choice).await.unwrap());
        }
        let tip = h.current_node(&session.id).await;

        h.engine.branches().rewind(&session.id, &visited[1].id).await.unwrap();
        let live = h.engine.branches().current_path(&session.id).await.unwrap();
        assert_eq!(live.len(), 2);
        assert_contiguous(&live);

        let listing = h.engine.branches().all_branches(&session.id).await.unwrap();
        assert_eq!(listing.archived.len(), 1);
        let archived = &listing.archived[0];
        assert_eq!(archived.paths.len(), 2);
        assert_eq!(archived.paths[0].step_order, 2);

        let restored = h
            .engine
            .branches()
            .restore_branch(&session.id, &archived.branch_id)
            .await
            .unwrap();
        assert_eq!(restored.current_node_id, Some(tip));

        let live = h.engine.branches().current_path(&session.id).await.unwrap();
        assert_contiguous(&live);
        assert_eq!(active_branch_ids(&h, &session.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_at_most_one_live_branch_throughout() {
        let h = Harness::new().await;
        let (_, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;
        let root = h.current_node(&session.id).await;

        for round in 0..3 {
            let choice = h.choice_id(&session.id, round % 2).await;
            h.engine.branches().advance(&session.id, &choice).await.unwrap();
            let choice = h.choice_id(&session.id, 0).await;
            h.engine.branches().advance(&session.id, &choice).await.unwrap();
            assert!(active_branch_ids(&h, &session.id).await.len() <= 1);

            h.engine.branches().rewind(&session.id, &root).await.unwrap();
            assert!(active_branch_ids(&h, &session.id).await.is_empty());
        }

        let listing = h.engine.branches().all_branches(&session.id).await.unwrap();
        let archive = listing.archived[0].branch_id.clone();
        h.engine.branches().restore_branch(&session.id, &archive).await.unwrap();
        assert_eq!(active_branch_ids(&h, &session.id).await.len(), 1);

        let live = h.engine.branches().current_path(&session.id).await.unwrap();
        assert_contiguous(&live);
    }

    #[tokio::test]
    async fn test_rewind_to_node_off_timeline_is_not_found() {
        let h = Harness::new().await;
        let (_, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;
        let root = h.current_node(&session.id).await;
        let c1 = h.choice_id(&session.id, 0).await;
        let c2 = h.choice_id(&session.id, 1).await;

        let b = h.engine.branches().advance(&session.id, &c1).await.unwrap();
        h.engine.branches().rewind(&session.id, &root).await.unwrap();
        h.engine.branches().advance(&session.id, &c2).await.unwrap();

        let err = h.engine.branches().rewind(&session.id, &b.id).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        let err = h.engine.branches().rewind(&session.id, "missing").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { entity: "StoryNode", .. }));
    }

    #[tokio::test]
    async fn test_restore_unknown_branch_is_not_found() {
        let h = Harness::new().await;
        let (_, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;

        let err = h
            .engine
            .branches()
            .restore_branch(&session.id, "archive-nope")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { entity: "Branch", .. }));
    }

    #[tokio::test]
    async fn test_restore_live_branch_is_noop() {
        let h = Harness::new().await;
        let (_, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;
        let choice = h.choice_id(&session.id, 0).await;
        h.engine.branches().advance(&session.id, &choice).await.unwrap();

        let before = h.storage.get_session_paths(&session.id).await.unwrap();
        let session_before = h.session(&session.id).await;
        let restored = h
            .engine
            .branches()
            .restore_branch(&session.id, MAIN_BRANCH_ID)
            .await
            .unwrap();

        assert_eq!(restored, session_before);
        assert_eq!(h.storage.get_session_paths(&session.id).await.unwrap(), before);
    }
}

#[cfg(test)]
mod query_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_story_tree_tags_live_timeline() {
        let h = Harness::new().await;
        let (_, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;
        let root = h.current_node(&session.id).await;
        let c1 = h.choice_id(&session.id, 0).await;
        let c2 = h.choice_id(&session.id, 1).await;

        let b = h.engine.branches().advance(&session.id, &c1).await.unwrap();
        h.engine.branches().rewind(&session.id, &root).await.unwrap();
        h.clock.advance(Duration::seconds(1));
        let d = h.engine.branches().advance(&session.id, &c2).await.unwrap();

        let tree = h.engine.branches().story_tree(&session.id).await.unwrap();
        assert_eq!(tree.root_id.as_deref(), Some(root.as_str()));
        assert_eq!(tree.current_node_id.as_deref(), Some(d.id.as_str()));
        assert_eq!(tree.nodes.len(), 3);

        let root_node = tree.node(&root).unwrap();
        assert_eq!(root_node.children, vec![b.id.clone(), d.id.clone()]);
        assert!(root_node.on_current_path);
        assert!(tree.node(&d.id).unwrap().on_current_path);
        assert!(!tree.node(&b.id).unwrap().on_current_path);
    }

    #[tokio::test]
    async fn test_story_tree_tags_root_of_empty_timeline() {
        let h = Harness::new().await;
        let (_, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;
        let root = h.current_node(&session.id).await;
        assert!(h.engine.branches().current_path(&session.id).await.unwrap().is_empty());

        let tree = h.engine.branches().story_tree(&session.id).await.unwrap();
        assert_eq!(tree.nodes.len(), 1);
        assert!(tree.node(&root).unwrap().on_current_path);
    }

    #[tokio::test]
    async fn test_branch_points_after_replay() {
        let h = Harness::new().await;
        let (_, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;
        let root = h.current_node(&session.id).await;
        let c1 = h.choice_id(&session.id, 0).await;

        let b = h.engine.branches().advance(&session.id, &c1).await.unwrap();
        assert!(h.engine.branches().branch_points(&session.id).await.unwrap().is_empty());

        h.engine.branches().rewind(&session.id, &root).await.unwrap();
        h.engine.branches().advance(&session.id, &c1).await.unwrap();

        assert_eq!(
            h.engine.branches().branch_points(&session.id).await.unwrap(),
            vec![b.id]
        );
    }

    #[tokio::test]
    async fn test_all_branches_separates_live_and_archived() {
        let h = Harness::new().await;
        let (_, session) = h.start(Character::new("Ayla"), SessionOptions::default()).await;
        let root = h.current_node(&session.id).await;
        let c1 = h.choice_id(&session.id, 0).await;
        let c2 = h.choice_id(&session.id, 1).await;

        h.engine.branches().advance(&session.id, &c1).await.unwrap();
        h.engine.branches().rewind(&session.id, &root).await.unwrap();
        h.engine.branches().advance(&session.id, &c2).await.unwrap();

        let listing = h.engine.branches().all_branches(&session.id).await.unwrap();
        let active = listing.active.unwrap();
        assert_eq!(active.branch_id, MAIN_BRANCH_ID);
        assert!(active.is_active);
        assert_eq!(listing.archived.len(), 1);
        assert!(!listing.archived[0].is_active);
    }

    #[tokio::test]
    async fn test_queries_on_missing_session() {
        let h = Harness::new().await;
        assert!(matches!(
            h.engine.branches().story_tree("nope").await.unwrap_err(),
            EngineError::NotFound { .. }
        ));
        assert!(matches!(
            h.engine.branches().all_branches("nope").await.unwrap_err(),
            EngineError::NotFound { .. }
        ));
    }
}
