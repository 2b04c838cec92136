use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::ConsequenceScheduler;

/// Background task running [`ConsequenceScheduler::sweep`] on a fixed interval.
pub struct Sweeper {
    scheduler: ConsequenceScheduler,
    interval: Duration,
}

/// Handle used to stop a spawned [`Sweeper`].
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl Sweeper {
    pub fn new(scheduler: ConsequenceScheduler, interval: Duration) -> Self {
        Self {
            scheduler,
            interval,
        }
    }

    /// Spawn the sweep loop. The first sweep runs immediately.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown, receiver) = watch::channel(false);
        let join = tokio::spawn(self.run(receiver));
        SweeperHandle { shutdown, join }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting consequence sweeper"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scheduler.sweep().await {
                        error!(error = %e, "Consequence sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Consequence sweeper stopped");
    }
}

impl SweeperHandle {
    /// Signal the loop to stop and wait for it to finish.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        // A send error means the loop already exited.
        let _ = self.shutdown.send(true);
        self.join.await
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;

    use crate::engine::EngineCore;
    use crate::generator::MockNarrativeGenerator;
    use crate::storage::{
        Character, Consequence, Session, Severity, SqliteStorage, Storage, StoreBatch,
        TimeToTrigger,
    };

    #[tokio::test]
    async fn test_sweeper_fires_on_first_tick_and_stops() {
        let storage = Arc::new(SqliteStorage::new_in_memory().await.unwrap());
        let character = Character::new("Ilse");
        let session = Session::new(&character.id);
        let due = Consequence::new(
            &session.id,
            "The bell tolls",
            Severity::Minor,
            TimeToTrigger::Short,
            Utc::now() - chrono::Duration::minutes(5),
        );
        let mut batch = StoreBatch::new();
        batch
            .upsert_character(character)
            .upsert_session(session)
            .insert_consequence(due.clone());
        storage.apply(batch).await.unwrap();

        let core = EngineCore::new(
            storage.clone(),
            Arc::new(MockNarrativeGenerator::new()),
            storage.clone(),
        );
        let handle = Sweeper::new(ConsequenceScheduler::new(core), Duration::from_secs(3600)).spawn();

        let mut fired = false;
        for _ in 0..50 {
            let stored = storage.get_consequence(&due.id).await.unwrap();
            if stored.is_some_and(|c| c.is_triggered) {
                fired = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(fired, "first tick should sweep immediately");
        assert!(!handle.is_finished());

        handle.shutdown().await.unwrap();
    }
}
