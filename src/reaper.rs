use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::engine::{Engine, ReapReport};
use crate::observability::REAPER_FAILURES_TOTAL;
use crate::store::MemoryStore;

const COMPACT_CHECK_PERIOD: Duration = Duration::from_secs(30);

/// Background task that periodically removes expired reservations and
/// finalizes soft deletions. Never returns; abort the task to stop it.
pub async fn run_reaper(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        reap_once(&engine).await;
    }
}

/// One tick. Errors are logged and counted; the next tick starts over.
pub async fn reap_once(engine: &Engine) -> Option<ReapReport> {
    match engine.reap(Utc::now()).await {
        Ok(report) => {
            if report.total() > 0 {
                info!(
                    bookings = report.bookings,
                    offerings = report.offerings,
                    assignments = report.assignments,
                    workspaces = report.workspaces,
                    floors = report.floors,
                    "reaped expired records"
                );
            }
            Some(report)
        }
        Err(e) => {
            metrics::counter!(REAPER_FAILURES_TOTAL).increment(1);
            tracing::error!("reaper tick failed: {e}");
            None
        }
    }
}

/// Rewrites the WAL once enough appends have piled up since the last compaction.
pub async fn run_compactor(store: Arc<MemoryStore>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_PERIOD);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        compact_if_needed(&store, threshold).await;
    }
}

pub async fn compact_if_needed(store: &MemoryStore, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            info!(appends, "compacted WAL");
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::store::RecordFilter;
    use chrono::Duration as ChronoDuration;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("deskpool_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn seed(engine: &Engine) -> (Workspace, User) {
        let floor = engine
            .create_floor(NewFloor {
                name: "Ground".into(),
                address: "1 Main St".into(),
                download_url: "https://img.example/g".into(),
            })
            .await
            .unwrap();
        let ws = engine
            .create_workspace(WorkspaceInput {
                name: "G-1".into(),
                floor_id: floor.id,
                details: String::new(),
                properties: Properties::new(),
            })
            .await
            .unwrap();
        let user = engine
            .create_user(User {
                id: Ulid::new(),
                name: "Ada".into(),
                department: String::new(),
                email: "ada@example.com".into(),
                is_admin: false,
            })
            .await
            .unwrap();
        (ws, user)
    }

    #[tokio::test]
    async fn reaper_task_removes_expired_booking() {
        let engine = Arc::new(Engine::new(Arc::new(MemoryStore::new())));
        let (ws, user) = seed(&engine).await;
        let now = Utc::now();
        engine
            .create_booking(ReservationInput {
                workspace_id: ws.id,
                user_id: user.id,
                start_time: now - ChronoDuration::hours(1),
                end_time: now - ChronoDuration::minutes(1),
                created_by: None,
            })
            .await
            .unwrap();

        let task = tokio::spawn(run_reaper(engine.clone(), Duration::from_millis(10)));
        let mut gone = false;
        for _ in 0..100 {
            if engine.list_bookings(RecordFilter::All).await.unwrap().is_empty() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();
        assert!(gone);
    }

    #[tokio::test]
    async fn reap_once_reports_counts() {
        let engine = Engine::new(Arc::new(MemoryStore::new()));
        let (ws, _) = seed(&engine).await;
        engine.remove_workspace(ws.id).await.unwrap();
        let report = reap_once(&engine).await.unwrap();
        assert_eq!(report.workspaces, 1);
        assert_eq!(report.total(), 1);
    }

    #[tokio::test]
    async fn compactor_respects_threshold() {
        let path = test_wal_path("compactor.wal");
        let store = Arc::new(MemoryStore::open(&path).unwrap());
        let engine = Engine::new(store.clone());
        seed(&engine).await;

        assert!(!compact_if_needed(&store, 100).await);
        assert!(compact_if_needed(&store, 3).await);
        assert_eq!(store.wal_appends_since_compact().await, 0);
    }
}
