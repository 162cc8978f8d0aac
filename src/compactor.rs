use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Background task that compacts the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

/// Returns whether a compaction ran and succeeded.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compactor: {appends} appends since last compaction, below {threshold}");
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PromotionStrategy;
    use crate::model::Caller;
    use crate::notify::NotifyHub;
    use ulid::Ulid;

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let dir = std::env::temp_dir().join("slotwise_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("threshold.wal");
        let _ = std::fs::remove_file(&path);
        let engine =
            Engine::new(path, Arc::new(NotifyHub::new()), PromotionStrategy::Fifo).unwrap();

        let admin = Caller::admin(Ulid::new());
        for i in 0..3 {
            engine
                .create_provider(&admin, Ulid::new(), format!("Dr. {i}"), 1, "General".into())
                .await
                .unwrap();
        }

        assert!(!compact_if_needed(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 3);

        assert!(compact_if_needed(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.list_providers(None).await.len(), 3);
    }
}
