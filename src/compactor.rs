use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = maybe_compact(&engine, threshold).await {
            tracing::warn!("compaction failed: {e}");
        }
    }
}

/// Compact when the append count has reached `threshold`. Returns whether
/// a compaction ran.
pub async fn maybe_compact(engine: &Engine, threshold: u64) -> Result<bool, crate::engine::EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!("compacted WAL after {appends} appends");
    Ok(true)
}
