//! JSON snapshot-backed workload store
//!
//! The CLI reads shard contents from a JSON export instead of talking to the
//! shard databases directly. The file holds a [`StoreSnapshot`]; once loaded
//! it is served by a [`MemoryStore`].

use placemend_core::{PlacemendError, PlacemendResult};
use std::path::Path;
use tracing::{debug, info};

use crate::memory::{MemoryStore, StoreSnapshot};

/// Load a store from a snapshot file
pub async fn open_snapshot(path: &Path) -> PlacemendResult<MemoryStore> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        PlacemendError::Config(format!(
            "Failed to read store snapshot {}: {}",
            path.display(),
            e
        ))
    })?;
    let snapshot: StoreSnapshot = serde_json::from_str(&content)?;

    info!(
        path = %path.display(),
        shards = snapshot.shards.len(),
        "Loaded workload store snapshot"
    );
    Ok(MemoryStore::from_snapshot(snapshot))
}

/// Write a store out as a snapshot file
pub async fn write_snapshot(store: &MemoryStore, path: &Path) -> PlacemendResult<()> {
    let snapshot = store.snapshot().await;
    let content = serde_json::to_string_pretty(&snapshot)?;
    tokio::fs::write(path, content).await?;
    debug!(path = %path.display(), "Wrote workload store snapshot");
    Ok(())
}
