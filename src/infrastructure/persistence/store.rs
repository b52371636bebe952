//! Durable engine state: open positions and the retry queue.
//!
//! The store owns one JSON file. Every mutation rewrites it atomically
//! (write temp, fsync, rename) before the mutating call returns, so a crash
//! never observes a half-written state and an acknowledged change is never
//! lost. Readers receive point-in-time snapshots.

use crate::domain::types::Position;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOperation {
    PlaceStop,
    CancelStop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEntry {
    pub id: String,
    pub operation: RetryOperation,
    /// Opaque payload owned by the enqueuing component.
    pub payload: serde_json::Value,
    pub attempt_count: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub dead_letter: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    positions: Vec<Position>,
    retry_queue: Vec<RetryEntry>,
}

pub struct StateStore {
    path: PathBuf,
    state: Mutex<PersistedState>,
}

impl StateStore {
    /// Opens (or creates) the store at `path`, loading any prior state.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create state directory")?;
            }
        }

        let state = if path.exists() {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .context("Failed to read state file")?;
            let state: PersistedState =
                serde_json::from_str(&raw).context("Failed to parse state file")?;
            info!(
                "Loaded state: {} positions, {} retry entries",
                state.positions.len(),
                state.retry_queue.len()
            );
            state
        } else {
            PersistedState::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    async fn flush(&self, state: &PersistedState) -> Result<()> {
        let content =
            serde_json::to_string_pretty(state).context("Failed to serialize state")?;

        // Atomic write: temp file, fsync, rename over the live copy.
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, content)
            .await
            .context("Failed to write temp state file")?;
        let file = std::fs::File::open(&temp_path).context("Failed to reopen temp state file")?;
        file.sync_all().context("Failed to fsync temp state file")?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .context("Failed to rename state file")?;
        Ok(())
    }

    /// Writes the position (insert or replace) through to disk.
    pub async fn upsert_position(&self, position: &Position) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.positions.iter_mut().find(|p| p.id == position.id) {
            Some(existing) => *existing = position.clone(),
            None => state.positions.push(position.clone()),
        }
        self.flush(&state).await
    }

    pub async fn remove_position(&self, position_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let before = state.positions.len();
        state.positions.retain(|p| p.id != position_id);
        if state.positions.len() == before {
            warn!("Removing unknown position {}", position_id);
        }
        self.flush(&state).await
    }

    pub async fn positions(&self) -> Vec<Position> {
        self.state.lock().await.positions.clone()
    }

    pub async fn position(&self, position_id: &str) -> Option<Position> {
        self.state
            .lock()
            .await
            .positions
            .iter()
            .find(|p| p.id == position_id)
            .cloned()
    }

    /// Appends a retry entry; the entry is on disk before this returns.
    pub async fn append_retry_entry(&self, entry: &RetryEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        state.retry_queue.push(entry.clone());
        self.flush(&state).await
    }

    pub async fn update_retry_entry(&self, entry: &RetryEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.retry_queue.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry.clone(),
            None => state.retry_queue.push(entry.clone()),
        }
        self.flush(&state).await
    }

    pub async fn remove_retry_entry(&self, entry_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.retry_queue.retain(|e| e.id != entry_id);
        self.flush(&state).await
    }

    /// Snapshot of pending (non-dead-letter) entries in enqueue order.
    pub async fn retry_entries(&self) -> Vec<RetryEntry> {
        self.state
            .lock()
            .await
            .retry_queue
            .iter()
            .filter(|e| !e.dead_letter)
            .cloned()
            .collect()
    }

    pub async fn dead_letters(&self) -> Vec<RetryEntry> {
        self.state
            .lock()
            .await
            .retry_queue
            .iter()
            .filter(|e| e.dead_letter)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Side;
    use rust_decimal_macros::dec;

    fn sample_position(id: &str) -> Position {
        Position {
            id: id.to_string(),
            symbol: "XBTUSDTM".to_string(),
            side: Side::Long,
            entry_price: dec!(50000),
            size: dec!(0.01),
            leverage: 10,
            margin_used: dec!(50),
            entry_fee_rate: dec!(0.0006),
            exit_fee_rate: dec!(0.0006),
            stop_loss_order_id: Some("sl-1".to_string()),
            stop_loss_price: Some(dec!(49750)),
            take_profit_order_id: None,
            take_profit_price: None,
            break_even_armed: false,
            last_trailed_roi_step: 0,
            created_at: Utc::now(),
            last_stop_update_at: None,
        }
    }

    #[tokio::test]
    async fn test_round_trip_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::open(&path).await.unwrap();
        store.upsert_position(&sample_position("pos-1")).await.unwrap();
        store
            .append_retry_entry(&RetryEntry {
                id: "retry-1".to_string(),
                operation: RetryOperation::PlaceStop,
                payload: serde_json::json!({"stop_price": "49750"}),
                attempt_count: 2,
                next_attempt_at: Utc::now(),
                dead_letter: false,
            })
            .await
            .unwrap();
        drop(store);

        let reopened = StateStore::open(&path).await.unwrap();
        let positions = reopened.positions().await;
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].id, "pos-1");
        assert_eq!(positions[0].stop_loss_price, Some(dec!(49750)));

        let entries = reopened.retry_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, RetryOperation::PlaceStop);
        assert_eq!(entries[0].attempt_count, 2);
    }

    #[tokio::test]
    async fn test_upsert_replaces_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).await.unwrap();

        let mut position = sample_position("pos-1");
        store.upsert_position(&position).await.unwrap();
        position.stop_loss_price = Some(dec!(50065));
        position.break_even_armed = true;
        store.upsert_position(&position).await.unwrap();

        let positions = store.positions().await;
        assert_eq!(positions.len(), 1);
        assert!(positions[0].break_even_armed);
        assert_eq!(positions[0].stop_loss_price, Some(dec!(50065)));
    }

    #[tokio::test]
    async fn test_dead_letters_filtered_from_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).await.unwrap();

        let mut entry = RetryEntry {
            id: "retry-1".to_string(),
            operation: RetryOperation::CancelStop,
            payload: serde_json::Value::Null,
            attempt_count: 10,
            next_attempt_at: Utc::now(),
            dead_letter: false,
        };
        store.append_retry_entry(&entry).await.unwrap();
        entry.dead_letter = true;
        store.update_retry_entry(&entry).await.unwrap();

        assert!(store.retry_entries().await.is_empty());
        assert_eq!(store.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_position() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).await.unwrap();
        store.upsert_position(&sample_position("pos-1")).await.unwrap();
        store.remove_position("pos-1").await.unwrap();
        assert!(store.positions().await.is_empty());
        assert!(store.position("pos-1").await.is_none());
    }
}
