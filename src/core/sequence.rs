//! Per-partner batch sequence counters.
//!
//! Every allocation hands out a [`SequenceClaim`] carrying an opaque token. Only the most
//! recent, not yet compensated claim may be rolled back, so repeated or concurrent
//! compensations for the same partner decrement the counter at most once per allocation.

use crate::domain::model::{ClaimToken, SequenceClaim};
use crate::domain::ports::SequenceAllocator;
use crate::utils::error::{ExchangeError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

/// 持久化的計數器文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    pub partner_key: String,
    pub value: i64,
    pub generation: u64,
    pub outstanding: Option<u64>,
}

impl CounterState {
    pub fn new(partner_key: &str) -> Self {
        Self {
            partner_key: partner_key.to_string(),
            value: 0,
            generation: 0,
            outstanding: None,
        }
    }

    pub fn advance(&mut self) -> SequenceClaim {
        self.value += 1;
        self.generation += 1;
        self.outstanding = Some(self.generation);
        SequenceClaim {
            partner_key: self.partner_key.clone(),
            value: self.value,
            token: ClaimToken(self.generation),
        }
    }

    /// `token` 為 None 時回收目前未回收的配號
    pub fn retract(&mut self, token: Option<ClaimToken>) -> Result<i64> {
        let outstanding = self.outstanding.ok_or_else(|| ExchangeError::ClaimRejected {
            partner_key: self.partner_key.clone(),
            reason: "no outstanding allocation to roll back".to_string(),
        })?;

        if let Some(ClaimToken(presented)) = token {
            if presented != outstanding {
                return Err(ExchangeError::ClaimRejected {
                    partner_key: self.partner_key.clone(),
                    reason: format!(
                        "claim {} is not the most recent allocation ({})",
                        presented, outstanding
                    ),
                });
            }
        }

        self.value -= 1;
        self.outstanding = None;
        Ok(self.value)
    }
}

/// 以 JSON 檔保存計數器；每個夥伴一個檔案，寫入採暫存檔 + rename
#[derive(Debug, Clone)]
pub struct FileSequenceAllocator {
    dir: PathBuf,
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl FileSequenceAllocator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn counter_path(&self, partner_key: &str) -> PathBuf {
        self.dir.join(format!("{}.seq.json", partner_key))
    }

    fn lock_for(&self, partner_key: &str) -> Result<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| self.unavailable(partner_key, "counter lock poisoned"))?;
        Ok(locks
            .entry(partner_key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone())
    }

    fn unavailable(&self, partner_key: &str, message: impl Into<String>) -> ExchangeError {
        ExchangeError::AllocatorUnavailable {
            partner_key: partner_key.to_string(),
            message: message.into(),
        }
    }

    async fn load(&self, partner_key: &str) -> Result<CounterState> {
        let path = self.counter_path(partner_key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                self.unavailable(partner_key, format!("corrupt counter {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CounterState::new(partner_key)),
            Err(e) => Err(self.unavailable(partner_key, e.to_string())),
        }
    }

    async fn store(&self, state: &CounterState) -> Result<()> {
        let path = self.counter_path(&state.partner_key);
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomically(&path, &bytes)
            .await
            .map_err(|e| self.unavailable(&state.partner_key, e.to_string()))
    }

    /// 在夥伴鎖內完成 read-modify-write
    async fn update<T: Send>(
        &self,
        partner_key: &str,
        apply: impl FnOnce(&mut CounterState) -> Result<T> + Send,
    ) -> Result<T> {
        let lock = self.lock_for(partner_key)?;
        let _guard = lock.lock().await;

        let mut state = self.load(partner_key).await?;
        let out = apply(&mut state)?;
        self.store(&state).await?;
        Ok(out)
    }
}

pub(crate) async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    // 隱藏的暫存檔，列舉時會被略過
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

#[async_trait]
impl SequenceAllocator for FileSequenceAllocator {
    async fn next(&self, partner_key: &str) -> Result<SequenceClaim> {
        let claim = self.update(partner_key, |state| Ok(state.advance())).await?;
        tracing::debug!("🔢 Allocated sequence {} for {}", claim.value, partner_key);
        Ok(claim)
    }

    async fn rollback(&self, claim: &SequenceClaim) -> Result<()> {
        let value = self
            .update(&claim.partner_key, |state| state.retract(Some(claim.token)))
            .await?;
        tracing::warn!(
            "↩️ Rolled back sequence {} for {} (now {})",
            claim.value,
            claim.partner_key,
            value
        );
        Ok(())
    }

    async fn rollback_outstanding(&self, partner_key: &str) -> Result<i64> {
        let value = self.update(partner_key, |state| state.retract(None)).await?;
        tracing::warn!("↩️ Rolled back outstanding sequence for {} (now {})", partner_key, value);
        Ok(value)
    }

    async fn current(&self, partner_key: &str) -> Result<i64> {
        Ok(self.load(partner_key).await?.value)
    }
}
