use crate::domain::model::{Record, RecordState, ResponseRecord};
use crate::domain::ports::{DomesticLedger, Storage};
use crate::utils::error::{ExchangeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(flatten)]
    pub record: Record,
    pub state: RecordState,
    #[serde(default)]
    pub response: Option<ResponseRecord>,
    /// 確認消耗此記錄的批次名稱
    #[serde(default)]
    pub batch: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerDocument {
    #[serde(default)]
    pub entries: Vec<LedgerEntry>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// 以單一 JSON 文件保存的本地交易帳本
pub struct JsonLedger<S: Storage> {
    storage: S,
    path: String,
    lock: Mutex<()>,
}

impl<S: Storage> JsonLedger<S> {
    pub fn new(storage: S, path: impl Into<String>) -> Self {
        Self {
            storage,
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub async fn load(&self) -> Result<LedgerDocument> {
        match self.storage.read_file(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(LedgerDocument::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(ExchangeError::NotFound { .. }) => Ok(LedgerDocument::default()),
            Err(ExchangeError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(LedgerDocument::default())
            }
            Err(e) => Err(e),
        }
    }

    async fn save(&self, mut doc: LedgerDocument) -> Result<()> {
        doc.updated_at = Some(Utc::now());
        let bytes = serde_json::to_vec_pretty(&doc)?;
        self.storage.write_file(&self.path, &bytes).await
    }

    async fn update<T: Send>(
        &self,
        apply: impl FnOnce(&mut LedgerDocument) -> Result<T> + Send,
    ) -> Result<T> {
        let _guard = self.lock.lock().await;
        let mut doc = self.load().await?;
        let out = apply(&mut doc)?;
        self.save(doc).await?;
        Ok(out)
    }

    /// 新增待送出的記錄
    pub async fn enqueue(&self, records: Vec<Record>) -> Result<()> {
        self.update(|doc| {
            doc.entries.extend(records.into_iter().map(|record| LedgerEntry {
                record,
                state: RecordState::Unconsumed,
                response: None,
                batch: None,
            }));
            Ok(())
        })
        .await
    }

    async fn transition(&self, ids: &[String], from: RecordState, to: RecordState) -> Result<()> {
        self.update(|doc| {
            for entry in doc.entries.iter_mut() {
                if entry.state == from && ids.contains(&entry.record.id) {
                    entry.state = to;
                }
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl<S: Storage> DomesticLedger for JsonLedger<S> {
    async fn reserve_pending(&self) -> Result<Vec<Record>> {
        self.update(|doc| {
            let mut reserved = Vec::new();
            for entry in doc.entries.iter_mut() {
                if entry.state != RecordState::Consumed {
                    if entry.state == RecordState::Reserved {
                        tracing::warn!(
                            "♻️ Reclaiming record {} reserved by an interrupted cycle",
                            entry.record.id
                        );
                    }
                    entry.state = RecordState::Reserved;
                    reserved.push(entry.record.clone());
                }
            }
            Ok(reserved)
        })
        .await
    }

    async fn commit_consumed(&self, batch: &str, ids: &[String]) -> Result<()> {
        self.update(|doc| {
            for entry in doc.entries.iter_mut() {
                if entry.state == RecordState::Reserved && ids.contains(&entry.record.id) {
                    entry.state = RecordState::Consumed;
                    entry.batch = Some(batch.to_string());
                }
            }
            Ok(())
        })
        .await
    }

    async fn is_committed(&self, batch: &str) -> Result<bool> {
        let doc = self.load().await?;
        Ok(doc
            .entries
            .iter()
            .any(|e| e.batch.as_deref() == Some(batch)))
    }

    async fn release(&self, ids: &[String]) -> Result<()> {
        self.transition(ids, RecordState::Reserved, RecordState::Unconsumed)
            .await
    }

    async fn apply_response(&self, response: &ResponseRecord) -> Result<()> {
        let response = response.clone();
        self.update(move |doc| {
            let entry = doc
                .entries
                .iter_mut()
                .find(|e| e.record.id == response.record_id)
                .ok_or_else(|| ExchangeError::NotFound {
                    name: response.record_id.clone(),
                })?;
            entry.response = Some(response);
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::cli::LocalStorage;
    use crate::domain::model::ResponseStatus;
    use tempfile::TempDir;

    fn ledger(dir: &TempDir) -> JsonLedger<LocalStorage> {
        JsonLedger::new(
            LocalStorage::new(dir.path().to_string_lossy().to_string()),
            "ledger.json",
        )
    }

    #[tokio::test]
    async fn test_reserve_commit_and_release() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        ledger
            .enqueue(vec![Record::new("R1"), Record::new("R2")])
            .await
            .unwrap();

        let reserved = ledger.reserve_pending().await.unwrap();
        assert_eq!(reserved.len(), 2);

        ledger
            .commit_consumed("AMEX_240601_080000_1.txt", &["R1".to_string()])
            .await
            .unwrap();
        ledger.release(&["R2".to_string()]).await.unwrap();

        let doc = ledger.load().await.unwrap();
        assert_eq!(doc.entries[0].state, RecordState::Consumed);
        assert_eq!(doc.entries[0].batch.as_deref(), Some("AMEX_240601_080000_1.txt"));
        assert_eq!(doc.entries[1].state, RecordState::Unconsumed);
        assert!(ledger.is_committed("AMEX_240601_080000_1.txt").await.unwrap());
        assert!(!ledger.is_committed("AMEX_240601_080000_2.txt").await.unwrap());

        let again = ledger.reserve_pending().await.unwrap();
        assert_eq!(again, vec![Record::new("R2")]);
    }

    #[tokio::test]
    async fn test_interrupted_reservation_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        ledger.enqueue(vec![Record::new("R1")]).await.unwrap();

        ledger.reserve_pending().await.unwrap();
        // 模擬程序在確認前中斷：下一次仍拿得到同一筆
        let reclaimed = ledger.reserve_pending().await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert!(!ledger.is_committed("AMEX_240601_080000_1.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_apply_response_requires_known_record() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger(&dir);
        ledger.enqueue(vec![Record::new("R1")]).await.unwrap();

        let accepted = ResponseRecord {
            record_id: "R1".to_string(),
            status: ResponseStatus::Accepted,
            reason: None,
        };
        ledger.apply_response(&accepted).await.unwrap();

        let unknown = ResponseRecord {
            record_id: "R9".to_string(),
            ..accepted.clone()
        };
        assert!(ledger.apply_response(&unknown).await.is_err());

        let doc = ledger.load().await.unwrap();
        assert_eq!(doc.entries[0].response, Some(accepted));
    }
}
