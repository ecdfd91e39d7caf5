//! In-memory implementations of every port, used by the unit and integration tests.

use crate::core::sequence::CounterState;
use crate::domain::model::{FileState, Record, RecordState, ResponseRecord, SequenceClaim};
use crate::domain::ports::{DomesticLedger, RemoteChannel, SequenceAllocator, StagingStore};
use crate::utils::error::{ExchangeError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

fn guard<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| ExchangeError::StorageUnavailable {
        operation: what.to_string(),
        message: "in-memory state poisoned".to_string(),
    })
}

#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    mailboxes: Arc<Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>>,
    offline: Arc<Mutex<bool>>,
    reject_sends: Arc<Mutex<bool>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drop_file(&self, mailbox: &str, name: &str, content: &[u8]) {
        if let Ok(mut boxes) = self.mailboxes.lock() {
            boxes
                .entry(mailbox.to_string())
                .or_default()
                .insert(name.to_string(), content.to_vec());
        }
    }

    pub fn files(&self, mailbox: &str) -> Vec<String> {
        self.mailboxes
            .lock()
            .map(|boxes| {
                boxes
                    .get(mailbox)
                    .map(|files| files.keys().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn content(&self, mailbox: &str, name: &str) -> Option<Vec<u8>> {
        self.mailboxes
            .lock()
            .ok()
            .and_then(|boxes| boxes.get(mailbox).and_then(|files| files.get(name).cloned()))
    }

    /// 模擬整個通道斷線
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut flag) = self.offline.lock() {
            *flag = offline;
        }
    }

    /// 只讓 send 失敗，list/fetch 照常
    pub fn set_reject_sends(&self, reject: bool) {
        if let Ok(mut flag) = self.reject_sends.lock() {
            *flag = reject;
        }
    }

    fn check_online(&self, operation: &str) -> Result<()> {
        if *guard(&self.offline, operation)? {
            return Err(ExchangeError::ChannelUnavailable {
                operation: operation.to_string(),
                message: "mailbox offline".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteChannel for MemoryChannel {
    async fn list(&self, mailbox: &str) -> Result<Vec<String>> {
        self.check_online("list")?;
        Ok(self.files(mailbox))
    }

    async fn fetch(&self, mailbox: &str, name: &str) -> Result<Vec<u8>> {
        self.check_online("fetch")?;
        self.content(mailbox, name).ok_or_else(|| ExchangeError::NotFound {
            name: format!("{}/{}", mailbox, name),
        })
    }

    async fn send(&self, mailbox: &str, name: &str, content: &[u8]) -> Result<()> {
        self.check_online("send")?;
        if *guard(&self.reject_sends, "send")? {
            return Err(ExchangeError::ChannelUnavailable {
                operation: "send".to_string(),
                message: "upload refused".to_string(),
            });
        }
        self.drop_file(mailbox, name, content);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStagingStore {
    files: Arc<Mutex<BTreeMap<String, (Vec<u8>, FileState)>>>,
    puts: Arc<Mutex<usize>>,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        self.files
            .lock()
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// put 被呼叫的次數
    pub fn put_count(&self) -> usize {
        self.puts.lock().map(|n| *n).unwrap_or_default()
    }
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn put(&self, name: &str, content: &[u8]) -> Result<()> {
        *guard(&self.puts, "put")? += 1;
        let mut files = guard(&self.files, "put")?;
        let state = files
            .get(name)
            .map(|(_, state)| *state)
            .unwrap_or(FileState::Pending);
        files.insert(name.to_string(), (content.to_vec(), state));
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        guard(&self.files, "get")?
            .get(name)
            .map(|(content, _)| content.clone())
            .ok_or_else(|| ExchangeError::NotFound {
                name: name.to_string(),
            })
    }

    async fn list_pending(&self) -> Result<Vec<String>> {
        Ok(guard(&self.files, "list_pending")?
            .iter()
            .filter(|(_, (_, state))| *state == FileState::Pending)
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn mark_processed(&self, name: &str) -> Result<()> {
        let mut files = guard(&self.files, "mark_processed")?;
        match files.get_mut(name) {
            Some((_, state)) => {
                *state = FileState::Processed;
                Ok(())
            }
            None => Err(ExchangeError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    async fn state(&self, name: &str) -> Result<Option<FileState>> {
        Ok(guard(&self.files, "state")?
            .get(name)
            .map(|(_, state)| *state))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemorySequenceAllocator {
    counters: Arc<Mutex<HashMap<String, CounterState>>>,
    unavailable: Arc<Mutex<bool>>,
}

impl MemorySequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以指定的值建立計數器（沒有未回收的配號）
    pub fn with_value(self, partner_key: &str, value: i64) -> Self {
        if let Ok(mut counters) = self.counters.lock() {
            let mut state = CounterState::new(partner_key);
            state.value = value;
            counters.insert(partner_key.to_string(), state);
        }
        self
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut flag) = self.unavailable.lock() {
            *flag = unavailable;
        }
    }

    fn with_counter<T>(
        &self,
        partner_key: &str,
        apply: impl FnOnce(&mut CounterState) -> Result<T>,
    ) -> Result<T> {
        let unavailable = |message: &str| ExchangeError::AllocatorUnavailable {
            partner_key: partner_key.to_string(),
            message: message.to_string(),
        };
        if *self
            .unavailable
            .lock()
            .map_err(|_| unavailable("poisoned"))?
        {
            return Err(unavailable("counter store offline"));
        }
        let mut counters = self.counters.lock().map_err(|_| unavailable("poisoned"))?;
        let state = counters
            .entry(partner_key.to_string())
            .or_insert_with(|| CounterState::new(partner_key));
        apply(state)
    }
}

#[async_trait]
impl SequenceAllocator for MemorySequenceAllocator {
    async fn next(&self, partner_key: &str) -> Result<SequenceClaim> {
        self.with_counter(partner_key, |state| Ok(state.advance()))
    }

    async fn rollback(&self, claim: &SequenceClaim) -> Result<()> {
        self.with_counter(&claim.partner_key, |state| state.retract(Some(claim.token)))
            .map(|_| ())
    }

    async fn rollback_outstanding(&self, partner_key: &str) -> Result<i64> {
        self.with_counter(partner_key, |state| state.retract(None))
    }

    async fn current(&self, partner_key: &str) -> Result<i64> {
        self.with_counter(partner_key, |state| Ok(state.value))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    records: Arc<Mutex<Vec<(Record, RecordState)>>>,
    responses: Arc<Mutex<Vec<ResponseRecord>>>,
    committed: Arc<Mutex<Vec<String>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(self, records: Vec<Record>) -> Self {
        if let Ok(mut stored) = self.records.lock() {
            stored.extend(records.into_iter().map(|r| (r, RecordState::Unconsumed)));
        }
        self
    }

    pub fn push(&self, record: Record) {
        if let Ok(mut stored) = self.records.lock() {
            stored.push((record, RecordState::Unconsumed));
        }
    }

    pub fn state_of(&self, id: &str) -> Option<RecordState> {
        self.records
            .lock()
            .ok()?
            .iter()
            .find(|(r, _)| r.id == id)
            .map(|(_, state)| *state)
    }

    pub fn responses(&self) -> Vec<ResponseRecord> {
        self.responses
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn transition(&self, ids: &[String], from: RecordState, to: RecordState) -> Result<()> {
        let mut records = guard(&self.records, "ledger")?;
        for (record, state) in records.iter_mut() {
            if *state == from && ids.contains(&record.id) {
                *state = to;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DomesticLedger for MemoryLedger {
    async fn reserve_pending(&self) -> Result<Vec<Record>> {
        let mut records = guard(&self.records, "reserve_pending")?;
        let mut reserved = Vec::new();
        for (record, state) in records.iter_mut() {
            if *state != RecordState::Consumed {
                *state = RecordState::Reserved;
                reserved.push(record.clone());
            }
        }
        Ok(reserved)
    }

    async fn commit_consumed(&self, batch: &str, ids: &[String]) -> Result<()> {
        self.transition(ids, RecordState::Reserved, RecordState::Consumed)?;
        guard(&self.committed, "commit_consumed")?.push(batch.to_string());
        Ok(())
    }

    async fn is_committed(&self, batch: &str) -> Result<bool> {
        Ok(guard(&self.committed, "is_committed")?
            .iter()
            .any(|b| b == batch))
    }

    async fn release(&self, ids: &[String]) -> Result<()> {
        self.transition(ids, RecordState::Reserved, RecordState::Unconsumed)
    }

    async fn apply_response(&self, response: &ResponseRecord) -> Result<()> {
        let known = guard(&self.records, "apply_response")?
            .iter()
            .any(|(r, _)| r.id == response.record_id);
        if !known {
            return Err(ExchangeError::NotFound {
                name: response.record_id.clone(),
            });
        }
        guard(&self.responses, "apply_response")?.push(response.clone());
        Ok(())
    }
}
