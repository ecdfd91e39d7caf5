//! The partner exchange cycle: Ingest -> Process -> Emit.
//!
//! A cycle keeps no state between invocations. Everything durable lives in the staging
//! stores, the sequence allocator and the domestic ledger, so a cancelled tick can simply be
//! re-run from scratch.
//!
//! Stages are independent: a failure is recorded in the [`CycleReport`] and the next stage
//! still runs. Only a failed sequence allocation stops Emit before anything is staged or sent.

use crate::domain::model::{CycleReport, EmitReport, Record, SequenceClaim, StageReport};
use crate::domain::ports::{
    DomesticLedger, FileTransform, RemoteChannel, SequenceAllocator, StagingStore,
};
use crate::utils::error::{ExchangeError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// 回覆檔套用失敗時的補償
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyFailureAction {
    RollbackSequence,
    LeavePending,
}

/// 批次傳送失敗時的補償
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailureAction {
    KeepStaged,
    RollbackSequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompensationPolicy {
    pub on_apply_failure: ApplyFailureAction,
    pub on_send_failure: SendFailureAction,
}

impl Default for CompensationPolicy {
    fn default() -> Self {
        Self {
            on_apply_failure: ApplyFailureAction::RollbackSequence,
            on_send_failure: SendFailureAction::KeepStaged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSettings {
    pub partner_key: String,
    /// 夥伴放回覆檔的信箱
    pub outbox: String,
    /// 我們送出批次的信箱
    pub inbox: String,
    pub batch_prefix: String,
    pub compensation: CompensationPolicy,
    pub resend_unsent: bool,
}

impl ExchangeSettings {
    pub fn new(partner_key: &str) -> Self {
        Self {
            partner_key: partner_key.to_string(),
            outbox: "outbox".to_string(),
            inbox: "inbox".to_string(),
            batch_prefix: "batch".to_string(),
            compensation: CompensationPolicy::default(),
            resend_unsent: false,
        }
    }
}

/// 一個夥伴週期需要的外部協作者
#[derive(Clone)]
pub struct ExchangePorts {
    pub channel: Arc<dyn RemoteChannel>,
    pub inbound: Arc<dyn StagingStore>,
    pub outbound: Arc<dyn StagingStore>,
    pub allocator: Arc<dyn SequenceAllocator>,
    pub transform: Arc<dyn FileTransform>,
    pub ledger: Arc<dyn DomesticLedger>,
}

pub fn batch_name(prefix: &str, at: DateTime<Utc>, seq: i64) -> String {
    format!("{}_{}_{}.txt", prefix, at.format("%y%m%d_%H%M%S"), seq)
}

pub fn marker_name(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}_empty.txt", prefix, at.format("%y%m%d_%H%M%S"))
}

/// 從批次名稱取回序號；標記檔沒有序號
pub fn batch_sequence(name: &str) -> Option<i64> {
    let stem = name.strip_suffix(".txt")?;
    let (_, seq) = stem.rsplit_once('_')?;
    seq.parse().ok()
}

pub struct ExchangeCycle {
    settings: ExchangeSettings,
    ports: ExchangePorts,
    clock: Clock,
}

impl ExchangeCycle {
    pub fn new(settings: ExchangeSettings, ports: ExchangePorts) -> Self {
        Self {
            settings,
            ports,
            clock: Arc::new(Utc::now),
        }
    }

    /// 測試用：固定時間來源
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &ExchangeSettings {
        &self.settings
    }

    fn partner(&self) -> &str {
        &self.settings.partner_key
    }

    /// 執行完整週期；各階段錯誤記錄在報告中，不會中斷後續階段
    pub async fn run(&self) -> CycleReport {
        let mut report = CycleReport::new(self.partner(), (self.clock)());
        tracing::info!(
            "🔁 Exchange cycle started for {} ({} format)",
            self.partner(),
            self.ports.transform.partner()
        );

        if let Err(e) = self.ingest(&mut report.ingest).await {
            tracing::error!("❌ Ingest failed for {}: {}", self.partner(), e);
            report.ingest.error = Some(e.to_string());
        }

        if let Err(e) = self.process(&mut report.process, &mut report.rollbacks).await {
            tracing::error!("❌ Process failed for {}: {}", self.partner(), e);
            report.process.error = Some(e.to_string());
        }

        if let Err(e) = self.emit(&mut report.emit).await {
            tracing::error!("❌ Emit failed for {}: {}", self.partner(), e);
            tracing::error!("💡 {}", e.recovery_suggestion());
            report.emit.error = Some(e.to_string());
        }

        tracing::info!(
            "✅ Exchange cycle finished for {} (ingested: {}, processed: {}, batch: {})",
            self.partner(),
            report.ingest.handled,
            report.process.handled,
            report.emit.batch_name.as_deref().unwrap_or("-")
        );
        report
    }

    /// 將遠端信箱的新檔案存入 inbound 暫存區
    pub async fn ingest(&self, report: &mut StageReport) -> Result<()> {
        let outbox = &self.settings.outbox;
        let names = self.ports.channel.list(outbox).await?;
        if names.is_empty() {
            tracing::debug!("📭 No remote files for {}", self.partner());
            return Ok(());
        }
        tracing::info!("📥 {} remote file(s) listed for {}", names.len(), self.partner());

        for name in names {
            if self.ports.inbound.state(&name).await?.is_some() {
                tracing::debug!("Already staged: {}", name);
                report.skipped += 1;
                continue;
            }

            match self.ports.channel.fetch(outbox, &name).await {
                Ok(bytes) => {
                    self.ports.inbound.put(&name, &bytes).await?;
                    report.handled += 1;
                }
                Err(ExchangeError::NotFound { .. }) => {
                    // 列舉與下載之間被移除
                    tracing::warn!("⚠️ Remote file vanished before fetch: {}", name);
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// 套用 pending 的回覆檔，成功才標記 processed
    pub async fn process(&self, report: &mut StageReport, rollbacks: &mut usize) -> Result<()> {
        let pending = self.ports.inbound.list_pending().await?;
        for name in pending {
            let bytes = self.ports.inbound.get(&name).await?;
            if self.ports.transform.apply(&bytes).await? {
                self.ports.inbound.mark_processed(&name).await?;
                tracing::info!("✅ Applied {}", name);
                report.handled += 1;
            } else {
                tracing::warn!("⚠️ Could not apply {}; it stays pending", name);
                report.failed.push(name);
                if self.compensate_apply_failure().await {
                    *rollbacks += 1;
                }
            }
        }
        Ok(())
    }

    async fn compensate_apply_failure(&self) -> bool {
        if self.settings.compensation.on_apply_failure != ApplyFailureAction::RollbackSequence {
            return false;
        }
        match self.ports.allocator.rollback_outstanding(self.partner()).await {
            Ok(value) => {
                tracing::warn!("↩️ Sequence for {} rolled back to {}", self.partner(), value);
                true
            }
            Err(ExchangeError::ClaimRejected { reason, .. }) => {
                tracing::warn!("↩️ Rollback skipped for {}: {}", self.partner(), reason);
                false
            }
            Err(e) => {
                tracing::error!("❌ Rollback failed for {}: {}", self.partner(), e);
                false
            }
        }
    }

    /// 由本地待送記錄建立批次、暫存並傳送
    pub async fn emit(&self, report: &mut EmitReport) -> Result<()> {
        self.discard_orphans(report).await?;
        if self.settings.resend_unsent {
            self.resend_unsent(report).await?;
        }

        let records = self.ports.ledger.reserve_pending().await?;
        let at = (self.clock)();

        if records.is_empty() {
            return self.emit_marker(report, at).await;
        }

        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let claim = match self.ports.allocator.next(self.partner()).await {
            Ok(claim) => claim,
            Err(e) => {
                self.release(&ids).await;
                return Err(e);
            }
        };

        let (name, content) = match self.stage_batch(&records, &claim, at).await {
            Ok(staged) => staged,
            Err(e) => {
                self.release(&ids).await;
                self.rollback_claim(&claim).await;
                return Err(e);
            }
        };
        if let Err(e) = self.ports.ledger.commit_consumed(&name, &ids).await {
            // 記錄未消耗的暫存批次不可送出
            tracing::error!("❌ Could not commit records of {}: {}", name, e);
            if self.quarantine(&name).await {
                report.discarded.push(name);
            }
            self.release(&ids).await;
            self.rollback_claim(&claim).await;
            return Err(e);
        }
        report.batch_name = Some(name.clone());
        report.sequence = Some(claim.value);
        report.records = records.len();

        match self
            .ports
            .channel
            .send(&self.settings.inbox, &name, &content)
            .await
        {
            Ok(()) => {
                self.ports.outbound.mark_processed(&name).await?;
                report.transmitted = true;
                tracing::info!(
                    "📤 Sent {} ({} records, sequence {})",
                    name,
                    records.len(),
                    claim.value
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!("⚠️ Batch {} stays staged, send failed: {}", name, e);
                if self.settings.compensation.on_send_failure == SendFailureAction::RollbackSequence
                {
                    self.rollback_claim(&claim).await;
                }
                Err(ExchangeError::TransmissionFailed {
                    name,
                    message: e.to_string(),
                })
            }
        }
    }

    async fn stage_batch(
        &self,
        records: &[Record],
        claim: &SequenceClaim,
        at: DateTime<Utc>,
    ) -> Result<(String, Vec<u8>)> {
        let content = self.ports.transform.build(records, claim.value, at).await?;
        let name = batch_name(&self.settings.batch_prefix, at, claim.value);
        if self.ports.outbound.state(&name).await?.is_some() {
            return Err(ExchangeError::StorageUnavailable {
                operation: "put".to_string(),
                message: format!("batch '{}' is already staged", name),
            });
        }
        self.ports.outbound.put(&name, &content).await?;
        Ok((name, content))
    }

    /// 沒有記錄時只留下一個標記檔，不傳送
    async fn emit_marker(&self, report: &mut EmitReport, at: DateTime<Utc>) -> Result<()> {
        let seq = self.ports.allocator.current(self.partner()).await?;
        let content = self.ports.transform.build(&[], seq, at).await?;
        let name = marker_name(&self.settings.batch_prefix, at);
        self.ports.outbound.put(&name, &content).await?;
        self.ports.outbound.mark_processed(&name).await?;

        tracing::debug!("🏷️ No pending records for {}, staged marker {}", self.partner(), name);
        report.batch_name = Some(name);
        report.sequence = Some(seq);
        report.marker_only = true;
        Ok(())
    }

    /// 隔離沒有確認消耗記錄的 pending 批次（確認失敗或週期在暫存後被中斷）。
    /// 其記錄仍是 Reserved/Unconsumed，會由本次 Emit 重新組成批次。
    async fn discard_orphans(&self, report: &mut EmitReport) -> Result<()> {
        for name in self.ports.outbound.list_pending().await? {
            if self.ports.ledger.is_committed(&name).await? {
                continue;
            }
            self.ports.outbound.mark_processed(&name).await?;
            tracing::warn!("🗑️ Discarded orphan batch {} for {}", name, self.partner());

            // 中斷的週期沒有回收配號；孤兒持有最新配號時收回
            if let Some(seq) = batch_sequence(&name) {
                if seq == self.ports.allocator.current(self.partner()).await? {
                    self.compensate_orphan_claim(seq).await;
                }
            }
            report.discarded.push(name);
        }
        Ok(())
    }

    async fn compensate_orphan_claim(&self, seq: i64) {
        match self.ports.allocator.rollback_outstanding(self.partner()).await {
            Ok(value) => {
                tracing::warn!("↩️ Sequence {} of {} released, now {}", seq, self.partner(), value)
            }
            Err(e) => tracing::warn!("↩️ Sequence {} of {} kept: {}", seq, self.partner(), e),
        }
    }

    async fn quarantine(&self, name: &str) -> bool {
        match self.ports.outbound.mark_processed(name).await {
            Ok(()) => {
                tracing::warn!("🗑️ Quarantined uncommitted batch {}", name);
                true
            }
            Err(e) => {
                // 下一次 Emit 的孤兒檢查會再處理
                tracing::error!("❌ Could not quarantine {}: {}", name, e);
                false
            }
        }
    }

    /// 重送先前傳送失敗、仍在 outbound 暫存區的批次
    async fn resend_unsent(&self, report: &mut EmitReport) -> Result<()> {
        for name in self.ports.outbound.list_pending().await? {
            let content = self.ports.outbound.get(&name).await?;
            if let Err(e) = self
                .ports
                .channel
                .send(&self.settings.inbox, &name, &content)
                .await
            {
                tracing::warn!("⚠️ Resend of {} failed: {}", name, e);
                return Err(ExchangeError::TransmissionFailed {
                    name,
                    message: e.to_string(),
                });
            }
            self.ports.outbound.mark_processed(&name).await?;
            tracing::info!("📤 Resent {}", name);
            report.resent.push(name);
        }
        Ok(())
    }

    async fn release(&self, ids: &[String]) {
        if let Err(e) = self.ports.ledger.release(ids).await {
            tracing::error!(
                "❌ Could not release {} reserved record(s) for {}: {}",
                ids.len(),
                self.partner(),
                e
            );
        }
    }

    async fn rollback_claim(&self, claim: &SequenceClaim) {
        if let Err(e) = self.ports.allocator.rollback(claim).await {
            tracing::error!("❌ Could not roll back sequence {}: {}", claim.value, e);
        }
    }
}
