use crate::adapters::{
    transform_for, FilteredChannel, HttpMailboxChannel, JsonLedger, LocalMailboxChannel,
    LocalStagingStore,
};
use crate::config::cli::LocalStorage;
use crate::config::toml_config::{ExchangeConfig, PartnerConfig};
use crate::core::exchange::{ExchangeCycle, ExchangePorts};
use crate::core::sequence::FileSequenceAllocator;
use crate::domain::model::CycleReport;
use crate::domain::ports::{DomesticLedger, RemoteChannel, SequenceAllocator, StagingStore};
use crate::utils::error::{ExchangeError, Result};
use crate::utils::monitor::SystemMonitor;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::Instrument;

/// 舊排程遺留的旗標，主要流程從不依賴它
const LEGACY_WAITING_FLAG: &str = "waiting_for_response";

/// 外部排程器觸發的一次 tick
#[derive(Debug, Clone, Default)]
pub struct JobInvocation {
    pub job_id: String,
    pub payload: HashMap<String, String>,
}

impl JobInvocation {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            payload: HashMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct PartnerOutcome {
    pub partner_key: String,
    pub report: Option<CycleReport>,
    pub error: Option<ExchangeError>,
}

impl PartnerOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: String,
    pub payload: HashMap<String, String>,
    pub partners: Vec<PartnerOutcome>,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        self.partners.iter().all(PartnerOutcome::is_success)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ExchangeError> {
        self.partners.iter().filter_map(|p| p.error.as_ref())
    }

    pub fn partner(&self, key: &str) -> Option<&PartnerOutcome> {
        self.partners.iter().find(|p| p.partner_key == key)
    }
}

/// 每個夥伴一個交換週期，彼此並行、互不影響
pub struct ExchangeJob {
    cycles: Vec<Arc<ExchangeCycle>>,
    timeout: Option<Duration>,
    monitor: SystemMonitor,
}

impl ExchangeJob {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            cycles: Vec::new(),
            timeout,
            monitor: SystemMonitor::new(false),
        }
    }

    pub fn with_monitoring(mut self, enabled: bool) -> Self {
        self.monitor = SystemMonitor::new(enabled);
        self
    }

    pub fn add_cycle(&mut self, cycle: ExchangeCycle) {
        self.cycles.push(Arc::new(cycle));
    }

    pub fn partner_keys(&self) -> Vec<String> {
        self.cycles
            .iter()
            .map(|c| c.settings().partner_key.clone())
            .collect()
    }

    pub async fn run(&self, invocation: JobInvocation) -> JobOutcome {
        let JobInvocation { job_id, payload } = invocation;
        if payload.contains_key(LEGACY_WAITING_FLAG) {
            tracing::debug!(
                "Ignoring legacy '{}' payload flag; every tick attempts ingest and emit",
                LEGACY_WAITING_FLAG
            );
        }

        self.monitor.log_stats("Exchange job started");
        tracing::info!(
            "🚀 Job {} started for {} partner(s)",
            job_id,
            self.cycles.len()
        );

        let mut tasks = JoinSet::new();
        for cycle in &self.cycles {
            let cycle = cycle.clone();
            let partner_key = cycle.settings().partner_key.clone();
            let span = tracing::info_span!("exchange_cycle", partner = %partner_key, job_id = %job_id);
            let timeout = self.timeout;
            tasks.spawn(
                async move {
                    let result = run_with_timeout(&cycle, timeout).await;
                    (partner_key, result)
                }
                .instrument(span),
            );
        }

        let mut partners = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok((partner_key, Ok(report))) => {
                    let error = report.clone().into_result().err();
                    PartnerOutcome {
                        partner_key,
                        report: Some(report),
                        error,
                    }
                }
                Ok((partner_key, Err(e))) => PartnerOutcome {
                    partner_key,
                    report: None,
                    error: Some(e),
                },
                Err(e) => {
                    tracing::error!("❌ Exchange task aborted: {}", e);
                    PartnerOutcome {
                        partner_key: "unknown".to_string(),
                        report: None,
                        error: Some(ExchangeError::StageFailures {
                            partner_key: "unknown".to_string(),
                            failures: vec![format!("task aborted: {}", e)],
                        }),
                    }
                }
            };

            if let Some(e) = &outcome.error {
                tracing::error!(
                    "❌ Partner {} finished with errors: {} (Category: {:?}, Severity: {:?})",
                    outcome.partner_key,
                    e,
                    e.category(),
                    e.severity()
                );
            }
            partners.push(outcome);
        }
        partners.sort_by(|a, b| a.partner_key.cmp(&b.partner_key));

        self.monitor.log_stats("Exchange job completed");
        JobOutcome {
            job_id,
            payload,
            partners,
        }
    }
}

/// 逾時視同取消；下一次 tick 從頭重跑即可
async fn run_with_timeout(cycle: &ExchangeCycle, timeout: Option<Duration>) -> Result<CycleReport> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, cycle.run())
            .await
            .map_err(|_| ExchangeError::Cancelled {
                partner_key: cycle.settings().partner_key.clone(),
                reason: format!("exceeded job timeout of {:?}", limit),
            }),
        None => Ok(cycle.run().await),
    }
}

/// 依 TOML 設定組出本地檔案系統版本的 job
pub fn build_local_job(config: &ExchangeConfig, only: &[String]) -> Result<ExchangeJob> {
    let allocator: Arc<dyn SequenceAllocator> =
        Arc::new(FileSequenceAllocator::new(&config.exchange.sequence_dir));
    let mut job = ExchangeJob::new(config.job_timeout());

    for partner in config.enabled_partners(only) {
        let ledger: Arc<dyn DomesticLedger> = Arc::new(JsonLedger::new(
            LocalStorage::new(config.exchange.ledger_dir.clone()),
            format!("{}.ledger.json", partner.key),
        ));
        let staging = Path::new(&config.exchange.staging_root).join(&partner.key);

        let ports = ExchangePorts {
            channel: build_channel(partner)?,
            inbound: Arc::new(LocalStagingStore::new(staging.join("inbound"))),
            outbound: Arc::new(LocalStagingStore::new(staging.join("outbound"))),
            allocator: allocator.clone(),
            transform: transform_for(
                partner.partner_kind()?,
                partner.fields.clone().unwrap_or_default(),
                ledger.clone(),
            ),
            ledger,
        };
        job.add_cycle(ExchangeCycle::new(partner.settings()?, ports));
    }

    if job.cycles.is_empty() {
        return Err(ExchangeError::ConfigError {
            message: "No enabled partners match the selection".to_string(),
        });
    }
    Ok(job)
}

/// `--dry-run` 用的唯讀檢視
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartnerPlan {
    pub partner_key: String,
    pub remote_outbox: Vec<String>,
    pub pending_inbound: Vec<String>,
    pub pending_outbound: Vec<String>,
    pub current_sequence: i64,
}

/// 列出每個夥伴會被處理的檔案與目前序號，不做任何寫入
pub async fn plan_local(config: &ExchangeConfig, only: &[String]) -> Result<Vec<PartnerPlan>> {
    let allocator = FileSequenceAllocator::new(&config.exchange.sequence_dir);
    let mut plans = Vec::new();

    for partner in config.enabled_partners(only) {
        let settings = partner.settings()?;
        let staging = Path::new(&config.exchange.staging_root).join(&partner.key);
        let channel = build_channel(partner)?;

        plans.push(PartnerPlan {
            partner_key: partner.key.clone(),
            remote_outbox: channel.list(&settings.outbox).await?,
            pending_inbound: LocalStagingStore::new(staging.join("inbound"))
                .list_pending()
                .await?,
            pending_outbound: LocalStagingStore::new(staging.join("outbound"))
                .list_pending()
                .await?,
            current_sequence: allocator.current(&partner.key).await?,
        });
    }
    Ok(plans)
}

pub fn build_channel(partner: &PartnerConfig) -> Result<Arc<dyn RemoteChannel>> {
    let pattern = partner
        .channel
        .inbound_pattern
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|e| ExchangeError::ConfigError {
            message: format!("Invalid inbound_pattern for {}: {}", partner.key, e),
        })?;

    match partner.channel.r#type.as_str() {
        "local" => {
            let root = partner.channel.root.clone().ok_or_else(|| ExchangeError::MissingConfigError {
                field: format!("partners.{}.channel.root", partner.key),
            })?;
            Ok(wrap_filter(LocalMailboxChannel::new(root), pattern))
        }
        "http" => {
            let endpoint = partner.channel.endpoint.as_deref().ok_or_else(|| {
                ExchangeError::MissingConfigError {
                    field: format!("partners.{}.channel.endpoint", partner.key),
                }
            })?;
            let channel = HttpMailboxChannel::new(endpoint, partner.channel_timeout())?
                .with_headers(partner.channel.headers.clone().unwrap_or_default());
            Ok(wrap_filter(channel, pattern))
        }
        other => Err(ExchangeError::InvalidConfigValueError {
            field: format!("partners.{}.channel.type", partner.key),
            value: other.to_string(),
            reason: "Supported channel types: local, http".to_string(),
        }),
    }
}

fn wrap_filter<C: RemoteChannel + 'static>(channel: C, pattern: Option<Regex>) -> Arc<dyn RemoteChannel> {
    match pattern {
        Some(pattern) => Arc::new(FilteredChannel::new(channel, pattern)),
        None => Arc::new(channel),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{
        MemoryChannel, MemoryLedger, MemorySequenceAllocator, MemoryStagingStore,
    };
    use crate::core::exchange::ExchangeSettings;
    use crate::domain::model::{PartnerKind, Record};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn memory_cycle(key: &str, channel: MemoryChannel) -> ExchangeCycle {
        let ledger: Arc<dyn DomesticLedger> = Arc::new(MemoryLedger::new());
        ExchangeCycle::new(
            ExchangeSettings::new(key),
            ExchangePorts {
                channel: Arc::new(channel),
                inbound: Arc::new(MemoryStagingStore::new()),
                outbound: Arc::new(MemoryStagingStore::new()),
                allocator: Arc::new(MemorySequenceAllocator::new()),
                transform: transform_for(PartnerKind::Visa, Vec::new(), ledger.clone()),
                ledger,
            },
        )
    }

    /// 傳送時可以卡住的通道，用來觸發逾時
    #[derive(Clone)]
    struct StallingChannel {
        inner: MemoryChannel,
        stalled: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RemoteChannel for StallingChannel {
        async fn list(&self, mailbox: &str) -> Result<Vec<String>> {
            self.inner.list(mailbox).await
        }

        async fn fetch(&self, mailbox: &str, name: &str) -> Result<Vec<u8>> {
            self.inner.fetch(mailbox, name).await
        }

        async fn send(&self, mailbox: &str, name: &str, content: &[u8]) -> Result<()> {
            if self.stalled.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            self.inner.send(mailbox, name, content).await
        }
    }

    /// 跨多次 tick 共用的持久狀態
    struct SharedState {
        channel: StallingChannel,
        inbound: MemoryStagingStore,
        outbound: MemoryStagingStore,
        allocator: MemorySequenceAllocator,
        ledger: MemoryLedger,
    }

    impl SharedState {
        fn job(&self, timeout: Duration) -> ExchangeJob {
            let ledger: Arc<dyn DomesticLedger> = Arc::new(self.ledger.clone());
            let mut settings = ExchangeSettings::new("visa");
            settings.resend_unsent = true;
            let mut job = ExchangeJob::new(Some(timeout));
            job.add_cycle(ExchangeCycle::new(
                settings,
                ExchangePorts {
                    channel: Arc::new(self.channel.clone()),
                    inbound: Arc::new(self.inbound.clone()),
                    outbound: Arc::new(self.outbound.clone()),
                    allocator: Arc::new(self.allocator.clone()),
                    transform: transform_for(PartnerKind::Visa, Vec::new(), ledger.clone()),
                    ledger,
                },
            ));
            job
        }
    }

    #[tokio::test]
    async fn test_timed_out_cycle_is_cancelled_and_rerun_is_idempotent() {
        let remote = MemoryChannel::new();
        remote.drop_file("outbox", "ACK_001.txt", b"H;VISA;0000000\nD;R0;ACCEPTED\nT;1\n");
        let state = SharedState {
            channel: StallingChannel {
                inner: remote.clone(),
                stalled: Arc::new(AtomicBool::new(true)),
            },
            inbound: MemoryStagingStore::new(),
            outbound: MemoryStagingStore::new(),
            allocator: MemorySequenceAllocator::new(),
            ledger: MemoryLedger::new().with_records(vec![Record::new("R0"), Record::new("R1")]),
        };

        // 第一次 tick 卡在傳送，被逾時取消
        let cancelled = state
            .job(Duration::from_millis(200))
            .run(JobInvocation::new("tick-1"))
            .await;
        let visa = cancelled.partner("visa").unwrap();
        assert!(visa.report.is_none());
        assert!(matches!(
            visa.error,
            Some(ExchangeError::Cancelled { ref partner_key, .. }) if partner_key == "visa"
        ));
        let staged = state.outbound.list_pending().await.unwrap();
        assert_eq!(staged.len(), 1);
        assert!(remote.files("inbox").is_empty());
        assert_eq!(state.allocator.current("visa").await.unwrap(), 1);
        assert_eq!(state.ledger.responses().len(), 1);

        // 重跑：不重複套用、不重新配號，只補送已確認的批次
        state.channel.stalled.store(false, Ordering::SeqCst);
        let rerun = state
            .job(Duration::from_secs(5))
            .run(JobInvocation::new("tick-2"))
            .await;
        assert!(rerun.is_success(), "errors: {:?}", rerun.errors().collect::<Vec<_>>());

        let report = rerun.partner("visa").unwrap().report.as_ref().unwrap();
        assert_eq!(report.ingest.handled, 0);
        assert_eq!(report.process.handled, 0);
        assert_eq!(report.emit.resent, staged);
        assert!(report.emit.marker_only);
        assert_eq!(remote.files("inbox"), staged);
        assert_eq!(state.allocator.current("visa").await.unwrap(), 1);
        assert_eq!(state.ledger.responses().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_partner_does_not_affect_others() {
        let offline = MemoryChannel::new();
        offline.set_offline(true);

        let mut job = ExchangeJob::new(Some(Duration::from_secs(5)));
        job.add_cycle(memory_cycle("visa", MemoryChannel::new()));
        job.add_cycle(memory_cycle("amex", offline));

        let outcome = job.run(JobInvocation::new("job-1")).await;

        assert!(!outcome.is_success());
        assert!(outcome.partner("visa").unwrap().is_success());
        let amex = outcome.partner("amex").unwrap();
        assert!(amex.report.as_ref().unwrap().ingest.error.is_some());
        assert!(matches!(
            amex.error,
            Some(ExchangeError::StageFailures { .. })
        ));
    }

    #[tokio::test]
    async fn test_payload_is_returned_unchanged() {
        let mut job = ExchangeJob::new(None);
        job.add_cycle(memory_cycle("visa", MemoryChannel::new()));

        let mut invocation = JobInvocation::new("job-2");
        invocation
            .payload
            .insert(LEGACY_WAITING_FLAG.to_string(), "true".to_string());

        let outcome = job.run(invocation.clone()).await;
        assert_eq!(outcome.payload, invocation.payload);
        assert_eq!(outcome.job_id, "job-2");
        assert!(outcome.is_success());
    }
}
