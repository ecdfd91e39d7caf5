use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::utils::error::ExchangeError;

/// 暫存檔案狀態，只能 Pending -> Processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Pending,
    Processed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub name: String,
    pub state: FileState,
}

/// 待送出的本地交易記錄
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// 以字串形式取出欄位值，缺少時回傳空字串
    pub fn field_text(&self, key: &str) -> String {
        match self.data.get(key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Unconsumed,
    Reserved,
    Consumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Accepted,
    Rejected,
}

/// 夥伴回覆檔中的單筆結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub record_id: String,
    pub status: ResponseStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartnerKind {
    Amex,
    MasterCard,
    Visa,
    FirstData,
}

impl PartnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartnerKind::Amex => "amex",
            PartnerKind::MasterCard => "mastercard",
            PartnerKind::Visa => "visa",
            PartnerKind::FirstData => "first_data",
        }
    }
}

impl fmt::Display for PartnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartnerKind {
    type Err = ExchangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "amex" => Ok(PartnerKind::Amex),
            "mastercard" | "master_card" => Ok(PartnerKind::MasterCard),
            "visa" => Ok(PartnerKind::Visa),
            "first_data" | "firstdata" | "fdc" => Ok(PartnerKind::FirstData),
            other => Err(ExchangeError::InvalidConfigValueError {
                field: "partners.kind".to_string(),
                value: other.to_string(),
                reason: "Expected one of amex, mastercard, visa, first_data".to_string(),
            }),
        }
    }
}

/// 不透明的配號憑證，只有最近一次未回收的配號可以 rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimToken(pub(crate) u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceClaim {
    pub partner_key: String,
    pub value: i64,
    pub token: ClaimToken,
}

/// 單一階段的執行結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub handled: usize,
    pub skipped: usize,
    pub failed: Vec<String>,
    pub error: Option<String>,
}

impl StageReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmitReport {
    pub batch_name: Option<String>,
    pub sequence: Option<i64>,
    pub records: usize,
    pub transmitted: bool,
    pub marker_only: bool,
    pub resent: Vec<String>,
    /// 未確認消耗記錄的孤兒批次，已標記 processed 且不會送出
    pub discarded: Vec<String>,
    pub error: Option<String>,
}

/// 一次交換週期（Ingest -> Process -> Emit）的摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub partner_key: String,
    pub started_at: DateTime<Utc>,
    pub ingest: StageReport,
    pub process: StageReport,
    pub emit: EmitReport,
    pub rollbacks: usize,
}

impl CycleReport {
    pub fn new(partner_key: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            partner_key: partner_key.to_string(),
            started_at,
            ingest: StageReport::default(),
            process: StageReport::default(),
            emit: EmitReport::default(),
            rollbacks: 0,
        }
    }

    pub fn failures(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if let Some(e) = &self.ingest.error {
            failures.push(format!("ingest: {}", e));
        }
        for name in &self.ingest.failed {
            failures.push(format!("ingest '{}' failed", name));
        }
        if let Some(e) = &self.process.error {
            failures.push(format!("process: {}", e));
        }
        for name in &self.process.failed {
            failures.push(format!("process '{}' failed", name));
        }
        if let Some(e) = &self.emit.error {
            failures.push(format!("emit: {}", e));
        }
        failures
    }

    pub fn is_success(&self) -> bool {
        self.failures().is_empty()
    }

    /// 將階段錯誤轉成呼叫端可見的錯誤，不吞掉任何失敗
    pub fn into_result(self) -> crate::utils::error::Result<CycleReport> {
        let failures = self.failures();
        if failures.is_empty() {
            Ok(self)
        } else {
            Err(ExchangeError::StageFailures {
                partner_key: self.partner_key,
                failures,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partner_kind_parsing() {
        assert_eq!("AMEX".parse::<PartnerKind>().unwrap(), PartnerKind::Amex);
        assert_eq!("fdc".parse::<PartnerKind>().unwrap(), PartnerKind::FirstData);
        assert_eq!(
            "mastercard".parse::<PartnerKind>().unwrap(),
            PartnerKind::MasterCard
        );
        assert!("discover".parse::<PartnerKind>().is_err());
    }

    #[test]
    fn test_record_field_text() {
        let record = Record::new("R1")
            .with_field("amount", 1250)
            .with_field("currency", "USD");
        assert_eq!(record.field_text("amount"), "1250");
        assert_eq!(record.field_text("currency"), "USD");
        assert_eq!(record.field_text("missing"), "");
    }

    #[test]
    fn test_cycle_report_into_result() {
        let mut report = CycleReport::new("visa", Utc::now());
        assert!(report.clone().into_result().is_ok());

        report.process.failed.push("ACK_001.txt".to_string());
        let err = report.into_result().unwrap_err();
        assert!(err.to_string().contains("ACK_001.txt"));
    }
}
