//! Per-partner delimited file formats.
//!
//! Every partner uses the same `H` / `D` / `T` row layout; only the delimiter differs.
//! Outbound detail rows carry the record id followed by the configured fields. Inbound
//! response rows are `D,<record id>,<ACCEPTED|REJECTED>[,<reason>]`.

use crate::domain::model::{PartnerKind, Record, ResponseRecord, ResponseStatus};
use crate::domain::ports::{DomesticLedger, FileTransform};
use crate::utils::error::{ExchangeError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartnerFormat {
    pub kind: PartnerKind,
    pub delimiter: u8,
    pub fields: Vec<String>,
}

impl PartnerFormat {
    pub fn for_partner(kind: PartnerKind) -> Self {
        let delimiter = match kind {
            PartnerKind::Amex => b'|',
            PartnerKind::MasterCard => b',',
            PartnerKind::Visa => b';',
            PartnerKind::FirstData => b'\t',
        };
        Self {
            kind,
            delimiter,
            fields: default_fields(),
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        if !fields.is_empty() {
            self.fields = fields;
        }
        self
    }
}

fn default_fields() -> Vec<String> {
    ["amount", "currency", "reference"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub struct DelimitedTransform {
    format: PartnerFormat,
    ledger: Arc<dyn DomesticLedger>,
}

impl DelimitedTransform {
    pub fn new(format: PartnerFormat, ledger: Arc<dyn DomesticLedger>) -> Self {
        Self { format, ledger }
    }

    /// 解析回覆檔；格式不符時回傳 None
    pub fn parse_responses(&self, content: &[u8]) -> Option<Vec<ResponseRecord>> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.format.delimiter)
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(content);

        let mut responses = Vec::new();
        for row in reader.records() {
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    tracing::debug!("Unparseable {} row: {}", self.format.kind, e);
                    return None;
                }
            };
            match row.get(0) {
                Some("H") | Some("T") => continue,
                Some("") | None if row.len() <= 1 => continue,
                Some("D") => {}
                _ => return None,
            }

            let record_id = row.get(1).filter(|id| !id.is_empty())?.to_string();
            let status = match row.get(2)?.to_ascii_uppercase().as_str() {
                "ACCEPTED" => ResponseStatus::Accepted,
                "REJECTED" => ResponseStatus::Rejected,
                _ => return None,
            };
            let reason = row
                .get(3)
                .filter(|r| !r.is_empty())
                .map(|r| r.to_string());

            responses.push(ResponseRecord {
                record_id,
                status,
                reason,
            });
        }
        Some(responses)
    }
}

#[async_trait]
impl FileTransform for DelimitedTransform {
    fn partner(&self) -> PartnerKind {
        self.format.kind
    }

    async fn apply(&self, content: &[u8]) -> Result<bool> {
        let Some(responses) = self.parse_responses(content) else {
            tracing::warn!("⚠️ Malformed {} response file", self.format.kind);
            return Ok(false);
        };

        for response in &responses {
            match self.ledger.apply_response(response).await {
                Ok(()) => {}
                Err(ExchangeError::NotFound { name }) => {
                    tracing::warn!(
                        "⚠️ {} response references unknown record {}",
                        self.format.kind,
                        name
                    );
                    return Ok(false);
                }
                Err(e) => return Err(e),
            }
        }

        tracing::debug!("Applied {} {} responses", responses.len(), self.format.kind);
        Ok(true)
    }

    async fn build(&self, records: &[Record], seq: i64, at: DateTime<Utc>) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.format.delimiter)
            .flexible(true)
            .from_writer(Vec::new());

        let partner = self.format.kind.as_str().to_ascii_uppercase();
        let seq_text = format!("{:07}", seq);
        let created = at.format("%Y%m%d%H%M%S").to_string();
        writer.write_record(["H", partner.as_str(), seq_text.as_str(), created.as_str()])?;

        for record in records {
            let mut row = vec!["D".to_string(), record.id.clone()];
            row.extend(self.format.fields.iter().map(|f| record.field_text(f)));
            writer.write_record(&row)?;
        }

        writer.write_record(["T", records.len().to_string().as_str()])?;

        writer.into_inner().map_err(|e| ExchangeError::TransformFailed {
            name: format!("{} batch {}", partner, seq),
            message: e.to_string(),
        })
    }
}

/// 依設定的夥伴種類建立對應的轉換器
pub fn transform_for(
    kind: PartnerKind,
    fields: Vec<String>,
    ledger: Arc<dyn DomesticLedger>,
) -> Arc<dyn FileTransform> {
    Arc::new(DelimitedTransform::new(
        PartnerFormat::for_partner(kind).with_fields(fields),
        ledger,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryLedger;
    use chrono::TimeZone;

    fn transform(kind: PartnerKind, ledger: MemoryLedger) -> DelimitedTransform {
        DelimitedTransform::new(PartnerFormat::for_partner(kind), Arc::new(ledger))
    }

    #[tokio::test]
    async fn test_build_amex_batch() {
        let t = transform(PartnerKind::Amex, MemoryLedger::new());
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap();
        let records = vec![
            Record::new("R1").with_field("amount", 1250).with_field("currency", "USD"),
            Record::new("R2").with_field("amount", 99).with_field("reference", "INV-7"),
        ];

        let bytes = t.build(&records, 42, at).await.unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "H|AMEX|0000042|20240305143000");
        assert_eq!(lines[1], "D|R1|1250|USD|");
        assert_eq!(lines[2], "D|R2|99||INV-7");
        assert_eq!(lines[3], "T|2");
    }

    #[test]
    fn test_transform_for_reports_configured_partner() {
        let ledger: Arc<dyn DomesticLedger> = Arc::new(MemoryLedger::new());
        for kind in [PartnerKind::Amex, PartnerKind::FirstData] {
            assert_eq!(transform_for(kind, Vec::new(), ledger.clone()).partner(), kind);
        }
    }

    #[tokio::test]
    async fn test_build_empty_marker_has_header_and_trailer() {
        let t = transform(PartnerKind::Visa, MemoryLedger::new());
        let bytes = t.build(&[], 7, Utc::now()).await.unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("H;VISA;0000007;"));
        assert!(text.trim_end().ends_with("T;0"));
    }

    #[tokio::test]
    async fn test_apply_accepts_known_records() {
        let ledger = MemoryLedger::new().with_records(vec![Record::new("R1"), Record::new("R2")]);
        let t = transform(PartnerKind::MasterCard, ledger.clone());

        let content = b"H,MASTERCARD,0000042\nD,R1,ACCEPTED\nD,R2,REJECTED,insufficient data\nT,2\n";
        assert!(t.apply(content).await.unwrap());

        let responses = ledger.responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1].status, ResponseStatus::Rejected);
        assert_eq!(responses[1].reason.as_deref(), Some("insufficient data"));
    }

    #[tokio::test]
    async fn test_apply_rejects_malformed_content() {
        let ledger = MemoryLedger::new().with_records(vec![Record::new("R1")]);
        let t = transform(PartnerKind::FirstData, ledger.clone());

        assert!(!t.apply(b"D\tR1\tMAYBE\n").await.unwrap());
        assert!(!t.apply(b"X\tgarbage\n").await.unwrap());
        assert!(!t.apply(b"D\tR404\tACCEPTED\n").await.unwrap());
        assert!(ledger.responses().is_empty());
    }
}
