use anyhow::Result;
use partner_exchange::adapters::JsonLedger;
use partner_exchange::core::job::{build_local_job, plan_local, JobInvocation};
use partner_exchange::domain::model::Record;
use partner_exchange::{ExchangeConfig, ExchangeError, LocalStorage};
use std::path::Path;
use tempfile::TempDir;

fn write_config(root: &Path) -> Result<ExchangeConfig> {
    let toml = format!(
        r#"
[exchange]
name = "nightly-settlement"
staging_root = '{root}/staging'
sequence_dir = '{root}/sequences'
ledger_dir = '{root}/ledger'
job_timeout_seconds = 30

[[partners]]
key = "amex"
kind = "amex"
batch_prefix = "AMEX"

[partners.channel]
type = "local"
root = '{root}/mailbox/amex'
inbound_pattern = "^ACK_.*$"

[[partners]]
key = "fdc"
kind = "first_data"

[partners.channel]
type = "local"
root = '{root}/mailbox/fdc'
outbox = "out"
inbox = "in"

[[partners]]
key = "visa"
kind = "visa"
enabled = false

[partners.channel]
type = "http"
endpoint = "https://mailbox.example.com/visa"
"#,
        root = root.display()
    );
    let path = root.join("exchange.toml");
    std::fs::write(&path, toml)?;

    let config = ExchangeConfig::from_file(&path)?;
    config.validate_config()?;
    Ok(config)
}

fn drop_remote(root: &Path, partner: &str, mailbox: &str, name: &str, content: &str) -> Result<()> {
    let dir = root.join("mailbox").join(partner).join(mailbox);
    std::fs::create_dir_all(&dir)?;
    std::fs::write(dir.join(name), content)?;
    Ok(())
}

async fn enqueue(root: &Path, partner: &str, records: Vec<Record>) -> Result<()> {
    let ledger = JsonLedger::new(
        LocalStorage::new(root.join("ledger").to_string_lossy().to_string()),
        format!("{}.ledger.json", partner),
    );
    ledger.enqueue(records).await?;
    Ok(())
}

#[tokio::test]
async fn test_job_runs_every_enabled_partner() -> Result<()> {
    let dir = TempDir::new()?;
    let root = dir.path();
    let config = write_config(root)?;

    enqueue(root, "amex", vec![Record::new("A1").with_field("amount", 500)]).await?;
    drop_remote(root, "fdc", "out", "RESP_1.txt", "H\tFIRST_DATA\nT\t0\n")?;

    let job = build_local_job(&config, &[])?;
    assert_eq!(job.partner_keys(), vec!["amex".to_string(), "fdc".to_string()]);

    let outcome = job.run(JobInvocation::new("nightly-1")).await;
    assert!(outcome.is_success(), "errors: {:?}", outcome.errors().collect::<Vec<_>>());

    let amex = outcome.partner("amex").unwrap().report.as_ref().unwrap();
    let batch = amex.emit.batch_name.clone().unwrap();
    assert!(batch.starts_with("AMEX_") && batch.ends_with("_1.txt"));
    let sent = std::fs::read_to_string(root.join("mailbox/amex/inbox").join(&batch))?;
    assert!(sent.starts_with("H|AMEX|0000001|"));
    assert!(sent.contains("D|A1|500||"));

    let fdc = outcome.partner("fdc").unwrap().report.as_ref().unwrap();
    assert_eq!(fdc.ingest.handled, 1);
    assert_eq!(fdc.process.handled, 1);
    assert!(fdc.emit.marker_only);
    assert!(root.join("staging/fdc/inbound/.processed/RESP_1.txt").exists());
    Ok(())
}

#[tokio::test]
async fn test_inbound_pattern_filters_remote_files() -> Result<()> {
    let dir = TempDir::new()?;
    let root = dir.path();
    let config = write_config(root)?;

    drop_remote(root, "amex", "outbox", "ACK_1.txt", "")?;
    drop_remote(root, "amex", "outbox", "README.md", "not a response")?;

    let job = build_local_job(&config, &["amex".to_string()])?;
    let outcome = job.run(JobInvocation::new("nightly-2")).await;

    let report = outcome.partner("amex").unwrap().report.as_ref().unwrap();
    assert_eq!(report.ingest.handled, 1);
    assert!(root.join("staging/amex/inbound/ACK_1.txt").exists());
    assert!(!root.join("staging/amex/inbound/README.md").exists());
    Ok(())
}

#[tokio::test]
async fn test_dry_run_plan_changes_nothing() -> Result<()> {
    let dir = TempDir::new()?;
    let root = dir.path();
    let config = write_config(root)?;

    drop_remote(root, "fdc", "out", "RESP_9.txt", "H\tFIRST_DATA\n")?;
    // 先前送出的批次留在 inbox，不屬於待收檔案
    drop_remote(root, "fdc", "in", "FDC_240601_080000_3.txt", "H\tFDC\n")?;

    let plans = plan_local(&config, &["fdc".to_string()]).await?;

    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].partner_key, "fdc");
    assert_eq!(plans[0].remote_outbox, vec!["RESP_9.txt".to_string()]);
    assert!(plans[0].pending_inbound.is_empty());
    assert_eq!(plans[0].current_sequence, 0);
    assert!(!root.join("staging").exists());
    assert!(!root.join("sequences").exists());
    Ok(())
}

#[tokio::test]
async fn test_unknown_partner_selection_is_config_error() -> Result<()> {
    let dir = TempDir::new()?;
    let config = write_config(dir.path())?;

    let err = build_local_job(&config, &["discover".to_string()]).err().unwrap();
    assert!(matches!(err, ExchangeError::ConfigError { .. }));
    Ok(())
}
