use clap::Parser;
use partner_exchange::core::job::{build_local_job, plan_local, JobInvocation};
use partner_exchange::utils::error::{ErrorSeverity, ExchangeError};
use partner_exchange::utils::{logger, validation::Validate};
use partner_exchange::{CliConfig, ExchangeConfig};

fn exit_code(e: &ExchangeError) -> i32 {
    match e.severity() {
        ErrorSeverity::Low => 0,      // 警告，但成功
        ErrorSeverity::Medium => 2,   // 下一個 tick 會重試
        ErrorSeverity::High => 1,     // 需要人工處理
        ErrorSeverity::Critical => 3, // 設定或系統錯誤
    }
}

fn fail(e: &ExchangeError) -> ! {
    tracing::error!(
        "❌ {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());
    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 建議: {}", e.recovery_suggestion());
    std::process::exit(exit_code(e).max(1));
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliConfig::parse();
    logger::init_cli_logger(cli.verbose);

    tracing::info!("Starting partner-exchange tick");
    if cli.verbose {
        tracing::debug!("CLI config: {:?}", cli);
    }

    if let Err(e) = cli.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        fail(&e);
    }

    let config = match ExchangeConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => fail(&e),
    };
    if let Err(e) = config.validate_config() {
        fail(&e);
    }

    if cli.dry_run {
        let plans = match plan_local(&config, &cli.partners).await {
            Ok(plans) => plans,
            Err(e) => fail(&e),
        };
        for plan in plans {
            println!("🔍 {}", plan.partner_key);
            println!("   current sequence : {}", plan.current_sequence);
            println!("   remote outbox    : {:?}", plan.remote_outbox);
            println!("   pending inbound  : {:?}", plan.pending_inbound);
            println!("   pending outbound : {:?}", plan.pending_outbound);
        }
        return Ok(());
    }

    let monitor_enabled = cli.monitor || config.monitoring_enabled();
    if monitor_enabled {
        tracing::info!("🔍 System monitoring enabled");
    }

    let job = match build_local_job(&config, &cli.partners) {
        Ok(job) => job.with_monitoring(monitor_enabled),
        Err(e) => fail(&e),
    };

    let outcome = job.run(JobInvocation::new(cli.job_id())).await;

    for partner in &outcome.partners {
        match (&partner.report, &partner.error) {
            (Some(report), None) => {
                println!(
                    "✅ {}: ingested {}, processed {}, emitted {}",
                    partner.partner_key,
                    report.ingest.handled,
                    report.process.handled,
                    report.emit.batch_name.as_deref().unwrap_or("-")
                );
            }
            (_, Some(e)) => {
                eprintln!("❌ {}: {}", partner.partner_key, e.user_friendly_message());
                eprintln!("💡 建議: {}", e.recovery_suggestion());
            }
            (None, None) => {}
        }
    }

    // 取最嚴重的錯誤決定退出碼
    let worst = outcome.errors().map(exit_code).max().unwrap_or(0);
    if worst > 0 {
        std::process::exit(worst);
    }

    tracing::info!("✅ Exchange tick {} completed", outcome.job_id);
    Ok(())
}
