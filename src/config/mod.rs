pub mod cli;
#[cfg(feature = "lambda")]
pub mod lambda;
pub mod toml_config;

#[cfg(feature = "cli")]
use clap::Parser;
use serde::{Deserialize, Serialize};

/// 每次執行就是一次排程 tick：讀設定、跑完所有夥伴、結束
#[cfg(feature = "cli")]
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(name = "partner-exchange")]
#[command(about = "Run one exchange tick against every configured card-network partner")]
pub struct CliConfig {
    #[arg(long, default_value = "configs/exchange.toml")]
    pub config: String,

    #[arg(long = "partner", help = "Only run the listed partner keys (repeatable)")]
    pub partners: Vec<String>,

    #[arg(long, help = "Job id used in logs; generated when omitted")]
    pub job_id: Option<String>,

    #[arg(long, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, help = "Log process CPU and memory around the tick")]
    pub monitor: bool,

    #[arg(long, help = "List remote files, pending inbound files and current sequences without changing anything")]
    pub dry_run: bool,
}

#[cfg(feature = "cli")]
impl CliConfig {
    pub fn job_id(&self) -> String {
        self.job_id
            .clone()
            .unwrap_or_else(|| format!("cli-{}", chrono::Utc::now().format("%Y%m%d%H%M%S")))
    }
}

#[cfg(feature = "cli")]
impl crate::utils::validation::Validate for CliConfig {
    fn validate(&self) -> crate::utils::error::Result<()> {
        use crate::utils::validation::*;

        validate_path("config", &self.config)?;
        for key in &self.partners {
            validate_partner_key("partner", key)?;
        }
        Ok(())
    }
}

/// Lambda 事件內容；payload 原樣回傳給排程器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub partners: Vec<String>,
    pub job_id: Option<String>,
    #[serde(default)]
    pub payload: std::collections::HashMap<String, String>,
}

#[cfg(all(test, feature = "cli"))]
mod tests {
    use super::*;
    use crate::utils::validation::Validate;

    #[test]
    fn test_cli_parsing() {
        let config = CliConfig::parse_from([
            "partner-exchange",
            "--config",
            "exchange.toml",
            "--partner",
            "amex",
            "--partner",
            "visa",
            "--dry-run",
        ]);
        assert_eq!(config.config, "exchange.toml");
        assert_eq!(config.partners, vec!["amex", "visa"]);
        assert!(config.dry_run);
        assert!(!config.verbose);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_job_id_default() {
        let config = CliConfig::parse_from(["partner-exchange", "--job-id", "tick-7"]);
        assert_eq!(config.job_id(), "tick-7");

        let config = CliConfig::parse_from(["partner-exchange"]);
        assert!(config.job_id().starts_with("cli-"));
    }

    #[test]
    fn test_invalid_partner_key_rejected() {
        let config = CliConfig::parse_from(["partner-exchange", "--partner", "../etc"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_job_request_defaults() {
        let request: JobRequest = serde_json::from_str(r#"{"job_id": "evt-1"}"#).unwrap();
        assert!(request.partners.is_empty());
        assert!(request.payload.is_empty());
        assert_eq!(request.job_id.as_deref(), Some("evt-1"));
    }
}
