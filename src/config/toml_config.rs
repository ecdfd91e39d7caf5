use crate::core::exchange::{
    ApplyFailureAction, CompensationPolicy, ExchangeSettings, SendFailureAction,
};
use crate::domain::model::PartnerKind;
use crate::utils::error::{ExchangeError, Result};
use crate::utils::validation::{self, Validate};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub exchange: ExchangeSection,
    pub partners: Vec<PartnerConfig>,
    pub monitoring: Option<MonitoringConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeSection {
    pub name: String,
    pub description: Option<String>,
    pub staging_root: String,
    pub sequence_dir: String,
    pub ledger_dir: String,
    pub job_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerConfig {
    pub key: String,
    pub kind: String,
    pub enabled: Option<bool>,
    pub batch_prefix: Option<String>,
    pub resend_unsent: Option<bool>,
    pub fields: Option<Vec<String>>, // 送出批次的明細欄位
    pub channel: ChannelConfig,
    pub compensation: Option<CompensationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub r#type: String, // "local" 或 "http"
    pub root: Option<String>,
    pub endpoint: Option<String>,
    pub outbox: Option<String>,
    pub inbox: Option<String>,
    pub inbound_pattern: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub headers: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationConfig {
    pub on_apply_failure: Option<String>, // "rollback" 或 "none"
    pub on_send_failure: Option<String>,  // "keep" 或 "rollback"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub log_level: Option<String>,
}

impl ExchangeConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(ExchangeError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        // 處理環境變數替換
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| ExchangeError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${MAILBOX_TOKEN})
    fn substitute_env_vars(content: &str) -> Result<String> {
        use regex::Regex;
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| ExchangeError::ConfigError {
            message: format!("Invalid substitution pattern: {}", e),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    pub fn validate_config(&self) -> Result<()> {
        validation::validate_non_empty_string("exchange.name", &self.exchange.name)?;
        validation::validate_path("exchange.staging_root", &self.exchange.staging_root)?;
        validation::validate_path("exchange.sequence_dir", &self.exchange.sequence_dir)?;
        validation::validate_path("exchange.ledger_dir", &self.exchange.ledger_dir)?;
        if let Some(timeout) = self.exchange.job_timeout_seconds {
            validation::validate_positive_number(
                "exchange.job_timeout_seconds",
                timeout as usize,
                1,
            )?;
        }

        if self.partners.is_empty() {
            return Err(ExchangeError::MissingConfigError {
                field: "partners".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for partner in &self.partners {
            if !seen.insert(partner.key.as_str()) {
                return Err(ExchangeError::ConfigValidationError {
                    field: "partners.key".to_string(),
                    message: format!("Duplicate partner key '{}'", partner.key),
                });
            }
            partner.validate()?;
        }

        Ok(())
    }

    /// 啟用中的夥伴；`only` 非空時只保留列出的 key
    pub fn enabled_partners(&self, only: &[String]) -> Vec<&PartnerConfig> {
        self.partners
            .iter()
            .filter(|p| p.enabled.unwrap_or(true))
            .filter(|p| only.is_empty() || only.contains(&p.key))
            .collect()
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.exchange.job_timeout_seconds.map(Duration::from_secs)
    }

    pub fn monitoring_enabled(&self) -> bool {
        self.monitoring.as_ref().map(|m| m.enabled).unwrap_or(false)
    }
}

impl PartnerConfig {
    pub fn partner_kind(&self) -> Result<PartnerKind> {
        self.kind.parse()
    }

    pub fn compensation_policy(&self) -> Result<CompensationPolicy> {
        let mut policy = CompensationPolicy::default();
        let Some(config) = &self.compensation else {
            return Ok(policy);
        };

        if let Some(action) = &config.on_apply_failure {
            policy.on_apply_failure = match action.as_str() {
                "rollback" => ApplyFailureAction::RollbackSequence,
                "none" => ApplyFailureAction::LeavePending,
                other => {
                    return Err(ExchangeError::InvalidConfigValueError {
                        field: format!("partners.{}.compensation.on_apply_failure", self.key),
                        value: other.to_string(),
                        reason: "Expected 'rollback' or 'none'".to_string(),
                    })
                }
            };
        }

        if let Some(action) = &config.on_send_failure {
            policy.on_send_failure = match action.as_str() {
                "keep" => SendFailureAction::KeepStaged,
                "rollback" => SendFailureAction::RollbackSequence,
                other => {
                    return Err(ExchangeError::InvalidConfigValueError {
                        field: format!("partners.{}.compensation.on_send_failure", self.key),
                        value: other.to_string(),
                        reason: "Expected 'keep' or 'rollback'".to_string(),
                    })
                }
            };
        }

        Ok(policy)
    }

    pub fn settings(&self) -> Result<ExchangeSettings> {
        let mut settings = ExchangeSettings::new(&self.key);
        if let Some(outbox) = &self.channel.outbox {
            settings.outbox = outbox.clone();
        }
        if let Some(inbox) = &self.channel.inbox {
            settings.inbox = inbox.clone();
        }
        if let Some(prefix) = &self.batch_prefix {
            settings.batch_prefix = prefix.clone();
        }
        settings.compensation = self.compensation_policy()?;
        settings.resend_unsent = self.resend_unsent.unwrap_or(false);
        Ok(settings)
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_secs(self.channel.timeout_seconds.unwrap_or(30))
    }
}

impl Validate for PartnerConfig {
    fn validate(&self) -> Result<()> {
        let field = |name: &str| format!("partners.{}.{}", self.key, name);

        validation::validate_partner_key("partners.key", &self.key)?;
        self.partner_kind()?;
        self.compensation_policy()?;
        if let Some(prefix) = &self.batch_prefix {
            validation::validate_partner_key(&field("batch_prefix"), prefix)?;
        }

        match self.channel.r#type.as_str() {
            "local" => {
                let root = validation::validate_required_field(&field("channel.root"), &self.channel.root)?;
                validation::validate_path(&field("channel.root"), root)?;
            }
            "http" => {
                let endpoint = validation::validate_required_field(
                    &field("channel.endpoint"),
                    &self.channel.endpoint,
                )?;
                validation::validate_url(&field("channel.endpoint"), endpoint)?;
            }
            other => {
                return Err(ExchangeError::InvalidConfigValueError {
                    field: field("channel.type"),
                    value: other.to_string(),
                    reason: "Supported channel types: local, http".to_string(),
                })
            }
        }

        if let Some(pattern) = &self.channel.inbound_pattern {
            validation::validate_regex(&field("channel.inbound_pattern"), pattern)?;
        }
        if let Some(timeout) = self.channel.timeout_seconds {
            validation::validate_range(&field("channel.timeout_seconds"), timeout, 1, 3600)?;
        }

        Ok(())
    }
}

impl Validate for ExchangeConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const BASIC: &str = r#"
[exchange]
name = "card-reconciliation"
staging_root = "./staging"
sequence_dir = "./sequences"
ledger_dir = "./ledger"
job_timeout_seconds = 120

[[partners]]
key = "amex"
kind = "amex"
batch_prefix = "AMEX_SETTLE"

[partners.channel]
type = "local"
root = "./mailbox/amex"
inbound_pattern = "^ACK_.*\\.txt$"

[[partners]]
key = "visa"
kind = "visa"
enabled = false

[partners.channel]
type = "http"
endpoint = "https://mailbox.example.com/visa"
timeout_seconds = 10

[partners.compensation]
on_apply_failure = "none"
on_send_failure = "rollback"
"#;

    #[test]
    fn test_parse_basic_exchange_config() {
        let config = ExchangeConfig::from_toml_str(BASIC).unwrap();

        assert_eq!(config.exchange.name, "card-reconciliation");
        assert_eq!(config.partners.len(), 2);
        assert_eq!(config.job_timeout(), Some(Duration::from_secs(120)));
        assert!(config.validate().is_ok());

        let enabled = config.enabled_partners(&[]);
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].key, "amex");
    }

    #[test]
    fn test_partner_settings_and_compensation() {
        let config = ExchangeConfig::from_toml_str(BASIC).unwrap();

        let amex = config.partners[0].settings().unwrap();
        assert_eq!(amex.batch_prefix, "AMEX_SETTLE");
        assert_eq!(amex.outbox, "outbox");
        assert_eq!(amex.compensation, CompensationPolicy::default());

        let visa = config.partners[1].settings().unwrap();
        assert_eq!(visa.batch_prefix, "batch");
        assert_eq!(
            visa.compensation.on_apply_failure,
            ApplyFailureAction::LeavePending
        );
        assert_eq!(
            visa.compensation.on_send_failure,
            SendFailureAction::RollbackSequence
        );
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("TEST_MAILBOX_ENDPOINT", "https://mailbox.test");

        let toml_content = r#"
[exchange]
name = "env"
staging_root = "./staging"
sequence_dir = "./sequences"
ledger_dir = "./ledger"

[[partners]]
key = "mc"
kind = "mastercard"

[partners.channel]
type = "http"
endpoint = "${TEST_MAILBOX_ENDPOINT}"
"#;

        let config = ExchangeConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(
            config.partners[0].channel.endpoint.as_deref(),
            Some("https://mailbox.test")
        );

        std::env::remove_var("TEST_MAILBOX_ENDPOINT");
    }

    #[test]
    fn test_validation_failures() {
        let duplicate = BASIC.replace("key = \"visa\"", "key = \"amex\"");
        assert!(ExchangeConfig::from_toml_str(&duplicate)
            .unwrap()
            .validate()
            .is_err());

        let bad_kind = BASIC.replace("kind = \"visa\"", "kind = \"discover\"");
        assert!(ExchangeConfig::from_toml_str(&bad_kind)
            .unwrap()
            .validate()
            .is_err());

        let bad_url = BASIC.replace("https://mailbox.example.com/visa", "not-a-url");
        assert!(ExchangeConfig::from_toml_str(&bad_url)
            .unwrap()
            .validate()
            .is_err());

        let bad_pattern = BASIC.replace("^ACK_.*\\\\.txt$", "([unclosed");
        assert!(ExchangeConfig::from_toml_str(&bad_pattern)
            .unwrap()
            .validate()
            .is_err());
    }

    #[test]
    fn test_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(BASIC.as_bytes()).unwrap();

        let config = ExchangeConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.partners[0].key, "amex");
    }

    #[test]
    fn test_bundled_example_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/exchange.toml");
        let config = ExchangeConfig::from_file(path).unwrap();
        assert!(config.validate().is_ok());

        let enabled: Vec<&str> = config
            .enabled_partners(&[])
            .iter()
            .map(|p| p.key.as_str())
            .collect();
        assert_eq!(enabled, vec!["amex", "mastercard"]);
        assert!(config.partners[1].resend_unsent.unwrap_or(false));
    }
}
