use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Remote channel unavailable during {operation}: {message}")]
    ChannelUnavailable { operation: String, message: String },

    #[error("File not found: {name}")]
    NotFound { name: String },

    #[error("Staging store unavailable during {operation}: {message}")]
    StorageUnavailable { operation: String, message: String },

    #[error("Sequence allocator unavailable for partner '{partner_key}': {message}")]
    AllocatorUnavailable { partner_key: String, message: String },

    #[error("Sequence rollback rejected for partner '{partner_key}': {reason}")]
    ClaimRejected { partner_key: String, reason: String },

    #[error("File transform failed for '{name}': {message}")]
    TransformFailed { name: String, message: String },

    #[error("Transmission of '{name}' failed: {message}")]
    TransmissionFailed { name: String, message: String },

    #[error("Exchange cycle for partner '{partner_key}' cancelled: {reason}")]
    Cancelled { partner_key: String, reason: String },

    #[error("Exchange cycle for partner '{partner_key}' finished with failed stages: {}", failures.join("; "))]
    StageFailures {
        partner_key: String,
        failures: Vec<String>,
    },

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Configuration validation failed for '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 網路或儲存暫時不可用，下一次排程會自動重試
    Transient,
    /// 夥伴檔案內容無法套用
    Apply,
    Allocator,
    Transmission,
    Configuration,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ExchangeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ExchangeError::ChannelUnavailable { .. }
            | ExchangeError::StorageUnavailable { .. }
            | ExchangeError::HttpError(_)
            | ExchangeError::Cancelled { .. } => ErrorCategory::Transient,
            ExchangeError::NotFound { .. }
            | ExchangeError::TransformFailed { .. }
            | ExchangeError::CsvError(_) => ErrorCategory::Apply,
            ExchangeError::AllocatorUnavailable { .. } | ExchangeError::ClaimRejected { .. } => {
                ErrorCategory::Allocator
            }
            ExchangeError::TransmissionFailed { .. } => ErrorCategory::Transmission,
            ExchangeError::ConfigError { .. }
            | ExchangeError::ConfigValidationError { .. }
            | ExchangeError::InvalidConfigValueError { .. }
            | ExchangeError::MissingConfigError { .. } => ErrorCategory::Configuration,
            ExchangeError::IoError(_)
            | ExchangeError::SerializationError(_)
            | ExchangeError::StageFailures { .. } => ErrorCategory::System,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Transient => ErrorSeverity::Medium,
            ErrorCategory::Transmission => ErrorSeverity::Medium,
            ErrorCategory::Apply => ErrorSeverity::High,
            ErrorCategory::Allocator => ErrorSeverity::High,
            ErrorCategory::Configuration => ErrorSeverity::Critical,
            ErrorCategory::System => match self {
                ExchangeError::StageFailures { .. } => ErrorSeverity::High,
                _ => ErrorSeverity::Critical,
            },
        }
    }

    /// 暫時性錯誤：不在程序內重試，交由下一次排程
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::Transmission
        )
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            ExchangeError::ChannelUnavailable { .. } | ExchangeError::HttpError(_) => {
                "Check partner mailbox connectivity; the next scheduled tick will retry".to_string()
            }
            ExchangeError::StorageUnavailable { .. } => {
                "Check staging store availability; the next scheduled tick will retry".to_string()
            }
            ExchangeError::NotFound { name } => {
                format!("Verify that '{}' still exists in the partner mailbox", name)
            }
            ExchangeError::AllocatorUnavailable { partner_key, .. } => format!(
                "Check the sequence counter store for '{}'; no batch was built this tick",
                partner_key
            ),
            ExchangeError::ClaimRejected { partner_key, .. } => format!(
                "Inspect the sequence counter for '{}' before compensating manually",
                partner_key
            ),
            ExchangeError::TransformFailed { name, .. } => format!(
                "Inspect the staged file '{}'; mark it processed out-of-band if it can never be applied",
                name
            ),
            ExchangeError::CsvError(_) => {
                "Inspect the staged file; mark it processed out-of-band if it can never be applied"
                    .to_string()
            }
            ExchangeError::TransmissionFailed { name, .. } => format!(
                "Batch '{}' stays staged; enable resend_unsent or resend it manually",
                name
            ),
            ExchangeError::Cancelled { .. } => {
                "Increase job_timeout_seconds or investigate slow I/O".to_string()
            }
            ExchangeError::StageFailures { .. } => {
                "Review the stage errors above; each stage is retried on the next tick".to_string()
            }
            ExchangeError::ConfigError { .. }
            | ExchangeError::ConfigValidationError { .. }
            | ExchangeError::InvalidConfigValueError { .. }
            | ExchangeError::MissingConfigError { .. } => {
                "Fix the configuration file and run again".to_string()
            }
            ExchangeError::IoError(_) => "Check file permissions and disk space".to_string(),
            ExchangeError::SerializationError(_) => {
                "A persisted document is corrupt; restore it from backup".to_string()
            }
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Transient => format!("Temporary failure: {}", self),
            ErrorCategory::Apply => format!("Partner file could not be applied: {}", self),
            ErrorCategory::Allocator => format!("Sequence numbering problem: {}", self),
            ErrorCategory::Transmission => format!("Batch not transmitted: {}", self),
            ErrorCategory::Configuration => format!("Configuration problem: {}", self),
            ErrorCategory::System => format!("System error: {}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExchangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_errors_are_transient() {
        let err = ExchangeError::ChannelUnavailable {
            operation: "list".to_string(),
            message: "connection reset".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.is_transient());
        assert_eq!(err.severity(), ErrorSeverity::Medium);
    }

    #[test]
    fn test_allocator_errors_are_not_transient() {
        let err = ExchangeError::AllocatorUnavailable {
            partner_key: "amex".to_string(),
            message: "counter store offline".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Allocator);
        assert!(!err.is_transient());
        assert!(err.recovery_suggestion().contains("amex"));
    }

    #[test]
    fn test_stage_failures_message_lists_every_stage() {
        let err = ExchangeError::StageFailures {
            partner_key: "visa".to_string(),
            failures: vec!["ingest: offline".to_string(), "emit: offline".to_string()],
        };
        let message = err.to_string();
        assert!(message.contains("ingest: offline"));
        assert!(message.contains("emit: offline"));
        assert_eq!(err.severity(), ErrorSeverity::High);
    }

    #[test]
    fn test_transform_suggestion_names_the_file() {
        let err = ExchangeError::TransformFailed {
            name: "ACK_007.txt".to_string(),
            message: "bad trailer".to_string(),
        };
        assert!(err.recovery_suggestion().contains("'ACK_007.txt'"));
    }
}
