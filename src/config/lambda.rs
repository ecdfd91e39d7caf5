use crate::adapters::staging::check_name;
use crate::adapters::{transform_for, JsonLedger};
use crate::config::toml_config::ExchangeConfig;
use crate::core::exchange::{ExchangeCycle, ExchangePorts};
use crate::core::job::{build_channel, ExchangeJob};
use crate::core::sequence::CounterState;
use crate::domain::model::{FileState, SequenceClaim};
use crate::domain::ports::{DomesticLedger, SequenceAllocator, StagingStore, Storage};
use crate::utils::error::{ExchangeError, Result};
use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use std::env;
use std::sync::Arc;

const PROCESSED_DIR: &str = ".processed";
const MAX_COUNTER_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct LambdaConfig {
    pub s3_bucket: String,
    pub s3_prefix: String,
    pub s3_region: String,
    pub config_key: String,
}

impl LambdaConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            s3_bucket: env::var("S3_BUCKET").map_err(|_| ExchangeError::MissingConfigError {
                field: "S3_BUCKET".to_string(),
            })?,
            s3_prefix: env::var("S3_PREFIX").unwrap_or_else(|_| "partner-exchange".to_string()),
            s3_region: env::var("S3_REGION").unwrap_or_else(|_| "ap-southeast-2".to_string()),
            config_key: env::var("EXCHANGE_CONFIG_KEY")
                .unwrap_or_else(|_| "partner-exchange/exchange.toml".to_string()),
        })
    }

    /// 夥伴在 bucket 內的根目錄
    pub fn partner_prefix(&self, partner_key: &str) -> String {
        format!("{}/{}", self.s3_prefix.trim_end_matches('/'), partner_key)
    }
}

impl crate::utils::validation::Validate for LambdaConfig {
    fn validate(&self) -> Result<()> {
        use crate::utils::validation::*;

        validate_s3_bucket_name("s3_bucket", &self.s3_bucket)?;
        validate_non_empty_string("s3_prefix", &self.s3_prefix)?;
        validate_aws_region("s3_region", &self.s3_region)?;
        validate_non_empty_string("config_key", &self.config_key)?;

        tracing::info!("✅ Lambda configuration validation passed");
        Ok(())
    }
}

fn validate_s3_bucket_name(field_name: &str, bucket_name: &str) -> Result<()> {
    let invalid = |reason: &str| ExchangeError::InvalidConfigValueError {
        field: field_name.to_string(),
        value: bucket_name.to_string(),
        reason: reason.to_string(),
    };

    if bucket_name.len() < 3 || bucket_name.len() > 63 {
        return Err(invalid("S3 bucket name must be between 3 and 63 characters"));
    }

    if !bucket_name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(invalid(
            "S3 bucket name can only contain lowercase letters, numbers, hyphens, and dots",
        ));
    }

    if bucket_name.starts_with('-') || bucket_name.ends_with('-') {
        return Err(invalid("S3 bucket name cannot start or end with a hyphen"));
    }

    Ok(())
}

fn validate_aws_region(field_name: &str, region: &str) -> Result<()> {
    crate::utils::validation::validate_non_empty_string(field_name, region)?;

    if !region
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ExchangeError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: region.to_string(),
            reason: "AWS region can only contain lowercase letters, numbers, and hyphens"
                .to_string(),
        });
    }

    Ok(())
}

fn s3_unavailable<E: std::error::Error>(operation: &str, err: E) -> ExchangeError {
    ExchangeError::StorageUnavailable {
        operation: operation.to_string(),
        message: DisplayErrorContext(err).to_string(),
    }
}

/// 帳本與設定檔使用的 blob 儲存
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: S3Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(client: S3Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

impl Storage for S3Storage {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Err(ExchangeError::NotFound {
                    name: path.to_string(),
                })
            }
            Err(e) => return Err(s3_unavailable("get_object", e)),
        };

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| s3_unavailable("get_object", e))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| s3_unavailable("put_object", e))?;
        Ok(())
    }
}

/// S3 前綴下的暫存區；處理完成的標記放在 `<prefix>/.processed/<name>`
#[derive(Debug, Clone)]
pub struct S3StagingStore {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3StagingStore {
    pub fn new(client: S3Client, bucket: String, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket,
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    fn content_key(&self, name: &str) -> Result<String> {
        check_name(name)?;
        Ok(format!("{}/{}", self.prefix, name))
    }

    fn marker_key(&self, name: &str) -> Result<String> {
        check_name(name)?;
        Ok(format!("{}/{}/{}", self.prefix, PROCESSED_DIR, name))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(s3_unavailable("head_object", e)),
        }
    }

    /// 直接位於前綴下的檔名（不含子目錄與隱藏檔）
    async fn list_names(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(format!("{}/", prefix))
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| s3_unavailable("list_objects_v2", e))?;

            for object in resp.contents() {
                let Some(key) = object.key() else { continue };
                let Some(name) = key.strip_prefix(&format!("{}/", prefix)) else {
                    continue;
                };
                if !name.is_empty() && !name.contains('/') && !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }

            match resp.next_continuation_token() {
                Some(next) if resp.is_truncated().unwrap_or(false) => token = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl StagingStore for S3StagingStore {
    async fn put(&self, name: &str, content: &[u8]) -> Result<()> {
        let key = self.content_key(name)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(content.to_vec()))
            .send()
            .await
            .map_err(|e| s3_unavailable("put", e))?;
        tracing::debug!("📦 Staged s3://{}/{} ({} bytes)", self.bucket, key, content.len());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        let key = self.content_key(name)?;
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Err(ExchangeError::NotFound {
                    name: name.to_string(),
                })
            }
            Err(e) => return Err(s3_unavailable("get", e)),
        };
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| s3_unavailable("get", e))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn list_pending(&self) -> Result<Vec<String>> {
        let processed = self
            .list_names(&format!("{}/{}", self.prefix, PROCESSED_DIR))
            .await?;
        let mut pending: Vec<String> = self
            .list_names(&self.prefix)
            .await?
            .into_iter()
            .filter(|name| !processed.contains(name))
            .collect();
        pending.sort();
        Ok(pending)
    }

    async fn mark_processed(&self, name: &str) -> Result<()> {
        if !self.exists(&self.content_key(name)?).await? {
            return Err(ExchangeError::NotFound {
                name: name.to_string(),
            });
        }
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.marker_key(name)?)
            .body(ByteStream::from(Vec::new()))
            .send()
            .await
            .map_err(|e| s3_unavailable("mark_processed", e))?;
        Ok(())
    }

    async fn state(&self, name: &str) -> Result<Option<FileState>> {
        if !self.exists(&self.content_key(name)?).await? {
            return Ok(None);
        }
        if self.exists(&self.marker_key(name)?).await? {
            Ok(Some(FileState::Processed))
        } else {
            Ok(Some(FileState::Pending))
        }
    }
}

/// 以條件式寫入（If-Match / If-None-Match）保護的計數器
#[derive(Debug, Clone)]
pub struct S3SequenceAllocator {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3SequenceAllocator {
    pub fn new(client: S3Client, bucket: String, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket,
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    fn counter_key(&self, partner_key: &str) -> String {
        format!("{}/{}.seq.json", self.prefix, partner_key)
    }

    fn unavailable(partner_key: &str, message: impl Into<String>) -> ExchangeError {
        ExchangeError::AllocatorUnavailable {
            partner_key: partner_key.to_string(),
            message: message.into(),
        }
    }

    async fn load(&self, partner_key: &str) -> Result<(CounterState, Option<String>)> {
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.counter_key(partner_key))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Ok((CounterState::new(partner_key), None))
            }
            Err(e) => {
                return Err(Self::unavailable(
                    partner_key,
                    DisplayErrorContext(e).to_string(),
                ))
            }
        };

        let etag = resp.e_tag().map(str::to_string);
        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| Self::unavailable(partner_key, e.to_string()))?;
        let state = serde_json::from_slice(&data.into_bytes())
            .map_err(|e| Self::unavailable(partner_key, format!("corrupt counter: {}", e)))?;
        Ok((state, etag))
    }

    /// 讀取 -> 修改 -> 條件式寫回；被其他寫入者搶先時重試
    async fn update<T: Send>(
        &self,
        partner_key: &str,
        apply: impl Fn(&mut CounterState) -> Result<T> + Send + Sync,
    ) -> Result<T> {
        for attempt in 1..=MAX_COUNTER_ATTEMPTS {
            let (mut state, etag) = self.load(partner_key).await?;
            let out = apply(&mut state)?;
            let body = serde_json::to_vec_pretty(&state)?;

            let request = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(self.counter_key(partner_key))
                .body(ByteStream::from(body));
            let request = match etag {
                Some(etag) => request.if_match(etag),
                None => request.if_none_match("*"),
            };

            match request.send().await {
                Ok(_) => return Ok(out),
                Err(e) if matches!(e.code(), Some("PreconditionFailed" | "ConditionalRequestConflict")) => {
                    tracing::warn!(
                        "⚠️ Counter for {} changed concurrently (attempt {}/{})",
                        partner_key,
                        attempt,
                        MAX_COUNTER_ATTEMPTS
                    );
                }
                Err(e) => {
                    return Err(Self::unavailable(
                        partner_key,
                        DisplayErrorContext(e).to_string(),
                    ))
                }
            }
        }

        Err(Self::unavailable(
            partner_key,
            format!("counter still contended after {} attempts", MAX_COUNTER_ATTEMPTS),
        ))
    }
}

#[async_trait]
impl SequenceAllocator for S3SequenceAllocator {
    async fn next(&self, partner_key: &str) -> Result<SequenceClaim> {
        let claim = self.update(partner_key, |state| Ok(state.advance())).await?;
        tracing::debug!("🔢 Allocated sequence {} for {}", claim.value, partner_key);
        Ok(claim)
    }

    async fn rollback(&self, claim: &SequenceClaim) -> Result<()> {
        let value = self
            .update(&claim.partner_key, |state| state.retract(Some(claim.token)))
            .await?;
        tracing::warn!(
            "↩️ Rolled back sequence {} for {} (now {})",
            claim.value,
            claim.partner_key,
            value
        );
        Ok(())
    }

    async fn rollback_outstanding(&self, partner_key: &str) -> Result<i64> {
        let value = self.update(partner_key, |state| state.retract(None)).await?;
        tracing::warn!("↩️ Rolled back outstanding sequence for {} (now {})", partner_key, value);
        Ok(value)
    }

    async fn current(&self, partner_key: &str) -> Result<i64> {
        Ok(self.load(partner_key).await?.0.value)
    }
}

/// 載入存放在 S3 的 TOML 設定
pub async fn load_exchange_config(storage: &S3Storage, key: &str) -> Result<ExchangeConfig> {
    let bytes = storage.read_file(key).await?;
    let content = String::from_utf8(bytes).map_err(|e| ExchangeError::ConfigError {
        message: format!("Exchange config {} is not UTF-8: {}", key, e),
    })?;
    let config = ExchangeConfig::from_toml_str(&content)?;
    config.validate_config()?;
    Ok(config)
}

/// Lambda 版本的 job：暫存區、計數器與帳本都放在同一個 bucket
pub fn build_s3_job(
    client: &S3Client,
    lambda_config: &LambdaConfig,
    config: &ExchangeConfig,
    only: &[String],
) -> Result<ExchangeJob> {
    let bucket = lambda_config.s3_bucket.clone();
    let allocator: Arc<dyn SequenceAllocator> = Arc::new(S3SequenceAllocator::new(
        client.clone(),
        bucket.clone(),
        format!("{}/sequences", lambda_config.s3_prefix.trim_end_matches('/')),
    ));
    let mut job = ExchangeJob::new(config.job_timeout()).with_monitoring(config.monitoring_enabled());

    for partner in config.enabled_partners(only) {
        let root = lambda_config.partner_prefix(&partner.key);
        let ledger: Arc<dyn DomesticLedger> = Arc::new(JsonLedger::new(
            S3Storage::new(client.clone(), bucket.clone()),
            format!("{}/ledger.json", root),
        ));

        let ports = ExchangePorts {
            channel: build_channel(partner)?,
            inbound: Arc::new(S3StagingStore::new(
                client.clone(),
                bucket.clone(),
                format!("{}/inbound", root),
            )),
            outbound: Arc::new(S3StagingStore::new(
                client.clone(),
                bucket.clone(),
                format!("{}/outbound", root),
            )),
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

    if job.partner_keys().is_empty() {
        return Err(ExchangeError::ConfigError {
            message: "No enabled partners match the selection".to_string(),
        });
    }
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::validation::Validate;

    fn config(bucket: &str, region: &str) -> LambdaConfig {
        LambdaConfig {
            s3_bucket: bucket.to_string(),
            s3_prefix: "partner-exchange/".to_string(),
            s3_region: region.to_string(),
            config_key: "partner-exchange/exchange.toml".to_string(),
        }
    }

    #[test]
    fn test_lambda_config_validation() {
        assert!(config("settlement-files", "ap-southeast-2").validate().is_ok());
        assert!(config("Settlement_Files", "ap-southeast-2").validate().is_err());
        assert!(config("ab", "ap-southeast-2").validate().is_err());
        assert!(config("-settlement", "ap-southeast-2").validate().is_err());
        assert!(config("settlement-files", "AP_SOUTH").validate().is_err());
    }

    #[test]
    fn test_partner_prefix_trims_trailing_slash() {
        assert_eq!(
            config("settlement-files", "ap-southeast-2").partner_prefix("amex"),
            "partner-exchange/amex"
        );
    }
}
