use crate::core::sequence::write_atomically;
use crate::domain::model::FileState;
use crate::domain::ports::StagingStore;
use crate::utils::error::{ExchangeError, Result};
use async_trait::async_trait;
use std::path::PathBuf;

const PROCESSED_DIR: &str = ".processed";

/// 本地目錄暫存區
///
/// 檔案內容放在 `<root>/<name>`，處理完成的標記是 `<root>/.processed/<name>`。
/// 標記與內容分開存放，所以重新 put 不會把已處理的檔案變回 pending。
#[derive(Debug, Clone)]
pub struct LocalStagingStore {
    root: PathBuf,
}

impl LocalStagingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn content_path(&self, name: &str) -> Result<PathBuf> {
        check_name(name)?;
        Ok(self.root.join(name))
    }

    fn marker_path(&self, name: &str) -> Result<PathBuf> {
        check_name(name)?;
        Ok(self.root.join(PROCESSED_DIR).join(name))
    }

    fn unavailable(operation: &str, e: impl std::fmt::Display) -> ExchangeError {
        ExchangeError::StorageUnavailable {
            operation: operation.to_string(),
            message: e.to_string(),
        }
    }
}

/// 名稱只能是單一路徑段
pub(crate) fn check_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(ExchangeError::InvalidConfigValueError {
            field: "staged_file.name".to_string(),
            value: name.to_string(),
            reason: "Staged file names must be a single, non-hidden path segment".to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl StagingStore for LocalStagingStore {
    async fn put(&self, name: &str, content: &[u8]) -> Result<()> {
        let path = self.content_path(name)?;
        write_atomically(&path, content)
            .await
            .map_err(|e| Self::unavailable("put", e))?;
        tracing::debug!("📦 Staged {} ({} bytes)", name, content.len());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.content_path(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ExchangeError::NotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(Self::unavailable("get", e)),
        }
    }

    async fn list_pending(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::unavailable("list_pending", e)),
        };

        let mut pending = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::unavailable("list_pending", e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| Self::unavailable("list_pending", e))?;
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            // 跳過隱藏檔（包含寫入中的暫存檔）
            if name.starts_with('.') {
                continue;
            }
            if !tokio::fs::try_exists(self.marker_path(&name)?)
                .await
                .map_err(|e| Self::unavailable("list_pending", e))?
            {
                pending.push(name);
            }
        }

        pending.sort();
        Ok(pending)
    }

    async fn mark_processed(&self, name: &str) -> Result<()> {
        if !tokio::fs::try_exists(self.content_path(name)?)
            .await
            .map_err(|e| Self::unavailable("mark_processed", e))?
        {
            return Err(ExchangeError::NotFound {
                name: name.to_string(),
            });
        }

        let marker = self.marker_path(name)?;
        let stamp = chrono::Utc::now().to_rfc3339();
        write_atomically(&marker, stamp.as_bytes())
            .await
            .map_err(|e| Self::unavailable("mark_processed", e))?;
        Ok(())
    }

    async fn state(&self, name: &str) -> Result<Option<FileState>> {
        let exists = tokio::fs::try_exists(self.content_path(name)?)
            .await
            .map_err(|e| Self::unavailable("state", e))?;
        if !exists {
            return Ok(None);
        }
        let processed = tokio::fs::try_exists(self.marker_path(name)?)
            .await
            .map_err(|e| Self::unavailable("state", e))?;
        Ok(Some(if processed {
            FileState::Processed
        } else {
            FileState::Pending
        }))
    }
}
