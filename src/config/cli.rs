use crate::core::sequence::write_atomically;
use crate::core::Storage;
use crate::utils::error::{ExchangeError, Result};
use std::path::{Path, PathBuf};

/// 本地檔案系統上的 blob 儲存，用於帳本與設定檔
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: String,
}

impl LocalStorage {
    pub fn new(base_path: String) -> Self {
        Self { base_path }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        Path::new(&self.base_path).join(path)
    }
}

impl Storage for LocalStorage {
    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path);
        match tokio::fs::read(&full_path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ExchangeError::NotFound {
                name: full_path.display().to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        write_atomically(&self.full_path(path), data).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_read_nested_path() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().to_string_lossy().to_string());

        storage.write_file("ledger/amex.json", b"{}").await.unwrap();
        assert_eq!(storage.read_file("ledger/amex.json").await.unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path().to_string_lossy().to_string());
        let err = storage.read_file("nope.json").await.unwrap_err();
        assert!(matches!(err, ExchangeError::NotFound { .. }));
    }
}
