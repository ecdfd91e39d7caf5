use crate::domain::model::{
    FileState, PartnerKind, Record, ResponseRecord, SequenceClaim,
};
use crate::utils::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// 位元組層級的 blob 儲存（本地目錄或 S3）
pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// 夥伴信箱（SFTP/FTP/HTTP 由實作決定）
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// 沒有檔案時回傳空陣列，不是錯誤
    async fn list(&self, mailbox: &str) -> Result<Vec<String>>;
    async fn fetch(&self, mailbox: &str, name: &str) -> Result<Vec<u8>>;
    async fn send(&self, mailbox: &str, name: &str, content: &[u8]) -> Result<()>;
}

/// 具 pending/processed 標記的持久化暫存區
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// 覆寫內容但不改變既有狀態
    async fn put(&self, name: &str, content: &[u8]) -> Result<()>;
    async fn get(&self, name: &str) -> Result<Vec<u8>>;
    async fn list_pending(&self) -> Result<Vec<String>>;
    /// 冪等；回傳前必須已持久化
    async fn mark_processed(&self, name: &str) -> Result<()>;
    async fn state(&self, name: &str) -> Result<Option<FileState>>;
}

#[async_trait]
pub trait SequenceAllocator: Send + Sync {
    async fn next(&self, partner_key: &str) -> Result<SequenceClaim>;
    /// 只接受最近一次尚未回收的配號
    async fn rollback(&self, claim: &SequenceClaim) -> Result<()>;
    /// 回收目前未回收的配號（處理回覆檔失敗時使用），回傳回收後的值
    async fn rollback_outstanding(&self, partner_key: &str) -> Result<i64>;
    async fn current(&self, partner_key: &str) -> Result<i64>;
}

/// 夥伴格式外掛：解析並套用回覆檔、產生送出批次
#[async_trait]
pub trait FileTransform: Send + Sync {
    fn partner(&self) -> PartnerKind;
    /// 內容格式錯誤或無法套用時回傳 Ok(false)
    async fn apply(&self, content: &[u8]) -> Result<bool>;
    async fn build(&self, records: &[Record], seq: i64, at: DateTime<Utc>) -> Result<Vec<u8>>;
}

/// 本地交易來源；Emit 以保留 -> 確認的兩階段方式消耗記錄
#[async_trait]
pub trait DomesticLedger: Send + Sync {
    /// Unconsumed 與上次中斷遺留的 Reserved 記錄都會被保留並回傳
    async fn reserve_pending(&self) -> Result<Vec<Record>>;
    /// 保留 -> Consumed，並記下消耗這些記錄的批次；兩者在同一次寫入中完成
    async fn commit_consumed(&self, batch: &str, ids: &[String]) -> Result<()>;
    /// 批次是否已確認消耗記錄；未確認的暫存批次是中斷或失敗留下的孤兒
    async fn is_committed(&self, batch: &str) -> Result<bool>;
    async fn release(&self, ids: &[String]) -> Result<()>;
    async fn apply_response(&self, response: &ResponseRecord) -> Result<()>;
}
