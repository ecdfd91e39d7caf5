use crate::core::sequence::write_atomically;
use crate::domain::ports::RemoteChannel;
use crate::utils::error::{ExchangeError, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

fn unavailable(operation: &str, e: impl std::fmt::Display) -> ExchangeError {
    ExchangeError::ChannelUnavailable {
        operation: operation.to_string(),
        message: e.to_string(),
    }
}

/// 以本地目錄模擬夥伴信箱（例如掛載的 SFTP 目錄）
#[derive(Debug, Clone)]
pub struct LocalMailboxChannel {
    root: PathBuf,
}

impl LocalMailboxChannel {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RemoteChannel for LocalMailboxChannel {
    async fn list(&self, mailbox: &str) -> Result<Vec<String>> {
        let dir = self.root.join(mailbox);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(unavailable("list", e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| unavailable("list", e))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .map_err(|e| unavailable("list", e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if is_file && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn fetch(&self, mailbox: &str, name: &str) -> Result<Vec<u8>> {
        match tokio::fs::read(self.root.join(mailbox).join(name)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ExchangeError::NotFound {
                name: format!("{}/{}", mailbox, name),
            }),
            Err(e) => Err(unavailable("fetch", e)),
        }
    }

    async fn send(&self, mailbox: &str, name: &str, content: &[u8]) -> Result<()> {
        write_atomically(&self.root.join(mailbox).join(name), content)
            .await
            .map_err(|e| unavailable("send", e))
    }
}

/// HTTP 信箱：
/// - `GET {endpoint}/{mailbox}` 回傳檔名 JSON 陣列
/// - `GET {endpoint}/{mailbox}/{name}` 下載
/// - `PUT {endpoint}/{mailbox}/{name}` 上傳
#[derive(Debug, Clone)]
pub struct HttpMailboxChannel {
    client: Client,
    endpoint: String,
    headers: HashMap<String, String>,
}

impl HttpMailboxChannel {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            headers: HashMap::new(),
        })
    }

    /// 附加在每個請求上的標頭（例如認證 token）
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    fn url(&self, mailbox: &str, name: Option<&str>) -> String {
        match name {
            Some(name) => format!("{}/{}/{}", self.endpoint, mailbox, name),
            None => format!("{}/{}", self.endpoint, mailbox),
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, url);
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        builder
    }
}

#[async_trait]
impl RemoteChannel for HttpMailboxChannel {
    async fn list(&self, mailbox: &str) -> Result<Vec<String>> {
        let url = self.url(mailbox, None);
        tracing::debug!("Listing remote mailbox: {}", url);
        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| unavailable("list", e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => {
                let names: Vec<String> = response
                    .json()
                    .await
                    .map_err(|e| unavailable("list", format!("invalid listing: {}", e)))?;
                Ok(names)
            }
            status => Err(unavailable("list", format!("HTTP {}", status))),
        }
    }

    async fn fetch(&self, mailbox: &str, name: &str) -> Result<Vec<u8>> {
        let url = self.url(mailbox, Some(name));
        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|e| unavailable("fetch", e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ExchangeError::NotFound {
                name: format!("{}/{}", mailbox, name),
            }),
            status if status.is_success() => Ok(response
                .bytes()
                .await
                .map_err(|e| unavailable("fetch", e))?
                .to_vec()),
            status => Err(unavailable("fetch", format!("HTTP {}", status))),
        }
    }

    async fn send(&self, mailbox: &str, name: &str, content: &[u8]) -> Result<()> {
        let url = self.url(mailbox, Some(name));
        let response = self
            .request(reqwest::Method::PUT, &url)
            .body(content.to_vec())
            .send()
            .await
            .map_err(|e| unavailable("send", e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(unavailable("send", format!("HTTP {}", response.status())))
        }
    }
}

/// 只讓符合樣式的遠端檔名進入 Ingest
#[derive(Debug, Clone)]
pub struct FilteredChannel<C: RemoteChannel> {
    inner: C,
    pattern: Regex,
}

impl<C: RemoteChannel> FilteredChannel<C> {
    pub fn new(inner: C, pattern: Regex) -> Self {
        Self { inner, pattern }
    }
}

#[async_trait]
impl<C: RemoteChannel> RemoteChannel for FilteredChannel<C> {
    async fn list(&self, mailbox: &str) -> Result<Vec<String>> {
        let names = self.inner.list(mailbox).await?;
        Ok(names
            .into_iter()
            .filter(|name| self.pattern.is_match(name))
            .collect())
    }

    async fn fetch(&self, mailbox: &str, name: &str) -> Result<Vec<u8>> {
        self.inner.fetch(mailbox, name).await
    }

    async fn send(&self, mailbox: &str, name: &str, content: &[u8]) -> Result<()> {
        self.inner.send(mailbox, name, content).await
    }
}
