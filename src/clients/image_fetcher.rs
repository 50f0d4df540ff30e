//! 图片拉取客户端
//!
//! 识图兜底链用到的两项能力：HEAD 探测（只用于补充诊断信息）和本地下载（转 base64 内联）。

use async_trait::async_trait;
use base64::Engine;
use std::time::Duration;
use tracing::debug;

use crate::models::grade::MAX_INLINE_IMAGE_BYTES;

/// 下载得到的图片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl FetchedImage {
    /// 转为可直接交给模型的 data URI
    pub fn to_data_uri(&self) -> String {
        let b64 = base64::engine::general_purpose::STANDARD.encode(&self.bytes);
        format!("data:{};base64,{}", self.mime_type, b64)
    }
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// HEAD 探测，返回 HTTP 状态码
    async fn probe(&self, url: &str, timeout: Duration) -> Result<u16, String>;
    /// 下载图片
    async fn download(&self, url: &str, timeout: Duration) -> Result<FetchedImage, String>;
}

/// 代理副本上传：把图片转存到更易被服务商拉取的位置，返回新的 URL 列表。
/// 对象存储本身不在本服务范围内，由部署方注入实现。
#[async_trait]
pub trait ImageProxy: Send + Sync {
    async fn proxy_copies(&self, urls: &[String], timeout: Duration) -> Result<Vec<String>, String>;
}

/// 基于 reqwest 的实现
pub struct HttpImageFetcher {
    client: reqwest::Client,
}

impl HttpImageFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpImageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn probe(&self, url: &str, timeout: Duration) -> Result<u16, String> {
        debug!("HEAD 探测: {}", url);
        self.client
            .head(url)
            .timeout(timeout)
            .send()
            .await
            .map(|resp| resp.status().as_u16())
            .map_err(|e| describe_reqwest_error(&e))
    }

    async fn download(&self, url: &str, timeout: Duration) -> Result<FetchedImage, String> {
        debug!("本地下载图片: {}", url);
        let mut response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| describe_reqwest_error(&e))?
            .error_for_status()
            .map_err(|e| describe_reqwest_error(&e))?;

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.starts_with("image/"))
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_else(|| guess_mime_type(url));

        if let Some(length) = response.content_length() {
            check_size(usize::try_from(length).unwrap_or(usize::MAX))?;
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| describe_reqwest_error(&e))?
        {
            check_size(bytes.len() + chunk.len())?;
            bytes.extend_from_slice(&chunk);
        }

        Ok(FetchedImage { bytes, mime_type })
    }
}

fn check_size(len: usize) -> Result<(), String> {
    if len > MAX_INLINE_IMAGE_BYTES {
        Err(format!("image exceeds {} bytes", MAX_INLINE_IMAGE_BYTES))
    } else {
        Ok(())
    }
}

fn describe_reqwest_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "timeout".to_string()
    } else if let Some(status) = err.status() {
        format!("HTTP {}", status.as_u16())
    } else {
        err.to_string()
    }
}

/// 根据扩展名猜测图片类型
pub fn guess_mime_type(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "image/jpeg",
    }
    .to_string()
}
