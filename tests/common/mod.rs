//! 集成测试共用的假实现与装配

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde_json::Value;
use tower::ServiceExt;

use homework_tutor::clients::{
    FetchedImage, ImageFetcher, ImageProxy, LlmBackend, TokenStream, VisionBackend,
};
use homework_tutor::infrastructure::MemoryKvStore;
use homework_tutor::models::{ChatMessage, LlmProvider, VisionProvider};
use homework_tutor::{router, AppState, Backends, Config, ProviderError};

/// 识图：URL 一律超时，data URI 返回固定原文
pub struct UrlTimeoutVision {
    pub text: String,
    pub calls: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl VisionBackend for UrlTimeoutVision {
    async fn analyze(
        &self,
        _provider: VisionProvider,
        image_urls: &[String],
        _prompt: &str,
        timeout: Duration,
    ) -> Result<String, ProviderError> {
        self.calls.lock().push(image_urls.to_vec());
        if image_urls.iter().all(|u| u.starts_with("data:")) {
            Ok(self.text.clone())
        } else {
            Err(ProviderError::Timeout(timeout.as_millis() as u64))
        }
    }
}

/// 识图：总是返回固定原文
pub struct FixedVision(pub String);

#[async_trait]
impl VisionBackend for FixedVision {
    async fn analyze(
        &self,
        _provider: VisionProvider,
        _image_urls: &[String],
        _prompt: &str,
        _timeout: Duration,
    ) -> Result<String, ProviderError> {
        Ok(self.0.clone())
    }
}

/// 文本模型：批改按脚本逐条返回，辅导流式返回固定分片
pub struct ScriptedLlm {
    pub grading: Mutex<Vec<Result<String, ProviderError>>>,
    pub tutor_chunks: Vec<String>,
    pub grading_calls: Mutex<Vec<LlmProvider>>,
}

impl ScriptedLlm {
    pub fn new(grading: Vec<Result<String, ProviderError>>, tutor_chunks: &[&str]) -> Self {
        Self {
            grading: Mutex::new(grading),
            tutor_chunks: tutor_chunks.iter().map(|s| s.to_string()).collect(),
            grading_calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LlmBackend for ScriptedLlm {
    async fn complete(
        &self,
        provider: LlmProvider,
        _system_message: &str,
        _user_message: &str,
        _timeout: Duration,
    ) -> Result<String, ProviderError> {
        self.grading_calls.lock().push(provider);
        let mut script = self.grading.lock();
        if script.is_empty() {
            Err(ProviderError::Api("script exhausted".into()))
        } else {
            script.remove(0)
        }
    }

    async fn stream(
        &self,
        _provider: LlmProvider,
        _messages: &[ChatMessage],
    ) -> Result<TokenStream, ProviderError> {
        let chunks: Vec<Result<String, ProviderError>> =
            self.tutor_chunks.iter().cloned().map(Ok).collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

/// HEAD 返回 200，下载返回一个极小的 JPEG 头
pub struct OkFetcher;

#[async_trait]
impl ImageFetcher for OkFetcher {
    async fn probe(&self, _url: &str, _timeout: Duration) -> Result<u16, String> {
        Ok(200)
    }

    async fn download(&self, _url: &str, _timeout: Duration) -> Result<FetchedImage, String> {
        Ok(FetchedImage {
            bytes: vec![0xff, 0xd8, 0xff],
            mime_type: "image/jpeg".into(),
        })
    }
}

/// 代理副本：只改写 URL，服务商照样拉取失败
pub struct CopyProxy;

#[async_trait]
impl ImageProxy for CopyProxy {
    async fn proxy_copies(&self, urls: &[String], _timeout: Duration) -> Result<Vec<String>, String> {
        Ok(urls.iter().map(|u| format!("{}?proxied=1", u)).collect())
    }
}

pub fn test_config() -> Config {
    Config {
        grading_max_attempts: 1,
        retry_base_delay_ms: 1,
        max_sync_images: 2,
        snapshot_file: std::env::temp_dir()
            .join(format!("homework_tutor_{}.jsonl", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .to_string(),
        ..Config::default()
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
}

pub fn test_app(
    vision: Arc<dyn VisionBackend>,
    llm: Arc<dyn LlmBackend>,
    proxy: Option<Arc<dyn ImageProxy>>,
) -> TestApp {
    let backends = Backends {
        vision,
        llm,
        fetcher: Arc::new(OkFetcher),
        proxy,
    };
    let state = Arc::new(AppState::new(
        test_config(),
        backends,
        Arc::new(MemoryKvStore::new()),
    ));
    TestApp {
        router: router(state.clone()),
        state,
    }
}

pub async fn post_json(
    router: &Router,
    uri: &str,
    body: &Value,
    headers: &[(&str, &str)],
) -> (StatusCode, String) {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Body::from(body.to_string())).unwrap();
    send(router, request).await
}

pub async fn get(router: &Router, uri: &str) -> (StatusCode, String) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    send(router, request).await
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

/// 把 SSE 正文拆成 (事件名, JSON) 列表
pub fn parse_sse(body: &str) -> Vec<(String, Value)> {
    body.split("\n\n")
        .filter_map(|block| {
            let mut name = None;
            let mut data = None;
            for line in block.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    name = Some(rest.trim().to_string());
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data = serde_json::from_str(rest.trim()).ok();
                }
            }
            Some((name?, data?))
        })
        .collect()
}
