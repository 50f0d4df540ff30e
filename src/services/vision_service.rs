//! 识图服务 - 业务能力层
//!
//! 图片 → 原文。兜底路径写成有序的尝试列表：
//! 直接 URL → 代理副本 URL → 内联 base64。
//! 是否启用兜底由服务商决定（严格服务商只尝试一次）。
//! 每次尝试前都重新从剩余预算里领取子预算，任何一次预算耗尽都直接结束。

use crate::clients::{ImageFetcher, ImageProxy, VisionBackend};
use crate::error::ProviderError;
use crate::infrastructure::{Budget, ProviderPools};
use crate::models::grade::{to_data_uri, ImageRef, MAX_INLINE_IMAGE_BYTES};
use crate::models::provider::VisionProvider;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// HEAD 探测的超时上限
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
/// 单张图片下载的超时上限
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// 一次尝试如何准备图片
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    /// 原始 URL 交给服务商拉取
    Direct,
    /// 转存到代理位置后再交给服务商
    ProxyUrl,
    /// 本服务下载后内联为 base64
    InlineBase64,
}

impl AttemptKind {
    pub fn label(self) -> &'static str {
        match self {
            AttemptKind::Direct => "direct url",
            AttemptKind::ProxyUrl => "proxy url",
            AttemptKind::InlineBase64 => "inline base64",
        }
    }
}

/// 按服务商与图片类型生成尝试列表
pub fn attempt_chain(provider: VisionProvider, images: &[ImageRef]) -> Vec<AttemptKind> {
    let has_url = images.iter().any(ImageRef::is_url);
    if provider.has_flaky_url_fetch() && has_url {
        vec![
            AttemptKind::Direct,
            AttemptKind::ProxyUrl,
            AttemptKind::InlineBase64,
        ]
    } else {
        vec![AttemptKind::Direct]
    }
}

/// 识图成功的结果
#[derive(Debug, Clone)]
pub struct VisionOutput {
    pub text: String,
    pub provider_used: VisionProvider,
    pub attempt_used: AttemptKind,
    /// 按尝试顺序记录的警告
    pub warnings: Vec<String>,
}

/// 识图失败
#[derive(Debug, Clone)]
pub struct VisionFailure {
    pub warnings: Vec<String>,
    /// 是否因时间预算耗尽而结束
    pub budget_exhausted: bool,
    pub last_error: Option<ProviderError>,
}

/// 识图服务
///
/// 职责：
/// - 调用识图模型得到原文
/// - 按尝试列表执行兜底，并如实上报走了哪条路径
/// - 不关心批改与题库
pub struct VisionService {
    backend: Arc<dyn VisionBackend>,
    fetcher: Arc<dyn ImageFetcher>,
    proxy: Option<Arc<dyn ImageProxy>>,
    pools: ProviderPools,
}

impl VisionService {
    pub fn new(
        backend: Arc<dyn VisionBackend>,
        fetcher: Arc<dyn ImageFetcher>,
        proxy: Option<Arc<dyn ImageProxy>>,
        pools: ProviderPools,
    ) -> Self {
        Self {
            backend,
            fetcher,
            proxy,
            pools,
        }
    }

    /// 识图
    ///
    /// # 参数
    /// - `provider`: 识图服务商
    /// - `images`: 页面图片
    /// - `prompt`: 提示词
    /// - `budget`: 请求级时间预算
    /// - `stage_default`: 本阶段默认超时
    ///
    /// # 返回
    /// 成功返回原文及实际路径；失败返回按顺序记录的警告
    pub async fn analyze(
        &self,
        provider: VisionProvider,
        images: &[ImageRef],
        prompt: &str,
        budget: &Budget,
        stage_default: Duration,
    ) -> Result<VisionOutput, VisionFailure> {
        let chain = attempt_chain(provider, images);
        let mut warnings: Vec<String> = Vec::new();
        let mut last_error: Option<ProviderError> = None;
        let mut first_error: Option<ProviderError> = None;

        for (index, kind) in chain.iter().copied().enumerate() {
            if budget.stage_budget(stage_default).is_none() {
                let message = if index == 0 {
                    "SLA exceeded before stage vision started".to_string()
                } else {
                    format!("SLA exceeded before fallback ({})", kind.label())
                };
                warn!("⏱ {}", message);
                warnings.push(message);
                return Err(VisionFailure {
                    warnings,
                    budget_exhausted: true,
                    last_error,
                });
            }

            let urls = match kind {
                AttemptKind::Direct => images.iter().filter_map(ImageRef::model_url).collect(),
                AttemptKind::ProxyUrl => {
                    match self.proxy_urls(images, budget, last_error.as_ref()).await {
                        Ok(urls) => urls,
                        Err(reason) => {
                            warnings.push(reason);
                            continue;
                        }
                    }
                }
                AttemptKind::InlineBase64 => match self.inline_images(images, budget).await {
                    Ok(urls) => urls,
                    Err(reason) => {
                        warnings.push(reason);
                        continue;
                    }
                },
            };

            let _permit = match self.pools.acquire_vision().await {
                Ok(permit) => permit,
                Err(e) => {
                    warnings.push(e.to_string());
                    break;
                }
            };
            // 排队等待后重新计算
            let Some(timeout) = budget.stage_budget(stage_default) else {
                warnings.push(format!("SLA exceeded before fallback ({})", kind.label()));
                return Err(VisionFailure {
                    warnings,
                    budget_exhausted: true,
                    last_error,
                });
            };

            debug!(
                "识图尝试 {} / {}: {} ({} 张图, 超时 {:?})",
                index + 1,
                chain.len(),
                kind.label(),
                urls.len(),
                timeout
            );

            match self.backend.analyze(provider, &urls, prompt, timeout).await {
                Ok(text) => {
                    if let Some(original) = &first_error {
                        warnings.push(format!(
                            "vision recovered via {} after original error: {}",
                            kind.label(),
                            original
                        ));
                        info!("✓ 识图经 {} 兜底成功", kind.label());
                    }
                    return Ok(VisionOutput {
                        text,
                        provider_used: provider,
                        attempt_used: kind,
                        warnings,
                    });
                }
                Err(e) => {
                    warn!("识图失败 ({} / {}): {}", provider, kind.label(), e);
                    warnings.push(format!(
                        "vision provider {} failed ({}): {}",
                        provider,
                        kind.label(),
                        e
                    ));
                    if kind == AttemptKind::Direct && chain.len() > 1 {
                        if let Some(diagnostic) = self.probe_diagnostic(images, budget).await {
                            warnings.push(diagnostic);
                        }
                    }
                    first_error.get_or_insert_with(|| e.clone());
                    last_error = Some(e);
                }
            }
        }

        Err(VisionFailure {
            warnings,
            budget_exhausted: false,
            last_error,
        })
    }

    /// HEAD 探测图片 URL，只作诊断，不影响后续路径
    async fn probe_diagnostic(&self, images: &[ImageRef], budget: &Budget) -> Option<String> {
        let mut results = Vec::new();
        for url in images.iter().filter_map(|i| i.url.as_deref()).take(3) {
            let Some(timeout) = budget.stage_budget(PROBE_TIMEOUT) else {
                break;
            };
            let outcome = match self.fetcher.probe(url, timeout).await {
                Ok(status) => format!("HTTP {}", status),
                Err(e) => e,
            };
            results.push(format!("{} → {}", shorten_url(url), outcome));
        }
        if results.is_empty() {
            None
        } else {
            Some(format!("url probe: {}", results.join("; ")))
        }
    }

    /// 代理副本；未配置代理或错误不像拉取失败时跳过
    async fn proxy_urls(
        &self,
        images: &[ImageRef],
        budget: &Budget,
        last_error: Option<&ProviderError>,
    ) -> Result<Vec<String>, String> {
        let Some(proxy) = &self.proxy else {
            return Err("proxy url retry skipped: no image proxy configured".to_string());
        };
        if !last_error.is_some_and(ProviderError::looks_like_fetch_failure) {
            return Err("proxy url retry skipped: failure does not look like an image fetch error".to_string());
        }
        let Some(timeout) = budget.stage_budget(DOWNLOAD_TIMEOUT) else {
            return Err("SLA exceeded before fallback (proxy url)".to_string());
        };

        let originals: Vec<String> = images.iter().filter_map(|i| i.url.clone()).collect();
        let proxied = proxy
            .proxy_copies(&originals, timeout)
            .await
            .map_err(|e| format!("proxy upload failed: {}", e))?;
        if proxied.len() != originals.len() {
            return Err(format!(
                "proxy upload returned {} urls for {} images",
                proxied.len(),
                originals.len()
            ));
        }

        // 内联图片保持原样
        let mut proxied = proxied.into_iter();
        Ok(images
            .iter()
            .filter_map(|image| {
                if image.is_url() {
                    proxied.next()
                } else {
                    image.model_url()
                }
            })
            .collect())
    }

    /// 下载所有 URL 图片并内联为 data URI
    async fn inline_images(&self, images: &[ImageRef], budget: &Budget) -> Result<Vec<String>, String> {
        let mut urls = Vec::with_capacity(images.len());
        for image in images {
            match (&image.url, &image.base64) {
                (Some(url), _) if image.is_url() => {
                    let Some(timeout) = budget.stage_budget(DOWNLOAD_TIMEOUT) else {
                        return Err("SLA exceeded before fallback (inline base64)".to_string());
                    };
                    let fetched = self.fetcher.download(url, timeout).await.map_err(|e| {
                        format!("inline base64 download failed for {}: {}", shorten_url(url), e)
                    })?;
                    if fetched.bytes.len() > MAX_INLINE_IMAGE_BYTES {
                        return Err(format!(
                            "inline base64 download failed for {}: image exceeds {} bytes",
                            shorten_url(url),
                            MAX_INLINE_IMAGE_BYTES
                        ));
                    }
                    urls.push(fetched.to_data_uri());
                }
                (_, Some(payload)) => urls.push(to_data_uri(payload)),
                _ => {}
            }
        }
        Ok(urls)
    }
}

/// 日志里只保留 URL 前缀
fn shorten_url(url: &str) -> String {
    let path = url.split('?').next().unwrap_or(url);
    if path.chars().count() > 80 {
        format!("{}…", path.chars().take(80).collect::<String>())
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::FetchedImage;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// URL 一律超时，代理副本被拒，data URI 正常识别
    struct UrlTimeoutVision {
        calls: Mutex<Vec<Vec<String>>>,
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
                Ok("### 第1题\n题目：1+1=?\n学生作答：2".to_string())
            } else if image_urls.iter().any(|u| u.contains("proxied")) {
                Err(ProviderError::Api("proxied copy rejected".into()))
            } else {
                Err(ProviderError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    /// 下载返回指定大小的图片
    struct SizedFetcher(usize);

    #[async_trait]
    impl ImageFetcher for SizedFetcher {
        async fn probe(&self, _url: &str, _timeout: Duration) -> Result<u16, String> {
            Ok(200)
        }

        async fn download(&self, _url: &str, _timeout: Duration) -> Result<FetchedImage, String> {
            Ok(FetchedImage {
                bytes: vec![0xff; self.0],
                mime_type: "image/jpeg".into(),
            })
        }
    }

    struct CopyProxy;

    #[async_trait]
    impl ImageProxy for CopyProxy {
        async fn proxy_copies(&self, urls: &[String], _timeout: Duration) -> Result<Vec<String>, String> {
            Ok(urls.iter().map(|u| format!("{}?proxied=1", u)).collect())
        }
    }

    fn service(proxy: Option<Arc<dyn ImageProxy>>) -> (VisionService, Arc<UrlTimeoutVision>) {
        service_with_fetcher(proxy, SizedFetcher(3))
    }

    fn service_with_fetcher(
        proxy: Option<Arc<dyn ImageProxy>>,
        fetcher: SizedFetcher,
    ) -> (VisionService, Arc<UrlTimeoutVision>) {
        let backend = Arc::new(UrlTimeoutVision {
            calls: Mutex::new(Vec::new()),
        });
        let service = VisionService::new(
            backend.clone(),
            Arc::new(fetcher),
            proxy,
            ProviderPools::new(2, 2),
        );
        (service, backend)
    }

    fn url_images() -> Vec<ImageRef> {
        vec![ImageRef::from_url("https://img.example.com/page1.jpg")]
    }

    #[test]
    fn strict_provider_has_single_attempt() {
        assert_eq!(
            attempt_chain(VisionProvider::Qwen, &url_images()),
            vec![AttemptKind::Direct]
        );
        assert_eq!(
            attempt_chain(VisionProvider::Doubao, &[ImageRef::from_base64("aGk=")]),
            vec![AttemptKind::Direct]
        );
        assert_eq!(attempt_chain(VisionProvider::Doubao, &url_images()).len(), 3);
    }

    #[tokio::test]
    async fn flaky_provider_falls_back_to_inline_base64() {
        let (service, backend) = service(None);
        let budget = Budget::start(Duration::from_secs(120));

        let output = service
            .analyze(
                VisionProvider::Doubao,
                &url_images(),
                "prompt",
                &budget,
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(output.attempt_used, AttemptKind::InlineBase64);
        assert_eq!(backend.calls.lock().len(), 2);
        // 顺序：直连失败 → 探测 → 代理跳过 → 兜底成功
        assert!(output.warnings[0].contains("direct url") && output.warnings[0].contains("timeout"));
        assert!(output.warnings[1].starts_with("url probe"));
        assert!(output.warnings[2].contains("proxy url retry skipped"));
        let last = output.warnings.last().unwrap();
        assert!(last.contains("inline base64") && last.contains("timeout"));
    }

    #[tokio::test]
    async fn proxy_attempt_runs_before_base64_when_configured() {
        let (service, backend) = service(Some(Arc::new(CopyProxy)));
        let budget = Budget::start(Duration::from_secs(120));

        let output = service
            .analyze(
                VisionProvider::Doubao,
                &url_images(),
                "prompt",
                &budget,
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let calls = backend.calls.lock();
        assert_eq!(calls.len(), 3);
        assert!(calls[1][0].ends_with("?proxied=1"));
        assert_eq!(output.attempt_used, AttemptKind::InlineBase64);
        // 成功提示引用的是直连时的原始错误，而不是代理那次的错误
        let recovered = output.warnings.last().unwrap();
        assert!(recovered.ends_with("original error: timeout after 60000ms"));
        assert!(!recovered.contains("proxied copy rejected"));
    }

    #[tokio::test]
    async fn oversized_download_is_not_inlined() {
        let (service, backend) =
            service_with_fetcher(None, SizedFetcher(MAX_INLINE_IMAGE_BYTES + 1));
        let budget = Budget::start(Duration::from_secs(120));

        let failure = service
            .analyze(
                VisionProvider::Doubao,
                &url_images(),
                "prompt",
                &budget,
                Duration::from_secs(60),
            )
            .await
            .unwrap_err();

        // 只有直连那一次调用了模型
        assert_eq!(backend.calls.lock().len(), 1);
        assert!(!failure.budget_exhausted);
        let last = failure.warnings.last().unwrap();
        assert!(last.contains("inline base64 download failed") && last.contains("exceeds"));
    }

    #[tokio::test]
    async fn strict_provider_fails_immediately() {
        let (service, backend) = service(None);
        let budget = Budget::start(Duration::from_secs(120));

        let failure = service
            .analyze(
                VisionProvider::Qwen,
                &url_images(),
                "prompt",
                &budget,
                Duration::from_secs(60),
            )
            .await
            .unwrap_err();

        assert_eq!(backend.calls.lock().len(), 1);
        assert_eq!(failure.warnings.len(), 1);
        assert!(!failure.budget_exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_skips_stage() {
        let (service, backend) = service(None);
        let budget = Budget::start(Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;

        let failure = service
            .analyze(
                VisionProvider::Doubao,
                &url_images(),
                "prompt",
                &budget,
                Duration::from_secs(60),
            )
            .await
            .unwrap_err();

        assert!(failure.budget_exhausted);
        assert!(backend.calls.lock().is_empty());
        assert_eq!(failure.warnings, vec!["SLA exceeded before stage vision started"]);
    }
}
