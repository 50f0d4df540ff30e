//! 请求校验
//!
//! 不合格的请求直接 400，不进入任何阶段：
//! - 至少一张图片，每张图片必须给 URL 或 base64
//! - URL 只允许 http(s)，且不能指向内网 / 本机地址
//! - base64 必须能解码，解码后不超过 20MB
//! - 图片形式必须是所选识图服务商接受的（qwen 只收 URL）

use crate::error::{AppError, AppResult};
use crate::models::grade::{GradeRequest, ImageRef};
pub use crate::models::grade::MAX_INLINE_IMAGE_BYTES;
use crate::models::provider::{ImageForm, VisionProvider};
use base64::Engine;
use reqwest::Url;
use std::net::{IpAddr, Ipv4Addr};

const INTERNAL_HOST_SUFFIXES: &[&str] = &[".local", ".internal", ".localhost", ".lan", ".intranet"];

/// 校验批改请求
pub fn validate_grade_request(request: &GradeRequest) -> AppResult<()> {
    if request.images.is_empty() {
        return Err(AppError::validation("images must not be empty"));
    }
    for (index, image) in request.images.iter().enumerate() {
        validate_image(image, request.vision_provider).map_err(|message| {
            AppError::validation(format!("images[{}]: {}", index, message))
        })?;
    }
    if let Some(session_id) = &request.session_id {
        if session_id.trim().is_empty() || session_id.len() > 128 {
            return Err(AppError::validation("session_id must be 1-128 characters"));
        }
    }
    Ok(())
}

fn validate_image(image: &ImageRef, provider: VisionProvider) -> Result<(), String> {
    if let Some(url) = image.url.as_deref().filter(|u| !u.trim().is_empty()) {
        return validate_public_url(url);
    }
    let payload = image
        .base64
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| "either url or base64 is required".to_string())?;
    if !provider.accepts(ImageForm::InlineBase64) {
        return Err(format!(
            "vision provider {} does not accept {} images, send a url",
            provider,
            ImageForm::InlineBase64.as_str()
        ));
    }
    validate_base64(payload)
}

/// 只允许公网 http(s) 地址
pub fn validate_public_url(raw: &str) -> Result<(), String> {
    let url = Url::parse(raw.trim()).map_err(|e| format!("invalid url: {}", e))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported url scheme: {}", url.scheme()));
    }
    let host = url
        .host_str()
        .ok_or_else(|| "url has no host".to_string())?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_lowercase();

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err(format!("url points to a private address: {}", host));
        }
        return Ok(());
    }

    if host == "localhost"
        || !host.contains('.')
        || INTERNAL_HOST_SUFFIXES.iter().any(|s| host.ends_with(s))
    {
        return Err(format!("url points to an internal host: {}", host));
    }
    Ok(())
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_v4(&v4);
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // 唯一本地地址 fc00::/7
                || (first & 0xffc0) == 0xfe80 // 链路本地 fe80::/10
        }
    }
}

fn is_private_v4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64) // 运营商级 NAT 100.64.0.0/10
        || octets[0] == 0
}

/// base64（可带 data URI 前缀）必须能解码且不超限
pub fn validate_base64(payload: &str) -> Result<(), String> {
    let data = match payload.trim().strip_prefix("data:") {
        Some(rest) => {
            let (header, data) = rest
                .split_once(',')
                .ok_or_else(|| "malformed data uri".to_string())?;
            if !header.ends_with(";base64") {
                return Err("data uri must be base64 encoded".to_string());
            }
            data
        }
        None => payload.trim(),
    };

    // 先按长度估算，避免为超大负载分配内存
    if data.len() / 4 * 3 > MAX_INLINE_IMAGE_BYTES + 3 {
        return Err(format!(
            "inline image exceeds {} bytes",
            MAX_INLINE_IMAGE_BYTES
        ));
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(data.as_bytes())
        .map_err(|e| format!("invalid base64: {}", e))?;
    if decoded.is_empty() {
        return Err("inline image is empty".to_string());
    }
    if decoded.len() > MAX_INLINE_IMAGE_BYTES {
        return Err(format!(
            "inline image exceeds {} bytes",
            MAX_INLINE_IMAGE_BYTES
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::subject::Subject;

    fn request(images: Vec<ImageRef>) -> GradeRequest {
        GradeRequest {
            subject: Subject::Math,
            images,
            vision_provider: VisionProvider::Doubao,
            llm_provider: None,
            session_id: None,
            mode: "normal".into(),
        }
    }

    #[test]
    fn rejects_internal_addresses() {
        for url in [
            "http://127.0.0.1/a.jpg",
            "http://10.1.2.3/a.jpg",
            "http://192.168.0.10/a.jpg",
            "http://169.254.169.254/latest/meta-data",
            "http://[::1]/a.jpg",
            "http://localhost:8080/a.jpg",
            "http://minio.internal/a.jpg",
            "http://printer.local/a.jpg",
            "http://redis/a.jpg",
            "ftp://img.example.com/a.jpg",
            "file:///etc/passwd",
        ] {
            assert!(validate_public_url(url).is_err(), "{} should be rejected", url);
        }
        assert!(validate_public_url("https://img.example.com/a.jpg?x=1").is_ok());
        assert!(validate_public_url("http://8.8.8.8/a.jpg").is_ok());
    }

    #[test]
    fn base64_must_decode() {
        assert!(validate_base64("aGVsbG8=").is_ok());
        assert!(validate_base64("data:image/png;base64,aGVsbG8=").is_ok());
        assert!(validate_base64("not base64!!").is_err());
        assert!(validate_base64("data:image/png,aGVsbG8=").is_err());
    }

    #[test]
    fn oversized_payload_is_rejected_before_decoding() {
        let huge = "A".repeat((MAX_INLINE_IMAGE_BYTES / 3 + 10) * 4);
        assert!(validate_base64(&huge).unwrap_err().contains("exceeds"));
    }

    #[test]
    fn request_level_checks() {
        assert!(validate_grade_request(&request(vec![])).is_err());
        assert!(validate_grade_request(&request(vec![ImageRef::default()])).is_err());
        assert!(validate_grade_request(&request(vec![
            ImageRef::from_url("https://img.example.com/a.jpg"),
            ImageRef::from_base64("aGVsbG8="),
        ]))
        .is_ok());

        let err = validate_grade_request(&request(vec![
            ImageRef::from_url("https://img.example.com/a.jpg"),
            ImageRef::from_url("http://127.0.0.1/b.jpg"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("images[1]"));
    }

    #[test]
    fn inline_images_need_a_provider_that_takes_them() {
        let mut qwen = request(vec![ImageRef::from_base64("aGVsbG8=")]);
        qwen.vision_provider = VisionProvider::Qwen;
        let err = validate_grade_request(&qwen).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(err.to_string().contains("does not accept inline base64"));

        qwen.images = vec![ImageRef::from_url("https://img.example.com/a.jpg")];
        assert!(validate_grade_request(&qwen).is_ok());
    }
}
