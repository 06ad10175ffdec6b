use url::Url;

use crate::core::error::{DownloadError, DownloadResult};

const SUPPORTED_SCHEMES: [&str; 3] = ["http", "https", "ftp"];

pub fn is_valid_url(url: &str) -> bool {
    validate_url(url).is_ok()
}

/// 解析并检查协议和主机名
pub fn validate_url(url: &str) -> DownloadResult<Url> {
    let parsed = Url::parse(url.trim()).map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", url, e)))?;
    if !SUPPORTED_SCHEMES.contains(&parsed.scheme()) {
        return Err(DownloadError::InvalidUrl(format!("{}: 不支持的协议 {}", url, parsed.scheme())));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(DownloadError::InvalidUrl(format!("{}: 缺少主机名", url)));
    }
    Ok(parsed)
}

/// 从 URL 路径推断一个标题
pub fn title_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|s| s.to_string())
        .unwrap_or_else(|| url.host_str().unwrap_or("download").to_string())
}

pub fn validate_urls(urls: &[String]) -> DownloadResult<Vec<Url>> {
    if urls.is_empty() {
        return Err(DownloadError::InvalidUrl("URL列表不能为空".to_string()));
    }
    urls.iter().map(|u| validate_url(u)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validation() {
        assert!(is_valid_url("https://example.com/a.mp4"));
        assert!(is_valid_url("http://example.com"));
        assert!(is_valid_url("ftp://mirror.example.com/pub/file.iso"));
        assert!(!is_valid_url("invalid-url"));
        assert!(!is_valid_url("file:///etc/passwd"));
    }

    #[test]
    fn test_title_from_url() {
        let url = validate_url("https://example.com/movies/trailer.mp4").unwrap();
        assert_eq!(title_from_url(&url), "trailer.mp4");
        let bare = validate_url("https://example.com/").unwrap();
        assert_eq!(title_from_url(&bare), "example.com");
    }

    #[test]
    fn test_url_list() {
        assert!(validate_urls(&[]).is_err());
        assert!(validate_urls(&["https://a.example/x".to_string(), "nope".to_string()]).is_err());
        assert_eq!(validate_urls(&["https://a.example/x".to_string()]).unwrap().len(), 1);
    }
}
