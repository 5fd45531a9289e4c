//! Plain HTTP(S) file references

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{looks_like_path, SourceSettings, StorageSource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlFile {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    /// Request headers; only the first map is applied
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<BTreeMap<String, String>>,
}

impl StorageSource for UrlFile {
    fn validate(&self, settings: &SourceSettings) -> Result<(), String> {
        let (Some(url), Some(method)) = (&self.url, &self.method) else {
            return Err("URL or method are missing".to_string());
        };
        if !matches!(method.to_lowercase().as_str(), "get" | "post") {
            return Err("Invalid method for URL".to_string());
        }
        if settings.unsafe_urls.iter().any(|re| re.is_match(url)) {
            return Err("URL is marked as unsafe".to_string());
        }
        if !url.starts_with("http://") && !url.starts_with("https://") && looks_like_path(url) {
            return Err("URL looks like a file path".to_string());
        }
        Ok(())
    }

    fn download_url(&self, _settings: &SourceSettings) -> String {
        self.url.clone().unwrap_or_default()
    }

    fn method(&self) -> reqwest::Method {
        match self.method.as_deref().map(str::to_lowercase).as_deref() {
            Some("post") => reqwest::Method::POST,
            _ => reqwest::Method::GET,
        }
    }

    fn headers(&self) -> BTreeMap<String, String> {
        self.headers.first().cloned().unwrap_or_default()
    }

    fn display_name(&self) -> String {
        self.url
            .as_deref()
            .and_then(|u| reqwest::Url::parse(u).ok())
            .and_then(|u| u.path_segments().and_then(|mut s| s.next_back().map(str::to_string)))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(url: Option<&str>, method: Option<&str>) -> UrlFile {
        UrlFile {
            url: url.map(str::to_string),
            method: method.map(str::to_string),
            headers: vec![],
        }
    }

    #[test]
    fn test_missing_fields() {
        let s = SourceSettings::default();
        assert_eq!(file(None, Some("get")).validate(&s).unwrap_err(), "URL or method are missing");
        assert_eq!(
            file(Some("https://x.org/a"), None).validate(&s).unwrap_err(),
            "URL or method are missing"
        );
    }

    #[test]
    fn test_method_and_path_checks() {
        let s = SourceSettings::default();
        assert_eq!(
            file(Some("https://x.org/a"), Some("put")).validate(&s).unwrap_err(),
            "Invalid method for URL"
        );
        assert_eq!(
            file(Some("../etc/passwd"), Some("get")).validate(&s).unwrap_err(),
            "URL looks like a file path"
        );
        assert!(file(Some("https://x.org/data/a.csv"), Some("GET")).validate(&s).is_ok());
    }

    #[test]
    fn test_display_name_is_last_segment() {
        let f = file(Some("https://x.org/data/a.csv"), Some("get"));
        assert_eq!(f.display_name(), "a.csv");
        assert_eq!(f.method(), reqwest::Method::GET);
    }
}
