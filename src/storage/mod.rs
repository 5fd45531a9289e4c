//! Storage client - reading file bytes from URL, IPFS and Arweave sources
//!
//! Handles:
//! - File object decoding (`type` is matched case-insensitively)
//! - Per-source validation and download URL construction
//! - Streaming reads and file metadata (size, type, optional sha256 checksum)

pub mod arweave;
pub mod ipfs;
pub mod url;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::{NodeError, NodeResult};
use crate::stream::ByteStream;

pub use arweave::ArweaveFile;
pub use ipfs::IpfsFile;
pub use url::UrlFile;

/// A file reference as carried in algorithms, datasets and `fileInfo` commands.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileObject {
    Url(UrlFile),
    Ipfs(IpfsFile),
    Arweave(ArweaveFile),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TaggedFileObject {
    Url(UrlFile),
    Ipfs(IpfsFile),
    Arweave(ArweaveFile),
}

impl<'de> Deserialize<'de> for FileObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut value = serde_json::Value::deserialize(deserializer)?;
        if let Some(kind) = value.get("type").and_then(|t| t.as_str()) {
            let lowered = kind.to_lowercase();
            value["type"] = serde_json::Value::String(lowered);
        }
        let tagged = TaggedFileObject::deserialize(value).map_err(serde::de::Error::custom)?;
        Ok(match tagged {
            TaggedFileObject::Url(f) => FileObject::Url(f),
            TaggedFileObject::Ipfs(f) => FileObject::Ipfs(f),
            TaggedFileObject::Arweave(f) => FileObject::Arweave(f),
        })
    }
}

impl FileObject {
    pub fn type_name(&self) -> &'static str {
        match self {
            FileObject::Url(_) => "url",
            FileObject::Ipfs(_) => "ipfs",
            FileObject::Arweave(_) => "arweave",
        }
    }

    fn source(&self) -> &dyn StorageSource {
        match self {
            FileObject::Url(f) => f,
            FileObject::Ipfs(f) => f,
            FileObject::Arweave(f) => f,
        }
    }
}

/// Settings shared by every source when validating and resolving files.
#[derive(Debug, Clone, Default)]
pub struct SourceSettings {
    pub ipfs_gateway: Option<String>,
    pub arweave_gateway: Option<String>,
    pub unsafe_urls: Vec<Regex>,
}

/// Behaviour each file source provides.
pub trait StorageSource {
    /// Reject malformed or disallowed references with a human-readable reason.
    fn validate(&self, settings: &SourceSettings) -> Result<(), String>;

    /// Where the bytes are fetched from. Only meaningful after `validate` succeeds.
    fn download_url(&self, settings: &SourceSettings) -> String;

    /// Method used for the fetch.
    fn method(&self) -> reqwest::Method {
        reqwest::Method::GET
    }

    /// Extra request headers.
    fn headers(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Name exposed in file info; empty where it could leak the content address.
    fn display_name(&self) -> String {
        String::new()
    }
}

/// Streaming read result.
pub struct ReadableFile {
    pub http_status: u16,
    pub headers: BTreeMap<String, String>,
    pub stream: ByteStream,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub valid: bool,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// HTTP-backed client for all file sources.
#[derive(Clone)]
pub struct StorageClient {
    http: reqwest::Client,
    settings: SourceSettings,
}

impl StorageClient {
    pub fn new(config: &StorageConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("building storage HTTP client")?;

        let mut unsafe_urls = Vec::new();
        for pattern in &config.unsafe_urls {
            match Regex::new(pattern) {
                Ok(re) => unsafe_urls.push(re),
                Err(e) => warn!(pattern = %pattern, error = %e, "Ignoring invalid unsafe URL pattern"),
            }
        }

        Ok(Self {
            http,
            settings: SourceSettings {
                ipfs_gateway: config.ipfs_gateway.clone(),
                arweave_gateway: config.arweave_gateway.clone(),
                unsafe_urls,
            },
        })
    }

    pub fn settings(&self) -> &SourceSettings {
        &self.settings
    }

    pub fn validate(&self, file: &FileObject) -> NodeResult<()> {
        file.source().validate(&self.settings).map_err(|reason| {
            NodeError::BadRequest(format!("Error validating the {} file: {}", file.type_name(), reason))
        })
    }

    pub fn download_url(&self, file: &FileObject) -> NodeResult<String> {
        self.validate(file)?;
        Ok(file.source().download_url(&self.settings))
    }

    /// Open a streaming read of the file's bytes.
    pub async fn readable_stream(&self, file: &FileObject) -> NodeResult<ReadableFile> {
        let response = self.send(file).await?;
        let http_status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        Ok(ReadableFile {
            http_status,
            headers,
            stream: Box::pin(stream),
        })
    }

    /// Fetch size and type; hash the full content when `force_checksum` is set.
    pub async fn file_info(&self, file: &FileObject, force_checksum: bool) -> NodeResult<FileInfo> {
        let response = self.send(file).await?;
        if !response.status().is_success() {
            return Err(NodeError::Storage(format!(
                "fetching metadata failed with status {}",
                response.status()
            )));
        }
        let mut content_length = response.content_length();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let checksum = if force_checksum {
            let mut hasher = Sha256::new();
            let mut total = 0u64;
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                total += chunk.len() as u64;
                hasher.update(&chunk);
            }
            content_length = Some(total);
            Some(hex::encode(hasher.finalize()))
        } else {
            None
        };

        Ok(FileInfo {
            valid: true,
            content_length,
            content_type,
            checksum,
            name: file.source().display_name(),
            kind: file.type_name().to_string(),
        })
    }

    /// Stream the file into `dest`, returning the number of bytes written.
    pub async fn download_to(&self, file: &FileObject, dest: &Path) -> NodeResult<u64> {
        let mut readable = self.readable_stream(file).await?;
        if !(200..300).contains(&readable.http_status) {
            return Err(NodeError::Storage(format!(
                "download failed with status {}",
                readable.http_status
            )));
        }
        let mut out = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = readable.stream.next().await {
            let chunk = chunk?;
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        out.flush().await?;
        debug!(dest = %dest.display(), bytes = written, "Downloaded file");
        Ok(written)
    }

    async fn send(&self, file: &FileObject) -> NodeResult<reqwest::Response> {
        let url = self.download_url(file)?;
        let source = file.source();
        let mut request = self.http.request(source.method(), &url);
        for (name, value) in source.headers() {
            request = request.header(name, value);
        }
        Ok(request.send().await?)
    }
}

/// Matches strings that look like `something/path`.
pub(crate) fn looks_like_path(value: &str) -> bool {
    match value.rfind('/') {
        Some(idx) => idx > 0,
        None => false,
    }
}

/// Join a base URL and a path segment with exactly one slash.
pub(crate) fn url_join(base: &str, segment: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), segment.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(ipfs: Option<&str>, arweave: Option<&str>, unsafe_urls: Vec<&str>) -> StorageClient {
        StorageClient::new(&StorageConfig {
            ipfs_gateway: ipfs.map(str::to_string),
            arweave_gateway: arweave.map(str::to_string),
            unsafe_urls: unsafe_urls.into_iter().map(str::to_string).collect(),
            request_timeout_secs: 30,
        })
        .unwrap()
    }

    #[test]
    fn test_type_is_case_insensitive() {
        let file: FileObject =
            serde_json::from_str(r#"{"type":"URL","url":"https://a.com/f.csv","method":"GET"}"#).unwrap();
        assert_eq!(file.type_name(), "url");
        let file: FileObject = serde_json::from_str(r#"{"type":"Ipfs","hash":"Qm123"}"#).unwrap();
        assert_eq!(file.type_name(), "ipfs");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let res: Result<FileObject, _> = serde_json::from_str(r#"{"type":"s3","bucket":"x"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_download_urls() {
        let c = client(Some("https://ipfs.io/"), Some("https://arweave.net"), vec![]);
        let ipfs: FileObject = serde_json::from_str(r#"{"type":"ipfs","hash":"QmAbc"}"#).unwrap();
        assert_eq!(c.download_url(&ipfs).unwrap(), "https://ipfs.io/ipfs/QmAbc");
        let ar: FileObject =
            serde_json::from_str(r#"{"type":"arweave","transactionId":"tx123"}"#).unwrap();
        assert_eq!(c.download_url(&ar).unwrap(), "https://arweave.net/tx123");
    }

    #[test]
    fn test_unsafe_url_rejected() {
        let c = client(None, None, vec!["^.*169\\.254\\..*$", "(invalid"]);
        let f: FileObject =
            serde_json::from_str(r#"{"type":"url","url":"http://169.254.0.1/meta","method":"get"}"#)
                .unwrap();
        let err = c.validate(&f).unwrap_err();
        assert!(err.to_string().contains("unsafe"));
    }

    #[test]
    fn test_path_helpers() {
        assert!(looks_like_path("./foo/bar"));
        assert!(!looks_like_path("QmHash"));
        assert!(!looks_like_path("/root"));
        assert_eq!(url_join("http://gw/", "/ipfs/x"), "http://gw/ipfs/x");
    }
}
