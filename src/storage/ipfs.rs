//! IPFS file references, fetched through a configured gateway

use serde::{Deserialize, Serialize};

use super::{looks_like_path, url_join, SourceSettings, StorageSource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpfsFile {
    /// Content identifier
    #[serde(default)]
    pub hash: Option<String>,
}

impl StorageSource for IpfsFile {
    fn validate(&self, settings: &SourceSettings) -> Result<(), String> {
        if settings.ipfs_gateway.is_none() {
            return Err("IPFS gateway is not configured!".to_string());
        }
        let Some(hash) = &self.hash else {
            return Err("Missing CID".to_string());
        };
        if hash.starts_with("http://") || hash.starts_with("https://") {
            return Err("CID looks like an URL. Please specify URL storage instead.".to_string());
        }
        if looks_like_path(hash) {
            return Err("CID looks like a file path".to_string());
        }
        Ok(())
    }

    fn download_url(&self, settings: &SourceSettings) -> String {
        let gateway = settings.ipfs_gateway.as_deref().unwrap_or_default();
        url_join(gateway, &url_join("ipfs", self.hash.as_deref().unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_gateway() {
        let f = IpfsFile { hash: Some("QmX".into()) };
        assert_eq!(
            f.validate(&SourceSettings::default()).unwrap_err(),
            "IPFS gateway is not configured!"
        );
    }

    #[test]
    fn test_rejects_url_cid() {
        let s = SourceSettings {
            ipfs_gateway: Some("https://gw".into()),
            ..Default::default()
        };
        let f = IpfsFile { hash: Some("https://evil/x".into()) };
        assert!(f.validate(&s).unwrap_err().contains("looks like an URL"));
        let f = IpfsFile { hash: None };
        assert_eq!(f.validate(&s).unwrap_err(), "Missing CID");
    }
}
