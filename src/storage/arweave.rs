//! Arweave file references, fetched through a configured gateway

use serde::{Deserialize, Serialize};

use super::{looks_like_path, url_join, SourceSettings, StorageSource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArweaveFile {
    #[serde(default)]
    pub transaction_id: Option<String>,
}

impl StorageSource for ArweaveFile {
    fn validate(&self, settings: &SourceSettings) -> Result<(), String> {
        if settings.arweave_gateway.is_none() {
            return Err("Arweave gateway is not configured!".to_string());
        }
        let Some(tx) = &self.transaction_id else {
            return Err("Missing transaction ID".to_string());
        };
        if tx.starts_with("http://") || tx.starts_with("https://") {
            return Err(
                "Transaction ID looks like an URL. Please specify URL storage instead.".to_string(),
            );
        }
        if looks_like_path(tx) {
            return Err("Transaction ID looks like a file path".to_string());
        }
        Ok(())
    }

    fn download_url(&self, settings: &SourceSettings) -> String {
        let gateway = settings.arweave_gateway.as_deref().unwrap_or_default();
        url_join(gateway, self.transaction_id.as_deref().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_path_like_id() {
        let s = SourceSettings {
            arweave_gateway: Some("https://arweave.net".into()),
            ..Default::default()
        };
        let f = ArweaveFile { transaction_id: Some("a/b".into()) };
        assert_eq!(f.validate(&s).unwrap_err(), "Transaction ID looks like a file path");
        let f = ArweaveFile { transaction_id: Some("abc".into()) };
        assert!(f.validate(&s).is_ok());
        assert_eq!(f.download_url(&s), "https://arweave.net/abc");
    }
}
