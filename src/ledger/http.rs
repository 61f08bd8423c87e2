//! Remote ledger backend speaking a KV-over-HTTP REST API.
//!
//! Layout: `GET|PUT|DELETE {base}/values/{key}`; `PUT` takes the value as the
//! request body and `expiration_ttl` (seconds) as a query parameter. A `404` on
//! `GET` means the key is absent.

use super::Ledger;
use crate::error::LedgerError;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct HttpLedger {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpLedger {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LedgerError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, key: &str) -> String {
        // IPv6 addresses and arbitrary user ids must stay a single segment.
        format!("{}/values/{}", self.base_url, urlencoding::encode(key))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn get(&self, key: &str) -> Result<Option<String>, LedgerError> {
        let resp = self
            .authorize(self.client.get(self.url(key)))
            .send()
            .await
            .map_err(|e| LedgerError::Unreachable(e.to_string()))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => resp
                .text()
                .await
                .map(Some)
                .map_err(|e| LedgerError::Unreachable(e.to_string())),
            s => Err(LedgerError::Status {
                status: s.as_u16(),
                key: key.to_string(),
            }),
        }
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), LedgerError> {
        let ttl_secs = ttl.as_secs().max(1).to_string();
        let resp = self
            .authorize(self.client.put(self.url(key)))
            .query(&[("expiration_ttl", ttl_secs.as_str())])
            .body(value)
            .send()
            .await
            .map_err(|e| LedgerError::Unreachable(e.to_string()))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(LedgerError::Status {
                status: resp.status().as_u16(),
                key: key.to_string(),
            })
        }
    }

    async fn delete(&self, key: &str) -> Result<(), LedgerError> {
        let resp = self
            .authorize(self.client.delete(self.url(key)))
            .send()
            .await
            .map_err(|e| LedgerError::Unreachable(e.to_string()))?;

        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(LedgerError::Status {
                status: status.as_u16(),
                key: key.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_single_path_segments() {
        let ledger = HttpLedger::new("http://kv.internal", None).unwrap();
        assert_eq!(
            ledger.url("ratelimit:10.0.0.1"),
            "http://kv.internal/values/ratelimit%3A10.0.0.1"
        );
        assert_eq!(
            ledger.url("session:a/b c"),
            "http://kv.internal/values/session%3Aa%2Fb%20c"
        );
        assert_eq!(
            ledger.url("ratelimit:::1"),
            "http://kv.internal/values/ratelimit%3A%3A%3A1"
        );
    }

    #[test]
    fn test_url_joins_base() {
        let ledger = HttpLedger::new("http://kv.internal/ns/", None).unwrap();
        assert_eq!(
            ledger.url("session:u1"),
            "http://kv.internal/ns/values/session%3Au1"
        );
    }

    #[tokio::test]
    async fn test_unreachable_backend_reports_error() {
        // Port 9 (discard) on loopback is almost never listening.
        let ledger = HttpLedger::new("http://127.0.0.1:9", None).unwrap();
        let err = ledger.get("ratelimit:1.2.3.4").await.unwrap_err();
        assert!(matches!(err, LedgerError::Unreachable(_)));
    }
}
