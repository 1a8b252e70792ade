//! Azure Blob Storage source ("Get Blob" over plain HTTPS).
//!
//! Supports the three credential shapes a storage connection string can carry:
//! an account key (Shared Key request signing), a SAS token (appended to the
//! URL), or neither (public container).

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::source::{http_client, ArtifactSource, FetchError};
use crate::error::AcquireError;

/// REST API version sent with every request.
pub const STORAGE_API_VERSION: &str = "2021-08-06";

/// Parsed `Key=Value;...` storage connection string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionString {
    pub account_name: Option<String>,
    pub account_key: Option<String>,
    pub shared_access_signature: Option<String>,
    pub blob_endpoint: Option<String>,
    pub protocol: Option<String>,
    pub endpoint_suffix: Option<String>,
}

impl ConnectionString {
    pub fn parse(raw: &str) -> Result<Self, AcquireError> {
        let mut cs = ConnectionString::default();
        for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                AcquireError::Configuration(format!(
                    "malformed connection string segment '{}'",
                    redact(part)
                ))
            })?;
            let value = Some(value.trim().to_string());
            match key.trim().to_ascii_lowercase().as_str() {
                "accountname" => cs.account_name = value,
                "accountkey" => cs.account_key = value,
                "sharedaccesssignature" => cs.shared_access_signature = value,
                "blobendpoint" => cs.blob_endpoint = value,
                "defaultendpointsprotocol" => cs.protocol = value,
                "endpointsuffix" => cs.endpoint_suffix = value,
                _ => {} // queue/table/file endpoints etc.
            }
        }

        if cs.account_key.is_some() && cs.account_name.is_none() {
            return Err(AcquireError::Configuration(
                "connection string has AccountKey but no AccountName".into(),
            ));
        }
        if cs.blob_endpoint.is_none() && cs.account_name.is_none() {
            return Err(AcquireError::Configuration(
                "connection string needs AccountName or BlobEndpoint".into(),
            ));
        }
        Ok(cs)
    }

    /// Base URL of the blob service, without a trailing slash.
    pub fn blob_endpoint(&self) -> String {
        if let Some(ep) = &self.blob_endpoint {
            return ep.trim_end_matches('/').to_string();
        }
        format!(
            "{}://{}.blob.{}",
            self.protocol.as_deref().unwrap_or("https"),
            self.account_name.as_deref().unwrap_or_default(),
            self.endpoint_suffix.as_deref().unwrap_or("core.windows.net"),
        )
    }
}

fn redact(segment: &str) -> String {
    segment.chars().take(12).collect::<String>() + "…"
}

enum Credential {
    SharedKey { account: String, key: Vec<u8> },
    Sas,
    Anonymous,
}

/// Downloads one blob from one container.
pub struct BlobStoreSource {
    http: Client,
    url: Url,
    credential: Credential,
    label: String,
}

impl BlobStoreSource {
    pub fn new(
        connection_string: &str,
        container: &str,
        blob: &str,
        timeout: Duration,
    ) -> Result<Self, AcquireError> {
        let cs = ConnectionString::parse(connection_string)?;
        if container.trim().is_empty() || blob.trim().is_empty() {
            return Err(AcquireError::Configuration(
                "container and blob names must not be empty".into(),
            ));
        }

        let mut url = Url::parse(&cs.blob_endpoint()).map_err(|e| {
            AcquireError::Configuration(format!("invalid blob endpoint: {e}"))
        })?;
        url.path_segments_mut()
            .map_err(|_| AcquireError::Configuration("blob endpoint cannot be a base URL".into()))?
            .pop_if_empty()
            .push(container)
            .extend(blob.split('/'));

        // SAS wins over the key when both are present; it needs no signing.
        let credential = if let Some(sas) = &cs.shared_access_signature {
            url.set_query(Some(sas.trim_start_matches('?')));
            Credential::Sas
        } else if let (Some(account), Some(key)) = (&cs.account_name, &cs.account_key) {
            let key = BASE64.decode(key).map_err(|e| {
                AcquireError::Configuration(format!("AccountKey is not valid base64: {e}"))
            })?;
            Credential::SharedKey {
                account: account.clone(),
                key,
            }
        } else {
            Credential::Anonymous
        };

        Ok(BlobStoreSource {
            http: http_client(timeout)?,
            url,
            credential,
            label: format!("azure-blob:{container}/{blob}"),
        })
    }
}

/// Shared Key string-to-sign for a body-less GET.
pub fn string_to_sign(account: &str, path: &str, date: &str) -> String {
    // VERB, then the 11 standard headers (all empty for this request)
    let mut s = String::from("GET");
    s.push_str(&"\n".repeat(12));
    s.push_str(&format!("x-ms-date:{date}\nx-ms-version:{STORAGE_API_VERSION}\n"));
    s.push_str(&format!("/{account}{path}"));
    s
}

pub fn sign(key: &[u8], string_to_sign: &str) -> Result<String, FetchError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| FetchError::Configuration(format!("unusable account key: {e}")))?;
    mac.update(string_to_sign.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl ArtifactSource for BlobStoreSource {
    fn name(&self) -> &str {
        &self.label
    }

    async fn fetch(&self) -> Result<Vec<u8>, FetchError> {
        let mut req = self
            .http
            .get(self.url.clone())
            .header("x-ms-version", STORAGE_API_VERSION);

        if let Credential::SharedKey { account, key } = &self.credential {
            let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
            let signature = sign(key, &string_to_sign(account, self.url.path(), &date))?;
            req = req
                .header("x-ms-date", date)
                .header("Authorization", format!("SharedKey {account}:{signature}"));
        }

        debug!("GET {}{}", self.url.origin().ascii_serialization(), self.url.path());
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::from_status(status, &body));
        }

        let bytes = resp.bytes().await?;
        Ok(bytes.to_vec())
    }
}
