// [libs/infra/server-client/src/lib.rs]
//! The agent's HTTP uplink for everything that is not the persistent
//! message channel: timing config, wordlist/rule/binary/hashlist downloads.
//!
//! Downloads stream to `.part` files and rename into place, so a killed
//! agent never leaves a truncated file the sync scanner would trust.

pub mod errors;

use std::path::Path;

use futures_util::StreamExt;
use md5::{Digest, Md5};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use krakenhashes_models::{AgentTimingConfig, FileInfo, FileType};

pub use errors::ClientError;

/// Header carrying the server-side digest of a download.
pub const CONTENT_MD5_HEADER: &str = "x-content-md5";

pub struct ServerClient {
    http_client: Client,
    base_url: String,
}

impl ServerClient {
    /// Builds a client with the agent's credentials as default headers.
    pub fn new(base_url: &str, agent_id: i64, api_key: &str) -> Result<Self, ClientError> {
        let trimmed = base_url.trim_end_matches('/');
        if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
            return Err(ClientError::InvalidBaseUrl(base_url.to_string()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(api_key)
                .map_err(|_| ClientError::InvalidBaseUrl("api key is not header-safe".into()))?,
        );
        headers.insert(
            "x-agent-id",
            HeaderValue::from_str(&agent_id.to_string())
                .map_err(|_| ClientError::InvalidBaseUrl("agent id is not header-safe".into()))?,
        );

        Ok(Self {
            http_client: Client::builder()
                .default_headers(headers)
                .build()
                .map_err(ClientError::Network)?,
            base_url: trimmed.to_string(),
        })
    }

    /// Fetched on every connect so timing changes apply at reconnect.
    #[instrument(skip(self))]
    pub async fn fetch_timing_config(&self) -> Result<AgentTimingConfig, ClientError> {
        let response = self
            .http_client
            .get(format!("{}/api/agent/config", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        Ok(response.json::<AgentTimingConfig>().await?)
    }

    /// Downloads a registered file, verifying the MD5 the server advertises.
    #[instrument(skip(self, destination), fields(name = %file.name))]
    pub async fn download_file(
        &self,
        file: &FileInfo,
        destination: &Path,
    ) -> Result<(), ClientError> {
        let url = format!(
            "{}/api/agent/files/{}/{}",
            self.base_url,
            file.file_type.as_str(),
            file.id
        );
        // Hashlists skip digest verification: their content changes under
        // regeneration and the extra hashing pass buys nothing.
        let verify = file.file_type != FileType::Hashlist;
        self.stream_to_disk(&url, destination, verify.then_some(file.md5.as_str()), &file.name)
            .await
    }

    /// Downloads the uncracked hashlist file. `association_mode` requests
    /// the original upload, which keeps 1:1 line correspondence for attack
    /// mode 9.
    #[instrument(skip(self, destination))]
    pub async fn download_hashlist(
        &self,
        hashlist_id: Uuid,
        association_mode: bool,
        destination: &Path,
    ) -> Result<(), ClientError> {
        let url = if association_mode {
            format!("{}/api/agent/hashlists/{hashlist_id}?mode=9", self.base_url)
        } else {
            format!("{}/api/agent/hashlists/{hashlist_id}", self.base_url)
        };
        self.stream_to_disk(&url, destination, None, "hashlist").await
    }

    /// Downloads a rule chunk materialized for a rule-split task.
    #[instrument(skip(self, destination))]
    pub async fn download_rule_chunk(
        &self,
        job_dir: &str,
        chunk_name: &str,
        destination: &Path,
    ) -> Result<(), ClientError> {
        let url = format!(
            "{}/api/agent/rules/chunks/{job_dir}/{chunk_name}",
            self.base_url
        );
        self.stream_to_disk(&url, destination, None, chunk_name).await
    }

    /// In-band certificate renewal, tried once when the TLS handshake is
    /// rejected for a stale client certificate.
    pub async fn renew_certificate(&self) -> Result<Vec<u8>, ClientError> {
        let response = self
            .http_client
            .post(format!("{}/api/agent/certificate/renew", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn stream_to_disk(
        &self,
        url: &str,
        destination: &Path,
        expected_md5: Option<&str>,
        label: &str,
    ) -> Result<(), ClientError> {
        let response = self.http_client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ClientError::Rejected { status: 404, detail: format!("{label} not found") });
        }
        if !response.status().is_success() {
            return Err(rejected(response).await);
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let partial = destination.with_extension("part");
        let mut file = fs::File::create(&partial).await?;
        let mut digest = Md5::new();
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            digest.update(&chunk);
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.sync_all().await?;
        drop(file);

        if let Some(expected) = expected_md5 {
            let computed = hex::encode(digest.finalize());
            if !computed.eq_ignore_ascii_case(expected) {
                // Leave nothing behind a retry could mistake for a good file.
                let _ = fs::remove_file(&partial).await;
                warn!("[DOWNLOAD]: digest mismatch on {label}");
                return Err(ClientError::DigestMismatch {
                    name: label.to_string(),
                    expected: expected.to_string(),
                    computed,
                });
            }
        }

        fs::rename(&partial, destination).await?;
        debug!("[DOWNLOAD]: {label} stored ({written} bytes)");
        Ok(())
    }
}

async fn rejected(response: reqwest::Response) -> ClientError {
    let status = response.status().as_u16();
    let detail = response.text().await.unwrap_or_default();
    info!("[UPLINK]: request rejected with {status}");
    ClientError::Rejected { status, detail }
}
