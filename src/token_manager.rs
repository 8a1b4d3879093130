// Credential exchange and access-token cache.
//
// Clients present long-lived refresh credentials in one of two shapes:
//   Kiro     — a single opaque refresh token
//   AmazonQ  — clientId:clientSecret:refreshToken
// Each is exchanged at its vendor endpoint for a short-lived access token,
// cached under sha256(credential). Cached tokens are returned without
// expiry checks; a 45-minute background sweep keeps them fresh, and a 403
// from the upstream evicts the entry so the next request re-exchanges.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{
    AMAZONQ_OIDC_HEADERS, AMAZONQ_TOKEN_URL, KIRO_REFRESH_URL, TOKEN_REFRESH_INTERVAL_SECS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Kiro,
    AmazonQ,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCredential {
    pub kind: CredentialKind,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

/// Split on the first two colons. Three parts with non-empty first and
/// third classify as AmazonQ; anything else is a Kiro refresh token. The
/// middle field may be empty.
pub fn parse_credential(raw: &str) -> ParsedCredential {
    let parts: Vec<&str> = raw.splitn(3, ':').collect();
    if parts.len() == 3 && !parts[0].is_empty() && !parts[2].is_empty() {
        return ParsedCredential {
            kind: CredentialKind::AmazonQ,
            client_id: parts[0].to_string(),
            client_secret: parts[1].to_string(),
            refresh_token: parts[2].to_string(),
        };
    }
    ParsedCredential {
        kind: CredentialKind::Kiro,
        client_id: String::new(),
        client_secret: String::new(),
        refresh_token: raw.to_string(),
    }
}

pub fn credential_hash(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone)]
struct TokenCacheEntry {
    access_token: String,
    credential: ParsedCredential,
    profile_arn: Option<String>,
    last_refresh: Instant,
}

/// Exchanged access token handed to the request path.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub profile_arn: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("refresh request failed: {0}")]
    Network(String),
    #[error("refresh rejected: status {status}, {body}")]
    Rejected { status: u16, body: String },
    #[error("refresh response missing accessToken")]
    MalformedResponse,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
    #[serde(rename = "profileArn")]
    profile_arn: Option<String>,
}

pub struct TokenManager {
    entries: DashMap<String, TokenCacheEntry>,
    client: reqwest::Client,
    /// Per-credential refresh lock; concurrent first requests for one
    /// credential collapse into a single upstream exchange.
    refresh_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    cancel: CancellationToken,
}

impl TokenManager {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            entries: DashMap::new(),
            client,
            refresh_locks: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Access token for a raw credential: cached if present, exchanged on
    /// first sight.
    pub async fn get_or_refresh(&self, credential: &str) -> Result<AccessToken, TokenError> {
        let hash = credential_hash(credential);

        if let Some(entry) = self.entries.get(&hash) {
            return Ok(AccessToken {
                token: entry.access_token.clone(),
                profile_arn: entry.profile_arn.clone(),
            });
        }

        let lock = self
            .refresh_locks
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another request may have completed the exchange while we waited.
        if let Some(entry) = self.entries.get(&hash) {
            return Ok(AccessToken {
                token: entry.access_token.clone(),
                profile_arn: entry.profile_arn.clone(),
            });
        }

        let parsed = parse_credential(credential);
        let response = self.exchange(&parsed).await?;
        let access_token = response.access_token.ok_or(TokenError::MalformedResponse)?;

        self.entries.insert(
            hash,
            TokenCacheEntry {
                access_token: access_token.clone(),
                credential: parsed,
                profile_arn: response.profile_arn.clone(),
                last_refresh: Instant::now(),
            },
        );

        Ok(AccessToken {
            token: access_token,
            profile_arn: response.profile_arn,
        })
    }

    /// Drop the cache entry for a credential; the next request performs a
    /// fresh exchange. Called when the upstream answers 403.
    pub fn invalidate(&self, credential: &str) {
        let hash = credential_hash(credential);
        if self.entries.remove(&hash).is_some() {
            tracing::info!("invalidated token cache entry after upstream 403");
        }
    }

    pub fn cached_count(&self) -> usize {
        self.entries.len()
    }

    /// Refresh every cached entry in place; entries whose exchange fails
    /// are evicted.
    pub async fn refresh_all(&self) {
        let snapshot: Vec<(String, ParsedCredential)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().credential.clone()))
            .collect();

        if snapshot.is_empty() {
            return;
        }

        let mut refreshed = 0usize;
        for (hash, credential) in &snapshot {
            match self.exchange(credential).await {
                Ok(response) => match response.access_token {
                    Some(access_token) => {
                        if let Some(mut entry) = self.entries.get_mut(hash) {
                            entry.access_token = access_token;
                            if response.profile_arn.is_some() {
                                entry.profile_arn = response.profile_arn;
                            }
                            entry.last_refresh = Instant::now();
                        }
                        refreshed += 1;
                    }
                    None => {
                        self.entries.remove(hash);
                    }
                },
                Err(err) => {
                    tracing::warn!(%err, "token refresh failed, evicting entry");
                    self.entries.remove(hash);
                }
            }
        }

        tracing::info!(refreshed, total = snapshot.len(), "token refresh sweep complete");
    }

    /// Background refresher at the fixed 45-minute cadence.
    pub fn start_refresher(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                TOKEN_REFRESH_INTERVAL_SECS,
            ));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("token refresher stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        manager.refresh_all().await;
                    }
                }
            }
        });

        tracing::info!("token refresher started (interval: 45m)");
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Seconds since the entry for this credential was last refreshed.
    pub fn last_refresh_age(&self, credential: &str) -> Option<std::time::Duration> {
        self.entries
            .get(&credential_hash(credential))
            .map(|entry| entry.last_refresh.elapsed())
    }

    async fn exchange(&self, credential: &ParsedCredential) -> Result<RefreshResponse, TokenError> {
        match credential.kind {
            CredentialKind::Kiro => self.exchange_kiro(&credential.refresh_token).await,
            CredentialKind::AmazonQ => self.exchange_amazonq(credential).await,
        }
    }

    async fn exchange_kiro(&self, refresh_token: &str) -> Result<RefreshResponse, TokenError> {
        let response = self
            .client
            .post(KIRO_REFRESH_URL)
            .header("Content-Type", "application/json")
            .json(&json!({ "refreshToken": refresh_token }))
            .send()
            .await
            .map_err(|e| TokenError::Network(e.to_string()))?;

        Self::read_refresh_response(response).await
    }

    async fn exchange_amazonq(
        &self,
        credential: &ParsedCredential,
    ) -> Result<RefreshResponse, TokenError> {
        let mut request = self.client.post(AMAZONQ_TOKEN_URL).json(&json!({
            "grantType": "refresh_token",
            "clientId": credential.client_id,
            "clientSecret": credential.client_secret,
            "refreshToken": credential.refresh_token,
        }));
        for (name, value) in AMAZONQ_OIDC_HEADERS {
            request = request.header(*name, *value);
        }
        request = request.header("amz-sdk-invocation-id", Uuid::new_v4().to_string());

        let response = request
            .send()
            .await
            .map_err(|e| TokenError::Network(e.to_string()))?;

        Self::read_refresh_response(response).await
    }

    async fn read_refresh_response(
        response: reqwest::Response,
    ) -> Result<RefreshResponse, TokenError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<RefreshResponse>()
            .await
            .map_err(|_| TokenError::MalformedResponse)
    }
}
