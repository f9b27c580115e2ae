//! REST client for the outreach platform API.
//!
//! Uses reqwest with `X-API-KEY` auth. When a residential proxy is
//! configured, each sending identity gets its own `reqwest::Client` whose
//! proxy username pins the identity's country, state and sticky session, so
//! every call from one account leaves through the same egress.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use url::Url;

use super::PlatformClient;
use crate::error::{DispatchError, EngineError};
use crate::identity::SendingIdentity;
use crate::types::{InvitationStatus, MessageKind, PlatformConfig, ProxyConfig};

/// Map a non-success HTTP status to a classified dispatch error.
pub fn classify_status(status: u16, message: String) -> DispatchError {
    match status {
        408 => DispatchError::Timeout,
        429 => DispatchError::RateLimited,
        500..=599 => DispatchError::Server { status, message },
        400 | 404 | 422 => DispatchError::InvalidTarget(message),
        409 => DispatchError::DuplicateInvitation,
        410 => DispatchError::InvitationWithdrawn,
        _ => DispatchError::Rejected { status, message },
    }
}

#[derive(Debug, Default, Deserialize)]
struct ProfileResponse {
    #[serde(default)]
    network_distance: Option<String>,
    #[serde(default)]
    invitation: Option<InvitationInfo>,
}

#[derive(Debug, Default, Deserialize)]
struct InvitationInfo {
    #[serde(default)]
    status: Option<String>,
}

fn invitation_status_from(profile: &ProfileResponse) -> InvitationStatus {
    if profile.network_distance.as_deref() == Some("FIRST_DEGREE") {
        return InvitationStatus::Accepted;
    }
    let status = profile
        .invitation
        .as_ref()
        .and_then(|i| i.status.as_deref())
        .map(str::to_ascii_lowercase);
    match status.as_deref() {
        Some("pending") | Some("sent") => InvitationStatus::Pending,
        Some("accepted") => InvitationStatus::Accepted,
        Some("withdrawn") | Some("declined") | Some("rejected") => InvitationStatus::Withdrawn,
        Some("expired") => InvitationStatus::Expired,
        _ => InvitationStatus::Unknown,
    }
}

#[derive(Debug, Default, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    items: Vec<MessageItem>,
}

#[derive(Debug, Deserialize)]
struct MessageItem {
    #[serde(default)]
    is_sender: bool,
}

pub struct HttpPlatformClient {
    base_url: Url,
    api_key: String,
    timeout: Duration,
    proxy: Option<ProxyConfig>,
    /// One client per (account, egress session).
    clients: Mutex<HashMap<(String, String), reqwest::Client>>,
}

impl HttpPlatformClient {
    pub fn new(config: &PlatformConfig, proxy: Option<ProxyConfig>) -> Result<Self, EngineError> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            EngineError::Config(format!("Invalid platform base URL '{}': {}", config.base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(EngineError::Config(format!(
                "Platform base URL cannot carry paths: {}",
                config.base_url
            )));
        }
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| EngineError::Config("Platform API key is not configured".to_string()))?;

        Ok(Self {
            base_url,
            api_key,
            timeout: Duration::from_secs(config.request_timeout_secs),
            proxy,
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn endpoint(&self, segments: &[&str], query: &[(&str, &str)]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        url
    }

    fn client_for(&self, identity: &SendingIdentity) -> Result<reqwest::Client, DispatchError> {
        let key = (
            identity.account_id.clone(),
            identity.egress.session_id.clone(),
        );
        if let Some(client) = self.clients.lock().get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(proxy) = &self.proxy {
            let username = identity.proxy_username(&proxy.username_prefix);
            let proxy = reqwest::Proxy::all(format!("http://{}:{}", proxy.host, proxy.port))?
                .basic_auth(&username, &proxy.password);
            builder = builder.proxy(proxy);
            log::debug!(
                "Platform: new client for account {} via {}",
                identity.account_id,
                username
            );
        }
        let client = builder.build()?;
        self.clients.lock().insert(key, client.clone());
        Ok(client)
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, DispatchError> {
        let response = request
            .header("X-API-KEY", &self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), body))
    }
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn send(
        &self,
        identity: &SendingIdentity,
        kind: MessageKind,
        target: &str,
        text: &str,
    ) -> Result<(), DispatchError> {
        let client = self.client_for(identity)?;
        let request = match kind {
            MessageKind::Invite => client
                .post(self.endpoint(&["api", "v1", "users", "invite"], &[]))
                .json(&serde_json::json!({
                    "account_id": identity.platform_account_id,
                    "provider_id": target,
                    "message": text,
                })),
            MessageKind::FollowUp => client
                .post(self.endpoint(&["api", "v1", "chats"], &[]))
                .json(&serde_json::json!({
                    "account_id": identity.platform_account_id,
                    "attendees_ids": [target],
                    "text": text,
                })),
        };
        self.execute(request).await?;
        Ok(())
    }

    async fn get_invitation_status(
        &self,
        identity: &SendingIdentity,
        target: &str,
    ) -> Result<InvitationStatus, DispatchError> {
        let client = self.client_for(identity)?;
        let url = self.endpoint(
            &["api", "v1", "users", target],
            &[("account_id", identity.platform_account_id.as_str())],
        );
        let response = self.execute(client.get(url)).await?;
        let profile: ProfileResponse = response.json().await?;
        Ok(invitation_status_from(&profile))
    }

    async fn withdraw_invitation(
        &self,
        identity: &SendingIdentity,
        target: &str,
    ) -> Result<(), DispatchError> {
        let client = self.client_for(identity)?;
        let url = self.endpoint(
            &["api", "v1", "users", "invite", "sent", target],
            &[("account_id", identity.platform_account_id.as_str())],
        );
        self.execute(client.delete(url)).await?;
        Ok(())
    }

    async fn has_replied(
        &self,
        identity: &SendingIdentity,
        target: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, DispatchError> {
        let client = self.client_for(identity)?;
        let after = since.to_rfc3339_opts(SecondsFormat::Secs, true);
        let url = self.endpoint(
            &["api", "v1", "chats", "messages"],
            &[
                ("account_id", identity.platform_account_id.as_str()),
                ("attendee_id", target),
                ("after", after.as_str()),
            ],
        );
        let response = self.execute(client.get(url)).await?;
        let messages: MessagesResponse = response.json().await?;
        Ok(messages.items.iter().any(|m| !m.is_sender))
    }
}
