use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use shared::{
    domain::{ChannelId, WorkspaceId},
    protocol::TimelineItem,
};

pub mod config;
pub mod connection;
pub mod credentials;
pub mod http;
pub mod timeline;

pub use config::{load_settings, Settings};
pub use connection::{ConnectError, ConnectionManager, ConnectionPhase, LeaderBus, LiveGateway};
pub use credentials::{CredentialPair, CredentialStore};
pub use http::{AuthHttp, RequestError};
pub use timeline::Timeline;

/// Invoked when the session must return to the unauthenticated entry point
/// (failed credential refresh, or an unauthorized error envelope). The host
/// application supplies the actual navigation.
pub type SignOutHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Serialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    refresh_token: String,
}

/// One tab's view of the synchronization core: credential store, request
/// pipeline, connection manager and timeline construction wired together.
/// Every tab in a browser profile shares one [`LeaderBus`].
pub struct SyncClient {
    settings: Settings,
    credentials: Arc<CredentialStore>,
    http: Arc<AuthHttp>,
    manager: Arc<ConnectionManager>,
}

impl SyncClient {
    pub fn new(settings: Settings, bus: LeaderBus, on_sign_out: SignOutHandler) -> Result<Self> {
        let credentials = Arc::new(CredentialStore::new());
        let refresh_url = Url::parse(&format!(
            "{}/auth/refresh",
            settings.endpoint_base.trim_end_matches('/')
        ))
        .context("invalid endpoint base")?;
        let http = AuthHttp::new(
            Arc::clone(&credentials),
            refresh_url,
            Arc::clone(&on_sign_out),
        );
        let manager = ConnectionManager::new(
            settings.clone(),
            Arc::clone(&credentials),
            bus,
            on_sign_out,
        );
        Ok(Self {
            settings,
            credentials,
            http,
            manager,
        })
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let response = self
            .http
            .client()
            .post(format!(
                "{}/auth/login",
                self.settings.endpoint_base.trim_end_matches('/')
            ))
            .json(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?
            .error_for_status()?;
        let body: LoginResponse = response.json().await?;
        self.credentials
            .replace(CredentialPair {
                access_token: Some(body.access_token),
                refresh_token: Some(body.refresh_token),
            })
            .await;
        info!(username, "session: logged in");
        Ok(())
    }

    /// Clears stored credentials and tears the live connection down; no
    /// further reconnects are scheduled.
    pub async fn logout(&self) {
        self.credentials.clear().await;
        self.manager.shutdown().await;
        info!("session: logged out");
    }

    /// Initial snapshot for a conversation, fetched through the
    /// authenticated pipeline, ordered as the server returns it.
    pub async fn fetch_timeline(
        &self,
        channel: ChannelId,
        limit: u32,
    ) -> Result<Vec<TimelineItem>> {
        let request = self
            .http
            .client()
            .get(format!(
                "{}/channels/{}/messages",
                self.settings.endpoint_base.trim_end_matches('/'),
                channel.0
            ))
            .query(&[("limit", limit)])
            .build()?;
        let response = self.http.execute(request).await?.error_for_status()?;
        Ok(response.json().await?)
    }

    /// A reconciliation engine bound to this tab's live gateway.
    pub fn timeline(&self) -> Arc<Timeline> {
        Timeline::new(Arc::clone(&self.manager) as Arc<dyn LiveGateway>)
    }

    pub async fn activate_tab(&self, workspace: WorkspaceId) {
        self.manager.activate(workspace).await;
    }

    pub async fn deactivate_tab(&self) {
        self.manager.deactivate().await;
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn http(&self) -> &Arc<AuthHttp> {
        &self.http
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
