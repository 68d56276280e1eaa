use std::sync::Arc;

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use reqwest::{
    header::{HeaderValue, AUTHORIZATION},
    Client, Request, Response, StatusCode,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::{credentials::CredentialStore, SignOutHandler};

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Serialize)]
struct RefreshRequest {
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

type PendingRefresh = Shared<BoxFuture<'static, Option<String>>>;

/// Authenticated request pipeline: attaches the current bearer token to
/// every outgoing call and, on an unauthorized response, performs one
/// coordinated credential refresh shared by all concurrent callers before
/// replaying the original request exactly once.
pub struct AuthHttp {
    http: Client,
    credentials: Arc<CredentialStore>,
    refresh_url: Url,
    inflight_refresh: Mutex<Option<PendingRefresh>>,
    on_sign_out: SignOutHandler,
}

impl AuthHttp {
    pub fn new(
        credentials: Arc<CredentialStore>,
        refresh_url: Url,
        on_sign_out: SignOutHandler,
    ) -> Arc<Self> {
        Arc::new(Self {
            http: Client::new(),
            credentials,
            refresh_url,
            inflight_refresh: Mutex::new(None),
            on_sign_out,
        })
    }

    /// Builder access for composing requests that will go through
    /// [`execute`](AuthHttp::execute).
    pub fn client(&self) -> &Client {
        &self.http
    }

    /// Sends `request` with the current access token attached. On a 401 the
    /// pipeline refreshes credentials (single-flight across callers) and
    /// replays a clone of the original request once; the replayed response
    /// is final whatever its status. Failures other than 401 are never
    /// retried here.
    pub async fn execute(self: &Arc<Self>, mut request: Request) -> Result<Response, RequestError> {
        // The clone is taken before any header mutation so the replay can be
        // rebuilt without re-deriving an already-consumed body.
        let replay = request.try_clone();

        if let Some(token) = self.credentials.access_token().await {
            if let Some(value) = bearer(&token) {
                request.headers_mut().insert(AUTHORIZATION, value);
            }
        }

        let response = self.http.execute(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED || self.is_refresh_call(response.url()) {
            return Ok(response);
        }

        let Some(mut replay) = replay else {
            debug!("auth: unauthorized response on a non-replayable request");
            return Ok(response);
        };

        match self.refresh_access_token().await {
            Some(token) => {
                replay.headers_mut().remove(AUTHORIZATION);
                if let Some(value) = bearer(&token) {
                    replay.headers_mut().insert(AUTHORIZATION, value);
                }
                Ok(self.http.execute(replay).await?)
            }
            // Sign-out already fired inside the refresh; hand the caller the
            // original unauthorized response.
            None => Ok(response),
        }
    }

    /// Collapses concurrent refresh triggers onto one pending call. All
    /// waiters observe the same outcome; the in-flight slot is cleared
    /// before waiters resume, success or failure. On failure the stored
    /// credentials are cleared and the sign-out hook fires exactly once.
    pub async fn refresh_access_token(self: &Arc<Self>) -> Option<String> {
        let pending = {
            let mut slot = self.inflight_refresh.lock().await;
            match slot.as_ref() {
                Some(pending) => pending.clone(),
                None => {
                    let this = Arc::clone(self);
                    let pending = async move {
                        let outcome = this.perform_refresh().await;
                        *this.inflight_refresh.lock().await = None;
                        if outcome.is_none() {
                            this.credentials.clear().await;
                            (this.on_sign_out)();
                        }
                        outcome
                    }
                    .boxed()
                    .shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// Network failure is treated identically to an explicit rejection:
    /// both resolve to "no token".
    async fn perform_refresh(&self) -> Option<String> {
        let Some(refresh_token) = self.credentials.refresh_token().await else {
            warn!("auth: no refresh token available");
            return None;
        };

        let response = match self
            .http
            .post(self.refresh_url.clone())
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!("auth: credential refresh failed: {err}");
                return None;
            }
        };

        if !response.status().is_success() {
            warn!(status = %response.status(), "auth: credential refresh rejected");
            return None;
        }

        let body: RefreshResponse = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                warn!("auth: invalid refresh response: {err}");
                return None;
            }
        };

        self.credentials
            .rotate(body.access_token.clone(), body.refresh_token)
            .await;
        debug!("auth: access token refreshed");
        Some(body.access_token)
    }

    fn is_refresh_call(&self, url: &Url) -> bool {
        url.path() == self.refresh_url.path()
    }
}

fn bearer(token: &str) -> Option<HeaderValue> {
    match HeaderValue::from_str(&format!("Bearer {token}")) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("auth: access token is not a valid header value");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/http_tests.rs"]
mod tests;
