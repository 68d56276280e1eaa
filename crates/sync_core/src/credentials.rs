use tokio::sync::RwLock;

/// Current access/refresh tokens, each an opaque bearer string or absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialPair {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// Single source of truth for tokens. The pair is replaced atomically and
/// only through [`replace`](CredentialStore::replace) (login),
/// [`rotate`](CredentialStore::rotate) (refresh outcome) and
/// [`clear`](CredentialStore::clear) (logout); the request pipeline and the
/// connection manager read it but never write.
#[derive(Debug, Default)]
pub struct CredentialStore {
    inner: RwLock<CredentialPair>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn access_token(&self) -> Option<String> {
        self.inner.read().await.access_token.clone()
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.inner.read().await.refresh_token.clone()
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.read().await.access_token.is_some()
    }

    pub async fn replace(&self, pair: CredentialPair) {
        *self.inner.write().await = pair;
    }

    /// Refresh outcome: a new access token always, a new refresh token only
    /// when the server rotated it.
    pub async fn rotate(&self, access_token: String, refresh_token: Option<String>) {
        let mut guard = self.inner.write().await;
        guard.access_token = Some(access_token);
        if let Some(refresh_token) = refresh_token {
            guard.refresh_token = Some(refresh_token);
        }
    }

    pub async fn clear(&self) {
        *self.inner.write().await = CredentialPair::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rotate_keeps_refresh_token_unless_server_rotates_it() {
        let store = CredentialStore::new();
        store
            .replace(CredentialPair {
                access_token: Some("a1".into()),
                refresh_token: Some("r1".into()),
            })
            .await;

        store.rotate("a2".into(), None).await;
        assert_eq!(store.access_token().await.as_deref(), Some("a2"));
        assert_eq!(store.refresh_token().await.as_deref(), Some("r1"));

        store.rotate("a3".into(), Some("r2".into())).await;
        assert_eq!(store.access_token().await.as_deref(), Some("a3"));
        assert_eq!(store.refresh_token().await.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn clear_wipes_both_tokens() {
        let store = CredentialStore::new();
        store
            .replace(CredentialPair {
                access_token: Some("a1".into()),
                refresh_token: Some("r1".into()),
            })
            .await;
        assert!(store.is_authenticated().await);

        store.clear().await;
        assert!(!store.is_authenticated().await);
        assert_eq!(store.access_token().await, None);
        assert_eq!(store.refresh_token().await, None);
    }
}
