use std::cell::RefCell;

use crate::error::{AuthError, RemoteError};

/// Opaque credential attached to every remote-store call.
#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AuthToken(pub String);

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print the credential itself
        write!(f, "AuthToken(<{} bytes>)", self.0.len())
    }
}

pub trait AuthProvider {
    /// The current token, possibly cached by the provider.
    fn token(&self) -> impl Future<Output = Result<AuthToken, AuthError>>;

    /// Obtains a fresh token after the current one was refused.
    fn refresh(&self) -> impl Future<Output = Result<AuthToken, AuthError>>;
}

/// A provider that always hands out the same token. Refreshing is not possible.
#[derive(Clone, Debug)]
pub struct StaticToken(pub AuthToken);

impl AuthProvider for StaticToken {
    async fn token(&self) -> Result<AuthToken, AuthError> {
        Ok(self.0.clone())
    }

    async fn refresh(&self) -> Result<AuthToken, AuthError> {
        Err(AuthError::Unavailable("static token cannot be refreshed".to_string()))
    }
}

/// Wraps an [`AuthProvider`] so callers never see an expired token unless refreshing also failed.
pub struct Authenticator<A> {
    provider: A,
    cached: RefCell<Option<AuthToken>>,
}

impl<A: AuthProvider> Authenticator<A> {
    pub fn new(provider: A) -> Self {
        Self {
            provider,
            cached: RefCell::new(None),
        }
    }

    pub async fn token(&self) -> Result<AuthToken, AuthError> {
        if let Some(token) = self.cached.borrow().clone() {
            return Ok(token);
        }
        let token = self.provider.token().await?;
        *self.cached.borrow_mut() = Some(token.clone());
        Ok(token)
    }

    /// Runs `op` with the current token. If the remote store says the token expired, refreshes once
    /// and runs `op` again; a second failure is returned as-is.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, RemoteError>
    where
        F: Fn(AuthToken) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let token = self.token().await?;
        match op(token).await {
            Err(RemoteError::Auth(AuthError::Expired)) => {
                log::info!("Auth token expired, refreshing");
                *self.cached.borrow_mut() = None;
                let fresh = self
                    .provider
                    .refresh()
                    .await
                    .inspect_err(|e| log::warn!("Token refresh failed: {e}"))?;
                *self.cached.borrow_mut() = Some(fresh.clone());
                op(fresh).await
            }
            other => other,
        }
    }

    pub fn forget(&self) {
        *self.cached.borrow_mut() = None;
    }
}
