//! Access token sources
//!
//! The core only reads tokens. Storage, refresh and encryption belong to the
//! collaborator that implements [`TokenProvider`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{RealtimeError, Result};

/// Supplies the current access token
///
/// Called on every connect and reconnect, so a rotated token is picked up
/// by the next attempt.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> std::result::Result<Option<String>, String>;
}

/// Where `connect` gets its token from
#[derive(Clone, Default)]
pub enum TokenSource {
    /// Connect without a token
    #[default]
    None,
    /// A fixed token value
    Static(String),
    /// A sync or async provider
    Provider(Arc<dyn TokenProvider>),
}

impl TokenSource {
    pub fn from_static(token: impl Into<String>) -> Self {
        Self::Static(token.into())
    }

    pub fn from_provider(provider: impl TokenProvider + 'static) -> Self {
        Self::Provider(Arc::new(provider))
    }

    /// Wrap a synchronous closure
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        Self::Provider(Arc::new(SyncFnProvider(f)))
    }

    /// Wrap an asynchronous closure
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<String>, String>> + Send + 'static,
    {
        Self::Provider(Arc::new(AsyncFnProvider(f)))
    }

    /// Resolve the token for one connect attempt
    ///
    /// Blank tokens are treated as absent.
    pub async fn resolve(&self) -> Result<Option<String>> {
        let token = match self {
            TokenSource::None => None,
            TokenSource::Static(token) => Some(token.clone()),
            TokenSource::Provider(provider) => {
                provider.access_token().await.map_err(RealtimeError::Token)?
            }
        };
        Ok(token.filter(|t| !t.trim().is_empty()))
    }
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenSource::None => write!(f, "TokenSource::None"),
            TokenSource::Static(_) => write!(f, "TokenSource::Static(<redacted>)"),
            TokenSource::Provider(_) => write!(f, "TokenSource::Provider(..)"),
        }
    }
}

struct SyncFnProvider<F>(F);

#[async_trait]
impl<F> TokenProvider for SyncFnProvider<F>
where
    F: Fn() -> Option<String> + Send + Sync,
{
    async fn access_token(&self) -> std::result::Result<Option<String>, String> {
        Ok((self.0)())
    }
}

struct AsyncFnProvider<F>(F);

#[async_trait]
impl<F, Fut> TokenProvider for AsyncFnProvider<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Option<String>, String>> + Send,
{
    async fn access_token(&self) -> std::result::Result<Option<String>, String> {
        (self.0)().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_static_and_none() {
        assert_eq!(TokenSource::None.resolve().await.unwrap(), None);
        assert_eq!(
            TokenSource::from_static("abc").resolve().await.unwrap(),
            Some("abc".to_string())
        );
        assert_eq!(TokenSource::from_static("  ").resolve().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sync_provider_is_called_each_time() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let source = TokenSource::from_fn(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Some(format!("token-{n}"))
        });

        assert_eq!(source.resolve().await.unwrap(), Some("token-0".to_string()));
        assert_eq!(source.resolve().await.unwrap(), Some("token-1".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_async_provider_error() {
        let source = TokenSource::from_async(|| async { Err("session expired".to_string()) });
        let err = source.resolve().await.unwrap_err();
        assert_eq!(err, RealtimeError::Token("session expired".to_string()));

        let source = TokenSource::from_async(|| async { Ok(Some("fresh".to_string())) });
        assert_eq!(source.resolve().await.unwrap(), Some("fresh".to_string()));
    }

    #[test]
    fn test_debug_redacts_static_token() {
        let rendered = format!("{:?}", TokenSource::from_static("secret"));
        assert!(!rendered.contains("secret"));
    }
}
