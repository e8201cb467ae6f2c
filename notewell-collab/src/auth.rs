//! Relay authentication capability.
//!
//! The session manager never talks to the host application's auth backend
//! directly — it is handed a [`TokenProvider`] at construction time and asks
//! it for a fresh credential before *every* connection attempt (tokens are
//! short-lived and may expire between session start and a later reconnect,
//! so they are never cached).
//!
//! Returning `None` signals an auth failure; the manager surfaces it as an
//! error state rather than propagating it to callers.

use futures_util::future::BoxFuture;
use std::future::Future;

/// Asynchronous source of fresh relay credentials.
///
/// Implemented for any `Fn() -> impl Future<Output = Option<String>>`, so a
/// closure over an HTTP client (or a canned value in tests) plugs straight
/// in:
///
/// ```ignore
/// let provider = Arc::new(|| async { Some("tok-a".to_string()) });
/// ```
pub trait TokenProvider: Send + Sync {
    fn fetch_token(&self) -> BoxFuture<'static, Option<String>>;
}

impl<F, Fut> TokenProvider for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Option<String>> + Send + 'static,
{
    fn fetch_token(&self) -> BoxFuture<'static, Option<String>> {
        Box::pin(self())
    }
}

/// Provider that always hands out the same token. Handy for demos and for
/// tests that do not exercise expiry.
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn fetch_token(&self) -> BoxFuture<'static, Option<String>> {
        let token = self.0.clone();
        Box::pin(async move { Some(token) })
    }
}
