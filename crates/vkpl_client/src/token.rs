#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

/// Tokens are treated as expired this long before their actual deadline
/// so in-flight requests never race the real expiry.
pub const EXPIRY_SHIFT_MINUTES: i64 = 10;

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// OAuth credentials for the sending account.
#[derive(Debug, Clone)]
pub struct TokenAuth {
	pub access_token: SecretString,
	pub refresh_token: Option<SecretString>,
	pub expires_at: Option<DateTime<Utc>>,
	/// Device/client id, sent as `X-From-Id` and used as `device_id`
	/// when refreshing.
	pub client_id: Option<String>,
}

impl TokenAuth {
	/// Whether the access token is past (or within the shift window of)
	/// its deadline. Tokens without a known deadline never expire here.
	pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
		match self.expires_at {
			Some(deadline) => now + Duration::minutes(EXPIRY_SHIFT_MINUTES) >= deadline,
			None => false,
		}
	}
}

/// Shared credential cell. The session, the REST collaborator and the
/// transport all hold clones, so a refresh is visible everywhere at once.
/// Refreshing itself is serialized through [`TokenStore::refresh_guard`].
#[derive(Clone)]
pub struct TokenStore {
	inner: Arc<TokenStoreInner>,
}

struct TokenStoreInner {
	auth: RwLock<Option<TokenAuth>>,
	refresh_lock: tokio::sync::Mutex<()>,
}

impl TokenStore {
	pub fn new(auth: Option<TokenAuth>) -> Self {
		Self {
			inner: Arc::new(TokenStoreInner {
				auth: RwLock::new(auth),
				refresh_lock: tokio::sync::Mutex::new(()),
			}),
		}
	}

	pub fn is_authenticated(&self) -> bool {
		self.inner.auth.read().is_some()
	}

	pub fn snapshot(&self) -> Option<TokenAuth> {
		self.inner.auth.read().clone()
	}

	pub fn access_token(&self) -> Option<SecretString> {
		self.inner.auth.read().as_ref().map(|auth| auth.access_token.clone())
	}

	pub fn client_id(&self) -> Option<String> {
		self.inner.auth.read().as_ref().and_then(|auth| auth.client_id.clone())
	}

	/// True when the current token is expired and a refresh token exists
	/// to do something about it.
	pub fn needs_refresh(&self) -> bool {
		let guard = self.inner.auth.read();
		match guard.as_ref() {
			Some(auth) => auth.refresh_token.is_some() && auth.is_expired_at(Utc::now()),
			None => false,
		}
	}

	/// Overwrite the shared credentials. Every holder of this store sees
	/// the new token on its next read.
	pub fn replace(&self, auth: TokenAuth) {
		*self.inner.auth.write() = Some(auth);
	}

	/// Single-flight guard for refresh calls. Hold the guard, re-check
	/// [`TokenStore::needs_refresh`], then refresh.
	pub async fn refresh_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
		self.inner.refresh_lock.lock().await
	}
}
