use crate::error::ProxyError;

/// Credentials used to authenticate to an upstream proxy. Immutable once
/// obtained; lifetime is the process (spec §3).
#[derive(Clone, Debug, Default)]
pub struct Credentials {
	pub username: String,
	pub password: String,
	pub realm: String,
	/// Domain NTLM should bind to. Distinct from `realm` (Open Question (a)
	/// in SPEC_FULL.md §9): the original source overloads `realm` as the
	/// NTLM domain, which doesn't hold for every deployment.
	pub ntlm_domain: Option<String>,
}

/// Looks up credentials by a realm/host key. A single configured identity
/// may simply ignore `key` and return the same `Credentials` regardless,
/// which is how `StaticCredentials` behaves below.
pub trait CredentialStore: Send + Sync {
	fn credentials(&self, key: &str) -> Result<Credentials, ProxyError>;
}

/// One identity shared across Basic, NTLM, and SPNEGO — matches the
/// original, which configures a single account for the whole process.
pub struct StaticCredentials(pub Credentials);

impl CredentialStore for StaticCredentials {
	fn credentials(&self, _key: &str) -> Result<Credentials, ProxyError> {
		Ok(self.0.clone())
	}
}

/// Looks the password up from the OS keychain on first use and caches it
/// for the remainder of the process.
pub struct KeyringCredentials {
	entry: keyring::Entry,
	username: String,
	realm: String,
	ntlm_domain: Option<String>,
	cached: once_cell::sync::OnceCell<String>,
}

impl KeyringCredentials {
	pub fn new(
		service: &str,
		username: &str,
		realm: String,
		ntlm_domain: Option<String>,
	) -> Result<Self, ProxyError> {
		let entry = keyring::Entry::new(service, username)
			.map_err(|e| ProxyError::Configuration(format!("keyring entry: {e}")))?;
		Ok(Self {
			entry,
			username: username.to_string(),
			realm,
			ntlm_domain,
			cached: once_cell::sync::OnceCell::new(),
		})
	}
}

impl CredentialStore for KeyringCredentials {
	fn credentials(&self, _key: &str) -> Result<Credentials, ProxyError> {
		let password = self.cached.get_or_try_init(|| {
			self
				.entry
				.get_password()
				.map_err(|e| ProxyError::Configuration(format!("keyring lookup failed: {e}")))
		})?;
		Ok(Credentials {
			username: self.username.clone(),
			password: password.clone(),
			realm: self.realm.clone(),
			ntlm_domain: self.ntlm_domain.clone(),
		})
	}
}
