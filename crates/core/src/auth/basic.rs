use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::StatusCode;

use super::{AuthStrategy, ProxyAuthenticateHeader};
use crate::connect::{ConnectResponse, ProxyConnection};
use crate::credentials::CredentialStore;
use crate::error::ProxyError;

/// Single-round Basic auth: read the challenge's `realm`, fetch the
/// matching credentials, and re-issue CONNECT with the encoded value.
pub struct BasicAuth {
	credentials: Arc<dyn CredentialStore>,
}

impl BasicAuth {
	pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
		Self { credentials }
	}
}

#[async_trait]
impl AuthStrategy for BasicAuth {
	async fn authorize(
		&self,
		initial: &ConnectResponse,
		conn: &mut ProxyConnection,
	) -> Result<(), ProxyError> {
		let header = ProxyAuthenticateHeader::parse(initial.proxy_authenticate.as_deref());
		let ProxyAuthenticateHeader::Basic { options } = header else {
			return Err(ProxyError::AuthFailed("wrong auth header for Basic".into()));
		};
		let realm = options.get("realm").cloned().unwrap_or_default();
		let creds = self.credentials.credentials(&realm)?;
		let userpass = format!("{}:{}", creds.username, creds.password);
		let encoded = BASE64.encode(userpass.as_bytes());
		let resp = conn.connect(Some(&format!("Basic {encoded}"))).await?;
		if resp.status == StatusCode::OK {
			Ok(())
		} else {
			Err(ProxyError::AuthFailed(format!(
				"basic auth rejected: {}",
				resp.status
			)))
		}
	}
}
