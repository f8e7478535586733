mod basic;
mod ntlm;
mod spnego;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::debug;

pub use basic::BasicAuth;
pub use ntlm::NtlmAuth;
pub use spnego::SpnegoAuth;

use crate::connect::{ConnectResponse, ProxyConnection};
use crate::credentials::CredentialStore;
use crate::error::ProxyError;

/// A classified `Proxy-Authenticate` challenge (spec §4.B). Only the first
/// challenge in the header is considered authoritative; multiple
/// challenges in one header are not split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyAuthenticateHeader {
	Basic { options: HashMap<String, String> },
	Ntlm { blob: Option<Vec<u8>> },
	Negotiate { blob: Option<Vec<u8>> },
	Unsupported,
}

impl ProxyAuthenticateHeader {
	pub fn parse(raw: Option<&str>) -> Self {
		let Some(raw) = raw else {
			return ProxyAuthenticateHeader::Unsupported;
		};
		if raw.starts_with("Basic ") {
			ProxyAuthenticateHeader::Basic {
				options: parse_options(raw),
			}
		} else if raw.starts_with("NTLM") {
			ProxyAuthenticateHeader::Ntlm {
				blob: parse_data(raw),
			}
		} else if raw.starts_with("Negotiate") {
			ProxyAuthenticateHeader::Negotiate {
				blob: parse_data(raw),
			}
		} else {
			ProxyAuthenticateHeader::Unsupported
		}
	}

	pub fn scheme_token(&self) -> &'static str {
		match self {
			ProxyAuthenticateHeader::Basic { .. } => "Basic",
			ProxyAuthenticateHeader::Ntlm { .. } => "NTLM",
			ProxyAuthenticateHeader::Negotiate { .. } => "Negotiate",
			ProxyAuthenticateHeader::Unsupported => "",
		}
	}
}

fn parse_data(raw: &str) -> Option<Vec<u8>> {
	let (_, rest) = raw.split_once(' ')?;
	let rest = rest.trim();
	if rest.is_empty() {
		return None;
	}
	BASE64.decode(rest).ok()
}

fn parse_options(raw: &str) -> HashMap<String, String> {
	let Some((_, rest)) = raw.split_once(' ') else {
		return HashMap::new();
	};
	let mut opts = HashMap::new();
	for part in rest.split(", ") {
		let Some((key, val)) = part.split_once('=') else {
			continue;
		};
		let key = key.trim().to_ascii_lowercase();
		let val = val.trim().trim_matches('"').trim_end_matches(',');
		opts.insert(key, val.to_string());
	}
	opts
}

/// One authentication scheme. Given the initial 407 response, completes the
/// handshake on `conn`, re-issuing CONNECT as many times as the scheme
/// requires (one for Basic and SPNEGO, up to two more for NTLM).
#[async_trait]
pub trait AuthStrategy: Send + Sync {
	async fn authorize(
		&self,
		initial: &ConnectResponse,
		conn: &mut ProxyConnection,
	) -> Result<(), ProxyError>;
}

/// Inspects a 407's challenge and delegates to the matching strategy
/// (spec §4.D).
pub struct Auth {
	credentials: Arc<dyn CredentialStore>,
	spnego: Option<Arc<SpnegoAuth>>,
}

impl Auth {
	pub fn new(credentials: Arc<dyn CredentialStore>, spnego: Option<Arc<SpnegoAuth>>) -> Self {
		Self { credentials, spnego }
	}

	pub async fn authorize(
		&self,
		initial: &ConnectResponse,
		conn: &mut ProxyConnection,
	) -> Result<(), ProxyError> {
		let header = ProxyAuthenticateHeader::parse(initial.proxy_authenticate.as_deref());
		match &header {
			ProxyAuthenticateHeader::Basic { .. } => {
				debug!("basic proxy-auth");
				BasicAuth::new(self.credentials.clone())
					.authorize(initial, conn)
					.await
			},
			ProxyAuthenticateHeader::Ntlm { .. } => {
				debug!("NTLM proxy-auth");
				let host = authority_host(conn.proxy().as_str());
				let creds = self.credentials.credentials(&host)?;
				NtlmAuth::new(creds).authorize(initial, conn).await
			},
			ProxyAuthenticateHeader::Negotiate { .. } => {
				if let Some(spnego) = &self.spnego {
					debug!("Negotiate proxy-auth");
					spnego.authorize(initial, conn).await
				} else {
					Err(ProxyError::UnsupportedAuth(format!("{header:?}")))
				}
			},
			ProxyAuthenticateHeader::Unsupported => {
				Err(ProxyError::UnsupportedAuth(format!("{header:?}")))
			},
		}
	}
}

impl Auth {
	/// Builds a preemptive `Proxy-Authorization: Basic` value for plain HTTP
	/// forwarding, mirroring the original's `Transport.Proxy` hook setting
	/// `purl.User` unconditionally rather than waiting for a 407 (plain HTTP
	/// forwarding never sees the upstream's challenge, so there is no round
	/// to react to). Returns `None` when no credentials are configured.
	pub fn preemptive_basic(&self, key: &str) -> Option<String> {
		let creds = self.credentials.credentials(key).ok()?;
		if creds.username.is_empty() {
			return None;
		}
		let userpass = format!("{}:{}", creds.username, creds.password);
		Some(format!("Basic {}", BASE64.encode(userpass.as_bytes())))
	}
}

/// The proxy authority, host without port, trailing dot stripped — used to
/// key NTLM credential lookup (spec §4.D).
fn authority_host(proxy_url: &str) -> String {
	let without_scheme = proxy_url.split("://").nth(1).unwrap_or(proxy_url);
	let host = without_scheme.split('/').next().unwrap_or(without_scheme);
	let host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
	host.trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classifies_basic() {
		let h = ProxyAuthenticateHeader::parse(Some("Basic realm=\"Corp\""));
		assert_eq!(h.scheme_token(), "Basic");
		match h {
			ProxyAuthenticateHeader::Basic { options } => {
				assert_eq!(options.get("realm"), Some(&"Corp".to_string()));
			},
			_ => panic!("expected Basic"),
		}
	}

	#[test]
	fn classifies_ntlm_with_blob() {
		let token = BASE64.encode(b"hello");
		let h = ProxyAuthenticateHeader::parse(Some(&format!("NTLM {token}")));
		match h {
			ProxyAuthenticateHeader::Ntlm { blob } => assert_eq!(blob, Some(b"hello".to_vec())),
			_ => panic!("expected NTLM"),
		}
	}

	#[test]
	fn empty_negotiate_has_no_blob() {
		let h = ProxyAuthenticateHeader::parse(Some("Negotiate"));
		match h {
			ProxyAuthenticateHeader::Negotiate { blob } => assert!(blob.is_none()),
			_ => panic!("expected Negotiate"),
		}
	}

	#[test]
	fn unsupported_when_missing() {
		let h = ProxyAuthenticateHeader::parse(None);
		assert_eq!(h, ProxyAuthenticateHeader::Unsupported);
	}

	#[test]
	fn authority_host_strips_port_and_dot() {
		assert_eq!(authority_host("http://proxy.corp.example.:3128"), "proxy.corp.example");
	}
}
