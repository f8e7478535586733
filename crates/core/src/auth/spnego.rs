use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hickory_resolver::TokioAsyncResolver;
use http::StatusCode;
use parking_lot::Mutex;
use sspi::builders::AcquireCredentialsHandle;
use sspi::{
	ClientRequestFlags, CredentialUse, DataRepresentation, Negotiate, NegotiateConfig,
	SecurityBuffer, SecurityBufferType, SecurityStatus, Sspi, SspiImpl,
};
use tracing::{debug, warn};

use super::AuthStrategy;
use crate::connect::{ConnectResponse, ProxyConnection};
use crate::error::ProxyError;

const KRB_IDLE: u8 = 0;
const KRB_READY: u8 = 1;

/// The credential handle plus the `Negotiate` instance it was acquired
/// against, cached across calls so `AcquireCredentialsHandle` (one KDC
/// round trip) only ever runs once per process.
struct KerberosSession {
	client: Negotiate,
	credentials_handle: <Negotiate as SspiImpl>::CredentialsHandle,
}

/// Negotiate/SPNEGO against an upstream proxy, wrapping a Kerberos ticket
/// acquired from the current user's credential cache (spec §4.C): a single
/// round of `InitializeSecurityContext` against an SPN of `HTTP/<host>`.
///
/// Ticket acquisition is lazy: the first `authorize()` call does it, guarded
/// by a CAS so concurrent requests don't stampede the KDC — the CAS winner
/// runs `AcquireCredentialsHandle` and caches the result in `session`; every
/// other caller (winner included, on every subsequent call) only runs
/// `initialize_security_context` against the cached handle. A failed
/// acquisition resets the gate so the next request retries rather than
/// wedging the proxy into permanent SPNEGO failure.
pub struct SpnegoAuth {
	resolver: Option<Arc<TokioAsyncResolver>>,
	kerberos_state: AtomicU8,
	session: Mutex<Option<KerberosSession>>,
}

impl SpnegoAuth {
	pub fn new(resolver: Option<Arc<TokioAsyncResolver>>) -> Self {
		Self {
			resolver,
			kerberos_state: AtomicU8::new(KRB_IDLE),
			session: Mutex::new(None),
		}
	}

	/// Canonicalizes `host` via CNAME lookup for SPN construction, falling
	/// back to the literal host when resolution fails or is disabled.
	async fn canonical_host(&self, host: &str) -> String {
		let Some(resolver) = &self.resolver else {
			return host.to_string();
		};
		match resolver.lookup(host, hickory_resolver::proto::rr::RecordType::CNAME).await {
			Ok(lookup) => lookup
				.iter()
				.next()
				.map(|r| r.to_string().trim_end_matches('.').to_string())
				.unwrap_or_else(|| host.to_string()),
			Err(e) => {
				debug!(%host, error = %e, "CNAME lookup failed, using literal host for SPN");
				host.to_string()
			},
		}
	}

	fn mark_failed(&self) {
		self.session.lock().take();
		self.kerberos_state.store(KRB_IDLE, Ordering::SeqCst);
	}
}

#[async_trait]
impl AuthStrategy for SpnegoAuth {
	async fn authorize(
		&self,
		_initial: &ConnectResponse,
		conn: &mut ProxyConnection,
	) -> Result<(), ProxyError> {
		let host = conn
			.proxy()
			.host_str()
			.ok_or_else(|| ProxyError::Configuration("proxy url has no host".into()))?
			.to_string();
		let spn = format!("HTTP/{}", self.canonical_host(&host).await);

		// CAS: only the winner runs AcquireCredentialsHandle (one KDC round
		// trip) and caches it in `session`. Losers skip straight to using
		// whatever is cached; if nothing is cached yet (the winner hasn't
		// finished), they fail this round and the next CONNECT attempt
		// retries, by which point the winner has usually finished.
		if self
			.kerberos_state
			.compare_exchange(KRB_IDLE, KRB_READY, Ordering::SeqCst, Ordering::SeqCst)
			.is_ok()
		{
			match acquire_session() {
				Ok(session) => *self.session.lock() = Some(session),
				Err(e) => {
					self.mark_failed();
					warn!(%spn, error = %e, "kerberos credential acquisition failed");
					return Err(e);
				},
			}
		}

		let token = {
			let mut guard = self.session.lock();
			let Some(session) = guard.as_mut() else {
				return Err(ProxyError::KerberosInit(
					"kerberos credential acquisition still in progress, retry".into(),
				));
			};
			initialize_security_context(session, &spn)?
		};

		let encoded = BASE64.encode(&token);
		let resp = conn.connect(Some(&format!("Negotiate {encoded}"))).await?;
		if resp.status == StatusCode::OK {
			Ok(())
		} else {
			Err(ProxyError::AuthFailed(format!("SPNEGO rejected: {}", resp.status)))
		}
	}
}

/// Acquires the current user's Kerberos credential handle. Runs once,
/// behind the CAS gate in `SpnegoAuth::authorize` — this is the expensive
/// KDC round trip `acquireCreds` in the original guards against repeating.
fn acquire_session() -> Result<KerberosSession, ProxyError> {
	let mut client = Negotiate::new(NegotiateConfig::default())
		.map_err(|e| ProxyError::KerberosInit(e.to_string()))?;

	let acquired = AcquireCredentialsHandle::new(&mut client)
		.with_credential_use(CredentialUse::Outbound)
		.execute(&mut client)
		.map_err(|e| ProxyError::KerberosInit(format!("acquire credentials: {e}")))?;

	Ok(KerberosSession { client, credentials_handle: acquired.credentials_handle })
}

/// Runs one `InitializeSecurityContext` round against `spn` using the
/// cached credential handle, returning the raw Negotiate token to
/// base64-encode onto the wire. Unlike credential acquisition, this runs on
/// every `authorize()` call — it's cheap and the SPN can differ per upstream.
fn initialize_security_context(session: &mut KerberosSession, spn: &str) -> Result<Vec<u8>, ProxyError> {
	let KerberosSession { client, credentials_handle } = session;

	let mut output = vec![SecurityBuffer::new(Vec::new(), SecurityBufferType::Token)];
	let mut builder = client
		.initialize_security_context()
		.with_credentials_handle(credentials_handle)
		.with_context_requirements(ClientRequestFlags::MUTUAL_AUTH | ClientRequestFlags::CONFIDENTIALITY)
		.with_target_data_representation(DataRepresentation::Native)
		.with_target_name(spn)
		.with_output(&mut output);

	let result = client
		.initialize_security_context_impl(&mut builder)
		.map_err(|e| ProxyError::KerberosInit(format!("initialize security context: {e}")))?;

	if !matches!(result.status, SecurityStatus::ContinueNeeded | SecurityStatus::Ok) {
		return Err(ProxyError::KerberosInit(format!("unexpected status: {:?}", result.status)));
	}

	Ok(output.into_iter().next().map(|b| b.buffer).unwrap_or_default())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn canonical_host_falls_back_without_resolver() {
		let auth = SpnegoAuth::new(None);
		assert_eq!(auth.canonical_host("proxy.example.com").await, "proxy.example.com");
	}

	#[test]
	fn kerberos_gate_resets_on_failure() {
		let auth = SpnegoAuth::new(None);
		auth.kerberos_state.store(KRB_READY, Ordering::SeqCst);
		assert_eq!(auth.kerberos_state.load(Ordering::SeqCst), KRB_READY);
		auth.mark_failed();
		assert_eq!(auth.kerberos_state.load(Ordering::SeqCst), KRB_IDLE);
		assert!(auth.session.lock().is_none());
	}
}
