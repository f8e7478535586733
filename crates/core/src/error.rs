use std::io;

/// The error kinds surfaced by the engine, per the error handling policy:
/// configuration errors are fatal at startup, PAC/upstream-dial failures
/// recover locally, everything else fails the individual client request.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("configuration error: {0}")]
	Configuration(String),

	#[error("PAC fetch/parse failed: {0}")]
	PacFetch(String),

	#[error("upstream proxy unreachable: {0}")]
	UpstreamUnreachable(#[source] io::Error),

	#[error("proxy return error '{status}': {body}")]
	UpstreamRefused { status: http::StatusCode, body: String },

	#[error("unsupported proxy auth type: {0}")]
	UnsupportedAuth(String),

	#[error("proxy authentication failed: {0}")]
	AuthFailed(String),

	#[error("could not acquire kerberos credential: {0}")]
	KerberosInit(String),

	#[error("operation cancelled")]
	Cancelled,

	#[error(transparent)]
	Io(#[from] io::Error),
}

impl ProxyError {
	/// True for errors that should trigger a direct-dial fallback rather
	/// than failing the client request outright (spec §7, kind 3).
	pub fn is_socket_level(&self) -> bool {
		matches!(self, ProxyError::UpstreamUnreachable(_) | ProxyError::Io(_))
	}
}
