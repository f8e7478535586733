use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};
use url::Url;

use crate::auth::Auth;
use crate::error::ProxyError;

/// Resolves the dial target for an upstream proxy URL, applying the scheme
/// default port per spec §4.E.
pub fn proxy_host_port(proxy: &Url) -> String {
	if let Some(port) = proxy.port() {
		return format!("{}:{port}", proxy.host_str().unwrap_or_default());
	}
	let port = match proxy.scheme() {
		"https" => 443,
		_ => 80,
	};
	format!("{}:{port}", proxy.host_str().unwrap_or_default())
}

/// The parsed status line + headers of a CONNECT response. The body is
/// always drained and discarded (§8: "no body leftover" on a 200).
pub struct ConnectResponse {
	pub status: StatusCode,
	pub proxy_authenticate: Option<String>,
	pub body: String,
}

/// One CONNECT attempt against a single upstream socket. NTLM connection
/// affinity requires reusing the same `TcpStream` across all rounds, so
/// this struct owns the socket for the lifetime of the handshake and is
/// handed by reference into the auth dispatcher.
pub struct ProxyConnection {
	socket: TcpStream,
	proxy: Url,
	target: String,
}

impl ProxyConnection {
	pub fn target(&self) -> &str {
		&self.target
	}

	pub fn proxy(&self) -> &Url {
		&self.proxy
	}

	/// Writes one `CONNECT host:port HTTP/1.1` request, optionally carrying
	/// `Proxy-Authorization`, and parses the response per RFC 7230.
	pub async fn connect(&mut self, auth: Option<&str>) -> Result<ConnectResponse, ProxyError> {
		let mut req = format!(
			"CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n",
			target = self.target
		);
		if let Some(auth) = auth {
			req.push_str("Proxy-Authorization: ");
			req.push_str(auth);
			req.push_str("\r\n");
		}
		req.push_str("\r\n");
		trace!(target = %self.target, "sending CONNECT");
		self.socket.write_all(req.as_bytes()).await?;

		let mut buf = Vec::with_capacity(4096);
		let headers_end = loop {
			let mut chunk = [0u8; 4096];
			let n = self.socket.read(&mut chunk).await?;
			if n == 0 {
				return Err(ProxyError::Io(std::io::Error::new(
					std::io::ErrorKind::UnexpectedEof,
					"connection closed while reading CONNECT response",
				)));
			}
			buf.extend_from_slice(&chunk[..n]);
			if let Some(pos) = find_header_end(&buf) {
				break pos;
			}
			if buf.len() > 64 * 1024 {
				return Err(ProxyError::Io(std::io::Error::other(
					"CONNECT response headers too long",
				)));
			}
		};

		let mut headers = [httparse::EMPTY_HEADER; 64];
		let mut resp = httparse::Response::new(&mut headers);
		let parsed = resp
			.parse(&buf[..headers_end])
			.map_err(|e| ProxyError::Io(std::io::Error::other(format!("bad CONNECT response: {e}"))))?;
		if parsed.is_partial() {
			return Err(ProxyError::Io(std::io::Error::other(
				"incomplete CONNECT response",
			)));
		}
		let status = StatusCode::from_u16(resp.code.unwrap_or(0))
			.map_err(|_| ProxyError::Io(std::io::Error::other("invalid CONNECT status code")))?;
		let proxy_authenticate = resp
			.headers
			.iter()
			.find(|h| h.name.eq_ignore_ascii_case("proxy-authenticate"))
			.map(|h| String::from_utf8_lossy(h.value).into_owned());

		// On a 200, there is no body: the socket continues as a raw tunnel
		// starting at headers_end (spec §8). On anything else, any
		// Content-Length body is drained so the connection can continue
		// (for 407, a subsequent round reuses this same socket).
		let content_length = resp
			.headers
			.iter()
			.find(|h| h.name.eq_ignore_ascii_case("content-length"))
			.and_then(|h| std::str::from_utf8(h.value).ok())
			.and_then(|v| v.parse::<usize>().ok())
			.unwrap_or(0);

		let mut body_bytes = buf[headers_end..].to_vec();
		while body_bytes.len() < content_length {
			let mut chunk = [0u8; 4096];
			let n = self.socket.read(&mut chunk).await?;
			if n == 0 {
				break;
			}
			body_bytes.extend_from_slice(&chunk[..n]);
		}
		let body = String::from_utf8_lossy(&body_bytes).into_owned();

		debug!(status = %status, "CONNECT response");
		Ok(ConnectResponse {
			status,
			proxy_authenticate,
			body,
		})
	}

	/// Consumes the connection, returning the raw socket for use as the
	/// tunneled transport. Only valid after a 200 response.
	pub fn into_socket(self) -> TcpStream {
		self.socket
	}
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
	buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Opens a CONNECT tunnel to `target` (host:port) through `proxy`, driving
/// the auth handshake with `auth` if the upstream challenges with 407.
pub struct ConnectDialer {
	pub auth: Auth,
	pub dial_timeout: Duration,
}

impl ConnectDialer {
	pub fn new(auth: Auth, dial_timeout: Duration) -> Self {
		Self { auth, dial_timeout }
	}

	pub async fn dial(&self, proxy: &Url, target: &str) -> Result<TcpStream, ProxyError> {
		let addr = proxy_host_port(proxy);
		let socket = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&addr))
			.await
			.map_err(|_| {
				ProxyError::UpstreamUnreachable(std::io::Error::new(
					std::io::ErrorKind::TimedOut,
					format!("dial {addr} timed out"),
				))
			})?
			.map_err(ProxyError::UpstreamUnreachable)?;

		let mut pc = ProxyConnection {
			socket,
			proxy: proxy.clone(),
			target: target.to_string(),
		};

		let resp = pc.connect(None).await?;
		match resp.status {
			StatusCode::OK => Ok(pc.into_socket()),
			StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
				self.auth.authorize(&resp, &mut pc).await?;
				Ok(pc.into_socket())
			},
			other => Err(ProxyError::UpstreamRefused {
				status: other,
				body: resp.body,
			}),
		}
	}
}
