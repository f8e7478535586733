use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderValue, Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::client::conn::http1 as client_http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::Client as LegacyClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::auth::Auth;
use crate::config::DynamicConfig;
use crate::connect::ConnectDialer;
use crate::error::ProxyError;
use crate::logwriter::Logger;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn empty_body() -> BoxBody {
	Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full_body(body: impl Into<Bytes>) -> BoxBody {
	Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Timeouts the engine applies around upstream dials, modeled on the Go
/// `http.Transport` defaults the original carried over from `net/http`.
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
	pub dial: Duration,
	pub tls_handshake: Duration,
	pub response_header: Duration,
	pub expect_continue: Duration,
}

impl Default for Timeouts {
	fn default() -> Self {
		Self {
			dial: Duration::from_secs(30),
			tls_handshake: Duration::from_secs(10),
			response_header: Duration::from_secs(10),
			expect_continue: Duration::from_secs(1),
		}
	}
}

/// The local forwarding proxy (spec §5, §6): terminates client
/// connections, decides per-request whether to tunnel through an upstream
/// or go direct, and logs both decisions and outcomes.
pub struct ProxyServer {
	config: Arc<DynamicConfig>,
	dialer: Arc<ConnectDialer>,
	direct_client: LegacyClient<HttpConnector, BoxBody>,
	logger: Option<Arc<dyn Logger>>,
	timeouts: Timeouts,
}

impl ProxyServer {
	pub fn new(
		config: Arc<DynamicConfig>,
		auth: Auth,
		logger: Option<Arc<dyn Logger>>,
		timeouts: Timeouts,
	) -> Self {
		let mut connector = HttpConnector::new();
		connector.set_connect_timeout(Some(timeouts.dial));
		let direct_client = LegacyClient::builder(TokioExecutor::new()).build(connector);
		Self {
			config,
			dialer: Arc::new(ConnectDialer::new(auth, timeouts.dial)),
			direct_client,
			logger,
			timeouts,
		}
	}

	fn log(&self, msg: impl AsRef<str>) {
		if let Some(logger) = &self.logger {
			logger.log(msg.as_ref());
		}
	}

	pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ProxyError> {
		loop {
			let (stream, peer) = listener.accept().await?;
			let this = self.clone();
			tokio::spawn(async move {
				if let Err(e) = this.clone().serve_conn(stream).await {
					debug!(%peer, error = %e, "connection ended");
				}
			});
		}
	}

	async fn serve_conn(self: Arc<Self>, stream: TcpStream) -> Result<(), ProxyError> {
		let io = TokioIo::new(stream);
		let this = self.clone();
		let service = service_fn(move |req| {
			let this = this.clone();
			async move { this.handle(req).await }
		});
		auto::Builder::new(TokioExecutor::new())
			.serve_connection_with_upgrades(io, service)
			.await
			.map_err(|e| ProxyError::Io(std::io::Error::other(e.to_string())))
	}

	async fn handle(
		self: Arc<Self>,
		req: Request<Incoming>,
	) -> Result<Response<BoxBody>, Infallible> {
		self.log(format!("onRequest: {}", req.uri()));
		if req.method() == Method::CONNECT {
			return Ok(self.handle_connect(req).await);
		}
		Ok(self.handle_forward(req).await)
	}

	async fn handle_connect(self: Arc<Self>, req: Request<Incoming>) -> Response<BoxBody> {
		let target = req.uri().authority().map(|a| a.to_string()).unwrap_or_default();
		if target.is_empty() {
			return bad_gateway("CONNECT target missing authority");
		}

		let uri: Uri = match format!("http://{target}/").parse() {
			Ok(u) => u,
			Err(_) => return bad_gateway("invalid CONNECT target"),
		};

		let upstream = match self.config.proxy_for(&uri).await {
			Ok(u) => u,
			Err(e) => {
				self.log(format!("onResponse: ERROR: proxy selection: {e}"));
				return bad_gateway(&e.to_string());
			},
		};

		let this = self.clone();
		tokio::task::spawn(async move {
			let upgraded = match hyper::upgrade::on(req).await {
				Ok(u) => u,
				Err(e) => {
					warn!(error = %e, "CONNECT upgrade failed");
					return;
				},
			};
			let client_io = TokioIo::new(upgraded);
			if let Err(e) = this.tunnel(client_io, &target, upstream).await {
				this.log(format!("onResponse: ERROR: {e}"));
			}
		});

		self.log(format!("PROXY SELECT: {target}"));
		Response::builder().status(StatusCode::OK).body(empty_body()).unwrap()
	}

	async fn tunnel(
		&self,
		mut client_io: TokioIo<hyper::upgrade::Upgraded>,
		target: &str,
		upstream: Option<url::Url>,
	) -> Result<(), ProxyError> {
		let mut upstream_io = match upstream {
			None => {
				debug!(%target, "dialer: DIRECT");
				tokio::time::timeout(self.timeouts.dial, TcpStream::connect(target))
					.await
					.map_err(|_| {
						ProxyError::UpstreamUnreachable(std::io::Error::new(
							std::io::ErrorKind::TimedOut,
							"direct dial timed out",
						))
					})?
					.map_err(ProxyError::UpstreamUnreachable)?
			},
			Some(proxy) if crate::connect::proxy_host_port(&proxy) == target => {
				// Never let the upstream re-route us back to itself.
				debug!(%target, "dialer: self-loop, forcing DIRECT");
				TcpStream::connect(target).await.map_err(ProxyError::UpstreamUnreachable)?
			},
			Some(proxy) => match self.dialer.dial(&proxy, target).await {
				Ok(sock) => sock,
				Err(e) if e.is_socket_level() => {
					warn!(%target, error = %e, "upstream dial failed, falling back to direct");
					TcpStream::connect(target).await.map_err(ProxyError::UpstreamUnreachable)?
				},
				Err(e) => return Err(e),
			},
		};

		tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io)
			.await
			.map_err(ProxyError::Io)?;
		Ok(())
	}

	async fn handle_forward(&self, req: Request<Incoming>) -> Response<BoxBody> {
		let upstream = match self.config.proxy_for(req.uri()).await {
			Ok(u) => u,
			Err(e) => return bad_gateway(&e.to_string()),
		};
		match upstream {
			Some(proxy) => self.forward_via_proxy(req, &proxy).await,
			None => self.forward_direct(req).await,
		}
	}

	async fn forward_direct(&self, req: Request<Incoming>) -> Response<BoxBody> {
		let req = req.map(|b| b.boxed());
		match self.direct_client.request(req).await {
			Ok(resp) => {
				self.log(format!("onResponse: {}", resp.status()));
				resp.map(|b| b.boxed())
			},
			Err(e) => {
				self.log(format!("onResponse: ERROR: {e}"));
				bad_gateway(&e.to_string())
			},
		}
	}

	/// Forwards a plain HTTP request by dialing the upstream proxy directly
	/// and writing the request to it unchanged (absolute-form request line
	/// included), the same thing `http.Transport` does once its `Proxy`
	/// hook returns a URL. Only preemptive Basic is attempted here: NTLM and
	/// SPNEGO need the CONNECT round trip to see a challenge, which a plain
	/// forwarded request never gets.
	async fn forward_via_proxy(&self, mut req: Request<Incoming>, proxy: &url::Url) -> Response<BoxBody> {
		let addr = crate::connect::proxy_host_port(proxy);
		debug!(%addr, uri = %req.uri(), "forwarding via upstream for plain HTTP request");
		let stream = match tokio::time::timeout(self.timeouts.dial, TcpStream::connect(&addr)).await {
			Ok(Ok(s)) => s,
			Ok(Err(e)) => return bad_gateway(&ProxyError::UpstreamUnreachable(e).to_string()),
			Err(_) => return bad_gateway("upstream proxy dial timed out"),
		};

		if let Some(auth) = self.dialer.auth.preemptive_basic(proxy.host_str().unwrap_or_default()) {
			if let Ok(value) = HeaderValue::from_str(&auth) {
				req.headers_mut().insert(http::header::PROXY_AUTHORIZATION, value);
			}
		}

		let io = TokioIo::new(stream);
		let (mut sender, conn) = match client_http1::handshake::<_, BoxBody>(io).await {
			Ok(pair) => pair,
			Err(e) => return bad_gateway(&e.to_string()),
		};
		tokio::spawn(async move {
			if let Err(e) = conn.await {
				debug!(error = %e, "upstream forwarding connection closed");
			}
		});

		let req = req.map(|b| b.boxed());
		match sender.send_request(req).await {
			Ok(resp) => {
				self.log(format!("onResponse: {}", resp.status()));
				resp.map(|b| b.boxed())
			},
			Err(e) => {
				self.log(format!("onResponse: ERROR: {e}"));
				bad_gateway(&e.to_string())
			},
		}
	}
}

fn bad_gateway(msg: &str) -> Response<BoxBody> {
	Response::builder()
		.status(StatusCode::BAD_GATEWAY)
		.body(full_body(msg.to_string()))
		.unwrap()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_timeouts_match_original() {
		let t = Timeouts::default();
		assert_eq!(t.dial, Duration::from_secs(30));
		assert_eq!(t.tls_handshake, Duration::from_secs(10));
		assert_eq!(t.response_header, Duration::from_secs(10));
		assert_eq!(t.expect_continue, Duration::from_secs(1));
	}
}
