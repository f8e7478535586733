mod engine;

use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use http::Uri;
use parking_lot::Mutex;
use url::Url;

use crate::error::ProxyError;
pub use engine::PacEngine;

const LAST_MODIFIED_FORMAT: &str = "%Y-%m-%d %H:%M:%S GMT";

struct PacState {
	etag: Option<String>,
	last_modified: Option<DateTime<Utc>>,
	file_modified: Option<SystemTime>,
	loaded: bool,
}

/// `PacEngine` and the refresh metadata behind one lock, so a script swap
/// (`load`) and an evaluation (`find_proxy`) can never interleave: every
/// access to the engine goes through `inner`.
struct PacInner {
	engine: PacEngine,
	state: PacState,
}

/// A PAC script plus the metadata needed to conditionally re-fetch it.
/// `file://` sources refresh on mtime change; `http(s)://` sources use
/// `ETag`/`If-Modified-Since`, matching how browsers cache PAC files.
pub struct Pac {
	url: Url,
	inner: Mutex<PacInner>,
	http: reqwest::Client,
}

impl Pac {
	pub fn new(url: Url) -> Result<Self, ProxyError> {
		// A PAC fetch must never itself be proxied, or a misconfigured
		// upstream could prevent the proxy from ever bootstrapping.
		let http = reqwest::Client::builder()
			.no_proxy()
			.connect_timeout(std::time::Duration::from_secs(30))
			.build()
			.map_err(|e| ProxyError::Configuration(format!("PAC http client: {e}")))?;
		Ok(Self {
			url,
			inner: Mutex::new(PacInner {
				engine: PacEngine::new()?,
				state: PacState {
					etag: None,
					last_modified: None,
					file_modified: None,
					loaded: false,
				},
			}),
			http,
		})
	}

	/// Re-fetches the script if it has changed. Returns whether an update
	/// was applied.
	pub async fn refresh(&self) -> Result<bool, ProxyError> {
		match self.url.scheme() {
			"file" => self.refresh_file(),
			"http" | "https" => self.refresh_http().await,
			other => Err(ProxyError::Configuration(format!("unsupported PAC scheme: {other}"))),
		}
	}

	fn refresh_file(&self) -> Result<bool, ProxyError> {
		let path = PathBuf::from(self.url.path());
		let metadata = std::fs::metadata(&path).map_err(|e| ProxyError::PacFetch(e.to_string()))?;
		let modified = metadata.modified().map_err(|e| ProxyError::PacFetch(e.to_string()))?;

		let mut inner = self.inner.lock();
		if inner.state.loaded && inner.state.file_modified.is_some_and(|prev| modified <= prev) {
			return Ok(false);
		}
		let script = std::fs::read_to_string(&path).map_err(|e| ProxyError::PacFetch(e.to_string()))?;
		inner.engine.load(&script)?;
		inner.state.file_modified = Some(modified);
		inner.state.loaded = true;
		Ok(true)
	}

	async fn refresh_http(&self) -> Result<bool, ProxyError> {
		let mut req = self.http.get(self.url.clone());
		{
			let inner = self.inner.lock();
			if let Some(etag) = &inner.state.etag {
				req = req.header(reqwest::header::IF_NONE_MATCH, etag.clone());
			} else if let Some(lm) = inner.state.last_modified {
				req = req.header(reqwest::header::IF_MODIFIED_SINCE, lm.format(LAST_MODIFIED_FORMAT).to_string());
			}
		}
		let resp = req.send().await.map_err(|e| ProxyError::PacFetch(e.to_string()))?;
		if resp.status() == reqwest::StatusCode::NOT_MODIFIED {
			return Ok(false);
		}
		if resp.status() != reqwest::StatusCode::OK {
			return Err(ProxyError::PacFetch(format!("GET {}: {}", self.url, resp.status())));
		}
		let etag = resp
			.headers()
			.get(reqwest::header::ETAG)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string);
		let last_modified = resp
			.headers()
			.get(reqwest::header::LAST_MODIFIED)
			.and_then(|v| v.to_str().ok())
			.and_then(|v| DateTime::parse_from_str(v, LAST_MODIFIED_FORMAT).ok())
			.map(|d| d.with_timezone(&Utc));
		let body = resp.text().await.map_err(|e| ProxyError::PacFetch(e.to_string()))?;

		// engine.load and the state update happen under the same lock
		// acquisition as proxy_for_uri's read, so no evaluation ever sees a
		// script half-swapped against stale state or vice versa.
		let mut inner = self.inner.lock();
		inner.engine.load(&body)?;
		inner.state.etag = etag;
		if last_modified.is_some() {
			inner.state.last_modified = last_modified;
		}
		inner.state.loaded = true;
		Ok(true)
	}

	pub async fn proxy_for_uri(&self, uri: &Uri) -> Result<Option<Url>, ProxyError> {
		let host = uri.host().unwrap_or_default().to_string();
		let url = uri.to_string();
		let inner = self.inner.lock();
		if !inner.state.loaded {
			return Ok(None);
		}
		let result = inner.engine.find_proxy(&url, &host)?;
		Ok(proxy_for_result(&result))
	}
}

/// Parses the `;`-separated PAC return value into the first usable proxy,
/// matching semicolon-delimited fallback order: `PROXY host:port` entries
/// become upstream URLs, `DIRECT` becomes `None` explicitly, and unknown
/// tokens (`SOCKS ...`, malformed entries) are skipped.
fn proxy_for_result(result: &str) -> Option<Url> {
	for entry in result.split(';') {
		let entry = entry.trim().to_ascii_lowercase();
		if entry == "direct" {
			return None;
		}
		if let Some(hostport) = entry.strip_prefix("proxy") {
			let hostport = hostport.trim();
			if let Ok(url) = Url::parse(&format!("http://{hostport}/")) {
				return Some(url);
			}
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_proxy_entry() {
		let url = proxy_for_result("PROXY proxy.example:8080").unwrap();
		assert_eq!(url.host_str(), Some("proxy.example"));
		assert_eq!(url.port(), Some(8080));
	}

	#[test]
	fn direct_returns_none() {
		assert!(proxy_for_result("DIRECT").is_none());
	}

	#[test]
	fn falls_through_unknown_entries_to_proxy() {
		let url = proxy_for_result("SOCKS5 socks.example:1080; PROXY proxy.example:8080").unwrap();
		assert_eq!(url.host_str(), Some("proxy.example"));
	}

	#[test]
	fn unparsable_result_yields_none() {
		assert!(proxy_for_result("").is_none());
	}
}
