use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use http::Uri;
use parking_lot::Mutex;

use crate::error::ProxyError;
use crate::selector::UpstreamSelector;

/// Immutable snapshot swapped atomically under [`DynamicConfig`]. Readers
/// never block; writers serialize through `DynamicConfig`'s mutex and
/// publish a fresh clone (spec §5, "hot-swappable configuration").
struct Snapshot {
	selector: UpstreamSelector,
	enabled: bool,
	blacklist: Arc<HashSet<String>>,
}

/// Runtime-mutable proxy configuration: which upstream selector is active,
/// whether the proxy is enabled at all, and which hosts are always direct.
pub struct DynamicConfig {
	current: ArcSwap<Snapshot>,
	write_lock: Mutex<()>,
}

impl DynamicConfig {
	pub fn new(selector: UpstreamSelector) -> Self {
		Self {
			current: ArcSwap::from_pointee(Snapshot {
				selector,
				enabled: true,
				blacklist: Arc::new(HashSet::new()),
			}),
			write_lock: Mutex::new(()),
		}
	}

	/// Replaces the blacklist wholesale; entries are case-folded and
	/// trimmed to match how lookups are normalized below.
	pub fn set_blacklist(&self, hosts: impl IntoIterator<Item = String>) {
		let _guard = self.write_lock.lock();
		let blacklist: HashSet<String> = hosts
			.into_iter()
			.map(|h| h.trim().to_ascii_lowercase())
			.collect();
		let prev = self.current.load();
		self.current.store(Arc::new(Snapshot {
			selector: prev.selector.clone(),
			enabled: prev.enabled,
			blacklist: Arc::new(blacklist),
		}));
	}

	pub fn set_proxy_enabled(&self, enabled: bool) {
		let _guard = self.write_lock.lock();
		let prev = self.current.load();
		self.current.store(Arc::new(Snapshot {
			selector: prev.selector.clone(),
			enabled,
			blacklist: prev.blacklist.clone(),
		}));
	}

	pub fn set_selector(&self, selector: UpstreamSelector) {
		let _guard = self.write_lock.lock();
		let prev = self.current.load();
		self.current.store(Arc::new(Snapshot {
			selector,
			enabled: prev.enabled,
			blacklist: prev.blacklist.clone(),
		}));
	}

	/// Resolves the upstream for `uri`, or `None` for a direct connection.
	/// Checked against the blacklist by both authority (`host:port`) and
	/// bare hostname, matching the original's two-pass check.
	pub async fn proxy_for(&self, uri: &Uri) -> Result<Option<url::Url>, ProxyError> {
		let snapshot = self.current.load_full();
		if !snapshot.enabled {
			return Ok(None);
		}
		if let Some(authority) = uri.authority() {
			let authority = authority.as_str().trim().to_ascii_lowercase();
			if snapshot.blacklist.contains(&authority) {
				return Ok(None);
			}
		}
		if let Some(host) = uri.host() {
			let host = host.trim().to_ascii_lowercase();
			if snapshot.blacklist.contains(&host) {
				return Ok(None);
			}
		}
		snapshot.selector.select(uri).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn blacklisted_host_goes_direct() {
		let cfg = DynamicConfig::new(UpstreamSelector::Static(
			url::Url::parse("http://proxy.example:8080").unwrap(),
		));
		cfg.set_blacklist(["Target.Example".to_string()]);
		let uri: Uri = "http://target.example/".parse().unwrap();
		assert!(cfg.proxy_for(&uri).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn disabled_proxy_always_direct() {
		let cfg = DynamicConfig::new(UpstreamSelector::Static(
			url::Url::parse("http://proxy.example:8080").unwrap(),
		));
		cfg.set_proxy_enabled(false);
		let uri: Uri = "http://anything.example/".parse().unwrap();
		assert!(cfg.proxy_for(&uri).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn non_blacklisted_host_uses_selector() {
		let cfg = DynamicConfig::new(UpstreamSelector::Static(
			url::Url::parse("http://proxy.example:8080").unwrap(),
		));
		let uri: Uri = "http://other.example/".parse().unwrap();
		assert!(cfg.proxy_for(&uri).await.unwrap().is_some());
	}
}
