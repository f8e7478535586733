use std::sync::Arc;

use http::Uri;
use url::Url;

use crate::error::ProxyError;
use crate::pac::Pac;

/// Decides which upstream, if any, a given request should be tunneled
/// through (spec §5). `Direct` and `None` mean the same thing to the
/// engine but are kept distinct so `Static`/`Pac` selectors can express "no
/// match, go direct" without allocating.
#[derive(Clone)]
pub enum UpstreamSelector {
	/// Always dial the same upstream.
	Static(Url),
	/// Read the upstream from an environment variable at request time
	/// (e.g. `HTTPS_PROXY`), falling back to direct if unset or unparsable.
	EnvLookup(Arc<str>),
	/// Evaluate a PAC script per request.
	Pac(Arc<Pac>),
	/// Never use an upstream.
	DirectOnly,
}

impl UpstreamSelector {
	pub async fn select(&self, uri: &Uri) -> Result<Option<Url>, ProxyError> {
		match self {
			UpstreamSelector::Static(url) => Ok(Some(url.clone())),
			UpstreamSelector::EnvLookup(var) => Ok(std::env::var(var.as_ref())
				.ok()
				.and_then(|v| Url::parse(&v).ok())),
			UpstreamSelector::Pac(pac) => pac.proxy_for_uri(uri).await,
			UpstreamSelector::DirectOnly => Ok(None),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn static_selector_always_returns_same_url() {
		let sel = UpstreamSelector::Static(Url::parse("http://proxy.example:8080").unwrap());
		let uri: Uri = "http://target.example/".parse().unwrap();
		let got = sel.select(&uri).await.unwrap();
		assert_eq!(got.unwrap().as_str(), "http://proxy.example:8080/");
	}

	#[tokio::test]
	async fn direct_only_never_selects() {
		let sel = UpstreamSelector::DirectOnly;
		let uri: Uri = "http://target.example/".parse().unwrap();
		assert!(sel.select(&uri).await.unwrap().is_none());
	}
}
