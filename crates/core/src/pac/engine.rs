use std::net::{IpAddr, ToSocketAddrs};

use rquickjs::{Context, Ctx, Function, Runtime};
use tracing::debug;

use crate::error::ProxyError;

/// Embedded evaluator for `FindProxyForURL(url, host)` PAC scripts. One
/// `PacEngine` owns one QuickJS context; scripts are re-parsed into it on
/// every [`Pac`](super::Pac) refresh.
pub struct PacEngine {
	runtime: Runtime,
	context: Context,
}

impl PacEngine {
	pub fn new() -> Result<Self, ProxyError> {
		let runtime = Runtime::new().map_err(|e| ProxyError::PacFetch(format!("quickjs runtime: {e}")))?;
		let context = Context::full(&runtime)
			.map_err(|e| ProxyError::PacFetch(format!("quickjs context: {e}")))?;
		context.with(|ctx| register_helpers(&ctx)).map_err(|e: rquickjs::Error| {
			ProxyError::PacFetch(format!("registering PAC helpers: {e}"))
		})?;
		Ok(Self { runtime, context })
	}

	/// Loads a new script body, replacing whatever was previously loaded.
	/// The script is evaluated once so syntax errors surface immediately
	/// rather than on the first `find_proxy` call.
	pub fn load(&self, script: &str) -> Result<(), ProxyError> {
		self.context.with(|ctx| {
			ctx.eval::<(), _>(script)
				.map_err(|e| ProxyError::PacFetch(format!("PAC script error: {e}")))
		})?;
		self.runtime.run_gc();
		Ok(())
	}

	pub fn find_proxy(&self, url: &str, host: &str) -> Result<String, ProxyError> {
		self.context.with(|ctx| {
			let find_proxy: Function = ctx
				.globals()
				.get("FindProxyForURL")
				.map_err(|e| ProxyError::PacFetch(format!("FindProxyForURL missing: {e}")))?;
			find_proxy
				.call((url.to_string(), host.to_string()))
				.map_err(|e| ProxyError::PacFetch(format!("FindProxyForURL failed: {e}")))
		})
	}
}

fn register_helpers(ctx: &Ctx<'_>) -> Result<(), rquickjs::Error> {
	let globals = ctx.globals();
	globals.set(
		"dnsResolve",
		Function::new(ctx.clone(), |host: String| -> String {
			resolve_first_a(&host).unwrap_or_default()
		}),
	)?;
	globals.set(
		"myIpAddress",
		Function::new(ctx.clone(), || -> String { local_ip_guess() }),
	)?;
	globals.set(
		"isResolvable",
		Function::new(ctx.clone(), |host: String| -> bool {
			!resolve_first_a(&host).unwrap_or_default().is_empty()
		}),
	)?;
	globals.set(
		"isInNet",
		Function::new(ctx.clone(), |host: String, pattern: String, mask: String| -> bool {
			is_in_net(&host, &pattern, &mask)
		}),
	)?;
	globals.set(
		"dnsDomainIs",
		Function::new(ctx.clone(), |host: String, domain: String| -> bool {
			host.to_ascii_lowercase().ends_with(&domain.to_ascii_lowercase())
		}),
	)?;
	Ok(())
}

fn resolve_first_a(host: &str) -> Option<String> {
	(host, 0u16)
		.to_socket_addrs()
		.ok()?
		.find_map(|a| match a.ip() {
			IpAddr::V4(v4) => Some(v4.to_string()),
			IpAddr::V6(_) => None,
		})
}

fn local_ip_guess() -> String {
	std::net::UdpSocket::bind("0.0.0.0:0")
		.and_then(|s| {
			s.connect("198.51.100.1:80")?;
			s.local_addr()
		})
		.map(|addr| addr.ip().to_string())
		.unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn is_in_net(host: &str, pattern: &str, mask: &str) -> bool {
	let (Some(host_ip), Some(pattern_ip), Some(mask_ip)) = (
		resolve_first_a(host).and_then(|s| s.parse::<IpAddr>().ok()).or_else(|| host.parse().ok()),
		pattern.parse::<IpAddr>().ok(),
		mask.parse::<IpAddr>().ok(),
	) else {
		debug!(%host, %pattern, %mask, "isInNet: unparsable address");
		return false;
	};
	match (host_ip, pattern_ip, mask_ip) {
		(IpAddr::V4(h), IpAddr::V4(p), IpAddr::V4(m)) => {
			let h = u32::from(h);
			let p = u32::from(p);
			let m = u32::from(m);
			h & m == p & m
		},
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn evaluates_simple_script() {
		let engine = PacEngine::new().unwrap();
		engine
			.load("function FindProxyForURL(url, host) { return 'DIRECT'; }")
			.unwrap();
		assert_eq!(engine.find_proxy("http://a.example/", "a.example").unwrap(), "DIRECT");
	}

	#[test]
	fn script_can_branch_on_host() {
		let engine = PacEngine::new().unwrap();
		engine
			.load(
				"function FindProxyForURL(url, host) { \
				   if (dnsDomainIs(host, '.internal')) return 'DIRECT'; \
				   return 'PROXY proxy.example:8080'; \
				 }",
			)
			.unwrap();
		assert_eq!(
			engine.find_proxy("http://svc.internal/", "svc.internal").unwrap(),
			"DIRECT"
		);
		assert_eq!(
			engine.find_proxy("http://svc.example/", "svc.example").unwrap(),
			"PROXY proxy.example:8080"
		);
	}

	#[test]
	fn is_in_net_matches_subnet() {
		assert!(is_in_net("10.1.2.3", "10.1.0.0", "255.255.0.0"));
		assert!(!is_in_net("10.2.2.3", "10.1.0.0", "255.255.0.0"));
	}
}
