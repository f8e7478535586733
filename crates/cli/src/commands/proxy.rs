use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use hickory_resolver::TokioAsyncResolver;
use squiggly_core::auth::{Auth, SpnegoAuth};
use squiggly_core::config::DynamicConfig;
use squiggly_core::credentials::{Credentials, KeyringCredentials, StaticCredentials};
use squiggly_core::logwriter::TracingLogger;
use squiggly_core::pac::Pac;
use squiggly_core::proxy::{ProxyServer, Timeouts};
use squiggly_core::selector::UpstreamSelector;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::DEFAULT_SERVICE;

const DEFAULT_ADDRESS: &str = "localhost:8800";
const DEFAULT_PAC_REFRESH_INTERVAL: &str = "10s";

#[derive(Args)]
pub struct ProxyArgs {
	/// Enable verbose request/response logging
	#[arg(short, long)]
	verbose: bool,
	/// URL to the proxy auto config (PAC) file
	#[arg(short, long, conflicts_with = "proxy")]
	pac: Option<url::Url>,
	/// Fixed upstream proxy URL, used instead of a PAC file
	#[arg(long, conflicts_with = "pac")]
	proxy: Option<url::Url>,
	/// Listen address for the proxy server
	#[arg(short, long, default_value = DEFAULT_ADDRESS)]
	address: String,
	/// Service name, used to distinguish between auth configurations
	#[arg(short, long, default_value = DEFAULT_SERVICE)]
	service: String,
	/// User name, used to log into proxy servers. Omit for an unauthenticated proxy.
	#[arg(short, long)]
	user: Option<String>,
	/// NTLM domain, if different from the keyring realm
	#[arg(long)]
	ntlm_domain: Option<String>,
	/// Interval at which the PAC's availability is probed
	#[arg(long, default_value = DEFAULT_PAC_REFRESH_INTERVAL)]
	interval: humantime::Duration,
}

/// Picks the first of `https_proxy`/`HTTPS_PROXY`/`http_proxy`/`HTTP_PROXY`
/// that's set, matching the lowercase-then-uppercase precedence curl and
/// most *nix HTTP clients use.
fn env_proxy_var() -> Option<&'static str> {
	for var in ["https_proxy", "HTTPS_PROXY", "http_proxy", "HTTP_PROXY"] {
		if std::env::var(var).is_ok() {
			return Some(var);
		}
	}
	None
}

fn no_proxy_hosts() -> Vec<String> {
	std::env::var("no_proxy")
		.or_else(|_| std::env::var("NO_PROXY"))
		.ok()
		.map(|v| v.split(',').map(|h| h.trim().to_string()).filter(|h| !h.is_empty()).collect())
		.unwrap_or_default()
}

/// Prompts for and persists a password when the keyring has no entry yet,
/// matching the interactive fallback in the `auth` subcommand.
fn ensure_password_stored(service: &str, user: &str) -> anyhow::Result<()> {
	let entry = keyring::Entry::new(service, user)?;
	match entry.get_password() {
		Ok(_) => Ok(()),
		Err(keyring::Error::NoEntry) => {
			let password = rpassword::prompt_password(format!("[{user}] Password: "))?;
			entry.set_password(&password)?;
			Ok(())
		},
		Err(e) => Err(e.into()),
	}
}

pub async fn run(args: ProxyArgs) -> anyhow::Result<()> {
	let credentials: Arc<dyn squiggly_core::credentials::CredentialStore> = match &args.user {
		Some(user) => {
			ensure_password_stored(&args.service, user)?;
			Arc::new(KeyringCredentials::new(
				&args.service,
				user,
				args.service.clone(),
				args.ntlm_domain.clone(),
			)?)
		},
		None => Arc::new(StaticCredentials(Credentials::default())),
	};

	let resolver = TokioAsyncResolver::tokio_from_system_conf()
		.unwrap_or_else(|_| TokioAsyncResolver::tokio(Default::default(), Default::default()));
	let spnego = Some(Arc::new(SpnegoAuth::new(Some(Arc::new(resolver)))));
	let auth = Auth::new(credentials, spnego);

	let selector = match (&args.proxy, &args.pac) {
		(Some(proxy_url), _) => UpstreamSelector::Static(proxy_url.clone()),
		(None, Some(pac_url)) => {
			let pac = Arc::new(Pac::new(pac_url.clone())?);
			if let Err(e) = pac.refresh().await {
				warn!(error = %e, "unable to parse PAC on startup");
			}
			UpstreamSelector::Pac(pac)
		},
		(None, None) => match env_proxy_var() {
			Some(var) => UpstreamSelector::EnvLookup(Arc::from(var)),
			None => UpstreamSelector::DirectOnly,
		},
	};
	let config = Arc::new(DynamicConfig::new(selector.clone()));
	config.set_blacklist(no_proxy_hosts());

	let logger = args.verbose.then(|| Arc::new(TracingLogger) as Arc<dyn squiggly_core::logwriter::Logger>);
	let server = Arc::new(ProxyServer::new(config.clone(), auth, logger, Timeouts::default()));

	if let UpstreamSelector::Pac(pac) = &selector {
		let pac = pac.clone();
		let config = config.clone();
		let interval: Duration = args.interval.into();
		tokio::spawn(async move {
			let mut disabled = false;
			loop {
				tokio::time::sleep(interval).await;
				match pac.refresh().await {
					Ok(_) => {
						if disabled {
							disabled = false;
							config.set_proxy_enabled(true);
						}
					},
					Err(e) => {
						if !disabled {
							disabled = true;
							config.set_proxy_enabled(false);
						}
						warn!(error = %e, "PAC refresh failed");
					},
				}
			}
		});
	}

	let listener = TcpListener::bind(&args.address).await?;
	info!(address = %args.address, "LISTEN");

	tokio::select! {
		res = server.serve(listener) => res.map_err(anyhow::Error::from),
		_ = tokio::signal::ctrl_c() => {
			info!("shutting down");
			Ok(())
		},
	}
}
