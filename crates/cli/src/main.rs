mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "squiggly", about = "A local forwarding proxy with PAC and proxy-auth support")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Start the proxy server
	Proxy(commands::proxy::ProxyArgs),
	/// Set the proxy authentication credentials
	Auth(commands::auth::AuthArgs),
	/// Generate a krb5.conf by discovering KDCs for a realm
	Krb5Conf(commands::krb5::Krb5Args),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.init();

	let cli = Cli::parse();
	match cli.command {
		Command::Proxy(args) => commands::proxy::run(args).await,
		Command::Auth(args) => commands::auth::run(args).await,
		Command::Krb5Conf(args) => commands::krb5::run(args).await,
	}
}
