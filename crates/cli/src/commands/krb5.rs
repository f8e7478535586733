use std::path::PathBuf;

use clap::Args;
use hickory_resolver::TokioAsyncResolver;

#[derive(Args)]
pub struct Krb5Args {
	/// Kerberos realm
	#[arg(short, long)]
	realm: String,
	/// Write the generated krb5.conf to this path instead of stdout
	#[arg(short = 'k', long = "krb5conf")]
	krb5conf: Option<PathBuf>,
}

pub async fn run(args: Krb5Args) -> anyhow::Result<()> {
	let resolver = TokioAsyncResolver::tokio_from_system_conf()
		.unwrap_or_else(|_| TokioAsyncResolver::tokio(Default::default(), Default::default()));
	let conf = squiggly_core::krb5::discover_krb5_conf(&resolver, &args.realm).await?;
	match &args.krb5conf {
		Some(path) => std::fs::write(path, conf)?,
		None => print!("{conf}"),
	}
	Ok(())
}
