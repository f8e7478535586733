use clap::Args;

use super::DEFAULT_SERVICE;

#[derive(Args)]
pub struct AuthArgs {
	/// Service name, used to distinguish between auth configurations
	#[arg(short, long, default_value = DEFAULT_SERVICE)]
	service: String,
	/// User name, used to log into proxy servers
	#[arg(short, long, default_value_t = default_user())]
	user: String,
}

fn default_user() -> String {
	std::env::var("USER").unwrap_or_default()
}

pub async fn run(args: AuthArgs) -> anyhow::Result<()> {
	if args.service.is_empty() {
		anyhow::bail!("service name missing");
	}
	if args.user.is_empty() {
		anyhow::bail!("user name missing");
	}
	let password = rpassword::prompt_password(format!("[{}] Password: ", args.user))?;
	let entry = keyring::Entry::new(&args.service, &args.user)?;
	entry.set_password(&password)?;
	println!("credentials stored for {} on service '{}'", args.user, args.service);
	Ok(())
}
