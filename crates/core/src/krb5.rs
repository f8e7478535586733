use std::fmt::Write as _;

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::proto::rr::RecordType;

use crate::error::ProxyError;

/// KDC/kadmin/kpasswd hosts discovered for a realm via the standard
/// `_kerberos`/`_kerberos-adm`/`_kpasswd` SRV record convention (RFC 4120
/// appendix A).
struct Realm {
	name: String,
	kdcs: Vec<String>,
	master_kdcs: Vec<String>,
	admin_servers: Vec<String>,
	kpasswd: Vec<String>,
}

/// Generates a `krb5.conf` for `realm` by resolving its KDC, kadmin, and
/// kpasswd servers from DNS SRV records (spec §4.K). Missing `kadmin`/
/// `kpasswd` records are fine — nothing requires them — but failing to
/// resolve any KDC at all (neither `_kerberos._udp` nor
/// `_kerberos-master._udp`) is an error: there is nothing useful to render.
pub async fn discover_krb5_conf(resolver: &TokioAsyncResolver, realm_name: &str) -> Result<String, ProxyError> {
	if realm_name.is_empty() {
		return Err(ProxyError::Configuration("realm cannot be empty".into()));
	}
	let realm = discover_realm(resolver, realm_name).await?;
	Ok(render_krb5_conf(&realm))
}

async fn discover_realm(resolver: &TokioAsyncResolver, name: &str) -> Result<Realm, ProxyError> {
	let upper = name.to_ascii_uppercase();
	let kdcs = srv_hosts(resolver, &format!("_kerberos._udp.{name}")).await;
	let master_kdcs = srv_hosts(resolver, &format!("_kerberos-master._udp.{name}")).await;
	let admin_servers = srv_hosts(resolver, &format!("_kerberos-adm._tcp.{name}")).await;
	let kpasswd = srv_hosts(resolver, &format!("_kpasswd._udp.{name}")).await;

	if kdcs.is_empty() && master_kdcs.is_empty() {
		return Err(ProxyError::Configuration(format!("no KDC found for realm '{name}'")));
	}

	Ok(Realm { name: upper, kdcs, master_kdcs, admin_servers, kpasswd })
}

async fn srv_hosts(resolver: &TokioAsyncResolver, query: &str) -> Vec<String> {
	match resolver.lookup(query, RecordType::SRV).await {
		Ok(lookup) => lookup
			.record_iter()
			.filter_map(|r| r.data().as_srv())
			.map(|srv| srv.target().to_string().trim_end_matches('.').to_string())
			.collect(),
		Err(_) => Vec::new(),
	}
}

fn render_krb5_conf(realm: &Realm) -> String {
	let lower = realm.name.to_ascii_lowercase();
	let master_kdcs = if realm.master_kdcs.is_empty() { &realm.kdcs } else { &realm.master_kdcs };
	let mut out = String::new();
	let _ = writeln!(out, "# Other applications require this directory to perform krb5 configuration.");
	let _ = writeln!(out, "includedir /etc/krb5.conf.d/");
	let _ = writeln!(out);
	let _ = writeln!(out, "[libdefaults]");
	let _ = writeln!(out, " default_realm = {}", realm.name);
	let _ = writeln!(out);
	let _ = writeln!(out, "[domain_realm]");
	for kdc in &realm.kdcs {
		let _ = writeln!(out, "  {kdc} = {}", realm.name);
	}
	let _ = writeln!(out, "  .{lower} = {}", realm.name);
	let _ = writeln!(out, "  {lower} = {}", realm.name);
	let _ = writeln!(out);
	let _ = writeln!(out, "[realms]");
	let _ = writeln!(out, "{} = {{", realm.name);
	for kdc in &realm.kdcs {
		let _ = writeln!(out, "\tkdc = {kdc}:88");
	}
	for kdc in master_kdcs {
		let _ = writeln!(out, "\tmaster_kdc = {kdc}:88");
	}
	for admin in &realm.admin_servers {
		let _ = writeln!(out, "\tadmin_server = {admin}:749");
	}
	for kpasswd in &realm.kpasswd {
		let _ = writeln!(out, "\tkpasswd = {kpasswd}:464");
		let _ = writeln!(out, "\tkpasswd_server = {kpasswd}:464");
	}
	let _ = writeln!(out, "}}");
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn renders_empty_realm_without_kdcs() {
		let realm = Realm {
			name: "CORP.EXAMPLE".into(),
			kdcs: vec![],
			master_kdcs: vec![],
			admin_servers: vec![],
			kpasswd: vec![],
		};
		let out = render_krb5_conf(&realm);
		assert!(out.contains("default_realm = CORP.EXAMPLE"));
		assert!(out.contains("CORP.EXAMPLE = {"));
	}

	#[test]
	fn renders_discovered_kdcs() {
		let realm = Realm {
			name: "CORP.EXAMPLE".into(),
			kdcs: vec!["dc1.corp.example".into()],
			master_kdcs: vec![],
			admin_servers: vec!["admin.corp.example".into()],
			kpasswd: vec!["dc1.corp.example".into()],
		};
		let out = render_krb5_conf(&realm);
		assert!(out.contains("kdc = dc1.corp.example:88"));
		assert!(out.contains("master_kdc = dc1.corp.example:88"));
		assert!(out.contains("admin_server = admin.corp.example:749"));
		assert!(out.contains("kpasswd = dc1.corp.example:464"));
	}

	#[test]
	fn master_kdc_falls_back_to_kdc_list_when_unset() {
		let realm = Realm {
			name: "CORP.EXAMPLE".into(),
			kdcs: vec!["dc1.corp.example".into()],
			master_kdcs: vec!["dc2.corp.example".into()],
			admin_servers: vec![],
			kpasswd: vec![],
		};
		let out = render_krb5_conf(&realm);
		assert!(out.contains("kdc = dc1.corp.example:88"));
		assert!(out.contains("master_kdc = dc2.corp.example:88"));
		assert!(!out.contains("master_kdc = dc1.corp.example:88"));
	}
}
