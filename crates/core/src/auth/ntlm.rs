use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use hmac::{Hmac, Mac};
use http::StatusCode;
use md4::Digest;
use async_trait::async_trait;

use super::{AuthStrategy, ProxyAuthenticateHeader};
use crate::connect::{ConnectResponse, ProxyConnection};
use crate::credentials::Credentials;
use crate::error::ProxyError;

/// NTLMv2 over the CONNECT channel (spec §4.C): Type 1 on round two, Type 3
/// on round three, both against the same socket `dial()` already opened.
pub struct NtlmAuth {
	creds: Credentials,
	workstation: String,
}

impl NtlmAuth {
	pub fn new(creds: Credentials) -> Self {
		let workstation = std::env::var("COMPUTERNAME")
			.or_else(|_| std::env::var("HOSTNAME"))
			.unwrap_or_else(|_| "WORKSTATION".to_string())
			.to_uppercase();
		Self { creds, workstation }
	}

	fn domain(&self) -> String {
		self.creds.ntlm_domain.clone().unwrap_or_default()
	}
}

#[async_trait]
impl AuthStrategy for NtlmAuth {
	async fn authorize(
		&self,
		_initial: &ConnectResponse,
		conn: &mut ProxyConnection,
	) -> Result<(), ProxyError> {
		let negotiate = build_negotiate_message();
		let token = BASE64.encode(&negotiate);
		let challenge_resp = conn.connect(Some(&format!("NTLM {token}"))).await?;
		if challenge_resp.status != StatusCode::PROXY_AUTHENTICATION_REQUIRED {
			return Err(ProxyError::AuthFailed(format!(
				"expected NTLM challenge, got {}",
				challenge_resp.status
			)));
		}
		let header = ProxyAuthenticateHeader::parse(challenge_resp.proxy_authenticate.as_deref());
		let ProxyAuthenticateHeader::Ntlm { blob: Some(challenge) } = header else {
			return Err(ProxyError::AuthFailed("missing NTLM type 2 challenge".into()));
		};

		let authenticate = build_authenticate_message(&self.creds, &self.domain(), &self.workstation, &challenge)?;
		let token = BASE64.encode(&authenticate);
		let resp = conn.connect(Some(&format!("NTLM {token}"))).await?;
		if resp.status == StatusCode::OK {
			Ok(())
		} else {
			Err(ProxyError::AuthFailed(format!("NTLM rejected: {}", resp.status)))
		}
	}
}

fn utf16le(s: &str) -> Vec<u8> {
	s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

/// Type 1: signature, type, flags, empty domain/workstation fields. No
/// target info is sent; the server always replies with its own in Type 2.
fn build_negotiate_message() -> Vec<u8> {
	let mut msg = Vec::with_capacity(32);
	msg.extend_from_slice(b"NTLMSSP\0");
	msg.extend_from_slice(&1u32.to_le_bytes());
	let flags: u32 = 0x00000001 // NEGOTIATE_UNICODE
		| 0x00000002 // NEGOTIATE_OEM
		| 0x00000004 // REQUEST_TARGET
		| 0x00000200 // NEGOTIATE_NTLM
		| 0x00008000 // NEGOTIATE_ALWAYS_SIGN
		| 0x00080000 // NEGOTIATE_NTLM2
		| 0x20000000 // NEGOTIATE_128
		| 0x80000000; // NEGOTIATE_56
	msg.extend_from_slice(&flags.to_le_bytes());
	msg.extend_from_slice(&0u16.to_le_bytes());
	msg.extend_from_slice(&0u16.to_le_bytes());
	msg.extend_from_slice(&0u32.to_le_bytes());
	msg.extend_from_slice(&0u16.to_le_bytes());
	msg.extend_from_slice(&0u16.to_le_bytes());
	msg.extend_from_slice(&0u32.to_le_bytes());
	msg
}

/// Windows FILETIME: 100ns intervals since 1601-01-01, needed in the NTLMv2
/// blob's timestamp field.
fn filetime_now() -> u64 {
	const FILETIME_UNIX_OFFSET_SECS: u64 = 11_644_473_600;
	let unix_secs = Utc::now().timestamp().max(0) as u64;
	(unix_secs + FILETIME_UNIX_OFFSET_SECS) * 10_000_000
}

/// Type 3: NTLMv2 response computed from the server's challenge plus a
/// client challenge and timestamp blob, per MS-NLMP §3.3.2.
fn build_authenticate_message(
	creds: &Credentials,
	domain: &str,
	workstation: &str,
	challenge: &[u8],
) -> Result<Vec<u8>, ProxyError> {
	if challenge.len() < 32 {
		return Err(ProxyError::AuthFailed("NTLM type 2 message too short".into()));
	}
	let server_challenge = &challenge[24..32];

	let password_utf16 = utf16le(&creds.password);
	let nt_hash = md4::Md4::digest(&password_utf16);

	let user_domain_utf16 = utf16le(&format!("{}{}", creds.username.to_uppercase(), domain));
	let mut mac = Hmac::<md5::Md5>::new_from_slice(&nt_hash)
		.map_err(|e| ProxyError::AuthFailed(format!("HMAC init: {e}")))?;
	mac.update(&user_domain_utf16);
	let ntlmv2_hash = mac.finalize().into_bytes();

	let client_challenge: [u8; 8] = rand::random();
	let timestamp = filetime_now();

	let mut blob = Vec::new();
	blob.extend_from_slice(&[0x01, 0x01, 0x00, 0x00]);
	blob.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
	blob.extend_from_slice(&timestamp.to_le_bytes());
	blob.extend_from_slice(&client_challenge);
	blob.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);

	let mut proof_input = Vec::with_capacity(server_challenge.len() + blob.len());
	proof_input.extend_from_slice(server_challenge);
	proof_input.extend_from_slice(&blob);

	let mut mac2 = Hmac::<md5::Md5>::new_from_slice(&ntlmv2_hash)
		.map_err(|e| ProxyError::AuthFailed(format!("HMAC init: {e}")))?;
	mac2.update(&proof_input);
	let nt_proof = mac2.finalize().into_bytes();

	let mut nt_response = nt_proof.to_vec();
	nt_response.extend_from_slice(&blob);

	let domain_utf16 = utf16le(domain);
	let user_utf16 = utf16le(&creds.username);
	let ws_utf16 = utf16le(workstation);

	let mut msg = Vec::new();
	msg.extend_from_slice(b"NTLMSSP\0");
	msg.extend_from_slice(&3u32.to_le_bytes());

	let payload_offset: u32 = 88;
	let mut offset = payload_offset;

	// LM response: empty, NTLMv2 never sends it.
	msg.extend_from_slice(&0u16.to_le_bytes());
	msg.extend_from_slice(&0u16.to_le_bytes());
	msg.extend_from_slice(&offset.to_le_bytes());

	let nt_len = nt_response.len() as u16;
	msg.extend_from_slice(&nt_len.to_le_bytes());
	msg.extend_from_slice(&nt_len.to_le_bytes());
	msg.extend_from_slice(&offset.to_le_bytes());
	offset += nt_len as u32;

	let domain_len = domain_utf16.len() as u16;
	msg.extend_from_slice(&domain_len.to_le_bytes());
	msg.extend_from_slice(&domain_len.to_le_bytes());
	msg.extend_from_slice(&offset.to_le_bytes());
	offset += domain_len as u32;

	let user_len = user_utf16.len() as u16;
	msg.extend_from_slice(&user_len.to_le_bytes());
	msg.extend_from_slice(&user_len.to_le_bytes());
	msg.extend_from_slice(&offset.to_le_bytes());
	offset += user_len as u32;

	let ws_len = ws_utf16.len() as u16;
	msg.extend_from_slice(&ws_len.to_le_bytes());
	msg.extend_from_slice(&ws_len.to_le_bytes());
	msg.extend_from_slice(&offset.to_le_bytes());
	offset += ws_len as u32;

	msg.extend_from_slice(&0u16.to_le_bytes());
	msg.extend_from_slice(&0u16.to_le_bytes());
	msg.extend_from_slice(&offset.to_le_bytes());

	let flags: u32 = 0x00000001 | 0x00000200 | 0x00008000 | 0x00080000 | 0x20000000;
	msg.extend_from_slice(&flags.to_le_bytes());

	while msg.len() < payload_offset as usize {
		msg.push(0);
	}

	msg.extend_from_slice(&nt_response);
	msg.extend_from_slice(&domain_utf16);
	msg.extend_from_slice(&user_utf16);
	msg.extend_from_slice(&ws_utf16);

	Ok(msg)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn negotiate_message_has_ntlmssp_signature() {
		let msg = build_negotiate_message();
		assert_eq!(&msg[..8], b"NTLMSSP\0");
		assert_eq!(u32::from_le_bytes(msg[8..12].try_into().unwrap()), 1);
	}

	#[test]
	fn authenticate_message_rejects_short_challenge() {
		let creds = Credentials {
			username: "alice".into(),
			password: "hunter2".into(),
			realm: String::new(),
			ntlm_domain: Some("CORP".into()),
		};
		let err = build_authenticate_message(&creds, "CORP", "WS01", &[0u8; 10]).unwrap_err();
		assert!(matches!(err, ProxyError::AuthFailed(_)));
	}

	#[test]
	fn authenticate_message_has_ntlmssp_signature_and_type3() {
		let creds = Credentials {
			username: "alice".into(),
			password: "hunter2".into(),
			realm: String::new(),
			ntlm_domain: Some("CORP".into()),
		};
		let mut challenge = vec![0u8; 32];
		challenge[0..8].copy_from_slice(b"NTLMSSP\0");
		challenge[8..12].copy_from_slice(&2u32.to_le_bytes());
		let msg = build_authenticate_message(&creds, "CORP", "WS01", &challenge).unwrap();
		assert_eq!(&msg[..8], b"NTLMSSP\0");
		assert_eq!(u32::from_le_bytes(msg[8..12].try_into().unwrap()), 3);
	}
}
