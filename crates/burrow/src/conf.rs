use std::path::Path;

use burrow_bridge::{
	inbound::{Connector, ResourceConfig},
	proto::ResourceKind,
};
use eyre::{WrapErr as _, bail};
use sha2::{Digest, Sha256};

/// Ports are 1-65535; zero is the only value a u16 can hold that is not a
/// usable port.
pub fn validate_port(port: u16) -> eyre::Result<()> {
	if port == 0 {
		bail!("port has to be between 1 and 65535");
	}
	Ok(())
}

/// The digest stored in the resource file: hex of sha256(secret || salt).
pub fn sha256_hex(secret: &str, salt: &str) -> String {
	hex::encode(Sha256::digest(format!("{secret}{salt}")))
}

/// Loads the resource file: a header row, then one
/// `type,con,sha256hex,salt` row per resource. Any malformed row is fatal.
pub fn load_resources(path: &Path) -> eyre::Result<Vec<ResourceConfig>> {
	let text = std::fs::read_to_string(path)
		.wrap_err_with(|| format!("failed to read resource file {}", path.display()))?;
	parse_resources(&text)
}

pub fn parse_resources(text: &str) -> eyre::Result<Vec<ResourceConfig>> {
	let mut resources: Vec<ResourceConfig> = Vec::new();
	for (index, line) in text.lines().enumerate().skip(1) {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}
		let row = index + 1;
		let fields: Vec<&str> = line.split(',').map(str::trim).collect();
		let &[kind, con, sha256hex, salt] = fields.as_slice() else {
			bail!("row {row}: expected type,con,sha256hex,salt");
		};

		let kind: ResourceKind = kind
			.parse()
			.map_err(|_| eyre::eyre!("row {row}: unknown resource type {kind:?}"))?;
		let connector = match kind {
			ResourceKind::Http => {
				if con.is_empty() {
					bail!("row {row}: http resources need a hostname connector");
				}
				Connector::Host(con.to_string())
			}
			ResourceKind::Tcp | ResourceKind::Udp => {
				let port: u16 = con
					.parse()
					.wrap_err_with(|| format!("row {row}: {kind} connector must be a port"))?;
				validate_port(port).wrap_err_with(|| format!("row {row}"))?;
				Connector::Port(port)
			}
		};

		if sha256hex.len() != 64 || !sha256hex.bytes().all(|byte| byte.is_ascii_hexdigit()) {
			bail!("row {row}: sha256hex must be 64 hex characters");
		}
		if resources
			.iter()
			.any(|existing| existing.kind == kind && existing.connector == connector)
		{
			bail!("row {row}: duplicate resource {kind} {connector}");
		}

		resources.push(ResourceConfig {
			kind,
			connector,
			secret_digest: sha256hex.to_lowercase(),
			salt: salt.to_string(),
		});
	}
	Ok(resources)
}
