use std::path::PathBuf;

use burrow_bridge::{
	outbound::TunnelOpts,
	proto::ResourceKind,
	tls::TlsMode,
};
use clap::Parser;
use eyre::{WrapErr as _, bail};

use crate::conf::validate_port;

/// The public host: accepts bridge connections, owns the advertised
/// endpoints and the HTTP front-end.
#[derive(Debug, Parser)]
#[command(name = "burrow-host", about, long_about = None)]
pub struct HostArgs {
	/// Port of the bridge control service
	#[arg(long = "tcpPort", env = "TCP_SERVER_PORT", default_value_t = 9000)]
	pub tcp_port: u16,

	/// Port of the shared HTTP front-end
	#[arg(long = "httpPort", env = "HTTP_SERVER_PORT", default_value_t = 8000)]
	pub http_port: u16,

	/// Port of the web authorization endpoint (disabled when absent)
	#[arg(long = "webPort", env = "DTL_AUTH_PORT")]
	pub web_port: Option<u16>,

	/// Resource file, one `type,con,sha256hex,salt` row per resource
	#[arg(long, value_name = "FILE", default_value = "tunnel_resources.csv")]
	pub config: PathBuf,

	/// Print sha256(auth || salt) and exit (pass 1)
	#[arg(long = "sha256gen", value_name = "1")]
	pub sha256gen: Option<String>,

	/// Secret for --sha256gen
	#[arg(long)]
	pub auth: Option<String>,

	/// Salt for --sha256gen
	#[arg(long)]
	pub salt: Option<String>,
}

/// The client behind NAT: dials the host, claims a resource and forwards
/// traffic to a local application.
#[derive(Debug, Parser)]
#[command(name = "burrow-client", about, long_about = None)]
pub struct ClientArgs {
	/// Resource kind to expose: tcp, http or udp
	#[arg(long = "appType")]
	pub app_type: String,

	/// Local application host to link
	#[arg(long = "appHost")]
	pub app_host: String,

	/// Local application port to link
	#[arg(long = "appPort")]
	pub app_port: u16,

	/// Wrap application connections in TLS (1/0)
	#[arg(long = "appSSL", default_value_t = 0)]
	pub app_ssl: u8,

	/// Skip certificate verification towards the application (1/0)
	#[arg(long = "appSSLUnsafe", default_value_t = 0)]
	pub app_ssl_unsafe: u8,

	/// Resource code others must present before connecting (optional)
	#[arg(long = "appAuth", default_value = "")]
	pub app_auth: String,

	/// Public server host
	#[arg(long = "serverHost")]
	pub server_host: String,

	/// Public port (tcp/udp) or hostname (http) to claim
	#[arg(long = "serverTarget")]
	pub server_target: String,

	/// Password of the public target
	#[arg(long = "serverAuth", default_value = "")]
	pub server_auth: String,

	/// Wrap the bridge in TLS (1/0)
	#[arg(long = "serverSSL", default_value_t = 0)]
	pub server_ssl: u8,

	/// Skip certificate verification towards the server (1/0)
	#[arg(long = "serverSSLUnsafe", default_value_t = 0)]
	pub server_ssl_unsafe: u8,

	/// Port the server runs the bridge service on
	#[arg(long = "bridgePort", default_value_t = 9000)]
	pub bridge_port: u16,

	/// Pool connections used to carry UDP datagrams
	#[arg(long = "pools", default_value_t = 1)]
	pub pools: usize,
}

fn tls_mode(enabled: u8, skip_verify: u8) -> TlsMode {
	if enabled != 1 {
		TlsMode::Off
	} else if skip_verify == 1 {
		TlsMode::Insecure
	} else {
		TlsMode::Verified
	}
}

impl ClientArgs {
	/// Validates the argument set and folds it into tunnel options.
	/// Everything rejected here is fatal at startup.
	pub fn tunnel_opts(&self) -> eyre::Result<TunnelOpts> {
		let kind: ResourceKind = self
			.app_type
			.to_lowercase()
			.parse()
			.map_err(|_| eyre::eyre!("--appType must be one of tcp, http or udp"))?;

		validate_port(self.app_port).wrap_err("--appPort")?;
		validate_port(self.bridge_port).wrap_err("--bridgePort")?;

		if matches!(kind, ResourceKind::Tcp | ResourceKind::Udp) {
			let target: u16 = self
				.server_target
				.parse()
				.wrap_err("--serverTarget must be a port for tcp/udp tunnels")?;
			validate_port(target).wrap_err("--serverTarget")?;
		}

		if kind == ResourceKind::Udp && self.pools < 1 {
			bail!("the udp protocol requires at least 1 pool connection (--pools)");
		}

		Ok(TunnelOpts {
			server_host:  self.server_host.clone(),
			server_port:  self.bridge_port,
			server_tls:   tls_mode(self.server_ssl, self.server_ssl_unsafe),
			app_host:     self.app_host.clone(),
			app_port:     self.app_port,
			app_tls:      tls_mode(self.app_ssl, self.app_ssl_unsafe),
			kind,
			resource:     self.server_target.clone(),
			secret:       self.server_auth.clone(),
			admit_secret: self.app_auth.clone(),
			pool_count:   self.pools,
		})
	}
}
