use std::{sync::Arc, time::Duration};

use burrow_core::{AppContext, Stream, io::splice};
use parking_lot::Mutex;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::{net::TcpStream, sync::mpsc, time::Instant};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use super::sessions::{AppDatagram, UdpSessions};
use crate::{
	POOL_RETRIES, POOL_RETRY_DELAY,
	ext::BridgeExt,
	proto::{Frame, ReplyCode, ResourceKind},
	tls::{TlsMode, tls_config},
};

/// A control connection with no inbound frames for this long is torn down
/// and re-established.
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);

const RESTART_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct TunnelOpts {
	pub server_host:  String,
	pub server_port:  u16,
	pub server_tls:   TlsMode,
	pub app_host:     String,
	pub app_port:     u16,
	pub app_tls:      TlsMode,
	pub kind:         ResourceKind,
	/// Port (tcp/udp) or hostname (http) advertised by the host.
	pub resource:     String,
	pub secret:       String,
	/// Resource code external users present to get admitted; empty
	/// disables the admit list.
	pub admit_secret: String,
	pub pool_count:   usize,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TunnelError {
	#[snafu(display("failed to reach {host}:{port}"))]
	Dial {
		host:   String,
		port:   u16,
		source: std::io::Error,
	},
	#[snafu(display("tls handshake with {host} failed"))]
	Handshake {
		host:   String,
		source: std::io::Error,
	},
	#[snafu(display("{host} is not a valid tls server name"))]
	ServerName {
		host: String,
	},
	#[snafu(display("failed to build tls configuration"))]
	Tls {
		source: crate::tls::TlsError,
	},
	#[snafu(display("bridge stream failed"))]
	Bridge {
		source: burrow_core::Error,
	},
	#[snafu(display("no reply to authenticate"))]
	NoAuthReply,
	#[snafu(display("host refused the tunnel: {message} ({code:?})"))]
	Rejected {
		code:    ReplyCode,
		message: String,
	},
	#[snafu(display("no inbound traffic for {}s", WATCHDOG_TIMEOUT.as_secs()))]
	Stale,
}

impl TunnelError {
	/// Fatal errors terminate the client; everything else is retried.
	pub fn is_fatal(&self) -> bool {
		matches!(self, Self::Rejected { .. } | Self::NoAuthReply)
	}
}

/// Dials `(host, port)`, optionally wrapping the connection in TLS. The
/// wrapper is decided here once; everything above sees a plain [`Stream`].
pub async fn dial(host: &str, port: u16, tls: TlsMode) -> Result<Arc<Stream>, TunnelError> {
	let tcp = TcpStream::connect((host, port)).await.context(DialSnafu { host, port })?;
	let peer = tcp.peer_addr().ok();
	if tls == TlsMode::Off {
		return Ok(Stream::new(tcp, peer));
	}
	let config = tls_config(tls).context(TlsSnafu)?;
	let connector = TlsConnector::from(Arc::new(config));
	let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
		.ok()
		.context(ServerNameSnafu { host })?;
	let session = connector
		.connect(server_name, tcp)
		.await
		.context(HandshakeSnafu { host })?;
	Ok(Stream::new(session, peer))
}

/// The client-side tunnel: owns the control connection, dials back data
/// connections on demand, and (for UDP) keeps the pool and the per-source
/// session table.
pub struct Tunnel {
	opts:         TunnelOpts,
	ctx:          Arc<AppContext>,
	pools:        Mutex<Pool>,
	last_inbound: Mutex<Instant>,
	sessions:     Arc<UdpSessions>,
	reply_rx:     tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<AppDatagram>>>,
}

#[derive(Default)]
struct Pool {
	members: Vec<Arc<Stream>>,
	cursor:  usize,
}

impl Tunnel {
	pub fn new(opts: TunnelOpts, ctx: Arc<AppContext>) -> Arc<Self> {
		let (reply_tx, reply_rx) = mpsc::unbounded_channel();
		let sessions = UdpSessions::new(reply_tx, ctx.clone());
		Arc::new(Self {
			opts,
			ctx,
			pools: Mutex::new(Pool::default()),
			last_inbound: Mutex::new(Instant::now()),
			sessions,
			reply_rx: tokio::sync::Mutex::new(Some(reply_rx)),
		})
	}

	/// Runs the tunnel until a fatal error or shutdown. A dead session is
	/// re-established immediately; a failed one after a short backoff.
	pub async fn run(self: Arc<Self>) -> Result<(), TunnelError> {
		if let Some(reply_rx) = self.reply_rx.lock().await.take() {
			let tunnel = self.clone();
			self.ctx.tasks.spawn(tunnel.reply_pump(reply_rx));
		}
		loop {
			if self.ctx.token.is_cancelled() {
				return Ok(());
			}
			match self.session().await {
				Ok(()) => {}
				Err(err) if err.is_fatal() => return Err(err),
				Err(TunnelError::Stale) => {
					warn!(target: "[TUNNEL]", "connection went stale, reconnecting");
				}
				Err(err) => {
					warn!(target: "[TUNNEL]", "session failed: {err}, retrying in {}s", RESTART_DELAY.as_secs());
					tokio::select! {
						_ = tokio::time::sleep(RESTART_DELAY) => {}
						_ = self.ctx.token.cancelled() => return Ok(()),
					}
				}
			}
		}
	}

	/// One authenticate-listen cycle on a fresh control connection.
	async fn session(self: &Arc<Self>) -> Result<(), TunnelError> {
		let control = dial(&self.opts.server_host, self.opts.server_port, self.opts.server_tls).await?;
		debug!(
			target: "[TUNNEL]",
			"connected to {}:{}", self.opts.server_host, self.opts.server_port
		);

		let frame = Frame::Authenticate {
			kind:     self.opts.kind,
			resource: self.opts.resource.clone(),
			secret:   self.opts.secret.clone(),
			auth:     (!self.opts.secret.is_empty()).then(|| self.opts.admit_secret.clone()),
		};
		control.send_frame(&frame).await.context(BridgeSnafu)?;

		let (code, message) = match control.read_frame().await {
			Some(Ok(Frame::Reply { code, message })) => (code, message),
			Some(_) => {
				// Unintelligible reply: drop the connection and start over.
				control.close();
				return Ok(());
			}
			None => {
				control.close();
				return NoAuthReplySnafu.fail();
			}
		};
		self.touch();
		if code != ReplyCode::Ok {
			control.close();
			return RejectedSnafu { code, message }.fail();
		}
		info!(target: "[TUNNEL]", "{message}");

		if self.opts.kind == ResourceKind::Udp {
			control.send_frame(&Frame::AddPool).await.context(BridgeSnafu)?;
		}

		let outcome = self.listen(&control).await;
		control.close();
		outcome
	}

	async fn listen(self: &Arc<Self>, control: &Arc<Stream>) -> Result<(), TunnelError> {
		loop {
			tokio::select! {
				frame = control.read_frame() => match frame {
					None => return Ok(()),
					Some(Ok(frame)) => {
						self.touch();
						self.dispatch(frame, control).await;
					}
					Some(Err(err)) => debug!(target: "[TUNNEL]", "dropping undecodable frame: {err}"),
				},
				_ = self.stale() => return StaleSnafu.fail(),
				_ = self.ctx.token.cancelled() => return Ok(()),
			}
		}
	}

	async fn dispatch(self: &Arc<Self>, frame: Frame, control: &Arc<Stream>) {
		match frame {
			Frame::Ping => {
				if control.send_frame(&Frame::Pong).await.is_err() {
					control.close();
				}
			}
			Frame::NewRequest { identifier } => {
				let tunnel = self.clone();
				self.ctx.tasks.spawn(async move {
					tunnel.handle_request(identifier).await;
				});
			}
			Frame::NewPool { identifier } => {
				let tunnel = self.clone();
				let control = control.clone();
				self.ctx.tasks.spawn(async move {
					tunnel.handle_new_pool(identifier, control).await;
				});
			}
			other => debug!(target: "[TUNNEL]", "ignoring frame on control connection: {other:?}"),
		}
	}

	/// Answers `new_request`: a fresh bridge connection bound to the
	/// identifier, a fresh connection to the local app, and a splice
	/// between them.
	async fn handle_request(&self, identifier: String) {
		let bridge = dial(&self.opts.server_host, self.opts.server_port, self.opts.server_tls);
		let app = dial(&self.opts.app_host, self.opts.app_port, self.opts.app_tls);
		let (bridge, app) = match tokio::try_join!(bridge, app) {
			Ok(pair) => pair,
			Err(err) => {
				warn!(target: "[TUNNEL]", "dial-back failed: {err}");
				return;
			}
		};
		let frame = Frame::Bind {
			kind:       self.opts.kind,
			resource:   self.opts.resource.clone(),
			identifier,
		};
		if bridge.send_frame(&frame).await.is_err() {
			bridge.close();
			app.close();
			return;
		}
		splice(bridge, app).await;
	}

	/// Answers `new_pool`: tops up the pool request pipeline, then installs
	/// a fresh bridge connection as a pool member and reads datagrams off
	/// it until it dies.
	async fn handle_new_pool(&self, identifier: String, control: Arc<Stream>) {
		let want_more = {
			let pools = self.pools.lock();
			pools.members.len() + 2 < self.opts.pool_count
		};
		if want_more {
			let _ = control.send_frame(&Frame::AddPool).await;
		}

		let member = match dial(&self.opts.server_host, self.opts.server_port, self.opts.server_tls).await {
			Ok(member) => member,
			Err(err) => {
				warn!(target: "[TUNNEL]", "pool dial failed: {err}");
				return;
			}
		};
		let frame = Frame::Bind {
			kind:       self.opts.kind,
			resource:   self.opts.resource.clone(),
			identifier,
		};
		if member.send_frame(&frame).await.is_err() {
			member.close();
			return;
		}
		let active = {
			let mut pools = self.pools.lock();
			pools.members.push(member.clone());
			pools.members.len()
		};
		info!(target: "[TUNNEL]", "pool member connected ({active} active)");

		self.pool_reader(&member).await;

		self.pools.lock().members.retain(|candidate| !Arc::ptr_eq(candidate, &member));
		member.close();
	}

	/// Delivers framed datagrams from the host into per-source sessions
	/// towards the local app.
	async fn pool_reader(&self, member: &Arc<Stream>) {
		loop {
			let Some(frame) = member.read_frame().await else { break };
			match frame {
				Ok(Frame::Datagram {
					source_host,
					source_port,
					payload,
				}) => {
					let session = self.sessions.get(&source_host, source_port).await;
					session
						.send((self.opts.app_host.as_str(), self.opts.app_port), &payload)
						.await;
				}
				Ok(other) => debug!(target: "[TUNNEL]", "ignoring frame on pool member: {other:?}"),
				Err(err) => debug!(target: "[TUNNEL]", "dropping undecodable pool frame: {err}"),
			}
		}
	}

	/// Drains app replies onto pool members. Each datagram forwards on its
	/// own task so one empty-pool retry cycle cannot stall the rest.
	async fn reply_pump(self: Arc<Self>, mut reply_rx: mpsc::UnboundedReceiver<AppDatagram>) {
		loop {
			let datagram = tokio::select! {
				datagram = reply_rx.recv() => datagram,
				_ = self.ctx.token.cancelled() => None,
			};
			let Some(datagram) = datagram else { break };
			let tunnel = self.clone();
			self.ctx.tasks.spawn(async move {
				tunnel.forward_reply(datagram).await;
			});
		}
	}

	async fn forward_reply(&self, datagram: AppDatagram) {
		for attempt in 0..=POOL_RETRIES {
			if let Some(member) = self.next_pool_member() {
				let frame = Frame::Datagram {
					source_host: datagram.source_host.clone(),
					source_port: datagram.source_port,
					payload:     datagram.payload.to_vec(),
				};
				member.write(frame.framed());
				if member.flush().await.is_err() {
					member.close();
				}
				return;
			}
			if attempt < POOL_RETRIES {
				warn!(
					target: "[TUNNEL]",
					"no pool member for app reply ({} retries left)",
					POOL_RETRIES - attempt
				);
				tokio::time::sleep(POOL_RETRY_DELAY).await;
			}
		}
		warn!(target: "[TUNNEL]", "dropping app reply, pool is empty");
	}

	fn next_pool_member(&self) -> Option<Arc<Stream>> {
		let mut pools = self.pools.lock();
		let count = pools.members.len();
		if count == 0 {
			return None;
		}
		let index = pools.cursor % count;
		pools.cursor = index + 1;
		Some(pools.members[index].clone())
	}

	fn touch(&self) {
		*self.last_inbound.lock() = Instant::now();
	}

	/// Resolves once the control connection has been silent past the
	/// watchdog window.
	async fn stale(&self) {
		loop {
			let deadline = *self.last_inbound.lock() + WATCHDOG_TIMEOUT;
			if Instant::now() >= deadline {
				return;
			}
			tokio::time::sleep_until(deadline).await;
		}
	}
}
