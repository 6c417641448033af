use std::{
	fmt,
	net::{IpAddr, SocketAddr},
	sync::Arc,
};

use burrow_core::{
	AppContext, Registry, Stream,
	io::splice,
	listener::{TcpEndpoint, UdpEndpoint, UdpSender},
	net::{Headers, caller_ip},
};
use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
	MAX_POOLS, PING_INTERVAL, PING_TIMEOUT, POOL_RETRIES, POOL_RETRY_DELAY, REQUEST_TIMEOUT,
	ext::BridgeExt,
	proto::{Frame, ReplyCode, ResourceKind},
};

/// What a resource advertises publicly: a port for tcp/udp, a virtual
/// hostname for http.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connector {
	Port(u16),
	Host(String),
}

impl fmt::Display for Connector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Port(port) => write!(f, "{port}"),
			Self::Host(host) => f.write_str(host),
		}
	}
}

#[derive(Debug, Clone)]
pub struct ResourceConfig {
	pub kind:          ResourceKind,
	pub connector:     Connector,
	/// Hex of `sha256(secret || salt)`.
	pub secret_digest: String,
	pub salt:          String,
}

/// One advertised endpoint and everything scoped to it: the single bound
/// control stream, the admit list, the dispatch registry of parked external
/// callers, and (for UDP) the pool of data connections.
///
/// A resource is either free or bound. Binding owns the public listener:
/// it starts on a successful bind and stops when the binding dies.
pub struct Resource {
	config:        ResourceConfig,
	ctx:           Arc<AppContext>,
	state:         Mutex<BindState>,
	pool:          Mutex<Pool>,
	registry:      Registry,
	pool_registry: Registry,
	endpoint:      tokio::sync::Mutex<Option<PublicEndpoint>>,
}

#[derive(Default)]
struct BindState {
	binding:      Option<Arc<Stream>>,
	session_id:   Option<Uuid>,
	last_pong:    Option<Instant>,
	admit_secret: String,
	admit_list:   Vec<IpAddr>,
}

#[derive(Default)]
struct Pool {
	members: Vec<Arc<Stream>>,
	cursor:  usize,
}

enum PublicEndpoint {
	Tcp(TcpEndpoint),
	Udp(UdpEndpoint),
}

impl Resource {
	pub fn new(config: ResourceConfig, ctx: Arc<AppContext>) -> Arc<Self> {
		Arc::new(Self {
			config,
			ctx,
			state: Mutex::new(BindState::default()),
			pool: Mutex::new(Pool::default()),
			registry: Registry::new(),
			pool_registry: Registry::bounded(MAX_POOLS * 2),
			endpoint: tokio::sync::Mutex::new(None),
		})
	}

	pub fn kind(&self) -> ResourceKind {
		self.config.kind
	}

	pub fn connector(&self) -> &Connector {
		&self.config.connector
	}

	/// Whether a `(kind, resource)` pair out of a frame names this resource.
	pub fn matches(&self, kind: ResourceKind, resource: &str) -> bool {
		if self.config.kind != kind {
			return false;
		}
		match &self.config.connector {
			Connector::Port(port) => resource.parse::<u16>().is_ok_and(|parsed| parsed == *port),
			Connector::Host(host) => host == resource,
		}
	}

	pub fn is_bound(&self) -> bool {
		self.state.lock().binding.as_ref().is_some_and(|binding| binding.is_open())
	}

	pub fn session_id(&self) -> Option<Uuid> {
		self.state.lock().session_id
	}

	/// Installed UDP pool members.
	pub fn pool_len(&self) -> usize {
		self.pool.lock().members.len()
	}

	/// Entry point for a client's `authenticate` frame. On success this
	/// call owns the binding until it dies: it drives the listen and ping
	/// loops and only returns once the resource is free again (or a
	/// take-over superseded it).
	pub async fn bind(self: &Arc<Self>, secret: &str, admit_secret: Option<String>, stream: Arc<Stream>) {
		let occupant = {
			let state = self.state.lock();
			state.binding.clone().filter(|binding| binding.is_open())
		};
		let was_bound = occupant.is_some();
		if let Some(old) = occupant {
			if old.peer_ip() == stream.peer_ip() {
				// Same-peer take-over: the old binding is evicted before the
				// new secret is even looked at, so a stale session never
				// outlives a reconnect attempt from its own peer.
				old.close();
			} else {
				info!(
					target: "[RESOURCE]",
					"{} {}: bind rejected, occupied by another peer",
					self.config.kind, self.config.connector
				);
				let reply = Frame::Reply {
					code:    ReplyCode::ResourceOccupied,
					message: format!(
						"The {} {} is occupied by another client",
						self.config.kind, self.config.connector
					),
				};
				let _ = stream.send_frame(&reply).await;
				stream.close();
				return;
			}
		}

		if !self.verify(secret) {
			let reply = Frame::Reply {
				code:    ReplyCode::AuthenticationError,
				message: format!("Invalid password for {} {}", self.config.kind, self.config.connector),
			};
			let _ = stream.send_frame(&reply).await;
			stream.close();
			return;
		}

		let session_id = Uuid::new_v4();
		{
			let mut state = self.state.lock();
			state.binding = Some(stream.clone());
			state.session_id = Some(session_id);
			state.last_pong = Some(Instant::now());
			state.admit_secret = admit_secret.unwrap_or_default();
			if !was_bound {
				// Free -> Bound wipes prior authorizations; a same-peer
				// rebind keeps them so users need not re-authorize.
				state.admit_list.clear();
			}
		}
		self.pool.lock().cursor = 0;

		if let Err(err) = self.start_endpoint().await {
			warn!(
				target: "[RESOURCE]",
				"{} {}: failed to start public endpoint: {err}",
				self.config.kind, self.config.connector
			);
			self.teardown(&stream).await;
			return;
		}

		let reply = Frame::Reply {
			code:    ReplyCode::Ok,
			message: format!("Successfully bound to {} {}", self.config.kind, self.config.connector),
		};
		if stream.send_frame(&reply).await.is_err() {
			self.teardown(&stream).await;
			return;
		}
		info!(
			target: "[RESOURCE]",
			"{} {}: bound, session {session_id}",
			self.config.kind, self.config.connector
		);

		tokio::join!(self.listen_loop(&stream), self.ping_loop(&stream));
		self.teardown(&stream).await;
	}

	/// Admits one external caller: registers it under a fresh identifier,
	/// asks the bound client to dial back, and parks the caller. Runs on
	/// the caller's own task, so parking out the full window is fine.
	pub async fn admit_external(&self, stream: Arc<Stream>, headers: Option<&Headers>) {
		let binding = {
			let state = self.state.lock();
			state.binding.clone().filter(|binding| binding.is_open())
		};
		let Some(binding) = binding else {
			stream.close();
			return;
		};

		let empty = Headers::new();
		let ip = caller_ip(headers.unwrap_or(&empty), stream.peer_ip());
		let admitted = {
			let state = self.state.lock();
			state.admit_secret.is_empty() || ip.is_some_and(|ip| state.admit_list.contains(&ip))
		};
		if !admitted {
			debug!(
				target: "[RESOURCE]",
				"{} {}: external caller {ip:?} is not authorized",
				self.config.kind, self.config.connector
			);
			stream.close();
			return;
		}

		let identifier = self.registry.register(stream.clone());
		let frame = Frame::NewRequest {
			identifier: identifier.clone(),
		};
		if binding.send_frame(&frame).await.is_err() {
			if let Some(orphan) = self.registry.pop(&identifier) {
				orphan.close();
			}
			return;
		}
		tokio::select! {
			_ = self.registry.park(&identifier, REQUEST_TIMEOUT) => {}
			// The caller gave up (or shutdown closed it) while parked.
			_ = stream.closed() => {
				if let Some(orphan) = self.registry.pop(&identifier) {
					orphan.close();
				}
			}
		}
	}

	/// Pairs a client dial-back with the parked external caller, or closes
	/// the dial-back when the identifier already expired.
	pub async fn dial_back(&self, identifier: &str, stream: Arc<Stream>) {
		match self.registry.pop(identifier) {
			Some(parked) => {
				splice(parked, stream).await;
			}
			None => stream.close(),
		}
	}

	/// Installs a client dial-back as a UDP pool member and drives its
	/// reader until the connection dies.
	pub async fn install_pool(&self, identifier: &str, stream: Arc<Stream>) {
		{
			let pool = self.pool.lock();
			if pool.members.len() >= MAX_POOLS {
				drop(pool);
				stream.close();
				return;
			}
		}
		if self.pool_registry.pop(identifier).is_none() {
			stream.close();
			return;
		}
		let active = {
			let mut pool = self.pool.lock();
			pool.members.push(stream.clone());
			pool.members.len()
		};
		info!(
			target: "[RESOURCE]",
			"{} {}: pool member installed ({active} active)",
			self.config.kind, self.config.connector
		);

		self.pool_reader(&stream).await;

		self.pool.lock().members.retain(|member| !Arc::ptr_eq(member, &stream));
		stream.close();
	}

	/// Frames one public datagram onto a pool member, round-robin. An empty
	/// pool is retried a few times before the datagram is dropped.
	pub async fn on_datagram(&self, payload: Bytes, source: SocketAddr) {
		for attempt in 0..=POOL_RETRIES {
			if let Some(member) = self.next_pool_member() {
				let frame = Frame::Datagram {
					source_host: source.ip().to_string(),
					source_port: source.port(),
					payload:     payload.to_vec(),
				};
				member.write(frame.framed());
				if member.flush().await.is_err() {
					member.close();
				}
				return;
			}
			if attempt < POOL_RETRIES {
				warn!(
					target: "[RESOURCE]",
					"{} {}: no pool member available ({} retries left)",
					self.config.kind, self.config.connector, POOL_RETRIES - attempt
				);
				tokio::time::sleep(POOL_RETRY_DELAY).await;
			}
		}
		warn!(
			target: "[RESOURCE]",
			"{} {}: dropping datagram from {source}, pool is empty",
			self.config.kind, self.config.connector
		);
	}

	/// Web-authorization entry: admits `ip` when `code` matches the
	/// client-supplied admit secret. False when no secret is configured.
	pub fn authorize(&self, ip: IpAddr, code: &str) -> bool {
		let mut state = self.state.lock();
		if state.admit_secret.is_empty() || state.admit_secret != code {
			return false;
		}
		if !state.admit_list.contains(&ip) {
			state.admit_list.push(ip);
		}
		true
	}

	fn verify(&self, secret: &str) -> bool {
		let digest = Sha256::digest(format!("{secret}{}", self.config.salt));
		hex::encode(digest) == self.config.secret_digest.to_ascii_lowercase()
	}

	async fn listen_loop(&self, binding: &Arc<Stream>) {
		loop {
			let Some(frame) = binding.read_frame().await else { break };
			self.state.lock().last_pong = Some(Instant::now());
			match frame {
				Ok(Frame::AddPool) if self.config.kind == ResourceKind::Udp => self.stage_pool(binding).await,
				Ok(Frame::Pong) => {}
				Ok(other) => debug!(target: "[RESOURCE]", "ignoring frame on binding: {other:?}"),
				Err(err) => debug!(target: "[RESOURCE]", "dropping undecodable frame: {err}"),
			}
		}
		binding.close();
	}

	/// Answers `add_pool`: stages the request in the bounded pool registry
	/// and tells the client which identifier to dial back with.
	async fn stage_pool(&self, binding: &Arc<Stream>) {
		let identifier = self.pool_registry.register(binding.clone());
		if binding.send_frame(&Frame::NewPool { identifier }).await.is_err() {
			binding.close();
		}
	}

	async fn ping_loop(&self, binding: &Arc<Stream>) {
		loop {
			if !binding.is_open() {
				break;
			}
			let stale = {
				let state = self.state.lock();
				state.last_pong.map(|at| at.elapsed()).unwrap_or_default()
			};
			if stale > PING_TIMEOUT {
				warn!(
					target: "[RESOURCE]",
					"{} {}: no pong for {}s, dropping binding",
					self.config.kind, self.config.connector, stale.as_secs()
				);
				binding.close();
				break;
			}
			binding.write(Frame::Ping.framed());
			if binding.flush().await.is_err() {
				binding.close();
				break;
			}
			tokio::select! {
				_ = tokio::time::sleep(PING_INTERVAL) => {}
				_ = binding.closed() => break,
			}
		}
	}

	fn next_pool_member(&self) -> Option<Arc<Stream>> {
		let mut pool = self.pool.lock();
		let count = pool.members.len();
		if count == 0 {
			return None;
		}
		let index = pool.cursor % count;
		pool.cursor = index + 1;
		Some(pool.members[index].clone())
	}

	/// Relays framed datagrams coming back from the client out the public
	/// UDP endpoint to their original source.
	async fn pool_reader(&self, member: &Arc<Stream>) {
		loop {
			let Some(frame) = member.read_frame().await else { break };
			match frame {
				Ok(Frame::Datagram {
					source_host,
					source_port,
					payload,
				}) => {
					let Some(sender) = self.udp_sender().await else { continue };
					if let Err(err) = sender.send((source_host.as_str(), source_port), &payload).await {
						debug!(
							target: "[RESOURCE]",
							"reply datagram to {source_host}:{source_port} failed: {err}"
						);
					}
				}
				Ok(other) => debug!(target: "[RESOURCE]", "ignoring frame on pool member: {other:?}"),
				Err(err) => debug!(target: "[RESOURCE]", "dropping undecodable pool frame: {err}"),
			}
		}
		member.close();
	}

	async fn udp_sender(&self) -> Option<UdpSender> {
		let endpoint = self.endpoint.lock().await;
		match endpoint.as_ref() {
			Some(PublicEndpoint::Udp(udp)) => Some(udp.sender()),
			_ => None,
		}
	}

	/// Starts the public listener for tcp/udp resources. HTTP resources
	/// ride the shared front-end instead.
	async fn start_endpoint(self: &Arc<Self>) -> Result<(), burrow_core::Error> {
		let port = match (&self.config.kind, &self.config.connector) {
			(ResourceKind::Tcp | ResourceKind::Udp, Connector::Port(port)) => *port,
			_ => return Ok(()),
		};
		let mut endpoint = self.endpoint.lock().await;
		if endpoint.is_some() {
			return Ok(());
		}
		let addr = SocketAddr::from(([0, 0, 0, 0], port));
		let started = if self.config.kind == ResourceKind::Tcp {
			let resource = Arc::downgrade(self);
			PublicEndpoint::Tcp(
				TcpEndpoint::bind(addr, &self.ctx, move |stream| {
					let resource = resource.clone();
					async move {
						match resource.upgrade() {
							Some(resource) => resource.admit_external(stream, None).await,
							None => stream.close(),
						}
					}
				})
				.await?,
			)
		} else {
			let resource = Arc::downgrade(self);
			PublicEndpoint::Udp(
				UdpEndpoint::bind(addr, &self.ctx, move |payload, source| {
					let resource = resource.clone();
					async move {
						if let Some(resource) = resource.upgrade() {
							resource.on_datagram(payload, source).await;
						}
					}
				})
				.await?,
			)
		};
		*endpoint = Some(started);
		Ok(())
	}

	/// Bound -> Free, unless a take-over already installed a newer binding.
	async fn teardown(&self, stream: &Arc<Stream>) {
		stream.close();
		let mut endpoint = self.endpoint.lock().await;
		{
			let mut state = self.state.lock();
			match &state.binding {
				Some(current) if Arc::ptr_eq(current, stream) => {
					state.binding = None;
					state.session_id = None;
					state.last_pong = None;
				}
				// Superseded; the new binding owns the endpoint now.
				_ => return,
			}
		}
		if let Some(stopped) = endpoint.take() {
			match stopped {
				PublicEndpoint::Tcp(tcp) => tcp.stop(),
				PublicEndpoint::Udp(udp) => udp.stop(),
			}
		}
		info!(
			target: "[RESOURCE]",
			"{} {}: binding released",
			self.config.kind, self.config.connector
		);
	}

	/// Public endpoint port actually bound, for tests against port 0.
	pub async fn endpoint_addr(&self) -> Option<SocketAddr> {
		let endpoint = self.endpoint.lock().await;
		endpoint.as_ref().map(|endpoint| match endpoint {
			PublicEndpoint::Tcp(tcp) => tcp.local_addr(),
			PublicEndpoint::Udp(udp) => udp.local_addr(),
		})
	}
}
