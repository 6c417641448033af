use std::{collections::HashMap, net::Ipv4Addr, sync::Arc, time::Duration};

use burrow_core::AppContext;
use bytes::Bytes;
use tokio::{net::UdpSocket, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cleanup cadence of the session wheel.
pub const SESSION_ROTATION: Duration = Duration::from_secs(180);

const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// One datagram read back from the local app, tagged with the external
/// source it belongs to.
#[derive(Debug)]
pub struct AppDatagram {
	pub source_host: String,
	pub source_port: u16,
	pub payload:     Bytes,
}

/// Per-source UDP sessions in a three-generation wheel. A session that
/// stays in use keeps being promoted back into `current`; an idle one
/// drifts to `staged`, has its socket closed entering `closed`, and is
/// dropped a rotation later. `get` revives staged and closed sessions,
/// re-opening the socket where needed, so a source keeps a stable
/// ephemeral port for as long as it keeps talking.
pub struct UdpSessions {
	wheel:   tokio::sync::Mutex<Wheel>,
	replies: mpsc::UnboundedSender<AppDatagram>,
	ctx:     Arc<AppContext>,
}

#[derive(Default)]
struct Wheel {
	current: HashMap<String, Arc<UdpSession>>,
	staged:  HashMap<String, Arc<UdpSession>>,
	closed:  HashMap<String, Arc<UdpSession>>,
}

impl UdpSessions {
	pub fn new(replies: mpsc::UnboundedSender<AppDatagram>, ctx: Arc<AppContext>) -> Arc<Self> {
		let sessions = Arc::new(Self {
			wheel: tokio::sync::Mutex::new(Wheel::default()),
			replies,
			ctx,
		});
		let rotator = sessions.clone();
		let cancel = sessions.ctx.token.child_token();
		sessions.ctx.tasks.spawn(async move {
			loop {
				tokio::select! {
					_ = cancel.cancelled() => break,
					_ = tokio::time::sleep(SESSION_ROTATION) => rotator.rotate().await,
				}
			}
		});
		sessions
	}

	/// The session for `(host, port)`, promoted into the current generation
	/// and (re-)opened if necessary.
	pub async fn get(&self, host: &str, port: u16) -> Arc<UdpSession> {
		let key = format!("{host}:{port}");
		let mut wheel = self.wheel.lock().await;
		if let Some(session) = wheel.current.get(&key) {
			return session.clone();
		}
		if let Some(session) = wheel.staged.remove(&key) {
			wheel.current.insert(key, session.clone());
			return session;
		}
		if let Some(session) = wheel.closed.remove(&key) {
			session.open(self.replies.clone(), &self.ctx).await;
			wheel.current.insert(key, session.clone());
			return session;
		}
		let session = Arc::new(UdpSession {
			source_host: host.to_string(),
			source_port: port,
			inner:       tokio::sync::Mutex::new(None),
		});
		session.open(self.replies.clone(), &self.ctx).await;
		wheel.current.insert(key, session.clone());
		session
	}

	/// One wheel turn: the oldest generation is dropped (its sockets were
	/// closed a turn ago) and the demoted one is closed.
	async fn rotate(&self) {
		let demoted = {
			let mut wheel = self.wheel.lock().await;
			wheel.closed = std::mem::take(&mut wheel.staged);
			wheel.staged = std::mem::take(&mut wheel.current);
			wheel.closed.values().cloned().collect::<Vec<_>>()
		};
		if !demoted.is_empty() {
			debug!(target: "[SESSIONS]", "closing {} idle udp sessions", demoted.len());
		}
		for session in demoted {
			session.close().await;
		}
	}
}

/// One external source's leg into the local app: an ephemeral UDP socket
/// plus the receiver task feeding app replies back to the tunnel.
pub struct UdpSession {
	source_host: String,
	source_port: u16,
	inner:       tokio::sync::Mutex<Option<Active>>,
}

struct Active {
	socket: Arc<UdpSocket>,
	stop:   CancellationToken,
}

impl UdpSession {
	pub fn remote(&self) -> (&str, u16) {
		(&self.source_host, self.source_port)
	}

	/// Sends one datagram from this session's socket to the local app.
	pub async fn send(&self, addr: (&str, u16), payload: &[u8]) {
		let socket = self.inner.lock().await.as_ref().map(|active| active.socket.clone());
		match socket {
			Some(socket) => {
				if let Err(err) = socket.send_to(payload, addr).await {
					warn!(target: "[SESSIONS]", "send to {}:{} failed: {err}", addr.0, addr.1);
				}
			}
			None => warn!(target: "[SESSIONS]", "session socket is closed, datagram ignored"),
		}
	}

	/// The ephemeral port the local app sees this session on.
	pub async fn local_port(&self) -> Option<u16> {
		let inner = self.inner.lock().await;
		inner
			.as_ref()
			.and_then(|active| active.socket.local_addr().ok())
			.map(|addr| addr.port())
	}

	async fn open(&self, replies: mpsc::UnboundedSender<AppDatagram>, ctx: &AppContext) {
		let mut inner = self.inner.lock().await;
		if inner.is_some() {
			return;
		}
		let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
			Ok(socket) => Arc::new(socket),
			Err(err) => {
				warn!(target: "[SESSIONS]", "failed to bind session socket: {err}");
				return;
			}
		};
		let stop = ctx.token.child_token();
		let recv_stop = stop.clone();
		let recv_socket = socket.clone();
		let source_host = self.source_host.clone();
		let source_port = self.source_port;
		ctx.tasks.spawn(async move {
			let mut buf = vec![0u8; RECV_BUFFER_SIZE];
			loop {
				tokio::select! {
					_ = recv_stop.cancelled() => break,
					received = recv_socket.recv_from(&mut buf) => match received {
						Ok((len, _from)) => {
							let datagram = AppDatagram {
								source_host: source_host.clone(),
								source_port,
								payload: Bytes::copy_from_slice(&buf[..len]),
							};
							if replies.send(datagram).is_err() {
								break;
							}
						}
						Err(err) => {
							debug!(target: "[SESSIONS]", "session receive failed: {err}");
							break;
						}
					}
				}
			}
		});
		*inner = Some(Active { socket, stop });
	}

	async fn close(&self) {
		let mut inner = self.inner.lock().await;
		if let Some(active) = inner.take() {
			active.stop.cancel();
		}
	}
}
