use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use snafu::ResultExt;
use tokio::net::{TcpListener, ToSocketAddrs, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AppContext, BindSnafu, Error, IoSnafu, stream::Stream};

const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// TCP accept loop. Each accepted connection is wrapped in a [`Stream`] and
/// handed to the handler on its own task. `stop` is graceful: no further
/// accepts, already-running handlers finish on their own.
pub struct TcpEndpoint {
	local_addr: SocketAddr,
	cancel:     CancellationToken,
}

impl TcpEndpoint {
	pub async fn bind<F, Fut>(addr: SocketAddr, ctx: &AppContext, on_stream: F) -> Result<Self, Error>
	where
		F: Fn(Arc<Stream>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let listener = TcpListener::bind(addr).await.context(BindSnafu { addr })?;
		let local_addr = listener.local_addr().context(IoSnafu)?;
		let cancel = ctx.token.child_token();
		let loop_cancel = cancel.clone();
		// Accepted streams hang off the root token, not this endpoint's:
		// stopping the endpoint is graceful and leaves live connections
		// alone, while process shutdown closes everything.
		let shutdown = ctx.token.clone();
		let tasks = ctx.tasks.clone();
		ctx.tasks.spawn(async move {
			loop {
				tokio::select! {
					_ = loop_cancel.cancelled() => break,
					accepted = listener.accept() => match accepted {
						Ok((socket, peer)) => {
							let stream = Stream::with_shutdown(socket, Some(peer), &shutdown);
							tasks.spawn(on_stream(stream));
						}
						Err(err) => {
							warn!(target: "[LISTEN]", "accept on {local_addr} failed: {err}");
							tokio::time::sleep(Duration::from_millis(100)).await;
						}
					}
				}
			}
			debug!(target: "[LISTEN]", "tcp endpoint {local_addr} stopped");
		});
		Ok(Self { local_addr, cancel })
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	pub fn stop(&self) {
		self.cancel.cancel();
	}
}

/// Datagram endpoint: delivers `(payload, source)` pairs to the handler and
/// exposes cloneable [`UdpSender`] handles for replies.
pub struct UdpEndpoint {
	socket:     Arc<UdpSocket>,
	local_addr: SocketAddr,
	cancel:     CancellationToken,
}

#[derive(Clone)]
pub struct UdpSender {
	socket: Arc<UdpSocket>,
}

impl UdpSender {
	pub async fn send(&self, addr: impl ToSocketAddrs, payload: &[u8]) -> Result<(), Error> {
		self.socket.send_to(payload, addr).await.context(IoSnafu)?;
		Ok(())
	}
}

impl UdpEndpoint {
	pub async fn bind<F, Fut>(addr: SocketAddr, ctx: &AppContext, on_datagram: F) -> Result<Self, Error>
	where
		F: Fn(Bytes, SocketAddr) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let socket = Arc::new(UdpSocket::bind(addr).await.context(BindSnafu { addr })?);
		let local_addr = socket.local_addr().context(IoSnafu)?;
		let cancel = ctx.token.child_token();
		let loop_cancel = cancel.clone();
		let loop_socket = socket.clone();
		let tasks = ctx.tasks.clone();
		ctx.tasks.spawn(async move {
			let mut buf = vec![0u8; RECV_BUFFER_SIZE];
			loop {
				tokio::select! {
					_ = loop_cancel.cancelled() => break,
					received = loop_socket.recv_from(&mut buf) => match received {
						Ok((len, source)) => {
							let payload = Bytes::copy_from_slice(&buf[..len]);
							tasks.spawn(on_datagram(payload, source));
						}
						Err(err) => {
							warn!(target: "[LISTEN]", "recv on {local_addr} failed: {err}");
							tokio::time::sleep(Duration::from_millis(100)).await;
						}
					}
				}
			}
			debug!(target: "[LISTEN]", "udp endpoint {local_addr} stopped");
		});
		Ok(Self {
			socket,
			local_addr,
			cancel,
		})
	}

	pub fn sender(&self) -> UdpSender {
		UdpSender {
			socket: self.socket.clone(),
		}
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	pub fn stop(&self) {
		self.cancel.cancel();
	}
}
