//! Shared infrastructure for integration tests: local echo applications
//! that stand in for the app a tunnel client exposes, plus port helpers.
//!
//! The echo servers swap ASCII case instead of echoing verbatim, so a test
//! can tell a real round trip from a short-circuited one.

use std::net::SocketAddr;

use tokio::{
	io::{AsyncReadExt, AsyncWriteExt},
	net::{TcpListener, UdpSocket},
};

/// Maps `ABC` to `abc` and back; non-ASCII bytes pass through.
pub fn swap_case(data: &[u8]) -> Vec<u8> {
	data.iter()
		.map(|byte| {
			if byte.is_ascii_alphabetic() {
				byte ^ 0x20
			} else {
				*byte
			}
		})
		.collect()
}

/// Starts a TCP app that answers every read with the case-swapped bytes.
/// Returns the address it listens on; the accept loop runs until the
/// runtime is dropped.
pub async fn tcp_echo_app() -> eyre::Result<SocketAddr> {
	let listener = TcpListener::bind("127.0.0.1:0").await?;
	let addr = listener.local_addr()?;
	tokio::spawn(async move {
		while let Ok((mut socket, _)) = listener.accept().await {
			tokio::spawn(async move {
				let mut buf = vec![0u8; 4096];
				while let Ok(len) = socket.read(&mut buf).await {
					if len == 0 {
						break;
					}
					if socket.write_all(&swap_case(&buf[..len])).await.is_err() {
						break;
					}
				}
			});
		}
	});
	Ok(addr)
}

/// Starts a UDP app that answers every datagram with the case-swapped
/// payload.
pub async fn udp_echo_app() -> eyre::Result<SocketAddr> {
	let socket = UdpSocket::bind("127.0.0.1:0").await?;
	let addr = socket.local_addr()?;
	tokio::spawn(async move {
		let mut buf = vec![0u8; 64 * 1024];
		while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
			let _ = socket.send_to(&swap_case(&buf[..len]), peer).await;
		}
	});
	Ok(addr)
}

/// Picks a currently-free TCP port by binding port 0 and dropping the
/// socket. Racy by nature; good enough for tests that need to configure a
/// fixed port up front.
pub fn free_tcp_port() -> eyre::Result<u16> {
	let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
	Ok(listener.local_addr()?.port())
}

/// UDP flavour of [`free_tcp_port`].
pub fn free_udp_port() -> eyre::Result<u16> {
	let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
	Ok(socket.local_addr()?.port())
}
