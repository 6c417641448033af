//! End-to-end tests for the tunnel: a real host (router + front-end +
//! public endpoints), a real client, and real sockets on loopback.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use burrow_bridge::{
	ext::BridgeExt as _,
	inbound::{Connector, HttpFrontend, Resource, ResourceConfig, Router},
	outbound::{Tunnel, TunnelOpts},
	proto::{Frame, ReplyCode, ResourceKind},
	tls::TlsMode,
};
use burrow_core::{AppContext, Stream, listener::TcpEndpoint};
use burrow_test::{free_tcp_port, free_udp_port, swap_case, tcp_echo_app};
use parking_lot::Mutex;
use sha2::Digest as _;
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt, duplex},
	net::{TcpStream, UdpSocket},
	time::timeout,
};

fn digest(secret: &str, salt: &str) -> String {
	hex::encode(sha2::Sha256::digest(format!("{secret}{salt}")))
}

fn resource(ctx: &Arc<AppContext>, kind: ResourceKind, connector: Connector) -> Arc<Resource> {
	Resource::new(
		ResourceConfig {
			kind,
			connector,
			secret_digest: digest("pw", "s"),
			salt: "s".to_string(),
		},
		ctx.clone(),
	)
}

struct TestHost {
	router:        Arc<Router>,
	bridge_addr:   SocketAddr,
	frontend_addr: Option<SocketAddr>,
	// Endpoints stop when dropped mid-test otherwise.
	_bridge:       TcpEndpoint,
	_frontend:     Option<TcpEndpoint>,
}

async fn start_host(
	ctx: &Arc<AppContext>,
	resources: Vec<Arc<Resource>>,
	with_frontend: bool,
) -> eyre::Result<TestHost> {
	let router = Router::new(resources.clone());
	let bridge_router = router.clone();
	let bridge = TcpEndpoint::bind("127.0.0.1:0".parse()?, ctx, move |stream| {
		let router = bridge_router.clone();
		async move {
			router.handle(stream).await;
		}
	})
	.await?;

	let mut frontend_endpoint = None;
	if with_frontend {
		let frontend = HttpFrontend::new(resources);
		frontend_endpoint = Some(
			TcpEndpoint::bind("127.0.0.1:0".parse()?, ctx, move |stream| {
				let frontend = frontend.clone();
				async move {
					frontend.handle(stream).await;
				}
			})
			.await?,
		);
	}

	Ok(TestHost {
		router,
		bridge_addr: bridge.local_addr(),
		frontend_addr: frontend_endpoint.as_ref().map(TcpEndpoint::local_addr),
		_bridge: bridge,
		_frontend: frontend_endpoint,
	})
}

fn tunnel_opts(kind: ResourceKind, resource: String, bridge: SocketAddr, app: SocketAddr) -> TunnelOpts {
	TunnelOpts {
		server_host: "127.0.0.1".to_string(),
		server_port: bridge.port(),
		server_tls: TlsMode::Off,
		app_host: "127.0.0.1".to_string(),
		app_port: app.port(),
		app_tls: TlsMode::Off,
		kind,
		resource,
		secret: "pw".to_string(),
		admit_secret: String::new(),
		pool_count: 1,
	}
}

async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
	while !condition() {
		assert!(
			tokio::time::Instant::now() < deadline,
			"timed out waiting for {what}"
		);
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
}

async fn connect_retry(addr: (&str, u16)) -> eyre::Result<TcpStream> {
	let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
	loop {
		match TcpStream::connect(addr).await {
			Ok(stream) => return Ok(stream),
			Err(err) => {
				if tokio::time::Instant::now() >= deadline {
					return Err(err.into());
				}
				tokio::time::sleep(Duration::from_millis(50)).await;
			}
		}
	}
}

/// S1: external caller -> public port -> client -> local echo app -> back,
/// including EOF propagation.
#[test_log::test(tokio::test)]
async fn tcp_end_to_end_roundtrip() -> eyre::Result<()> {
	let ctx = Arc::new(AppContext::default());
	let public_port = free_tcp_port()?;
	let target = resource(&ctx, ResourceKind::Tcp, Connector::Port(public_port));
	let host = start_host(&ctx, vec![target.clone()], false).await?;

	let app_addr = tcp_echo_app().await?;
	let tunnel = Tunnel::new(
		tunnel_opts(ResourceKind::Tcp, public_port.to_string(), host.bridge_addr, app_addr),
		ctx.clone(),
	);
	tokio::spawn(tunnel.clone().run());

	wait_for(|| target.is_bound(), "the tunnel to bind").await;

	let mut caller = connect_retry(("127.0.0.1", public_port)).await?;
	caller.write_all(b"ABC").await?;
	let mut buf = [0u8; 3];
	timeout(Duration::from_secs(10), caller.read_exact(&mut buf)).await??;
	assert_eq!(&buf, b"abc");

	// Closing our write side reaches the app as EOF and collapses the
	// splice; we then observe EOF ourselves.
	caller.shutdown().await?;
	let len = timeout(Duration::from_secs(10), caller.read(&mut buf)).await??;
	assert_eq!(len, 0);
	Ok(())
}

/// S2: a second authenticate from the same peer IP evicts the first
/// binding and keeps the admit configuration.
#[test_log::test(tokio::test)]
async fn same_peer_rebind_takes_over() -> eyre::Result<()> {
	let ctx = Arc::new(AppContext::default());
	let public_port = free_tcp_port()?;
	let target = resource(&ctx, ResourceKind::Tcp, Connector::Port(public_port));
	let host = start_host(&ctx, vec![target.clone()], false).await?;

	let authenticate = Frame::Authenticate {
		kind:     ResourceKind::Tcp,
		resource: public_port.to_string(),
		secret:   "pw".to_string(),
		auth:     Some("code".to_string()),
	};

	let first = burrow_bridge::outbound::dial("127.0.0.1", host.bridge_addr.port(), TlsMode::Off).await?;
	first.send_frame(&authenticate).await?;
	let Some(Ok(Frame::Reply { code, .. })) = timeout(Duration::from_secs(5), first.read_frame()).await? else {
		panic!("expected a reply");
	};
	assert_eq!(code, ReplyCode::Ok);
	let first_session = target.session_id();

	let admitted: std::net::IpAddr = "203.0.113.7".parse()?;
	assert!(host.router.authorize(admitted, "tcp", &public_port.to_string(), "code"));

	let second = burrow_bridge::outbound::dial("127.0.0.1", host.bridge_addr.port(), TlsMode::Off).await?;
	second.send_frame(&authenticate).await?;
	let Some(Ok(Frame::Reply { code, .. })) = timeout(Duration::from_secs(5), second.read_frame()).await? else {
		panic!("expected a reply");
	};
	assert_eq!(code, ReplyCode::Ok);

	// The first control stream is gone.
	assert!(timeout(Duration::from_secs(5), first.read_frame()).await?.is_none());
	assert_ne!(target.session_id(), first_session);

	// The admit secret survived the take-over: a caller from a
	// non-admitted IP (us, on loopback) is dropped without a dial-back.
	let mut external = connect_retry(("127.0.0.1", public_port)).await?;
	let mut buf = [0u8; 1];
	let len = timeout(Duration::from_secs(10), external.read(&mut buf)).await??;
	assert_eq!(len, 0);
	Ok(())
}

/// S3: binds from a different peer IP are rejected without touching the
/// existing binding. Peer addresses are synthesized so the test does not
/// depend on multiple loopback aliases.
#[test_log::test(tokio::test)]
async fn different_peer_bind_is_rejected() -> eyre::Result<()> {
	let ctx = Arc::new(AppContext::default());
	let target = resource(&ctx, ResourceKind::Tcp, Connector::Port(0));
	let router = Router::new(vec![target.clone()]);

	let authenticate = Frame::Authenticate {
		kind:     ResourceKind::Tcp,
		resource: "0".to_string(),
		secret:   "pw".to_string(),
		auth:     None,
	};

	let (host_io, client_io) = duplex(16 * 1024);
	let first_host = Stream::new(host_io, Some("10.0.0.1:50000".parse()?));
	let first = Stream::new(client_io, None);
	let first_router = router.clone();
	tokio::spawn(async move {
		first_router.handle(first_host).await;
	});
	first.send_frame(&authenticate).await?;
	let Some(Ok(Frame::Reply { code, .. })) = timeout(Duration::from_secs(5), first.read_frame()).await? else {
		panic!("expected a reply");
	};
	assert_eq!(code, ReplyCode::Ok);

	let (host_io, client_io) = duplex(16 * 1024);
	let second_host = Stream::new(host_io, Some("10.0.0.2:50000".parse()?));
	let second = Stream::new(client_io, None);
	let second_router = router.clone();
	tokio::spawn(async move {
		second_router.handle(second_host).await;
	});
	second.send_frame(&authenticate).await?;
	let Some(Ok(Frame::Reply { code, .. })) = timeout(Duration::from_secs(5), second.read_frame()).await? else {
		panic!("expected a reply");
	};
	assert_eq!(code, ReplyCode::ResourceOccupied);
	assert!(timeout(Duration::from_secs(5), second.read_frame()).await?.is_none());

	// First binding is unaffected.
	assert!(target.is_bound());
	assert!(first.is_open());
	Ok(())
}

/// S4: a client that stops answering pings loses its binding after the
/// pong timeout, and the public listener stops with it.
#[tokio::test(start_paused = true)]
async fn ping_timeout_frees_the_resource() -> eyre::Result<()> {
	let ctx = Arc::new(AppContext::default());
	let target = resource(&ctx, ResourceKind::Tcp, Connector::Port(0));

	let (host_io, client_io) = duplex(64 * 1024);
	let host_stream = Stream::new(host_io, Some("10.0.0.1:50000".parse()?));
	let client = Stream::new(client_io, None);
	let bound = {
		let target = target.clone();
		tokio::spawn(async move {
			target.bind("pw", None, host_stream).await;
		})
	};

	let Some(Ok(Frame::Reply { code, .. })) = client.read_frame().await else {
		panic!("expected a reply");
	};
	assert_eq!(code, ReplyCode::Ok);
	assert!(target.endpoint_addr().await.is_some());

	// Never answer a ping; virtual time runs out the pong timeout.
	timeout(Duration::from_secs(300), bound).await??;
	assert!(!target.is_bound());
	assert!(target.endpoint_addr().await.is_none());

	// The client side drains the buffered pings and then sees EOF.
	loop {
		match client.read_frame().await {
			Some(Ok(Frame::Ping)) => continue,
			None => break,
			other => panic!("unexpected frame {other:?}"),
		}
	}
	Ok(())
}

/// S5: the front-end routes on the Host header and the peeked bytes reach
/// the right local app verbatim.
#[test_log::test(tokio::test)]
async fn http_virtual_host_routing() -> eyre::Result<()> {
	let ctx = Arc::new(AppContext::default());
	let resource_a = resource(&ctx, ResourceKind::Http, Connector::Host("a.example".to_string()));
	let resource_b = resource(&ctx, ResourceKind::Http, Connector::Host("b.example".to_string()));
	let host = start_host(&ctx, vec![resource_a.clone(), resource_b.clone()], true).await?;
	let frontend_addr = host.frontend_addr.unwrap();

	async fn recording_app() -> eyre::Result<(SocketAddr, Arc<Mutex<Vec<u8>>>)> {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
		let addr = listener.local_addr()?;
		let recorded = Arc::new(Mutex::new(Vec::new()));
		let sink = recorded.clone();
		tokio::spawn(async move {
			while let Ok((mut socket, _)) = listener.accept().await {
				let sink = sink.clone();
				tokio::spawn(async move {
					let mut buf = vec![0u8; 4096];
					while let Ok(len) = socket.read(&mut buf).await {
						if len == 0 {
							break;
						}
						sink.lock().extend_from_slice(&buf[..len]);
					}
				});
			}
		});
		Ok((addr, recorded))
	}

	let (app_a, recorded_a) = recording_app().await?;
	let (app_b, recorded_b) = recording_app().await?;

	let tunnel_a = Tunnel::new(
		tunnel_opts(ResourceKind::Http, "a.example".to_string(), host.bridge_addr, app_a),
		ctx.clone(),
	);
	let tunnel_b = Tunnel::new(
		tunnel_opts(ResourceKind::Http, "b.example".to_string(), host.bridge_addr, app_b),
		ctx.clone(),
	);
	tokio::spawn(tunnel_a.clone().run());
	tokio::spawn(tunnel_b.clone().run());
	wait_for(|| resource_a.is_bound() && resource_b.is_bound(), "both tunnels to bind").await;

	let request = b"GET /hello HTTP/1.1\r\nHost: b.example\r\nX-Probe: 1\r\n\r\n";
	let mut caller = TcpStream::connect(frontend_addr).await?;
	caller.write_all(request).await?;

	wait_for(|| recorded_b.lock().len() >= request.len(), "the request to reach app b").await;
	assert_eq!(recorded_b.lock().as_slice(), request);
	assert!(recorded_a.lock().is_empty());

	// Unknown virtual hosts get the fixed error page.
	let mut stranger = TcpStream::connect(frontend_addr).await?;
	stranger
		.write_all(b"GET / HTTP/1.1\r\nHost: c.example\r\n\r\n")
		.await?;
	let mut response = Vec::new();
	timeout(Duration::from_secs(10), stranger.read_to_end(&mut response)).await??;
	let response = String::from_utf8_lossy(&response);
	assert!(response.starts_with("HTTP/1.1 200 OK"));
	assert!(response.contains("Invalid host"));
	Ok(())
}

/// S6: datagrams from two sources flow through the pool to the app and
/// back, each source keeping a stable ephemeral port towards the app.
#[test_log::test(tokio::test)]
async fn udp_pool_and_sessions_roundtrip() -> eyre::Result<()> {
	let ctx = Arc::new(AppContext::default());
	let public_port = free_udp_port()?;
	let target = resource(&ctx, ResourceKind::Udp, Connector::Port(public_port));
	let host = start_host(&ctx, vec![target.clone()], false).await?;

	// Recording UDP app: remembers which peer port sent each payload and
	// replies with the case-swapped payload.
	let app = UdpSocket::bind("127.0.0.1:0").await?;
	let app_addr = app.local_addr()?;
	let seen: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>> = Arc::new(Mutex::new(Vec::new()));
	{
		let seen = seen.clone();
		tokio::spawn(async move {
			let mut buf = vec![0u8; 2048];
			while let Ok((len, peer)) = app.recv_from(&mut buf).await {
				seen.lock().push((buf[..len].to_vec(), peer));
				let _ = app.send_to(&swap_case(&buf[..len]), peer).await;
			}
		});
	}

	// pool_count 3 tops the pool up to two installed members.
	let mut opts = tunnel_opts(ResourceKind::Udp, public_port.to_string(), host.bridge_addr, app_addr);
	opts.pool_count = 3;
	let tunnel = Tunnel::new(opts, ctx.clone());
	tokio::spawn(tunnel.clone().run());

	wait_for(|| target.is_bound(), "the tunnel to bind").await;
	wait_for(|| target.pool_len() >= 2, "the pool to fill").await;

	let source_a = UdpSocket::bind("127.0.0.1:0").await?;
	let source_b = UdpSocket::bind("127.0.0.1:0").await?;
	let public = ("127.0.0.1", public_port);
	for round in 1..=4u8 {
		source_a.send_to(format!("SrcA-{round}").as_bytes(), public).await?;
		source_b.send_to(format!("SrcB-{round}").as_bytes(), public).await?;
	}

	// Every datagram reaches the app and every reply reaches the right
	// source, case-swapped.
	let mut replies_a = Vec::new();
	let mut buf = [0u8; 2048];
	while replies_a.len() < 4 {
		let (len, _) = timeout(Duration::from_secs(20), source_a.recv_from(&mut buf)).await??;
		replies_a.push(String::from_utf8_lossy(&buf[..len]).to_string());
	}
	let mut replies_b = Vec::new();
	while replies_b.len() < 4 {
		let (len, _) = timeout(Duration::from_secs(20), source_b.recv_from(&mut buf)).await??;
		replies_b.push(String::from_utf8_lossy(&buf[..len]).to_string());
	}
	replies_a.sort();
	replies_b.sort();
	assert_eq!(replies_a, vec!["sRCa-1", "sRCa-2", "sRCa-3", "sRCa-4"]);
	assert_eq!(replies_b, vec!["sRCb-1", "sRCb-2", "sRCb-3", "sRCb-4"]);

	// Each source kept one stable ephemeral port towards the app.
	let seen = seen.lock();
	assert_eq!(seen.len(), 8);
	let ports_a: std::collections::HashSet<u16> = seen
		.iter()
		.filter(|(payload, _)| payload.starts_with(b"SrcA"))
		.map(|(_, peer)| peer.port())
		.collect();
	let ports_b: std::collections::HashSet<u16> = seen
		.iter()
		.filter(|(payload, _)| payload.starts_with(b"SrcB"))
		.map(|(_, peer)| peer.port())
		.collect();
	assert_eq!(ports_a.len(), 1);
	assert_eq!(ports_b.len(), 1);
	assert_ne!(ports_a, ports_b);
	Ok(())
}

/// Authentication failure is terminal for the client: no retry loop.
#[test_log::test(tokio::test)]
async fn wrong_secret_is_fatal_for_the_client() -> eyre::Result<()> {
	let ctx = Arc::new(AppContext::default());
	let public_port = free_tcp_port()?;
	let target = resource(&ctx, ResourceKind::Tcp, Connector::Port(public_port));
	let host = start_host(&ctx, vec![target.clone()], false).await?;

	let mut opts = tunnel_opts(ResourceKind::Tcp, public_port.to_string(), host.bridge_addr, host.bridge_addr);
	opts.secret = "wrong".to_string();
	let tunnel = Tunnel::new(opts, ctx.clone());

	let outcome = timeout(Duration::from_secs(10), tunnel.clone().run()).await?;
	let err = outcome.expect_err("a rejected tunnel must not keep running");
	assert!(err.is_fatal());
	assert!(!target.is_bound());
	Ok(())
}
