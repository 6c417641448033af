use std::{net::SocketAddr, sync::Arc, time::Duration};

use burrow_bridge::inbound::Router;
use burrow_core::{
	AppContext, Stream,
	http::{HEADER_TERMINATORS, json_response, parse_headers, request_line},
	listener::TcpEndpoint,
	net::{Headers, caller_ip},
};
use bytes::Bytes;
use serde_json::{Value, json};
use tracing::info;

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BODY: usize = 64 * 1024;

/// The authorization endpoint: external users POST a resource code to
/// `/api/auth-resource` and, when it matches the admit secret the client
/// registered, their IP is added to the resource's admit list.
pub async fn serve(port: u16, router: Arc<Router>, ctx: &AppContext) -> eyre::Result<TcpEndpoint> {
	let addr = SocketAddr::from(([0, 0, 0, 0], port));
	let endpoint = TcpEndpoint::bind(addr, ctx, move |stream| {
		let router = router.clone();
		async move {
			handle(stream, router).await;
		}
	})
	.await?;
	info!(target: "[WEB]", "authorization endpoint on {}", endpoint.local_addr());
	Ok(endpoint)
}

async fn handle(stream: Arc<Stream>, router: Arc<Router>) {
	let Some((head, _delim)) = stream.read_until_any(HEADER_TERMINATORS).await else {
		stream.close();
		return;
	};
	let headers = parse_headers(&head);
	let Some((method, path)) = request_line(&head) else {
		stream.close();
		return;
	};
	if method != "POST" || path != "/api/auth-resource" {
		stream.write(Bytes::from_static(
			b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
		));
		let _ = stream.flush().await;
		stream.close();
		return;
	}

	let status = authorize(&stream, &headers, &router).await;
	let body = json!({ "statusMessage": status }).to_string();
	stream.write(json_response(&body).into_bytes());
	let _ = stream.flush().await;
	stream.close();
}

async fn authorize(stream: &Arc<Stream>, headers: &Headers, router: &Arc<Router>) -> &'static str {
	let Some(length) = headers.get("content-length").and_then(|value| value.parse::<usize>().ok()) else {
		return "Failed to read data";
	};
	if length > MAX_BODY {
		return "Failed to read data";
	}
	let mut body = Vec::with_capacity(length);
	while body.len() < length {
		let chunk = stream.read(length - body.len()).await;
		if chunk.is_empty() {
			return "Failed to read data";
		}
		body.extend_from_slice(&chunk);
	}
	body.truncate(length);

	let Ok(data) = serde_json::from_slice::<Value>(&body) else {
		return "Failed to read data";
	};

	// Reachable but with nothing to authorize against.
	if router.resources().is_empty() {
		return "Auth not configured";
	}
	let Some(ip) = caller_ip(headers, stream.peer_ip()) else {
		return "Invalid IP";
	};
	let Some(object) = data.as_object() else {
		return "Invalid data";
	};
	let (Some(resource_type), Some(resource_item), Some(resource_code)) = (
		object.get("resourceType").and_then(Value::as_str),
		object.get("resourceItem").and_then(Value::as_str),
		object.get("resourceCode").and_then(Value::as_str),
	) else {
		return "Invalid message";
	};

	// The decision runs on its own task so a wedged or panicking resource
	// surfaces as a status instead of tearing the endpoint down.
	let decision = {
		let router = router.clone();
		let resource_type = resource_type.to_string();
		let resource_item = resource_item.to_string();
		let resource_code = resource_code.to_string();
		tokio::time::timeout(
			AUTH_TIMEOUT,
			tokio::spawn(async move { router.authorize(ip, &resource_type, &resource_item, &resource_code) }),
		)
		.await
	};
	match decision {
		Ok(Ok(true)) => "Access provided",
		Ok(Ok(false)) => "Access blocked",
		Ok(Err(_)) => "Auth error",
		Err(_) => "Auth timeout",
	}
}
