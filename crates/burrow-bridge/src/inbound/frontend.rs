use std::sync::Arc;

use burrow_core::{
	Stream,
	http::{HEADER_TERMINATORS, html_response, parse_headers},
};
use bytes::BytesMut;
use tracing::debug;

use super::resource::Resource;
use crate::proto::ResourceKind;

/// The shared HTTP entry point: peeks the request head, routes on the
/// `Host` header, pushes every peeked byte back, then hands the socket to
/// the matching resource's admit path. The tunnel is byte-transparent
/// beyond this peek.
pub struct HttpFrontend {
	resources: Vec<Arc<Resource>>,
}

impl HttpFrontend {
	pub fn new(resources: Vec<Arc<Resource>>) -> Arc<Self> {
		Arc::new(Self { resources })
	}

	pub async fn handle(&self, stream: Arc<Stream>) {
		let Some((head, delim)) = stream.read_until_any(HEADER_TERMINATORS).await else {
			stream.close();
			return;
		};
		let headers = parse_headers(&head);

		let mut captured = BytesMut::with_capacity(head.len() + delim.len());
		captured.extend_from_slice(&head);
		captured.extend_from_slice(delim);
		stream.push_back(captured.freeze()).await;

		let Some(host) = headers.get("host").cloned() else {
			debug!(target: "[HTTP]", "request without a Host header");
			stream.close();
			return;
		};

		let resource = self
			.resources
			.iter()
			.find(|candidate| candidate.matches(ResourceKind::Http, &host))
			.cloned();
		match resource {
			Some(resource) => resource.admit_external(stream, Some(&headers)).await,
			None => {
				let body = format!("<h1>Invalid host</h1><p>The host {host} is invalid</p>");
				stream.write(html_response(&body).into_bytes());
				let _ = stream.flush().await;
				stream.close();
			}
		}
	}
}
