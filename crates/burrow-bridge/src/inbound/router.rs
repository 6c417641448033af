use std::{net::IpAddr, sync::Arc};

use burrow_core::Stream;
use tracing::debug;

use super::resource::Resource;
use crate::{
	ext::BridgeExt,
	proto::{Frame, ResourceKind},
};

/// Dispatches fresh bridge connections: one frame is read, then the
/// connection belongs to the resource it names. `authenticate` becomes a
/// binding; `bind` is a dial-back (tcp/http) or a pool-member install
/// (udp). Anything else is a protocol violation and the connection closes.
pub struct Router {
	resources: Vec<Arc<Resource>>,
}

impl Router {
	pub fn new(resources: Vec<Arc<Resource>>) -> Arc<Self> {
		Arc::new(Self { resources })
	}

	pub fn resources(&self) -> &[Arc<Resource>] {
		&self.resources
	}

	pub fn find(&self, kind: ResourceKind, resource: &str) -> Option<Arc<Resource>> {
		self.resources
			.iter()
			.find(|candidate| candidate.matches(kind, resource))
			.cloned()
	}

	pub async fn handle(&self, stream: Arc<Stream>) {
		let Some(Ok(frame)) = stream.read_frame().await else {
			stream.close();
			return;
		};
		match frame {
			Frame::Authenticate {
				kind,
				resource,
				secret,
				auth,
			} => match self.find(kind, &resource) {
				Some(target) => target.bind(&secret, auth, stream).await,
				None => {
					debug!(target: "[ROUTER]", "authenticate for unknown resource {kind} {resource}");
					stream.close();
				}
			},
			Frame::Bind {
				kind,
				resource,
				identifier,
			} => match self.find(kind, &resource) {
				Some(target) if kind == ResourceKind::Udp => target.install_pool(&identifier, stream).await,
				Some(target) => target.dial_back(&identifier, stream).await,
				None => {
					debug!(target: "[ROUTER]", "bind for unknown resource {kind} {resource}");
					stream.close();
				}
			},
			other => {
				debug!(target: "[ROUTER]", "unexpected first frame: {other:?}");
				stream.close();
			}
		}
	}

	/// Authorization side-channel: resolves `(resource_type, resource_item)`
	/// and admits `ip` when the resource code matches.
	pub fn authorize(&self, ip: IpAddr, resource_type: &str, resource_item: &str, resource_code: &str) -> bool {
		let Ok(kind) = resource_type.parse::<ResourceKind>() else {
			return false;
		};
		match self.find(kind, resource_item) {
			Some(resource) => resource.authorize(ip, resource_code),
			None => false,
		}
	}
}
