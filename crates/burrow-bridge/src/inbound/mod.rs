//! Host side of the bridge: the per-resource state machine, the protocol
//! router for fresh bridge connections, and the HTTP host-routing
//! front-end.

mod frontend;
mod resource;
mod router;

pub use frontend::HttpFrontend;
pub use resource::{Connector, Resource, ResourceConfig};
pub use router::Router;
