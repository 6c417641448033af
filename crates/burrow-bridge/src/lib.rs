use std::time::Duration;

pub mod ext;
pub mod proto;
pub mod tls;

#[cfg(feature = "server")]
pub mod inbound;

#[cfg(feature = "client")]
pub mod outbound;

/// Upper bound on installed UDP pool members per resource.
pub const MAX_POOLS: usize = 5;

/// Host -> client keep-alive cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// A binding with no inbound frames for this long is dropped.
pub const PING_TIMEOUT: Duration = Duration::from_secs(60);

/// How long an admitted external caller waits for the client's dial-back.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Retries (after the first attempt) when a datagram finds the pool empty.
pub const POOL_RETRIES: usize = 3;
pub const POOL_RETRY_DELAY: Duration = Duration::from_secs(3);
