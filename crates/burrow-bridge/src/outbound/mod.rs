//! Client side of the bridge: the tunnel session loop and the per-source
//! UDP session tracker.

mod sessions;
mod tunnel;

pub use sessions::{AppDatagram, SESSION_ROTATION, UdpSession, UdpSessions};
pub use tunnel::{Tunnel, TunnelError, TunnelOpts, WATCHDOG_TIMEOUT, dial};
