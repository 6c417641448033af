use std::net::SocketAddr;

use snafu::Snafu;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod ctx;
pub mod http;
pub mod io;
pub mod listener;
pub mod net;
pub mod registry;
pub mod stream;

pub use ctx::AppContext;
pub use registry::Registry;
pub use stream::Stream;

/// Anything a [`Stream`] can sit on top of: a plain TCP socket, a TLS
/// session, or an in-memory pipe in tests.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
	#[snafu(display("failed to bind {addr}"))]
	Bind {
		addr:   SocketAddr,
		source: std::io::Error,
	},
	#[snafu(display("stream is closed"))]
	StreamClosed,
	Io {
		source: std::io::Error,
	},
}
