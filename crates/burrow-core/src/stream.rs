use std::{
	net::{IpAddr, SocketAddr},
	sync::Arc,
};

use bytes::{Bytes, BytesMut};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::{
	io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf},
	sync::{Mutex, mpsc, oneshot},
};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::trace;

use crate::{Error, IoSnafu, StreamClosedSnafu, Transport};

enum WriteOp {
	Data(Bytes),
	Flush(oneshot::Sender<std::io::Result<()>>),
}

/// Buffered bidirectional byte stream.
///
/// Reads go through an owned read-ahead buffer so peeked bytes can be pushed
/// back (the HTTP front-end relies on this). Writes are appended to an
/// unbounded queue drained by a single writer task, so concurrent writers
/// never interleave their bytes mid-frame; `flush` resolves once the queue
/// up to that point has been handed to the kernel.
///
/// Closing is idempotent and doubles as the cancellation primitive: every
/// pending read or flush returns promptly once `close` is called.
pub struct Stream {
	read:     Mutex<ReadState>,
	write_tx: mpsc::UnboundedSender<WriteOp>,
	peer:     Option<SocketAddr>,
	closed:   CancellationToken,
}

struct ReadState {
	io:     ReadHalf<Box<dyn Transport>>,
	buffer: BytesMut,
	eof:    bool,
}

impl Stream {
	pub fn new(io: impl Transport + 'static, peer: Option<SocketAddr>) -> Arc<Self> {
		Self::build(io, peer, CancellationToken::new())
	}

	/// A stream whose lifetime is capped by `parent`: cancelling the parent
	/// (process shutdown) closes the stream. Listeners create accepted
	/// streams this way so shutdown unblocks every connection handler.
	pub fn with_shutdown(io: impl Transport + 'static, peer: Option<SocketAddr>, parent: &CancellationToken) -> Arc<Self> {
		Self::build(io, peer, parent.child_token())
	}

	fn build(io: impl Transport + 'static, peer: Option<SocketAddr>, closed: CancellationToken) -> Arc<Self> {
		let boxed: Box<dyn Transport> = Box::new(io);
		let (read_half, write_half) = tokio::io::split(boxed);
		let (write_tx, write_rx) = mpsc::unbounded_channel();
		tokio::spawn(write_worker(write_half, write_rx, closed.clone()));
		Arc::new(Self {
			read: Mutex::new(ReadState {
				io:     read_half,
				buffer: BytesMut::new(),
				eof:    false,
			}),
			write_tx,
			peer,
			closed,
		})
	}

	/// Reads up to (and consuming, but not returning) the next `delim` byte.
	/// Returns `None` on EOF or close, even if partial data was buffered.
	pub async fn read_until(&self, delim: u8) -> Option<Bytes> {
		let mut state = self.read.lock().await;
		loop {
			if let Some(pos) = state.buffer.iter().position(|b| *b == delim) {
				let mut head = state.buffer.split_to(pos + 1);
				head.truncate(pos);
				return Some(head.freeze());
			}
			if !self.fill(&mut state).await {
				return None;
			}
		}
	}

	/// Like [`read_until`](Self::read_until) but for multi-byte delimiters;
	/// the earliest match in the buffer wins. Returns the bytes before the
	/// delimiter together with the delimiter that matched.
	pub async fn read_until_any(&self, delims: &[&'static [u8]]) -> Option<(Bytes, &'static [u8])> {
		let mut state = self.read.lock().await;
		loop {
			let found = delims
				.iter()
				.filter_map(|delim| find(&state.buffer, delim).map(|pos| (pos, *delim)))
				.min_by_key(|(pos, _)| *pos);
			if let Some((pos, delim)) = found {
				let mut head = state.buffer.split_to(pos + delim.len());
				head.truncate(pos);
				return Some((head.freeze(), delim));
			}
			if !self.fill(&mut state).await {
				return None;
			}
		}
	}

	/// Returns whatever is buffered, else up to `max` freshly read bytes.
	/// Empty on EOF or close.
	pub async fn read(&self, max: usize) -> Bytes {
		let mut state = self.read.lock().await;
		if !state.buffer.is_empty() {
			let len = state.buffer.len();
			return state.buffer.split_to(len).freeze();
		}
		if max == 0 || state.eof || self.closed.is_cancelled() {
			return Bytes::new();
		}
		let mut buf = vec![0u8; max];
		tokio::select! {
			res = state.io.read(&mut buf) => match res {
				Ok(0) => {
					state.eof = true;
					Bytes::new()
				}
				Ok(n) => {
					buf.truncate(n);
					Bytes::from(buf)
				}
				Err(err) => {
					trace!("stream read failed: {err}");
					state.eof = true;
					Bytes::new()
				}
			},
			_ = self.closed.cancelled() => Bytes::new(),
		}
	}

	/// Prepends bytes to the read-ahead buffer.
	pub async fn push_back(&self, data: impl Into<Bytes>) {
		let data = data.into();
		let mut state = self.read.lock().await;
		let mut rebuilt = BytesMut::with_capacity(data.len() + state.buffer.len());
		rebuilt.extend_from_slice(&data);
		rebuilt.extend_from_slice(&state.buffer);
		state.buffer = rebuilt;
	}

	/// Appends to the output queue. Never blocks; silently dropped once the
	/// stream is closed.
	pub fn write(&self, data: impl Into<Bytes>) {
		if self.closed.is_cancelled() {
			return;
		}
		let _ = self.write_tx.send(WriteOp::Data(data.into()));
	}

	/// Waits until everything written so far has been handed to the kernel.
	pub async fn flush(&self) -> Result<(), Error> {
		ensure!(!self.closed.is_cancelled(), StreamClosedSnafu);
		let (ack_tx, ack_rx) = oneshot::channel();
		self.write_tx
			.send(WriteOp::Flush(ack_tx))
			.ok()
			.context(StreamClosedSnafu)?;
		match ack_rx.await {
			Ok(res) => res.context(IoSnafu),
			Err(_) => StreamClosedSnafu.fail(),
		}
	}

	pub fn close(&self) {
		self.closed.cancel();
	}

	pub fn is_open(&self) -> bool {
		!self.closed.is_cancelled()
	}

	/// Resolves once the stream is closed; usable inside `select!`.
	pub fn closed(&self) -> WaitForCancellationFuture<'_> {
		self.closed.cancelled()
	}

	pub fn peer_addr(&self) -> Option<SocketAddr> {
		self.peer
	}

	pub fn peer_ip(&self) -> Option<IpAddr> {
		self.peer.map(|peer| peer.ip())
	}

	/// Pulls more bytes into the read buffer. False on EOF, error or close.
	async fn fill(&self, state: &mut ReadState) -> bool {
		if state.eof || self.closed.is_cancelled() {
			return false;
		}
		tokio::select! {
			res = state.io.read_buf(&mut state.buffer) => match res {
				Ok(0) => {
					state.eof = true;
					false
				}
				Ok(_) => true,
				Err(err) => {
					trace!("stream read failed: {err}");
					state.eof = true;
					false
				}
			},
			_ = self.closed.cancelled() => false,
		}
	}
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	if needle.is_empty() || haystack.len() < needle.len() {
		return None;
	}
	haystack.windows(needle.len()).position(|window| window == needle)
}

async fn write_worker(
	mut io: WriteHalf<Box<dyn Transport>>,
	mut rx: mpsc::UnboundedReceiver<WriteOp>,
	closed: CancellationToken,
) {
	loop {
		let op = tokio::select! {
			op = rx.recv() => op,
			_ = closed.cancelled() => None,
		};
		let Some(op) = op else { break };
		match op {
			WriteOp::Data(data) => {
				let res = tokio::select! {
					res = io.write_all(&data) => res,
					_ = closed.cancelled() => Err(std::io::Error::other("stream closed")),
				};
				if let Err(err) = res {
					trace!("stream write failed: {err}");
					closed.cancel();
					break;
				}
			}
			WriteOp::Flush(ack) => {
				let res = tokio::select! {
					res = io.flush() => res,
					_ = closed.cancelled() => Err(std::io::Error::other("stream closed")),
				};
				let failed = res.is_err();
				let _ = ack.send(res);
				if failed {
					closed.cancel();
					break;
				}
			}
		}
	}
	let _ = io.shutdown().await;
}
