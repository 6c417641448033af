use burrow_core::Stream;

use crate::proto::{FRAME_TERMINATOR, Frame, ProtoError};

/// Frame-level view of a [`Stream`].
pub trait BridgeExt {
	/// Queues one frame and waits until it reached the kernel.
	fn send_frame(&self, frame: &Frame) -> impl Future<Output = Result<(), burrow_core::Error>> + Send;

	/// Reads the next frame off the wire. `None` means the peer is gone
	/// (EOF, close, or an empty frame); `Some(Err(..))` is a decodable
	/// protocol violation the caller decides how to punish.
	fn read_frame(&self) -> impl Future<Output = Option<Result<Frame, ProtoError>>> + Send;
}

impl BridgeExt for Stream {
	async fn send_frame(&self, frame: &Frame) -> Result<(), burrow_core::Error> {
		self.write(frame.framed());
		self.flush().await
	}

	async fn read_frame(&self) -> Option<Result<Frame, ProtoError>> {
		let buf = self.read_until(FRAME_TERMINATOR).await?;
		if buf.is_empty() {
			return None;
		}
		Some(Frame::decode(&buf))
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::duplex;

	use super::*;

	#[tokio::test]
	async fn frames_survive_the_wire() -> eyre::Result<()> {
		let (left, right) = duplex(1024);
		let a = Stream::new(left, None);
		let b = Stream::new(right, None);

		a.send_frame(&Frame::Ping).await?;
		a.send_frame(&Frame::NewRequest {
			identifier: "id.1".to_string(),
		})
		.await?;

		assert_eq!(b.read_frame().await.unwrap()?, Frame::Ping);
		assert_eq!(
			b.read_frame().await.unwrap()?,
			Frame::NewRequest {
				identifier: "id.1".to_string()
			}
		);

		a.close();
		assert!(b.read_frame().await.is_none());
		Ok(())
	}

	#[tokio::test]
	async fn garbage_between_terminators_is_an_error_not_a_hang() -> eyre::Result<()> {
		let (left, right) = duplex(1024);
		let a = Stream::new(left, None);
		let b = Stream::new(right, None);

		a.write(bytes::Bytes::from_static(b"!!!not-base64!!!;"));
		a.flush().await?;

		assert!(b.read_frame().await.unwrap().is_err());
		Ok(())
	}
}
