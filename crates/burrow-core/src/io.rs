use std::sync::Arc;

use crate::stream::Stream;

const BUFFER_SIZE: usize = 16 * 1024;

/// Splices two streams: bytes flow both ways until either side reaches EOF
/// or errors, at which point both streams are closed. Returns the byte
/// counts relayed in each direction.
pub async fn splice(a: Arc<Stream>, b: Arc<Stream>) -> (u64, u64) {
	let a_to_b = relay(a.clone(), b.clone());
	let b_to_a = relay(b, a);
	tokio::join!(a_to_b, b_to_a)
}

async fn relay(from: Arc<Stream>, to: Arc<Stream>) -> u64 {
	let mut relayed = 0u64;
	loop {
		let data = from.read(BUFFER_SIZE).await;
		if data.is_empty() {
			break;
		}
		relayed += data.len() as u64;
		to.write(data);
		if to.flush().await.is_err() {
			break;
		}
	}
	from.close();
	to.close();
	relayed
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

	use super::*;

	#[tokio::test]
	async fn splice_relays_both_directions_and_propagates_eof() -> eyre::Result<()> {
		let (left, mut left_peer) = duplex(256);
		let (right, mut right_peer) = duplex(256);
		let a = Stream::new(left, None);
		let b = Stream::new(right, None);

		let spliced = tokio::spawn(splice(a, b));

		left_peer.write_all(b"payload going right").await?;
		let mut buf = vec![0u8; 19];
		right_peer.read_exact(&mut buf).await?;
		assert_eq!(&buf, b"payload going right");

		right_peer.write_all(b"and back").await?;
		let mut buf = vec![0u8; 8];
		left_peer.read_exact(&mut buf).await?;
		assert_eq!(&buf, b"and back");

		// EOF on one leg terminates both halves.
		drop(left_peer);
		let (_, _) = spliced.await?;
		let mut rest = Vec::new();
		right_peer.read_to_end(&mut rest).await?;
		Ok(())
	}

	#[tokio::test]
	async fn splice_preserves_byte_order_for_large_transfers() -> eyre::Result<()> {
		let (left, mut left_peer) = duplex(1024);
		let (right, mut right_peer) = duplex(1024);
		let spliced = tokio::spawn(splice(Stream::new(left, None), Stream::new(right, None)));

		let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
		let expect = payload.clone();
		let writer = tokio::spawn(async move {
			left_peer.write_all(&payload).await.unwrap();
			drop(left_peer);
		});

		let mut received = Vec::new();
		right_peer.read_to_end(&mut received).await?;
		assert_eq!(received, expect);

		writer.await?;
		spliced.await?;
		Ok(())
	}
}
