// Downstream response adapter. Output is buffered up to a safety cap and
// force-switched to streaming as soon as a chunk looks like SSE, whatever
// the declared Content-Type says. Once streaming, every write is flushed
// straight into the body channel.

use bytes::Bytes;
use tokio::sync::mpsc;

const MAX_BUFFERED_RESPONSE_BYTES: usize = 2 * 1024 * 1024;

pub fn looks_like_sse_chunk(data: &[u8]) -> bool {
    const MARKERS: &[&[u8]] = &[
        b"data:",
        b"event:",
        b"message_start",
        b"message_delta",
        b"content_block_start",
        b"content_block_delta",
        b"content_block_stop",
        b"\n\n",
    ];
    MARKERS.iter().any(|marker| contains(data, marker))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len().max(1))
        .any(|window| *window == *needle)
}

pub struct ResponseWriter {
    tx: mpsc::Sender<Result<Bytes, std::convert::Infallible>>,
    buffer: Vec<u8>,
    streaming: bool,
}

impl ResponseWriter {
    pub fn new(tx: mpsc::Sender<Result<Bytes, std::convert::Infallible>>) -> Self {
        Self {
            tx,
            buffer: Vec::new(),
            streaming: false,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Write a chunk. Returns Err when the client went away.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), ()> {
        if !self.streaming {
            if looks_like_sse_chunk(data) {
                self.enable_streaming("sse heuristic").await?;
            } else if self.buffer.len() + data.len() > MAX_BUFFERED_RESPONSE_BYTES {
                tracing::debug!(
                    buffered = self.buffer.len() + data.len(),
                    "buffer cap exceeded, switching to streaming"
                );
                self.enable_streaming("buffer limit").await?;
            }
        }

        if self.streaming {
            self.send(data.to_vec()).await
        } else {
            self.buffer.extend_from_slice(data);
            Ok(())
        }
    }

    /// Push out anything still buffered.
    pub async fn flush(&mut self) -> Result<(), ()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.buffer);
        self.send(pending).await
    }

    async fn enable_streaming(&mut self, reason: &str) -> Result<(), ()> {
        if self.streaming {
            return Ok(());
        }
        self.streaming = true;
        tracing::debug!(reason, "response writer switched to streaming");
        self.flush().await
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), ()> {
        self.tx.send(Ok(Bytes::from(data))).await.map_err(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_heuristic() {
        assert!(looks_like_sse_chunk(b"event: ping\ndata: {}\n\n"));
        assert!(looks_like_sse_chunk(b"...message_start..."));
        assert!(looks_like_sse_chunk(b"para\n\nbreak"));
        assert!(!looks_like_sse_chunk(b"{\"plain\":\"json\"}"));
        assert!(!looks_like_sse_chunk(b""));
    }

    #[tokio::test]
    async fn test_sse_chunk_streams_immediately() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut writer = ResponseWriter::new(tx);

        writer.write(b"event: ping\ndata: {\"type\":\"ping\"}\n\n").await.unwrap();
        assert!(writer.is_streaming());
        let chunk = rx.recv().await.unwrap().unwrap();
        assert!(chunk.starts_with(b"event: ping"));
    }

    #[tokio::test]
    async fn test_plain_chunks_buffer_until_flush() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut writer = ResponseWriter::new(tx);

        writer.write(b"{\"a\":1}").await.unwrap();
        assert!(!writer.is_streaming());
        assert!(rx.try_recv().is_err());

        writer.flush().await.unwrap();
        let chunk = rx.recv().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"{\"a\":1}");
    }

    #[tokio::test]
    async fn test_buffer_cap_forces_streaming() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut writer = ResponseWriter::new(tx);

        let big = vec![b'x'; MAX_BUFFERED_RESPONSE_BYTES / 2 + 1];
        writer.write(&big).await.unwrap();
        assert!(!writer.is_streaming());

        writer.write(&big).await.unwrap();
        assert!(writer.is_streaming());

        // buffered prefix flushed first, then the new chunk
        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.len(), big.len());
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(second.len(), big.len());
    }

    #[tokio::test]
    async fn test_dropped_receiver_errors() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut writer = ResponseWriter::new(tx);
        assert!(writer.write(b"event: ping\n\n").await.is_err());
    }
}
