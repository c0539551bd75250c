use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{FrameLen, MAX_FRAME_LEN, Serialize};

/// The writing end of a framed channel.
pub struct FrameSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    body: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            body: Vec::new(),
        }
    }

    /// Writes `msg` as a single frame and flushes it.
    ///
    /// The part of the body `msg` hands out as borrowed bytes is written as is,
    /// without going through the internal buffer.
    ///
    /// # Returns
    /// An `InvalidInput` error if the body exceeds `MAX_FRAME_LEN`, or the
    /// underlying writer's error.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        let Self { tx, body } = self;

        body.clear();
        let tail = msg.serialize(body);
        let len = body.len() + tail.map_or(0, <[u8]>::len);

        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {len} bytes exceeds the limit of {MAX_FRAME_LEN}"),
            ));
        }

        tx.write_all(&(len as FrameLen).to_be_bytes()).await?;
        tx.write_all(body).await?;

        if let Some(tail) = tail {
            tx.write_all(tail).await?;
        }

        tx.flush().await
    }

    /// Shuts down the writing half, the peer reads an end of stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.tx.shutdown().await
    }
}
