use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{Align8, Deserialize, FRAME_LEN_SIZE, FrameLen, MAX_FRAME_LEN};

/// The reading end of a framed channel.
pub struct FrameReceiver<R: AsyncRead + Unpin> {
    rx: R,
}

impl<R: AsyncRead + Unpin> FrameReceiver<R> {
    pub(super) fn new(rx: R) -> Self {
        Self { rx }
    }

    /// Waits for the next frame and decodes it.
    ///
    /// # Arguments
    /// * `buf` - Where the body is read into, the decoded message borrows from it.
    ///   Its element type fixes the alignment of the body.
    ///
    /// # Returns
    /// The decoded message, an `UnexpectedEof` error if the peer hung up, or an
    /// `InvalidData` error for an oversized or malformed frame.
    pub async fn recv_into<'buf, T, B>(&mut self, buf: &'buf mut Vec<B>) -> io::Result<T>
    where
        T: Deserialize<'buf>,
        B: Align8,
    {
        let len = self.read_len().await?;

        buf.clear();
        buf.resize(len.div_ceil(size_of::<B>()), B::zeroed());

        let body = &mut bytemuck::cast_slice_mut::<B, u8>(buf)[..len];
        self.rx.read_exact(body).await?;

        T::deserialize(body)
    }

    async fn read_len(&mut self) -> io::Result<usize> {
        let mut prefix = [0; FRAME_LEN_SIZE];
        self.rx.read_exact(&mut prefix).await?;

        let len = FrameLen::from_be_bytes(prefix);
        usize::try_from(len)
            .ok()
            .filter(|&len| len <= MAX_FRAME_LEN)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame of {len} bytes exceeds the limit of {MAX_FRAME_LEN}"),
                )
            })
    }
}
