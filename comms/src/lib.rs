//! Framed messages between the ranks of a training job.
//!
//! Every frame is a big endian `u64` body length followed by the body. Bodies
//! are read into 8 byte aligned buffers so numeric payloads can be borrowed
//! straight out of them.

mod align;
mod deserialize;
pub mod msg;
mod receiver;
mod sender;
mod serialize;

use tokio::io::{AsyncRead, AsyncWrite};

pub use align::Align8;
pub use deserialize::Deserialize;
pub use receiver::FrameReceiver;
pub use sender::FrameSender;
pub use serialize::Serialize;

type FrameLen = u64;
const FRAME_LEN_SIZE: usize = size_of::<FrameLen>();

/// The largest body accepted in either direction, 1 GiB.
pub const MAX_FRAME_LEN: usize = 1 << 30;

/// Wraps the two halves of a connection into a framed channel.
///
/// # Arguments
/// * `rx` - The readable half.
/// * `tx` - The writable half.
///
/// # Returns
/// The receiving and sending ends of the channel.
pub fn channel<R, W>(rx: R, tx: W) -> (FrameReceiver<R>, FrameSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (FrameReceiver::new(rx), FrameSender::new(tx))
}
