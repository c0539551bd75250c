use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize};

type Header = u64;
const HEADER_SIZE: usize = size_of::<Header>();

const KIND_ERR: Header = 0;
const KIND_CONTROL: Header = 1;
const KIND_SUM: Header = 2;
const KIND_SHARD: Header = 3;

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug)]
pub enum Payload<'a> {
    /// Values taking part in an element-wise sum across every rank.
    Sum(&'a [f64]),
    /// A single rank's shard of an all-gather, or the rank-ordered concatenation of all of them.
    Shard(&'a [f32]),
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// First message a non-leader rank sends after connecting to the leader.
    Hello { rank: usize, world_size: usize },
    Barrier,
    Disconnect,
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// A short name for the message kind, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(Command::Hello { .. }) => "control/hello",
            Msg::Control(Command::Barrier) => "control/barrier",
            Msg::Control(Command::Disconnect) => "control/disconnect",
            Msg::Data(Payload::Sum(_)) => "data/sum",
            Msg::Data(Payload::Shard(_)) => "data/shard",
            Msg::Err(_) => "err",
        }
    }

    fn buf_is_too_small<T>(size: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {HEADER_SIZE} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid message kind {kind:#x}"),
        ))
    }

    fn misaligned_payload<T>(kind: Header, len: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Payload of kind {kind} has {len} bytes, not a whole number of elements"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&KIND_ERR.to_be_bytes());
                Some(e.as_bytes())
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&KIND_CONTROL.to_be_bytes());

                // SAFETY: Serialize impl for `Command` is derived and not implemented
                //         by hand. Nor has a non string-key map inside.
                serde_json::to_writer(buf, &cmd).unwrap();
                None
            }
            Msg::Data(Payload::Sum(nums)) => {
                buf.extend_from_slice(&KIND_SUM.to_be_bytes());
                Some(bytemuck::cast_slice(nums))
            }
            Msg::Data(Payload::Shard(nums)) => {
                buf.extend_from_slice(&KIND_SHARD.to_be_bytes());
                Some(bytemuck::cast_slice(nums))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len());
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);

        // SAFETY: We splitted the buffer to be of size `HEADER_SIZE` just above.
        let kind = Header::from_be_bytes(kind_buf.try_into().unwrap());

        match kind {
            KIND_ERR => {
                let string = str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            KIND_CONTROL => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            KIND_SUM => match bytemuck::try_cast_slice(rest) {
                Ok(nums) => Ok(Self::Data(Payload::Sum(nums))),
                Err(_) => Self::misaligned_payload(kind, rest.len()),
            },
            KIND_SHARD => match bytemuck::try_cast_slice(rest) {
                Ok(nums) => Ok(Self::Data(Payload::Shard(nums))),
                Err(_) => Self::misaligned_payload(kind, rest.len()),
            },
            kind => Self::invalid_kind(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_bytes(msg: &Msg<'_>) -> Vec<u64> {
        let mut buf = Vec::new();
        let tail = msg.serialize(&mut buf).map(<[u8]>::to_vec).unwrap_or_default();
        buf.extend_from_slice(&tail);

        let mut words = vec![0u64; buf.len().div_ceil(8)];
        bytemuck::cast_slice_mut::<u64, u8>(&mut words)[..buf.len()].copy_from_slice(&buf);
        words
    }

    #[test]
    fn control_message_survives_encoding() {
        let msg = Msg::Control(Command::Hello {
            rank: 3,
            world_size: 4,
        });

        let mut buf = Vec::new();
        assert!(msg.serialize(&mut buf).is_none());

        match Msg::deserialize(&buf).unwrap() {
            Msg::Control(Command::Hello { rank, world_size }) => {
                assert_eq!((rank, world_size), (3, 4));
            }
            other => panic!("unexpected msg: {other:?}"),
        }
    }

    #[test]
    fn sum_payload_is_viewed_in_place() {
        let values = [1.5f64, -2.25, 1e300];
        let words = roundtrip_bytes(&Msg::Data(Payload::Sum(&values)));
        let bytes = &bytemuck::cast_slice::<u64, u8>(&words)[..HEADER_SIZE + 24];

        match Msg::deserialize(bytes).unwrap() {
            Msg::Data(Payload::Sum(got)) => assert_eq!(got, &values),
            other => panic!("unexpected msg: {other:?}"),
        }
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let values = [1.0f64];
        let words = roundtrip_bytes(&Msg::Data(Payload::Sum(&values)));
        let bytes = &bytemuck::cast_slice::<u64, u8>(&words)[..HEADER_SIZE + 5];

        let err = Msg::deserialize(bytes).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = 9u64.to_be_bytes().to_vec();
        buf.extend_from_slice(&[0; 4]);
        assert!(Msg::deserialize(&buf).is_err());
    }

    #[test]
    fn kind_is_read_from_the_whole_header() {
        // the low byte alone would read as a control message
        for header in [0x0101u64, 1 << 63 | 1, u64::MAX] {
            let mut buf = header.to_be_bytes().to_vec();
            buf.extend_from_slice(br#""barrier""#);

            let err = Msg::deserialize(&buf).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        }

        let mut buf = 1u64.to_be_bytes().to_vec();
        buf.extend_from_slice(br#""barrier""#);
        assert!(matches!(Msg::deserialize(&buf).unwrap(), Msg::Control(Command::Barrier)));
    }
}
