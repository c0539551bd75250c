use comms::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg, Payload},
};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{CollectiveErr, LEADER, ProcessGroup, Result};

const BARRIER: &str = "barrier";
const ALL_REDUCE: &str = "all_reduce_sum";
const ALL_GATHER: &str = "all_gather";
const DISCONNECT: &str = "disconnect";

/// One end of the connection between the leader and another rank.
struct Link<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    peer: usize,
    rx: FrameReceiver<R>,
    tx: FrameSender<W>,
}

impl<R, W> Link<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn recv<'b>(&mut self, buf: &'b mut Vec<u64>, op: &'static str) -> Result<Msg<'b>> {
        let peer = self.peer;
        self.rx
            .recv_into(buf)
            .await
            .map_err(|source| CollectiveErr::Io { op, peer, source })
    }

    async fn send(&mut self, msg: &Msg<'_>, op: &'static str) -> Result<()> {
        let peer = self.peer;
        self.tx
            .send(msg)
            .await
            .map_err(|source| CollectiveErr::Io { op, peer, source })
    }
}

enum Role<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// The leader, holding one link per other rank, sorted by rank.
    Hub(Vec<Link<R, W>>),
    /// Any other rank, holding its link to the leader.
    Spoke(Link<R, W>),
}

/// A process group in a star topology where the leader is the hub.
///
/// Every collective is a gather to the leader followed by a broadcast of the
/// combined result, so the leader alone decides what every rank observes.
pub struct StarGroup<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    rank: usize,
    world_size: usize,
    role: Role<R, W>,
    buf: Vec<u64>,
}

impl<R, W> StarGroup<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates the leader's end of the group.
    ///
    /// # Arguments
    /// * `links` - One channel per other rank, the `i`-th one connected to rank `i + 1`.
    ///
    /// # Returns
    /// The group as seen from rank 0.
    pub fn hub(links: Vec<(FrameReceiver<R>, FrameSender<W>)>) -> Self {
        let world_size = links.len() + 1;
        let links = links
            .into_iter()
            .enumerate()
            .map(|(i, (rx, tx))| Link { peer: i + 1, rx, tx })
            .collect();

        Self {
            rank: LEADER,
            world_size,
            role: Role::Hub(links),
            buf: Vec::new(),
        }
    }

    /// Creates a non-leader end of the group.
    ///
    /// # Arguments
    /// * `rank` - This process' rank, must not be the leader's.
    /// * `world_size` - The total amount of processes.
    /// * `rx`, `tx` - The channel connected to the leader.
    pub fn spoke(rank: usize, world_size: usize, rx: FrameReceiver<R>, tx: FrameSender<W>) -> Self {
        debug_assert!(rank != LEADER && rank < world_size);

        Self {
            rank,
            world_size,
            role: Role::Spoke(Link {
                peer: LEADER,
                rx,
                tx,
            }),
            buf: Vec::new(),
        }
    }

    /// Leaves the group once every rank has asked to.
    ///
    /// # Returns
    /// An error if a link fails before every rank disconnected.
    pub async fn disconnect(mut self) -> Result<()> {
        let Self { role, buf, .. } = &mut self;
        let msg = Msg::Control(Command::Disconnect);

        match role {
            Role::Hub(links) => {
                for link in links.iter_mut() {
                    expect_control(link, buf, DISCONNECT, Command::Disconnect).await?;
                }

                for link in links.iter_mut() {
                    link.send(&msg, DISCONNECT).await?;
                }
            }
            Role::Spoke(link) => {
                link.send(&msg, DISCONNECT).await?;
                expect_control(link, buf, DISCONNECT, Command::Disconnect).await?;
            }
        }

        debug!(rank = self.rank; "left the process group");
        Ok(())
    }
}

async fn expect_control<R, W>(
    link: &mut Link<R, W>,
    buf: &mut Vec<u64>,
    op: &'static str,
    want: Command,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let peer = link.peer;

    match link.recv(buf, op).await? {
        Msg::Control(cmd) if cmd == want => Ok(()),
        Msg::Err(detail) => Err(CollectiveErr::Remote {
            rank: peer,
            detail: detail.into_owned(),
        }),
        other => Err(CollectiveErr::UnexpectedMessage {
            op,
            peer,
            got: other.kind(),
        }),
    }
}

/// Tells every other rank that the current collective failed on the leader.
async fn abort<R, W>(links: &mut [Link<R, W>], err: &CollectiveErr)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let detail = err.to_string();
    let msg = Msg::Err(detail.as_str().into());

    for link in links.iter_mut() {
        if let Err(e) = link.send(&msg, "abort").await {
            warn!(peer = link.peer; "failed to propagate collective failure: {e}");
        }
    }
}

impl<R, W> ProcessGroup for StarGroup<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    async fn barrier(&mut self) -> Result<()> {
        let Self { role, buf, .. } = self;
        let msg = Msg::Control(Command::Barrier);

        match role {
            Role::Hub(links) => {
                for link in links.iter_mut() {
                    expect_control(link, buf, BARRIER, Command::Barrier).await?;
                }

                for link in links.iter_mut() {
                    link.send(&msg, BARRIER).await?;
                }
            }
            Role::Spoke(link) => {
                link.send(&msg, BARRIER).await?;
                expect_control(link, buf, BARRIER, Command::Barrier).await?;
            }
        }

        Ok(())
    }

    async fn all_reduce_sum(&mut self, values: &mut [f64]) -> Result<()> {
        let Self { role, buf, .. } = self;

        match role {
            Role::Hub(links) => {
                let mut failure = None;

                for link in links.iter_mut() {
                    let peer = link.peer;

                    match link.recv(buf, ALL_REDUCE).await? {
                        Msg::Data(Payload::Sum(nums)) if nums.len() == values.len() => {
                            values.iter_mut().zip(nums).for_each(|(acc, x)| *acc += x);
                        }
                        Msg::Data(Payload::Sum(nums)) => {
                            failure = Some(CollectiveErr::LengthMismatch {
                                op: ALL_REDUCE,
                                rank: peer,
                                got: nums.len(),
                                expected: values.len(),
                            });
                            break;
                        }
                        other => {
                            failure = Some(CollectiveErr::UnexpectedMessage {
                                op: ALL_REDUCE,
                                peer,
                                got: other.kind(),
                            });
                            break;
                        }
                    }
                }

                if let Some(err) = failure {
                    abort(links, &err).await;
                    return Err(err);
                }

                let msg = Msg::Data(Payload::Sum(values));
                for link in links.iter_mut() {
                    link.send(&msg, ALL_REDUCE).await?;
                }
            }
            Role::Spoke(link) => {
                link.send(&Msg::Data(Payload::Sum(values)), ALL_REDUCE)
                    .await?;

                match link.recv(buf, ALL_REDUCE).await? {
                    Msg::Data(Payload::Sum(nums)) if nums.len() == values.len() => {
                        values.copy_from_slice(nums);
                    }
                    Msg::Data(Payload::Sum(nums)) => {
                        return Err(CollectiveErr::LengthMismatch {
                            op: ALL_REDUCE,
                            rank: LEADER,
                            got: nums.len(),
                            expected: values.len(),
                        });
                    }
                    Msg::Err(detail) => {
                        return Err(CollectiveErr::Remote {
                            rank: LEADER,
                            detail: detail.into_owned(),
                        });
                    }
                    other => {
                        return Err(CollectiveErr::UnexpectedMessage {
                            op: ALL_REDUCE,
                            peer: LEADER,
                            got: other.kind(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    async fn all_gather(&mut self, shard: &[f32]) -> Result<Vec<f32>> {
        let Self {
            role,
            buf,
            world_size,
            ..
        } = self;
        let expected = shard.len() * *world_size;

        match role {
            Role::Hub(links) => {
                let mut out = Vec::with_capacity(expected);
                out.extend_from_slice(shard);
                let mut failure = None;

                for link in links.iter_mut() {
                    let peer = link.peer;

                    match link.recv(buf, ALL_GATHER).await? {
                        Msg::Data(Payload::Shard(nums)) if nums.len() == shard.len() => {
                            out.extend_from_slice(nums);
                        }
                        Msg::Data(Payload::Shard(nums)) => {
                            failure = Some(CollectiveErr::LengthMismatch {
                                op: ALL_GATHER,
                                rank: peer,
                                got: nums.len(),
                                expected: shard.len(),
                            });
                            break;
                        }
                        other => {
                            failure = Some(CollectiveErr::UnexpectedMessage {
                                op: ALL_GATHER,
                                peer,
                                got: other.kind(),
                            });
                            break;
                        }
                    }
                }

                if let Some(err) = failure {
                    abort(links, &err).await;
                    return Err(err);
                }

                let msg = Msg::Data(Payload::Shard(&out));
                for link in links.iter_mut() {
                    link.send(&msg, ALL_GATHER).await?;
                }

                Ok(out)
            }
            Role::Spoke(link) => {
                link.send(&Msg::Data(Payload::Shard(shard)), ALL_GATHER)
                    .await?;

                match link.recv(buf, ALL_GATHER).await? {
                    Msg::Data(Payload::Shard(nums)) if nums.len() == expected => Ok(nums.to_vec()),
                    Msg::Data(Payload::Shard(nums)) => Err(CollectiveErr::LengthMismatch {
                        op: ALL_GATHER,
                        rank: LEADER,
                        got: nums.len(),
                        expected,
                    }),
                    Msg::Err(detail) => Err(CollectiveErr::Remote {
                        rank: LEADER,
                        detail: detail.into_owned(),
                    }),
                    other => Err(CollectiveErr::UnexpectedMessage {
                        op: ALL_GATHER,
                        peer: LEADER,
                        got: other.kind(),
                    }),
                }
            }
        }
    }
}
