use std::{env, str::FromStr, time::Duration};

use comms::msg::{Command, Msg};
use log::{debug, info};
use tokio::{
    io::{self, DuplexStream, ReadHalf, WriteHalf},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::{Instant, sleep},
};

use crate::{CollectiveErr, LEADER, Result, StarGroup};

const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
const DEFAULT_MASTER_PORT: u16 = 29500;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);
const DUPLEX_CAPACITY: usize = 64 * 1024;

/// Process placement as announced by the launcher through environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistEnv {
    pub rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
    pub local_size: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl Default for DistEnv {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            local_rank: 0,
            local_size: 1,
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            master_port: DEFAULT_MASTER_PORT,
        }
    }
}

impl DistEnv {
    /// Reads `RANK`, `WORLD_SIZE`, `LOCAL_RANK`, `LOCAL_SIZE`, `MASTER_ADDR` and
    /// `MASTER_PORT`, falling back to a single process job for the missing ones.
    ///
    /// # Returns
    /// An error if a variable is set but can't be parsed, or if the ranks are out of range.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let parsed = Self {
            rank: var("RANK", defaults.rank)?,
            world_size: var("WORLD_SIZE", defaults.world_size)?,
            local_rank: var("LOCAL_RANK", defaults.local_rank)?,
            local_size: var("LOCAL_SIZE", defaults.local_size)?,
            master_addr: env::var("MASTER_ADDR").unwrap_or(defaults.master_addr),
            master_port: var("MASTER_PORT", defaults.master_port)?,
        };

        if parsed.world_size == 0 || parsed.rank >= parsed.world_size {
            return Err(CollectiveErr::Env {
                var: "RANK",
                value: format!("{} (world size {})", parsed.rank, parsed.world_size),
            });
        }

        if parsed.local_size == 0 || parsed.local_rank >= parsed.local_size {
            return Err(CollectiveErr::Env {
                var: "LOCAL_RANK",
                value: format!("{} (local size {})", parsed.local_rank, parsed.local_size),
            });
        }

        Ok(parsed)
    }

    /// Whether this is the rank responsible for singleton actions.
    pub fn is_leader(&self) -> bool {
        self.rank == LEADER
    }
}

fn var<T: FromStr>(name: &'static str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| CollectiveErr::Env { var: name, value }),
        Err(_) => Ok(default),
    }
}

/// Joins the process group described by `dist` over TCP.
///
/// The leader listens on `MASTER_ADDR:MASTER_PORT` and waits for every other
/// rank to connect and introduce itself, the rest keep dialing the leader until
/// it answers or `CONNECT_TIMEOUT` elapses.
///
/// # Arguments
/// * `dist` - The placement of this process.
///
/// # Returns
/// The connected group, or the first failure found while assembling it.
pub async fn connect(dist: &DistEnv) -> Result<StarGroup<OwnedReadHalf, OwnedWriteHalf>> {
    let addr = format!("{}:{}", dist.master_addr, dist.master_port);

    if dist.is_leader() {
        let list = TcpListener::bind(&addr)
            .await
            .map_err(|e| CollectiveErr::Handshake(format!("failed to bind {addr}: {e}")))?;
        info!("rendezvous listening at {addr}, waiting for {} ranks", dist.world_size - 1);

        let mut slots: Vec<Option<_>> = (1..dist.world_size).map(|_| None).collect();

        for _ in 1..dist.world_size {
            let (stream, from) = list
                .accept()
                .await
                .map_err(|e| CollectiveErr::Handshake(format!("accept failed: {e}")))?;
            let (rx, tx) = stream.into_split();
            let (mut rx, tx) = comms::channel(rx, tx);

            let mut buf: Vec<u64> = Vec::new();
            let msg = rx
                .recv_into(&mut buf)
                .await
                .map_err(|e| CollectiveErr::Handshake(format!("no hello from {from}: {e}")))?;

            let Msg::Control(Command::Hello { rank, world_size }) = msg else {
                return Err(CollectiveErr::Handshake(format!(
                    "expected hello from {from}, got {}",
                    msg.kind()
                )));
            };

            if world_size != dist.world_size {
                return Err(CollectiveErr::Handshake(format!(
                    "rank {rank} at {from} believes the world size is {world_size}, not {}",
                    dist.world_size
                )));
            }

            let slot = rank
                .checked_sub(1)
                .and_then(|i| slots.get_mut(i))
                .ok_or_else(|| CollectiveErr::Handshake(format!("rank {rank} out of range")))?;

            if slot.replace((rx, tx)).is_some() {
                return Err(CollectiveErr::Handshake(format!("rank {rank} joined twice")));
            }

            debug!(rank = rank; "rank joined from {from}");
        }

        let links = slots.into_iter().flatten().collect();
        info!("all {} ranks joined", dist.world_size);
        return Ok(StarGroup::hub(links));
    }

    let deadline = Instant::now() + CONNECT_TIMEOUT;
    let stream = loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => break stream,
            Err(e) if Instant::now() >= deadline => {
                return Err(CollectiveErr::Handshake(format!(
                    "rank {} could not reach the leader at {addr}: {e}",
                    dist.rank
                )));
            }
            Err(_) => sleep(CONNECT_BACKOFF).await,
        }
    };

    let (rx, tx) = stream.into_split();
    let (rx, mut tx) = comms::channel(rx, tx);

    let hello = Msg::Control(Command::Hello {
        rank: dist.rank,
        world_size: dist.world_size,
    });
    tx.send(&hello)
        .await
        .map_err(|e| CollectiveErr::Handshake(format!("failed to greet the leader: {e}")))?;

    info!("rank {} connected to the leader at {addr}", dist.rank);
    Ok(StarGroup::spoke(dist.rank, dist.world_size, rx, tx))
}

/// Builds every rank of a group whose processes live in this one, connected
/// through in-memory pipes. Used to simulate a job with many ranks.
///
/// # Arguments
/// * `world_size` - The amount of simulated ranks.
///
/// # Returns
/// The groups sorted by rank, to be moved into one task each.
pub fn in_memory(
    world_size: usize,
) -> Vec<StarGroup<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>> {
    assert!(world_size > 0, "a group needs at least one rank");

    let mut hub_links = Vec::with_capacity(world_size - 1);
    let mut spokes = Vec::with_capacity(world_size - 1);

    for rank in 1..world_size {
        let (hub_end, spoke_end) = io::duplex(DUPLEX_CAPACITY);

        let (rx, tx) = io::split(hub_end);
        hub_links.push(comms::channel(rx, tx));

        let (rx, tx) = io::split(spoke_end);
        let (rx, tx) = comms::channel(rx, tx);
        spokes.push(StarGroup::spoke(rank, world_size, rx, tx));
    }

    let mut groups = Vec::with_capacity(world_size);
    groups.push(StarGroup::hub(hub_links));
    groups.extend(spokes);
    groups
}
