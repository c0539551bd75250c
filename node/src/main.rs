mod config;
mod job;

use collective::{DistEnv, Solo};
use log::info;
use tokio::signal;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dist = DistEnv::from_env()?;
    collective::logging::init(dist.rank);

    let cfg = Config::from_env()?;
    info!(rank = dist.rank, world_size = dist.world_size; "starting with {cfg:?}");

    if dist.world_size == 1 {
        return job::run(&mut Solo, &cfg).await;
    }

    let mut group = collective::connect(&dist).await?;

    let ret = tokio::select! {
        ret = job::run(&mut group, &cfg) => ret,
        _ = signal::ctrl_c() => {
            info!("received ctrl-c");
            return Ok(());
        }
    };

    ret?;
    info!("wrapping up, disconnecting...");
    group.disconnect().await?;

    Ok(())
}
