use std::io::Write;

use env_logger::{Builder, Env};
use log::LevelFilter;

use crate::LEADER;

/// Installs the process-wide logger for the process at `rank`.
///
/// Every line is prefixed with a timestamp and the rank. The leader honors
/// `RUST_LOG` and defaults to `info`, the rest never go below `warn` so that
/// progress lines are printed once per job. Calling this twice is a no-op.
pub fn init(rank: usize) {
    let installed = Builder::from_env(Env::default().default_filter_or("info"))
        .format(move |buf, record| {
            writeln!(
                buf,
                "{} [rank {rank}] {:<5} {}",
                buf.timestamp(),
                record.level(),
                record.args()
            )
        })
        .try_init()
        .is_ok();

    if installed && rank != LEADER {
        log::set_max_level(log::max_level().min(LevelFilter::Warn));
    }
}
