use std::{collections::BTreeMap, fmt};

use collective::ProcessGroup;
use log::debug;
use parking_lot::Mutex;

use super::{LogEvery, MetricsErr, Result, SmoothedValue};

const DEFAULT_DELIMITER: &str = "\t";

// keeps a rank's fingerprint times the world size exact in an f64
const FINGERPRINT_BITS: u32 = 40;

/// A named collection of meters.
///
/// Meters are created the first time a name is updated. Every method takes
/// `&self`, so the logger can be updated from inside a `log_every` loop.
#[derive(Debug)]
pub struct MetricLogger {
    meters: Mutex<BTreeMap<String, SmoothedValue>>,
    delimiter: String,
}

impl Default for MetricLogger {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER)
    }
}

impl MetricLogger {
    /// Creates a new `MetricLogger` whose `Display` separates meters by `delimiter`.
    pub fn new(delimiter: &str) -> Self {
        Self {
            meters: Mutex::new(BTreeMap::new()),
            delimiter: delimiter.to_string(),
        }
    }

    /// Records `value` under `name`, creating a default meter if needed.
    ///
    /// Names that are only updated on some ranks make the next
    /// `synchronize_between_processes` fail.
    pub fn update(&self, name: &str, value: f64) {
        self.update_weighted(name, value, 1);
    }

    /// Records several named values at once.
    pub fn update_many(&self, values: &[(&str, f64)]) {
        let mut meters = self.meters.lock();
        for &(name, value) in values {
            meters.entry(name.to_string()).or_default().update(value);
        }
    }

    /// Records `value` under `name` as the average of `n` observations.
    pub fn update_weighted(&self, name: &str, value: f64, n: u64) {
        self.meters
            .lock()
            .entry(name.to_string())
            .or_default()
            .update_weighted(value, n);
    }

    /// Registers `meter` under `name`, replacing any previous one.
    pub fn add_meter(&self, name: &str, meter: SmoothedValue) {
        self.meters.lock().insert(name.to_string(), meter);
    }

    /// A snapshot of the meter named `name`.
    ///
    /// # Returns
    /// `NotFound` if no meter has that name.
    pub fn get(&self, name: &str) -> Result<SmoothedValue> {
        self.meters
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| MetricsErr::NotFound(name.to_string()))
    }

    /// The global average of every meter that has seen a value.
    pub fn global_avgs(&self) -> BTreeMap<String, f64> {
        self.meters
            .lock()
            .iter()
            .filter_map(|(name, m)| Some((name.clone(), m.global_avg()?)))
            .collect()
    }

    /// Sums the counts and totals of every meter across every process.
    ///
    /// Only the updates made since the previous call are reduced, so calling
    /// this again without new updates leaves the meters as they are.
    ///
    /// # Arguments
    /// * `group` - The process group, every rank must call this together.
    ///
    /// # Returns
    /// `MeterMismatch` if the ranks don't own meters with the same names, in
    /// which case no meter is changed.
    pub async fn synchronize_between_processes<G: ProcessGroup>(&self, group: &mut G) -> Result<()> {
        let (names, sent): (Vec<String>, Vec<(f64, f64)>) = self
            .meters
            .lock()
            .iter()
            .map(|(name, m)| (name.clone(), m.pending()))
            .unzip();

        let fingerprint = fingerprint(&names);
        let mut values: Vec<f64> = sent.iter().flat_map(|&(c, t)| [c, t]).collect();
        values.push(fingerprint);

        group.barrier().await?;
        group.all_reduce_sum(&mut values).await?;

        if values.pop() != Some(fingerprint * group.world_size() as f64) {
            return Err(MetricsErr::MeterMismatch { rank: group.rank(), names });
        }

        let mut meters = self.meters.lock();
        for ((name, sent), reduced) in names.iter().zip(sent).zip(values.chunks_exact(2)) {
            if let Some(meter) = meters.get_mut(name) {
                meter.commit(sent, (reduced[0], reduced[1]));
            }
        }

        debug!(rank = group.rank(), meters = names.len(); "synchronized meters");
        Ok(())
    }

    /// Wraps `iterable` so that progress lines are logged every `print_freq`
    /// elements, yielding every element unchanged and in order.
    ///
    /// # Arguments
    /// * `iterable` - The sequence to iterate, its length must be known.
    /// * `print_freq` - How many elements between progress lines, zero is treated as one.
    /// * `header` - The prefix of every progress line.
    pub fn log_every<I>(&self, iterable: I, print_freq: usize, header: &str) -> LogEvery<'_, I::IntoIter>
    where
        I: IntoIterator,
        I::IntoIter: ExactSizeIterator,
    {
        LogEvery::new(self, iterable.into_iter(), print_freq.max(1), header)
    }
}

/// FNV-1a over the sorted meter names, truncated to `FINGERPRINT_BITS`.
fn fingerprint(names: &[String]) -> f64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;

    let hash = names
        .iter()
        .flat_map(|name| name.bytes().chain([0]))
        .fold(OFFSET, |h, b| (h ^ b as u64).wrapping_mul(PRIME));

    (hash >> (u64::BITS - FINGERPRINT_BITS)) as f64
}

/// Joins every meter as `name: meter` with the delimiter.
impl fmt::Display for MetricLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meters = self.meters.lock();

        for (i, (name, meter)) in meters.iter().enumerate() {
            if i > 0 {
                f.write_str(&self.delimiter)?;
            }
            write!(f, "{name}: {meter}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use collective::Solo;

    use super::*;

    #[test]
    fn meters_are_created_lazily() {
        let logger = MetricLogger::new("  ");
        logger.update_many(&[("loss", 2.0), ("lr", 0.1)]);
        logger.update("loss", 4.0);

        assert_eq!(logger.get("loss").unwrap().global_avg(), Some(3.0));
        assert!(matches!(logger.get("acc"), Err(MetricsErr::NotFound(name)) if name == "acc"));
    }

    #[test]
    fn display_joins_meters_in_name_order() {
        let logger = MetricLogger::new("  ");
        logger.add_meter(
            "lr",
            SmoothedValue::new(NonZeroUsize::MIN, "{value:.3}").unwrap(),
        );
        logger.update("lr", 0.5);
        logger.update("loss", 1.0);

        assert_eq!(logger.to_string(), "loss: 1.0000 (1.0000)  lr: 0.500");
    }

    #[test]
    fn global_avgs_skip_empty_meters() {
        let logger = MetricLogger::default();
        logger.add_meter("unused", SmoothedValue::default());
        logger.update_weighted("acc", 0.5, 4);

        let avgs = logger.global_avgs();
        assert_eq!(avgs.len(), 1);
        assert_eq!(avgs["acc"], 0.5);
    }

    #[tokio::test]
    async fn single_process_sync_is_idempotent() {
        let logger = MetricLogger::default();
        logger.update("loss", 1.0);
        logger.update("loss", 2.0);

        let mut group = Solo;
        logger.synchronize_between_processes(&mut group).await.unwrap();
        logger.synchronize_between_processes(&mut group).await.unwrap();

        let loss = logger.get("loss").unwrap();
        assert_eq!(loss.count(), 2.0);
        assert_eq!(loss.global_avg(), Some(1.5));
    }
}
