use std::{collections::VecDeque, fmt, num::NonZeroUsize};

use super::{
    Result,
    format::{Stat, Template},
};

const DEFAULT_WINDOW: usize = 20;
const DEFAULT_FMT: &str = "{median:.4} ({global_avg:.4})";

/// Tracks a series of values, giving access to smoothed statistics over a
/// window and to the global average over the whole series.
///
/// The window is local to this process. The running count and total are split
/// into the part already reduced across processes and the part updated since,
/// so synchronizing twice in a row never counts a value twice.
#[derive(Debug, Clone, PartialEq)]
pub struct SmoothedValue {
    window: VecDeque<f64>,
    window_size: NonZeroUsize,
    synced_count: f64,
    synced_total: f64,
    pending_count: f64,
    pending_total: f64,
    fmt: Template,
}

impl Default for SmoothedValue {
    fn default() -> Self {
        // SAFETY: both constants are valid.
        Self::new(NonZeroUsize::new(DEFAULT_WINDOW).unwrap(), DEFAULT_FMT).unwrap()
    }
}

impl SmoothedValue {
    /// Creates a new `SmoothedValue`.
    ///
    /// # Arguments
    /// * `window_size` - The amount of recent values the window statistics are computed over.
    /// * `fmt` - The template used to display this meter, see `Display`.
    ///
    /// # Returns
    /// An error if `fmt` isn't a valid template.
    pub fn new(window_size: NonZeroUsize, fmt: &str) -> Result<Self> {
        Ok(Self {
            window: VecDeque::with_capacity(window_size.get()),
            window_size,
            synced_count: 0.,
            synced_total: 0.,
            pending_count: 0.,
            pending_total: 0.,
            fmt: Template::parse(fmt)?,
        })
    }

    /// Records a new value with a weight of one.
    pub fn update(&mut self, value: f64) {
        self.update_weighted(value, 1);
    }

    /// Records `value` as the average of `n` observations.
    pub fn update_weighted(&mut self, value: f64, n: u64) {
        if self.window.len() == self.window_size.get() {
            self.window.pop_front();
        }
        self.window.push_back(value);

        self.pending_count += n as f64;
        self.pending_total += value * n as f64;
    }

    /// The median of the window, the lower one for an even amount of values.
    pub fn median(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }

        let mut sorted: Vec<f64> = self.window.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        Some(sorted[(sorted.len() - 1) / 2])
    }

    /// The mean of the window.
    pub fn avg(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }

        Some(self.window.iter().sum::<f64>() / self.window.len() as f64)
    }

    pub fn max(&self) -> Option<f64> {
        self.window.iter().copied().reduce(f64::max)
    }

    /// The most recent value.
    pub fn value(&self) -> Option<f64> {
        self.window.back().copied()
    }

    /// The running total across every process, as of the last synchronization,
    /// plus this process' updates since.
    pub fn total(&self) -> f64 {
        self.synced_total + self.pending_total
    }

    pub fn count(&self) -> f64 {
        self.synced_count + self.pending_count
    }

    /// The weighted average over every value seen.
    pub fn global_avg(&self) -> Option<f64> {
        let count = self.count();
        (count > 0.).then(|| self.total() / count)
    }

    /// The `(count, total)` updates not yet reduced across processes.
    pub(super) fn pending(&self) -> (f64, f64) {
        (self.pending_count, self.pending_total)
    }

    /// Folds the result of a reduction into the synchronized pair.
    ///
    /// # Arguments
    /// * `sent` - The pending pair this process contributed, as returned by `pending`.
    /// * `reduced` - The sum of every process' contribution.
    pub(super) fn commit(&mut self, sent: (f64, f64), reduced: (f64, f64)) {
        self.pending_count -= sent.0;
        self.pending_total -= sent.1;
        self.synced_count += reduced.0;
        self.synced_total += reduced.1;
    }

    /// The format template this meter was created with.
    pub fn fmt_template(&self) -> &str {
        self.fmt.as_str()
    }

    fn stat(&self, stat: Stat) -> Option<f64> {
        match stat {
            Stat::Median => self.median(),
            Stat::Avg => self.avg(),
            Stat::GlobalAvg => self.global_avg(),
            Stat::Max => self.max(),
            Stat::Value => self.value(),
        }
    }
}

/// Renders the meter through its format template.
impl fmt::Display for SmoothedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fmt.render(|stat| self.stat(stat)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meter(window: usize) -> SmoothedValue {
        SmoothedValue::new(NonZeroUsize::new(window).unwrap(), DEFAULT_FMT).unwrap()
    }

    #[test]
    fn window_statistics_only_see_recent_values() {
        let mut m = meter(3);
        for v in [10., 1., 4., 2.] {
            m.update(v);
        }

        assert_eq!(m.median(), Some(2.));
        assert_eq!(m.avg(), Some(7. / 3.));
        assert_eq!(m.max(), Some(4.));
        assert_eq!(m.value(), Some(2.));
        assert_eq!(m.global_avg(), Some(17. / 4.));
    }

    #[test]
    fn median_of_an_even_window_is_the_lower_one() {
        let mut m = meter(4);
        for v in [4., 1., 3., 2.] {
            m.update(v);
        }
        assert_eq!(m.median(), Some(2.));
    }

    #[test]
    fn weighted_updates_count_every_observation() {
        let mut m = meter(20);
        m.update_weighted(2., 3);
        m.update_weighted(6., 1);

        assert_eq!(m.count(), 4.);
        assert_eq!(m.total(), 12.);
        assert_eq!(m.global_avg(), Some(3.));
        assert_eq!(m.avg(), Some(4.));
    }

    #[test]
    fn empty_meter_has_no_statistics() {
        let m = SmoothedValue::default();
        assert_eq!(m.median(), None);
        assert_eq!(m.global_avg(), None);
        assert_eq!(m.to_string(), "NaN (NaN)");
    }

    #[test]
    fn commit_moves_pending_into_synced() {
        let mut m = meter(20);
        m.update(1.);
        m.update(3.);

        let sent = m.pending();
        m.update(5.);
        m.commit(sent, (4., 10.));

        assert_eq!(m.pending(), (1., 5.));
        assert_eq!(m.count(), 5.);
        assert_eq!(m.total(), 15.);
    }

    #[test]
    fn display_uses_the_template() {
        let mut m = SmoothedValue::new(NonZeroUsize::MIN, "{value:.6}").unwrap();
        m.update(0.25);
        assert_eq!(m.to_string(), "0.250000");
        assert_eq!(m.fmt_template(), "{value:.6}");
    }
}
