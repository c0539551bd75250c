use std::{
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use log::info;

use super::{MetricLogger, SmoothedValue, format::hms};

const TIME_FMT: &str = "{avg:.4}";
const TIME_WINDOW: NonZeroUsize = NonZeroUsize::new(20).unwrap();

/// The iterator returned by `MetricLogger::log_every`.
///
/// Besides the logger's meters, it tracks how long each element took to be
/// produced (`data`) and how long a whole iteration took (`time`), which also
/// drives the ETA.
pub struct LogEvery<'a, I> {
    logger: &'a MetricLogger,
    inner: I,
    len: usize,
    print_freq: usize,
    header: String,
    /// The index of the element handed out last, until its iteration is accounted for.
    in_flight: Option<usize>,
    next_index: usize,
    start: Instant,
    end: Instant,
    iter_time: SmoothedValue,
    data_time: SmoothedValue,
    finished: bool,
}

impl<'a, I: ExactSizeIterator> LogEvery<'a, I> {
    pub(super) fn new(logger: &'a MetricLogger, inner: I, print_freq: usize, header: &str) -> Self {
        let timer = || {
            // SAFETY: `TIME_FMT` is a valid template.
            SmoothedValue::new(TIME_WINDOW, TIME_FMT).unwrap()
        };
        let now = Instant::now();

        Self {
            logger,
            len: inner.len(),
            inner,
            print_freq,
            header: header.to_string(),
            in_flight: None,
            next_index: 0,
            start: now,
            end: now,
            iter_time: timer(),
            data_time: timer(),
            finished: false,
        }
    }

    fn report(&self, i: usize) {
        let width = self.len.to_string().len();
        let remaining = self.len.saturating_sub(i);
        let eta = self.iter_time.global_avg().unwrap_or(0.) * remaining as f64;

        info!(
            "{} [{i:>width$}/{}] eta: {} {} time: {} data: {}",
            self.header,
            self.len,
            hms(Duration::from_secs_f64(eta.max(0.))),
            self.logger,
            self.iter_time,
            self.data_time,
        );
    }

    fn report_total(&self) {
        let total = self.start.elapsed();
        let per_item = total.as_secs_f64() / self.len.max(1) as f64;

        info!(
            "{} Total time: {} ({per_item:.4} s / it)",
            self.header,
            hms(total)
        );
    }
}

impl<I: ExactSizeIterator> Iterator for LogEvery<'_, I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(i) = self.in_flight.take() {
            self.iter_time.update(self.end.elapsed().as_secs_f64());

            if i % self.print_freq == 0 || i + 1 == self.len {
                self.report(i);
            }
            self.end = Instant::now();
        }

        match self.inner.next() {
            Some(item) => {
                self.data_time.update(self.end.elapsed().as_secs_f64());
                self.in_flight = Some(self.next_index);
                self.next_index += 1;
                Some(item)
            }
            None => {
                if !self.finished {
                    self.finished = true;
                    self.report_total();
                }
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<I: ExactSizeIterator> ExactSizeIterator for LogEvery<'_, I> {}
