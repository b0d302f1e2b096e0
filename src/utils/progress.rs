use log::info;

/// Logs a progress line each time the processed count crosses a multiple of
/// `interval`, instead of once per item.
#[derive(Debug)]
pub struct ProgressCounter {
    label: &'static str,
    interval: usize,
    total: usize,
    processed: usize,
    next_mark: usize,
}

impl ProgressCounter {
    pub fn new(label: &'static str, interval: usize, total: usize) -> Self {
        let interval = interval.max(1);
        Self {
            label,
            interval,
            total,
            processed: 0,
            next_mark: interval,
        }
    }

    /// Count `n` more processed items. Returns true when a line was logged.
    pub fn advance(&mut self, n: usize) -> bool {
        self.processed += n;
        if self.processed < self.next_mark {
            return false;
        }

        // A large step may skip several marks; log once for all of them
        while self.next_mark <= self.processed {
            self.next_mark += self.interval;
        }

        if self.total > 0 {
            info!(
                "[{}] {}/{} processed ({:.1}%)",
                self.label,
                self.processed,
                self.total,
                self.processed as f64 / self.total as f64 * 100.0
            );
        } else {
            info!("[{}] {} processed", self.label, self.processed);
        }
        true
    }

    pub fn processed(&self) -> usize {
        self.processed
    }
}
