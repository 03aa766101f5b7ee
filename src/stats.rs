//! Byte counters and throughput report lines.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Traffic direction a counter or report line refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Sent => f.write_str("Sent"),
            Direction::Recv => f.write_str("Recv"),
        }
    }
}

/// Sent and received byte totals for one benchmark run.
///
/// Each counter has a single writer (the task driving that direction); the
/// reporter only reads. Relaxed ordering is enough since the values are
/// only displayed.
#[derive(Debug, Default)]
pub struct ByteCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

impl ByteCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, direction: Direction, bytes: u64) {
        self.counter(direction).fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn get(&self, direction: Direction) -> u64 {
        self.counter(direction).load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.get(Direction::Sent)
    }

    pub fn received(&self) -> u64 {
        self.get(Direction::Recv)
    }

    fn counter(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::Sent => &self.sent,
            Direction::Recv => &self.received,
        }
    }
}

/// One `"<Sent|Recv> <N> bytes in <S> sec, <B> Bps"` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throughput {
    pub direction: Direction,
    pub bytes: u64,
    /// Whole seconds since the run started.
    pub secs: u64,
}

impl Throughput {
    pub fn new(direction: Direction, bytes: u64, elapsed: Duration) -> Self {
        Self {
            direction,
            bytes,
            secs: elapsed.as_secs(),
        }
    }

    /// Bytes per second over whole elapsed seconds.
    ///
    /// Less than one second counts as one.
    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes / self.secs.max(1)
    }
}

impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} bytes in {} sec, {} Bps",
            self.direction,
            self.bytes,
            self.secs,
            self.bytes_per_sec()
        )
    }
}

/// Print the current totals for both directions to stdout.
pub fn print_report(counters: &ByteCounters, elapsed: Duration) {
    for direction in [Direction::Sent, Direction::Recv] {
        println!(
            "{}",
            Throughput::new(direction, counters.get(direction), elapsed)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_line_format() {
        let line = Throughput::new(Direction::Sent, 3_000_000, Duration::from_millis(3_400));
        assert_eq!(line.to_string(), "Sent 3000000 bytes in 3 sec, 1000000 Bps");
    }

    #[test]
    fn test_zero_elapsed_does_not_divide_by_zero() {
        let line = Throughput::new(Direction::Recv, 65536, Duration::from_millis(250));
        assert_eq!(line.secs, 0);
        assert_eq!(line.bytes_per_sec(), 65536);
        assert_eq!(line.to_string(), "Recv 65536 bytes in 0 sec, 65536 Bps");

        let idle = Throughput::new(Direction::Recv, 0, Duration::ZERO);
        assert_eq!(idle.bytes_per_sec(), 0);
    }

    #[test]
    fn test_counters_are_per_direction() {
        let counters = ByteCounters::new();
        counters.add(Direction::Sent, 10);
        counters.add(Direction::Sent, 5);
        counters.add(Direction::Recv, 7);
        assert_eq!(counters.sent(), 15);
        assert_eq!(counters.received(), 7);
    }
}
