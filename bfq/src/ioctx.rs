//! # Producer Contexts
//!
//! One context per request producer. The context links the producer to its
//! sync and async queues and accumulates the behavioral statistics the
//! idling heuristics feed on: an exponential moving average of the think
//! time between a completion and the next submission, and one of the seek
//! distance between consecutive requests.

use crate::entity::{GroupId, IoPriority};
use crate::{ProducerId, Sector};

/// Seek-distance mean above which a producer counts as seeky (sectors).
const SEEKY_THRESHOLD: u64 = 8 * 1024;

/// EMA sample count above which an average is trusted.
const SAMPLE_VALID: u32 = 80;

/// Per-producer I/O context.
#[derive(Debug)]
pub struct IoContext {
    pub producer: ProducerId,
    /// Group the producer's queues are scheduled under
    pub group: GroupId,
    /// I/O priority the producer's queues inherit
    pub prio: IoPriority,
    /// Queue links: [async, sync]
    pub queue: [Option<crate::entity::QueueId>; 2],
    /// Live tasks behind this context; idling is pointless at zero
    pub tasks: u32,

    // Think-time EMA (µs)
    pub ttime_samples: u32,
    pub ttime_total: u64,
    pub ttime_mean: u64,

    // Seek-distance EMA (sectors)
    pub seek_samples: u32,
    pub seek_total: u64,
    pub seek_mean: u64,

    /// End sector of the last submitted request
    pub last_request_pos: Sector,
    /// Completion time of the last sync request (µs)
    pub last_end_request: u64,
}

impl IoContext {
    pub fn new(producer: ProducerId, group: GroupId) -> Self {
        Self {
            producer,
            group,
            prio: IoPriority::default(),
            queue: [None, None],
            tasks: 1,
            ttime_samples: 0,
            ttime_total: 0,
            ttime_mean: 0,
            seek_samples: 0,
            seek_total: 0,
            seek_mean: 0,
            last_request_pos: 0,
            last_end_request: 0,
        }
    }

    /// Folds the gap since the last completion into the think-time average.
    ///
    /// The gap is capped at twice the idle window: longer pauses carry no
    /// extra information about whether idling is worthwhile.
    pub fn update_think_time(&mut self, now: u64, slice_idle: u64) {
        let elapsed = now.saturating_sub(self.last_end_request);
        let ttime = elapsed.min(2 * slice_idle);

        self.ttime_samples = (7 * self.ttime_samples + 256) / 8;
        self.ttime_total = (7 * self.ttime_total + 256 * ttime) / 8;
        self.ttime_mean = (self.ttime_total + 128) / self.ttime_samples as u64;
    }

    /// Folds the distance from the previous request into the seek average.
    pub fn update_seek(&mut self, sector: Sector) {
        let mut sdist = if self.last_request_pos < sector {
            sector - self.last_request_pos
        } else {
            self.last_request_pos - sector
        };

        // Keep one odd fragment or pagein from blowing up the average.
        if self.seek_samples == 0 {
            sdist = 0;
        } else if self.seek_samples <= 60 {
            sdist = sdist.min(self.seek_mean * 4 + 2 * 1024 * 1024);
        } else {
            sdist = sdist.min(self.seek_mean * 4 + 2 * 1024 * 64);
        }

        self.seek_samples = (7 * self.seek_samples + 256) / 8;
        self.seek_total = (7 * self.seek_total + 256 * sdist) / 8;
        self.seek_mean = (self.seek_total + self.seek_samples as u64 / 2) / self.seek_samples as u64;
    }

    pub fn ttime_valid(&self) -> bool {
        self.ttime_samples > SAMPLE_VALID
    }

    pub fn seek_valid(&self) -> bool {
        self.seek_samples > SAMPLE_VALID
    }

    pub fn seeky(&self) -> bool {
        self.seek_mean > SEEKY_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> IoContext {
        IoContext::new(ProducerId(1), GroupId::ROOT)
    }

    #[test]
    fn test_think_time_converges() {
        let mut c = ctx();
        let slice_idle = 8_000;
        let mut now = 0;
        for _ in 0..100 {
            c.last_end_request = now;
            now += 1_000; // 1 ms of thinking
            c.update_think_time(now, slice_idle);
        }
        assert!(c.ttime_valid());
        // The EMA settles near the true 1 ms mean.
        assert!(c.ttime_mean > 800 && c.ttime_mean < 1_200, "mean={}", c.ttime_mean);
    }

    #[test]
    fn test_think_time_caps_long_gaps() {
        let mut c = ctx();
        let slice_idle = 8_000;
        for i in 0..100 {
            c.last_end_request = i * 1_000_000;
            c.update_think_time(i * 1_000_000 + 500_000, slice_idle);
        }
        // Half-second gaps saturate at twice the idle window.
        assert!(c.ttime_mean <= 2 * slice_idle);
        assert!(c.ttime_mean > slice_idle);
    }

    #[test]
    fn test_sequential_producer_is_not_seeky() {
        let mut c = ctx();
        let mut pos = 0;
        for _ in 0..200 {
            c.update_seek(pos);
            pos += 8;
            c.last_request_pos = pos;
        }
        assert!(c.seek_valid());
        assert!(!c.seeky(), "seek_mean={}", c.seek_mean);
    }

    #[test]
    fn test_random_producer_is_seeky() {
        let mut c = ctx();
        let mut pos = 0u64;
        for i in 0..200u64 {
            c.update_seek(pos);
            c.last_request_pos = pos + 8;
            // Jump around by tens of thousands of sectors.
            pos = (i * 7_919_777) % 10_000_000;
        }
        assert!(c.seek_valid());
        assert!(c.seeky(), "seek_mean={}", c.seek_mean);
    }

    #[test]
    fn test_first_request_is_not_a_seek() {
        let mut c = ctx();
        c.update_seek(5_000_000);
        assert_eq!(c.seek_mean, 0);
    }
}
