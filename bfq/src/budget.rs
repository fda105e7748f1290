//! # Budget Engine
//!
//! Decides how many sectors a queue may consume per slice and adapts that
//! amount to the queue's observed behavior:
//!
//! - a queue that goes idle early cares about latency; shrink its budget;
//! - a queue that times out is likely seeky; reset it to the default so all
//!   seeky queues are charged alike, restoring fairness at least in the
//!   time domain;
//! - a queue that exhausts its budget is a greedy sequential reader; grow
//!   it so it can run at full speed;
//! - a queue that simply ran out of requests keeps its budget.
//!
//! The engine also keeps a device-wide peak-rate estimate (fixed point,
//! sectors per microsecond) used to autotune the global maximum budget from
//! the sync timeout.

use crate::entity::QueueId;
use crate::queue::QueueFlags;
use crate::scheduler::{BfqScheduler, ExpireReason};
use crate::tunables::DEFAULT_MAX_BUDGET;
use crate::Service;

/// Budget feedback step (sectors).
pub const BUDGET_STEP: Service = 128;

/// Samples needed before the peak-rate estimate drives the autotune.
pub const PEAK_RATE_SAMPLES: u32 = 32;

/// Fixed-point shift of the peak-rate estimate.
pub const RATE_SHIFT: u32 = 16;

/// Assignment-EMA level at which a queue's budget is clamped to the
/// device maximum.
const BUDGETS_ASSIGNED_RIPE: u32 = 194;

/// Shortest slice (µs) worth measuring at all.
const MIN_MEASURED_SLICE: u64 = 100;

/// Shortest slice (µs) trusted for peak-rate estimation.
const MIN_PEAK_RATE_SLICE: u64 = 20_000;

/// Autotuned maximum budget: the sectors transferable in 3/4 of the sync
/// timeout at the estimated peak rate.
pub fn calc_max_budget(peak_rate: u64, timeout_us: u64) -> Service {
    let max_budget = (peak_rate * timeout_us) >> RATE_SHIFT;
    max_budget - max_budget / 4
}

impl BfqScheduler {
    /// Default per-queue budget: 3/4 of the device maximum, a middle ground
    /// the feedback then walks up or down.
    ///
    /// Until the queue has collected enough slice assignments the built-in
    /// maximum is used instead of the autotuned one, so that short early
    /// measurements cannot poison the budgets used to estimate the rate.
    pub(crate) fn default_budget_for(&self, budgets_assigned: u32) -> Service {
        let budget = if budgets_assigned < BUDGETS_ASSIGNED_RIPE && self.tunables.user_max_budget == 0
        {
            DEFAULT_MAX_BUDGET
        } else {
            self.tunables.max_budget
        };
        budget - budget / 4
    }

    pub(crate) fn min_budget(&self) -> Service {
        self.tunables.max_budget / 2
    }

    /// Applies the feedback policy to a queue leaving service.
    pub(crate) fn recalc_budget(&mut self, qid: QueueId, reason: ExpireReason) {
        let (sync, budgets_assigned, old_max, next_sectors) = {
            let q = &self.queues[&qid];
            let next_sectors = q
                .next_rq
                .and_then(|id| q.request(id))
                .map(|rq| rq.sectors as Service);
            (q.is_sync(), q.budgets_assigned, q.max_budget, next_sectors)
        };

        let min_budget = self.min_budget();
        let mut budget = old_max;
        if sync {
            match reason {
                ExpireReason::TooIdle => {
                    if budget > min_budget + BUDGET_STEP {
                        budget -= BUDGET_STEP;
                    } else {
                        budget = min_budget;
                    }
                }
                ExpireReason::BudgetTimeout => {
                    budget = self.default_budget_for(budgets_assigned);
                }
                ExpireReason::BudgetExhausted => {
                    budget = (budget + 8 * BUDGET_STEP).min(self.tunables.max_budget);
                }
                ExpireReason::NoMoreRequests => return,
            }
        } else {
            // Async queues always get the maximum; their dispatch rate is
            // limited by the per-slice request quota instead.
            budget = self.tunables.max_budget;
        }

        if budgets_assigned >= BUDGETS_ASSIGNED_RIPE
            && self.tunables.user_max_budget == 0
            && budget > self.tunables.max_budget
        {
            budget = self.tunables.max_budget;
        }

        let entity_budget = match next_sectors {
            // Keep enough budget for the head request; the finish time must
            // stay in sync with the budget, so the caller re-inserts the
            // entity right after this update.
            Some(sectors) => budget.max(sectors),
            None => budget,
        };

        let q = self.queues.get_mut(&qid).expect("budget update of missing queue");
        q.max_budget = budget;
        if next_sectors.is_some() {
            q.entity.budget = entity_budget;
        }
        log::debug!("bfq: queue {:?} budget={} (sync={})", qid, entity_budget, sync);
    }

    /// Measures the slice that just ended, feeding the peak-rate estimate,
    /// and reports whether the queue was *slow*: served at a bandwidth too
    /// low to have consumed its budget within the sync timeout.
    ///
    /// With `compensate` the measurement ends at the moment idling started
    /// rather than now, so idle time is not billed as transfer time.
    pub(crate) fn update_peak_rate(&mut self, qid: QueueId, compensate: bool, now: u64) -> bool {
        let (service, budget) = {
            let q = &self.queues[&qid];
            if !q.is_sync() || q.flags.contains(QueueFlags::BUDGET_NEW) {
                return false;
            }
            (q.entity.service, q.entity.budget)
        };

        let end = if compensate { self.last_idling_start } else { now };
        let usecs = end.saturating_sub(self.last_budget_start);

        // Don't trust short or inverted intervals.
        if usecs < MIN_MEASURED_SLICE {
            return false;
        }

        let bw = (service << RATE_SHIFT) / usecs;
        let timeout_us = self.tunables.timeout(true);

        // Only long intervals filter out spikes well enough for the
        // peak-rate estimate.
        if usecs > MIN_PEAK_RATE_SLICE {
            let mut update = false;
            if bw > self.peak_rate {
                self.peak_rate = bw;
                update = true;
                log::debug!("bfq: peak_rate={}", bw);
            }

            update |= self.peak_rate_samples == PEAK_RATE_SAMPLES - 1;

            if self.peak_rate_samples < PEAK_RATE_SAMPLES {
                self.peak_rate_samples += 1;
            }

            if self.peak_rate_samples == PEAK_RATE_SAMPLES
                && update
                && self.tunables.user_max_budget == 0
            {
                self.tunables.max_budget = calc_max_budget(self.peak_rate, timeout_us);
                log::debug!("bfq: max_budget={}", self.tunables.max_budget);
            }
        }

        // At this bandwidth, could the queue have finished its budget before
        // the timeout? If not, it is slow.
        let expected = (bw * timeout_us) >> RATE_SHIFT;
        expected <= budget
    }

    /// The device maximum the autotune would pick right now.
    pub(crate) fn estimated_max_budget(&self) -> Service {
        if self.peak_rate_samples >= PEAK_RATE_SAMPLES {
            calc_max_budget(self.peak_rate, self.tunables.timeout(true))
        } else {
            DEFAULT_MAX_BUDGET
        }
    }

    /// Sets the `max_budget` tunable. Zero re-enables autotuning from the
    /// peak rate and the sync timeout.
    pub fn set_max_budget(&mut self, sectors: Service) {
        if sectors == 0 {
            self.tunables.max_budget = self.estimated_max_budget();
        } else {
            self.tunables.max_budget = sectors;
        }
        self.tunables.user_max_budget = sectors;
    }

    /// Sets the `timeout_sync` tunable (milliseconds) and re-derives the
    /// autotuned maximum budget unless the user pinned one.
    pub fn set_timeout_sync(&mut self, ms: u64) {
        self.tunables.timeout[1] = ms.max(1) * 1000;
        if self.tunables.user_max_budget == 0 {
            self.tunables.max_budget = self.estimated_max_budget();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProducerId, Request, RequestId, Tunables};

    fn sched() -> BfqScheduler {
        BfqScheduler::new(Tunables::default())
    }

    fn sched_with_queue(sync: bool) -> (BfqScheduler, QueueId) {
        let mut s = sched();
        let rq = if sync {
            Request::read(RequestId(1), ProducerId(1), 0, 8)
        } else {
            Request::write(RequestId(1), ProducerId(1), 0, 8)
        };
        s.set_request(&rq);
        s.add_request(rq, 0);
        let qid = s.queue_of_producer(ProducerId(1), sync).unwrap();
        (s, qid)
    }

    #[test]
    fn test_calc_max_budget() {
        // 100 MB/s is 200 sectors/ms; at a 125 ms timeout that is 25000
        // sectors, minus a quarter.
        let peak = (200u64 << RATE_SHIFT) / 1000;
        let max = calc_max_budget(peak, 125_000);
        let exact = 25_000 - 25_000 / 4;
        assert!(max.abs_diff(exact) < 64, "max={} exact={}", max, exact);
    }

    #[test]
    fn test_too_idle_walks_budget_down() {
        let (mut s, qid) = sched_with_queue(true);
        let start = s.queues[&qid].max_budget;
        s.recalc_budget(qid, ExpireReason::TooIdle);
        assert_eq!(s.queues[&qid].max_budget, start - BUDGET_STEP);
        // Repeated decrements floor at half the device maximum.
        for _ in 0..200 {
            s.recalc_budget(qid, ExpireReason::TooIdle);
        }
        assert_eq!(s.queues[&qid].max_budget, s.min_budget());
    }

    #[test]
    fn test_exhaustion_grows_budget_to_cap() {
        let (mut s, qid) = sched_with_queue(true);
        let start = s.queues[&qid].max_budget;
        s.recalc_budget(qid, ExpireReason::BudgetExhausted);
        assert_eq!(s.queues[&qid].max_budget, start + 8 * BUDGET_STEP);
        for _ in 0..100 {
            s.recalc_budget(qid, ExpireReason::BudgetExhausted);
        }
        assert_eq!(s.queues[&qid].max_budget, s.tunables.max_budget);
    }

    #[test]
    fn test_timeout_resets_to_default() {
        let (mut s, qid) = sched_with_queue(true);
        s.recalc_budget(qid, ExpireReason::BudgetExhausted);
        s.recalc_budget(qid, ExpireReason::BudgetTimeout);
        let assigned = s.queues[&qid].budgets_assigned;
        assert_eq!(s.queues[&qid].max_budget, s.default_budget_for(assigned));
    }

    #[test]
    fn test_no_more_requests_leaves_budget() {
        let (mut s, qid) = sched_with_queue(true);
        let start = s.queues[&qid].max_budget;
        s.recalc_budget(qid, ExpireReason::NoMoreRequests);
        assert_eq!(s.queues[&qid].max_budget, start);
    }

    #[test]
    fn test_async_always_resets_to_max() {
        let (mut s, qid) = sched_with_queue(false);
        s.queues.get_mut(&qid).unwrap().max_budget = 1;
        s.recalc_budget(qid, ExpireReason::TooIdle);
        assert_eq!(s.queues[&qid].max_budget, s.tunables.max_budget);
    }

    #[test]
    fn test_entity_budget_covers_head_request() {
        // A huge head request must fit in the next slice regardless of the
        // feedback outcome.
        let mut s = sched();
        let big = Request::read(RequestId(1), ProducerId(1), 0, 60_000);
        s.set_request(&big);
        s.add_request(big, 0);
        let qid = s.queue_of_producer(ProducerId(1), true).unwrap();
        s.recalc_budget(qid, ExpireReason::TooIdle);
        assert!(s.queues[&qid].entity.budget >= 60_000);
        assert!(s.queues[&qid].max_budget < 60_000);
    }

    #[test]
    fn test_user_pinned_max_budget_sticks() {
        let mut s = sched();
        s.set_max_budget(4096);
        assert_eq!(s.tunables.max_budget, 4096);
        assert_eq!(s.tunables.user_max_budget, 4096);
        // Unpinning falls back to the built-in default until enough peak
        // samples exist.
        s.set_max_budget(0);
        assert_eq!(s.tunables.max_budget, DEFAULT_MAX_BUDGET);
        assert_eq!(s.tunables.user_max_budget, 0);
    }

    #[test]
    fn test_slow_queue_detection() {
        let (mut s, qid) = sched_with_queue(true);
        // Pretend the queue has been in service for 50 ms and moved little.
        s.queues.get_mut(&qid).unwrap().flags.remove(QueueFlags::BUDGET_NEW);
        s.queues.get_mut(&qid).unwrap().entity.budget = 12_288;
        s.queues.get_mut(&qid).unwrap().entity.service = 100;
        s.last_budget_start = 0;
        let slow = s.update_peak_rate(qid, false, 50_000);
        assert!(slow, "100 sectors in 50 ms cannot fill 12288 before timeout");

        // A fast sequential queue is not slow.
        s.queues.get_mut(&qid).unwrap().entity.service = 12_288;
        s.last_budget_start = 0;
        let slow = s.update_peak_rate(qid, false, 50_000);
        assert!(!slow);
    }
}
