//! Scenario tests driving the scheduler through its public interface, with
//! a simulated device clock: requests complete a fixed transfer time after
//! they are dispatched.

use bfq::{
    BfqDevice, BfqScheduler, IoClass, IoPriority, ProducerId, Request, RequestId, Tunables,
};

/// One producer issuing a sequential stream of fixed-size reads.
struct Stream {
    producer: ProducerId,
    next_id: u64,
    next_sector: u64,
    sectors: u32,
    pending: u32,
}

impl Stream {
    fn new(producer: u64, id_base: u64, sector_base: u64, sectors: u32) -> Self {
        Self {
            producer: ProducerId(producer),
            next_id: id_base,
            next_sector: sector_base,
            sectors,
            pending: 0,
        }
    }

    /// Tops the stream's backlog up to `target` pending requests.
    fn refill(&mut self, sched: &mut BfqScheduler, target: u32, now: u64) {
        while self.pending < target {
            let rq = Request::read(
                RequestId(self.next_id),
                self.producer,
                self.next_sector,
                self.sectors,
            );
            self.next_id += 1;
            self.next_sector += self.sectors as u64;
            sched.set_request(&rq);
            sched.add_request(rq, now);
            self.pending += 1;
        }
    }
}

/// Completes a batch in order, one transfer time apart, and returns the
/// advanced clock.
fn complete_batch(sched: &mut BfqScheduler, batch: Vec<Request>, mut now: u64, gap: u64) -> u64 {
    for rq in batch {
        sched.activate_request(rq.id);
        now += gap;
        sched.completed_request(rq.id, now);
        sched.put_request(rq.id);
    }
    now
}

#[test]
fn two_equal_weight_producers_share_the_device() {
    let mut sched = BfqScheduler::new(Tunables::default());
    let mut a = Stream::new(1, 0, 0, 256);
    let mut b = Stream::new(2, 1_000_000, 500_000_000, 256);

    // 256 sectors at ~200 sectors/ms.
    let gap = 1_280;
    let mut now = 0;
    a.refill(&mut sched, 64, now);
    b.refill(&mut sched, 64, now);

    while now < 2_000_000 {
        let batch = sched.dispatch(now, false);
        assert!(!batch.is_empty(), "both producers are backlogged");
        for rq in &batch {
            if rq.producer == a.producer {
                a.pending -= 1;
            } else {
                b.pending -= 1;
            }
        }
        // Refill before completing so neither queue ever runs dry.
        a.refill(&mut sched, 64, now);
        b.refill(&mut sched, 64, now);
        now = complete_batch(&mut sched, batch, now, gap);
    }

    let served_a = sched.producer_service(a.producer, true).unwrap();
    let served_b = sched.producer_service(b.producer, true).unwrap();
    assert!(served_a > 100_000);
    assert!(served_b > 100_000);
    // Under continuous backlog the cumulative service of equal-weight
    // producers diverges by at most about one slice budget.
    let diff = served_a.abs_diff(served_b);
    assert!(diff <= 40_000, "service skew {} (a={}, b={})", diff, served_a, served_b);
}

#[test]
fn rt_producer_starves_best_effort_until_idle() {
    let mut sched = BfqScheduler::new(Tunables::default());
    sched.tunables_mut().set_slice_idle(0);

    let rt = ProducerId(1);
    let be = ProducerId(2);
    sched.set_io_priority(rt, IoPriority::new(IoClass::Rt, 4));

    for i in 0..50u64 {
        let rq = Request::read(RequestId(i), rt, i * 8, 8);
        sched.set_request(&rq);
        sched.add_request(rq, 0);
    }
    for i in 50..100u64 {
        let rq = Request::read(RequestId(i), be, 1_000_000 + i * 8, 8);
        sched.set_request(&rq);
        sched.add_request(rq, 0);
    }

    let mut order = Vec::new();
    let mut now = 0;
    loop {
        let batch = sched.dispatch(now, false);
        if batch.is_empty() {
            break;
        }
        for rq in &batch {
            order.push(rq.producer);
        }
        now = complete_batch(&mut sched, batch, now, 100);
    }

    assert_eq!(order.len(), 100);
    let first_be = order.iter().position(|&p| p == be).unwrap();
    assert_eq!(first_be, 50, "every RT request is served before any BE one");
    assert!(order[..50].iter().all(|&p| p == rt));
    assert!(sched.queue_empty());
}

#[test]
fn slice_idle_zero_never_arms_the_timer() {
    let mut sched = BfqScheduler::new(Tunables::default());
    sched.tunables_mut().set_slice_idle(0);
    let mut stream = Stream::new(1, 0, 0, 8);
    let mut now = 0;
    for _ in 0..20 {
        stream.refill(&mut sched, 1, now);
        stream.pending = 0;
        let batch = sched.dispatch(now, false);
        now = complete_batch(&mut sched, batch, now, 100);
        assert_eq!(sched.idle_timer_deadline(), None);
        now += 5_000;
    }
}

#[test]
fn peak_rate_autotunes_the_max_budget() {
    let mut sched = BfqScheduler::new(Tunables::default());
    assert_eq!(sched.tunables().max_budget, 16 * 1024);
    let mut stream = Stream::new(1, 0, 0, 256);

    // A steady 200 sectors/ms device: every slice is long enough to count
    // as a peak-rate sample.
    let gap = 1_280;
    let mut now = 0;
    stream.refill(&mut sched, 96, now);
    while now < 5_000_000 {
        let batch = sched.dispatch(now, false);
        assert!(!batch.is_empty());
        stream.pending -= batch.len() as u32;
        stream.refill(&mut sched, 96, now);
        now = complete_batch(&mut sched, batch, now, gap);
    }

    // 0.75 * 200 sectors/ms * 125 ms, within rounding and budget jitter.
    let max_budget = sched.tunables().max_budget;
    assert!(
        (15_000..=24_000).contains(&max_budget),
        "autotuned max_budget={}",
        max_budget
    );
    assert_eq!(sched.tunables().user_max_budget, 0);
}

#[test]
fn seeky_budget_shrinks_sequential_budget_grows() {
    let mut sched = BfqScheduler::new(Tunables::default());
    let seeky = ProducerId(1);

    // A producer touching a far-away sector once per idle window: while its
    // queue still has the idle window, every slice ends with the timer
    // firing and a too-idle decrement of its budget cap.
    let mut now = 0;
    for i in 0..4u64 {
        let rq = Request::read(RequestId(i), seeky, i * 1_000_000, 8);
        sched.set_request(&rq);
        sched.add_request(rq, now);
        let batch = sched.dispatch(now, false);
        assert_eq!(batch.len(), 1);
        now = complete_batch(&mut sched, batch, now, 40);
        if let Some(deadline) = sched.idle_timer_deadline() {
            sched.idle_timer_fired(deadline);
            now = deadline;
        }
        now += 1_000;
    }
    let seeky_cap = sched.producer_budget_cap(seeky, true).unwrap();
    assert!(seeky_cap < 12_288, "seeky cap {} never shrank", seeky_cap);
    assert!(seeky_cap >= sched.tunables().max_budget / 2);

    // A greedy sequential reader on the same device exhausts slice after
    // slice and walks its cap up to the device maximum.
    let sequential = ProducerId(2);
    let mut stream = Stream::new(2, 10_000, 100_000_000, 256);
    let gap = 1_280;
    for _ in 0..60 {
        stream.refill(&mut sched, 96, now);
        let batch = sched.dispatch(now, false);
        stream.pending -= batch.len() as u32;
        now = complete_batch(&mut sched, batch, now, gap);
    }
    let sequential_cap = sched.producer_budget_cap(sequential, true).unwrap();
    assert_eq!(sequential_cap, sched.tunables().max_budget);
    assert!(sequential_cap > seeky_cap);
}

#[test]
fn forced_dispatch_drains_everything_through_the_device_lock() {
    let dev = BfqDevice::new(Tunables::default());
    dev.with(|sched| {
        for i in 0..30u64 {
            let rq = Request::read(RequestId(i), ProducerId(1 + i % 3), i * 64, 8);
            sched.set_request(&rq);
            sched.add_request(rq, 0);
        }
    });
    let drained = dev.with(|sched| sched.dispatch(0, true));
    assert_eq!(drained.len(), 30);
    dev.with(|sched| {
        assert!(sched.queue_empty());
        assert_eq!(sched.busy_queue_count(), 0);
        assert_eq!(sched.active_queue(), None);
        for i in 0..30u64 {
            sched.completed_request(RequestId(i), 1_000);
            sched.put_request(RequestId(i));
        }
        sched.exit_queue();
    });
}
