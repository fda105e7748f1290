//! # Dispatch Controller
//!
//! The state machine that drives the scheduler forward. The block layer
//! calls in at three points: when a request is added, when the device asks
//! for work, and when a request completes. Between those calls the
//! controller decides whether the active queue keeps the device, expires,
//! or is idled on, and routes every pending request through the fair
//! queueing engine.
//!
//! All entry points expect the per-device lock to be held by the caller
//! (see [`crate::BfqDevice`]); time is passed in as a microsecond clock.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::entity::{EntityRef, GroupId, IoClass, IoPriority, QueueId, TreeKind};
use crate::ioctx::IoContext;
use crate::queue::{BfqQueue, PendingRequest, QueueFlags};
use crate::tunables::Tunables;
use crate::wf2q::BfqGroup;
use crate::{Direction, MayQueue, MergeReply, ProducerId, Request, RequestId, Sector, Service};

/// Think times below this (µs) count as immediate.
const MIN_TT: u64 = 2_000;

/// hw_tag detection: parallel-request threshold and samples needed.
const HW_QUEUE_THRESHOLD: u32 = 4;
const HW_QUEUE_SAMPLES: u32 = 32;

/// Why the active queue is being expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireReason {
    /// The idle window elapsed without a new request
    TooIdle,
    /// The slice deadline passed before the budget was consumed
    BudgetTimeout,
    /// The budget cannot cover the next request
    BudgetExhausted,
    /// The queue ran out of requests
    NoMoreRequests,
}

/// Per-device dispatch counters.
#[derive(Debug, Default, Clone)]
pub struct SchedulerStats {
    /// Requests submitted
    pub submitted: u64,
    /// Requests handed to the driver
    pub dispatched: u64,
    /// Requests completed
    pub completed: u64,
    /// Front merges performed
    pub merged: u64,
}

/// Scheduler-side annotation of a request (`set_request` .. `put_request`).
#[derive(Debug, Clone, Copy)]
struct RequestTag {
    queue: QueueId,
    write: bool,
}

/// A request handed to the driver and not yet released.
#[derive(Debug, Clone, Copy)]
struct InFlight {
    queue: QueueId,
    sync: bool,
    sector: Sector,
    sectors: u32,
    completed: bool,
}

/// Single-shot idle-slice timer, driven by the embedder's clock.
#[derive(Debug, Default)]
struct IdleTimer {
    deadline: Option<u64>,
}

impl IdleTimer {
    fn arm(&mut self, deadline: u64) {
        self.deadline = Some(deadline);
    }

    fn cancel(&mut self) {
        self.deadline = None;
    }

    fn pending(&self) -> bool {
        self.deadline.is_some()
    }
}

/// The scheduler state of one block device.
pub struct BfqScheduler {
    pub(crate) tunables: Tunables,
    pub(crate) queues: BTreeMap<QueueId, BfqQueue>,
    pub(crate) groups: BTreeMap<GroupId, BfqGroup>,
    pub(crate) contexts: BTreeMap<ProducerId, IoContext>,
    /// Request annotations, live from `set_request` to `put_request`
    rq_tags: BTreeMap<RequestId, RequestTag>,
    /// Requests handed out by `dispatch` and not yet released
    in_flight: BTreeMap<RequestId, InFlight>,

    pub(crate) busy_queues: u32,
    /// Pending requests across all queues
    queued: u32,
    /// Sync-queue requests currently at the driver
    sync_flight: u32,
    /// Driver-side submission counters: [async, sync]
    rq_in_driver: [u32; 2],

    active_queue: Option<QueueId>,
    /// Producer that opened the current slice
    active_producer: Option<ProducerId>,
    /// Last sector touched by the driver, for seek-cost scoring
    last_position: Sector,
    pub(crate) last_budget_start: u64,
    pub(crate) last_idling_start: u64,
    idle_timer: IdleTimer,
    /// A dispatch run should be scheduled (the "kick queue" work item)
    dispatch_pending: bool,

    // Peak-rate estimate (fixed point, sectors/µs)
    pub(crate) peak_rate: u64,
    pub(crate) peak_rate_samples: u32,

    // Tagged-queuing auto-detection
    hw_tag: bool,
    hw_tag_samples: u32,
    max_rq_in_driver: u32,

    next_queue_id: u64,
    pub(crate) next_group_id: u64,
    stats: SchedulerStats,
}

impl BfqScheduler {
    /// Creates the scheduler for one device, with the root group in place.
    pub fn new(tunables: Tunables) -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(GroupId::ROOT, BfqGroup::root());
        Self {
            tunables,
            queues: BTreeMap::new(),
            groups,
            contexts: BTreeMap::new(),
            rq_tags: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            busy_queues: 0,
            queued: 0,
            sync_flight: 0,
            rq_in_driver: [0; 2],
            active_queue: None,
            active_producer: None,
            last_position: 0,
            last_budget_start: 0,
            last_idling_start: 0,
            idle_timer: IdleTimer::default(),
            dispatch_pending: false,
            peak_rate: 0,
            peak_rate_samples: 0,
            // Assume tagged queuing until the detector says otherwise.
            hw_tag: true,
            hw_tag_samples: 0,
            max_rq_in_driver: 0,
            next_queue_id: 1,
            next_group_id: 1,
            stats: SchedulerStats::default(),
        }
    }

    // =========================================================================
    // Producer contexts and queue lookup
    // =========================================================================

    fn ensure_context(&mut self, producer: ProducerId) {
        self.contexts
            .entry(producer)
            .or_insert_with(|| IoContext::new(producer, GroupId::ROOT));
    }

    /// The queue currently associated with a (producer, sync) pair.
    pub fn queue_of_producer(&self, producer: ProducerId, sync: bool) -> Option<QueueId> {
        self.contexts.get(&producer)?.queue[sync as usize]
    }

    /// Re-grades a producer's I/O priority. The sync queue is re-graded at
    /// its next activation; the async association is re-resolved on the next
    /// request.
    pub fn set_io_priority(&mut self, producer: ProducerId, prio: IoPriority) {
        self.ensure_context(producer);
        let ctx = self.contexts.get_mut(&producer).expect("context just ensured");
        ctx.prio = prio;
        let async_link = ctx.queue[0].take();
        let sync_link = ctx.queue[1];
        if let Some(qid) = async_link {
            self.put_queue_ref(qid);
        }
        if let Some(qid) = sync_link {
            if let Some(q) = self.queues.get_mut(&qid) {
                q.flags.insert(QueueFlags::PRIO_CHANGED);
            }
        }
    }

    /// Records how many live tasks stand behind a producer; zero disables
    /// idling on its queues.
    pub fn set_producer_tasks(&mut self, producer: ProducerId, tasks: u32) {
        self.ensure_context(producer);
        if let Some(ctx) = self.contexts.get_mut(&producer) {
            ctx.tasks = tasks;
        }
    }

    /// Schedules a producer's future queues under `group`.
    pub fn assign_producer_to_group(&mut self, producer: ProducerId, group: GroupId) {
        self.ensure_context(producer);
        if self.groups.contains_key(&group) {
            if let Some(ctx) = self.contexts.get_mut(&producer) {
                ctx.group = group;
            }
        }
    }

    /// Finds or creates the queue for a (producer, sync) pair. Async queues
    /// are shared per (group, class, level) and pinned by the group.
    fn get_queue(&mut self, producer: ProducerId, sync: bool) -> QueueId {
        self.ensure_context(producer);
        if let Some(qid) = self.contexts[&producer].queue[sync as usize] {
            return qid;
        }
        let (group, prio) = {
            let ctx = &self.contexts[&producer];
            (ctx.group, ctx.prio)
        };

        let qid = if sync {
            self.create_queue(producer, group, prio, true)
        } else {
            let slot = *self
                .groups
                .get_mut(&group)
                .expect("context points at missing group")
                .async_slot(prio);
            match slot {
                Some(qid) => qid,
                None => {
                    let qid = self.create_queue(producer, group, prio, false);
                    // The group pins its shared async queue until teardown.
                    *self
                        .groups
                        .get_mut(&group)
                        .expect("context points at missing group")
                        .async_slot(prio) = Some(qid);
                    self.queues.get_mut(&qid).expect("queue just created").refcount += 1;
                    qid
                }
            }
        };

        // The context link holds its own reference.
        self.queues.get_mut(&qid).expect("queue lookup raced").refcount += 1;
        self.contexts
            .get_mut(&producer)
            .expect("context just ensured")
            .queue[sync as usize] = Some(qid);
        qid
    }

    fn create_queue(
        &mut self,
        producer: ProducerId,
        group: GroupId,
        prio: IoPriority,
        sync: bool,
    ) -> QueueId {
        let qid = QueueId(self.next_queue_id);
        self.next_queue_id += 1;
        let mut queue = BfqQueue::new(qid, producer, group, prio, sync);
        queue.max_budget = self.default_budget_for(0);
        if sync && prio.class != IoClass::Idle {
            queue.flags.insert(QueueFlags::IDLE_WINDOW);
        }
        self.queues.insert(qid, queue);
        self.init_prio_data(qid);
        log::debug!("bfq: queue {:?} allocated (sync={})", qid, sync);
        qid
    }

    /// Applies a pending priority re-grade from the producer context. The
    /// new values take effect at the queue's next (re)activation.
    fn init_prio_data(&mut self, qid: QueueId) {
        let (changed, producer) = {
            let q = &self.queues[&qid];
            (q.flags.contains(QueueFlags::PRIO_CHANGED), q.producer)
        };
        if !changed {
            return;
        }
        let mut prio = self
            .contexts
            .get(&producer)
            .map(|ctx| ctx.prio)
            .unwrap_or_default();
        if prio.class == IoClass::Idle {
            prio = IoPriority::new(IoClass::Idle, 7);
        }
        let q = self.queues.get_mut(&qid).expect("prio update of missing queue");
        q.entity.new_prio = prio;
        q.entity.prio_changed = true;
        if prio.class == IoClass::Idle {
            q.flags.remove(QueueFlags::IDLE_WINDOW);
        }
        q.flags.remove(QueueFlags::PRIO_CHANGED);
    }

    /// Drops one queue reference, freeing the queue at zero.
    fn put_queue_ref(&mut self, qid: QueueId) {
        let q = self.queues.get_mut(&qid).expect("put of missing queue");
        debug_assert!(q.refcount > 0);
        q.refcount -= 1;
        if q.refcount > 0 {
            return;
        }
        // The last holder may be gone before the class clock caught up with
        // the queue's finish time; unpark it from the idle tree first.
        if q.entity.tree == Some(TreeKind::Idle) {
            self.deactivate_entity(EntityRef::Queue(qid), false);
        }
        let q = self.queues.get_mut(&qid).expect("put of missing queue");
        debug_assert!(q.pending.is_empty());
        debug_assert!(!q.is_busy());
        debug_assert_eq!(q.entity.tree, None);
        debug_assert_eq!(q.allocated, [0, 0]);
        debug_assert_ne!(self.active_queue, Some(qid));
        self.queues.remove(&qid);
        log::debug!("bfq: queue {:?} freed", qid);
    }

    /// Detaches a queue whose producer is going away.
    fn exit_queue_ref(&mut self, qid: QueueId) {
        if self.active_queue == Some(qid) {
            self.expire_active(qid);
            self.schedule_dispatch();
        }
        self.put_queue_ref(qid);
    }

    /// Releases a producer context and the queue links it holds.
    pub fn exit_producer(&mut self, producer: ProducerId) {
        let Some(ctx) = self.contexts.remove(&producer) else {
            return;
        };
        for link in ctx.queue.into_iter().flatten() {
            self.exit_queue_ref(link);
        }
    }

    // =========================================================================
    // Elevator operations
    // =========================================================================

    /// Probes the producer's queue for a request ending exactly where the
    /// incoming bio begins, i.e. a front-merge candidate.
    pub fn merge(&self, producer: ProducerId, sync: bool, sector: Sector) -> MergeReply {
        let Some(qid) = self.queue_of_producer(producer, sync) else {
            return MergeReply::NoMerge;
        };
        match self.queues.get(&qid).and_then(|q| q.find_by_sector(sector)) {
            Some(id) => MergeReply::FrontMerge(id),
            None => MergeReply::NoMerge,
        }
    }

    /// Whether a bio from `producer` may merge into `rq_id`: never sync
    /// into async, and never across queues.
    pub fn allow_merge(&self, rq_id: RequestId, producer: ProducerId, sync: bool) -> bool {
        let Some(tag) = self.rq_tags.get(&rq_id) else {
            return false;
        };
        let Some(rq_sync) = self
            .queues
            .get(&tag.queue)
            .and_then(|q| q.request(rq_id))
            .map(|rq| rq.sync)
        else {
            return false;
        };
        if sync && !rq_sync {
            return false;
        }
        self.queue_of_producer(producer, sync) == Some(tag.queue)
    }

    /// A front merge grew `rq_id`: re-sorts it and refreshes the queue's
    /// next-request choice.
    pub fn merged_request(&mut self, rq_id: RequestId, new_sector: Sector, new_sectors: u32) {
        let Some(&tag) = self.rq_tags.get(&rq_id) else {
            return;
        };
        let qid = tag.queue;
        {
            let q = self.queues.get_mut(&qid).expect("merge into missing queue");
            q.reposition(rq_id, new_sector, new_sectors);
        }
        let next = {
            let q = &self.queues[&qid];
            self.choose_req(qid, q.next_rq, Some(rq_id))
        };
        self.queues.get_mut(&qid).expect("merge into missing queue").next_rq = next;
        self.updated_next_req(qid);
        self.stats.merged += 1;
    }

    /// `next_id` was merged into `rq_id`: the surviving request inherits the
    /// earlier FIFO deadline and the absorbed one leaves the scheduler.
    pub fn merged_requests(&mut self, rq_id: RequestId, next_id: RequestId) {
        let (Some(&tag), Some(&next_tag)) = (self.rq_tags.get(&rq_id), self.rq_tags.get(&next_id))
        else {
            return;
        };
        debug_assert_eq!(tag.queue, next_tag.queue);
        let qid = tag.queue;

        let deadlines = {
            let q = &self.queues[&qid];
            match (q.pending.get(&rq_id), q.pending.get(&next_id)) {
                (Some(a), Some(b)) => Some((a.fifo_deadline, b.fifo_deadline)),
                _ => None,
            }
        };
        if let Some((rq_deadline, next_deadline)) = deadlines {
            if next_deadline < rq_deadline {
                let q = self.queues.get_mut(&qid).expect("merge in missing queue");
                // Take over the absorbed request's FIFO slot as well.
                if let (Some(old_pos), Some(next_pos)) = (
                    q.fifo.iter().position(|&r| r == rq_id),
                    q.fifo.iter().position(|&r| r == next_id),
                ) {
                    q.fifo.remove(old_pos);
                    let next_pos = if old_pos < next_pos { next_pos - 1 } else { next_pos };
                    q.fifo.insert(next_pos, rq_id);
                }
                if let Some(p) = q.pending.get_mut(&rq_id) {
                    p.fifo_deadline = next_deadline;
                }
            }
        }
        self.remove_request(qid, next_id);
    }

    /// Annotates a request with its queue before it enters the scheduler,
    /// creating context and queue on demand.
    pub fn set_request(&mut self, request: &Request) {
        if self.rq_tags.contains_key(&request.id) {
            return;
        }
        let qid = self.get_queue(request.producer, request.sync);
        let write = matches!(request.direction, Direction::Write);
        let q = self.queues.get_mut(&qid).expect("annotating missing queue");
        q.allocated[write as usize] += 1;
        q.refcount += 1;
        self.rq_tags.insert(request.id, RequestTag { queue: qid, write });
    }

    /// Releases a request's scheduler annotation and queue reference.
    pub fn put_request(&mut self, rq_id: RequestId) {
        let Some(tag) = self.rq_tags.remove(&rq_id) else {
            return;
        };
        self.in_flight.remove(&rq_id);
        // A request abandoned while still pending leaves the queue first.
        if self
            .queues
            .get(&tag.queue)
            .map_or(false, |q| q.pending.contains_key(&rq_id))
        {
            self.remove_request(tag.queue, rq_id);
        }
        if let Some(q) = self.queues.get_mut(&tag.queue) {
            q.allocated[tag.write as usize] =
                q.allocated[tag.write as usize].saturating_sub(1);
        }
        self.put_queue_ref(tag.queue);
    }

    /// May the block layer queue another request for this producer?
    ///
    /// `Must` is returned only when the scheduler is idling in wait of
    /// exactly this request.
    pub fn may_queue(&mut self, producer: ProducerId, sync: bool) -> MayQueue {
        let Some(qid) = self.queue_of_producer(producer, sync) else {
            return MayQueue::May;
        };
        self.init_prio_data(qid);
        let q = self.queues.get_mut(&qid).expect("may_queue on missing queue");
        if q.flags.contains(QueueFlags::WAIT_REQUEST) && q.flags.contains(QueueFlags::MUST_ALLOC) {
            q.flags.remove(QueueFlags::MUST_ALLOC);
            return MayQueue::Must;
        }
        MayQueue::May
    }

    /// Routes a new request into its producer queue.
    pub fn add_request(&mut self, request: Request, now: u64) {
        let id = request.id;
        let producer = request.producer;
        let sync = request.sync;
        let sector = request.sector;
        let sectors = request.sectors;

        if !self.rq_tags.contains_key(&id) {
            self.set_request(&request);
        }
        let qid = self.rq_tags[&id].queue;
        self.init_prio_data(qid);

        let deadline = now + self.tunables.fifo_expire(sync);
        self.queues
            .get_mut(&qid)
            .expect("add to missing queue")
            .insert(request, deadline);
        self.queued += 1;
        self.stats.submitted += 1;

        let next = {
            let q = &self.queues[&qid];
            self.choose_req(qid, q.next_rq, Some(id))
        };
        let was_busy = {
            let q = self.queues.get_mut(&qid).expect("add to missing queue");
            q.next_rq = next;
            q.is_busy()
        };
        if was_busy {
            self.updated_next_req(qid);
        } else {
            let budget = {
                let q = &self.queues[&qid];
                let head = q
                    .next_rq
                    .and_then(|r| q.request(r))
                    .map(|rq| rq.sectors as Service)
                    .unwrap_or(0);
                q.max_budget.max(head)
            };
            self.queues.get_mut(&qid).expect("add to missing queue").entity.budget = budget;
            self.add_busy_queue(qid);
        }

        // Proximity statistics feed the idling heuristics.
        let slice_idle = self.tunables.slice_idle;
        if let Some(ctx) = self.contexts.get_mut(&producer) {
            ctx.update_think_time(now, slice_idle);
            ctx.update_seek(sector);
        }
        self.update_idle_window(qid);
        if let Some(ctx) = self.contexts.get_mut(&producer) {
            ctx.last_request_pos = sector + sectors as Sector;
        }

        if self.active_queue == Some(qid)
            && self.queues[&qid].flags.contains(QueueFlags::WAIT_REQUEST)
        {
            // The request we were idling for arrived: stop the timer and
            // get the device going again right away.
            self.queues
                .get_mut(&qid)
                .expect("add to missing queue")
                .flags
                .remove(QueueFlags::WAIT_REQUEST);
            self.idle_timer.cancel();
            self.dispatch_pending = true;
        }
    }

    /// The driver started working on a dispatched request.
    pub fn activate_request(&mut self, rq_id: RequestId) {
        let Some(fl) = self.in_flight.get(&rq_id) else {
            return;
        };
        self.rq_in_driver[fl.sync as usize] += 1;
        self.last_position = fl.sector + fl.sectors as Sector;
    }

    /// The driver handed a request back without completing it.
    pub fn deactivate_request(&mut self, rq_id: RequestId) {
        let Some(fl) = self.in_flight.get(&rq_id) else {
            return;
        };
        let sync = fl.sync as usize;
        debug_assert!(self.rq_in_driver[sync] > 0);
        self.rq_in_driver[sync] = self.rq_in_driver[sync].saturating_sub(1);
    }

    /// Sort-order predecessor of a pending request.
    pub fn former_request(&self, rq_id: RequestId) -> Option<RequestId> {
        let tag = self.rq_tags.get(&rq_id)?;
        self.queues.get(&tag.queue)?.former(rq_id)
    }

    /// Sort-order successor of a pending request.
    pub fn latter_request(&self, rq_id: RequestId) -> Option<RequestId> {
        let tag = self.rq_tags.get(&rq_id)?;
        self.queues.get(&tag.queue)?.latter(rq_id)
    }

    /// Whether the scheduler holds no pending requests.
    pub fn queue_empty(&self) -> bool {
        self.queued == 0
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Hands pending requests to the driver. With `force`, drains every
    /// backlogged queue (barriers, scheduler switch).
    pub fn dispatch(&mut self, now: u64, force: bool) -> Vec<Request> {
        let mut out = Vec::new();
        if self.busy_queues == 0 {
            return out;
        }
        if force {
            self.forced_dispatch(&mut out);
            return out;
        }

        while let Some(qid) = self.select_queue(now) {
            let (sync, idle_class, in_driver, idle_window) = {
                let q = &self.queues[&qid];
                (
                    q.is_sync(),
                    q.entity.prio.class == IoClass::Idle,
                    q.dispatched,
                    q.has_idle_window(),
                )
            };
            let mut max_dispatch = self.tunables.quantum;
            if idle_class {
                max_dispatch = 1;
            }
            if !sync {
                max_dispatch = self.tunables.max_budget_async_rq;
            }

            if in_driver >= max_dispatch {
                if self.busy_queues > 1 {
                    break;
                }
                if in_driver >= 4 * max_dispatch {
                    break;
                }
            }

            // Let async writes drain before serving a queue we may idle on,
            // or the idle window measures the writes instead of the producer.
            if idle_window && self.rq_in_driver[0] > 0 {
                break;
            }
            if self.sync_flight > 0 && !sync {
                break;
            }

            self.queues
                .get_mut(&qid)
                .expect("dispatch from missing queue")
                .flags
                .remove(QueueFlags::WAIT_REQUEST);
            debug_assert!(!self.idle_timer.pending());

            self.dispatch_from_queue(qid, max_dispatch, now, &mut out);
        }

        log::debug!("bfq: dispatched={}", out.len());
        out
    }

    /// Drains the selected queue up to `max_dispatch` requests, charging its
    /// budget as it goes.
    fn dispatch_from_queue(
        &mut self,
        qid: QueueId,
        max_dispatch: u32,
        now: u64,
        out: &mut Vec<Request>,
    ) -> u32 {
        debug_assert!(!self.queues[&qid].sort_is_empty());
        let mut dispatched = 0;

        loop {
            // Follow the expired FIFO path, else best proximity.
            let rq_id = match self
                .queues
                .get_mut(&qid)
                .expect("dispatch from missing queue")
                .check_fifo(now)
            {
                Some(id) => id,
                None => match self.queues[&qid].next_rq {
                    Some(id) => id,
                    None => break,
                },
            };
            let sectors = self.queues[&qid]
                .request(rq_id)
                .map(|rq| rq.sectors as Service)
                .unwrap_or(0);

            if sectors > self.queues[&qid].budget_left() {
                // Make sure the recalculated budget covers this request,
                // even when it came off the FIFO path.
                self.queues
                    .get_mut(&qid)
                    .expect("dispatch from missing queue")
                    .next_rq = Some(rq_id);
                self.expire(qid, false, ExpireReason::BudgetExhausted, now);
                return dispatched;
            }

            self.charge_service(qid, sectors);
            self.dispatch_insert(qid, rq_id, out);
            dispatched += 1;

            if self.queues[&qid].sort_is_empty() {
                break;
            }
            if dispatched >= max_dispatch {
                break;
            }
        }

        let (sync, idle_class) = {
            let q = &self.queues[&qid];
            (q.is_sync(), q.entity.prio.class == IoClass::Idle)
        };
        if self.busy_queues > 1
            && ((!sync && dispatched >= self.tunables.max_budget_async_rq) || idle_class)
        {
            self.expire(qid, false, ExpireReason::BudgetExhausted, now);
        }
        dispatched
    }

    /// Moves one request from its queue to the driver.
    fn dispatch_insert(&mut self, qid: QueueId, rq_id: RequestId, out: &mut Vec<Request>) {
        let (prev, next) = self.queues[&qid].neighbors(rq_id);
        let new_next = self.choose_req(qid, next, prev);
        self.queues
            .get_mut(&qid)
            .expect("dispatch from missing queue")
            .next_rq = new_next;

        let pending = self
            .remove_request(qid, rq_id)
            .expect("dispatch of request not in queue");
        let sync_queue = {
            let q = self.queues.get_mut(&qid).expect("dispatch from missing queue");
            q.dispatched += 1;
            q.total_service += pending.request.sectors as Service;
            q.is_sync()
        };
        if sync_queue {
            self.sync_flight += 1;
        }

        let rq = pending.request;
        self.in_flight.insert(
            rq.id,
            InFlight {
                queue: qid,
                sync: rq.sync,
                sector: rq.sector,
                sectors: rq.sectors,
                completed: false,
            },
        );
        if self.active_producer.is_none() && self.active_queue == Some(qid) {
            self.active_producer = Some(rq.producer);
        }
        self.stats.dispatched += 1;
        out.push(rq);
    }

    /// Barrier path: expire the active queue, then flush every backlogged
    /// queue in one pass, resetting budgets and pruning idle trees.
    fn forced_dispatch(&mut self, out: &mut Vec<Request>) {
        if let Some(qid) = self.active_queue {
            self.expire_active(qid);
        }

        let busy: Vec<QueueId> = self
            .queues
            .iter()
            .filter(|(_, q)| q.is_busy())
            .map(|(&id, _)| id)
            .collect();
        for qid in busy {
            while let Some(next) = self.queues[&qid].next_rq {
                self.dispatch_insert(qid, next, out);
            }
            debug_assert!(self.queues[&qid].fifo.is_empty());

            let assigned = self.queues[&qid].budgets_assigned;
            let default = self.default_budget_for(assigned);
            let (parent, class) = {
                let q = self.queues.get_mut(&qid).expect("forced dispatch of missing queue");
                q.max_budget = default;
                (q.entity.parent, q.entity.prio.class.index())
            };
            self.forget_idle(parent, class);
        }
        debug_assert_eq!(self.busy_queues, 0);
    }

    /// Checks whether the active queue keeps the device, expires it if not,
    /// and picks a successor.
    fn select_queue(&mut self, now: u64) -> Option<QueueId> {
        let Some(qid) = self.active_queue else {
            return self.set_active_queue();
        };

        if self.queues[&qid].budget_timed_out(now) {
            self.expire(qid, false, ExpireReason::BudgetTimeout, now);
            return self.set_active_queue();
        }

        match self.queues[&qid].next_rq {
            Some(next) => {
                let sectors = self.queues[&qid]
                    .request(next)
                    .map(|rq| rq.sectors as Service)
                    .unwrap_or(0);
                if sectors > self.queues[&qid].budget_left() {
                    self.expire(qid, false, ExpireReason::BudgetExhausted, now);
                    self.set_active_queue()
                } else {
                    Some(qid)
                }
            }
            None => {
                // No requests pending. Let in-flight completions or the idle
                // timer decide before moving on.
                let q = &self.queues[&qid];
                if self.idle_timer.pending() || (q.dispatched > 0 && q.has_idle_window()) {
                    None
                } else {
                    self.expire(qid, false, ExpireReason::NoMoreRequests, now);
                    self.set_active_queue()
                }
            }
        }
    }

    /// Picks a new active queue from the hierarchy.
    fn set_active_queue(&mut self) -> Option<QueueId> {
        let qid = self.next_queue();
        if let Some(qid) = qid {
            let q = self.queues.get_mut(&qid).expect("selected queue vanished");
            q.flags.insert(QueueFlags::MUST_ALLOC | QueueFlags::BUDGET_NEW);
            q.flags.remove(QueueFlags::FIFO_EXPIRE);
            q.budgets_assigned = (q.budgets_assigned * 7 + 256) / 8;
            log::debug!("bfq: queue {:?} active", qid);
        }
        self.active_queue = qid;
        qid
    }

    /// Clears the active-queue state and cancels the idle timer.
    fn reset_active(&mut self) {
        self.active_queue = None;
        self.active_producer = None;
        self.idle_timer.cancel();
    }

    /// Expires the active queue: re-queues it if backlogged, parks it
    /// otherwise. Feedback-free inner step shared by all expiration paths.
    fn expire_active(&mut self, qid: QueueId) {
        debug_assert_eq!(self.active_queue, Some(qid));
        self.reset_active();
        self.queues
            .get_mut(&qid)
            .expect("expire of missing queue")
            .flags
            .remove(QueueFlags::WAIT_REQUEST);
        if self.queues[&qid].sort_is_empty() {
            self.del_busy_queue(qid, true);
        } else {
            self.activate_queue(qid);
        }
    }

    /// Full expiration: measures the slice, applies the budget feedback and
    /// releases the device.
    ///
    /// Slow traffic expiring as `TooIdle` is re-labelled `BudgetTimeout` and
    /// charged its full budget, so seeky queues cannot accumulate advantage
    /// through small virtual-finish stamps.
    pub(crate) fn expire(
        &mut self,
        qid: QueueId,
        compensate: bool,
        mut reason: ExpireReason,
        now: u64,
    ) {
        let slow = self.update_peak_rate(qid, compensate, now);

        if slow && reason == ExpireReason::TooIdle {
            reason = ExpireReason::BudgetTimeout;
        }
        if reason == ExpireReason::BudgetTimeout || !self.queues[&qid].is_sync() {
            self.queues
                .get_mut(&qid)
                .expect("expire of missing queue")
                .charge_full_budget();
        }

        log::debug!("bfq: queue {:?} expire ({:?}, slow={})", qid, reason, slow);

        self.recalc_budget(qid, reason);
        self.expire_active(qid);
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Accounts a completed request and decides whether to idle, expire, or
    /// kick the queue.
    pub fn completed_request(&mut self, rq_id: RequestId, now: u64) {
        let Some(fl) = self.in_flight.get_mut(&rq_id) else {
            return;
        };
        if fl.completed {
            return;
        }
        fl.completed = true;
        let (qid, rq_sync) = (fl.queue, fl.sync);

        self.update_hw_tag();

        self.rq_in_driver[rq_sync as usize] =
            self.rq_in_driver[rq_sync as usize].saturating_sub(1);
        let (sync_queue, producer) = {
            let q = self.queues.get_mut(&qid).expect("completion for missing queue");
            debug_assert!(q.dispatched > 0);
            q.dispatched = q.dispatched.saturating_sub(1);
            (q.is_sync(), q.producer)
        };
        if sync_queue {
            self.sync_flight = self.sync_flight.saturating_sub(1);
        }
        if rq_sync {
            if let Some(ctx) = self.contexts.get_mut(&producer) {
                ctx.last_end_request = now;
            }
        }
        self.stats.completed += 1;

        if self.active_queue == Some(qid) {
            if self.queues[&qid].flags.contains(QueueFlags::BUDGET_NEW) {
                self.set_budget_timeout(now);
            }

            if self.queues[&qid].budget_timed_out(now) {
                self.expire(qid, false, ExpireReason::BudgetTimeout, now);
            } else if rq_sync && self.rq_in_driver() == 0 && self.queues[&qid].sort_is_empty() {
                self.arm_slice_timer(now);
            }
        }

        if self.rq_in_driver() == 0 {
            self.schedule_dispatch();
        }
    }

    fn rq_in_driver(&self) -> u32 {
        self.rq_in_driver[0] + self.rq_in_driver[1]
    }

    /// Tagged-queuing detection: the device counts as queuing once the
    /// running maximum of in-driver requests clears the threshold over a
    /// full sample window.
    fn update_hw_tag(&mut self) {
        let in_driver = self.rq_in_driver();
        self.max_rq_in_driver = self.max_rq_in_driver.max(in_driver);

        // Only count samples taken under enough load to allow queueing.
        if in_driver + self.queued < HW_QUEUE_THRESHOLD {
            return;
        }
        self.hw_tag_samples += 1;
        if self.hw_tag_samples <= HW_QUEUE_SAMPLES {
            return;
        }

        self.hw_tag = self.max_rq_in_driver > HW_QUEUE_THRESHOLD;
        self.max_rq_in_driver = 0;
        self.hw_tag_samples = 0;
    }

    /// Stamps the slice deadline at the first completion of the slice.
    fn set_budget_timeout(&mut self, now: u64) {
        let Some(qid) = self.active_queue else {
            return;
        };
        self.last_budget_start = now;
        let sync = self.queues[&qid].is_sync();
        let timeout = self.tunables.timeout(sync);
        let q = self.queues.get_mut(&qid).expect("timeout stamp on missing queue");
        q.flags.remove(QueueFlags::BUDGET_NEW);
        q.budget_timeout = now + timeout;
    }

    // =========================================================================
    // Idling
    // =========================================================================

    /// Arms the idle-slice timer for the (empty) active queue, so the next
    /// request of the same producer finds the device still dedicated to it.
    fn arm_slice_timer(&mut self, now: u64) {
        let Some(qid) = self.active_queue else {
            return;
        };
        debug_assert!(self.queues[&qid].sort_is_empty());

        // Idling disabled, by tunable or by the queue's history.
        if self.tunables.slice_idle == 0 || !self.queues[&qid].has_idle_window() {
            return;
        }
        // The producer's tasks have exited; nothing will arrive.
        let seeky = match self.active_producer.and_then(|p| self.contexts.get(&p)) {
            Some(ctx) if ctx.tasks > 0 => ctx.seek_valid() && ctx.seeky(),
            _ => return,
        };

        self.queues
            .get_mut(&qid)
            .expect("idling on missing queue")
            .flags
            .insert(QueueFlags::WAIT_REQUEST);

        // Seeks are not worth idling on for long, but a validated seeky
        // producer still gets a moment to submit back-to-back requests.
        let mut sl = self.tunables.slice_idle;
        if seeky {
            sl = sl.min(MIN_TT);
        }
        self.last_idling_start = now;
        self.idle_timer.arm(now + sl);
        log::debug!("bfq: arm idle {}us", sl);
    }

    /// Re-evaluates a queue's idle window from the producer's think-time
    /// and seek history.
    fn update_idle_window(&mut self, qid: QueueId) {
        let (sync, idle_class, producer, mut enable) = {
            let q = &self.queues[&qid];
            (
                q.is_sync(),
                q.entity.prio.class == IoClass::Idle,
                q.producer,
                q.has_idle_window(),
            )
        };
        // Never idle for async or idle-class queues.
        if !sync || idle_class {
            return;
        }
        let Some(ctx) = self.contexts.get(&producer) else {
            return;
        };

        if ctx.tasks == 0
            || self.tunables.slice_idle == 0
            || (!self.tunables.desktop && self.hw_tag && ctx.seeky())
        {
            enable = false;
        } else if ctx.ttime_valid() {
            let threshold = if ctx.seek_valid() && ctx.seeky() {
                MIN_TT
            } else {
                self.tunables.slice_idle
            };
            enable = ctx.ttime_mean <= threshold;
        }

        let q = self.queues.get_mut(&qid).expect("idle window of missing queue");
        if enable {
            q.flags.insert(QueueFlags::IDLE_WINDOW);
        } else {
            q.flags.remove(QueueFlags::IDLE_WINDOW);
        }
        log::trace!("bfq: queue {:?} idle_window={}", qid, enable);
    }

    /// The idle-slice timer fired.
    ///
    /// The active queue is re-read under the lock: if it changed or went
    /// away while the timer was in flight, this is a no-op.
    pub fn idle_timer_fired(&mut self, now: u64) {
        self.idle_timer.cancel();
        log::debug!("bfq: slice timer expired");

        if let Some(qid) = self.active_queue {
            let reason = if self.queues[&qid].budget_timed_out(now) {
                ExpireReason::BudgetTimeout
            } else {
                ExpireReason::TooIdle
            };
            self.expire(qid, true, reason, now);
        }
        self.schedule_dispatch();
    }

    /// Absolute deadline the embedder should fire [`Self::idle_timer_fired`]
    /// at, if the timer is armed.
    pub fn idle_timer_deadline(&self) -> Option<u64> {
        self.idle_timer.deadline
    }

    /// Requests a dispatch run if work is pending.
    fn schedule_dispatch(&mut self) {
        if self.queued != 0 {
            log::debug!("bfq: schedule dispatch");
            self.dispatch_pending = true;
        }
    }

    /// Drains the pending-dispatch hint; the embedder should call
    /// [`Self::dispatch`] when this returns true.
    pub fn take_dispatch_request(&mut self) -> bool {
        core::mem::take(&mut self.dispatch_pending)
    }

    // =========================================================================
    // Request bookkeeping
    // =========================================================================

    /// Removes a pending request, keeping the queue's next-request choice
    /// and busy state consistent.
    fn remove_request(&mut self, qid: QueueId, rq_id: RequestId) -> Option<PendingRequest> {
        if self.queues.get(&qid)?.next_rq == Some(rq_id) {
            let (prev, next) = self.queues[&qid].neighbors(rq_id);
            let new_next = self.choose_req(qid, next, prev);
            self.queues.get_mut(&qid)?.next_rq = new_next;
            self.updated_next_req(qid);
        }

        let pending = self.queues.get_mut(&qid)?.remove(rq_id)?;
        self.queued -= 1;

        let q = &self.queues[&qid];
        if q.is_busy() && self.active_queue != Some(qid) && q.sort_is_empty() {
            self.del_busy_queue(qid, true);
        }
        Some(pending)
    }

    /// The queue's head request changed: grow its budget to fit, so the
    /// request does not need two dispatch rounds. Budgets of the queue in
    /// service are never changed, to keep the guarantees intact.
    fn updated_next_req(&mut self, qid: QueueId) {
        let (busy, next, max_budget) = {
            let q = &self.queues[&qid];
            (q.is_busy(), q.next_rq, q.max_budget)
        };
        if !busy || self.active_queue == Some(qid) {
            return;
        }
        let Some(next) = next else {
            return;
        };
        let sectors = self.queues[&qid]
            .request(next)
            .map(|rq| rq.sectors as Service)
            .unwrap_or(0);
        let new_budget = max_budget.max(sectors);
        if self.queues[&qid].entity.budget == new_budget {
            return;
        }
        self.queues.get_mut(&qid).expect("budget of missing queue").entity.budget = new_budget;
        log::debug!("bfq: queue {:?} budget={}", qid, new_budget);
        self.activate_queue(qid);
    }

    /// Elevator proximity rule: which of two pending requests is better
    /// served from the current head position.
    ///
    /// Sync beats async and metadata beats data; otherwise the shorter
    /// distance wins, counting backward seeks at a penalty and only within
    /// the backward window. Requests behind that window are "wrapped":
    /// they lose to any unwrapped request, and between two wrapped ones the
    /// smaller sector wins (a single long back seek).
    fn choose_req(
        &self,
        qid: QueueId,
        r1: Option<RequestId>,
        r2: Option<RequestId>,
    ) -> Option<RequestId> {
        let q = &self.queues[&qid];
        let (id1, id2) = match (r1, r2) {
            (None, None) => return None,
            (Some(a), None) => return Some(a),
            (None, Some(b)) => return Some(b),
            (Some(a), Some(b)) if a == b => return Some(b),
            (Some(a), Some(b)) => (a, b),
        };
        let (rq1, rq2) = match (q.request(id1), q.request(id2)) {
            (Some(a), Some(b)) => (a, b),
            (Some(_), None) => return Some(id1),
            (None, Some(_)) => return Some(id2),
            (None, None) => return None,
        };

        if rq1.sync && !rq2.sync {
            return Some(id1);
        }
        if rq2.sync && !rq1.sync {
            return Some(id2);
        }
        if rq1.meta && !rq2.meta {
            return Some(id1);
        }
        if rq2.meta && !rq1.meta {
            return Some(id2);
        }

        let last = self.last_position;
        let back_max = self.tunables.back_seek_max_sectors();
        let penalty = self.tunables.back_seek_penalty as u64;
        let (s1, s2) = (rq1.sector, rq2.sector);

        let mut d1 = 0;
        let mut d2 = 0;
        let mut wrap1 = false;
        let mut wrap2 = false;

        if s1 >= last {
            d1 = s1 - last;
        } else if s1 + back_max >= last {
            d1 = (last - s1) * penalty;
        } else {
            wrap1 = true;
        }
        if s2 >= last {
            d2 = s2 - last;
        } else if s2 + back_max >= last {
            d2 = (last - s2) * penalty;
        } else {
            wrap2 = true;
        }

        let winner = match (wrap1, wrap2) {
            (false, false) => {
                if d1 < d2 {
                    id1
                } else if d2 < d1 {
                    id2
                } else if s1 >= s2 {
                    id1
                } else {
                    id2
                }
            }
            (false, true) => id1,
            (true, false) => id2,
            (true, true) => {
                if s1 <= s2 {
                    id1
                } else {
                    id2
                }
            }
        };
        Some(winner)
    }

    // =========================================================================
    // Accessors and teardown
    // =========================================================================

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn tunables_mut(&mut self) -> &mut Tunables {
        &mut self.tunables
    }

    pub fn active_queue(&self) -> Option<QueueId> {
        self.active_queue
    }

    pub fn busy_queue_count(&self) -> u32 {
        self.busy_queues
    }

    /// Cumulative sectors dispatched on behalf of a (producer, sync) pair.
    pub fn producer_service(&self, producer: ProducerId, sync: bool) -> Option<Service> {
        let qid = self.queue_of_producer(producer, sync)?;
        Some(self.queues.get(&qid)?.total_service)
    }

    /// Current adaptive budget cap of a (producer, sync) pair's queue.
    pub fn producer_budget_cap(&self, producer: ProducerId, sync: bool) -> Option<Service> {
        let qid = self.queue_of_producer(producer, sync)?;
        Some(self.queues.get(&qid)?.max_budget)
    }

    /// Tears the scheduler down: cancels timers and pending kicks, exits
    /// every producer context, unparks idle entities and releases the
    /// group-pinned async queues (reparented to the root group first).
    pub fn exit_queue(&mut self) {
        self.idle_timer.cancel();
        self.dispatch_pending = false;

        let producers: Vec<ProducerId> = self.contexts.keys().copied().collect();
        for producer in producers {
            self.exit_producer(producer);
        }
        debug_assert!(self.active_queue.is_none());

        let parked: Vec<QueueId> = self
            .queues
            .iter()
            .filter(|(_, q)| q.entity.tree == Some(TreeKind::Idle))
            .map(|(&id, _)| id)
            .collect();
        for qid in parked {
            self.deactivate_entity(EntityRef::Queue(qid), false);
        }

        let gids: Vec<GroupId> = self.groups.keys().copied().collect();
        for gid in gids {
            self.put_async_queues(gid);
        }
        debug_assert!(!self.idle_timer.pending());
    }

    /// Releases a group's pinned async queues. Queues that still hold
    /// requests are reparented to the root group, the only group certain to
    /// outlive every request on the device.
    fn put_async_queues(&mut self, gid: GroupId) {
        let mut pinned: Vec<QueueId> = Vec::new();
        {
            let group = self.groups.get_mut(&gid).expect("async release of missing group");
            for row in group.async_queues.iter_mut() {
                for slot in row.iter_mut() {
                    if let Some(qid) = slot.take() {
                        pinned.push(qid);
                    }
                }
            }
            if let Some(qid) = group.async_idle_queue.take() {
                pinned.push(qid);
            }
        }
        for qid in pinned {
            if self.queues[&qid].is_busy() {
                self.del_busy_queue(qid, false);
            }
            self.queues
                .get_mut(&qid)
                .expect("async release of missing queue")
                .entity
                .parent = GroupId::ROOT;
            self.put_queue_ref(qid);
        }
    }
}
