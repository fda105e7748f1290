//! # Producer Queues
//!
//! A producer queue is the leaf entity of the scheduling hierarchy: one per
//! (producer, sync-flag) pair, with async queues shared per
//! (group, class, level). It holds the producer's pending requests twice —
//! sorted by sector for elevator-order service, and in FIFO order for
//! deadline enforcement — plus the per-slice budget state the budget engine
//! adapts over time.
//!
//! Queues are reference counted: the owning producer context holds one
//! reference, and every request annotated to the queue holds another. The
//! queue is freed when the count drops to zero.

use alloc::collections::{BTreeMap, VecDeque};
use bitflags::bitflags;

use crate::entity::{Entity, GroupId, IoPriority, QueueId};
use crate::{ProducerId, Request, RequestId, Sector, Service};

bitflags! {
    /// Per-queue state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueFlags: u16 {
        /// Has pending requests and rests on a service tree
        const BUSY          = 1 << 0;
        /// Sync queue (reads and flagged writes)
        const SYNC          = 1 << 1;
        /// May idle briefly after running out of requests
        const IDLE_WINDOW   = 1 << 2;
        /// The slice budget has been assigned but not yet timed
        const BUDGET_NEW    = 1 << 3;
        /// The idle timer is armed waiting for this queue's next request
        const WAIT_REQUEST  = 1 << 4;
        /// The FIFO deadline check already ran during this slice
        const FIFO_EXPIRE   = 1 << 5;
        /// The next allocation for this queue must be admitted
        const MUST_ALLOC    = 1 << 6;
        /// Priority was re-graded; apply at next activation
        const PRIO_CHANGED  = 1 << 7;
    }
}

/// A request pending inside a queue, with its FIFO deadline.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request: Request,
    /// Absolute deadline after which the request escapes elevator order
    pub fifo_deadline: u64,
}

/// A producer queue (leaf entity).
#[derive(Debug)]
pub struct BfqQueue {
    pub id: QueueId,
    /// Owning producer context
    pub producer: ProducerId,
    pub entity: Entity,
    pub flags: QueueFlags,
    /// References held by the context and by annotated requests
    pub refcount: u32,
    /// Pending requests by id
    pub pending: BTreeMap<RequestId, PendingRequest>,
    /// Sector-sorted view of the pending requests
    pub sort: BTreeMap<(Sector, RequestId), RequestId>,
    /// Arrival-ordered view, for FIFO-deadline enforcement
    pub fifo: VecDeque<RequestId>,
    /// Best next request by the elevator proximity rule
    pub next_rq: Option<RequestId>,
    /// Adaptive per-queue budget cap (sectors)
    pub max_budget: Service,
    /// Absolute deadline of the current slice; valid once BUDGET_NEW clears
    pub budget_timeout: u64,
    /// Slice-assignment EMA, used to gate the autotune clamp
    pub budgets_assigned: u32,
    /// Pending request counters: [async, sync]
    pub queued: [u32; 2],
    /// Requests handed to the driver and not yet completed
    pub dispatched: u32,
    /// Pending metadata requests
    pub meta_pending: u32,
    /// Per-direction allocation counters: [read, write]
    pub allocated: [u32; 2],
    /// Cumulative sectors handed to the driver over the queue's lifetime
    pub total_service: Service,
}

impl BfqQueue {
    /// Creates an empty queue below `group` with the given priority.
    pub fn new(
        id: QueueId,
        producer: ProducerId,
        group: GroupId,
        prio: IoPriority,
        sync: bool,
    ) -> Self {
        let mut flags = QueueFlags::PRIO_CHANGED;
        if sync {
            flags |= QueueFlags::SYNC;
        }
        Self {
            id,
            producer,
            entity: Entity::new(group, prio),
            flags,
            refcount: 0,
            pending: BTreeMap::new(),
            sort: BTreeMap::new(),
            fifo: VecDeque::new(),
            next_rq: None,
            max_budget: 0,
            budget_timeout: 0,
            budgets_assigned: 0,
            queued: [0; 2],
            dispatched: 0,
            meta_pending: 0,
            allocated: [0; 2],
            total_service: 0,
        }
    }

    pub fn is_sync(&self) -> bool {
        self.flags.contains(QueueFlags::SYNC)
    }

    pub fn is_busy(&self) -> bool {
        self.flags.contains(QueueFlags::BUSY)
    }

    pub fn has_idle_window(&self) -> bool {
        self.flags.contains(QueueFlags::IDLE_WINDOW)
    }

    pub fn sort_is_empty(&self) -> bool {
        self.sort.is_empty()
    }

    /// Remaining budget in the current slice.
    pub fn budget_left(&self) -> Service {
        self.entity.budget_left()
    }

    /// Whether the slice deadline has passed.
    ///
    /// A slice that has not seen its first completion yet has no deadline.
    pub fn budget_timed_out(&self, now: u64) -> bool {
        if self.flags.contains(QueueFlags::BUDGET_NEW) {
            return false;
        }
        now >= self.budget_timeout
    }

    /// Charges the queue its full budget, so that expiration attributes a
    /// complete slice to it regardless of the service actually received.
    pub fn charge_full_budget(&mut self) {
        self.entity.service = self.entity.budget;
    }

    /// Inserts a request into both pending views.
    pub fn insert(&mut self, request: Request, fifo_deadline: u64) {
        let id = request.id;
        let sector = request.sector;
        if request.meta {
            self.meta_pending += 1;
        }
        self.queued[request.sync as usize] += 1;
        self.sort.insert((sector, id), id);
        self.fifo.push_back(id);
        self.pending.insert(
            id,
            PendingRequest {
                request,
                fifo_deadline,
            },
        );
    }

    /// Updates a request's geometry after a front merge and re-sorts it.
    /// The FIFO position and deadline are untouched.
    pub fn reposition(&mut self, id: RequestId, new_sector: Sector, new_sectors: u32) {
        if let Some(pending) = self.pending.get_mut(&id) {
            let old_sector = pending.request.sector;
            pending.request.sector = new_sector;
            pending.request.sectors = new_sectors;
            self.sort.remove(&(old_sector, id));
            self.sort.insert((new_sector, id), id);
        }
    }

    /// Removes a request from both pending views; returns it if present.
    pub fn remove(&mut self, id: RequestId) -> Option<PendingRequest> {
        let pending = self.pending.remove(&id)?;
        self.sort.remove(&(pending.request.sector, id));
        self.fifo.retain(|&r| r != id);
        self.queued[pending.request.sync as usize] -= 1;
        if pending.request.meta {
            self.meta_pending -= 1;
        }
        Some(pending)
    }

    pub fn request(&self, id: RequestId) -> Option<&Request> {
        self.pending.get(&id).map(|p| &p.request)
    }

    /// Pending request at `sector`, if any (front-merge probe).
    pub fn find_by_sector(&self, sector: Sector) -> Option<RequestId> {
        self.sort
            .range((sector, RequestId(0))..(sector + 1, RequestId(0)))
            .next()
            .map(|(_, &id)| id)
    }

    /// Sort-order neighbor before `id`.
    pub fn former(&self, id: RequestId) -> Option<RequestId> {
        let sector = self.pending.get(&id)?.request.sector;
        self.sort
            .range(..(sector, id))
            .next_back()
            .map(|(_, &r)| r)
    }

    /// Sort-order neighbor after `id`.
    pub fn latter(&self, id: RequestId) -> Option<RequestId> {
        let sector = self.pending.get(&id)?.request.sector;
        let mut range = self.sort.range((sector, id)..);
        let first = range.next();
        debug_assert_eq!(first.map(|(_, &r)| r), Some(id));
        range.next().map(|(_, &r)| r)
    }

    /// Sort-order neighbors of `id`, excluding `id` itself.
    pub fn neighbors(&self, id: RequestId) -> (Option<RequestId>, Option<RequestId>) {
        (self.former(id), self.latter(id))
    }

    /// The oldest request past its FIFO deadline, checked at most once per
    /// slice: the first probe of a slice sets the sticky flag, and further
    /// probes return nothing until the queue is re-activated.
    pub fn check_fifo(&mut self, now: u64) -> Option<RequestId> {
        if self.flags.contains(QueueFlags::FIFO_EXPIRE) {
            return None;
        }
        self.flags |= QueueFlags::FIFO_EXPIRE;

        let &front = self.fifo.front()?;
        let pending = self.pending.get(&front)?;
        if now < pending.fifo_deadline {
            return None;
        }
        Some(front)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::IoClass;

    fn queue() -> BfqQueue {
        BfqQueue::new(
            QueueId(1),
            ProducerId(100),
            GroupId::ROOT,
            IoPriority::new(IoClass::BestEffort, 4),
            true,
        )
    }

    fn rq(id: u64, sector: Sector) -> Request {
        Request::read(RequestId(id), ProducerId(100), sector, 8)
    }

    #[test]
    fn test_insert_remove_tracks_counters() {
        let mut q = queue();
        q.insert(rq(1, 100), 1000);
        q.insert(rq(2, 50).meta(), 1000);
        assert_eq!(q.queued[1], 2);
        assert_eq!(q.meta_pending, 1);

        let removed = q.remove(RequestId(2)).unwrap();
        assert!(removed.request.meta);
        assert_eq!(q.meta_pending, 0);
        assert_eq!(q.queued[1], 1);
        assert!(q.remove(RequestId(2)).is_none());
    }

    #[test]
    fn test_sector_lookup_and_neighbors() {
        let mut q = queue();
        q.insert(rq(1, 100), 0);
        q.insert(rq(2, 200), 0);
        q.insert(rq(3, 300), 0);
        assert_eq!(q.find_by_sector(200), Some(RequestId(2)));
        assert_eq!(q.find_by_sector(150), None);
        assert_eq!(q.neighbors(RequestId(2)), (Some(RequestId(1)), Some(RequestId(3))));
        assert_eq!(q.former(RequestId(1)), None);
        assert_eq!(q.latter(RequestId(3)), None);
    }

    #[test]
    fn test_fifo_check_once_per_slice() {
        let mut q = queue();
        q.insert(rq(1, 100), 500);
        q.insert(rq(2, 50), 600);
        // Expired head is returned exactly once.
        assert_eq!(q.check_fifo(700), Some(RequestId(1)));
        assert_eq!(q.check_fifo(700), None);
        // Re-activation resets the sticky flag.
        q.flags.remove(QueueFlags::FIFO_EXPIRE);
        assert_eq!(q.check_fifo(700), Some(RequestId(1)));
    }

    #[test]
    fn test_fifo_check_respects_deadline() {
        let mut q = queue();
        q.insert(rq(1, 100), 500);
        assert_eq!(q.check_fifo(499), None);
        // The probe consumed the per-slice slot even though nothing expired.
        assert_eq!(q.check_fifo(501), None);
    }

    #[test]
    fn test_budget_timeout_needs_first_completion() {
        let mut q = queue();
        q.flags |= QueueFlags::BUDGET_NEW;
        q.budget_timeout = 100;
        assert!(!q.budget_timed_out(200));
        q.flags.remove(QueueFlags::BUDGET_NEW);
        assert!(q.budget_timed_out(200));
        assert!(!q.budget_timed_out(50));
    }
}
