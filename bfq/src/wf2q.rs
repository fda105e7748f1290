//! # B-WF2Q+ Entity Scheduler
//!
//! The hierarchical fair-queueing engine. Each sched-group owns one service
//! tree per priority class and serves at most one child entity at a time;
//! selecting the next producer queue means descending the group tree from
//! the root, picking at each level the eligible entity with the smallest
//! virtual finish time.
//!
//! ## Timestamp rules
//!
//! - A freshly backlogged entity starts at `max(vtime, finish)`: its old
//!   finish time carries over, so a producer cannot bank virtual time by
//!   going idle.
//! - While in service an entity is detached from its tree; re-attachment
//!   folds the service actually received into its finish time.
//! - An entity that empties with a finish time still ahead of the class
//!   clock parks on the idle tree, so that its eligibility resumes fairly;
//!   it is forgotten once the clock catches up.

use alloc::collections::BTreeMap;

use crate::entity::{delta, Entity, EntityRef, GroupId, IoClass, IoPriority, QueueId, TreeKind, IOPRIO_LEVELS};
use crate::queue::QueueFlags;
use crate::scheduler::BfqScheduler;
use crate::service_tree::ServiceTree;
use crate::Service;

/// Per-group scheduler state: one service tree per class, plus the child
/// entity currently in service.
#[derive(Debug)]
pub struct SchedData {
    /// Child entity being served, detached from its tree
    pub active_entity: Option<EntityRef>,
    /// Service trees, indexed by class
    pub trees: [ServiceTree; IoClass::COUNT],
}

impl SchedData {
    pub fn new() -> Self {
        Self {
            active_entity: None,
            trees: [ServiceTree::new(), ServiceTree::new(), ServiceTree::new()],
        }
    }
}

impl Default for SchedData {
    fn default() -> Self {
        Self::new()
    }
}

/// A sched-group: an interior node of the scheduling hierarchy.
#[derive(Debug)]
pub struct BfqGroup {
    pub id: GroupId,
    /// The group's own entity in its parent; the root group has none
    pub entity: Option<Entity>,
    pub sched: SchedData,
    /// Shared async queues per (class, level): [RT, BE]
    pub async_queues: [[Option<QueueId>; IOPRIO_LEVELS as usize]; 2],
    /// Shared async queue of the idle class
    pub async_idle_queue: Option<QueueId>,
}

impl BfqGroup {
    pub fn root() -> Self {
        Self {
            id: GroupId::ROOT,
            entity: None,
            sched: SchedData::new(),
            async_queues: [[None; IOPRIO_LEVELS as usize]; 2],
            async_idle_queue: None,
        }
    }

    pub fn child(id: GroupId, parent: GroupId, prio: IoPriority) -> Self {
        Self {
            id,
            entity: Some(Entity::new(parent, prio)),
            sched: SchedData::new(),
            async_queues: [[None; IOPRIO_LEVELS as usize]; 2],
            async_idle_queue: None,
        }
    }

    /// Whether anything below this group is backlogged or in service.
    pub fn is_busy(&self) -> bool {
        self.sched.active_entity.is_some()
            || self.sched.trees.iter().any(|st| !st.active_is_empty())
    }

    /// Slot for the shared async queue of a priority.
    pub fn async_slot(&mut self, prio: IoPriority) -> &mut Option<QueueId> {
        match prio.class {
            IoClass::Rt => &mut self.async_queues[0][prio.level as usize],
            IoClass::BestEffort => &mut self.async_queues[1][prio.level as usize],
            IoClass::Idle => &mut self.async_idle_queue,
        }
    }
}

impl BfqScheduler {
    pub(crate) fn entity_copy(&self, e: EntityRef) -> Entity {
        match e {
            EntityRef::Queue(q) => self.queues[&q].entity,
            EntityRef::Group(g) => self.groups[&g]
                .entity
                .expect("root group has no schedulable entity"),
        }
    }

    pub(crate) fn entity_mut(&mut self, e: EntityRef) -> &mut Entity {
        match e {
            EntityRef::Queue(q) => {
                &mut self
                    .queues
                    .get_mut(&q)
                    .expect("entity for missing queue")
                    .entity
            }
            EntityRef::Group(g) => self
                .groups
                .get_mut(&g)
                .expect("entity for missing group")
                .entity
                .as_mut()
                .expect("root group has no schedulable entity"),
        }
    }

    /// Marks a queue busy and enters it into the fair-queueing hierarchy.
    pub(crate) fn add_busy_queue(&mut self, qid: QueueId) {
        let queue = self.queues.get_mut(&qid).expect("busy insert of missing queue");
        debug_assert!(!queue.is_busy());
        queue.flags |= QueueFlags::BUSY;
        self.busy_queues += 1;
        self.activate_entity(EntityRef::Queue(qid));
    }

    /// Removes an emptied queue from the hierarchy.
    pub(crate) fn del_busy_queue(&mut self, qid: QueueId, requeue: bool) {
        let queue = self.queues.get_mut(&qid).expect("busy remove of missing queue");
        debug_assert!(queue.is_busy());
        queue.flags.remove(QueueFlags::BUSY);
        self.busy_queues -= 1;
        self.deactivate_entity(EntityRef::Queue(qid), requeue);
    }

    /// Re-enters a backlogged queue after a budget change or expiration.
    pub(crate) fn activate_queue(&mut self, qid: QueueId) {
        self.activate_entity(EntityRef::Queue(qid));
    }

    /// Activates an entity and propagates the activation towards the root.
    ///
    /// The ascent stops at the first group that is already serving a child:
    /// everything above it is updated when that service ends.
    pub(crate) fn activate_entity(&mut self, e: EntityRef) {
        let mut cur = e;
        loop {
            let parent = self.entity_copy(cur).parent;
            self.activate_one(cur);

            if parent == GroupId::ROOT {
                break;
            }
            if self.groups[&parent].sched.active_entity.is_some() {
                break;
            }
            // Hand the child's slice size to the group entity before
            // timestamping it.
            let child_budget = self.entity_copy(cur).budget;
            let group_entity = self
                .groups
                .get_mut(&parent)
                .expect("activation across missing group")
                .entity
                .as_mut()
                .expect("non-root group without entity");
            group_entity.budget = child_budget;
            cur = EntityRef::Group(parent);
        }
    }

    /// One level of activation: places `e` on the active tree of its parent.
    fn activate_one(&mut self, e: EntityRef) {
        let mut ent = self.entity_copy(e);
        let parent = ent.parent;
        let old_class = ent.prio.class.index();

        {
            let group = self.groups.get_mut(&parent).expect("activation under missing group");
            let in_service = group.sched.active_entity == Some(e);
            let st = &mut group.sched.trees[old_class];
            if in_service {
                // Requeue of the entity in service: fold the service it
                // received into its timestamps.
                ent.calc_finish(ent.service);
                ent.start = ent.finish;
                ent.service = 0;
                group.sched.active_entity = None;
            } else {
                match ent.tree {
                    Some(TreeKind::Active) => {
                        // Requeue while backlogged (e.g. the budget grew to
                        // fit a larger head request): keep the start.
                        st.active_remove(e, ent.start, ent.finish);
                    }
                    Some(TreeKind::Idle) => {
                        st.idle_remove(e, ent.start, ent.finish);
                        ent.start = st.vtime.max(ent.finish);
                    }
                    None => {
                        // Fresh activation; the old finish carries over.
                        ent.start = st.vtime.max(ent.finish);
                        ent.service = 0;
                        st.wsum += ent.weight as u64;
                        ent.on_st = true;
                    }
                }
            }
        }

        // A pending re-grade moves the weight (and possibly the class tree).
        if ent.prio_changed {
            let group = self.groups.get_mut(&parent).expect("activation under missing group");
            group.sched.trees[old_class].wsum -= ent.weight as u64;
            ent.update_prio();
            group.sched.trees[ent.prio.class.index()].wsum += ent.weight as u64;
        }

        ent.calc_finish(ent.budget);
        log::trace!(
            "bfq: activate {:?} start={} finish={} budget={}",
            e,
            ent.start,
            ent.finish,
            ent.budget
        );

        let class = ent.prio.class.index();
        let group = self.groups.get_mut(&parent).expect("activation under missing group");
        group.sched.trees[class].active_insert(e, ent.start, ent.finish);
        ent.tree = Some(TreeKind::Active);
        *self.entity_mut(e) = ent;
    }

    /// Deactivates an entity, propagating towards the root while ancestors
    /// run out of backlogged children.
    pub(crate) fn deactivate_entity(&mut self, e: EntityRef, requeue: bool) {
        let mut cur = e;
        loop {
            let parent = self.entity_copy(cur).parent;
            self.deactivate_one(cur, requeue);

            if parent == GroupId::ROOT {
                break;
            }
            if self.groups[&parent].is_busy() {
                // The group still has work below it; it stays scheduled.
                break;
            }
            cur = EntityRef::Group(parent);
        }
    }

    /// One level of deactivation: detaches `e` and parks or forgets it.
    fn deactivate_one(&mut self, e: EntityRef, requeue: bool) {
        let mut ent = self.entity_copy(e);
        if !ent.on_st {
            return;
        }
        let parent = ent.parent;
        let class = ent.prio.class.index();

        let group = self.groups.get_mut(&parent).expect("deactivation under missing group");
        let st = &mut group.sched.trees[class];
        if group.sched.active_entity == Some(e) {
            // Leaving service: sync the finish time with the service
            // actually received.
            ent.calc_finish(ent.service);
            ent.service = 0;
            group.sched.active_entity = None;
        } else {
            match ent.tree {
                Some(TreeKind::Active) => {
                    st.active_remove(e, ent.start, ent.finish);
                }
                Some(TreeKind::Idle) => {
                    st.idle_remove(e, ent.start, ent.finish);
                }
                None => {}
            }
        }
        ent.tree = None;

        if !requeue || ent.finish <= st.vtime {
            // Eligibility already caught up; drop the entity entirely.
            st.wsum -= ent.weight as u64;
            ent.on_st = false;
        } else {
            st.idle_insert(e, ent.start, ent.finish);
            ent.tree = Some(TreeKind::Idle);
        }
        log::trace!("bfq: deactivate {:?} finish={} requeue={}", e, ent.finish, requeue);
        *self.entity_mut(e) = ent;
    }

    /// Charges `served` sectors to a queue and every ancestor, advancing the
    /// class virtual clocks.
    pub(crate) fn charge_service(&mut self, qid: QueueId, served: Service) {
        let mut cur = EntityRef::Queue(qid);
        loop {
            let ent = {
                let ent = self.entity_mut(cur);
                ent.service += served;
                if matches!(cur, EntityRef::Queue(_)) {
                    debug_assert!(ent.service <= ent.budget);
                }
                *ent
            };
            let parent = ent.parent;
            let class = ent.prio.class.index();
            {
                let group = self.groups.get_mut(&parent).expect("service under missing group");
                let st = &mut group.sched.trees[class];
                if st.wsum > 0 {
                    let advance = delta(served, 1) / st.wsum;
                    let vtime = st.vtime + advance;
                    st.update_vtime(vtime);
                }
            }
            self.forget_idle(parent, class);
            if parent == GroupId::ROOT {
                break;
            }
            cur = EntityRef::Group(parent);
        }
    }

    /// Prunes matured idle entities and lets the class clock catch up with
    /// the backlog when every active entity is still ahead of it.
    pub(crate) fn forget_idle(&mut self, gid: GroupId, class: usize) {
        loop {
            let front = {
                let st = &self.groups[&gid].sched.trees[class];
                match st.idle_front() {
                    Some((e, start, finish)) if finish <= st.vtime => Some((e, start, finish)),
                    _ => None,
                }
            };
            let Some((e, start, finish)) = front else { break };
            let weight = self.entity_copy(e).weight;
            {
                let st = &mut self
                    .groups
                    .get_mut(&gid)
                    .expect("forget_idle on missing group")
                    .sched
                    .trees[class];
                st.idle_remove(e, start, finish);
                st.wsum -= weight as u64;
            }
            let ent = self.entity_mut(e);
            ent.tree = None;
            ent.on_st = false;
        }

        let st = &mut self
            .groups
            .get_mut(&gid)
            .expect("forget_idle on missing group")
            .sched
            .trees[class];
        if let Some(min_start) = st.active_min_start() {
            st.update_vtime(min_start);
        }
    }

    /// Picks the next producer queue to serve by descending the hierarchy.
    pub(crate) fn next_queue(&mut self) -> Option<QueueId> {
        if self.busy_queues == 0 {
            return None;
        }
        let mut gid = GroupId::ROOT;
        loop {
            match self.lookup_next_entity(gid)? {
                EntityRef::Queue(q) => return Some(q),
                EntityRef::Group(g) => gid = g,
            }
        }
    }

    /// Extracts the next entity of one group, highest class first.
    fn lookup_next_entity(&mut self, gid: GroupId) -> Option<EntityRef> {
        for class in 0..IoClass::COUNT {
            self.forget_idle(gid, class);
            let e = {
                let st = &mut self
                    .groups
                    .get_mut(&gid)
                    .expect("lookup in missing group")
                    .sched
                    .trees[class];
                if st.active_is_empty() {
                    continue;
                }
                match st.first_eligible() {
                    Some(e) => e,
                    None => {
                        // Nothing eligible: let the clock jump to the
                        // earliest backlogged start and retry. Finite, the
                        // tree is non-empty.
                        let min_start = st.active_min_start().expect("non-empty active tree");
                        st.update_vtime(min_start);
                        st.first_eligible()?
                    }
                }
            };
            // Detach the winner: an entity in service never sits on its
            // parent's tree.
            let ent = self.entity_copy(e);
            {
                let group = self.groups.get_mut(&gid).expect("lookup in missing group");
                group.sched.trees[class].active_remove(e, ent.start, ent.finish);
                group.sched.active_entity = Some(e);
            }
            let ent = self.entity_mut(e);
            ent.tree = None;
            ent.service = 0;
            return Some(e);
        }
        None
    }

    /// Adds a sched-group below `parent`. Producers assigned to the group
    /// get their queues scheduled under it.
    pub fn add_group(&mut self, parent: GroupId, prio: IoPriority) -> Option<GroupId> {
        if !self.groups.contains_key(&parent) {
            return None;
        }
        let id = GroupId(self.next_group_id);
        self.next_group_id += 1;
        self.groups.insert(id, BfqGroup::child(id, parent, prio));
        Some(id)
    }

    pub(crate) fn group_map(&self) -> &BTreeMap<GroupId, BfqGroup> {
        &self.groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::SERVICE_SHIFT;
    use crate::{ProducerId, Request, RequestId, Tunables};

    fn sched() -> BfqScheduler {
        BfqScheduler::new(Tunables::default())
    }

    fn add_read(sched: &mut BfqScheduler, id: u64, producer: u64, sector: u64, now: u64) {
        let rq = Request::read(RequestId(id), ProducerId(producer), sector, 8);
        sched.set_request(&rq);
        sched.add_request(rq, now);
    }

    #[test]
    fn test_fresh_activation_uses_vtime_or_finish() {
        let mut s = sched();
        add_read(&mut s, 1, 100, 0, 0);
        let qid = s.queue_of_producer(ProducerId(100), true).unwrap();
        let ent = s.entity_copy(EntityRef::Queue(qid));
        assert_eq!(ent.start, 0);
        assert_eq!(ent.finish, ent.start + (ent.budget << SERVICE_SHIFT) / ent.weight as u64);
        assert!(ent.on_st);
        assert_eq!(ent.tree, Some(TreeKind::Active));
    }

    #[test]
    fn test_selection_detaches_entity() {
        let mut s = sched();
        add_read(&mut s, 1, 100, 0, 0);
        let qid = s.next_queue().unwrap();
        let ent = s.entity_copy(EntityRef::Queue(qid));
        assert_eq!(ent.tree, None);
        assert!(ent.on_st);
        let root = &s.group_map()[&GroupId::ROOT];
        assert_eq!(root.sched.active_entity, Some(EntityRef::Queue(qid)));
        assert!(root.sched.trees[IoClass::BestEffort.index()].active_is_empty());
    }

    #[test]
    fn test_rt_served_before_be() {
        let mut s = sched();
        add_read(&mut s, 1, 100, 0, 0);
        s.set_io_priority(ProducerId(200), IoPriority::new(IoClass::Rt, 4));
        add_read(&mut s, 2, 200, 0, 0);
        let qid = s.next_queue().unwrap();
        let q = s.queue_of_producer(ProducerId(200), true).unwrap();
        assert_eq!(qid, q);
    }

    #[test]
    fn test_smaller_finish_wins_within_class() {
        let mut s = sched();
        // Producer 300 has a higher weight (level 0 -> weight 8), so its
        // virtual finish for the same budget is earlier than 100's.
        s.set_io_priority(ProducerId(300), IoPriority::new(IoClass::BestEffort, 0));
        add_read(&mut s, 1, 100, 0, 0);
        add_read(&mut s, 2, 300, 0, 0);
        let first = s.next_queue().unwrap();
        assert_eq!(first, s.queue_of_producer(ProducerId(300), true).unwrap());
    }

    #[test]
    fn test_requeue_advances_finish_by_budget_over_weight() {
        let mut s = sched();
        add_read(&mut s, 1, 100, 0, 0);
        let qid = s.next_queue().unwrap();
        let before = s.entity_copy(EntityRef::Queue(qid));

        // Consume the full budget, then requeue as a backlogged queue.
        s.charge_service(qid, before.budget);
        s.activate_queue(qid);
        let after = s.entity_copy(EntityRef::Queue(qid));
        let slice = (before.budget << SERVICE_SHIFT) / before.weight as u64;
        assert_eq!(after.start, before.start + slice);
        assert_eq!(after.finish, after.start + slice);
    }

    #[test]
    fn test_deactivation_parks_future_finish_on_idle_tree() {
        let mut s = sched();
        add_read(&mut s, 1, 100, 0, 0);
        add_read(&mut s, 2, 200, 0, 0);
        let qid = s.next_queue().unwrap();
        // Serve a little, then deactivate with requeue: the finish time is
        // still ahead of the clock, so the entity parks on the idle tree.
        s.charge_service(qid, 8);
        s.del_busy_queue(qid, true);
        let ent = s.entity_copy(EntityRef::Queue(qid));
        assert_eq!(ent.tree, Some(TreeKind::Idle));
        assert!(ent.on_st);
    }

    #[test]
    fn test_forget_idle_prunes_matured_entities() {
        let mut s = sched();
        add_read(&mut s, 1, 100, 0, 0);
        add_read(&mut s, 2, 200, 0, 0);
        let qid = s.next_queue().unwrap();
        s.charge_service(qid, 8);
        s.del_busy_queue(qid, true);

        // Force the class clock far ahead; the parked entity matures.
        {
            let other = s.queue_of_producer(ProducerId(200), true).unwrap();
            let budget = s.entity_copy(EntityRef::Queue(other)).budget;
            let next = s.next_queue().unwrap();
            assert_eq!(next, other);
            s.charge_service(other, budget);
        }
        s.forget_idle(GroupId::ROOT, IoClass::BestEffort.index());
        let ent = s.entity_copy(EntityRef::Queue(qid));
        let st = &s.group_map()[&GroupId::ROOT].sched.trees[IoClass::BestEffort.index()];
        if ent.finish <= st.vtime {
            assert!(!ent.on_st, "matured idle entity must be forgotten");
        } else {
            assert_eq!(ent.tree, Some(TreeKind::Idle));
        }
    }

    #[test]
    fn test_group_hierarchy_selection() {
        let mut s = sched();
        let child = s.add_group(GroupId::ROOT, IoPriority::default()).unwrap();
        s.assign_producer_to_group(ProducerId(100), child);
        add_read(&mut s, 1, 100, 0, 0);

        let qid = s.next_queue().unwrap();
        assert_eq!(qid, s.queue_of_producer(ProducerId(100), true).unwrap());
        // The descent pinned the child group as active in the root...
        let root = &s.group_map()[&GroupId::ROOT];
        assert_eq!(root.sched.active_entity, Some(EntityRef::Group(child)));
        // ...and the leaf as active in the child group.
        let group = &s.group_map()[&child];
        assert_eq!(group.sched.active_entity, Some(EntityRef::Queue(qid)));
    }

    #[test]
    fn test_empty_hierarchy_selects_nothing() {
        let mut s = sched();
        assert_eq!(s.next_queue(), None);
    }
}
