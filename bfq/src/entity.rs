//! # Schedulable Entities
//!
//! Every node of the scheduling hierarchy is an *entity*: leaf entities wrap
//! producer queues, interior entities wrap sched-groups. An entity carries
//! the virtual timestamps and the budget/service accounting that the
//! B-WF2Q+ scheduler operates on.
//!
//! Virtual time is fixed point: a service of `s` sectors at weight `w`
//! advances an entity's finish time by `(s << SERVICE_SHIFT) / w`.

use crate::Service;

/// Fixed-point shift for virtual-time arithmetic.
pub const SERVICE_SHIFT: u32 = 22;

/// Number of priority levels within the RT and BE classes.
pub const IOPRIO_LEVELS: u8 = 8;

/// Identifier of a producer queue (a leaf entity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId(pub u64);

/// Identifier of a sched-group (an interior entity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(pub u64);

impl GroupId {
    /// The root group, always present.
    pub const ROOT: Self = Self(0);
}

/// I/O priority class, in service order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IoClass {
    /// Real-time: served before everything else
    Rt = 0,
    /// Best-effort: the default class
    BestEffort = 1,
    /// Idle: served only when nothing else is backlogged
    Idle = 2,
}

impl Default for IoClass {
    fn default() -> Self {
        IoClass::BestEffort
    }
}

impl IoClass {
    /// Number of classes.
    pub const COUNT: usize = 3;

    /// Index into per-class tables.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// An I/O priority: class plus level within the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoPriority {
    pub class: IoClass,
    pub level: u8,
}

impl Default for IoPriority {
    fn default() -> Self {
        Self {
            class: IoClass::BestEffort,
            level: 4,
        }
    }
}

impl IoPriority {
    /// Creates a priority, clamping the level to the valid range.
    pub fn new(class: IoClass, level: u8) -> Self {
        Self {
            class,
            level: level.min(IOPRIO_LEVELS - 1),
        }
    }

    /// Decodes a raw `class:level` pair as found on the wire.
    ///
    /// An unknown class is logged and graded down to best-effort.
    pub fn from_raw(class: u8, level: u8) -> Self {
        let class = match class {
            1 => IoClass::Rt,
            0 | 2 => IoClass::BestEffort,
            3 => IoClass::Idle,
            other => {
                log::error!("bfq: bad prio class {}, using best-effort", other);
                IoClass::BestEffort
            }
        };
        Self::new(class, level)
    }

    /// The scheduling weight this priority maps to.
    pub fn weight(&self) -> u32 {
        (IOPRIO_LEVELS - self.level.min(IOPRIO_LEVELS - 1)) as u32
    }
}

/// Which service tree currently holds an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    Active,
    Idle,
}

/// A reference to an entity, leaf or interior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntityRef {
    Queue(QueueId),
    Group(GroupId),
}

/// The per-entity scheduling state.
///
/// Invariants while the entity is being served: `service <= budget`, and
/// `finish == start + delta(budget, weight)` whenever the entity rests on a
/// service tree.
#[derive(Debug, Clone, Copy)]
pub struct Entity {
    /// Parent sched-group
    pub parent: GroupId,
    /// Current weight, derived from the priority at last (re)activation
    pub weight: u32,
    /// Current priority
    pub prio: IoPriority,
    /// Priority to apply at next (re)activation
    pub new_prio: IoPriority,
    /// A priority change is pending
    pub prio_changed: bool,
    /// Virtual start of the current or last slice
    pub start: u64,
    /// Virtual finish of the current or last slice
    pub finish: u64,
    /// Sectors granted for the current slice
    pub budget: Service,
    /// Sectors consumed so far in the current slice
    pub service: Service,
    /// Tree currently holding the entity, if any
    pub tree: Option<TreeKind>,
    /// The entity is attached to a service tree's weight sum
    pub on_st: bool,
}

impl Entity {
    /// Creates a fresh entity below `parent` with the given priority.
    pub fn new(parent: GroupId, prio: IoPriority) -> Self {
        Self {
            parent,
            weight: prio.weight(),
            prio,
            new_prio: prio,
            prio_changed: false,
            start: 0,
            finish: 0,
            budget: 0,
            service: 0,
            tree: None,
            on_st: false,
        }
    }

    /// Virtual-time delta for `service` sectors at this entity's weight.
    pub fn delta(&self, service: Service) -> u64 {
        delta(service, self.weight)
    }

    /// Recomputes `finish` from `start` and the given amount of service.
    pub fn calc_finish(&mut self, service: Service) {
        self.finish = self.start + self.delta(service);
    }

    /// Remaining budget for the current slice.
    pub fn budget_left(&self) -> Service {
        self.budget.saturating_sub(self.service)
    }

    /// Applies a pending priority change.
    ///
    /// Must only be called while the entity is detached from any tree; the
    /// new weight and class take effect with the next activation.
    pub fn update_prio(&mut self) {
        if self.prio_changed {
            self.prio = self.new_prio;
            self.weight = self.new_prio.weight();
            self.prio_changed = false;
        }
    }
}

/// Virtual-time delta for `service` sectors at weight `weight`.
pub fn delta(service: Service, weight: u32) -> u64 {
    (service << SERVICE_SHIFT) / weight.max(1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_mapping() {
        assert_eq!(IoPriority::new(IoClass::BestEffort, 0).weight(), 8);
        assert_eq!(IoPriority::new(IoClass::BestEffort, 4).weight(), 4);
        assert_eq!(IoPriority::new(IoClass::BestEffort, 7).weight(), 1);
        // Levels clamp instead of wrapping.
        assert_eq!(IoPriority::new(IoClass::BestEffort, 200).weight(), 1);
    }

    #[test]
    fn test_raw_prio_fallback() {
        let prio = IoPriority::from_raw(9, 2);
        assert_eq!(prio.class, IoClass::BestEffort);
        assert_eq!(prio.level, 2);
        assert_eq!(IoPriority::from_raw(1, 0).class, IoClass::Rt);
        assert_eq!(IoPriority::from_raw(3, 0).class, IoClass::Idle);
    }

    #[test]
    fn test_finish_arithmetic() {
        let mut e = Entity::new(GroupId::ROOT, IoPriority::new(IoClass::BestEffort, 4));
        e.start = 1000;
        e.budget = 64;
        e.calc_finish(e.budget);
        assert_eq!(e.finish, 1000 + (64 << SERVICE_SHIFT) / 4);
    }

    #[test]
    fn test_prio_change_applies_lazily() {
        let mut e = Entity::new(GroupId::ROOT, IoPriority::default());
        e.new_prio = IoPriority::new(IoClass::Rt, 0);
        e.prio_changed = true;
        assert_eq!(e.weight, 4);
        e.update_prio();
        assert_eq!(e.weight, 8);
        assert_eq!(e.prio.class, IoClass::Rt);
    }
}
