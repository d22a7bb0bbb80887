//! The domain-side half of one region's protocol state machine.
//!
//! Grounded on the original `RegionController`/`RegionControllerPhase`/
//! `RegionControllerCensus` (`include/mantle/region_controller.h`,
//! `src/region_controller.cpp`): each bound region gets one controller on
//! the domain thread; every controller advances through the same eight
//! phases in lockstep, gated by a census of where every *other* controller
//! currently stands.

use crate::config::Config;
use crate::connection::Endpoint;
use crate::ledger::WriteBarrierManager;
use crate::message::{Message, WriteBarrierHandle};
use crate::object::RegionId;
use crate::object_grouper::{ObjectGrouper, ObjectGroups};
use crate::operation::{Operation, OperationType};
use crate::operation_grouper::OperationGrouper;

/// One full cycle's eight phases, in the order they're visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionControllerPhase {
    /// Waiting for the region's `START`.
    Start,
    /// `START` received; waiting for every controller to reach this phase
    /// (or any controller that already has, per [`RegionControllerAction::BarrierAny`]).
    StartBarrier,
    /// Sends `ENTER { cycle }`.
    Enter,
    /// Waiting for the region's `SUBMIT`.
    Submit,
    /// `SUBMIT` received; waiting for every controller, then routes the
    /// region's closed-out operations to their owning controllers.
    SubmitBarrier,
    /// Waiting for every controller, then applies every routed operation
    /// and buckets newly dead objects for finalization.
    RetireBarrier,
    /// Sends `RETIRE { object_groups }`.
    Retire,
    /// Sends `LEAVE { stop }`, then the cycle number advances.
    Leave,
}

impl RegionControllerPhase {
    fn next(self) -> Self {
        match self {
            Self::Start => Self::StartBarrier,
            Self::StartBarrier => Self::Enter,
            Self::Enter => Self::Submit,
            Self::Submit => Self::SubmitBarrier,
            Self::SubmitBarrier => Self::RetireBarrier,
            Self::RetireBarrier => Self::Retire,
            Self::Retire => Self::Leave,
            Self::Leave => Self::Start,
        }
    }

    fn action(self) -> RegionControllerAction {
        match self {
            Self::Start | Self::Submit => RegionControllerAction::Receive,
            Self::StartBarrier => RegionControllerAction::BarrierAny,
            Self::Enter | Self::Retire | Self::Leave => RegionControllerAction::Send,
            Self::SubmitBarrier | Self::RetireBarrier => RegionControllerAction::BarrierAll,
        }
    }
}

/// What a controller does while sitting in a given phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionControllerAction {
    /// Waiting on a message from its region.
    Receive,
    /// Waiting on a message it will send.
    Send,
    /// Advances as soon as any controller reaches the next phase.
    BarrierAny,
    /// Advances only once every controller has reached the next phase.
    BarrierAll,
}

/// Lifecycle state layered on top of the phase cycle; independent of which
/// of the eight phases a controller is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionControllerState {
    Running,
    Stopping,
    Stopped,
    Shutdown,
}

/// A snapshot of where every bound controller currently stands, used to
/// decide whether any individual controller may advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionControllerCensus {
    total: usize,
    phase_counts: [usize; 8],
    action_counts: [usize; 4],
    min_cycle: u64,
    max_cycle: u64,
}

impl RegionControllerCensus {
    /// Builds a census by observing every controller in `controllers`.
    #[must_use]
    pub fn observe(controllers: &[RegionController]) -> Self {
        let mut census = Self {
            total: 0,
            phase_counts: [0; 8],
            action_counts: [0; 4],
            min_cycle: u64::MAX,
            max_cycle: 0,
        };
        for controller in controllers {
            census.total += 1;
            census.phase_counts[controller.phase as usize] += 1;
            census.action_counts[controller.phase.action() as usize] += 1;
            census.min_cycle = census.min_cycle.min(controller.cycle);
            census.max_cycle = census.max_cycle.max(controller.cycle);
        }
        census
    }

    /// True if at least one controller is currently in `phase`.
    #[must_use]
    pub fn any_in_phase(&self, phase: RegionControllerPhase) -> bool {
        self.phase_counts[phase as usize] > 0
    }

    /// True if every controller is currently performing `action`.
    #[must_use]
    pub fn all_performing(&self, action: RegionControllerAction) -> bool {
        self.total > 0 && self.action_counts[action as usize] == self.total
    }

    #[must_use]
    pub fn min_cycle(&self) -> u64 {
        self.min_cycle
    }

    #[must_use]
    pub fn max_cycle(&self) -> u64 {
        self.max_cycle
    }
}

/// One bound region's protocol state, as seen from the domain thread.
pub struct RegionController {
    id: RegionId,
    endpoint: Endpoint,
    state: RegionControllerState,
    phase: RegionControllerPhase,
    cycle: u64,
    operation_grouper: OperationGrouper,
    object_grouper: ObjectGrouper,
    pending_write_barrier: Option<WriteBarrierHandle>,
    pending_object_groups: Option<ObjectGroups>,
    pending_outgoing: Option<Message>,
}

impl RegionController {
    #[must_use]
    pub fn new(id: RegionId, endpoint: Endpoint, config: &Config) -> Self {
        Self {
            id,
            endpoint,
            state: RegionControllerState::Running,
            phase: RegionControllerPhase::Start,
            cycle: 0,
            // Disabling the grouper doesn't shrink the cache to nothing —
            // every `write` just passes `flush = true` (see `route_operations`)
            // so the cache is allocated but never actually populated.
            operation_grouper: OperationGrouper::new(
                crate::config::OPERATION_GROUPER_CACHE_SIZE,
                crate::config::OPERATION_GROUPER_CACHE_WAYS,
            ),
            object_grouper: ObjectGrouper::new(config.object_grouper_enabled),
            pending_write_barrier: None,
            pending_object_groups: None,
            pending_outgoing: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> RegionId {
        self.id
    }

    #[must_use]
    pub fn phase(&self) -> RegionControllerPhase {
        self.phase
    }

    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// The fd to watch for messages from this region.
    #[must_use]
    pub fn file_descriptor(&self) -> std::os::fd::RawFd {
        self.endpoint.file_descriptor()
    }

    /// True once this controller has no operations left cached that would
    /// still need a cycle to drain — the condition the domain checks before
    /// honoring a stop request.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        !self.operation_grouper.is_dirty()
    }

    /// True once the controller has fully shut down and may be dropped.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state == RegionControllerState::Shutdown
    }

    /// Requests that this controller wind down once its region also agrees
    /// to stop. Only effective once [`Self::is_quiescent`].
    pub fn request_stop(&mut self) {
        if self.state == RegionControllerState::Running {
            self.state = RegionControllerState::Stopping;
        }
    }

    /// Starts this controller at the domain's current cycle number.
    pub fn start(&mut self, cycle: u64) {
        self.cycle = cycle;
    }

    /// Polls this controller's endpoint and feeds every received message
    /// through the state machine.
    pub fn poll_messages(&mut self, non_blocking: bool) {
        let messages = self.endpoint.receive_messages(non_blocking);
        for message in messages {
            self.receive_message(&message);
        }
    }

    fn receive_message(&mut self, message: &Message) {
        match (self.phase, message) {
            (RegionControllerPhase::Start, Message::Start) => {
                self.transition(RegionControllerPhase::StartBarrier);
            }
            (RegionControllerPhase::Submit, Message::Submit { stop, write_barrier }) => {
                self.pending_write_barrier = Some(*write_barrier);
                if self.state == RegionControllerState::Running || self.state == RegionControllerState::Stopping {
                    self.state = if *stop { RegionControllerState::Stopping } else { RegionControllerState::Running };
                }
                self.transition(RegionControllerPhase::SubmitBarrier);
            }
            (phase, message) => {
                crate::protocol_violation!("region {} sent unexpected {message} in phase {phase:?}", self.id);
            }
        }
    }

    /// Advances this controller against a previously observed census. Does
    /// nothing if the census doesn't yet license an advance.
    pub fn synchronize(&mut self, census: &RegionControllerCensus) {
        let next_phase = self.phase.next();
        let next_action = next_phase.action();

        if census.all_performing(RegionControllerAction::BarrierAll) || census.all_performing(RegionControllerAction::BarrierAny) {
            debug_assert_eq!(census.min_cycle(), census.max_cycle());
            self.transition(next_phase);
        } else if census.any_in_phase(next_phase) && next_action == RegionControllerAction::BarrierAny {
            self.transition(next_phase);
        }
    }

    /// Takes the message queued by the most recent transition, if any, for
    /// the caller to forward to this controller's region.
    pub fn take_outgoing(&mut self) -> Option<Message> {
        self.pending_outgoing.take()
    }

    pub fn send_outgoing(&self, message: Message) -> bool {
        self.endpoint.send_message(message)
    }

    fn transition(&mut self, phase: RegionControllerPhase) {
        self.phase = phase;
        match phase {
            RegionControllerPhase::Start => {
                if self.state == RegionControllerState::Stopped {
                    self.state = RegionControllerState::Shutdown;
                }
            }
            RegionControllerPhase::Enter => {
                self.pending_outgoing = Some(Message::Enter { cycle: self.cycle });
            }
            RegionControllerPhase::Retire => {
                let object_groups = self.pending_object_groups.take().unwrap_or_default();
                self.pending_outgoing = Some(Message::Retire { object_groups });
            }
            RegionControllerPhase::Leave => {
                self.cycle += 1;
                if self.state == RegionControllerState::Stopping && self.is_quiescent() {
                    self.state = RegionControllerState::Stopped;
                }
                let stop = self.state == RegionControllerState::Stopped || self.state == RegionControllerState::Shutdown;
                self.pending_outgoing = Some(Message::Leave { stop });
            }
            RegionControllerPhase::RetireBarrier => {
                self.apply_operations();
            }
            RegionControllerPhase::StartBarrier | RegionControllerPhase::Submit | RegionControllerPhase::SubmitBarrier => {}
        }
    }

    /// Applies every operation this controller has accumulated (routed to
    /// it by [`route_operations`]) and buckets newly dead objects.
    fn apply_operations(&mut self) {
        let force = self.state != RegionControllerState::Running;
        self.operation_grouper.flush(force);

        for &(object, delta) in self.operation_grouper.increments() {
            debug_assert!(delta >= 0, "increment collection held a negative delta");
            // SAFETY: `object` was routed to this controller because it is
            // bound to this controller's region, and nothing else mutates
            // an object's count outside this apply step (`I2`).
            unsafe {
                (*object).apply_increment(delta.unsigned_abs() as u32);
            }
        }

        let increments_applied = true;
        let decrements_pending = !self.operation_grouper.decrements().is_empty();
        crate::invariants::debug_assert_increments_before_decrements!(increments_applied, decrements_pending);

        for &(object, delta) in self.operation_grouper.decrements() {
            debug_assert!(delta <= 0, "decrement collection held a non-negative delta");
            // SAFETY: see above.
            let alive = unsafe { (*object).apply_decrement(delta.unsigned_abs() as u32) };
            if !alive {
                // SAFETY: the object just died under this controller's
                // apply step and is no longer managed by any region.
                unsafe {
                    self.object_grouper.write(object);
                }
            }
        }

        self.operation_grouper.clear();
        self.pending_object_groups = Some(self.object_grouper.flush());
    }
}

/// Walks every controller currently in [`RegionControllerPhase::SubmitBarrier`],
/// drains the write barrier its region just closed, and routes each logged
/// operation to the controller owning the target object (which may not be
/// `controller` itself — an object can be decremented by a region other
/// than the one that incremented it).
///
/// Must be called once per cycle, after every `SubmitBarrier`-phase
/// controller's census condition has licensed the transition but before any
/// of them advance to `RetireBarrier`.
pub fn route_operations(controllers: &mut [RegionController], manager: &WriteBarrierManager, config: &Config) {
    struct Routed {
        region_id: RegionId,
        op_type: OperationType,
        object: *mut crate::object::Object,
    }

    let mut routed = Vec::new();

    for controller in controllers.iter_mut() {
        if controller.phase != RegionControllerPhase::SubmitBarrier {
            continue;
        }
        let Some(write_barrier) = controller.pending_write_barrier.take() else {
            continue;
        };

        // SAFETY: valid for the duration of this `SubmitBarrier` window,
        // which this function's caller guarantees it's called within.
        let increment_barrier = unsafe { write_barrier.increment_barrier() };
        let decrement_barrier = unsafe { write_barrier.decrement_barrier() };

        increment_barrier.drain(manager, |segment| {
            for &object in segment.increments() {
                // SAFETY: every pointer in a committed segment came from a
                // live, bound object.
                let region_id = unsafe { (*object).region_id() };
                routed.push(Routed { region_id, op_type: OperationType::Increment, object });
            }
        });
        decrement_barrier.drain(manager, |segment| {
            for &object in segment.decrements() {
                // SAFETY: see above.
                let region_id = unsafe { (*object).region_id() };
                routed.push(Routed { region_id, op_type: OperationType::Decrement, object });
            }
        });

        manager.attach(increment_barrier);
        manager.attach(decrement_barrier);
    }

    for entry in routed {
        let Some(target) = controllers.iter_mut().find(|c| c.id == entry.region_id) else {
            crate::protocol_violation!("routed operation targets unbound region {}", entry.region_id);
        };
        let operation = match entry.op_type {
            OperationType::Increment => Operation::increment(entry.object, 0),
            OperationType::Decrement => Operation::decrement(entry.object, 0),
        };
        target.operation_grouper.write(operation, !config.operation_grouper_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_cycle_is_eight_long_and_returns_to_start() {
        let mut phase = RegionControllerPhase::Start;
        for _ in 0..8 {
            phase = phase.next();
        }
        assert_eq!(phase, RegionControllerPhase::Start);
    }

    #[test]
    fn action_table_matches_the_protocol() {
        assert_eq!(RegionControllerPhase::Start.action(), RegionControllerAction::Receive);
        assert_eq!(RegionControllerPhase::StartBarrier.action(), RegionControllerAction::BarrierAny);
        assert_eq!(RegionControllerPhase::Enter.action(), RegionControllerAction::Send);
        assert_eq!(RegionControllerPhase::Submit.action(), RegionControllerAction::Receive);
        assert_eq!(RegionControllerPhase::SubmitBarrier.action(), RegionControllerAction::BarrierAll);
        assert_eq!(RegionControllerPhase::RetireBarrier.action(), RegionControllerAction::BarrierAll);
        assert_eq!(RegionControllerPhase::Retire.action(), RegionControllerAction::Send);
        assert_eq!(RegionControllerPhase::Leave.action(), RegionControllerAction::Send);
    }
}
