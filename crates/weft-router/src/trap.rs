//! Observer hooks fired by routers on portal-visible state changes.
//!
//! Traps are one-shot: a trap whose conditions are met fires once and is
//! removed. Handlers run user code, so they must never run under a router
//! mutex — routers collect fired traps into a [`TrapEventDispatcher`] while
//! locked and the dispatcher invokes the handlers when it drops, after the
//! lock is gone.

use std::fmt;
use std::sync::Arc;

/// Conditions a trap can watch. A small bitset, combined with `|`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[must_use]
pub struct TrapConditions(u32);

impl TrapConditions {
    pub const NONE: Self = Self(0);
    /// The peer portal closed its end of the route.
    pub const PEER_CLOSED: Self = Self(1 << 0);
    /// The route is dead: peer closed and every parcel consumed.
    pub const DEAD: Self = Self(1 << 1);
    /// A new parcel became available locally.
    pub const NEW_LOCAL_PARCEL: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for TrapConditions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Why a router is re-evaluating its traps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReason {
    NewLocalParcel,
    LocalParcelConsumed,
    PeerClosed,
}

/// Snapshot passed to trap handlers and returned by status queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortalStatus {
    pub peer_closed: bool,
    pub dead: bool,
    pub num_local_parcels: usize,
    pub num_local_bytes: usize,
    pub num_remote_parcels: usize,
    pub num_remote_bytes: usize,
}

/// A fired trap observation.
#[derive(Clone)]
pub struct TrapEvent {
    pub conditions: TrapConditions,
    pub context: u64,
    pub status: PortalStatus,
}

impl fmt::Debug for TrapEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrapEvent")
            .field("conditions", &self.conditions)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

pub type TrapHandler = Arc<dyn Fn(&TrapEvent) + Send + Sync>;

struct Trap {
    conditions: TrapConditions,
    handler: TrapHandler,
    context: u64,
}

/// Collects fired events under a router mutex and dispatches them on drop,
/// once the caller has released the lock.
#[derive(Default)]
#[must_use]
pub struct TrapEventDispatcher {
    events: Vec<(TrapHandler, TrapEvent)>,
}

impl TrapEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn defer(&mut self, handler: TrapHandler, event: TrapEvent) {
        self.events.push((handler, event));
    }
}

impl Drop for TrapEventDispatcher {
    fn drop(&mut self) {
        for (handler, event) in self.events.drain(..) {
            handler(&event);
        }
    }
}

/// The set of traps installed on one router.
#[derive(Default)]
pub struct TrapSet {
    traps: Vec<Trap>,
}

impl TrapSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.traps.is_empty()
    }

    /// Install a trap. Fails if a watched edge-triggered condition is
    /// already satisfied; the caller should consult the status instead.
    pub fn add(
        &mut self,
        conditions: TrapConditions,
        handler: TrapHandler,
        context: u64,
        status: &PortalStatus,
    ) -> Result<(), TrapConditions> {
        let satisfied = edge_conditions(status) & conditions;
        if !satisfied.is_empty() {
            return Err(satisfied);
        }
        self.traps.push(Trap {
            conditions,
            handler,
            context,
        });
        Ok(())
    }

    /// Re-evaluate every trap against `status`, deferring fired events into
    /// `dispatcher` and removing the traps that fired.
    pub fn update(
        &mut self,
        status: &PortalStatus,
        reason: UpdateReason,
        dispatcher: &mut TrapEventDispatcher,
    ) {
        let mut satisfied = edge_conditions(status);
        if reason == UpdateReason::NewLocalParcel && status.num_local_parcels > 0 {
            satisfied = satisfied | TrapConditions::NEW_LOCAL_PARCEL;
        }
        if satisfied.is_empty() {
            return;
        }

        self.traps.retain(|trap| {
            let fired = trap.conditions & satisfied;
            if fired.is_empty() {
                return true;
            }
            dispatcher.defer(
                Arc::clone(&trap.handler),
                TrapEvent {
                    conditions: fired,
                    context: trap.context,
                    status: status.clone(),
                },
            );
            false
        });
    }

    /// Drop every trap without firing. Used on close and serialization.
    pub fn remove_all(&mut self, _dispatcher: &mut TrapEventDispatcher) {
        self.traps.clear();
    }
}

/// Level-triggered conditions implied by a status snapshot.
fn edge_conditions(status: &PortalStatus) -> TrapConditions {
    let mut conditions = TrapConditions::NONE;
    if status.peer_closed {
        conditions = conditions | TrapConditions::PEER_CLOSED;
    }
    if status.dead {
        conditions = conditions | TrapConditions::DEAD;
    }
    conditions
}

impl std::ops::BitAnd for TrapConditions {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}
