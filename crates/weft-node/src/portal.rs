//! The application-facing endpoint of a route.
//!
//! A `Portal` wraps a terminal [`Router`]. Dropping a portal closes its end
//! of the route; sending a portal inside a parcel hands the router to the
//! fabric and neutralizes the wrapper.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use weft_router::parcel::{Parcel, ParcelObject};
use weft_router::{
    ApiError, DriverObject, Node, PortalStatus, PutLimits, Router, TrapConditions, TrapHandler,
};

/// An object attached to a put or returned by a get.
#[derive(Debug)]
pub enum Attachment {
    Portal(Portal),
    Box(DriverObject),
}

/// A refused put, handing the attachments back to the caller untouched.
#[derive(Debug, thiserror::Error)]
#[error("put failed: {error}")]
pub struct PutError {
    pub error: ApiError,
    pub attachments: Vec<Attachment>,
}

/// A parcel under construction for a two-phase put. Fill [`data_mut`] and
/// attach objects, then hand it to [`Portal::send_parcel`].
///
/// [`data_mut`]: PendingParcel::data_mut
#[derive(Debug, Default)]
#[must_use]
pub struct PendingParcel {
    data: Vec<u8>,
    attachments: Vec<Attachment>,
}

impl PendingParcel {
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub fn attach(&mut self, attachment: Attachment) {
        self.attachments.push(attachment);
    }
}

pub struct Portal {
    node: Arc<Node>,
    router: Arc<Router>,
    /// Set once the router's ownership moved elsewhere (close, merge, or
    /// transmission inside a parcel); drop then leaves the route alone.
    detached: AtomicBool,
    in_two_phase_get: Mutex<bool>,
}

impl Portal {
    /// Create a connected local portal pair on `node`.
    pub fn pair(node: &Arc<Node>) -> (Portal, Portal) {
        use weft_router::local_link::{InitialLinkState, LocalRouterLink};
        use weft_core::types::LinkType;

        let router_a = Router::new();
        let router_b = Router::new();
        let (link_a, link_b) = LocalRouterLink::create_pair(
            LinkType::Central,
            (Arc::clone(&router_a), Arc::clone(&router_b)),
            InitialLinkState::Stable,
        );
        router_a.set_outward_link(link_a);
        router_b.set_outward_link(link_b);
        (
            Self::adopt(Arc::clone(node), router_a),
            Self::adopt(Arc::clone(node), router_b),
        )
    }

    /// Wrap an existing terminal router.
    pub(crate) fn adopt(node: Arc<Node>, router: Arc<Router>) -> Self {
        Self {
            node,
            router,
            detached: AtomicBool::new(false),
            in_two_phase_get: Mutex::new(false),
        }
    }

    /// The underlying router. Exposed for embedders and tests that need
    /// route-level observability.
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    /// Extract the router for transmission, neutralizing the wrapper.
    fn into_router(self) -> Arc<Router> {
        self.detach();
        Arc::clone(&self.router)
    }

    /// Send `data` and `attachments` to the peer portal.
    ///
    /// A portal cannot be sent over itself or over its own peer, and a put
    /// against a closed peer fails with `NotFound`; validation failures
    /// hand the attachments back untouched. If the peer closes in the
    /// narrow window after validation, the attachments are already
    /// committed and their routes close with the failed parcel.
    pub fn put(
        &self,
        data: &[u8],
        attachments: Vec<Attachment>,
        limits: Option<&PutLimits>,
    ) -> Result<(), PutError> {
        self.put_sealed(Arc::from(data), attachments, limits)
    }

    /// Begin a two-phase put: a parcel buffer of `num_bytes` capacity to
    /// fill in place and hand to [`send_parcel`](Self::send_parcel).
    ///
    /// With `limits`, the granted capacity shrinks to what the route can
    /// accept; a request that cannot be granted at all is
    /// `ResourceExhausted`.
    pub fn allocate_parcel(
        &self,
        num_bytes: usize,
        limits: Option<&PutLimits>,
    ) -> Result<PendingParcel, ApiError> {
        if self.router.is_peer_closed() {
            return Err(ApiError::NotFound);
        }
        let mut granted = num_bytes;
        if let Some(limits) = limits {
            granted = granted.min(self.router.outbound_capacity_in_bytes(limits));
            if granted == 0 && num_bytes > 0 {
                return Err(ApiError::ResourceExhausted);
            }
        }
        Ok(PendingParcel {
            data: Vec::with_capacity(granted),
            attachments: Vec::new(),
        })
    }

    /// Commit a two-phase put.
    pub fn send_parcel(&self, parcel: PendingParcel) -> Result<(), PutError> {
        self.put_sealed(Arc::from(parcel.data), parcel.attachments, None)
    }

    fn put_sealed(
        &self,
        data: Arc<[u8]>,
        attachments: Vec<Attachment>,
        limits: Option<&PutLimits>,
    ) -> Result<(), PutError> {
        for attachment in &attachments {
            if let Attachment::Portal(portal) = attachment {
                let router = portal.router();
                if Arc::ptr_eq(router, &self.router) || self.router.has_local_peer(router) {
                    return Err(PutError {
                        error: ApiError::InvalidArgument,
                        attachments,
                    });
                }
            }
        }
        if self.router.is_peer_closed() {
            return Err(PutError {
                error: ApiError::NotFound,
                attachments,
            });
        }
        if let Some(limits) = limits
            && self.router.outbound_capacity_in_bytes(limits) < data.len()
        {
            return Err(PutError {
                error: ApiError::ResourceExhausted,
                attachments,
            });
        }

        let objects = attachments
            .into_iter()
            .map(|attachment| match attachment {
                Attachment::Portal(portal) => ParcelObject::Portal(portal.into_router()),
                Attachment::Box(object) => ParcelObject::Box(object),
            })
            .collect();
        let parcel = Parcel::new(data, objects);

        match self.router.send_outbound_parcel(parcel) {
            Ok(()) => Ok(()),
            Err(send_error) => {
                // The attachments were already converted; their portals
                // cannot come back, so their routes close like any other
                // abandoned endpoint.
                let mut parcel = send_error.parcel;
                for object in parcel.take_objects() {
                    if let ParcelObject::Portal(router) = object {
                        router.close_route();
                    }
                }
                Err(PutError {
                    error: send_error.error,
                    attachments: Vec::new(),
                })
            }
        }
    }

    /// Receive the next parcel in order.
    pub fn get(&self) -> Result<(Vec<u8>, Vec<Attachment>), ApiError> {
        let mut parcel = self.router.get_next_inbound_parcel()?;
        let data = parcel.data().to_vec();
        let attachments = self.wrap_objects(parcel.take_objects());
        Ok((data, attachments))
    }

    /// Begin a two-phase receive: a zero-copy view of the next parcel's
    /// data plus its attachment count. The parcel stays queued until
    /// [`commit_get`](Self::commit_get) or [`abort_get`](Self::abort_get).
    pub fn begin_get(&self) -> Result<(Arc<[u8]>, usize), ApiError> {
        let mut in_two_phase_get = lock(&self.in_two_phase_get);
        if *in_two_phase_get {
            return Err(ApiError::AlreadyExists);
        }
        if self.router.is_route_dead() {
            return Err(ApiError::NotFound);
        }
        let view = self.router.begin_get()?;
        *in_two_phase_get = true;
        Ok(view)
    }

    /// Consume the parcel exposed by `begin_get`.
    pub fn commit_get(&self, num_bytes_consumed: usize) -> Result<Vec<Attachment>, ApiError> {
        let mut in_two_phase_get = lock(&self.in_two_phase_get);
        if !*in_two_phase_get {
            return Err(ApiError::FailedPrecondition);
        }
        let objects = self.router.commit_get(num_bytes_consumed)?;
        *in_two_phase_get = false;
        Ok(self.wrap_objects(objects))
    }

    /// Abandon a two-phase receive, leaving the parcel queued.
    pub fn abort_get(&self) -> Result<(), ApiError> {
        let mut in_two_phase_get = lock(&self.in_two_phase_get);
        if !*in_two_phase_get {
            return Err(ApiError::FailedPrecondition);
        }
        *in_two_phase_get = false;
        Ok(())
    }

    /// Close this end of the route.
    pub fn close(self) {
        // Drop does the work.
    }

    /// Splice this portal's route to `other`'s. Both portals become inert;
    /// their routes' remote ends are now each other's peers. Valid only on
    /// never-used portals.
    pub fn merge(&self, other: &Portal) -> Result<(), ApiError> {
        self.router.merge_route(other.router())?;
        self.detach();
        other.detach();
        Ok(())
    }

    pub fn query_status(&self) -> PortalStatus {
        self.router.query_status()
    }

    /// Install a one-shot observer for `conditions`.
    pub fn trap(
        &self,
        conditions: TrapConditions,
        handler: TrapHandler,
        context: u64,
    ) -> Result<(), ApiError> {
        self.router.trap(conditions, handler, context)
    }

    fn wrap_objects(&self, objects: Vec<ParcelObject>) -> Vec<Attachment> {
        objects
            .into_iter()
            .map(|object| match object {
                ParcelObject::Portal(router) => {
                    Attachment::Portal(Portal::adopt(Arc::clone(&self.node), router))
                }
                ParcelObject::Box(object) => Attachment::Box(object),
            })
            .collect()
    }
}

impl std::fmt::Debug for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Portal")
            .field("node", &self.node.name())
            .field("detached", &self.detached.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Drop for Portal {
    fn drop(&mut self) {
        if !self.detached.load(Ordering::Acquire) {
            self.router.close_route();
        }
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
