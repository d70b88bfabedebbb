//! Route lookup.
//!
//! # Responsibilities
//! - Store compiled registrations in registration order
//! - Resolve the single best route for a path and method
//! - Report "no match" separately from "invalid parameter"
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - O(n) scan over method-filtered routes; highest score wins, earliest wins ties
//! - Parameter conversion runs only for the winner
//! - Runtime replacement swaps the whole table (copy-on-write)

use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::http::Method;

use crate::routing::matcher::RawMatch;
use crate::routing::params::{ParamError, RouteParams};
use crate::routing::registry::{EndpointKind, EndpointRegistration};

/// Lookup failure for one request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("No route matches")]
    NotFound,
    #[error(transparent)]
    InvalidParam(#[from] ParamError),
}

/// The winning route and its bound parameters.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub route: Arc<EndpointRegistration>,
    pub params: RouteParams,
}

impl Resolved {
    pub fn kind(&self) -> EndpointKind {
        self.route.kind()
    }
}

/// Immutable set of compiled routes.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<EndpointRegistration>>,
}

impl RouteTable {
    pub(crate) fn new(routes: Vec<EndpointRegistration>) -> Self {
        Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        }
    }

    /// Resolve the best route for `path` among those allowing `method`.
    pub fn resolve(&self, path: &str, method: &Method) -> Result<Resolved, ResolveError> {
        let mut best: Option<(&Arc<EndpointRegistration>, RawMatch<'_>)> = None;

        for route in self.routes.iter().filter(|r| r.template.allows(method)) {
            let Some(raw) = route.template.match_path(path) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((current, _)) => route.template.score() > current.template.score(),
            };
            if better {
                best = Some((route, raw));
            }
        }

        let (route, raw) = best.ok_or(ResolveError::NotFound)?;
        let params = route.template.bind(&raw)?;

        Ok(Resolved {
            route: Arc::clone(route),
            params,
        })
    }

    /// Registrations that should appear in generated documentation.
    pub fn documented(&self) -> impl Iterator<Item = &EndpointRegistration> {
        self.routes
            .iter()
            .map(|r| r.as_ref())
            .filter(|r| !r.flags.skip_docs)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// A route table that readers load without locking and writers replace wholesale.
#[derive(Debug, Clone)]
pub struct SharedRouteTable {
    inner: Arc<ArcSwap<RouteTable>>,
}

impl SharedRouteTable {
    pub fn new(table: RouteTable) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(table)),
        }
    }

    /// Snapshot of the current table.
    pub fn load(&self) -> Arc<RouteTable> {
        self.inner.load_full()
    }

    /// Atomically replace the table. In-flight lookups keep their snapshot.
    pub fn replace(&self, table: RouteTable) {
        let count = table.len();
        self.inner.store(Arc::new(table));
        tracing::info!(routes = count, "Route table replaced");
    }
}

impl From<RouteTable> for SharedRouteTable {
    fn from(table: RouteTable) -> Self {
        Self::new(table)
    }
}
