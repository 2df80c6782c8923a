//! Built-in health probes.
//!
//! Orchestrators ask each worker two questions, and the worker answers them
//! itself without contacting any origin.
//!
//! | Probe | Path | Question |
//! |---|---|---|
//! | **Liveness** | `/healthz` | Is the worker alive? Failure → restart. |
//! | **Readiness** | `/readyz` | Can it take traffic? Failure → pulled from rotation. |
//!
//! Only `GET` and `HEAD` are answered here; any other method on these paths
//! is proxied like any other request.

use http::{Method, Response, StatusCode};
use matchit::Router as MatchitRouter;

use crate::body::Body;
use crate::response;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Probe {
    Liveness,
    Readiness,
}

/// Table of paths the gateway answers locally. Looked up before the route
/// classifier runs.
pub struct Probes {
    routes: MatchitRouter<Probe>,
}

impl Probes {
    pub fn new() -> Self {
        let mut routes = MatchitRouter::new();
        for (path, probe) in [("/healthz", Probe::Liveness), ("/readyz", Probe::Readiness)] {
            routes.insert(path, probe)
                .unwrap_or_else(|e| panic!("invalid probe route `{path}`: {e}"));
        }
        Self { routes }
    }

    pub fn lookup(&self, method: &Method, path: &str) -> Option<Probe> {
        if *method != Method::GET && *method != Method::HEAD {
            return None;
        }
        self.routes.at(path).ok().map(|matched| *matched.value)
    }

    pub fn respond(&self, method: &Method, path: &str) -> Option<Response<Body>> {
        self.lookup(method, path).map(|probe| match probe {
            Probe::Liveness => liveness(),
            Probe::Readiness => readiness(),
        })
    }
}

impl Default for Probes {
    fn default() -> Self { Self::new() }
}

/// Always `200 OK`, body `ok`. If the worker can answer at all it is alive.
pub fn liveness() -> Response<Body> {
    response::text(StatusCode::OK, "ok")
}

/// `200 OK`, body `ready`. Origins are not probed: a worker with a dead
/// origin still answers, with 503s, and pulling it would not help.
pub fn readiness() -> Response<Body> {
    response::text(StatusCode::OK, "ready")
}
