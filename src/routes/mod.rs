//! Route modules.
//!
//! Each module owns one mount point and declares the stages its routes run
//! through. The `index` module is mounted at `/`; every other module is
//! mounted at `/<name>`.

mod index;
mod secure;

use axum::{Router, middleware};
use std::sync::Arc;

use crate::server::AppState;
use crate::server::body::body_stage;
use crate::server::middleware::{LogPrefix, helpers_stage, request_log};
use crate::server::security::security_stage;
use crate::server::session::session_stage;

pub type AppRouter = Router<Arc<AppState>>;

/// A stage a route module can place in front of its handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Default caching headers.
    Helpers,
    /// Signed-cookie session loading and saving.
    Session,
    /// JSON and form body parsing.
    Body,
    /// Reject requests without a logged-in user.
    Security,
}

/// Hands route modules the stages they ask for.
#[derive(Clone)]
pub struct StageBundle {
    state: Arc<AppState>,
}

impl StageBundle {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Wrap `router` so requests pass through `stages` in the order given.
    pub fn apply(&self, router: AppRouter, stages: &[Stage]) -> AppRouter {
        // The last layer added runs first
        stages.iter().rev().fold(router, |router, stage| match stage {
            Stage::Helpers => router.layer(middleware::from_fn(helpers_stage)),
            Stage::Session => router.layer(middleware::from_fn_with_state(
                self.state.clone(),
                session_stage,
            )),
            Stage::Body => router.layer(middleware::from_fn(body_stage)),
            Stage::Security => router.layer(middleware::from_fn(security_stage)),
        })
    }
}

/// A named group of routes.
pub struct RouteModule {
    pub name: &'static str,
    pub mount: fn(AppRouter, &StageBundle) -> AppRouter,
}

/// Every route module the server mounts.
pub const ROUTES: &[RouteModule] = &[
    RouteModule {
        name: "index",
        mount: index::routes,
    },
    RouteModule {
        name: "secure",
        mount: secure::routes,
    },
];

/// Mount point of a route module.
pub fn mount_path(name: &str) -> String {
    if name == "index" {
        "/".to_string()
    } else {
        format!("/{}", name)
    }
}

/// Mount `modules` on `app`, each with its own request log prefix.
pub fn mount_all(app: AppRouter, modules: &[RouteModule], stages: &StageBundle) -> AppRouter {
    modules.iter().fold(app, |app, module| {
        let path = mount_path(module.name);
        let prefix = if path == "/" { "" } else { path.as_str() };
        let router = (module.mount)(Router::new(), stages).layer(middleware::from_fn_with_state(
            LogPrefix::new(prefix),
            request_log,
        ));
        tracing::debug!(module = module.name, path = %path, "Mounting route module");

        if path == "/" {
            app.merge(router)
        } else {
            app.nest(&path, router)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_path() {
        assert_eq!(mount_path("index"), "/");
        assert_eq!(mount_path("secure"), "/secure");
        assert_eq!(mount_path("reports"), "/reports");
    }

    #[test]
    fn test_module_names_unique() {
        let mut names: Vec<_> = ROUTES.iter().map(|m| m.name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), ROUTES.len());
    }
}
