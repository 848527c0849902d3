use std::sync::Arc;

use crate::db::models::ScenarioStatus;
use crate::db::repos::{access, scenarios as scenario_repo};
use crate::engine::pool::{ConnectionHandle, PoolManager};
use crate::error::AppError;

/// Resolves an inbound request to exactly one scenario database.
///
/// The returned handle is the routing decision for the whole request: it
/// keeps pointing at the same physical database even if a promote repoints
/// the alias while the request is running.
pub struct RequestRouter {
    pools: Arc<PoolManager>,
}

impl RequestRouter {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self { pools }
    }

    /// Route `user` to `requested`, or to their primary scenario when omitted.
    ///
    /// `NotFound` and `Forbidden` are kept apart here and in the logs, but
    /// serialize to the same external error.
    pub fn route(&self, user: &str, requested: Option<&str>) -> Result<ConnectionHandle, AppError> {
        let result = self.decide(user, requested);
        match &result {
            Ok(handle) => {
                tracing::debug!(
                    user = %user,
                    scenario = %handle.scenario(),
                    storage = %handle.storage(),
                    "Request routed"
                );
            }
            Err(e) => {
                tracing::warn!(
                    user = %user,
                    scenario = requested.unwrap_or("<primary>"),
                    reason = e.reason(),
                    error = %e,
                    "Routing denied"
                );
            }
        }
        result
    }

    fn decide(&self, user: &str, requested: Option<&str>) -> Result<ConnectionHandle, AppError> {
        let control = self.pools.control();
        let name = match requested {
            Some(name) => name.to_string(),
            None => access::primary_for(control, user)?.ok_or_else(|| {
                AppError::Forbidden(format!("User {user} has no authorized scenario"))
            })?,
        };

        let scenario = scenario_repo::find(control, &name)?
            .ok_or_else(|| AppError::NotFound(format!("Scenario {name}")))?;

        if !access::authorize(control, user, &name)? {
            return Err(AppError::Forbidden(format!(
                "User {user} is not authorized for scenario {name}"
            )));
        }

        if !scenario.is_production && scenario.status != ScenarioStatus::InUse {
            return Err(AppError::Forbidden(format!(
                "Scenario {name} is {} and not routable",
                scenario.status
            )));
        }

        self.pools.resolve(&name)
    }

    /// Route by URL prefix. A leading path segment naming a registered
    /// scenario selects it and is stripped; any other path goes to the
    /// user's primary scenario unchanged.
    pub fn route_path(
        &self,
        user: &str,
        path: &str,
    ) -> Result<(ConnectionHandle, String), AppError> {
        let trimmed = path.trim_start_matches('/');
        let (first, rest) = match trimmed.split_once('/') {
            Some((first, rest)) => (first, format!("/{rest}")),
            None => (trimmed, "/".to_string()),
        };

        if !first.is_empty() {
            if scenario_repo::find(self.pools.control(), first)?.is_some() {
                let handle = self.route(user, Some(first))?;
                return Ok((handle, rest));
            }
        }

        let handle = self.route(user, None)?;
        Ok((handle, path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::pool::tests::manager;

    fn setup() -> (tempfile::TempDir, Arc<PoolManager>, RequestRouter) {
        let (dir, manager) = manager();
        let control = manager.control();
        scenario_repo::create(control, "qa", None).unwrap();
        scenario_repo::set_status(control, "qa", ScenarioStatus::Busy).unwrap();
        scenario_repo::set_status(control, "qa", ScenarioStatus::InUse).unwrap();
        scenario_repo::create(control, "spare", None).unwrap();
        let router = RequestRouter::new(manager.clone());
        (dir, manager, router)
    }

    #[test]
    fn test_route_to_primary_when_omitted() {
        let (_dir, manager, router) = setup();
        access::grant(manager.control(), "alice", "qa").unwrap();
        access::grant(manager.control(), "alice", "default").unwrap();

        let handle = router.route("alice", None).unwrap();
        assert_eq!(handle.scenario(), "qa");

        assert!(matches!(router.route("nobody", None), Err(AppError::Forbidden(_))));
    }

    #[test]
    fn test_unauthorized_scenario_is_forbidden() {
        let (_dir, manager, router) = setup();
        access::grant(manager.control(), "bob", "default").unwrap();

        let err = router.route("bob", Some("qa")).unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        assert_eq!(err.kind(), "access_denied");

        let missing = router.route("bob", Some("ghost")).unwrap_err();
        assert!(matches!(missing, AppError::NotFound(_)));
        assert_eq!(missing.kind(), err.kind());

        assert_eq!(router.route("bob", Some("default")).unwrap().scenario(), "default");
    }

    #[test]
    fn test_free_scenario_is_not_routable() {
        let (_dir, manager, router) = setup();
        access::grant(manager.control(), "carol", "spare").unwrap();
        assert!(matches!(router.route("carol", Some("spare")), Err(AppError::Forbidden(_))));
    }

    #[test]
    fn test_route_path_strips_visible_prefix() {
        let (_dir, manager, router) = setup();
        access::grant(manager.control(), "alice", "default").unwrap();
        access::grant(manager.control(), "alice", "qa").unwrap();

        let (handle, path) = router.route_path("alice", "/qa/input/item/").unwrap();
        assert_eq!(handle.scenario(), "qa");
        assert_eq!(path, "/input/item/");

        let (handle, path) = router.route_path("alice", "/input/item/").unwrap();
        assert_eq!(handle.scenario(), "default");
        assert_eq!(path, "/input/item/");

        let (handle, path) = router.route_path("alice", "/qa").unwrap();
        assert_eq!(handle.scenario(), "qa");
        assert_eq!(path, "/");

        // Unknown prefix is just a path
        let (handle, path) = router.route_path("alice", "/ghost/input/").unwrap();
        assert_eq!(handle.scenario(), "default");
        assert_eq!(path, "/ghost/input/");

        assert!(matches!(
            router.route_path("alice", "/spare/input/"),
            Err(AppError::Forbidden(_))
        ));
    }
}
