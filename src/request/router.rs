//! Longest-prefix path routing to concrete handlers.

use std::sync::Arc;

use crate::request::AjpHandler;

pub struct PathRouter {
    routes: Vec<(String, Arc<dyn AjpHandler>)>,
}

impl Default for PathRouter {
    fn default() -> Self {
        PathRouter { routes: Vec::new() }
    }
}

impl PathRouter {
    pub fn new() -> PathRouter {
        PathRouter::default()
    }

    pub fn add_route(&mut self, prefix: impl Into<String>, handler: Arc<dyn AjpHandler>) {
        self.routes.push((prefix.into(), handler));
    }

    /// Resolves a normalized request path to the handler with the longest
    /// matching prefix. A prefix matches at a path-segment boundary, so
    /// `/app` matches `/app` and `/app/x` but not `/apple`.
    pub fn resolve(&self, path: &str) -> Option<(Arc<dyn AjpHandler>, &str)> {
        let mut best: Option<(&str, &Arc<dyn AjpHandler>)> = None;
        for (prefix, handler) in &self.routes {
            if !prefix_matches(prefix, path) {
                continue;
            }
            if best.map_or(true, |(b, _)| prefix.len() > b.len()) {
                best = Some((prefix.as_str(), handler));
            }
        }
        best.map(|(prefix, handler)| (handler.clone(), prefix))
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" || prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::request::{AjpRequest, AjpResponse, HandlerError};

    struct NoopHandler;

    #[async_trait]
    impl AjpHandler for NoopHandler {
        async fn handle(
            &self,
            _request: &mut AjpRequest,
            _response: &mut AjpResponse,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn router() -> PathRouter {
        let mut router = PathRouter::new();
        router.add_route("/", Arc::new(NoopHandler));
        router.add_route("/app", Arc::new(NoopHandler));
        router.add_route("/app/admin", Arc::new(NoopHandler));
        router
    }

    #[test]
    fn longest_prefix_wins() {
        let router = router();
        assert_eq!(router.resolve("/app/admin/users").unwrap().1, "/app/admin");
        assert_eq!(router.resolve("/app/x").unwrap().1, "/app");
        assert_eq!(router.resolve("/other").unwrap().1, "/");
    }

    #[test]
    fn segment_boundaries_respected() {
        let router = router();
        // `/apple` is not under `/app`.
        assert_eq!(router.resolve("/apple").unwrap().1, "/");
    }

    #[test]
    fn empty_router_resolves_nothing() {
        let router = PathRouter::new();
        assert!(router.resolve("/anything").is_none());
    }
}
