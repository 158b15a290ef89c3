use crate::routing::Route;
use std::collections::HashMap;
use std::sync::Arc;

/// Longest-prefix path dispatcher, matching the well-known policy: exact
/// match wins over prefix; a pattern ending in `/` matches any path
/// under it; a request for the pattern without its trailing slash
/// redirects to the slash-suffixed form.
pub struct PathMux {
    exact: HashMap<String, Arc<Route>>,
    /// Prefix patterns (always end in `/`), longest first.
    prefixes: Vec<Arc<Route>>,
}

pub enum PathMatch {
    Route(Arc<Route>),
    RedirectSlash(String),
    NotFound,
}

impl PathMux {
    pub fn new() -> Self {
        Self {
            exact: HashMap::new(),
            prefixes: Vec::new(),
        }
    }

    pub fn insert(&mut self, route: Route) {
        let route = Arc::new(route);
        if route.path.ends_with('/') {
            self.prefixes.push(route);
            self.prefixes.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        } else {
            self.exact.insert(route.path.clone(), route);
        }
    }

    pub fn match_path(&self, path: &str) -> PathMatch {
        if let Some(route) = self.exact.get(path) {
            return PathMatch::Route(route.clone());
        }

        let with_slash = format!("{path}/");
        if self.prefixes.iter().any(|r| r.path == with_slash) {
            return PathMatch::RedirectSlash(with_slash);
        }

        for route in &self.prefixes {
            if path.starts_with(route.path.as_str()) {
                return PathMatch::Route(route.clone());
            }
        }

        PathMatch::NotFound
    }
}

impl Default for PathMux {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(path: &str, backend: &str) -> Route {
        Route {
            path: path.to_string(),
            backend_name: backend.to_string(),
            auth: None,
            max_rate: None,
            max_conn: 0,
        }
    }

    fn backend_of(m: PathMatch) -> String {
        match m {
            PathMatch::Route(r) => r.backend_name.clone(),
            _ => panic!("expected a route match"),
        }
    }

    #[test]
    fn path_dispatch_scenario_from_spec() {
        let mut mux = PathMux::new();
        mux.insert(route("/", "be1"));
        mux.insert(route("/api/", "be2"));
        mux.insert(route("/static/", "be3"));

        assert_eq!(backend_of(mux.match_path("/")), "be1");
        assert_eq!(backend_of(mux.match_path("/api/x")), "be2");
        assert_eq!(backend_of(mux.match_path("/static/file.bin")), "be3");

        match mux.match_path("/api") {
            PathMatch::RedirectSlash(to) => assert_eq!(to, "/api/"),
            _ => panic!("expected a redirect"),
        }
    }

    #[test]
    fn exact_match_wins_over_prefix() {
        let mut mux = PathMux::new();
        mux.insert(route("/foo", "exact-be"));
        mux.insert(route("/", "catchall-be"));

        assert_eq!(backend_of(mux.match_path("/foo")), "exact-be");
        assert_eq!(backend_of(mux.match_path("/foo/bar")), "catchall-be");
    }

    #[test]
    fn longest_prefix_wins_among_overlapping_prefixes() {
        let mut mux = PathMux::new();
        mux.insert(route("/api/", "shallow"));
        mux.insert(route("/api/v2/", "deep"));

        assert_eq!(backend_of(mux.match_path("/api/v2/users")), "deep");
        assert_eq!(backend_of(mux.match_path("/api/v1/users")), "shallow");
    }

    #[test]
    fn no_match_when_nothing_registered_and_no_slash_sibling() {
        let mux = PathMux::new();
        assert!(matches!(mux.match_path("/nope"), PathMatch::NotFound));
    }
}
