//! Diff engines for ordered collections.
//!
//! Routes and service bindings are both diffed with [`diff`]: given the
//! current and desired sequences and an equality predicate, it yields what to
//! remove and what to add, preserving input order on both sides.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{AppSpec, RouteSpec, ServiceBinding};
use crate::state::AppState;

/// Items to remove and add to turn one sequence into another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListDiff<T> {
    /// Items present now but not desired, in current order.
    pub to_remove: Vec<T>,
    /// Items desired but not present, in desired order.
    pub to_add: Vec<T>,
}

impl<T> ListDiff<T> {
    /// Returns true when both sides already agree.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty() && self.to_add.is_empty()
    }
}

impl<T> Default for ListDiff<T> {
    fn default() -> Self {
        Self {
            to_remove: Vec::new(),
            to_add: Vec::new(),
        }
    }
}

/// Computes `(to_remove, to_add)` between two sequences.
pub fn diff<T, F>(current: &[T], desired: &[T], eq: F) -> ListDiff<T>
where
    T: Clone,
    F: Fn(&T, &T) -> bool,
{
    ListDiff {
        to_remove: current
            .iter()
            .filter(|c| !desired.iter().any(|d| eq(c, d)))
            .cloned()
            .collect(),
        to_add: desired
            .iter()
            .filter(|d| !current.iter().any(|c| eq(c, d)))
            .cloned()
            .collect(),
    }
}

/// Identity of a route mapping: the route and the application port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouteKey {
    /// Route guid.
    pub route: String,
    /// Application port.
    pub port: u16,
}

impl RouteKey {
    /// Creates a key.
    #[must_use]
    pub fn new(route: impl Into<String>, port: u16) -> Self {
        Self {
            route: route.into(),
            port,
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.route, self.port)
    }
}

/// Key of a declared route, resolving an unset port against `app`.
#[must_use]
pub fn route_key(app: &AppSpec, route: &RouteSpec) -> RouteKey {
    RouteKey::new(route.route.clone(), app.route_port(route))
}

/// Keys of every route the application declares.
#[must_use]
pub fn desired_route_keys(app: &AppSpec) -> Vec<RouteKey> {
    app.routes.iter().map(|r| route_key(app, r)).collect()
}

/// Keys of every mapping the application currently has.
#[must_use]
pub fn current_route_keys(current: &AppState) -> Vec<RouteKey> {
    current
        .route_mappings
        .iter()
        .map(|m| RouteKey::new(m.route.clone(), m.port))
        .collect()
}

/// Route mappings to remove and add.
#[must_use]
pub fn route_diff(current: &AppState, desired: &AppSpec) -> ListDiff<RouteKey> {
    diff(
        &current_route_keys(current),
        &desired_route_keys(desired),
        RouteKey::eq,
    )
}

/// Binding equality: same service instance and deep-equal parameters.
#[must_use]
pub fn bindings_equal(a: &ServiceBinding, b: &ServiceBinding) -> bool {
    a.service_instance == b.service_instance && a.params == b.params
}

/// Service bindings to remove and add.
///
/// A binding whose parameters changed appears on both sides; removals run
/// first so the instance is never bound twice.
#[must_use]
pub fn binding_diff(current: &AppState, desired: &AppSpec) -> ListDiff<ServiceBinding> {
    diff(
        &current.spec.service_bindings,
        &desired.service_bindings,
        bindings_equal,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BindingParams;
    use serde_json::json;

    fn binding(si: &str, params: serde_json::Value) -> ServiceBinding {
        ServiceBinding {
            service_instance: si.to_string(),
            params: BindingParams(params),
        }
    }

    #[test]
    fn test_diff_preserves_order() {
        let current = vec![1, 2, 3, 4];
        let desired = vec![5, 4, 2, 6];

        let result = diff(&current, &desired, |a, b| a == b);

        assert_eq!(result.to_remove, vec![1, 3]);
        assert_eq!(result.to_add, vec![5, 6]);
    }

    #[test]
    fn test_identical_sequences_have_empty_diff() {
        let items = vec!["a", "b"];
        assert!(diff(&items, &items, |a, b| a == b).is_empty());
    }

    #[test]
    fn test_route_key_defaults_port() {
        let mut app: AppSpec = serde_yaml::from_str(
            "name: a\nspace: s\nsource:\n  path: ./x\nroutes:\n  - route: r1\n  - route: r2\n    port: 9090\n",
        )
        .expect("app");

        assert_eq!(
            desired_route_keys(&app),
            vec![RouteKey::new("r1", 8080), RouteKey::new("r2", 9090)]
        );

        app.ports = vec![7000];
        assert_eq!(route_key(&app, &app.routes[0]), RouteKey::new("r1", 7000));
    }

    #[test]
    fn test_binding_param_change_is_remove_then_add() {
        let current = vec![binding("si-1", json!({"plan": "small"})), binding("si-2", json!({}))];
        let desired = vec![binding("si-1", json!({"plan": "large"})), binding("si-2", json!({}))];

        let result = diff(&current, &desired, bindings_equal);

        assert_eq!(result.to_remove, vec![current[0].clone()]);
        assert_eq!(result.to_add, vec![desired[0].clone()]);
    }

    #[test]
    fn test_binding_params_compare_structurally() {
        let from_map = binding("si-1", json!({"a": 1, "b": [1, 2]}));
        let from_json = ServiceBinding {
            service_instance: String::from("si-1"),
            params: BindingParams::from_json(r#"{"b":[1,2],"a":1}"#).expect("json"),
        };
        assert!(bindings_equal(&from_map, &from_json));

        let empty_a = ServiceBinding {
            service_instance: String::from("si-1"),
            params: BindingParams::from_json("").expect("empty"),
        };
        let empty_b = binding("si-1", json!({}));
        assert!(bindings_equal(&empty_a, &empty_b));
    }
}
