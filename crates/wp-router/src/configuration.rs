//! Routing Configuration - the ordered path a request follows

use serde::{Deserialize, Serialize};

/// Linked-list view over a request's routes plus its failure route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfiguration {
    path: Vec<String>,
    failure_route: String,
}

impl RoutingConfiguration {
    pub fn new(path: Vec<String>, failure_route: impl Into<String>) -> Self {
        Self {
            path,
            failure_route: failure_route.into(),
        }
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn first(&self) -> Option<&str> {
        self.path.first().map(String::as_str)
    }

    pub fn last(&self) -> Option<&str> {
        self.path.last().map(String::as_str)
    }

    /// The route after `route`, or `None` at the end of the path or when
    /// `route` is not on it.
    pub fn next_after(&self, route: &str) -> Option<&str> {
        let index = self.path.iter().position(|name| name == route)?;
        self.path.get(index + 1).map(String::as_str)
    }

    pub fn contains(&self, route: &str) -> bool {
        self.path.iter().any(|name| name == route)
    }

    pub fn is_last(&self, route: &str) -> bool {
        self.last() == Some(route)
    }

    pub fn failure_route(&self) -> &str {
        &self.failure_route
    }

    pub fn is_failure_route(&self, route: &str) -> bool {
        self.failure_route == route
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RoutingConfiguration {
        RoutingConfiguration::new(
            vec!["validate".to_string(), "enrich".to_string(), "deliver".to_string()],
            "dead-letter",
        )
    }

    #[test]
    fn test_path_navigation() {
        let config = config();
        assert_eq!(config.first(), Some("validate"));
        assert_eq!(config.last(), Some("deliver"));
        assert_eq!(config.next_after("validate"), Some("enrich"));
        assert_eq!(config.next_after("deliver"), None);
        assert_eq!(config.next_after("unknown"), None);
        assert!(config.is_last("deliver"));
        assert!(!config.is_last("enrich"));
        assert!(config.is_failure_route("dead-letter"));
        assert!(!config.contains("dead-letter"));
    }

    #[test]
    fn test_empty_path() {
        let config = RoutingConfiguration::new(Vec::new(), "dead-letter");
        assert_eq!(config.first(), None);
        assert!(!config.is_last("dead-letter"));
    }
}
