//! Route Container - name-addressable registry of service routes

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;
use wp_common::{PriorityMessage, RoutingError};

use crate::stage::ServiceRoute;

pub struct RouteContainer<T: PriorityMessage> {
    routes: DashMap<String, Arc<dyn ServiceRoute<T>>>,
}

impl<T: PriorityMessage> RouteContainer<T> {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }

    pub fn register(&self, route: Arc<dyn ServiceRoute<T>>) -> Result<(), RoutingError> {
        let name = route.name().to_string();
        match self.routes.entry(name.clone()) {
            Entry::Occupied(_) => Err(RoutingError::DuplicateRoute { name }),
            Entry::Vacant(slot) => {
                slot.insert(route);
                info!(route = %name, "Route registered");
                Ok(())
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn ServiceRoute<T>>> {
        self.routes.remove(name).map(|(_, route)| route)
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ServiceRoute<T>>, RoutingError> {
        self.routes
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RoutingError::route_not_found(None, name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn routes(&self) -> Vec<Arc<dyn ServiceRoute<T>>> {
        self.routes.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl<T: PriorityMessage> Default for RouteContainer<T> {
    fn default() -> Self {
        Self::new()
    }
}
