//! Routing profiles: which path a message follows and how duplicates of it
//! are recognised.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use wp_common::{Comparer, EqualityComparer, PriorityComparer, PriorityMessage, RoutingError, sequence_comparer};

use crate::configuration::RoutingConfiguration;
use crate::failure::{FailurePolicy, NoRetryPolicy};
use crate::request::{RouteLocation, RoutingRequest};

/// A named routing rule outcome.
pub struct RoutingProfile<T> {
    pub name: String,
    pub routes: Vec<String>,
    /// Overrides the provider-wide failure route
    pub failure_route: Option<String>,
    /// Open requests this considers equal to a new one get superseded
    pub duplicate_comparer: Option<Arc<dyn EqualityComparer<T>>>,
    /// Decides which of a set of duplicates is the latest
    pub sequence_comparer: Arc<dyn Comparer<T>>,
}

impl<T: PriorityMessage> RoutingProfile<T> {
    pub fn new<S: Into<String>>(name: impl Into<String>, routes: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            routes: routes.into_iter().map(Into::into).collect(),
            failure_route: None,
            duplicate_comparer: None,
            sequence_comparer: sequence_comparer(),
        }
    }

    pub fn with_failure_route(mut self, route: impl Into<String>) -> Self {
        self.failure_route = Some(route.into());
        self
    }

    pub fn with_duplicates<F>(mut self, equals: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.duplicate_comparer = Some(Arc::new(equals));
        self
    }

    pub fn with_sequence(mut self, comparer: Arc<dyn Comparer<T>>) -> Self {
        self.sequence_comparer = comparer;
        self
    }

    pub fn configuration(&self, default_failure_route: &str) -> RoutingConfiguration {
        RoutingConfiguration::new(
            self.routes.clone(),
            self.failure_route.as_deref().unwrap_or(default_failure_route),
        )
    }
}

/// Picks where a resumed request re-enters its path.
pub trait ContinuationProvider<T: PriorityMessage>: Send + Sync {
    /// `None` starts from the top of the path.
    fn resume_route(&self, configuration: &RoutingConfiguration, initial: &RouteLocation) -> Option<String>;
}

/// Re-runs the stage the request was interrupted in.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestartStageContinuation;

impl<T: PriorityMessage> ContinuationProvider<T> for RestartStageContinuation {
    fn resume_route(&self, configuration: &RoutingConfiguration, initial: &RouteLocation) -> Option<String> {
        let route = initial.route.as_str();
        if configuration.contains(route) || configuration.is_failure_route(route) {
            Some(route.to_string())
        } else {
            None
        }
    }
}

#[async_trait]
pub trait ProfileProvider<T: PriorityMessage>: Send + Sync {
    fn priority_comparer(&self) -> Arc<dyn Comparer<T>>;

    fn failure_route(&self) -> &str;

    fn failure_policy(&self) -> Arc<dyn FailurePolicy<T>>;

    fn continuation(&self) -> Arc<dyn ContinuationProvider<T>>;

    async fn resolve_profile(&self, message: &T) -> Result<Arc<RoutingProfile<T>>, RoutingError>;

    /// Last chance to persist anything about a request before delivery.
    async fn finalize_request(&self, request: &RoutingRequest<T>) -> anyhow::Result<()>;
}

type Matcher<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// First matching rule wins; a default profile catches the rest.
pub struct RuleProfileProvider<T: PriorityMessage> {
    rules: Vec<(Matcher<T>, Arc<RoutingProfile<T>>)>,
    default_profile: Option<Arc<RoutingProfile<T>>>,
    failure_route: String,
    failure_policy: Arc<dyn FailurePolicy<T>>,
    continuation: Arc<dyn ContinuationProvider<T>>,
    priority: Arc<dyn Comparer<T>>,
}

impl<T: PriorityMessage> RuleProfileProvider<T> {
    pub fn builder(failure_route: impl Into<String>) -> RuleProfileProviderBuilder<T> {
        RuleProfileProviderBuilder {
            provider: Self {
                rules: Vec::new(),
                default_profile: None,
                failure_route: failure_route.into(),
                failure_policy: Arc::new(NoRetryPolicy),
                continuation: Arc::new(RestartStageContinuation),
                priority: Arc::new(PriorityComparer::<T>::new()),
            },
        }
    }
}

pub struct RuleProfileProviderBuilder<T: PriorityMessage> {
    provider: RuleProfileProvider<T>,
}

impl<T: PriorityMessage> RuleProfileProviderBuilder<T> {
    pub fn rule<F>(mut self, matches: F, profile: RoutingProfile<T>) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.provider.rules.push((Arc::new(matches), Arc::new(profile)));
        self
    }

    pub fn default_profile(mut self, profile: RoutingProfile<T>) -> Self {
        self.provider.default_profile = Some(Arc::new(profile));
        self
    }

    pub fn failure_policy(mut self, policy: Arc<dyn FailurePolicy<T>>) -> Self {
        self.provider.failure_policy = policy;
        self
    }

    pub fn continuation(mut self, continuation: Arc<dyn ContinuationProvider<T>>) -> Self {
        self.provider.continuation = continuation;
        self
    }

    pub fn priority_comparer(mut self, comparer: Arc<dyn Comparer<T>>) -> Self {
        self.provider.priority = comparer;
        self
    }

    pub fn build(self) -> RuleProfileProvider<T> {
        self.provider
    }
}

#[async_trait]
impl<T: PriorityMessage> ProfileProvider<T> for RuleProfileProvider<T> {
    fn priority_comparer(&self) -> Arc<dyn Comparer<T>> {
        self.priority.clone()
    }

    fn failure_route(&self) -> &str {
        &self.failure_route
    }

    fn failure_policy(&self) -> Arc<dyn FailurePolicy<T>> {
        self.failure_policy.clone()
    }

    fn continuation(&self) -> Arc<dyn ContinuationProvider<T>> {
        self.continuation.clone()
    }

    async fn resolve_profile(&self, message: &T) -> Result<Arc<RoutingProfile<T>>, RoutingError> {
        self.rules
            .iter()
            .find(|(matches, _)| matches(message))
            .map(|(_, profile)| profile.clone())
            .or_else(|| self.default_profile.clone())
            .ok_or_else(|| {
                RoutingError::configuration(
                    Some(message.message_id()),
                    "no routing profile matches message",
                )
            })
    }

    async fn finalize_request(&self, request: &RoutingRequest<T>) -> anyhow::Result<()> {
        debug!(
            message_id = %request.message_id(),
            profile = ?request.profile().map(|profile| profile.name.clone()),
            "Request finalized"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    #[derive(Debug, Clone)]
    struct Order {
        id: Uuid,
        kind: &'static str,
    }

    impl PriorityMessage for Order {
        fn message_id(&self) -> Uuid {
            self.id
        }
        fn request_time(&self) -> DateTime<Utc> {
            Utc::now()
        }
        fn deadline(&self) -> DateTime<Utc> {
            Utc::now()
        }
        fn escalation_threshold(&self) -> chrono::Duration {
            chrono::Duration::zero()
        }
    }

    fn order(kind: &'static str) -> Order {
        Order { id: Uuid::new_v4(), kind }
    }

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let provider = RuleProfileProvider::builder("dead-letter")
            .rule(|o: &Order| o.kind == "express", RoutingProfile::new("express", ["ship"]))
            .rule(|o: &Order| o.kind.starts_with('e'), RoutingProfile::new("e-anything", ["check", "ship"]))
            .build();

        let profile = provider.resolve_profile(&order("express")).await.unwrap();
        assert_eq!(profile.name, "express");
        let profile = provider.resolve_profile(&order("economy")).await.unwrap();
        assert_eq!(profile.routes, vec!["check".to_string(), "ship".to_string()]);

        let error = provider.resolve_profile(&order("bulk")).await.err().unwrap();
        assert!(matches!(error, RoutingError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_default_profile_and_failure_route_override() {
        let provider = RuleProfileProvider::builder("dead-letter")
            .default_profile(RoutingProfile::new("standard", ["a", "b"]).with_failure_route("quarantine"))
            .build();
        let profile = provider.resolve_profile(&order("anything")).await.unwrap();
        let configuration = profile.configuration(provider.failure_route());
        assert_eq!(configuration.failure_route(), "quarantine");
        assert_eq!(configuration.first(), Some("a"));
    }

    #[test]
    fn test_restart_stage_continuation() {
        let configuration = RoutingConfiguration::new(vec!["a".to_string(), "b".to_string()], "dead-letter");
        let continuation = RestartStageContinuation;
        let resume = |route: &str| {
            ContinuationProvider::<Order>::resume_route(&continuation, &configuration, &RouteLocation::new(route))
        };
        assert_eq!(resume("b"), Some("b".to_string()));
        assert_eq!(resume("dead-letter"), Some("dead-letter".to_string()));
        assert_eq!(resume("retired-stage"), None);
    }
}
