//! Event filtering by predicate composition.
//!
//! A predicate is a small boolean expression over the kind and name of the
//! object that changed. The watch layer evaluates it on every notification
//! and drops the ones that do not match.

use crate::types::{AGENT_DEPLOYMENT, ResourceKind};

/// Boolean expression over (kind, name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Object is of the given kind.
    Kind(ResourceKind),
    /// Object has exactly the given name.
    Named(String),
    /// At least one inner predicate holds. Empty is false.
    AnyOf(Vec<Predicate>),
    /// Every inner predicate holds. Empty is true.
    AllOf(Vec<Predicate>),
}

impl Predicate {
    /// Match on kind.
    pub const fn kind(kind: ResourceKind) -> Self {
        Self::Kind(kind)
    }

    /// Match on name.
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    /// Evaluate against a changed object.
    pub fn evaluate(&self, kind: ResourceKind, name: &str) -> bool {
        match self {
            Self::Kind(k) => *k == kind,
            Self::Named(n) => n == name,
            Self::AnyOf(inner) => inner.iter().any(|p| p.evaluate(kind, name)),
            Self::AllOf(inner) => inner.iter().all(|p| p.evaluate(kind, name)),
        }
    }

    /// The single name this predicate requires for objects of `kind`, if it
    /// pins one. Watchers use it to narrow their field selector.
    pub fn required_name(&self, kind: ResourceKind) -> Option<&str> {
        match self {
            Self::Kind(_) | Self::Named(_) => None,
            Self::AllOf(inner) => {
                let kind_matches = inner
                    .iter()
                    .any(|p| matches!(p, Self::Kind(k) if *k == kind));
                if !kind_matches {
                    return None;
                }
                inner.iter().find_map(|p| match p {
                    Self::Named(n) => Some(n.as_str()),
                    _ => None,
                })
            }
            Self::AnyOf(inner) => inner.iter().find_map(|p| p.required_name(kind)),
        }
    }
}

/// Filter for the agent controller: the token Secret, or the agent
/// Deployment.
pub fn agent_watch_predicate(token_secret_name: &str) -> Predicate {
    Predicate::AnyOf(vec![
        Predicate::AllOf(vec![
            Predicate::kind(ResourceKind::Secret),
            Predicate::named(token_secret_name),
        ]),
        Predicate::AllOf(vec![
            Predicate::kind(ResourceKind::Deployment),
            Predicate::named(AGENT_DEPLOYMENT),
        ]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "upbound-control-plane-token";

    #[test]
    fn accepts_token_secret() {
        let p = agent_watch_predicate(TOKEN);
        assert!(p.evaluate(ResourceKind::Secret, TOKEN));
    }

    #[test]
    fn accepts_agent_deployment() {
        let p = agent_watch_predicate(TOKEN);
        assert!(p.evaluate(ResourceKind::Deployment, AGENT_DEPLOYMENT));
    }

    #[test]
    fn rejects_other_secrets_and_deployments() {
        let p = agent_watch_predicate(TOKEN);
        assert!(!p.evaluate(ResourceKind::Secret, "some-other-secret"));
        assert!(!p.evaluate(ResourceKind::Deployment, "crossplane"));
    }

    #[test]
    fn rejects_name_match_on_wrong_kind() {
        let p = agent_watch_predicate(TOKEN);
        assert!(!p.evaluate(ResourceKind::Deployment, TOKEN));
        assert!(!p.evaluate(ResourceKind::Secret, AGENT_DEPLOYMENT));
        assert!(!p.evaluate(ResourceKind::ConfigMap, TOKEN));
    }

    #[test]
    fn empty_compositions() {
        assert!(!Predicate::AnyOf(vec![]).evaluate(ResourceKind::Secret, "x"));
        assert!(Predicate::AllOf(vec![]).evaluate(ResourceKind::Secret, "x"));
    }

    #[test]
    fn required_name_per_kind() {
        let p = agent_watch_predicate(TOKEN);
        assert_eq!(p.required_name(ResourceKind::Secret), Some(TOKEN));
        assert_eq!(
            p.required_name(ResourceKind::Deployment),
            Some(AGENT_DEPLOYMENT)
        );
        assert_eq!(p.required_name(ResourceKind::ConfigMap), None);
    }
}
