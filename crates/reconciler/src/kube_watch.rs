//! Change notifications from Kubernetes watches.
//!
//! One watcher per watched kind, narrowed by a field selector when the
//! predicate pins a name. Deletions are delivered like any other change:
//! the reconciler reads fresh state and notices the object is gone.

use std::fmt::Debug;

use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher::Event;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::predicates::Predicate;
use crate::types::{Notification, ObjectKey, ResourceKind};

/// Merged stream of Secret and Deployment changes.
///
/// Watches `namespace` when given, every namespace otherwise. Watch errors
/// are logged and the watcher restarts with backoff; the stream itself only
/// ends when both watchers do.
pub fn notifications(
    client: Client,
    namespace: Option<&str>,
    predicate: &Predicate,
) -> BoxStream<'static, Notification> {
    let secrets = watch_kind(
        scoped_api::<Secret>(client.clone(), namespace),
        ResourceKind::Secret,
        predicate,
    );
    let deployments = watch_kind(
        scoped_api::<Deployment>(client, namespace),
        ResourceKind::Deployment,
        predicate,
    );

    stream::select(secrets, deployments).boxed()
}

fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn watch_kind<K>(
    api: Api<K>,
    kind: ResourceKind,
    predicate: &Predicate,
) -> BoxStream<'static, Notification>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let mut config = watcher::Config::default();
    if let Some(name) = predicate.required_name(kind) {
        debug!(kind = %kind, name, "Narrowing watch to a single name");
        config = config.fields(&format!("metadata.name={name}"));
    }

    watcher(api, config)
        .default_backoff()
        .filter_map(move |event| {
            future::ready(match event {
                Ok(event) => changed_object(event).map(|obj| notification(kind, &obj)),
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Watch failed, retrying");
                    None
                }
            })
        })
        .boxed()
}

/// The object a watch event is about. Initial-list markers carry none.
fn changed_object<K>(event: Event<K>) -> Option<K> {
    match event {
        Event::Apply(obj) | Event::Delete(obj) | Event::InitApply(obj) => Some(obj),
        Event::Init | Event::InitDone => None,
    }
}

fn notification<K: Resource>(kind: ResourceKind, obj: &K) -> Notification {
    Notification::new(
        kind,
        ObjectKey::new(obj.namespace().unwrap_or_default(), obj.name_any()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn secret(name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                namespace: Some("upbound-system".into()),
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_changes_and_deletions_carry_the_object() {
        assert!(changed_object(Event::Apply(secret("a"))).is_some());
        assert!(changed_object(Event::Delete(secret("a"))).is_some());
        assert!(changed_object(Event::InitApply(secret("a"))).is_some());
    }

    #[test]
    fn test_list_markers_are_skipped() {
        assert!(changed_object::<Secret>(Event::Init).is_none());
        assert!(changed_object::<Secret>(Event::InitDone).is_none());
    }

    #[test]
    fn test_notification_is_keyed_by_namespace_and_name() {
        let n = notification(ResourceKind::Secret, &secret("upbound-control-plane-token"));
        assert_eq!(n.kind, ResourceKind::Secret);
        assert_eq!(
            n.key,
            ObjectKey::new("upbound-system", "upbound-control-plane-token")
        );
    }
}
