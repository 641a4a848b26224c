//! Idempotent create-or-update of a Deployment.

use k8s_openapi::api::apps::v1::Deployment;
use tracing::debug;

use crate::error::StoreResult;
use crate::store::{ObjectStore, key_of};
use crate::types::OperationResult;

/// Fetch the Deployment named by `template`, or start from `template` when it
/// does not exist, apply `mutate` to an in-memory copy, then write it back.
///
/// The live object keeps everything `mutate` does not touch, including its
/// resource version, so the update is a compare-and-swap: if another writer
/// got there first the store answers with a conflict, which is returned
/// as-is. Nothing is written when the mutation leaves the live object
/// unchanged.
///
/// # Errors
///
/// Returns the first store error encountered.
pub async fn create_or_update<S, F>(
    store: &S,
    template: Deployment,
    mutate: F,
) -> StoreResult<OperationResult>
where
    S: ObjectStore + ?Sized,
    F: FnOnce(&mut Deployment) + Send,
{
    let key = key_of(&template.metadata);

    match store.get_deployment(&key).await {
        Ok(existing) => {
            let mut desired = existing.clone();
            mutate(&mut desired);

            if desired == existing {
                debug!(key = %key, "Deployment already up to date");
                return Ok(OperationResult::Unchanged);
            }

            store.update_deployment(&desired).await?;
            Ok(OperationResult::Updated)
        }
        Err(e) if e.is_not_found() => {
            let mut desired = template;
            mutate(&mut desired);

            store.create_deployment(&desired).await?;
            Ok(OperationResult::Created)
        }
        Err(e) => Err(e),
    }
}
