//! Two-phase AddressBlock teardown.
//!
//! A block carries a finalizer while it is in use. Tearing it down first
//! removes the finalizer (the only step retried on update conflicts), then
//! deletes the object:
//!
//! `Live -> PendingDeletion -> Gone`
//!
//! A block that disappears at any step counts as gone.

use super::IpamStore;
use crate::config::RetryConfig;
use crate::error::StoreError;
use crds::BLOCK_FINALIZER;
use tracing::{debug, info};

/// Teardown progress of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Finalizer still present
    Live,
    /// Finalizer removed, object not yet deleted
    PendingDeletion,
    /// Object no longer exists
    Gone,
}

/// Removes the block finalizer and deletes the block.
pub async fn release_block(store: &dyn IpamStore, name: &str, retry: &RetryConfig) -> Result<(), StoreError> {
    let mut state = Teardown::Live;
    loop {
        debug!("AddressBlock {} teardown state {:?}", name, state);
        state = match state {
            Teardown::Live => remove_finalizer(store, name, retry).await?,
            Teardown::PendingDeletion => match store.delete_block(name).await {
                Ok(()) | Err(StoreError::NotFound(_)) => Teardown::Gone,
                Err(e) => return Err(e),
            },
            Teardown::Gone => {
                info!("Released AddressBlock {}", name);
                return Ok(());
            }
        };
    }
}

async fn remove_finalizer(store: &dyn IpamStore, name: &str, retry: &RetryConfig) -> Result<Teardown, StoreError> {
    let mut backoff = retry.backoff();
    let mut attempt = 0;

    loop {
        attempt += 1;

        let mut block = match store.get_block(name).await {
            Ok(block) => block,
            Err(StoreError::NotFound(_)) => return Ok(Teardown::Gone),
            Err(e) => return Err(e),
        };

        let finalizers = block.metadata.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.iter().any(|f| f == BLOCK_FINALIZER) {
            return Ok(Teardown::PendingDeletion);
        }
        finalizers.retain(|f| f != BLOCK_FINALIZER);

        match store.replace_block(&block).await {
            Ok(_) => return Ok(Teardown::PendingDeletion),
            Err(StoreError::NotFound(_)) => return Ok(Teardown::Gone),
            Err(StoreError::Conflict(msg)) if attempt < retry.attempts => {
                let delay = backoff.next_backoff();
                debug!(
                    "Conflict removing finalizer from AddressBlock {} (attempt {}), retrying in {:?}: {}",
                    name, attempt, delay, msg
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
