// Shared node model
// The resource stores, settings and notification plumbing shared by every task

pub mod api_version;
pub mod resource;
pub mod store;
pub mod tai;

pub use api_version::ApiVersion;
pub use resource::{make_id, Health, Resource, ResourceType};
pub use store::ResourceStore;
pub use tai::Tai;

use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::settings::Settings;

/// The shared state every long-lived task operates on.
///
/// Each resource domain has its own store (IS-04 resources plus
/// subscriptions and grains; IS-05 connection resources; IS-08 channel
/// mapping outputs), all guarded by reader-writer locks. A single watch
/// channel stands in for the model's condition variable: every mutation
/// bumps it after releasing the write lock, and waiting tasks re-check
/// their predicates whenever it changes.
pub struct NodeModel {
    pub settings: RwLock<Settings>,
    pub node_resources: RwLock<ResourceStore>,
    pub connection_resources: RwLock<ResourceStore>,
    pub channelmapping_resources: RwLock<ResourceStore>,
    pub shutdown: CancellationToken,
    update_tx: watch::Sender<u64>,
}

impl NodeModel {
    pub fn new(settings: Settings) -> Arc<Self> {
        let (update_tx, _) = watch::channel(0);
        Arc::new(NodeModel {
            settings: RwLock::new(settings),
            node_resources: RwLock::new(ResourceStore::new()),
            connection_resources: RwLock::new(ResourceStore::new()),
            channelmapping_resources: RwLock::new(ResourceStore::new()),
            shutdown: CancellationToken::new(),
            update_tx,
        })
    }

    /// Wake every task waiting on the model.
    ///
    /// Call after releasing the write lock under which a mutation was made.
    pub fn notify(&self) {
        self.update_tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// A receiver that resolves whenever the model is notified.
    ///
    /// Obtain the receiver before reading the state a predicate depends on,
    /// so a notification between the read and the wait is not missed.
    pub fn watch_updates(&self) -> watch::Receiver<u64> {
        self.update_tx.subscribe()
    }

    /// Request shutdown and wake all waiting tasks.
    pub fn controlled_shutdown(&self) {
        self.shutdown.cancel();
        self.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_wakes_watcher() {
        let model = NodeModel::new(Settings::default());
        let mut updates = model.watch_updates();

        let waiter = {
            let model = model.clone();
            tokio::spawn(async move {
                updates.changed().await.is_ok() && !model.shutdown.is_cancelled()
            })
        };

        // let the waiter subscribe before notifying
        tokio::task::yield_now().await;
        model.notify();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_cancels() {
        let model = NodeModel::new(Settings::default());
        model.controlled_shutdown();
        assert!(model.shutdown.is_cancelled());
    }
}
