// Subscription expiry
// Sweeps expired connections and subscriptions, and garbage-collects erased resources

use std::sync::Arc;

use tracing::{debug, info};

use crate::model::resource::{Health, ResourceType};
use crate::model::NodeModel;

use super::ws::QueryWsConnections;

/// The expiry sweep task.
///
/// Wakes when the least healthy resource's grace period passes. Expired
/// connection grains are dropped (closing their WebSocket connections) and
/// non-persistent subscriptions with no remaining connections are erased.
/// Resources erased one `events_expiry_interval` ago are forgotten outright.
pub async fn expiry_task(model: Arc<NodeModel>, connections: Arc<QueryWsConnections>) {
    let mut updates = model.watch_updates();

    info!("starting subscription expiry");

    loop {
        let expiry_interval = model.settings.read().await.events_expiry_interval;
        let least_health = model.node_resources.read().await.least_health();

        let deadline = least_health.map(|least| {
            let expires = least + expiry_interval + 1;
            tokio::time::Instant::now()
                + std::time::Duration::from_secs(expires.saturating_sub(Health::now()))
        });

        tokio::select! {
            _ = model.shutdown.cancelled() => break,
            // a mutation may have introduced a less healthy resource
            _ = updates.changed() => continue,
            _ = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }

        sweep(&model, &connections).await;
        model.notify();
    }

    info!("stopping subscription expiry");
}

/// One expiry pass over the node resources.
pub async fn sweep(model: &NodeModel, connections: &QueryWsConnections) {
    let expiry_interval = model.settings.read().await.events_expiry_interval;
    let mut resources = model.node_resources.write().await;

    let now = Health::now();
    let expire_health = now.saturating_sub(expiry_interval);
    let forget_health = expire_health.saturating_sub(expiry_interval);

    for id in resources.ids_less_healthy_than(expire_health) {
        let Some(resource) = resources.find(&id) else { continue };
        if !resource.has_data() {
            // already erased; forgotten below once its time comes
            continue;
        }
        match resource.resource_type {
            ResourceType::Grain => {
                let subscription_id = resource.data["subscription_id"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                debug!(grain_id = %id, "expiring connection");
                connections.close(&id);
                let _ = resources.erase(&id, true);
                if resources.contains(&subscription_id) {
                    let _ = resources.modify(&subscription_id, |subscription| {
                        subscription.sub_resources.remove(&id);
                    });
                }
            }
            ResourceType::Subscription => {
                let persist = resource.data["persist"].as_bool().unwrap_or(false);
                if !persist && resource.sub_resources.is_empty() {
                    debug!(subscription_id = %id, "expiring subscription");
                    let _ = resources.erase(&id, false);
                }
            }
            _ => {}
        }
    }

    resources.forget_erased(forget_health);
}
