// Tests for the node registration behaviour

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::*;
use crate::authorization::AuthorizationState;
use crate::dnssd::MemoryDnsSd;
use crate::events::insert_resource;
use crate::model::resource::{Health, Resource};
use crate::model::NodeModel;

const V1_3: ApiVersion = ApiVersion::new(1, 3);

fn resolved(name: &str, pri: &str, api_ver: &str) -> ResolvedService {
    let mut txt = TxtRecords::new();
    txt.insert("pri".to_string(), pri.to_string());
    if !api_ver.is_empty() {
        txt.insert("api_ver".to_string(), api_ver.to_string());
    }
    ResolvedService {
        name: name.to_string(),
        host: "localhost".to_string(),
        port: 8080,
        txt,
    }
}

#[test]
fn test_service_selection_orders_by_priority() {
    let settings = Settings::default();
    let services = select_registration_services(
        &[
            resolved("backup", "200", "v1.2,v1.3"),
            resolved("primary", "10", "v1.3"),
        ],
        &settings,
    );
    assert_eq!(services.len(), 2);
    assert_eq!(services[0].priority, 10);
    assert_eq!(services[0].version, V1_3);
    assert_eq!(services[1].priority, 200);
}

#[test]
fn test_service_selection_filters_priority_bounds() {
    let mut settings = Settings::default();
    settings.lowest_pri = 100;
    let services = select_registration_services(
        &[resolved("too-low", "200", "v1.3"), resolved("ok", "50", "v1.3")],
        &settings,
    );
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].priority, 50);
}

#[test]
fn test_service_selection_picks_highest_common_version() {
    let settings = Settings::default();
    let services =
        select_registration_services(&[resolved("old", "10", "v1.0,v1.1,v1.2")], &settings);
    assert_eq!(services[0].version, ApiVersion::new(1, 2));

    // a registry advertising nothing in common is skipped
    let services = select_registration_services(&[resolved("alien", "10", "v9.0")], &settings);
    assert!(services.is_empty());
}

// A minimal in-process Registration API for exercising the behaviour

#[derive(Default)]
struct FakeRegistry {
    registrations: Mutex<Vec<(String, String)>>,
    heartbeats: Mutex<Vec<String>>,
    deletions: Mutex<Vec<String>>,
    heartbeat_status: Mutex<StatusCode>,
}

impl FakeRegistry {
    fn new() -> Arc<Self> {
        Arc::new(FakeRegistry {
            heartbeat_status: Mutex::new(StatusCode::OK),
            ..FakeRegistry::default()
        })
    }

    async fn serve(self: &Arc<Self>) -> SocketAddr {
        let registry = self.clone();
        let app = Router::new()
            .route(
                "/x-nmos/registration/v1.3/resource",
                post(
                    |State(registry): State<Arc<FakeRegistry>>, Json(body): Json<Value>| async move {
                        let resource_type = body["type"].as_str().unwrap_or_default().to_string();
                        let id = body["data"]["id"].as_str().unwrap_or_default().to_string();
                        registry.registrations.lock().await.push((resource_type, id));
                        StatusCode::CREATED
                    },
                ),
            )
            .route(
                "/x-nmos/registration/v1.3/health/nodes/:id",
                post(
                    |State(registry): State<Arc<FakeRegistry>>, Path(id): Path<String>| async move {
                        registry.heartbeats.lock().await.push(id);
                        *registry.heartbeat_status.lock().await
                    },
                ),
            )
            .route(
                "/x-nmos/registration/v1.3/resource/:type/:id",
                delete(
                    |State(registry): State<Arc<FakeRegistry>>,
                     Path((_, id)): Path<(String, String)>| async move {
                        registry.deletions.lock().await.push(id);
                        StatusCode::NO_CONTENT
                    },
                ),
            )
            .with_state(registry);

        let server =
            axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(app.into_make_service());
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }
}

async fn test_model(registry_addr: SocketAddr) -> (Arc<NodeModel>, String) {
    let mut settings = Settings::default();
    settings.registration_heartbeat_interval = 1;
    settings.discovery_backoff_min = 0.1;
    settings.discovery_backoff_max = 0.2;
    settings.registry_address = Some(format!("http://{}", registry_addr));
    let node_id = settings.node_id.clone();
    let model = NodeModel::new(settings);

    {
        let mut resources = model.node_resources.write().await;
        insert_resource(
            &mut resources,
            Resource::new(
                ResourceType::Node,
                &node_id,
                V1_3,
                json!({ "id": node_id, "label": "test node" }),
                Health::Forever,
            ),
        )
        .unwrap();
        let device_id = format!("{}-device", node_id);
        insert_resource(
            &mut resources,
            Resource::new(
                ResourceType::Device,
                &device_id,
                V1_3,
                json!({ "id": device_id, "node_id": node_id }),
                Health::At(Health::now()),
            ),
        )
        .unwrap();
        let sender_id = format!("{}-sender", node_id);
        insert_resource(
            &mut resources,
            Resource::new(
                ResourceType::Sender,
                &sender_id,
                V1_3,
                json!({ "id": sender_id, "device_id": device_id }),
                Health::At(Health::now()),
            ),
        )
        .unwrap();
    }

    (model, node_id)
}

async fn wait_for(mut condition: impl FnMut() -> futures::future::BoxFuture<'static, bool>) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if condition().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_registration_sequence_and_heartbeats() {
    let registry = FakeRegistry::new();
    let addr = registry.serve().await;
    let (model, node_id) = test_model(addr).await;

    let behaviour = NodeBehaviour {
        model: model.clone(),
        auth_state: AuthorizationState::new(),
        discovery: MemoryDnsSd::new(),
        advertiser: MemoryDnsSd::new(),
    };
    let task = tokio::spawn(node_behaviour_task(behaviour));

    // node, then device, then sender, in creation order
    {
        let registry = registry.clone();
        wait_for(move || {
            let registry = registry.clone();
            Box::pin(async move { registry.registrations.lock().await.len() >= 3 })
        })
        .await;
    }
    let registrations = registry.registrations.lock().await.clone();
    assert_eq!(registrations[0].0, "node");
    assert_eq!(registrations[1].0, "device");
    assert_eq!(registrations[2].0, "sender");

    // and heartbeats for the node id
    {
        let registry = registry.clone();
        wait_for(move || {
            let registry = registry.clone();
            Box::pin(async move { !registry.heartbeats.lock().await.is_empty() })
        })
        .await;
    }
    assert_eq!(registry.heartbeats.lock().await[0], node_id);

    model.controlled_shutdown();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mutation_reaches_registry_in_order() {
    let registry = FakeRegistry::new();
    let addr = registry.serve().await;
    let (model, node_id) = test_model(addr).await;

    let behaviour = NodeBehaviour {
        model: model.clone(),
        auth_state: AuthorizationState::new(),
        discovery: MemoryDnsSd::new(),
        advertiser: MemoryDnsSd::new(),
    };
    let task = tokio::spawn(node_behaviour_task(behaviour));

    {
        let registry = registry.clone();
        wait_for(move || {
            let registry = registry.clone();
            Box::pin(async move { registry.registrations.lock().await.len() >= 3 })
        })
        .await;
    }

    // a label change must be re-registered
    {
        let mut resources = model.node_resources.write().await;
        crate::events::modify_resource(&mut resources, &node_id, |node| {
            node.data["label"] = "renamed".into();
        })
        .unwrap();
    }
    model.notify();

    {
        let registry = registry.clone();
        wait_for(move || {
            let registry = registry.clone();
            Box::pin(async move { registry.registrations.lock().await.len() >= 4 })
        })
        .await;
    }
    let registrations = registry.registrations.lock().await.clone();
    assert_eq!(registrations[3], ("node".to_string(), node_id));

    model.controlled_shutdown();
    task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_heartbeat_404_triggers_reregistration() {
    let registry = FakeRegistry::new();
    let addr = registry.serve().await;
    let (model, _) = test_model(addr).await;

    let behaviour = NodeBehaviour {
        model: model.clone(),
        auth_state: AuthorizationState::new(),
        discovery: MemoryDnsSd::new(),
        advertiser: MemoryDnsSd::new(),
    };
    let task = tokio::spawn(node_behaviour_task(behaviour));

    {
        let registry = registry.clone();
        wait_for(move || {
            let registry = registry.clone();
            Box::pin(async move { registry.registrations.lock().await.len() >= 3 })
        })
        .await;
    }

    // the registry forgets the node
    *registry.heartbeat_status.lock().await = StatusCode::NOT_FOUND;

    // everything is re-registered in order, starting from the node
    {
        let registry = registry.clone();
        wait_for(move || {
            let registry = registry.clone();
            Box::pin(async move { registry.registrations.lock().await.len() >= 6 })
        })
        .await;
    }
    let registrations = registry.registrations.lock().await.clone();
    assert_eq!(registrations[3].0, "node");
    assert_eq!(registrations[4].0, "device");
    assert_eq!(registrations[5].0, "sender");

    model.controlled_shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn test_node_advertisement() {
    let dnssd = MemoryDnsSd::new();
    let model = NodeModel::new(Settings::default());

    advertise_node_service(&model, dnssd.as_ref()).await.unwrap();

    let found = dnssd.browse(NODE_SERVICE).await.unwrap();
    assert_eq!(found.len(), 1);
    assert!(found[0].txt["api_ver"].contains("v1.3"));
    assert_eq!(found[0].txt["api_proto"], "http");
    assert_eq!(found[0].txt["api_auth"], "false");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_to_peer_counters_and_recovery() {
    let dnssd = MemoryDnsSd::new();
    let mut settings = Settings::default();
    settings.discovery_backoff_min = 0.1;
    settings.discovery_backoff_max = 1.0;
    let node_id = settings.node_id.clone();
    let model = NodeModel::new(settings);

    // no registry anywhere: behaviour lands in peer-to-peer operation
    let behaviour = NodeBehaviour {
        model: model.clone(),
        auth_state: AuthorizationState::new(),
        discovery: dnssd.clone(),
        advertiser: dnssd.clone(),
    };
    let task = tokio::spawn(node_behaviour_task(behaviour));

    // wait for the ver_* records to appear on the node advertisement
    {
        let dnssd = dnssd.clone();
        wait_for(move || {
            let dnssd = dnssd.clone();
            Box::pin(async move {
                dnssd
                    .browse(NODE_SERVICE)
                    .await
                    .unwrap()
                    .first()
                    .map(|service| service.txt.contains_key("ver_snd"))
                    .unwrap_or(false)
            })
        })
        .await;
    }

    // a sender mutation bumps ver_snd
    {
        let mut resources = model.node_resources.write().await;
        let sender_id = crate::model::make_id();
        insert_resource(
            &mut resources,
            Resource::new(
                ResourceType::Sender,
                &sender_id,
                V1_3,
                json!({ "id": sender_id }),
                Health::At(Health::now()),
            ),
        )
        .unwrap();
    }
    model.notify();

    {
        let dnssd = dnssd.clone();
        wait_for(move || {
            let dnssd = dnssd.clone();
            Box::pin(async move {
                dnssd
                    .browse(NODE_SERVICE)
                    .await
                    .unwrap()
                    .first()
                    .map(|service| service.txt.get("ver_snd").map(String::as_str) == Some("1"))
                    .unwrap_or(false)
            })
        })
        .await;
    }

    // a registry appearing pulls the node out of peer-to-peer operation and
    // withdraws the counters
    let mut txt = TxtRecords::new();
    txt.insert("pri".to_string(), "10".to_string());
    txt.insert("api_ver".to_string(), "v1.3".to_string());
    dnssd
        .register("registry", REGISTRATION_SERVICE, 1, txt)
        .await
        .unwrap();

    {
        let dnssd = dnssd.clone();
        let node_id = node_id.clone();
        wait_for(move || {
            let dnssd = dnssd.clone();
            let node_id = node_id.clone();
            Box::pin(async move {
                dnssd
                    .browse(NODE_SERVICE)
                    .await
                    .unwrap()
                    .iter()
                    .find(|service| service.name == node_id)
                    .map(|service| !service.txt.contains_key("ver_snd"))
                    .unwrap_or(false)
            })
        })
        .await;
    }

    model.controlled_shutdown();
    task.await.unwrap();
}
