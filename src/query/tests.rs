// Tests for the query engine

use serde_json::{json, Map, Value};

use super::*;
use crate::model::api_version::ApiVersion;
use crate::model::resource::{make_id, Health, Resource, ResourceType};
use crate::model::store::ResourceStore;

const V1_2: ApiVersion = ApiVersion::new(1, 2);
const V1_3: ApiVersion = ApiVersion::new(1, 3);

fn flat(params: &[(&str, &str)]) -> Map<String, Value> {
    params
        .iter()
        .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
        .collect()
}

fn insert_sender(store: &mut ResourceStore, label: &str, transport: &str) -> String {
    let id = make_id();
    let resource = Resource::new(
        ResourceType::Sender,
        &id,
        V1_3,
        json!({ "id": id, "label": label, "transport": transport }),
        Health::At(Health::now()),
    );
    store.insert(resource).unwrap();
    id
}

#[test]
fn test_basic_query_equality() {
    let query = ResourceQuery::new(V1_3, "", &flat(&[("label", "Camera 1")])).unwrap();

    assert!(query.matches(V1_3, ResourceType::Sender, &json!({ "label": "Camera 1" })));
    assert!(!query.matches(V1_3, ResourceType::Sender, &json!({ "label": "Camera 2" })));
    assert!(!query.matches(V1_3, ResourceType::Sender, &json!({})));
}

#[test]
fn test_basic_query_nested_path() {
    let query = ResourceQuery::new(V1_3, "", &flat(&[("tags.studio", "hq1")])).unwrap();

    assert!(query.matches(
        V1_3,
        ResourceType::Source,
        &json!({ "tags": { "studio": ["hq1", "hq2"] } })
    ));
    assert!(!query.matches(V1_3, ResourceType::Source, &json!({ "tags": {} })));
}

#[test]
fn test_match_type_flags() {
    let params = flat(&[("label", "camera"), ("query.match_type", "substr,icase")]);
    let query = ResourceQuery::new(V1_3, "", &params).unwrap();

    assert!(query.matches(V1_3, ResourceType::Sender, &json!({ "label": "Studio Camera 1" })));

    let exact = ResourceQuery::new(V1_3, "", &flat(&[("label", "camera")])).unwrap();
    assert!(!exact.matches(V1_3, ResourceType::Sender, &json!({ "label": "Studio Camera 1" })));
}

#[test]
fn test_resource_path_restriction() {
    let query = ResourceQuery::new(V1_3, "/senders", &Map::new()).unwrap();
    assert!(query.matches(V1_3, ResourceType::Sender, &json!({})));
    assert!(!query.matches(V1_3, ResourceType::Receiver, &json!({})));
}

#[test]
fn test_downgrade_hides_later_versions() {
    // a v1.3 resource is hidden from a v1.2 query by default
    let query = ResourceQuery::new(V1_2, "", &Map::new()).unwrap();
    assert!(!query.matches(V1_3, ResourceType::Sender, &json!({})));

    // unless downgrade is permitted
    let params = flat(&[("query.downgrade", "v1.3")]);
    let query = ResourceQuery::new(V1_2, "", &params).unwrap();
    assert!(query.matches(V1_3, ResourceType::Sender, &json!({})));

    // subscriptions do not support downgrade at all
    assert!(!query.matches(V1_3, ResourceType::Subscription, &json!({})));
}

#[test]
fn test_downgrade_strips_later_fields() {
    let node = json!({
        "id": "n",
        "label": "node",
        "interfaces": [{ "name": "eth0" }],
        "api": { "versions": ["v1.3"] }
    });
    let downgraded = downgrade(V1_3, ResourceType::Node, &node, ApiVersion::new(1, 0));
    assert!(downgraded.get("interfaces").is_none());
    assert!(downgraded.get("api").is_none());
    assert_eq!(downgraded["label"], "node");

    // no change when the resource is not newer than the request
    let same = downgrade(V1_3, ResourceType::Node, &node, V1_3);
    assert_eq!(same, node);
}

#[test]
fn test_rql_over_store() {
    let mut store = ResourceStore::new();
    for i in 0..5 {
        insert_sender(
            &mut store,
            &format!("sender {}", i),
            "urn:x-nmos:transport:rtp.mcast",
        );
    }
    insert_sender(&mut store, "unicast", "urn:x-nmos:transport:rtp.ucast");

    let params = flat(&[("query.rql", "eq(transport,urn:x-nmos:transport:rtp.mcast)")]);
    let query = ResourceQuery::new(V1_3, "/senders", &params).unwrap();
    let matching = store
        .iter_by_updated()
        .filter(|r| query.matches_resource(r))
        .count();
    assert_eq!(matching, 5);
}

#[test]
fn test_paging_defaults_to_most_recent() {
    let mut store = ResourceStore::new();
    let ids: Vec<String> = (0..5)
        .map(|i| insert_sender(&mut store, &format!("s{}", i), "rtp"))
        .collect();

    let mut paging = ResourcePaging::new(&Map::new(), store.most_recent_update(), 10, 100).unwrap();
    assert!(paging.valid());
    let page = paging.page(&store, |_| true);

    // most recent first
    assert_eq!(page.len(), 5);
    assert_eq!(page[0].id, ids[4]);
    assert_eq!(page[4].id, ids[0]);
}

#[test]
fn test_paging_limit_and_cursors() {
    let mut store = ResourceStore::new();
    let ids: Vec<String> = (0..5)
        .map(|i| insert_sender(&mut store, &format!("s{}", i), "rtp"))
        .collect();

    let params = flat(&[("paging.limit", "2")]);
    let mut paging = ResourcePaging::new(&params, store.most_recent_update(), 10, 100).unwrap();
    let page = paging.page(&store, |_| true);

    assert_eq!(page.len(), 2);
    assert_eq!(page[0].id, ids[4]);
    assert_eq!(page[1].id, ids[3]);

    // since is fixed up to the cursor just below the page, so the same query
    // with explicit cursors returns the same data set
    assert_eq!(paging.since, store.find(&ids[2]).unwrap().updated);
    assert_eq!(paging.until, store.most_recent_update());

    let params = flat(&[("paging.limit", "2")]);
    let mut again = ResourcePaging::new(&params, store.most_recent_update(), 10, 100).unwrap();
    again.since = paging.since;
    again.until = paging.until;
    again.since_specified = true;
    let same: Vec<&str> = again.page(&store, |_| true).iter().map(|r| r.id.as_str()).collect();
    assert_eq!(same, vec![ids[4].as_str(), ids[3].as_str()]);
}

#[test]
fn test_paging_from_since_side() {
    let mut store = ResourceStore::new();
    let ids: Vec<String> = (0..5)
        .map(|i| insert_sender(&mut store, &format!("s{}", i), "rtp"))
        .collect();

    let since = store.find(&ids[0]).unwrap().updated;
    let params = flat(&[("paging.since", &since.to_string()), ("paging.limit", "2")]);
    let mut paging = ResourcePaging::new(&params, store.most_recent_update(), 10, 100).unwrap();
    let page = paging.page(&store, |_| true);

    // the two oldest after since, still presented most recent first
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].id, ids[2]);
    assert_eq!(page[1].id, ids[1]);
    // until is fixed up to bound the returned data set
    assert_eq!(paging.until, store.find(&ids[2]).unwrap().updated);
}

#[test]
fn test_paging_since_equals_until_is_empty() {
    let mut store = ResourceStore::new();
    insert_sender(&mut store, "s", "rtp");
    let cursor = store.most_recent_update();

    let params = flat(&[
        ("paging.since", &cursor.to_string()),
        ("paging.until", &cursor.to_string()),
    ]);
    let mut paging = ResourcePaging::new(&params, store.most_recent_update(), 10, 100).unwrap();
    assert!(paging.valid());
    assert!(paging.page(&store, |_| true).is_empty());

    // the next link still chains from until
    let headers = paging.headers("http://example.com/x-nmos/query/v1.3/senders");
    let next = headers
        .iter()
        .find(|(name, value)| *name == "Link" && value.ends_with("rel=\"next\""))
        .unwrap();
    assert!(next.1.contains(&format!("paging.since={}", cursor)));
}

#[test]
fn test_paging_until_capped_to_most_recent() {
    let mut store = ResourceStore::new();
    insert_sender(&mut store, "s", "rtp");

    let params = flat(&[("paging.until", "9999999999:0")]);
    let paging = ResourcePaging::new(&params, store.most_recent_update(), 10, 100).unwrap();
    assert_eq!(paging.until, store.most_recent_update());
}

#[test]
fn test_paging_limit_clamped() {
    let params = flat(&[("paging.limit", "1000")]);
    let paging = ResourcePaging::new(&params, Tai::MIN, 10, 100).unwrap();
    assert_eq!(paging.limit, 100);

    let params = flat(&[("paging.limit", "0")]);
    let paging = ResourcePaging::new(&params, Tai::MIN, 10, 100).unwrap();
    assert_eq!(paging.limit, 1);
}

#[test]
fn test_paging_headers() {
    let mut store = ResourceStore::new();
    for i in 0..3 {
        insert_sender(&mut store, &format!("s{}", i), "rtp");
    }
    let params = flat(&[("paging.limit", "2")]);
    let mut paging = ResourcePaging::new(&params, store.most_recent_update(), 10, 100).unwrap();
    paging.page(&store, |_| true);

    let headers = paging.headers("http://example.com/x-nmos/query/v1.3/senders");
    let value = |name: &str| {
        headers
            .iter()
            .filter(|(header, _)| *header == name)
            .map(|(_, value)| value.clone())
            .collect::<Vec<_>>()
    };

    assert_eq!(value("X-Paging-Limit"), vec!["2"]);
    assert_eq!(value("X-Paging-Until"), vec![store.most_recent_update().to_string()]);
    let links = value("Link");
    assert_eq!(links.len(), 4);
    assert!(links.iter().any(|link| link.contains("rel=\"first\"") && link.contains("paging.since=0:0")));
    assert!(links.iter().any(|link| link.ends_with("rel=\"last\"")));
    assert!(links.iter().any(|link| link.contains("rel=\"prev\"")));
}

#[test]
fn test_unflatten() {
    let nested = unflatten(&flat(&[("a.b.c", "1"), ("a.b.d", "2"), ("e", "3")]));
    assert_eq!(
        Value::Object(nested),
        json!({ "a": { "b": { "c": "1", "d": "2" } }, "e": "3" })
    );
}
