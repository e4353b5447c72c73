// Resource store
// Multi-indexed in-memory container with a strictly increasing update clock

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::{NmosError, Result};

use super::resource::{Health, Resource, ResourceType};
use super::tai::Tai;

/// An indexed collection of resources.
///
/// Every mutation stamps the affected resource with a timestamp strictly
/// greater than any previously issued by this store, so the `updated` values
/// form a total order that observers can use as cursors.
///
/// The store itself is not synchronized; it is held behind the owning
/// `NodeModel`'s reader-writer lock.
#[derive(Debug, Default)]
pub struct ResourceStore {
    by_id: HashMap<String, Resource>,
    by_created: BTreeMap<Tai, String>,
    by_updated: BTreeMap<Tai, String>,
    by_health: BTreeMap<u64, HashSet<String>>,
    most_recent_update: Tai,
}

impl ResourceStore {
    pub fn new() -> Self {
        ResourceStore::default()
    }

    /// The greatest `updated` timestamp ever issued by this store.
    pub fn most_recent_update(&self) -> Tai {
        self.most_recent_update
    }

    /// The next update timestamp: strictly greater than every timestamp
    /// already issued, and no earlier than the wall clock.
    pub fn strictly_increasing_update(&self) -> Tai {
        std::cmp::max(Tai::now(), self.most_recent_update.successor())
    }

    /// The least health of any resource, excluding `Forever`.
    pub fn least_health(&self) -> Option<u64> {
        self.by_health.keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn find(&self, id: &str) -> Option<&Resource> {
        self.by_id.get(id)
    }

    /// Find a resource by id, checking it has the expected type.
    pub fn find_typed(&self, id: &str, resource_type: ResourceType) -> Option<&Resource> {
        self.by_id
            .get(id)
            .filter(|resource| resource.resource_type == resource_type)
    }

    pub fn find_if(&self, mut predicate: impl FnMut(&Resource) -> bool) -> Option<&Resource> {
        self.by_id.values().find(|resource| predicate(resource))
    }

    /// Resources in ascending `created` order.
    pub fn iter_by_created(&self) -> impl Iterator<Item = &Resource> {
        self.by_created.values().map(|id| &self.by_id[id])
    }

    /// Resources in ascending `updated` order.
    pub fn iter_by_updated(&self) -> impl Iterator<Item = &Resource> {
        self.by_updated.values().map(|id| &self.by_id[id])
    }

    /// Resource ids in descending `updated` order.
    ///
    /// Returned as a snapshot so that the caller can `modify` each resource
    /// in turn; `modify` reorders the updated index.
    pub fn ids_by_updated_desc(&self) -> Vec<String> {
        self.by_updated.values().rev().cloned().collect()
    }

    /// Resources with `created` in the given bounds, ascending, with their
    /// cursor timestamps.
    pub fn range_by_created(
        &self,
        range: impl std::ops::RangeBounds<Tai>,
    ) -> impl DoubleEndedIterator<Item = (Tai, &Resource)> {
        self.by_created
            .range(range)
            .map(|(cursor, id)| (*cursor, &self.by_id[id]))
    }

    /// Resources with `updated` in the given bounds, ascending, with their
    /// cursor timestamps.
    pub fn range_by_updated(
        &self,
        range: impl std::ops::RangeBounds<Tai>,
    ) -> impl DoubleEndedIterator<Item = (Tai, &Resource)> {
        self.by_updated
            .range(range)
            .map(|(cursor, id)| (*cursor, &self.by_id[id]))
    }

    /// All resources of one type, in unspecified order.
    pub fn iter_type(&self, resource_type: ResourceType) -> impl Iterator<Item = &Resource> {
        self.by_id
            .values()
            .filter(move |resource| resource.resource_type == resource_type)
    }

    /// Ids of all resources whose health is earlier than `health`, excluding
    /// `Forever`.
    pub fn ids_less_healthy_than(&self, health: u64) -> Vec<String> {
        self.by_health
            .range(..health)
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect()
    }

    /// Insert a resource, stamping `created` and `updated`.
    ///
    /// Fails with `DuplicateResource` unless any existing resource of the
    /// same id has already been erased, in which case it is replaced.
    pub fn insert(&mut self, mut resource: Resource) -> Result<Tai> {
        if let Some(existing) = self.by_id.get(&resource.id) {
            if existing.has_data() {
                return Err(NmosError::DuplicateResource {
                    id: resource.id.clone(),
                });
            }
            let id = resource.id.clone();
            self.remove_unindexed(&id);
        }

        let update = self.strictly_increasing_update();
        resource.created = update;
        resource.updated = update;

        self.by_created.insert(resource.created, resource.id.clone());
        self.by_updated.insert(resource.updated, resource.id.clone());
        if let Health::At(health) = resource.health {
            self.by_health
                .entry(health)
                .or_default()
                .insert(resource.id.clone());
        }
        self.by_id.insert(resource.id.clone(), resource);
        self.most_recent_update = update;
        Ok(update)
    }

    /// Apply `mutator` to the identified resource and bump its `updated`
    /// timestamp.
    pub fn modify(
        &mut self,
        id: &str,
        mutator: impl FnOnce(&mut Resource),
    ) -> Result<Tai> {
        let update = self.strictly_increasing_update();
        let resource = self
            .by_id
            .get_mut(id)
            .ok_or_else(|| NmosError::ResourceNotFound { id: id.to_string() })?;

        self.by_updated.remove(&resource.updated);
        let old_health = resource.health;

        mutator(resource);

        resource.updated = update;
        let new_health = resource.health;
        self.by_updated.insert(update, id.to_string());
        self.most_recent_update = update;

        if old_health != new_health {
            self.reindex_health(id, old_health, new_health);
        }
        Ok(update)
    }

    /// Refresh a resource's health without bumping its `updated` timestamp.
    ///
    /// Heartbeats are not resource mutations; they must not generate events.
    pub fn set_health(&mut self, id: &str, health: Health) -> Result<()> {
        let resource = self
            .by_id
            .get_mut(id)
            .ok_or_else(|| NmosError::ResourceNotFound { id: id.to_string() })?;
        let old_health = resource.health;
        resource.health = health;
        self.reindex_health(id, old_health, health);
        Ok(())
    }

    /// Erase a resource, and recursively its sub-resources.
    ///
    /// With `allow_forget` the resources are removed outright. Otherwise each
    /// is retained with empty data for one expiry interval so that observers
    /// can see the removal event; its health is set to the erasure time so
    /// the expiry sweep can garbage-collect it later.
    pub fn erase(&mut self, id: &str, allow_forget: bool) -> Result<Tai> {
        if !self.by_id.contains_key(id) {
            return Err(NmosError::ResourceNotFound { id: id.to_string() });
        }

        let sub_resources: Vec<String> = self.by_id[id].sub_resources.iter().cloned().collect();
        for sub_id in sub_resources {
            if self.by_id.contains_key(&sub_id) {
                self.erase(&sub_id, allow_forget)?;
            }
        }

        if allow_forget {
            self.remove_unindexed(id);
            let update = self.strictly_increasing_update();
            self.most_recent_update = update;
            Ok(update)
        } else {
            let erased_at = Health::At(Health::now());
            self.modify(id, |resource| {
                resource.data = serde_json::Value::Null;
                resource.sub_resources.clear();
                resource.health = erased_at;
            })
        }
    }

    /// Remove erased resources whose erasure time is earlier than
    /// `forget_health`.
    pub fn forget_erased(&mut self, forget_health: u64) {
        let forgotten: Vec<String> = self
            .ids_less_healthy_than(forget_health)
            .into_iter()
            .filter(|id| !self.by_id[id].has_data())
            .collect();
        for id in forgotten {
            self.remove_unindexed(&id);
        }
    }

    fn remove_unindexed(&mut self, id: &str) {
        if let Some(resource) = self.by_id.remove(id) {
            self.by_created.remove(&resource.created);
            self.by_updated.remove(&resource.updated);
            if let Health::At(health) = resource.health {
                if let Some(ids) = self.by_health.get_mut(&health) {
                    ids.remove(id);
                    if ids.is_empty() {
                        self.by_health.remove(&health);
                    }
                }
            }
        }
    }

    fn reindex_health(&mut self, id: &str, old_health: Health, new_health: Health) {
        if let Health::At(old) = old_health {
            if let Some(ids) = self.by_health.get_mut(&old) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_health.remove(&old);
                }
            }
        }
        if let Health::At(new) = new_health {
            self.by_health.entry(new).or_default().insert(id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::api_version::ApiVersion;
    use crate::model::resource::make_id;

    fn resource(resource_type: ResourceType, id: &str) -> Resource {
        Resource::new(
            resource_type,
            id,
            ApiVersion::new(1, 3),
            serde_json::json!({ "id": id }),
            Health::At(Health::now()),
        )
    }

    #[test]
    fn test_insert_and_find() {
        let mut store = ResourceStore::new();
        let id = make_id();
        store.insert(resource(ResourceType::Node, &id)).unwrap();

        assert!(store.find(&id).is_some());
        assert!(store.find_typed(&id, ResourceType::Node).is_some());
        assert!(store.find_typed(&id, ResourceType::Device).is_none());
        assert!(store.find("missing").is_none());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut store = ResourceStore::new();
        let id = make_id();
        store.insert(resource(ResourceType::Device, &id)).unwrap();
        assert!(matches!(
            store.insert(resource(ResourceType::Device, &id)),
            Err(NmosError::DuplicateResource { .. })
        ));
    }

    #[test]
    fn test_reinsert_after_erase() {
        let mut store = ResourceStore::new();
        let id = make_id();
        store.insert(resource(ResourceType::Device, &id)).unwrap();
        store.erase(&id, false).unwrap();
        assert!(!store.find(&id).unwrap().has_data());

        store.insert(resource(ResourceType::Device, &id)).unwrap();
        assert!(store.find(&id).unwrap().has_data());
    }

    #[test]
    fn test_updated_strictly_increasing() {
        let mut store = ResourceStore::new();
        let first = make_id();
        let second = make_id();
        let t1 = store.insert(resource(ResourceType::Source, &first)).unwrap();
        let t2 = store.insert(resource(ResourceType::Flow, &second)).unwrap();
        let t3 = store.modify(&first, |r| r.data["label"] = "renamed".into()).unwrap();

        assert!(t1 < t2);
        assert!(t2 < t3);
        assert_eq!(store.most_recent_update(), t3);

        // every resource satisfies updated >= created
        for r in store.iter_by_created() {
            assert!(r.updated >= r.created);
        }
    }

    #[test]
    fn test_modify_reorders_updated_index() {
        let mut store = ResourceStore::new();
        let first = make_id();
        let second = make_id();
        store.insert(resource(ResourceType::Sender, &first)).unwrap();
        store.insert(resource(ResourceType::Sender, &second)).unwrap();
        store.modify(&first, |_| {}).unwrap();

        let ids: Vec<&str> = store.iter_by_updated().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![second.as_str(), first.as_str()]);
        let desc = store.ids_by_updated_desc();
        assert_eq!(desc, vec![first.clone(), second.clone()]);
    }

    #[test]
    fn test_erase_cascades_to_sub_resources() {
        let mut store = ResourceStore::new();
        let subscription_id = make_id();
        let grain_id = make_id();
        store
            .insert(resource(ResourceType::Subscription, &subscription_id))
            .unwrap();
        store.insert(resource(ResourceType::Grain, &grain_id)).unwrap();
        store
            .modify(&subscription_id, |r| {
                r.sub_resources.insert(grain_id.clone());
            })
            .unwrap();

        store.erase(&subscription_id, false).unwrap();
        assert!(!store.find(&subscription_id).unwrap().has_data());
        assert!(!store.find(&grain_id).unwrap().has_data());
    }

    #[test]
    fn test_health_index_and_forget() {
        let mut store = ResourceStore::new();
        let stale = make_id();
        let fresh = make_id();
        let eternal = make_id();

        let mut r = resource(ResourceType::Subscription, &stale);
        r.health = Health::At(100);
        store.insert(r).unwrap();
        let mut r = resource(ResourceType::Subscription, &fresh);
        r.health = Health::At(200);
        store.insert(r).unwrap();
        let mut r = resource(ResourceType::Subscription, &eternal);
        r.health = Health::Forever;
        store.insert(r).unwrap();

        assert_eq!(store.least_health(), Some(100));
        assert_eq!(store.ids_less_healthy_than(150), vec![stale.clone()]);

        // heartbeat does not bump updated
        let updated = store.find(&fresh).unwrap().updated;
        store.set_health(&fresh, Health::At(300)).unwrap();
        assert_eq!(store.find(&fresh).unwrap().updated, updated);
        assert_eq!(store.least_health(), Some(100));

        // erased resources are forgotten once their erasure time passes
        store.erase(&stale, false).unwrap();
        store.forget_erased(Health::now() + 1);
        assert!(!store.contains(&stale));
        assert!(store.contains(&fresh));
        assert!(store.contains(&eternal));
    }
}
