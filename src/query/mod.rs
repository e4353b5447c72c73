// Query engine
// Filter, downgrade, sort and page the resource store for the Query API and subscriptions

pub mod rql;

use serde_json::{Map, Value};

use crate::model::api_version::ApiVersion;
use crate::model::resource::{Resource, ResourceType};
use crate::model::store::ResourceStore;
use crate::model::tai::Tai;
use crate::{NmosError, Result};

/// String-matching behaviour for basic queries, from the experimental
/// `query.match_type` parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchFlags {
    pub substr: bool,
    pub icase: bool,
}

impl MatchFlags {
    /// Parse a comma-separated flag list, e.g. "substr,icase".
    pub fn parse(match_type: &str) -> Self {
        let mut flags = MatchFlags::default();
        for flag in match_type.split(',') {
            match flag.trim() {
                "substr" => flags.substr = true,
                "icase" => flags.icase = true,
                _ => {}
            }
        }
        flags
    }
}

/// The filter predicate built from a Query API request (or a subscription's
/// stored parameters).
#[derive(Debug, Clone)]
pub struct ResourceQuery {
    pub version: ApiVersion,
    /// Empty (any type) or e.g. "/senders"
    pub resource_path: String,
    pub downgrade_version: ApiVersion,
    basic_query: Map<String, Value>,
    match_flags: MatchFlags,
    rql_query: Option<rql::RqlExpr>,
}

impl ResourceQuery {
    /// Build a query from flat, URL-decoded parameters.
    ///
    /// `paging.*` parameters are ignored here; `query.*` parameters select
    /// the advanced options and everything else becomes the basic query.
    pub fn new(
        version: ApiVersion,
        resource_path: impl Into<String>,
        flat_query_params: &Map<String, Value>,
    ) -> Result<Self> {
        let mut downgrade_version = version;
        let mut match_flags = MatchFlags::default();
        let mut rql_query = None;
        let mut basic = Map::new();

        for (key, value) in flat_query_params {
            if key.starts_with("paging.") {
                continue;
            }
            match key.as_str() {
                "query.downgrade" => {
                    downgrade_version = value
                        .as_str()
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| {
                            NmosError::Validation("invalid query.downgrade version".to_string())
                        })?;
                }
                "query.rql" => {
                    let expression = value.as_str().ok_or_else(|| {
                        NmosError::Validation("query.rql must be a string".to_string())
                    })?;
                    rql_query = Some(rql::parse_query(expression)?);
                }
                "query.match_type" => {
                    match_flags = MatchFlags::parse(value.as_str().unwrap_or_default());
                }
                key if key.starts_with("query.") => {}
                _ => {
                    basic.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(ResourceQuery {
            version,
            resource_path: resource_path.into(),
            downgrade_version,
            basic_query: unflatten(&basic),
            match_flags,
            rql_query,
        })
    }

    pub fn matches_resource(&self, resource: &Resource) -> bool {
        resource.has_data()
            && self.matches(resource.version, resource.resource_type, &resource.data)
    }

    pub fn matches(
        &self,
        resource_version: ApiVersion,
        resource_type: ResourceType,
        data: &Value,
    ) -> bool {
        if !data.is_object() {
            return false;
        }
        if !self.resource_path.is_empty()
            && self.resource_path != format!("/{}", resource_type.plural())
        {
            return false;
        }
        if !is_permitted_downgrade(
            resource_version,
            resource_type,
            self.version,
            self.downgrade_version,
        ) {
            return false;
        }
        let matches_basic = self.basic_query.iter().all(|(key, value)| {
            data.get(key)
                .map(|data| match_basic_query(data, value, self.match_flags))
                .unwrap_or(false)
        });
        if !matches_basic {
            return false;
        }
        match &self.rql_query {
            Some(query) => rql::matches(data, query),
            None => true,
        }
    }

    /// Render a resource for a response at the requested version, dropping
    /// fields the requested version does not know about.
    pub fn downgrade(&self, resource: &Resource) -> Value {
        downgrade(
            resource.version,
            resource.resource_type,
            &resource.data,
            self.version,
        )
    }
}

/// Whether a resource created against `resource_version` may appear in a
/// response to a request for `version`, given the permitted
/// `downgrade_version`.
pub fn is_permitted_downgrade(
    resource_version: ApiVersion,
    resource_type: ResourceType,
    version: ApiVersion,
    downgrade_version: ApiVersion,
) -> bool {
    if resource_version == version {
        return true;
    }
    // only the core registrable types have per-version downgrade rules
    if !resource_type.is_registrable() {
        return false;
    }
    resource_version.is_permitted_downgrade(version, downgrade_version)
}

// fields introduced after v1.0, by type, for downgraded rendering
const LATER_FIELDS: &[(ResourceType, ApiVersion, &[&str])] = &[
    (ResourceType::Node, ApiVersion::new(1, 1), &["api", "clocks", "description", "tags"]),
    (ResourceType::Node, ApiVersion::new(1, 2), &["interfaces"]),
    (ResourceType::Device, ApiVersion::new(1, 1), &["controls", "description", "tags"]),
    (ResourceType::Source, ApiVersion::new(1, 1), &["clock_name", "grain_rate", "channels"]),
    (ResourceType::Source, ApiVersion::new(1, 3), &["event_type"]),
    (ResourceType::Flow, ApiVersion::new(1, 1), &["device_id", "grain_rate", "media_type", "sample_rate", "bit_depth", "frame_width", "frame_height", "interlace_mode", "colorspace", "components"]),
    (ResourceType::Flow, ApiVersion::new(1, 3), &["event_type"]),
    (ResourceType::Sender, ApiVersion::new(1, 2), &["caps", "interface_bindings", "subscription"]),
    (ResourceType::Receiver, ApiVersion::new(1, 2), &["interface_bindings"]),
];

/// Render `data` as the requested version would have it.
///
/// A no-op unless the resource is from a later minor version, in which case
/// the fields introduced after the requested version are removed.
pub fn downgrade(
    resource_version: ApiVersion,
    resource_type: ResourceType,
    data: &Value,
    version: ApiVersion,
) -> Value {
    if resource_version <= version {
        return data.clone();
    }
    let mut downgraded = data.clone();
    if let Some(object) = downgraded.as_object_mut() {
        for (later_type, introduced, fields) in LATER_FIELDS {
            if *later_type == resource_type && *introduced > version {
                for field in *fields {
                    object.remove(*field);
                }
            }
        }
    }
    downgraded
}

// Basic query evaluation: the (unflattened) query structure must be a subset
// of the resource data, leaf by leaf
fn match_basic_query(data: &Value, query: &Value, flags: MatchFlags) -> bool {
    match query {
        Value::Object(query_map) => match data {
            Value::Object(data) => query_map.iter().all(|(key, value)| {
                data.get(key)
                    .map(|data| match_basic_query(data, value, flags))
                    .unwrap_or(false)
            }),
            // a query object cannot match a leaf, but may match any array element
            Value::Array(elements) => elements
                .iter()
                .any(|element| match_basic_query(element, query, flags)),
            _ => false,
        },
        leaf => match data {
            Value::Array(elements) => elements
                .iter()
                .any(|element| match_leaf(element, leaf, flags)),
            _ => match_leaf(data, leaf, flags),
        },
    }
}

fn match_leaf(data: &Value, query: &Value, flags: MatchFlags) -> bool {
    match (data, query) {
        (Value::String(data), Value::String(query)) => {
            if flags.icase {
                let data = data.to_lowercase();
                let query = query.to_lowercase();
                if flags.substr {
                    data.contains(&query)
                } else {
                    data == query
                }
            } else if flags.substr {
                data.contains(query.as_str())
            } else {
                data == query
            }
        }
        // query parameters arrive as strings; coerce to the data's type
        (Value::Number(data), Value::String(query)) => query
            .parse::<f64>()
            .map(|query| data.as_f64() == Some(query))
            .unwrap_or(false),
        (Value::Bool(data), Value::String(query)) => {
            query.parse::<bool>().map(|query| *data == query).unwrap_or(false)
        }
        _ => data == query,
    }
}

/// Rebuild the nested structure from flat dotted keys,
/// e.g. `{"tags.location": "x"}` becomes `{"tags": {"location": "x"}}`.
pub fn unflatten(flat: &Map<String, Value>) -> Map<String, Value> {
    let mut nested = Map::new();
    for (key, value) in flat {
        let mut current = &mut nested;
        let segments: Vec<&str> = key.split('.').collect();
        for segment in &segments[..segments.len() - 1] {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            // a leaf and a deeper path under the same key cannot both match;
            // the deeper path wins
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            current = entry.as_object_mut().expect("entry was just made an object");
        }
        current.insert(segments[segments.len() - 1].to_string(), value.clone());
    }
    nested
}

/// Cursor-based paging over the created or updated index.
#[derive(Debug, Clone)]
pub struct ResourcePaging {
    pub order_by_created: bool,
    /// Inclusive upper bound, capped at the store's most recent update
    pub until: Tai,
    /// Exclusive lower bound
    pub since: Tai,
    pub limit: usize,
    pub since_specified: bool,
}

impl ResourcePaging {
    /// Extract the paging parameters from flat, URL-decoded query parameters.
    pub fn new(
        flat_query_params: &Map<String, Value>,
        max_until: Tai,
        default_limit: usize,
        max_limit: usize,
    ) -> Result<Self> {
        let mut paging = ResourcePaging {
            order_by_created: false,
            until: max_until,
            since: Tai::MIN,
            limit: default_limit,
            since_specified: false,
        };

        if let Some(order) = flat_query_params.get("paging.order") {
            paging.order_by_created = order.as_str() == Some("create");
        }
        if let Some(until) = flat_query_params.get("paging.until") {
            let until: Tai = until
                .as_str()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| NmosError::Validation("invalid paging.until".to_string()))?;
            // a request with until in the future is fixed up so consecutive
            // requests return the same bounded data set
            paging.until = std::cmp::min(until, max_until);
        }
        if let Some(since) = flat_query_params.get("paging.since") {
            paging.since = since
                .as_str()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| NmosError::Validation("invalid paging.since".to_string()))?;
            paging.since_specified = true;
            if paging.since > paging.until && paging.until == max_until {
                paging.until = paging.since;
            }
        }
        if let Some(limit) = flat_query_params.get("paging.limit") {
            let limit = match limit {
                Value::Number(limit) => limit.as_u64(),
                Value::String(limit) => limit.parse().ok(),
                _ => None,
            }
            .ok_or_else(|| NmosError::Validation("invalid paging.limit".to_string()))?;
            paging.limit = std::cmp::max(1, std::cmp::min(limit as usize, max_limit));
        }

        Ok(paging)
    }

    pub fn valid(&self) -> bool {
        self.since <= self.until
    }

    /// Extract one page of matching resources, most recent first, and fix up
    /// `since`/`until` to identify exactly the returned data set.
    pub fn page<'a>(
        &mut self,
        store: &'a ResourceStore,
        matches: impl Fn(&Resource) -> bool,
    ) -> Vec<&'a Resource> {
        let bounds = (
            std::ops::Bound::Excluded(self.since),
            std::ops::Bound::Included(self.until),
        );
        let index: Vec<(Tai, &Resource)> = if self.order_by_created {
            store.range_by_created(bounds).collect()
        } else {
            store.range_by_updated(bounds).collect()
        };

        let mut page: Vec<&Resource> = Vec::new();

        if self.since_specified {
            // fill the page from the since side
            let mut last_cursor = None;
            for (cursor, resource) in index {
                if page.len() == self.limit {
                    // the data set is bounded by the last included cursor
                    self.until = last_cursor.unwrap_or(self.since);
                    break;
                }
                if matches(resource) {
                    page.push(resource);
                    last_cursor = Some(cursor);
                }
            }
            page.reverse();
        } else {
            // fill the page from the until side
            for (cursor, resource) in index.into_iter().rev() {
                if page.len() == self.limit {
                    // the data set begins just above this cursor
                    self.since = cursor;
                    break;
                }
                if matches(resource) {
                    page.push(resource);
                }
            }
        }

        page
    }

    /// The paging response headers: `X-Paging-*` and the RFC 5988 `Link`
    /// header values. `base_link` is the request URL stripped of its paging
    /// parameters.
    pub fn headers(&self, base_link: &str) -> Vec<(&'static str, String)> {
        let separator = if base_link.contains('?') { '&' } else { '?' };
        let link = format!(
            "{}{}paging.order={}&paging.limit={}",
            base_link,
            separator,
            if self.order_by_created { "create" } else { "update" },
            self.limit
        );
        vec![
            ("X-Paging-Limit", self.limit.to_string()),
            ("X-Paging-Since", self.since.to_string()),
            ("X-Paging-Until", self.until.to_string()),
            (
                "Link",
                format!("<{}&paging.until={}>; rel=\"prev\"", link, self.since),
            ),
            (
                "Link",
                format!("<{}&paging.since={}>; rel=\"next\"", link, self.until),
            ),
            (
                "Link",
                format!("<{}&paging.since={}>; rel=\"first\"", link, Tai::MIN),
            ),
            ("Link", format!("<{}>; rel=\"last\"", link)),
        ]
    }
}

#[cfg(test)]
mod tests;
