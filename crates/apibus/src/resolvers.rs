//! Cross-service link expansion.
//!
//! Records reference other endpoints by storing `ApiReference` strings in
//! link fields. Resolvers expand those references into embedded data,
//! attached under `"$" + field` markers so the raw link values stay
//! untouched. A failed lookup degrades to null instead of failing the
//! surrounding call.
//!
//! The combinators here produce closures a schema author wires into `get`
//! or `query` backends; the collection variants batch lookups into one
//! `map` call per distinct target endpoint.

use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use apibus_validator::JsonMap;

use crate::endpoint::{BoxFuture, NodeContext};
use crate::types::ApiReference;

/// Expands links on a single record.
pub type RecordResolver =
    Arc<dyn Fn(NodeContext, Value, Option<Vec<String>>) -> BoxFuture<Value> + Send + Sync>;

/// Expands links across a batch of records.
pub type CollectionResolver =
    Arc<dyn Fn(NodeContext, Vec<Value>, Option<Vec<String>>) -> BoxFuture<Vec<Value>> + Send + Sync>;

/// Inverse-lookup specification: find the record in `endpoint` whose
/// `foreign_key` points back at this record, and attach it as `$field`.
#[derive(Clone)]
pub struct Join {
    pub endpoint: String,
    pub foreign_key: String,
    pub field: String,
    pub default: Value,
}

fn wants(props: Option<&[String]>, field: &str) -> bool {
    match props {
        None => true,
        Some(list) => list.iter().any(|p| p == "*" || p == field),
    }
}

/// Splits a record reference into its parent collection reference and the
/// record id.
fn parent_endpoint(uri: &str) -> Option<(String, String)> {
    let reference: ApiReference = uri.parse().ok()?;
    let mut segments = reference.split();
    let id = segments.pop()?.to_string();
    let parent = if segments.is_empty() {
        String::new()
    } else {
        format!("/{}", segments.join("/"))
    };
    Some((
        ApiReference::new(reference.service, parent).to_string(),
        id,
    ))
}

/// Per-record resolver fetching every present link with a `get` call.
/// Scalar link fields embed one value, array fields an array in input
/// order; each individual failure embeds null.
pub fn record_resolver(links: Vec<String>) -> RecordResolver {
    let links = Arc::new(links);
    Arc::new(move |ctx, record, props| {
        let links = links.clone();
        Box::pin(async move {
            let mut map = match record {
                Value::Object(map) => map,
                other => return other,
            };

            // (field, part-of-array, uri)
            let mut lookups: Vec<(String, bool, String)> = Vec::new();
            for link in links.iter() {
                if !wants(props.as_deref(), link) {
                    continue;
                }
                match map.get(link) {
                    Some(Value::Array(items)) => {
                        for item in items {
                            if let Some(uri) = item.as_str() {
                                lookups.push((link.clone(), true, uri.to_string()));
                            }
                        }
                    }
                    Some(Value::String(uri)) => lookups.push((link.clone(), false, uri.clone())),
                    _ => {}
                }
            }

            let results = join_all(lookups.iter().map(|(_, _, uri)| {
                let ctx = ctx.clone();
                let uri = uri.clone();
                async move { ctx.api.call_uri(&uri, "get", json!({})).await.ok() }
            }))
            .await;

            for ((field, in_array, _), result) in lookups.into_iter().zip(results) {
                let value = result.unwrap_or(Value::Null);
                let marker = format!("${field}");
                if in_array {
                    let entry = map
                        .entry(marker)
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let Value::Array(list) = entry {
                        list.push(value);
                    }
                } else {
                    map.insert(marker, value);
                }
            }
            Value::Object(map)
        })
    })
}

/// Batch resolver: groups referenced ids by distinct target endpoint and
/// issues one `map` call per endpoint. A failed endpoint lookup nulls the
/// markers of the records that referenced it; other endpoints' results
/// still land.
pub fn collection_resolver(links: Vec<String>) -> CollectionResolver {
    let links = Arc::new(links);
    Arc::new(move |ctx, records, props| {
        let links = links.clone();
        Box::pin(async move {
            let mut endpoints: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for record in &records {
                let Some(obj) = record.as_object() else { continue };
                if !obj.contains_key("_id") {
                    continue;
                }
                for link in links.iter() {
                    if !wants(props.as_deref(), link) {
                        continue;
                    }
                    let Some(uri) = obj.get(link).and_then(Value::as_str) else {
                        continue;
                    };
                    let Some((endpoint, id)) = parent_endpoint(uri) else {
                        continue;
                    };
                    let ids = endpoints.entry(endpoint).or_default();
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
            }

            let calls = join_all(endpoints.iter().map(|(endpoint, ids)| {
                let ctx = ctx.clone();
                let endpoint = endpoint.clone();
                let ids = ids.clone();
                async move {
                    let result = ctx
                        .api
                        .call_uri(&endpoint, "map", json!({ "id": ids }))
                        .await
                        .ok();
                    (endpoint, result)
                }
            }))
            .await;

            let mut resolved: HashMap<String, Value> = HashMap::new();
            let mut failed: HashSet<String> = HashSet::new();
            for (endpoint, result) in calls {
                match result {
                    Some(Value::Object(map)) => {
                        for (id, record) in map {
                            resolved.insert(format!("{endpoint}/{id}"), record);
                        }
                    }
                    _ => {
                        failed.insert(endpoint);
                    }
                }
            }

            records
                .into_iter()
                .map(|record| {
                    let mut map = match record {
                        Value::Object(map) => map,
                        other => return other,
                    };
                    if !map.contains_key("_id") {
                        return Value::Object(map);
                    }
                    for link in links.iter() {
                        if !wants(props.as_deref(), link) {
                            continue;
                        }
                        let Some(uri) = map.get(link).and_then(Value::as_str) else {
                            continue;
                        };
                        let uri = uri.to_string();
                        let marker = format!("${link}");
                        if let Some(value) = resolved.get(&uri) {
                            map.insert(marker, value.clone());
                        } else if let Some((endpoint, _)) = parent_endpoint(&uri) {
                            if failed.contains(&endpoint) {
                                map.insert(marker, Value::Null);
                            }
                        }
                    }
                    Value::Object(map)
                })
                .collect()
        })
    })
}

/// Inverse single-record join: queries the target collection for the one
/// record whose foreign key equals this record's own reference.
pub fn record_join_one(join: Join) -> RecordResolver {
    Arc::new(move |ctx, record, props| {
        let join = join.clone();
        Box::pin(async move {
            let mut map = match record {
                Value::Object(map) => map,
                other => return other,
            };
            if !wants(props.as_deref(), &join.field) {
                return Value::Object(map);
            }
            let own = match map.get("_id").and_then(Value::as_str) {
                Some(id) => id.to_string(),
                None => ApiReference::new(ctx.api.service(), ctx.path.clone()).to_string(),
            };
            let mut conditions = JsonMap::new();
            conditions.insert(join.foreign_key.clone(), json!(own));
            let result = ctx
                .api
                .call_uri(
                    &join.endpoint,
                    "query",
                    json!({ "where": conditions, "limit": 1 }),
                )
                .await
                .ok();
            let value = result
                .and_then(|envelope| envelope.get("records").and_then(|r| r.get(0)).cloned())
                .unwrap_or_else(|| join.default.clone());
            map.insert(format!("${}", join.field), value);
            Value::Object(map)
        })
    })
}

/// Batch inverse join: one query with an `$in` clause over all record
/// references; unmatched records get the join's default.
pub fn collection_join_one(join: Join) -> CollectionResolver {
    Arc::new(move |ctx, records, props| {
        let join = join.clone();
        Box::pin(async move {
            if !wants(props.as_deref(), &join.field) {
                return records;
            }
            let ids: Vec<String> = records
                .iter()
                .filter_map(|r| r.get("_id").and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            if ids.is_empty() {
                return records;
            }

            let mut conditions = JsonMap::new();
            conditions.insert(join.foreign_key.clone(), json!({ "$in": ids }));
            let result = ctx
                .api
                .call_uri(&join.endpoint, "query", json!({ "where": conditions }))
                .await
                .ok();

            // First match per foreign-key value wins.
            let mut matched: HashMap<String, Value> = HashMap::new();
            if let Some(found) = result
                .as_ref()
                .and_then(|envelope| envelope.get("records"))
                .and_then(Value::as_array)
            {
                for record in found {
                    if let Some(key) = record.get(&join.foreign_key).and_then(Value::as_str) {
                        matched
                            .entry(key.to_string())
                            .or_insert_with(|| record.clone());
                    }
                }
            }

            records
                .into_iter()
                .map(|record| {
                    let mut map = match record {
                        Value::Object(map) => map,
                        other => return other,
                    };
                    let value = map
                        .get("_id")
                        .and_then(Value::as_str)
                        .and_then(|id| matched.get(id).cloned())
                        .unwrap_or_else(|| join.default.clone());
                    map.insert(format!("${}", join.field), value);
                    Value::Object(map)
                })
                .collect()
        })
    })
}

/// Runs resolvers concurrently against the same record and merges their
/// `$`-marker fields. Resolver order carries no meaning.
pub fn record_multi(resolvers: Vec<RecordResolver>) -> RecordResolver {
    let resolvers = Arc::new(resolvers);
    Arc::new(move |ctx, record, props| {
        let resolvers = resolvers.clone();
        Box::pin(async move {
            let results = join_all(
                resolvers
                    .iter()
                    .map(|resolver| resolver(ctx.clone(), record.clone(), props.clone())),
            )
            .await;
            let mut base = match record {
                Value::Object(map) => map,
                other => return other,
            };
            for result in results {
                if let Value::Object(map) = result {
                    for (key, value) in map {
                        if key.starts_with('$') {
                            base.insert(key, value);
                        }
                    }
                }
            }
            Value::Object(base)
        })
    })
}

/// Batch variant of [`record_multi`], merging markers per record index.
pub fn collection_multi(resolvers: Vec<CollectionResolver>) -> CollectionResolver {
    let resolvers = Arc::new(resolvers);
    Arc::new(move |ctx, records, props| {
        let resolvers = resolvers.clone();
        Box::pin(async move {
            let results = join_all(
                resolvers
                    .iter()
                    .map(|resolver| resolver(ctx.clone(), records.clone(), props.clone())),
            )
            .await;
            let mut merged = records;
            for result in results {
                for (base, resolved) in merged.iter_mut().zip(result) {
                    if let (Value::Object(base), Value::Object(resolved)) = (base, resolved) {
                        for (key, value) in resolved {
                            if key.starts_with('$') {
                                base.insert(key, value);
                            }
                        }
                    }
                }
            }
            merged
        })
    })
}
