//! Collection generator: query/create/delete/count/map over a set of
//! records, live query channels, and a catch-all child resolving any id to
//! a record node from the nested record schema.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use apibus_validator::{array, object, JsonMap, Validator};

use crate::endpoint::record::{CompiledRecord, RecordSchema};
use crate::endpoint::template::MethodSpec;
use crate::endpoint::{
    validation_hook, BoxFuture, DescriptorMeta, InitHook, MethodHandler, NodeBuilder,
    NodeContext, NodeFactory, NodeKind, NodeMeta, PropertyHandler,
};
use crate::error::ApiResult;
use crate::live::{LiveBackend, LiveCache, LiveMapper, DEFAULT_GC_INTERVAL};
use crate::types::ApiReference;

/// Returns the matching records for validated query params.
pub type CollectionQuery =
    Arc<dyn Fn(NodeContext, Value) -> BoxFuture<ApiResult<Vec<Value>>> + Send + Sync>;

/// Counts records matching the `where` conditions.
pub type CollectionCount =
    Arc<dyn Fn(NodeContext, Value) -> BoxFuture<ApiResult<u64>> + Send + Sync>;

/// Inserts a record and returns its new id.
pub type CollectionCreate =
    Arc<dyn Fn(NodeContext, JsonMap) -> BoxFuture<ApiResult<String>> + Send + Sync>;

/// Deletes the listed records.
pub type CollectionDelete =
    Arc<dyn Fn(NodeContext, Vec<String>) -> BoxFuture<ApiResult<Value>> + Send + Sync>;

/// Bulk lookup: id list in, id-keyed object of records out.
pub type CollectionMap =
    Arc<dyn Fn(NodeContext, Vec<String>) -> BoxFuture<ApiResult<Value>> + Send + Sync>;

/// Declarative schema for a collection endpoint.
#[derive(Default)]
pub struct CollectionSchema {
    meta: NodeMeta,
    record: Option<RecordSchema>,
    init: Option<InitHook>,
    query: Option<CollectionQuery>,
    count: Option<CollectionCount>,
    create: Option<CollectionCreate>,
    delete: Option<CollectionDelete>,
    map: Option<CollectionMap>,
    live: Option<LiveBackend>,
    live_map: Option<LiveBackend>,
    live_mapper: Option<LiveMapper>,
    properties: Vec<(String, DescriptorMeta, PropertyHandler)>,
    methods: Vec<MethodSpec>,
    gc_interval: Duration,
    idle_threshold: Option<Duration>,
}

impl CollectionSchema {
    pub fn new() -> Self {
        Self {
            gc_interval: DEFAULT_GC_INTERVAL,
            ..Self::default()
        }
    }

    pub fn meta(mut self, meta: NodeMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Nested record schema: enables `create` validation and the per-id
    /// catch-all child.
    pub fn record(mut self, record: RecordSchema) -> Self {
        self.record = Some(record);
        self
    }

    pub fn init<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ApiResult<()>> + Send + 'static,
    {
        self.init = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
        self
    }

    pub fn query<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(NodeContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ApiResult<Vec<Value>>> + Send + 'static,
    {
        self.query = Some(Arc::new(move |ctx, params| Box::pin(f(ctx, params))));
        self
    }

    pub fn count<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(NodeContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ApiResult<u64>> + Send + 'static,
    {
        self.count = Some(Arc::new(move |ctx, params| Box::pin(f(ctx, params))));
        self
    }

    pub fn create<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(NodeContext, JsonMap) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ApiResult<String>> + Send + 'static,
    {
        self.create = Some(Arc::new(move |ctx, record| Box::pin(f(ctx, record))));
        self
    }

    pub fn delete<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(NodeContext, Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ApiResult<Value>> + Send + 'static,
    {
        self.delete = Some(Arc::new(move |ctx, ids| Box::pin(f(ctx, ids))));
        self
    }

    pub fn map<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(NodeContext, Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ApiResult<Value>> + Send + 'static,
    {
        self.map = Some(Arc::new(move |ctx, ids| Box::pin(f(ctx, ids))));
        self
    }

    pub fn live<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(NodeContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ApiResult<crate::live::LiveFeed>> + Send + 'static,
    {
        self.live = Some(Arc::new(move |ctx, params| Box::pin(f(ctx, params))));
        self
    }

    /// Live variant of `map`: watches the listed records.
    pub fn live_map<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(NodeContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ApiResult<crate::live::LiveFeed>> + Send + 'static,
    {
        self.live_map = Some(Arc::new(move |ctx, params| Box::pin(f(ctx, params))));
        self
    }

    pub fn live_mapper<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, crate::live::ChangeOp) -> Value + Send + Sync + 'static,
    {
        self.live_mapper = Some(Arc::new(f));
        self
    }

    pub fn property(
        mut self,
        name: impl Into<String>,
        meta: DescriptorMeta,
        handler: PropertyHandler,
    ) -> Self {
        self.properties.push((name.into(), meta, handler));
        self
    }

    pub fn method(
        mut self,
        name: impl Into<String>,
        meta: DescriptorMeta,
        params: Option<Validator>,
        handler: MethodHandler,
    ) -> Self {
        self.methods
            .push(MethodSpec::new(name.into(), meta, params, handler));
        self
    }

    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = Some(threshold);
        self
    }

    pub fn into_factory(self) -> NodeFactory {
        let record = self.record.map(CompiledRecord::compile);
        let cache = LiveCache::new(self.gc_interval, self.idle_threshold);
        let compiled = Arc::new(Compiled {
            meta: self.meta,
            record,
            init: self.init,
            query: self.query,
            count: self.count,
            create: self.create,
            delete: self.delete,
            map: self.map,
            live: self.live,
            live_map: self.live_map,
            live_mapper: self.live_mapper,
            properties: self.properties,
            methods: self.methods,
            cache,
        });
        Arc::new(move |ctx, name| {
            let compiled = compiled.clone();
            Box::pin(async move { compiled.node(ctx.child(&name)).await.map(Some) })
        })
    }
}

struct Compiled {
    meta: NodeMeta,
    record: Option<Arc<CompiledRecord>>,
    init: Option<InitHook>,
    query: Option<CollectionQuery>,
    count: Option<CollectionCount>,
    create: Option<CollectionCreate>,
    delete: Option<CollectionDelete>,
    map: Option<CollectionMap>,
    live: Option<LiveBackend>,
    live_map: Option<LiveBackend>,
    live_mapper: Option<LiveMapper>,
    properties: Vec<(String, DescriptorMeta, PropertyHandler)>,
    methods: Vec<MethodSpec>,
    cache: LiveCache,
}

impl Compiled {
    async fn node(
        self: &Arc<Self>,
        ctx: NodeContext,
    ) -> ApiResult<Arc<crate::endpoint::Node>> {
        if let Some(init) = &self.init {
            init(ctx.clone()).await?;
        }
        let mut builder = NodeBuilder::new(NodeKind::Collection, ctx, self.meta.clone())
            .interface("collection");

        if let (Some(query), Some(count)) = (&self.query, &self.count) {
            let query = query.clone();
            let count = count.clone();
            builder = builder.method(
                "query",
                DescriptorMeta::new()
                    .title("Query")
                    .description("Returns collection records by query.")
                    .icon("magnify"),
                Some(query_params()),
                Arc::new(move |ctx, params| {
                    let query = query.clone();
                    let count = count.clone();
                    Box::pin(async move {
                        let conditions = json!({
                            "where": params.get("where").cloned().unwrap_or(Value::Null)
                        });
                        let total = count(ctx.clone(), conditions).await?;
                        let records = query(ctx, params).await?;
                        let count = records.len();
                        Ok(json!({
                            "records": records,
                            "count": count,
                            "total": total,
                        }))
                    })
                }),
            );
        }

        if let (Some(create), Some(record)) = (&self.create, &self.record) {
            let create = create.clone();
            let validator = record.validator();
            builder = builder.method_custom(
                "create",
                DescriptorMeta::new()
                    .title("Create record")
                    .description("Creates new record in collection.")
                    .icon("plus"),
                Some(validator.clone()),
                Some(validation_hook(validator)),
                create_handler(create),
            );
        }

        if let Some(delete) = &self.delete {
            let delete = delete.clone();
            builder = builder.method(
                "delete",
                DescriptorMeta::new()
                    .title("Delete records")
                    .description("Deletes multiple records from collection.")
                    .icon("delete"),
                Some(Validator::new().field(
                    "id",
                    array()
                        .label("IDs")
                        .description("Array of record IDs to remove.")
                        .required()
                        .deny_empty(),
                )),
                Arc::new(move |ctx, params| {
                    let delete = delete.clone();
                    Box::pin(async move { delete(ctx, id_list(&params)).await })
                }),
            );
        }

        if let Some(count) = &self.count {
            let count = count.clone();
            builder = builder.method(
                "count",
                DescriptorMeta::new()
                    .title("Count records")
                    .description("Returns count of records matching conditions.")
                    .icon("magnify"),
                Some(Validator::new().field(
                    "where",
                    object()
                        .label("Filter")
                        .description("Query conditions."),
                )),
                Arc::new(move |ctx, params| {
                    let count = count.clone();
                    Box::pin(async move { Ok(json!(count(ctx, params).await?)) })
                }),
            );
        }

        if let Some(map) = &self.map {
            let map = map.clone();
            builder = builder.method(
                "map",
                DescriptorMeta::new()
                    .title("Map records")
                    .description("Returns records by ID as an ID-keyed object.")
                    .icon("magnify"),
                Some(id_params()),
                Arc::new(move |ctx, params| {
                    let map = map.clone();
                    Box::pin(async move { map(ctx, id_list(&params)).await })
                }),
            );
        }

        if let Some(live) = &self.live {
            builder = builder.method(
                "live",
                DescriptorMeta::new()
                    .title("Live query")
                    .description(
                        "Makes live query and returns channel name where changes will be published.",
                    )
                    .icon("magnify"),
                Some(query_params()),
                live_handler(self.cache.clone(), "live", self.live_mapper.clone(), live.clone()),
            );
        }

        if let Some(live_map) = &self.live_map {
            builder = builder.method(
                "liveMap",
                DescriptorMeta::new()
                    .title("Live map")
                    .description(
                        "Watches records by ID and returns channel name where changes will be published.",
                    )
                    .icon("magnify"),
                Some(id_params()),
                live_handler(self.cache.clone(), "map", self.live_mapper.clone(), live_map.clone()),
            );
        }

        if let Some(record) = &self.record {
            builder = builder.catch_all(
                DescriptorMeta::new()
                    .title("Record")
                    .description("Collection record by ID."),
                record.factory(),
            );
        }

        for (name, meta, handler) in &self.properties {
            builder = builder.property(name.clone(), meta.clone(), handler.clone());
        }
        for method in &self.methods {
            builder = builder.method_custom(
                method.name.clone(),
                method.meta.clone(),
                method.params.clone(),
                method.before.clone(),
                method.handler.clone(),
            );
        }

        Ok(builder.build())
    }
}

fn create_handler(create: CollectionCreate) -> MethodHandler {
    Arc::new(move |ctx, params| {
        let create = create.clone();
        Box::pin(async move {
            let record = params.as_object().cloned().unwrap_or_default();
            let id = create(ctx.clone(), record).await?;
            let reference =
                ApiReference::new(ctx.api.service(), format!("{}/{}", ctx.path, id));
            Ok(Value::String(reference.to_string()))
        })
    })
}

fn live_handler(
    cache: LiveCache,
    scope: &'static str,
    mapper: Option<LiveMapper>,
    backend: LiveBackend,
) -> MethodHandler {
    Arc::new(move |ctx, params| {
        let cache = cache.clone();
        let mapper = mapper.clone();
        let backend = backend.clone();
        Box::pin(async move {
            let channel = cache.acquire(&ctx, scope, &params, mapper, &backend).await?;
            Ok(Value::String(channel.to_string()))
        })
    })
}

fn query_params() -> Validator {
    Validator::new()
        .field(
            "where",
            object().label("Filter").description("Query conditions."),
        )
        .field(
            "sort",
            object()
                .label("Sort options")
                .description("Sorting of results in format <column>: <direction: 1|-1>."),
        )
        .field(
            "properties",
            apibus_validator::array()
                .label("Properties")
                .description("Return only specified properties."),
        )
        .field(
            "skip",
            apibus_validator::number()
                .label("Skip")
                .description("How many records to skip."),
        )
        .field(
            "limit",
            apibus_validator::number()
                .label("Limit")
                .description("Maximal count of returned records."),
        )
}

fn id_params() -> Validator {
    Validator::new().field(
        "id",
        array()
            .label("IDs")
            .description("Array of record IDs.")
            .required()
            .deny_empty(),
    )
}

fn id_list(params: &Value) -> Vec<String> {
    params
        .get("id")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ApiHandle;
    use crate::endpoint::Node;
    use crate::error::ApiError;
    use apibus_validator::{number, text};
    use std::sync::Mutex;

    fn users_schema(created: Arc<Mutex<Vec<JsonMap>>>) -> CollectionSchema {
        CollectionSchema::new()
            .meta(NodeMeta::new().title("Users"))
            .record(
                RecordSchema::new()
                    .property("name", text().required())
                    .property("age", number().min(0.0))
                    .get(|ctx, _props| async move {
                        Ok(json!({"_id": ctx.id, "name": "Alice", "age": 30}))
                    }),
            )
            .query(|_ctx, _params| async move {
                Ok(vec![json!({"name": "Alice"}), json!({"name": "Bob"})])
            })
            .count(|_ctx, _params| async move { Ok(7) })
            .create(move |_ctx, record| {
                let created = created.clone();
                async move {
                    created.lock().unwrap().push(record);
                    Ok("42".to_string())
                }
            })
            .delete(|_ctx, ids| async move { Ok(json!(ids.len())) })
            .map(|_ctx, ids| async move {
                let mut out = JsonMap::new();
                for id in ids {
                    out.insert(id.clone(), json!({"_id": id}));
                }
                Ok(Value::Object(out))
            })
    }

    async fn node(created: Arc<Mutex<Vec<JsonMap>>>) -> Arc<Node> {
        let factory = users_schema(created).into_factory();
        let ctx = NodeContext::root(ApiHandle::new("test"));
        factory(ctx, "users".into()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn query_wraps_records_in_envelope() {
        let node = node(Arc::new(Mutex::new(Vec::new()))).await;
        let out = node
            .invoke_method("query", json!({"limit": 10}))
            .await
            .unwrap();
        assert_eq!(out["count"], json!(2));
        assert_eq!(out["total"], json!(7));
        assert_eq!(out["records"][1]["name"], json!("Bob"));
    }

    #[tokio::test]
    async fn create_returns_reference_under_collection_path() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let node = node(created.clone()).await;
        let out = node
            .invoke_method("create", json!({"name": "Carol", "age": 20}))
            .await
            .unwrap();
        assert_eq!(out, json!("test://users/42"));
        assert_eq!(created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_validates_against_record_schema() {
        let created = Arc::new(Mutex::new(Vec::new()));
        let node = node(created.clone()).await;
        let err = node
            .invoke_method("create", json!({"age": 20}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidValue(v) if v.field == "name"));
        assert!(created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_requires_non_empty_id_list() {
        let node = node(Arc::new(Mutex::new(Vec::new()))).await;
        let err = node
            .invoke_method("delete", json!({"id": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidValue(_)));
        let out = node
            .invoke_method("delete", json!({"id": ["1", "2"]}))
            .await
            .unwrap();
        assert_eq!(out, json!(2));
    }

    #[tokio::test]
    async fn map_returns_id_keyed_object() {
        let node = node(Arc::new(Mutex::new(Vec::new()))).await;
        let out = node
            .invoke_method("map", json!({"id": ["a", "b"]}))
            .await
            .unwrap();
        assert_eq!(out["a"]["_id"], json!("a"));
        assert_eq!(out["b"]["_id"], json!("b"));
    }

    #[tokio::test]
    async fn any_id_resolves_to_record_child() {
        let node = node(Arc::new(Mutex::new(Vec::new()))).await;
        let record = node.resolve_property("42").await.unwrap();
        assert_eq!(record.path(), "/users/42");
        let out = record.invoke_method("get", json!({})).await.unwrap();
        assert_eq!(out["_id"], json!("42"));
    }
}
