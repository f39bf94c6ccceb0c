//! Record generator: a declarative schema of typed data properties and
//! backend callbacks, compiled into nodes with synthesized `get`/`update`/
//! `delete`/`live` methods and one child Property endpoint per data field.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use apibus_validator::{any, array, Field, InvalidKind, InvalidValue, JsonMap, Validator};

use crate::endpoint::template::MethodSpec;
use crate::endpoint::{
    BeforeHook, BoxFuture, DescriptorMeta, InitHook, MethodHandler, Node, NodeBuilder,
    NodeContext, NodeFactory, NodeKind, NodeMeta,
};
use crate::error::ApiResult;
use crate::live::{LiveBackend, LiveCache, LiveMapper, DEFAULT_GC_INTERVAL};

/// Fetches the record, optionally restricted to the listed properties
/// (empty list means all).
pub type RecordGet =
    Arc<dyn Fn(NodeContext, Vec<String>) -> BoxFuture<ApiResult<Value>> + Send + Sync>;

/// Applies a partial change set; absent fields must stay untouched.
pub type RecordUpdate =
    Arc<dyn Fn(NodeContext, JsonMap) -> BoxFuture<ApiResult<Value>> + Send + Sync>;

pub type RecordDelete = Arc<dyn Fn(NodeContext) -> BoxFuture<ApiResult<Value>> + Send + Sync>;

/// Declarative schema for a record endpoint.
#[derive(Default)]
pub struct RecordSchema {
    meta: NodeMeta,
    fields: BTreeMap<String, Field>,
    init: Option<InitHook>,
    get: Option<RecordGet>,
    update: Option<RecordUpdate>,
    delete: Option<RecordDelete>,
    live: Option<LiveBackend>,
    live_mapper: Option<LiveMapper>,
    methods: Vec<MethodSpec>,
    gc_interval: Duration,
    idle_threshold: Option<Duration>,
}

impl RecordSchema {
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

    /// Declares a typed data property; it becomes part of the update/create
    /// validation schema and a child Property endpoint.
    pub fn property(mut self, name: impl Into<String>, field: Field) -> Self {
        self.fields.insert(name.into(), field);
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

    pub fn get<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(NodeContext, Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ApiResult<Value>> + Send + 'static,
    {
        self.get = Some(Arc::new(move |ctx, props| Box::pin(f(ctx, props))));
        self
    }

    pub fn update<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(NodeContext, JsonMap) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ApiResult<Value>> + Send + 'static,
    {
        self.update = Some(Arc::new(move |ctx, changes| Box::pin(f(ctx, changes))));
        self
    }

    pub fn delete<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ApiResult<Value>> + Send + 'static,
    {
        self.delete = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
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

    pub fn live_mapper<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, crate::live::ChangeOp) -> Value + Send + Sync + 'static,
    {
        self.live_mapper = Some(Arc::new(f));
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
        CompiledRecord::compile(self).factory()
    }
}

/// Compiled record schema shared by every node instance the factory
/// creates; owns the live-channel cache.
pub(crate) struct CompiledRecord {
    meta: NodeMeta,
    fields: BTreeMap<String, Field>,
    validator: Arc<Validator>,
    init: Option<InitHook>,
    get: Option<RecordGet>,
    update: Option<RecordUpdate>,
    delete: Option<RecordDelete>,
    live: Option<LiveBackend>,
    live_mapper: Option<LiveMapper>,
    methods: Vec<MethodSpec>,
    cache: LiveCache,
}

impl CompiledRecord {
    pub(crate) fn compile(schema: RecordSchema) -> Arc<Self> {
        let mut validator = Validator::new();
        for (name, field) in &schema.fields {
            validator.insert(name.clone(), field.clone());
        }
        Arc::new(Self {
            meta: schema.meta,
            fields: schema.fields,
            validator: Arc::new(validator),
            init: schema.init,
            get: schema.get,
            update: schema.update,
            delete: schema.delete,
            live: schema.live,
            live_mapper: schema.live_mapper,
            methods: schema.methods,
            cache: LiveCache::new(schema.gc_interval, schema.idle_threshold),
        })
    }

    /// Validation schema over the declared data properties; collections use
    /// it for `create`.
    pub(crate) fn validator(&self) -> Arc<Validator> {
        self.validator.clone()
    }

    pub(crate) fn factory(self: &Arc<Self>) -> NodeFactory {
        let compiled = self.clone();
        Arc::new(move |ctx, name| {
            let compiled = compiled.clone();
            Box::pin(async move { compiled.node(ctx.child(&name)).await.map(Some) })
        })
    }

    pub(crate) async fn node(self: &Arc<Self>, ctx: NodeContext) -> ApiResult<Arc<Node>> {
        if let Some(init) = &self.init {
            init(ctx.clone()).await?;
        }
        let mut builder = NodeBuilder::new(NodeKind::Record, ctx.clone(), self.meta.clone())
            .interface("record");

        if let Some(get) = &self.get {
            let get = get.clone();
            builder = builder.method(
                "get",
                DescriptorMeta::new()
                    .title("Get record")
                    .description("Returns record data."),
                Some(props_params()),
                Arc::new(move |ctx, params| {
                    let get = get.clone();
                    Box::pin(async move {
                        let props = props_list(&params);
                        let record = get(ctx, props.clone()).await?;
                        Ok(project(record, &props))
                    })
                }),
            );
        }

        if let Some(update) = &self.update {
            builder = builder.method_custom(
                "update",
                DescriptorMeta::new()
                    .title("Update record")
                    .description("Updates record properties."),
                Some(self.validator.clone()),
                Some(partial_validation_hook(self.validator.clone())),
                update_handler(update.clone()),
            );
        }

        if let Some(delete) = &self.delete {
            let delete = delete.clone();
            builder = builder.method(
                "delete",
                DescriptorMeta::new()
                    .title("Delete record")
                    .description("Deletes the record."),
                None,
                Arc::new(move |ctx, _params| {
                    let delete = delete.clone();
                    Box::pin(async move { delete(ctx).await })
                }),
            );
        }

        if let Some(live) = &self.live {
            let live = live.clone();
            let cache = self.cache.clone();
            let mapper = self.live_mapper.clone();
            builder = builder.method(
                "live",
                DescriptorMeta::new()
                    .title("Live record")
                    .description("Returns channel name where record changes will be published."),
                Some(props_params()),
                Arc::new(move |ctx, params| {
                    let live = live.clone();
                    let cache = cache.clone();
                    let mapper = mapper.clone();
                    Box::pin(async move {
                        let channel = cache.acquire(&ctx, "live", &params, mapper, &live).await?;
                        Ok(Value::String(channel.to_string()))
                    })
                }),
            );
        }

        for (name, field) in &self.fields {
            builder = builder.property(
                name.clone(),
                DescriptorMeta::new()
                    .title(field.label.clone().unwrap_or_else(|| name.clone())),
                self.field_child(name.clone(), field.clone()),
            );
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

    /// Child Property endpoint for one data field: `get` projects the
    /// single field, `set` re-issues a full-record update carrying only it.
    fn field_child(
        self: &Arc<Self>,
        field_name: String,
        field: Field,
    ) -> crate::endpoint::PropertyHandler {
        let compiled = self.clone();
        Arc::new(move |record_ctx, name| {
            let compiled = compiled.clone();
            let field_name = field_name.clone();
            let field = field.clone();
            Box::pin(async move {
                let meta = NodeMeta {
                    title: field.label.clone(),
                    description: field.description.clone(),
                    ..NodeMeta::default()
                };
                let mut builder = NodeBuilder::new(
                    NodeKind::Property,
                    record_ctx.child(&name),
                    meta,
                )
                .interface("property");

                if let Some(get) = &compiled.get {
                    let get = get.clone();
                    let record_ctx = record_ctx.clone();
                    let field_name = field_name.clone();
                    builder = builder.method(
                        "get",
                        DescriptorMeta::new()
                            .title("Get value")
                            .description("Returns property value."),
                        None,
                        Arc::new(move |_ctx, _params| {
                            let get = get.clone();
                            let record_ctx = record_ctx.clone();
                            let field_name = field_name.clone();
                            Box::pin(async move {
                                let record = get(record_ctx, vec![field_name.clone()]).await?;
                                Ok(record.get(&field_name).cloned().unwrap_or(Value::Null))
                            })
                        }),
                    );
                }

                if let Some(update) = &compiled.update {
                    let update = update.clone();
                    let record_ctx = record_ctx.clone();
                    let field_name = field_name.clone();
                    let field = field.clone();
                    builder = builder.method(
                        "set",
                        DescriptorMeta::new()
                            .title("Set value")
                            .description("Updates property value."),
                        Some(Validator::new().field("value", any())),
                        Arc::new(move |_ctx, params| {
                            let update = update.clone();
                            let record_ctx = record_ctx.clone();
                            let field_name = field_name.clone();
                            let field = field.clone();
                            Box::pin(async move {
                                let value = field.validate(
                                    &field_name,
                                    params.get("value"),
                                    true,
                                )?;
                                let mut changes = JsonMap::new();
                                changes.insert(field_name.clone(), value);
                                update(record_ctx, changes).await
                            })
                        }),
                    );
                }

                Ok(Some(builder.build()))
            })
        })
    }
}

fn update_handler(update: RecordUpdate) -> MethodHandler {
    Arc::new(move |ctx, params| {
        let update = update.clone();
        Box::pin(async move {
            let changes = params.as_object().cloned().unwrap_or_default();
            update(ctx, changes).await
        })
    })
}

/// Partial-validation before hook: only supplied keys are checked, absent
/// fields stay absent.
fn partial_validation_hook(validator: Arc<Validator>) -> BeforeHook {
    Arc::new(move |_ctx, params| {
        let validator = validator.clone();
        Box::pin(async move {
            let map = match params {
                Value::Object(map) => map,
                Value::Null => JsonMap::new(),
                _ => {
                    return Err(InvalidValue::new(
                        InvalidKind::NotObject,
                        "params",
                        "params must be an object",
                    )
                    .into())
                }
            };
            Ok(Value::Object(validator.validate_partial(&map)?))
        })
    })
}

pub(crate) fn props_params() -> Validator {
    Validator::new().field(
        "properties",
        array()
            .label("Properties")
            .description("Return only specified properties."),
    )
}

pub(crate) fn props_list(params: &Value) -> Vec<String> {
    params
        .get("properties")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Applies a projection list to a record object. An empty list or a `"*"`
/// entry keeps everything; otherwise only requested fields survive, along
/// with `_id` and the `$`-marked resolved companions of requested fields.
pub(crate) fn project(record: Value, props: &[String]) -> Value {
    if props.is_empty() || props.iter().any(|p| p == "*") {
        return record;
    }
    let Value::Object(map) = record else {
        return record;
    };
    let keep = |key: &str| {
        key == "_id"
            || props.iter().any(|p| p == key)
            || key
                .strip_prefix('$')
                .map(|bare| props.iter().any(|p| p == bare))
                .unwrap_or(false)
    };
    Value::Object(
        map.into_iter()
            .filter(|(key, _)| keep(key.as_str()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ApiHandle;
    use crate::error::ApiError;
    use apibus_validator::{number, text};
    use serde_json::json;
    use std::sync::Mutex;

    fn schema(updates: Arc<Mutex<Vec<JsonMap>>>) -> RecordSchema {
        RecordSchema::new()
            .property("name", text().required().label("Name"))
            .property("age", number().min(0.0))
            .get(|_ctx, _props| async move {
                Ok(json!({"_id": "test://users/1", "name": "Alice", "age": 30, "note": "x"}))
            })
            .update(move |_ctx, changes| {
                let updates = updates.clone();
                async move {
                    updates.lock().unwrap().push(changes);
                    Ok(json!(true))
                }
            })
            .delete(|_ctx| async move { Ok(json!(true)) })
    }

    async fn node(updates: Arc<Mutex<Vec<JsonMap>>>) -> Arc<Node> {
        let factory = schema(updates).into_factory();
        let ctx = NodeContext::root(ApiHandle::new("test"));
        factory(ctx, "1".into()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn get_projects_requested_properties() {
        let node = node(Arc::new(Mutex::new(Vec::new()))).await;
        let out = node
            .invoke_method("get", json!({"properties": ["name"]}))
            .await
            .unwrap();
        assert_eq!(out, json!({"_id": "test://users/1", "name": "Alice"}));

        let all = node.invoke_method("get", json!({})).await.unwrap();
        assert_eq!(all["note"], json!("x"));
    }

    #[tokio::test]
    async fn invalid_partial_update_never_reaches_backend() {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let node = node(updates.clone()).await;
        let err = node
            .invoke_method("update", json!({"name": "Bob", "age": -1}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidValue(v) if v.field == "age"));
        assert!(updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn partial_update_keeps_absent_fields_absent() {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let node = node(updates.clone()).await;
        node.invoke_method("update", json!({"age": 31}))
            .await
            .unwrap();
        let seen = updates.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get("age"), Some(&json!(31)));
        assert!(!seen[0].contains_key("name"));
    }

    #[tokio::test]
    async fn property_child_get_and_set() {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let node = node(updates.clone()).await;

        let name = node.resolve_property("name").await.unwrap();
        assert_eq!(name.path(), "/1/name");
        let value = name.invoke_method("get", json!({})).await.unwrap();
        assert_eq!(value, json!("Alice"));

        name.invoke_method("set", json!({"value": "Bob"}))
            .await
            .unwrap();
        let seen = updates.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get("name"), Some(&json!("Bob")));
        assert_eq!(seen[0].len(), 1);
    }

    #[tokio::test]
    async fn property_set_validates_the_field() {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let node = node(updates.clone()).await;
        let age = node.resolve_property("age").await.unwrap();
        let err = age
            .invoke_method("set", json!({"value": -4}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidValue(_)));
        assert!(updates.lock().unwrap().is_empty());
    }
}
