//! Endpoint node protocol.
//!
//! Every addressable unit in a service tree is a [`Node`]: an ordered
//! registration table of property handlers (sub-endpoint resolvers reached
//! by path segment) and method descriptors (remote-callable operations with
//! optional validation-before-invoke hooks), built once at construction by
//! [`NodeBuilder`] and immutable afterwards.
//!
//! Nodes are created lazily per dispatch call by their parent's property
//! handler; the only state that outlives a call is whatever a generator
//! explicitly retains (see [`crate::live`]).

mod collection;
mod record;
mod root;
mod template;

pub use collection::CollectionSchema;
pub use record::RecordSchema;
pub use root::Root;
pub use template::TemplateSchema;

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use apibus_validator::{JsonMap, Validator};

use crate::client::ApiHandle;
use crate::error::{ApiError, ApiResult};

/// Boxed future used by all handler types.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Resolves a child node for a path segment. Receives the parent node's
/// context and the requested segment name.
///
/// Returning `Ok(None)` means the handler declined: for a catch-all that is
/// an ordinary [`ApiError::EndpointNotFound`], for a declared property it is
/// an authoring defect ([`ApiError::InvalidPropertyConstructor`]).
pub type PropertyHandler =
    Arc<dyn Fn(NodeContext, String) -> BoxFuture<ApiResult<Option<Arc<Node>>>> + Send + Sync>;

/// A node factory has exactly the shape of a property handler, so generator
/// output can be mounted directly on the root or nested under another node.
pub type NodeFactory = PropertyHandler;

/// Executes a method body with already-validated params.
pub type MethodHandler =
    Arc<dyn Fn(NodeContext, Value) -> BoxFuture<ApiResult<Value>> + Send + Sync>;

/// Pre-invoke hook: transforms/validates params before the handler body.
/// A rejection aborts the call; the handler never runs.
pub type BeforeHook =
    Arc<dyn Fn(NodeContext, Value) -> BoxFuture<ApiResult<Value>> + Send + Sync>;

/// Async hook a generator schema may declare; runs before a freshly built
/// node is returned, and its failure aborts the resolution.
pub type InitHook = Arc<dyn Fn(NodeContext) -> BoxFuture<ApiResult<()>> + Send + Sync>;

/// The cheap-clone state handed to every handler: the shared API context
/// plus the owning node's path and id.
#[derive(Clone)]
pub struct NodeContext {
    pub api: ApiHandle,
    pub path: String,
    pub id: String,
}

impl NodeContext {
    pub fn root(api: ApiHandle) -> Self {
        Self {
            api,
            path: String::new(),
            id: String::new(),
        }
    }

    /// Context for a child node one segment below this one.
    pub fn child(&self, id: &str) -> Self {
        Self {
            api: self.api.clone(),
            path: format!("{}/{}", self.path, id),
            id: id.to_string(),
        }
    }
}

/// Closed set of node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Template,
    Record,
    Collection,
    Property,
}

/// Static identity and presentation metadata of a node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSchema {
    pub id: String,
    pub path: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub interfaces: Vec<String>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

/// Presentation metadata a schema author attaches to a node.
#[derive(Debug, Clone, Default)]
pub struct NodeMeta {
    pub title: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub extra: JsonMap,
}

impl NodeMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Presentation metadata of a single property or method.
#[derive(Debug, Clone, Default)]
pub struct DescriptorMeta {
    pub title: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
}

impl DescriptorMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    fn describe(&self) -> JsonMap {
        let mut out = JsonMap::new();
        if let Some(title) = &self.title {
            out.insert("title".into(), json!(title));
        }
        if let Some(description) = &self.description {
            out.insert("description".into(), json!(description));
        }
        if let Some(icon) = &self.icon {
            out.insert("icon".into(), json!(icon));
        }
        out
    }
}

/// Registered sub-endpoint resolver.
#[derive(Clone)]
pub struct PropertyDescriptor {
    pub meta: DescriptorMeta,
    pub handler: PropertyHandler,
}

/// Registered remote-callable operation.
#[derive(Clone)]
pub struct MethodDescriptor {
    pub meta: DescriptorMeta,
    pub params: Option<Arc<Validator>>,
    pub before: Option<BeforeHook>,
    pub handler: MethodHandler,
}

/// An addressable endpoint in the service tree.
pub struct Node {
    kind: NodeKind,
    schema: NodeSchema,
    ctx: NodeContext,
    properties: BTreeMap<String, PropertyDescriptor>,
    catch_all: Option<PropertyDescriptor>,
    methods: BTreeMap<String, MethodDescriptor>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("kind", &self.kind)
            .field("path", &self.schema.path)
            .finish_non_exhaustive()
    }
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn schema(&self) -> &NodeSchema {
        &self.schema
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn path(&self) -> &str {
        &self.schema.path
    }

    /// Looks up a declared property handler for `name`, falling back to the
    /// catch-all handler if one is declared.
    pub async fn resolve_property(&self, name: &str) -> ApiResult<Arc<Node>> {
        let not_found = || ApiError::EndpointNotFound {
            path: format!("{}/{}", self.schema.path, name),
        };
        let (descriptor, declared) = match self.properties.get(name) {
            Some(p) => (p, true),
            None => match &self.catch_all {
                Some(p) => (p, false),
                None => return Err(not_found()),
            },
        };
        match (descriptor.handler)(self.ctx.clone(), name.to_string()).await? {
            Some(node) => Ok(node),
            None if declared => Err(ApiError::InvalidPropertyConstructor {
                path: self.schema.path.clone(),
                name: name.to_string(),
            }),
            None => Err(not_found()),
        }
    }

    /// Invokes a declared method, awaiting its pre-invoke hook first.
    ///
    /// The built-in `schema` method is available on every node unless the
    /// node declares its own.
    pub async fn invoke_method(&self, method: &str, params: Value) -> ApiResult<Value> {
        let Some(descriptor) = self.methods.get(method) else {
            if method == "schema" {
                return Ok(self.describe(true));
            }
            return Err(ApiError::UndefinedMethod {
                path: self.schema.path.clone(),
                method: method.to_string(),
            });
        };

        let params = if params.is_null() {
            Value::Object(JsonMap::new())
        } else {
            params
        };

        let params = match &descriptor.before {
            Some(hook) => {
                let transformed = hook(self.ctx.clone(), params).await?;
                if !transformed.is_object() {
                    return Err(ApiError::InvalidMethodConstructor {
                        path: self.schema.path.clone(),
                        method: method.to_string(),
                    });
                }
                transformed
            }
            None => params,
        };

        (descriptor.handler)(self.ctx.clone(), params).await
    }

    /// Static metadata; with `deep` also the declared property and method
    /// descriptor maps (names and parameter schemas, never live data).
    pub fn describe(&self, deep: bool) -> Value {
        let mut out = match serde_json::to_value(&self.schema) {
            Ok(Value::Object(map)) => map,
            _ => JsonMap::new(),
        };
        if deep {
            let mut properties = JsonMap::new();
            for (name, p) in &self.properties {
                properties.insert(name.clone(), Value::Object(p.meta.describe()));
            }
            if let Some(p) = &self.catch_all {
                properties.insert("*".into(), Value::Object(p.meta.describe()));
            }
            let mut methods = JsonMap::new();
            for (name, m) in &self.methods {
                let mut desc = m.meta.describe();
                if let Some(params) = &m.params {
                    desc.insert("params".into(), params.describe());
                }
                methods.insert(name.clone(), Value::Object(desc));
            }
            out.insert("properties".into(), Value::Object(properties));
            out.insert("methods".into(), Value::Object(methods));
        }
        Value::Object(out)
    }
}

/// Builds a [`Node`]'s registration tables. One builder per node instance;
/// registration order is irrelevant, the tables are name-ordered.
pub struct NodeBuilder {
    kind: NodeKind,
    ctx: NodeContext,
    meta: NodeMeta,
    interfaces: Vec<String>,
    properties: BTreeMap<String, PropertyDescriptor>,
    catch_all: Option<PropertyDescriptor>,
    methods: BTreeMap<String, MethodDescriptor>,
}

impl NodeBuilder {
    pub fn new(kind: NodeKind, ctx: NodeContext, meta: NodeMeta) -> Self {
        Self {
            kind,
            ctx,
            meta,
            interfaces: Vec::new(),
            properties: BTreeMap::new(),
            catch_all: None,
            methods: BTreeMap::new(),
        }
    }

    pub fn interface(mut self, tag: impl Into<String>) -> Self {
        self.interfaces.push(tag.into());
        self
    }

    pub fn property(
        mut self,
        name: impl Into<String>,
        meta: DescriptorMeta,
        handler: PropertyHandler,
    ) -> Self {
        self.properties
            .insert(name.into(), PropertyDescriptor { meta, handler });
        self
    }

    /// Fallback resolver for dynamic (e.g. id-based) children.
    pub fn catch_all(mut self, meta: DescriptorMeta, handler: PropertyHandler) -> Self {
        self.catch_all = Some(PropertyDescriptor { meta, handler });
        self
    }

    /// Registers a method. A declared parameter schema is compiled into the
    /// uniform strict-validation pre-invoke hook.
    pub fn method(
        self,
        name: impl Into<String>,
        meta: DescriptorMeta,
        params: Option<Validator>,
        handler: MethodHandler,
    ) -> Self {
        let params = params.map(Arc::new);
        let before = params.clone().map(validation_hook);
        self.method_custom(name, meta, params, before, handler)
    }

    /// Registers a method with an explicit pre-invoke hook (the declared
    /// params schema is kept for introspection only).
    pub fn method_custom(
        mut self,
        name: impl Into<String>,
        meta: DescriptorMeta,
        params: Option<Arc<Validator>>,
        before: Option<BeforeHook>,
        handler: MethodHandler,
    ) -> Self {
        self.methods.insert(
            name.into(),
            MethodDescriptor {
                meta,
                params,
                before,
                handler,
            },
        );
        self
    }

    pub fn build(self) -> Arc<Node> {
        let schema = NodeSchema {
            id: self.ctx.id.clone(),
            path: self.ctx.path.clone(),
            title: self.meta.title.unwrap_or_else(|| self.ctx.id.clone()),
            description: self.meta.description,
            icon: self.meta.icon,
            interfaces: self.interfaces,
            extra: self.meta.extra,
        };
        Arc::new(Node {
            kind: self.kind,
            schema,
            ctx: self.ctx,
            properties: self.properties,
            catch_all: self.catch_all,
            methods: self.methods,
        })
    }
}

/// The uniform validation-before-invoke hook: strict composite validation
/// of the params object against the declared schema.
pub fn validation_hook(validator: Arc<Validator>) -> BeforeHook {
    Arc::new(move |_ctx, params| {
        let validator = validator.clone();
        Box::pin(async move {
            let map = match params {
                Value::Object(map) => map,
                Value::Null => JsonMap::new(),
                _ => {
                    return Err(apibus_validator::InvalidValue::new(
                        apibus_validator::InvalidKind::NotObject,
                        "params",
                        "params must be an object",
                    )
                    .into())
                }
            };
            let validated = validator.validate(&map, true, None)?;
            Ok(Value::Object(validated))
        })
    })
}

/// Wraps a plain async closure into a [`PropertyHandler`].
pub fn property_handler<F, Fut>(f: F) -> PropertyHandler
where
    F: Fn(NodeContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ApiResult<Option<Arc<Node>>>> + Send + 'static,
{
    Arc::new(move |ctx, name| Box::pin(f(ctx, name)))
}

/// Wraps a plain async closure into a [`MethodHandler`].
pub fn method_handler<F, Fut>(f: F) -> MethodHandler
where
    F: Fn(NodeContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ApiResult<Value>> + Send + 'static,
{
    Arc::new(move |ctx, params| Box::pin(f(ctx, params)))
}
