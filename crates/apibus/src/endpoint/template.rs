//! Template generator: the minimal declarative schema, custom properties
//! and methods only, compiled into a mountable node factory.

use std::sync::Arc;

use apibus_validator::Validator;

use crate::endpoint::{
    validation_hook, BeforeHook, DescriptorMeta, InitHook, MethodHandler, NodeBuilder,
    NodeContext, NodeFactory, NodeKind, NodeMeta, PropertyHandler,
};
use crate::error::ApiResult;

/// One registered method, with its before hook precompiled.
pub(crate) struct MethodSpec {
    pub(crate) name: String,
    pub(crate) meta: DescriptorMeta,
    pub(crate) params: Option<Arc<Validator>>,
    pub(crate) before: Option<BeforeHook>,
    pub(crate) handler: MethodHandler,
}

impl MethodSpec {
    pub(crate) fn new(
        name: String,
        meta: DescriptorMeta,
        params: Option<Validator>,
        handler: MethodHandler,
    ) -> Self {
        let params = params.map(Arc::new);
        let before = params.clone().map(validation_hook);
        Self {
            name,
            meta,
            params,
            before,
            handler,
        }
    }
}

/// Declarative schema for a generic endpoint.
#[derive(Default)]
pub struct TemplateSchema {
    meta: NodeMeta,
    init: Option<InitHook>,
    properties: Vec<(String, DescriptorMeta, PropertyHandler)>,
    methods: Vec<MethodSpec>,
}

impl TemplateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn meta(mut self, meta: NodeMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Async warm-up/existence check run before each resolved node is
    /// returned; a failure aborts the resolution.
    pub fn init<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ApiResult<()>> + Send + 'static,
    {
        self.init = Some(Arc::new(move |ctx| Box::pin(f(ctx))));
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

    /// Declared methods get the uniform strict-validation before hook when
    /// a params schema is given.
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

    pub fn into_factory(self) -> NodeFactory {
        let compiled = Arc::new(self);
        Arc::new(move |ctx, name| {
            let compiled = compiled.clone();
            Box::pin(async move {
                let ctx = ctx.child(&name);
                if let Some(init) = &compiled.init {
                    init(ctx.clone()).await?;
                }
                let mut builder =
                    NodeBuilder::new(NodeKind::Template, ctx, compiled.meta.clone())
                        .interface("template");
                for (name, meta, handler) in &compiled.properties {
                    builder = builder.property(name.clone(), meta.clone(), handler.clone());
                }
                for method in &compiled.methods {
                    builder = builder.method_custom(
                        method.name.clone(),
                        method.meta.clone(),
                        method.params.clone(),
                        method.before.clone(),
                        method.handler.clone(),
                    );
                }
                Ok(Some(builder.build()))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ApiHandle;
    use crate::endpoint::method_handler;
    use crate::error::ApiError;
    use apibus_validator::text;
    use serde_json::json;

    #[tokio::test]
    async fn factory_builds_node_with_methods() {
        let factory = TemplateSchema::new()
            .meta(NodeMeta::new().title("Echo"))
            .method(
                "echo",
                DescriptorMeta::new(),
                Some(Validator::new().field("text", text().required())),
                method_handler(|_, params| async move { Ok(params) }),
            )
            .into_factory();

        let ctx = NodeContext::root(ApiHandle::new("test"));
        let node = factory(ctx, "echo".into()).await.unwrap().unwrap();
        assert_eq!(node.path(), "/echo");
        let out = node
            .invoke_method("echo", json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(out, json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn failing_init_aborts_resolution() {
        let factory = TemplateSchema::new()
            .init(|_ctx| async move { Err(anyhow::anyhow!("missing backing data").into()) })
            .into_factory();

        let ctx = NodeContext::root(ApiHandle::new("test"));
        let err = factory(ctx, "x".into()).await.unwrap_err();
        assert!(matches!(err, ApiError::Other(_)));
    }
}
