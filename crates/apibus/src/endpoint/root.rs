//! Service root: the empty-path node every dispatch walk starts from.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::client::ApiHandle;
use crate::endpoint::{
    DescriptorMeta, Node, NodeBuilder, NodeContext, NodeKind, NodeMeta, PropertyDescriptor,
    PropertyHandler,
};

/// Mount table for top-level endpoints. Mounts may be added while the
/// service runs; each dispatch builds its root node from a snapshot of the
/// table, so in-flight walks are never affected.
#[derive(Default)]
pub struct Root {
    mounts: RwLock<BTreeMap<String, PropertyDescriptor>>,
}

impl Root {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_property(
        &self,
        name: impl Into<String>,
        meta: DescriptorMeta,
        handler: PropertyHandler,
    ) {
        self.mounts
            .write()
            .await
            .insert(name.into(), PropertyDescriptor { meta, handler });
    }

    pub async fn remove_property(&self, name: &str) -> bool {
        self.mounts.write().await.remove(name).is_some()
    }

    /// Root node over the current mount table.
    pub async fn node(&self, api: ApiHandle) -> Arc<Node> {
        let mounts = self.mounts.read().await.clone();
        let meta = NodeMeta::new()
            .title("Service root")
            .description("Root of service API")
            .icon("settings");
        let mut builder = NodeBuilder::new(NodeKind::Root, NodeContext::root(api), meta)
            .interface("root");
        for (name, descriptor) in mounts {
            builder = builder.property(name, descriptor.meta, descriptor.handler);
        }
        builder.build()
    }
}
