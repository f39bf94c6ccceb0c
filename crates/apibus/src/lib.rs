//! # apibus
//!
//! Schema-driven RPC/pub-sub endpoint framework for backend services
//! talking over an arbitrary message broker.
//!
//! A service exposes a tree of addressable endpoints. Every tree node
//! carries property handlers (resolving child endpoints by path segment)
//! and methods (remote-callable operations with declarative parameter
//! validation). Nodes are built lazily per call from declarative schemas:
//!
//! - [`endpoint::TemplateSchema`] — custom properties and methods;
//! - [`endpoint::RecordSchema`] — a single record with typed data
//!   properties, synthesized `get`/`update`/`delete`/`live` methods and a
//!   child endpoint per property;
//! - [`endpoint::CollectionSchema`] — a record set with
//!   `query`/`create`/`delete`/`count`/`map` plus live query channels and
//!   a per-id record child.
//!
//! [`client::ApiClient`] mounts the factories, connects to a broker
//! through the [`client::Connection`] contract, and dispatches inbound
//! calls by walking the path from the root. Live queries are deduplicated
//! per endpoint by [`live::LiveCache`]; cross-service link fields are
//! expanded by the [`resolvers`] combinators.
//!
//! ```no_run
//! use apibus::client::ApiClient;
//! use apibus::endpoint::{CollectionSchema, RecordSchema};
//! use apibus_validator::text;
//! use serde_json::json;
//!
//! # async fn example() -> apibus::error::ApiResult<()> {
//! let client = ApiClient::new("notes");
//! let notes = CollectionSchema::new()
//!     .record(RecordSchema::new().property("text", text().required()))
//!     .query(|_ctx, _params| async move { Ok(vec![json!({"text": "hi"})]) })
//!     .count(|_ctx, _params| async move { Ok(1) });
//! client.endpoint("notes", notes.into_factory()).await;
//! let envelope = client.handle_call("/notes", "query", json!({})).await?;
//! assert_eq!(envelope["total"], json!(1));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod endpoint;
pub mod error;
pub mod live;
pub mod protocol;
pub mod resolvers;
pub mod types;

pub use client::{ApiClient, ApiHandle, Connection, Subscription};
pub use endpoint::{CollectionSchema, Node, NodeContext, RecordSchema, Root, TemplateSchema};
pub use error::{ApiError, ApiResult};
pub use live::{ChangeEvent, ChangeOp, FeedHandle, LiveCache, LiveFeed};
pub use types::{ApiReference, ChannelReference};
