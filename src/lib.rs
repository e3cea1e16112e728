//! Marketplace Sync - client-side data engine for the lending marketplace
//!
//! Keeps local views of server collections consistent while they are
//! paginated from the REST API and updated by pushes:
//! - Cursor pagination driven by RFC 8288 `link` headers
//! - Live overlays merged over paginated baselines
//! - A reference-counted push socket shared by all subscribers
//! - Authenticated requests with one coalesced session refresh

pub mod api;
pub mod chat;
pub mod config;
pub mod engine;
pub mod items;
pub mod model;
pub mod push;
pub mod sync;
pub mod telemetry;

pub use api::{ApiClient, AuthSession, SessionState};
pub use chat::{ChatList, ChatSync, LiveChatFeed};
pub use config::{ClientConfig, ConfigError};
pub use engine::SyncEngine;
pub use items::{ItemFeed, ItemFilters};
pub use push::{PushChannel, PushKind, PushMessage, Subscription};
pub use sync::{
    CursorPaginator, LiveMergeCollection, QueryParams, RefCountedResource, SyncError, SyncResult,
    SyncedCollection,
};
pub use telemetry::init_tracing;
