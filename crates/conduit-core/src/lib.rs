//! # conduit-core
//!
//! Bindings, action dispatch, group fan-out and stream multiplexing for the
//! Conduit resource-binding engine.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Binding** - Wires a stream to a data source, codec and permissions
//! - **Dispatcher** - Runs CRUD, list, subscribe and custom actions
//! - **GroupRegistry** - Tracks group memberships and fans out changes
//! - **Multiplexer** - Per-connection protocol state machine
//! - **Authenticator** - Resolves handshake credentials to a user
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Multiplexer │────▶│ Dispatcher  │────▶│ DataSource  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │ GroupLayer  │
//!                     └─────────────┘
//! ```

pub mod auth;
pub mod binding;
pub mod codec;
pub mod dispatch;
pub mod event;
pub mod group;
pub mod multiplexer;
pub mod permission;
pub mod registry;
pub mod session;
pub mod source;

pub use auth::{
    Authenticator, Credentials, Handshake, Identity, NoAuthentication, StaticAuthenticator, User,
};
pub use binding::{
    ActionHandler, ActionOutcome, ActionRequest, ActionScope, AutoSubscribe, Binding,
    BindingBuilder, BindingError, BindingRegistry, BuiltinAction, ConnectHook, FnHandler,
    DEFAULT_PAGE_SIZE,
};
pub use codec::{FieldErrors, FieldKind, FieldSpec, Fields, Record, RecordCodec, SchemaCodec};
pub use dispatch::{DispatchContext, DispatchError, Dispatcher};
pub use event::{ChangeEvent, ChangeKind};
pub use group::GroupKey;
pub use multiplexer::{ConnectAck, ConnectionState, FrameOutcome, Multiplexer};
pub use permission::{AllowAny, IsAuthenticated, IsSuperuser, Permission, PermissionKind, ReadOnly};
pub use registry::{
    DeliveryReport, GroupError, GroupLayer, GroupRegistry, RegistryConfig, RegistryStats,
};
pub use session::{ConnectionId, Delivery, ReplyChannel, Session};
pub use source::{DataSource, MemoryStore, SourceError};
