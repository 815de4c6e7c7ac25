//! Resource bindings.
//!
//! A [`Binding`] wires one stream to a data source, a codec, a permission
//! sequence and a set of actions. Bindings are built once at startup and
//! shared read-only by every connection.

use crate::auth::Identity;
use crate::codec::{Record, RecordCodec};
use crate::dispatch::DispatchError;
use crate::event::ChangeKind;
use crate::group::GroupKey;
use crate::permission::{AllowAny, Permission};
use crate::registry::GroupLayer;
use crate::session::ReplyChannel;
use crate::source::DataSource;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Default number of records per list page.
pub const DEFAULT_PAGE_SIZE: usize = 25;

/// Whether an action works on the collection or on one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionScope {
    List,
    Detail,
}

/// Actions every binding supports unless disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinAction {
    Create,
    Retrieve,
    Update,
    PartialUpdate,
    Delete,
    List,
    Subscribe,
    Unsubscribe,
}

impl BuiltinAction {
    /// All built-in actions.
    pub const ALL: [BuiltinAction; 8] = [
        BuiltinAction::Create,
        BuiltinAction::Retrieve,
        BuiltinAction::Update,
        BuiltinAction::PartialUpdate,
        BuiltinAction::Delete,
        BuiltinAction::List,
        BuiltinAction::Subscribe,
        BuiltinAction::Unsubscribe,
    ];

    /// Actions that change records.
    pub const MUTATIONS: [BuiltinAction; 4] = [
        BuiltinAction::Create,
        BuiltinAction::Update,
        BuiltinAction::PartialUpdate,
        BuiltinAction::Delete,
    ];

    /// Wire name of the action.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BuiltinAction::Create => "create",
            BuiltinAction::Retrieve => "retrieve",
            BuiltinAction::Update => "update",
            BuiltinAction::PartialUpdate => "partial_update",
            BuiltinAction::Delete => "delete",
            BuiltinAction::List => "list",
            BuiltinAction::Subscribe => "subscribe",
            BuiltinAction::Unsubscribe => "unsubscribe",
        }
    }

    /// Look up a built-in by wire name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == name)
    }

    #[must_use]
    pub fn scope(self) -> ActionScope {
        match self {
            BuiltinAction::Retrieve
            | BuiltinAction::Update
            | BuiltinAction::PartialUpdate
            | BuiltinAction::Delete => ActionScope::Detail,
            _ => ActionScope::List,
        }
    }

    /// The change a successful run of this action publishes, if any.
    #[must_use]
    pub fn change_kind(self) -> Option<ChangeKind> {
        match self {
            BuiltinAction::Create => Some(ChangeKind::Create),
            BuiltinAction::Update | BuiltinAction::PartialUpdate => Some(ChangeKind::Update),
            BuiltinAction::Delete => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// Result of a custom action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub data: Option<Value>,
    pub status: u16,
}

impl ActionOutcome {
    /// A 200 outcome.
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self::with_status(data, 200)
    }

    #[must_use]
    pub fn with_status(data: Value, status: u16) -> Self {
        Self {
            data: Some(data),
            status,
        }
    }
}

/// Input to a custom action.
pub struct ActionRequest<'a> {
    pub binding: &'a Binding,
    pub identity: &'a Identity,
    /// Key as sent by the client.
    pub pk: Option<&'a Value>,
    /// For detail actions, the record the key resolved to.
    pub record: Option<Record>,
    pub data: Option<&'a Value>,
}

/// Handler for a custom action.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Run the action.
    ///
    /// Errors are turned into a response with the error's status.
    async fn handle(&self, request: ActionRequest<'_>) -> Result<ActionOutcome, DispatchError>;
}

/// Adapts a synchronous closure into an [`ActionHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> ActionHandler for FnHandler<F>
where
    F: Fn(ActionRequest<'_>) -> Result<ActionOutcome, DispatchError> + Send + Sync,
{
    async fn handle(&self, request: ActionRequest<'_>) -> Result<ActionOutcome, DispatchError> {
        (self.0)(request)
    }
}

/// A custom action registered on a binding.
#[derive(Clone)]
pub struct CustomAction {
    pub name: String,
    pub scope: ActionScope,
    pub handler: Arc<dyn ActionHandler>,
}

impl fmt::Debug for CustomAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomAction")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Hook run for every binding when a connection opens.
#[async_trait]
pub trait ConnectHook: Send + Sync {
    async fn on_connect(
        &self,
        binding: &Binding,
        identity: &Identity,
        reply: &ReplyChannel,
        groups: &dyn GroupLayer,
    );
}

/// Subscribes every new connection to a fixed set of groups.
#[derive(Debug, Clone)]
pub struct AutoSubscribe {
    actions: Vec<String>,
    authenticated_only: bool,
}

impl AutoSubscribe {
    /// Subscribe to the given actions.
    #[must_use]
    pub fn new<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
            authenticated_only: false,
        }
    }

    /// Skip anonymous connections.
    #[must_use]
    pub fn authenticated_only(mut self) -> Self {
        self.authenticated_only = true;
        self
    }
}

#[async_trait]
impl ConnectHook for AutoSubscribe {
    async fn on_connect(
        &self,
        binding: &Binding,
        identity: &Identity,
        reply: &ReplyChannel,
        groups: &dyn GroupLayer,
    ) {
        if self.authenticated_only && !identity.is_authenticated() {
            return;
        }

        for action in &self.actions {
            let group = GroupKey::new(binding.stream(), action.as_str());
            if let Err(e) = groups.subscribe(reply, group).await {
                warn!(
                    connection = %reply.connection_id(),
                    stream = %binding.stream(),
                    action = %action,
                    error = %e,
                    "Auto-subscribe failed"
                );
            }
        }
    }
}

/// An action name resolved against a binding.
#[derive(Debug, Clone, Copy)]
pub enum ResolvedAction<'a> {
    Builtin(BuiltinAction),
    Custom(&'a CustomAction),
}

/// Static wiring of one resource type to a stream.
pub struct Binding {
    stream: String,
    model: String,
    source: Arc<dyn DataSource>,
    codec: Arc<dyn RecordCodec>,
    permissions: Vec<Arc<dyn Permission>>,
    builtins: HashSet<BuiltinAction>,
    custom: HashMap<String, CustomAction>,
    page_size: usize,
    on_connect: Option<Arc<dyn ConnectHook>>,
}

impl Binding {
    /// Start building a binding.
    #[must_use]
    pub fn builder(
        stream: impl Into<String>,
        model: impl Into<String>,
        source: Arc<dyn DataSource>,
        codec: Arc<dyn RecordCodec>,
    ) -> BindingBuilder {
        BindingBuilder {
            stream: stream.into(),
            model: model.into(),
            source,
            codec,
            permissions: Vec::new(),
            builtins: BuiltinAction::ALL.into_iter().collect(),
            custom: HashMap::new(),
            page_size: DEFAULT_PAGE_SIZE,
            on_connect: None,
        }
    }

    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Resource identifier sent in notifications.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    #[must_use]
    pub fn source(&self) -> &dyn DataSource {
        self.source.as_ref()
    }

    #[must_use]
    pub fn codec(&self) -> &dyn RecordCodec {
        self.codec.as_ref()
    }

    #[must_use]
    pub fn permissions(&self) -> &[Arc<dyn Permission>] {
        &self.permissions
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn connect_hook(&self) -> Option<&dyn ConnectHook> {
        self.on_connect.as_deref()
    }

    /// Resolve an action name. Custom actions shadow built-ins of the same name.
    #[must_use]
    pub fn resolve(&self, action: &str) -> Option<ResolvedAction<'_>> {
        if let Some(custom) = self.custom.get(action) {
            return Some(ResolvedAction::Custom(custom));
        }
        BuiltinAction::from_name(action)
            .filter(|builtin| self.builtins.contains(builtin))
            .map(ResolvedAction::Builtin)
    }

    /// Names of every enabled action, sorted.
    #[must_use]
    pub fn actions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .builtins
            .iter()
            .map(|b| b.as_str())
            .chain(self.custom.keys().map(String::as_str))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("stream", &self.stream)
            .field("model", &self.model)
            .field("permissions", &self.permissions)
            .field("actions", &self.actions())
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Binding`].
pub struct BindingBuilder {
    stream: String,
    model: String,
    source: Arc<dyn DataSource>,
    codec: Arc<dyn RecordCodec>,
    permissions: Vec<Arc<dyn Permission>>,
    builtins: HashSet<BuiltinAction>,
    custom: HashMap<String, CustomAction>,
    page_size: usize,
    on_connect: Option<Arc<dyn ConnectHook>>,
}

impl BindingBuilder {
    /// Append a permission evaluator.
    #[must_use]
    pub fn permission(mut self, permission: impl Permission + 'static) -> Self {
        self.permissions.push(Arc::new(permission));
        self
    }

    /// Append several permission evaluators.
    #[must_use]
    pub fn permissions(mut self, permissions: impl IntoIterator<Item = Arc<dyn Permission>>) -> Self {
        self.permissions.extend(permissions);
        self
    }

    /// Records per list page. Zero is treated as one.
    #[must_use]
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Disable every action that changes records.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        for action in BuiltinAction::MUTATIONS {
            self.builtins.remove(&action);
        }
        self
    }

    /// Disable one built-in action.
    #[must_use]
    pub fn disable(mut self, action: BuiltinAction) -> Self {
        self.builtins.remove(&action);
        self
    }

    /// Register a custom collection action.
    #[must_use]
    pub fn list_action(self, name: impl Into<String>, handler: impl ActionHandler + 'static) -> Self {
        self.custom_action(name.into(), ActionScope::List, Arc::new(handler))
    }

    /// Register a custom record action. The key is resolved before the
    /// handler runs.
    #[must_use]
    pub fn detail_action(
        self,
        name: impl Into<String>,
        handler: impl ActionHandler + 'static,
    ) -> Self {
        self.custom_action(name.into(), ActionScope::Detail, Arc::new(handler))
    }

    /// Register a custom collection action from a closure.
    #[must_use]
    pub fn list_action_fn<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActionRequest<'_>) -> Result<ActionOutcome, DispatchError> + Send + Sync + 'static,
    {
        self.list_action(name, FnHandler(f))
    }

    /// Register a custom record action from a closure.
    #[must_use]
    pub fn detail_action_fn<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActionRequest<'_>) -> Result<ActionOutcome, DispatchError> + Send + Sync + 'static,
    {
        self.detail_action(name, FnHandler(f))
    }

    fn custom_action(
        mut self,
        name: String,
        scope: ActionScope,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        self.custom.insert(
            name.clone(),
            CustomAction {
                name,
                scope,
                handler,
            },
        );
        self
    }

    /// Run a hook whenever a connection opens.
    #[must_use]
    pub fn on_connect(mut self, hook: impl ConnectHook + 'static) -> Self {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    /// Finish the binding. Without any permission evaluators the binding
    /// allows everything.
    #[must_use]
    pub fn build(mut self) -> Binding {
        if self.permissions.is_empty() {
            self.permissions.push(Arc::new(AllowAny));
        }
        Binding {
            stream: self.stream,
            model: self.model,
            source: self.source,
            codec: self.codec,
            permissions: self.permissions,
            builtins: self.builtins,
            custom: self.custom,
            page_size: self.page_size,
            on_connect: self.on_connect,
        }
    }
}

/// Binding registry errors.
#[derive(Debug, Error)]
pub enum BindingError {
    /// Two bindings claim the same stream.
    #[error("Stream already bound: {0}")]
    DuplicateStream(String),

    /// Stream tag is empty.
    #[error("Stream name cannot be empty")]
    EmptyStream,
}

/// Process-wide mapping of stream tag to binding.
#[derive(Debug, Default)]
pub struct BindingRegistry {
    bindings: BTreeMap<String, Arc<Binding>>,
}

impl BindingRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binding under its stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is empty or already bound.
    pub fn register(&mut self, binding: Binding) -> Result<(), BindingError> {
        if binding.stream.is_empty() {
            return Err(BindingError::EmptyStream);
        }
        if self.bindings.contains_key(&binding.stream) {
            return Err(BindingError::DuplicateStream(binding.stream));
        }

        debug!(
            stream = %binding.stream,
            model = %binding.model,
            actions = ?binding.actions(),
            "Registered binding"
        );
        self.bindings
            .insert(binding.stream.clone(), Arc::new(binding));
        Ok(())
    }

    /// Look up the binding for a stream.
    #[must_use]
    pub fn get(&self, stream: &str) -> Option<&Arc<Binding>> {
        self.bindings.get(stream)
    }

    /// Bindings in stream order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Binding>> {
        self.bindings.values()
    }

    #[must_use]
    pub fn streams(&self) -> Vec<&str> {
        self.bindings.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FieldKind, FieldSpec, SchemaCodec};
    use crate::permission::IsAuthenticated;
    use crate::source::MemoryStore;
    use serde_json::json;

    fn widget() -> BindingBuilder {
        Binding::builder(
            "widget",
            "inventory.widget",
            Arc::new(MemoryStore::new()),
            Arc::new(SchemaCodec::new(vec![FieldSpec::new(
                "name",
                FieldKind::String,
            )])),
        )
    }

    #[test]
    fn test_builtin_names() {
        for action in BuiltinAction::ALL {
            assert_eq!(BuiltinAction::from_name(action.as_str()), Some(action));
        }
        assert_eq!(BuiltinAction::from_name("destroy"), None);
        assert_eq!(BuiltinAction::Delete.scope(), ActionScope::Detail);
        assert_eq!(BuiltinAction::List.scope(), ActionScope::List);
        assert_eq!(
            BuiltinAction::PartialUpdate.change_kind(),
            Some(ChangeKind::Update)
        );
        assert_eq!(BuiltinAction::Subscribe.change_kind(), None);
    }

    #[test]
    fn test_defaults() {
        let binding = widget().build();
        assert_eq!(binding.page_size(), DEFAULT_PAGE_SIZE);
        assert_eq!(binding.permissions().len(), 1);
        assert_eq!(binding.actions().len(), 8);
        assert!(binding.connect_hook().is_none());
    }

    #[test]
    fn test_resolve_custom_and_disabled() {
        let binding = widget()
            .read_only()
            .permission(IsAuthenticated)
            .list_action_fn("report", |_| Ok(ActionOutcome::ok(json!({"total": 0}))))
            .detail_action_fn("delete", |_| Ok(ActionOutcome::ok(json!(null))))
            .build();

        assert!(matches!(
            binding.resolve("list"),
            Some(ResolvedAction::Builtin(BuiltinAction::List))
        ));
        assert!(binding.resolve("create").is_none());
        assert!(binding.resolve("unknown").is_none());

        match binding.resolve("report") {
            Some(ResolvedAction::Custom(custom)) => assert_eq!(custom.scope, ActionScope::List),
            other => panic!("expected custom action, got {other:?}"),
        }
        assert!(matches!(
            binding.resolve("delete"),
            Some(ResolvedAction::Custom(_))
        ));
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = BindingRegistry::new();
        registry.register(widget().build()).unwrap();

        assert!(matches!(
            registry.register(widget().build()),
            Err(BindingError::DuplicateStream(stream)) if stream == "widget"
        ));
        assert_eq!(registry.streams(), vec!["widget"]);
        assert!(registry.get("widget").is_some());
        assert!(registry.get("gadget").is_none());
    }
}
