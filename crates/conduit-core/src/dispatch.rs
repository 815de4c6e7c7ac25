//! Action dispatch.
//!
//! The [`Dispatcher`] turns one request payload into one response payload:
//! it resolves the action on the binding, checks permissions, runs the action
//! against the data source and codec, and publishes change notifications
//! after successful mutations. Every failure, including a panic inside an
//! action, becomes an error response; dispatch never fails the connection.

use crate::auth::Identity;
use crate::binding::{
    ActionOutcome, ActionRequest, ActionScope, Binding, BuiltinAction, ResolvedAction,
};
use crate::codec::{FieldErrors, Record};
use crate::event::{ChangeEvent, ChangeKind};
use crate::group::GroupKey;
use crate::permission::check_all;
use crate::registry::{GroupError, GroupLayer};
use crate::session::ReplyChannel;
use crate::source::SourceError;
use conduit_protocol::{RequestPayload, ResponsePayload};
use futures_util::FutureExt;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace};

/// Generic message for internal failures. Details stay in the server log.
pub const SERVER_ERROR: &str = "A server error occurred.";

/// Per-request errors. Each maps to a response status and error list.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Action not enabled on the binding.
    #[error("Invalid Action")]
    InvalidAction,

    /// A permission evaluator denied the action.
    #[error("Permission Denied")]
    PermissionDenied,

    /// Missing, unknown or unresolvable key.
    #[error("Not found.")]
    NotFound,

    /// Input failed validation.
    #[error("Validation failed: {0}")]
    Validation(FieldErrors),

    /// Malformed action input.
    #[error("{0}")]
    BadRequest(String),

    /// Custom failure with an explicit status.
    #[error("Rejected with status {status}")]
    Rejected { status: u16, errors: Vec<Value> },

    /// Unexpected failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Response status for this error.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            DispatchError::InvalidAction
            | DispatchError::Validation(_)
            | DispatchError::BadRequest(_) => 400,
            DispatchError::PermissionDenied => 401,
            DispatchError::NotFound => 404,
            DispatchError::Rejected { status, .. } => *status,
            DispatchError::Internal(_) => 500,
        }
    }

    /// Response error entries for this error.
    #[must_use]
    pub fn errors(&self) -> Vec<Value> {
        match self {
            DispatchError::Validation(fields) => vec![fields.to_value()],
            DispatchError::Rejected { errors, .. } => errors.clone(),
            DispatchError::Internal(_) => vec![Value::from(SERVER_ERROR)],
            other => vec![Value::from(other.to_string())],
        }
    }
}

impl From<SourceError> for DispatchError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::NotFound => DispatchError::NotFound,
            SourceError::Validation(fields) => DispatchError::Validation(fields),
            SourceError::Backend(detail) => DispatchError::Internal(detail),
        }
    }
}

impl From<FieldErrors> for DispatchError {
    fn from(fields: FieldErrors) -> Self {
        DispatchError::Validation(fields)
    }
}

impl From<GroupError> for DispatchError {
    fn from(e: GroupError) -> Self {
        match e {
            GroupError::InvalidGroup(_) => DispatchError::BadRequest("Invalid group name".into()),
            GroupError::MaxSubscriptionsReached => {
                DispatchError::BadRequest("Maximum subscriptions reached".into())
            }
        }
    }
}

/// The connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext<'a> {
    pub identity: &'a Identity,
    /// Reply channel used for group membership.
    pub reply: &'a ReplyChannel,
}

/// Executes actions against bindings.
pub struct Dispatcher {
    groups: Arc<dyn GroupLayer>,
}

impl Dispatcher {
    /// Create a dispatcher publishing changes to `groups`.
    #[must_use]
    pub fn new(groups: Arc<dyn GroupLayer>) -> Self {
        Self { groups }
    }

    /// The group layer.
    #[must_use]
    pub fn groups(&self) -> &Arc<dyn GroupLayer> {
        &self.groups
    }

    /// Dispatch one request.
    ///
    /// The action and request id are echoed in the response whatever the
    /// outcome.
    pub async fn dispatch(
        &self,
        binding: &Binding,
        ctx: DispatchContext<'_>,
        request: RequestPayload,
    ) -> ResponsePayload {
        let RequestPayload {
            action,
            pk,
            request_id,
            data,
        } = request;

        let result = AssertUnwindSafe(self.execute(binding, ctx, &action, pk.as_ref(), data.as_ref()))
            .catch_unwind()
            .await;

        let response = match result {
            Ok(Ok(outcome)) => {
                ResponsePayload::success(action, request_id, outcome.data, outcome.status)
            }
            Ok(Err(e)) => {
                if let DispatchError::Internal(detail) = &e {
                    error!(
                        stream = %binding.stream(),
                        action = %action,
                        error = %detail,
                        "Action failed"
                    );
                } else {
                    debug!(stream = %binding.stream(), action = %action, error = %e, "Action rejected");
                }
                ResponsePayload::failure(action, request_id, e.errors(), e.status())
            }
            Err(_) => {
                error!(stream = %binding.stream(), action = %action, "Action panicked");
                ResponsePayload::failure(action, request_id, vec![Value::from(SERVER_ERROR)], 500)
            }
        };

        trace!(
            stream = %binding.stream(),
            action = %response.action,
            status = response.response_status,
            "Dispatched"
        );
        response
    }

    async fn execute(
        &self,
        binding: &Binding,
        ctx: DispatchContext<'_>,
        action: &str,
        pk: Option<&Value>,
        data: Option<&Value>,
    ) -> Result<ActionOutcome, DispatchError> {
        let resolved = binding
            .resolve(action)
            .ok_or(DispatchError::InvalidAction)?;

        if !check_all(binding.permissions(), ctx.identity, action, pk) {
            return Err(DispatchError::PermissionDenied);
        }

        let scope = match resolved {
            ResolvedAction::Builtin(builtin) => builtin.scope(),
            ResolvedAction::Custom(custom) => custom.scope,
        };
        let record = match scope {
            ActionScope::Detail => Some(fetch(binding, pk).await?),
            ActionScope::List => None,
        };

        match resolved {
            ResolvedAction::Builtin(builtin) => {
                self.run_builtin(binding, ctx, builtin, record, pk, data)
                    .await
            }
            ResolvedAction::Custom(custom) => {
                custom
                    .handler
                    .handle(ActionRequest {
                        binding,
                        identity: ctx.identity,
                        pk,
                        record,
                        data,
                    })
                    .await
            }
        }
    }

    async fn run_builtin(
        &self,
        binding: &Binding,
        ctx: DispatchContext<'_>,
        action: BuiltinAction,
        record: Option<Record>,
        pk: Option<&Value>,
        data: Option<&Value>,
    ) -> Result<ActionOutcome, DispatchError> {
        let codec = binding.codec();
        let source = binding.source();

        match action {
            BuiltinAction::Create => {
                let fields = codec.validate(data, false)?;
                let record = source.create(fields).await?;
                let serialized = Value::Object(codec.serialize(&record));
                self.publish_builtin(binding, action, record.pk, serialized.clone())
                    .await;
                Ok(ActionOutcome::with_status(serialized, 201))
            }
            BuiltinAction::Retrieve => {
                let record = record.ok_or(DispatchError::NotFound)?;
                Ok(ActionOutcome::ok(Value::Object(codec.serialize(&record))))
            }
            BuiltinAction::Update | BuiltinAction::PartialUpdate => {
                let partial = action == BuiltinAction::PartialUpdate;
                let existing = record.ok_or(DispatchError::NotFound)?;
                let fields = codec.validate(data, partial)?;
                let record = source.update(&existing.pk, fields, partial).await?;
                let serialized = Value::Object(codec.serialize(&record));
                self.publish_builtin(binding, action, record.pk, serialized.clone())
                    .await;
                Ok(ActionOutcome::ok(serialized))
            }
            BuiltinAction::Delete => {
                let record = record.ok_or(DispatchError::NotFound)?;
                let serialized = Value::Object(codec.serialize(&record));
                source.delete(&record.pk).await?;
                self.publish_builtin(binding, action, record.pk, serialized)
                    .await;
                Ok(ActionOutcome::ok(json!({})))
            }
            BuiltinAction::List => {
                let page = requested_page(data)?;
                let page_size = binding.page_size();
                let records = match u64::try_from(page) {
                    Ok(page) if page > 0 => source.list(page, page_size).await?,
                    _ => Vec::new(),
                };
                let count = source.count().await?;
                let items: Vec<Value> = records
                    .iter()
                    .map(|record| Value::Object(codec.serialize(record)))
                    .collect();
                Ok(ActionOutcome::ok(json!({
                    "data": items,
                    "page": page,
                    "page_size": page_size,
                    "count": count,
                })))
            }
            BuiltinAction::Subscribe => {
                let group = requested_group(binding, pk, data)?;
                let joined = self.groups.subscribe(ctx.reply, group).await?;
                trace!(connection = %ctx.reply.connection_id(), joined, "Subscribe");
                Ok(ActionOutcome {
                    data: data.cloned(),
                    status: 200,
                })
            }
            BuiltinAction::Unsubscribe => {
                let group = requested_group(binding, pk, data)?;
                let left = self
                    .groups
                    .unsubscribe(ctx.reply.connection_id(), &group)
                    .await;
                trace!(connection = %ctx.reply.connection_id(), left, "Unsubscribe");
                Ok(ActionOutcome {
                    data: data.cloned(),
                    status: 200,
                })
            }
        }
    }

    async fn publish_builtin(&self, binding: &Binding, action: BuiltinAction, pk: Value, data: Value) {
        if let Some(kind) = action.change_kind() {
            self.publish_change(binding, kind, pk, data).await;
        }
    }

    /// Notify the groups of a change on a binding.
    pub async fn publish_change(&self, binding: &Binding, kind: ChangeKind, pk: Value, data: Value) {
        let event = ChangeEvent {
            kind,
            model: binding.model().to_string(),
            pk,
            data,
        };
        let report = self.groups.notify(binding.stream(), &event).await;
        trace!(
            stream = %binding.stream(),
            action = kind.as_str(),
            delivered = report.delivered,
            dropped = report.dropped,
            "Published change"
        );
    }

    /// Run a binding's connect hook, if it has one.
    pub async fn on_connect(&self, binding: &Binding, identity: &Identity, reply: &ReplyChannel) {
        if let Some(hook) = binding.connect_hook() {
            hook.on_connect(binding, identity, reply, self.groups.as_ref())
                .await;
        }
    }
}

async fn fetch(binding: &Binding, pk: Option<&Value>) -> Result<Record, DispatchError> {
    let pk = pk.ok_or(DispatchError::NotFound)?;
    Ok(binding.source().get(pk).await?)
}

/// `data.page`, 1 when absent.
fn requested_page(data: Option<&Value>) -> Result<i64, DispatchError> {
    let invalid = || DispatchError::BadRequest("Invalid page.".into());
    match data.and_then(|d| d.get("page")) {
        None | Some(Value::Null) => Ok(1),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|_| i64::MAX))
            .ok_or_else(invalid),
        Some(Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .or_else(|_| s.parse::<u64>().map(|_| i64::MAX))
                .map_err(|_| invalid())
        }
        Some(_) => Err(invalid()),
    }
}

/// Group named by `data.action`, scoped to `pk` when one is given.
fn requested_group(
    binding: &Binding,
    pk: Option<&Value>,
    data: Option<&Value>,
) -> Result<GroupKey, DispatchError> {
    let action = data
        .and_then(|d| d.get("action"))
        .and_then(Value::as_str)
        .ok_or_else(|| DispatchError::BadRequest("action required".into()))?;

    Ok(match pk {
        Some(pk) => GroupKey::for_instance(binding.stream(), action, pk),
        None => GroupKey::new(binding.stream(), action),
    })
}
