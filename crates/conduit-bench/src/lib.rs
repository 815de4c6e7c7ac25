//! Shared fixtures for the Conduit benchmarks.

use serde_json::{json, Value};
use std::sync::Arc;
use tenvis_conduit_core::{
    Binding, Dispatcher, FieldKind, FieldSpec, GroupRegistry, MemoryStore, SchemaCodec,
};

/// A `widget` binding over an empty in-memory store.
#[must_use]
pub fn widget_binding() -> Binding {
    let codec = SchemaCodec::new(vec![
        FieldSpec::new("name", FieldKind::String).max_length(64),
        FieldSpec::new("quantity", FieldKind::Integer).optional(),
    ]);
    Binding::builder(
        "widget",
        "inventory.widget",
        Arc::new(MemoryStore::new()),
        Arc::new(codec),
    )
    .build()
}

/// A dispatcher and the registry behind it.
#[must_use]
pub fn dispatcher() -> (Arc<Dispatcher>, Arc<GroupRegistry>) {
    let groups = Arc::new(GroupRegistry::new());
    (Arc::new(Dispatcher::new(groups.clone())), groups)
}

/// Record data whose `name` is roughly `size` bytes.
#[must_use]
pub fn widget_data(size: usize) -> Value {
    json!({ "name": "w".repeat(size.min(64)), "quantity": size })
}
