//! Payload walker.
//!
//! Decomposes a nested mutation payload into an [`EffectDescription`]: one
//! [`EffectNode`] per entity created, updated, deleted or upserted at any
//! nesting depth. Relation operators are dispatched over the closed
//! [`NestedOp`] enum; anything the metadata cannot explain is carried as an
//! opaque fragment instead of failing.

use crate::filter;
use qsync_core::{
    EffectDescription, EffectKind, EffectNode, FieldChange, FieldInfo, ModelMeta,
    MutationOperation, PayloadError,
};
use serde_json::{Map, Value};

/// Relation operators accepted inside a relation field of a write payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestedOp {
    Create,
    CreateMany,
    ConnectOrCreate,
    Connect,
    Set,
    Disconnect,
    Update,
    UpdateMany,
    Upsert,
    Delete,
    DeleteMany,
}

impl NestedOp {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "create" => Self::Create,
            "createMany" => Self::CreateMany,
            "connectOrCreate" => Self::ConnectOrCreate,
            "connect" => Self::Connect,
            "set" => Self::Set,
            "disconnect" => Self::Disconnect,
            "update" => Self::Update,
            "updateMany" => Self::UpdateMany,
            "upsert" => Self::Upsert,
            "delete" => Self::Delete,
            "deleteMany" => Self::DeleteMany,
            _ => return None,
        })
    }
}

/// Objects of a single-or-list operator argument.
fn objects(arg: &Value) -> Vec<&Map<String, Value>> {
    match arg {
        Value::Object(map) => vec![map],
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        _ => Vec::new(),
    }
}

fn scalar(value: &Value) -> Option<&Value> {
    (!matches!(value, Value::Object(_) | Value::Array(_) | Value::Null)).then_some(value)
}

/// Walks mutation payloads against model metadata.
pub struct PayloadWalker<'a> {
    meta: &'a ModelMeta,
}

impl<'a> PayloadWalker<'a> {
    pub fn new(meta: &'a ModelMeta) -> Self {
        Self { meta }
    }

    /// Build the effect description of one mutation.
    ///
    /// Fails only on malformed payloads: a non-object payload or a missing
    /// required `data`/`where`/`create`/`update` argument.
    pub fn walk(
        &self,
        model: &str,
        operation: MutationOperation,
        payload: &Value,
    ) -> Result<EffectDescription, PayloadError> {
        let args = payload.as_object().ok_or_else(|| PayloadError::NotAnObject {
            model: model.to_string(),
            operation: operation.to_string(),
        })?;
        let required = |field: &'static str| required_object(model, operation, args, field);
        let optional = |field: &'static str| optional_object(model, operation, args, field);

        let mut effect = EffectDescription::new(model, operation);
        match operation {
            MutationOperation::Create => {
                let data = required("data")?;
                effect.roots.push(self.create_node(model, data));
            }
            MutationOperation::CreateMany => {
                let data = args.get("data").ok_or_else(|| PayloadError::MissingField {
                    model: model.to_string(),
                    operation: operation.to_string(),
                    field: "data",
                })?;
                if !matches!(data, Value::Object(_) | Value::Array(_)) {
                    return Err(PayloadError::InvalidField {
                        model: model.to_string(),
                        operation: operation.to_string(),
                        field: "data",
                        expected: "an object or an array of objects",
                    });
                }
                for item in objects(data) {
                    effect.roots.push(self.create_node(model, item));
                }
            }
            MutationOperation::Update | MutationOperation::UpdateMany => {
                let filter = if operation == MutationOperation::Update {
                    Some(required("where")?)
                } else {
                    optional("where")?
                };
                let data = required("data")?;
                let mut node =
                    EffectNode::new(model, EffectKind::Update).with_identifier(filter.cloned());
                self.apply_update_data(&mut node, data);
                effect.roots.push(node);
            }
            MutationOperation::Upsert => {
                let filter = required("where")?;
                let create = required("create")?;
                let update = required("update")?;
                effect
                    .roots
                    .push(self.upsert_node(model, Some(filter), create, update, &[]));
            }
            MutationOperation::Delete | MutationOperation::DeleteMany => {
                let filter = if operation == MutationOperation::Delete {
                    Some(required("where")?)
                } else {
                    optional("where")?
                };
                effect
                    .roots
                    .push(EffectNode::new(model, EffectKind::Delete).with_identifier(filter.cloned()));
            }
        }
        Ok(effect)
    }

    fn create_node(&self, model: &str, data: &Map<String, Value>) -> EffectNode {
        let mut node = EffectNode::new(model, EffectKind::Create);
        let ids: Map<String, Value> = self
            .meta
            .id_fields(model)
            .iter()
            .filter_map(|id| data.get(id).and_then(scalar).map(|v| (id.clone(), v.clone())))
            .collect();
        for (field, value) in data {
            self.apply_field(&mut node, field, value, &ids, true);
        }
        node
    }

    fn apply_update_data(&self, node: &mut EffectNode, data: &Map<String, Value>) {
        let ids = node
            .identifier
            .as_ref()
            .and_then(|filter| filter::unique_values(self.meta, &node.model, filter))
            .unwrap_or_default();
        for (field, value) in data {
            self.apply_field(node, field, value, &ids, false);
        }
    }

    /// Build an upsert node. `links` are foreign keys pointing at the parent
    /// entity, applied to the create branch.
    fn upsert_node(
        &self,
        model: &str,
        filter: Option<&Map<String, Value>>,
        create: &Map<String, Value>,
        update: &Map<String, Value>,
        links: &[(String, Value)],
    ) -> EffectNode {
        let mut create_node = self.create_node(model, create);
        for (fk, value) in links {
            if !create_node.changes.contains_key(fk) {
                create_node.set(fk, value.clone());
            }
        }
        let create_fields: Map<String, Value> = create_node
            .changes
            .iter()
            .filter_map(|(k, change)| change.as_set().map(|v| (k.clone(), v.clone())))
            .collect();

        let mut node = EffectNode::new(
            model,
            EffectKind::Upsert {
                create: create_fields,
            },
        )
        .with_identifier(filter.cloned());
        self.apply_update_data(&mut node, update);
        node.children.extend(create_node.children);
        node.opaque.extend(create_node.opaque);
        node
    }

    fn apply_field(
        &self,
        node: &mut EffectNode,
        name: &str,
        value: &Value,
        parent_ids: &Map<String, Value>,
        is_create: bool,
    ) {
        let Some(info) = self.meta.model(&node.model) else {
            // Unknown models are written field by field.
            node.set(name, value.clone());
            return;
        };
        let Some(field) = info.field(name) else {
            tracing::debug!(model = %node.model, field = name, "unknown field kept opaque");
            node.opaque.insert(name.to_string(), value.clone());
            return;
        };

        if !field.is_relation {
            let change = if is_create {
                FieldChange::Set(value.clone())
            } else {
                FieldChange::classify(value, field.type_name == "Json")
            };
            node.changes.insert(name.to_string(), change);
            return;
        }

        let Value::Object(ops) = value else {
            node.opaque.insert(name.to_string(), value.clone());
            return;
        };
        for (op_name, arg) in ops {
            match NestedOp::parse(op_name) {
                Some(op) => self.apply_nested(node, field, op, arg, parent_ids),
                None => {
                    tracing::debug!(
                        model = %node.model,
                        field = name,
                        operator = %op_name,
                        "unknown relation operator kept opaque"
                    );
                    let mut child = EffectNode::new(&field.type_name, EffectKind::Update)
                        .with_relation(&field.name);
                    child.opaque.insert(op_name.clone(), arg.clone());
                    node.children.push(child);
                }
            }
        }
    }

    /// Foreign keys on the related model that point back at the parent.
    fn parent_links(&self, field: &FieldInfo, parent_ids: &Map<String, Value>) -> Vec<(String, Value)> {
        self.meta
            .back_link_owner(field)
            .map(|owner| {
                owner
                    .foreign_keys()
                    .filter_map(|(parent_id, fk)| {
                        parent_ids.get(parent_id).map(|v| (fk.clone(), v.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Set the parent's foreign keys from the related entity's id values.
    fn link_parent(&self, parent: &mut EffectNode, field: &FieldInfo, related: &Map<String, Value>) {
        let related = filter::flatten_where(self.meta, &field.type_name, related);
        for (id, fk) in field.foreign_keys() {
            if let Some(value) = related.get(id).and_then(scalar) {
                parent.set(fk, value.clone());
            }
        }
    }

    fn apply_nested(
        &self,
        parent: &mut EffectNode,
        field: &FieldInfo,
        op: NestedOp,
        arg: &Value,
        parent_ids: &Map<String, Value>,
    ) {
        let related = field.type_name.as_str();
        let links = self.parent_links(field, parent_ids);
        let child = |kind: EffectKind, filter: Option<&Map<String, Value>>| {
            EffectNode::new(related, kind)
                .with_identifier(filter.cloned())
                .with_relation(&field.name)
        };

        match op {
            NestedOp::Create | NestedOp::CreateMany => {
                let items = match op {
                    NestedOp::CreateMany => arg.get("data").unwrap_or(arg),
                    _ => arg,
                };
                for data in objects(items) {
                    let mut node = self.create_node(related, data).with_relation(&field.name);
                    for (fk, value) in &links {
                        if !node.changes.contains_key(fk) {
                            node.set(fk, value.clone());
                        }
                    }
                    if field.is_relation_owner() {
                        self.link_parent(parent, field, data);
                    }
                    parent.children.push(node);
                }
            }
            NestedOp::Connect | NestedOp::Set => {
                for filter in objects(arg) {
                    if field.is_relation_owner() {
                        self.link_parent(parent, field, filter);
                    } else {
                        let mut node = child(EffectKind::Update, Some(filter));
                        for (fk, value) in &links {
                            node.set(fk, value.clone());
                        }
                        parent.children.push(node);
                    }
                }
            }
            NestedOp::ConnectOrCreate => {
                for item in objects(arg) {
                    let (Some(filter), Some(create)) = (
                        item.get("where").and_then(Value::as_object),
                        item.get("create").and_then(Value::as_object),
                    ) else {
                        parent.children.push(self.opaque_child(field, "connectOrCreate", item));
                        continue;
                    };
                    let mut node = self.upsert_node(related, Some(filter), create, &Map::new(), &links);
                    if field.is_relation_owner() {
                        self.link_parent(parent, field, filter);
                    } else {
                        for (fk, value) in &links {
                            node.set(fk, value.clone());
                        }
                    }
                    parent.children.push(node.with_relation(&field.name));
                }
            }
            NestedOp::Disconnect => {
                if field.is_relation_owner() {
                    for (_, fk) in field.foreign_keys() {
                        parent.set(fk, Value::Null);
                    }
                    return;
                }
                let filters: Vec<Option<&Map<String, Value>>> = match arg {
                    Value::Bool(true) if !field.is_array => vec![None],
                    _ => objects(arg).into_iter().map(Some).collect(),
                };
                let fks: Vec<String> = self
                    .meta
                    .back_link_owner(field)
                    .map(|owner| owner.foreign_keys().map(|(_, fk)| fk.clone()).collect())
                    .unwrap_or_default();
                for filter in filters {
                    let mut node = child(EffectKind::Update, filter);
                    for fk in &fks {
                        node.set(fk, Value::Null);
                    }
                    parent.children.push(node);
                }
            }
            NestedOp::Update | NestedOp::UpdateMany => {
                for item in objects(arg) {
                    let split = field.is_array
                        || (item.get("data").is_some_and(Value::is_object)
                            && item.keys().all(|k| k == "where" || k == "data"));
                    let (filter, data) = if split {
                        (
                            item.get("where").and_then(Value::as_object),
                            item.get("data").and_then(Value::as_object),
                        )
                    } else {
                        (None, Some(item))
                    };
                    let Some(data) = data else {
                        parent.children.push(self.opaque_child(field, "update", item));
                        continue;
                    };
                    let mut node = child(EffectKind::Update, filter);
                    self.apply_update_data(&mut node, data);
                    parent.children.push(node);
                }
            }
            NestedOp::Upsert => {
                for item in objects(arg) {
                    let (Some(create), Some(update)) = (
                        item.get("create").and_then(Value::as_object),
                        item.get("update").and_then(Value::as_object),
                    ) else {
                        parent.children.push(self.opaque_child(field, "upsert", item));
                        continue;
                    };
                    let filter = item.get("where").and_then(Value::as_object);
                    let node = self.upsert_node(related, filter, create, update, &links);
                    parent.children.push(node.with_relation(&field.name));
                }
            }
            NestedOp::Delete | NestedOp::DeleteMany => {
                let filters: Vec<Option<&Map<String, Value>>> = match arg {
                    Value::Bool(true) => vec![None],
                    _ => objects(arg).into_iter().map(Some).collect(),
                };
                for filter in filters {
                    parent.children.push(child(EffectKind::Delete, filter));
                }
                if field.is_relation_owner() && !field.is_array {
                    for (_, fk) in field.foreign_keys() {
                        parent.set(fk, Value::Null);
                    }
                }
            }
        }
    }

    fn opaque_child(&self, field: &FieldInfo, op: &str, item: &Map<String, Value>) -> EffectNode {
        tracing::debug!(field = %field.name, operator = op, "malformed nested operator kept opaque");
        let mut node = EffectNode::new(&field.type_name, EffectKind::Update).with_relation(&field.name);
        node.opaque.insert(op.to_string(), Value::Object(item.clone()));
        node
    }
}

fn required_object<'p>(
    model: &str,
    operation: MutationOperation,
    args: &'p Map<String, Value>,
    field: &'static str,
) -> Result<&'p Map<String, Value>, PayloadError> {
    match args.get(field) {
        None | Some(Value::Null) => Err(PayloadError::MissingField {
            model: model.to_string(),
            operation: operation.to_string(),
            field,
        }),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(PayloadError::InvalidField {
            model: model.to_string(),
            operation: operation.to_string(),
            field,
            expected: "an object",
        }),
    }
}

fn optional_object<'p>(
    model: &str,
    operation: MutationOperation,
    args: &'p Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'p Map<String, Value>>, PayloadError> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => required_object(model, operation, args, field).map(Some),
    }
}
