//! Effect descriptions.
//!
//! The payload walker decomposes a nested mutation payload into a tree of
//! [`EffectNode`]s, one per entity creation, update, delete or upsert implied
//! by the payload at any nesting depth.

use crate::meta::ModelMeta;
use crate::operation::MutationOperation;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Reserved field attached to every entity synthesised or mutated by an
/// optimistic patch. Cleared only when server data replaces the entity.
pub const OPTIMISTIC_MARKER: &str = "$optimistic";

/// Kind of change a node applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EffectKind {
    Create,
    Update,
    Delete,
    /// Carries the create branch; the node's `changes` are the update branch.
    Upsert { create: Map<String, Value> },
}

impl EffectKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Upsert { .. } => "Upsert",
        }
    }
}

/// A change to a single scalar field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldChange {
    Set(Value),
    Increment(Value),
    Decrement(Value),
    Multiply(Value),
    Divide(Value),
    Push(Value),
}

impl FieldChange {
    /// Classify a field value from an update payload. Atomic operator objects
    /// (`{ increment: 1 }`) are recognised on every non-`Json` field.
    pub fn classify(value: &Value, is_json_field: bool) -> Self {
        if !is_json_field {
            if let Value::Object(map) = value {
                if map.len() == 1 {
                    if let Some((op, operand)) = map.iter().next() {
                        let operand = operand.clone();
                        match op.as_str() {
                            "set" => return Self::Set(operand),
                            "increment" => return Self::Increment(operand),
                            "decrement" => return Self::Decrement(operand),
                            "multiply" => return Self::Multiply(operand),
                            "divide" => return Self::Divide(operand),
                            "push" => return Self::Push(operand),
                            _ => {}
                        }
                    }
                }
            }
        }
        Self::Set(value.clone())
    }

    /// Compute the new field value from the current one. Returns `None` when
    /// the change cannot be evaluated client-side (e.g. arithmetic on a
    /// missing or non-numeric value).
    pub fn apply(&self, current: Option<&Value>) -> Option<Value> {
        match self {
            Self::Set(value) => Some(value.clone()),
            Self::Increment(by) => arithmetic(current?, by, |a, b| a + b),
            Self::Decrement(by) => arithmetic(current?, by, |a, b| a - b),
            Self::Multiply(by) => arithmetic(current?, by, |a, b| a * b),
            Self::Divide(by) => {
                if by.as_f64() == Some(0.0) {
                    return None;
                }
                arithmetic(current?, by, |a, b| a / b)
            }
            Self::Push(items) => {
                let mut list = match current {
                    Some(Value::Array(list)) => list.clone(),
                    Some(Value::Null) | None => Vec::new(),
                    Some(_) => return None,
                };
                match items {
                    Value::Array(items) => list.extend(items.iter().cloned()),
                    item => list.push(item.clone()),
                }
                Some(Value::Array(list))
            }
        }
    }

    /// The literal value, for `Set` changes.
    pub fn as_set(&self) -> Option<&Value> {
        match self {
            Self::Set(value) => Some(value),
            _ => None,
        }
    }
}

fn arithmetic(current: &Value, operand: &Value, op: fn(f64, f64) -> f64) -> Option<Value> {
    if let (Some(a), Some(b)) = (current.as_i64(), operand.as_i64()) {
        let result = op(a as f64, b as f64);
        if result.fract() == 0.0 && result.abs() < i64::MAX as f64 {
            return Some(Value::from(result as i64));
        }
    }
    let result = op(current.as_f64()?, operand.as_f64()?);
    serde_json::Number::from_f64(result).map(Value::Number)
}

/// One entity-level effect of a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectNode {
    pub model: String,
    pub kind: EffectKind,
    /// Fields locating the target entity: a unique `where` or a filter.
    /// `None` when the target can only be located through the parent node.
    pub identifier: Option<Map<String, Value>>,
    pub changes: BTreeMap<String, FieldChange>,
    /// Relation field on the parent entity this node was reached through.
    pub relation: Option<String>,
    /// Payload fragments that could not be interpreted against the model
    /// metadata. They still count for invalidation but never patch data.
    pub opaque: Map<String, Value>,
    pub children: Vec<EffectNode>,
}

impl EffectNode {
    pub fn new(model: impl Into<String>, kind: EffectKind) -> Self {
        Self {
            model: model.into(),
            kind,
            identifier: None,
            changes: BTreeMap::new(),
            relation: None,
            opaque: Map::new(),
            children: Vec::new(),
        }
    }

    pub fn with_identifier(mut self, identifier: Option<Map<String, Value>>) -> Self {
        self.identifier = identifier.filter(|m| !m.is_empty());
        self
    }

    pub fn with_relation(mut self, relation: &str) -> Self {
        self.relation = Some(relation.to_string());
        self
    }

    /// Record a plain assignment, e.g. a foreign key resolved from `connect`.
    pub fn set(&mut self, field: &str, value: Value) {
        self.changes.insert(field.to_string(), FieldChange::Set(value));
    }

    /// This node followed by all descendants, depth first.
    pub fn iter(&self) -> impl Iterator<Item = &EffectNode> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.children.iter().rev());
            Some(node)
        })
    }
}

/// The full effect of one mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectDescription {
    pub model: String,
    pub operation: MutationOperation,
    pub roots: Vec<EffectNode>,
}

impl EffectDescription {
    pub fn new(model: impl Into<String>, operation: MutationOperation) -> Self {
        Self {
            model: model.into(),
            operation,
            roots: Vec::new(),
        }
    }

    /// Every node of the description, depth first, root order preserved.
    pub fn nodes(&self) -> impl Iterator<Item = &EffectNode> {
        self.roots.iter().flat_map(EffectNode::iter)
    }

    /// Models this mutation writes, including models written through nested
    /// relation operators and the delegate bases of all of them.
    pub fn mutated_models(&self, meta: &ModelMeta) -> BTreeSet<String> {
        let mut models = BTreeSet::new();
        models.insert(self.model.clone());
        for node in self.nodes() {
            models.insert(node.model.clone());
        }
        let bases: Vec<String> = models
            .iter()
            .flat_map(|model| meta.base_models(model))
            .collect();
        models.extend(bases);
        models
    }
}
