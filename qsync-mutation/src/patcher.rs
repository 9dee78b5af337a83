//! Optimistic patcher.
//!
//! Applies an [`EffectDescription`] to a deep copy of one cached entry and
//! returns the provisional value, or `None` when the entry is unaffected.
//! Every created or changed entity is tagged with [`OPTIMISTIC_MARKER`].
//!
//! # Placement
//!
//! Root nodes, creates and nodes addressed by a unique id are applied
//! wherever their model appears in the entry: the top-level value, array
//! elements and nested relation fields. Other nodes are applied relative to
//! the entity their parent node matched, through the relation they were
//! reached by.
//!
//! Created entities are inserted at the head of a collection. A top-level
//! collection rejects entities contradicting the query's `where`; a nested
//! collection only admits entities whose foreign key points at the owning
//! parent.

use crate::filter;
use chrono::{SecondsFormat, Utc};
use qsync_core::{
    EffectDescription, EffectKind, EffectNode, FieldInfo, ModelMeta, QueryKey, OPTIMISTIC_MARKER,
};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Where a collection sits inside the cached entry.
enum Location<'w> {
    TopLevel {
        filter: Option<&'w Map<String, Value>>,
        allow_create: bool,
    },
    /// Relation collection of a parent entity; `links` pairs each child
    /// foreign key with the parent's id value.
    Nested { links: Vec<(String, Value)> },
    /// Collection addressed through the parent node.
    Relative,
}

pub struct OptimisticPatcher<'a> {
    meta: &'a ModelMeta,
}

impl<'a> OptimisticPatcher<'a> {
    pub fn new(meta: &'a ModelMeta) -> Self {
        Self { meta }
    }

    /// Provisional value of `entry` after `effect`. Only `find*` queries are
    /// patched; infinite entries receive creates on their first page only.
    pub fn patch(&self, key: &QueryKey, entry: &Value, effect: &EffectDescription) -> Option<Value> {
        if !key.operation().is_find() {
            return None;
        }
        let filter = key
            .args()
            .and_then(|args| args.get("where"))
            .and_then(Value::as_object);

        let mut copy = entry.clone();
        let mut changed = false;
        if key.is_infinite() {
            let pages = copy.get_mut("pages").and_then(Value::as_array_mut)?;
            for (i, page) in pages.iter_mut().enumerate() {
                let location = Location::TopLevel {
                    filter,
                    allow_create: i == 0,
                };
                changed |= self.apply_effect(page, key.model(), &location, effect);
            }
        } else {
            let location = Location::TopLevel {
                filter,
                allow_create: true,
            };
            changed = self.apply_effect(&mut copy, key.model(), &location, effect);
        }
        changed.then_some(copy)
    }

    fn apply_effect(
        &self,
        value: &mut Value,
        model: &str,
        location: &Location<'_>,
        effect: &EffectDescription,
    ) -> bool {
        let mut changed = false;
        for root in &effect.roots {
            changed |= self.apply_at(value, model, location, root, true);
            for node in root.iter().skip(1).filter(|n| self.is_global(n)) {
                changed |= self.apply_at(value, model, location, node, true);
            }
        }
        changed
    }

    fn is_global(&self, node: &EffectNode) -> bool {
        matches!(node.kind, EffectKind::Create)
            || node
                .identifier
                .as_ref()
                .is_some_and(|f| filter::unique_values(self.meta, &node.model, f).is_some())
    }

    fn same_model(&self, model: &str, node: &EffectNode) -> bool {
        model == node.model || self.meta.base_models(&node.model).contains(model)
    }

    fn apply_at(
        &self,
        value: &mut Value,
        model: &str,
        location: &Location<'_>,
        node: &EffectNode,
        descend: bool,
    ) -> bool {
        match value {
            Value::Array(items) => self.apply_collection(items, model, location, node, descend),
            Value::Object(_) => self.apply_entity(value, model, node, descend),
            _ => false,
        }
    }

    fn apply_collection(
        &self,
        items: &mut Vec<Value>,
        model: &str,
        location: &Location<'_>,
        node: &EffectNode,
        descend: bool,
    ) -> bool {
        let mut changed = false;
        let mut inserted = 0;
        if self.same_model(model, node) {
            let identifier = node.identifier.as_ref();
            let hit = |item: &Value| {
                item.as_object()
                    .is_some_and(|m| filter::matches(self.meta, model, m, identifier))
            };
            match &node.kind {
                EffectKind::Create => {
                    if let Some(entity) = self.admit(model, location, items, created_fields(node)) {
                        items.insert(0, entity);
                        inserted = 1;
                    }
                }
                EffectKind::Upsert { create } => {
                    if !items.iter().any(hit) {
                        if let Some(entity) = self.admit(model, location, items, create.clone()) {
                            items.insert(0, entity);
                            inserted = 1;
                        }
                    }
                }
                EffectKind::Delete => {
                    let before = items.len();
                    items.retain(|item| !hit(item));
                    changed |= items.len() != before;
                }
                EffectKind::Update => {}
            }
        }
        changed |= inserted > 0;
        for item in items.iter_mut().skip(inserted) {
            changed |= self.apply_entity(item, model, node, descend);
        }
        changed
    }

    fn apply_entity(&self, value: &mut Value, model: &str, node: &EffectNode, descend: bool) -> bool {
        let Some(entity) = value.as_object() else {
            return false;
        };
        let hit = self.same_model(model, node)
            && filter::matches(self.meta, model, entity, node.identifier.as_ref());
        if hit && node.kind == EffectKind::Delete {
            *value = Value::Null;
            return true;
        }
        let Some(entity) = value.as_object_mut() else {
            return false;
        };

        let mut changed = false;
        if hit && matches!(node.kind, EffectKind::Update | EffectKind::Upsert { .. }) {
            if self.apply_changes(model, entity, node) {
                entity.insert(OPTIMISTIC_MARKER.to_string(), Value::Bool(true));
                changed = true;
            }
            changed |= self.apply_relative_children(model, entity, node);
        }
        if descend {
            changed |= self.descend(entity, model, node);
        }
        changed
    }

    fn apply_changes(&self, model: &str, entity: &mut Map<String, Value>, node: &EffectNode) -> bool {
        let mut changed = false;
        for (field, change) in &node.changes {
            match change.apply(entity.get(field)) {
                Some(next) if entity.get(field) != Some(&next) => {
                    entity.insert(field.clone(), next);
                    changed = true;
                }
                Some(_) => {}
                None => {
                    tracing::debug!(model, field = %field, "field change not evaluable client-side");
                }
            }
        }
        if changed {
            for field in self.scalar_fields(model).filter(|f| f.is_updated_at) {
                entity.insert(field.name.clone(), Value::String(now()));
            }
        }
        changed
    }

    fn apply_relative_children(
        &self,
        model: &str,
        entity: &mut Map<String, Value>,
        node: &EffectNode,
    ) -> bool {
        let mut changed = false;
        for child in node.children.iter().filter(|c| !self.is_global(c)) {
            let Some(relation) = child.relation.as_deref() else {
                continue;
            };
            let Some(related) = self.meta.field(model, relation).and_then(FieldInfo::relation_to)
            else {
                continue;
            };
            match entity.get_mut(relation) {
                Some(Value::Array(items)) => {
                    changed |= self.apply_collection(items, related, &Location::Relative, child, false);
                }
                Some(current) if current.is_object() => {
                    changed |= self.apply_entity(current, related, child, false);
                }
                Some(current) if current.is_null() => {
                    if let EffectKind::Upsert { create } = &child.kind {
                        *current = self.synthesize(related, create.clone(), &[]);
                        changed = true;
                    }
                }
                _ => {}
            }
        }
        changed
    }

    fn descend(&self, entity: &mut Map<String, Value>, model: &str, node: &EffectNode) -> bool {
        let Some(info) = self.meta.model(model) else {
            return false;
        };
        let mut changed = false;
        for field in info.relations() {
            if !entity
                .get(&field.name)
                .is_some_and(|v| v.is_object() || v.is_array())
            {
                continue;
            }
            let location = Location::Nested {
                links: self.links_to(entity, field),
            };
            if let Some(nested) = entity.get_mut(&field.name) {
                changed |= self.apply_at(nested, &field.type_name, &location, node, true);
            }
        }
        changed
    }

    /// Child foreign keys that must equal the parent's id values for a
    /// created child to belong to the parent's `field` collection.
    fn links_to(&self, parent: &Map<String, Value>, field: &FieldInfo) -> Vec<(String, Value)> {
        let Some(owner) = self.meta.back_link_owner(field) else {
            return Vec::new();
        };
        let mut links = Vec::new();
        for (parent_id, fk) in owner.foreign_keys() {
            match parent.get(parent_id) {
                Some(value) if !value.is_null() => links.push((fk.clone(), value.clone())),
                _ => return Vec::new(),
            }
        }
        links
    }

    fn admit(
        &self,
        model: &str,
        location: &Location<'_>,
        siblings: &[Value],
        fields: Map<String, Value>,
    ) -> Option<Value> {
        let entity = self.synthesize(model, fields, siblings);
        let map = entity.as_object()?;
        let admitted = match location {
            Location::TopLevel {
                filter: query_where,
                allow_create,
            } => {
                *allow_create
                    && !query_where.is_some_and(|f| filter::contradicts(self.meta, model, map, f))
            }
            Location::Nested { links } => {
                !links.is_empty() && links.iter().all(|(fk, v)| map.get(fk) == Some(v))
            }
            Location::Relative => true,
        };
        admitted.then_some(entity)
    }

    fn scalar_fields(&self, model: &str) -> impl Iterator<Item = &'a FieldInfo> + '_ {
        let meta = self.meta;
        std::iter::once(model.to_string())
            .chain(meta.base_models(model))
            .filter_map(move |m| meta.model(&m))
            .flat_map(|info| info.fields.values())
            .filter(|f| !f.is_relation)
    }

    /// Build a new entity from the provided field values and the model's
    /// defaults.
    fn synthesize(&self, model: &str, fields: Map<String, Value>, siblings: &[Value]) -> Value {
        let mut entity = Map::new();
        for field in self.scalar_fields(model) {
            if entity.contains_key(&field.name) {
                continue;
            }
            let value = if let Some(value) = fields.get(&field.name) {
                value.clone()
            } else if let Some(default) = &field.default {
                default.clone()
            } else if field.type_name == "DateTime" && (field.has_default || field.is_updated_at) {
                Value::String(now())
            } else if field.is_id {
                placeholder_id(field, siblings)
            } else {
                continue;
            };
            entity.insert(field.name.clone(), value);
        }
        for (name, value) in fields {
            entity.entry(name).or_insert(value);
        }
        entity.insert(OPTIMISTIC_MARKER.to_string(), Value::Bool(true));
        Value::Object(entity)
    }
}

fn created_fields(node: &EffectNode) -> Map<String, Value> {
    node.changes
        .iter()
        .filter_map(|(k, change)| change.as_set().map(|v| (k.clone(), v.clone())))
        .collect()
}

/// `max + 1` for integer ids, a UUID string otherwise or when the
/// increment would overflow.
fn placeholder_id(field: &FieldInfo, siblings: &[Value]) -> Value {
    if field.is_integer() {
        let max = siblings
            .iter()
            .filter_map(|s| s.get(&field.name).and_then(Value::as_i64))
            .max()
            .unwrap_or(0);
        if let Some(next) = max.checked_add(1) {
            return Value::from(next);
        }
        tracing::debug!(field = %field.name, "integer id space exhausted, using uuid placeholder");
    }
    Value::String(Uuid::now_v7().to_string())
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
