//! Model metadata.
//!
//! Static description of every model's fields, id fields and relations,
//! produced once by the schema compiler and shared read-only by every engine
//! component. Relations are stored by model name (an adjacency-by-name graph),
//! so self relations and mutual foreign keys never form ownership cycles.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Relation details of a relation field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationInfo {
    /// Name of the opposite relation field on the related model.
    #[serde(default)]
    pub back_link: Option<String>,
    /// Whether this side of the relation stores the foreign key.
    #[serde(default)]
    pub is_owner: bool,
    /// Related model id field -> local foreign key field. Only populated on
    /// the owning side.
    #[serde(default)]
    pub foreign_key_mapping: BTreeMap<String, String>,
}

/// Metadata of a single model field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInfo {
    pub name: String,
    /// Scalar type name (`String`, `Int`, `DateTime`, `Json`, ...) or the
    /// related model name for relation fields.
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub is_relation: bool,
    #[serde(default)]
    pub is_array: bool,
    #[serde(default)]
    pub is_optional: bool,
    #[serde(default)]
    pub is_id: bool,
    /// Literal default value, when the schema declares one.
    #[serde(default)]
    pub default: Option<Value>,
    /// The field has a generated default (`now()`, `uuid()`, ...).
    #[serde(default)]
    pub has_default: bool,
    #[serde(default)]
    pub is_updated_at: bool,
    #[serde(default)]
    pub relation: Option<RelationInfo>,
}

impl FieldInfo {
    /// Create a scalar field.
    pub fn scalar(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            is_relation: false,
            is_array: false,
            is_optional: false,
            is_id: false,
            default: None,
            has_default: false,
            is_updated_at: false,
            relation: None,
        }
    }

    /// Related model name, for relation fields.
    pub fn relation_to(&self) -> Option<&str> {
        self.is_relation.then_some(self.type_name.as_str())
    }

    /// Foreign key mapping of an owning relation field, empty otherwise.
    pub fn foreign_keys(&self) -> impl Iterator<Item = (&String, &String)> {
        self.relation
            .iter()
            .filter(|r| r.is_owner)
            .flat_map(|r| r.foreign_key_mapping.iter())
    }

    /// Whether this relation field stores the foreign key itself.
    pub fn is_relation_owner(&self) -> bool {
        self.relation.as_ref().is_some_and(|r| r.is_owner)
    }

    /// Whether the field holds numeric ids that can be generated as `max + 1`.
    pub fn is_integer(&self) -> bool {
        matches!(self.type_name.as_str(), "Int" | "BigInt")
    }
}

/// Metadata of a single model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub id_fields: Vec<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldInfo>,
    /// Delegate base models this model extends.
    #[serde(default)]
    pub base_models: Vec<String>,
}

impl ModelInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_fields: Vec::new(),
            fields: BTreeMap::new(),
            base_models: Vec::new(),
        }
    }

    /// Add an id field.
    pub fn id(mut self, name: &str, type_name: &str) -> Self {
        let mut field = FieldInfo::scalar(name, type_name);
        field.is_id = true;
        self.id_fields.push(name.to_string());
        self.fields.insert(name.to_string(), field);
        self
    }

    /// Add a plain scalar field.
    pub fn scalar(mut self, name: &str, type_name: &str) -> Self {
        self.fields
            .insert(name.to_string(), FieldInfo::scalar(name, type_name));
        self
    }

    /// Add an optional scalar field.
    pub fn optional(mut self, name: &str, type_name: &str) -> Self {
        let mut field = FieldInfo::scalar(name, type_name);
        field.is_optional = true;
        self.fields.insert(name.to_string(), field);
        self
    }

    /// Add a scalar field with a literal default.
    pub fn with_default(mut self, name: &str, type_name: &str, default: Value) -> Self {
        let mut field = FieldInfo::scalar(name, type_name);
        field.default = Some(default);
        field.has_default = true;
        self.fields.insert(name.to_string(), field);
        self
    }

    /// Add a `DateTime` field with a generated default (`now()`).
    pub fn timestamp(mut self, name: &str) -> Self {
        let mut field = FieldInfo::scalar(name, "DateTime");
        field.has_default = true;
        self.fields.insert(name.to_string(), field);
        self
    }

    /// Add an `@updatedAt` field.
    pub fn updated_at(mut self, name: &str) -> Self {
        let mut field = FieldInfo::scalar(name, "DateTime");
        field.is_updated_at = true;
        self.fields.insert(name.to_string(), field);
        self
    }

    /// Add the non-owning side of a to-many relation.
    pub fn to_many(self, name: &str, target: &str, back_link: &str) -> Self {
        self.relation(name, target, true, back_link, &[])
    }

    /// Add the non-owning side of a to-one relation.
    pub fn to_one(self, name: &str, target: &str, back_link: &str) -> Self {
        self.relation(name, target, false, back_link, &[])
    }

    /// Add the owning side of a to-one relation. `keys` maps the related
    /// model's id fields to the local foreign key fields.
    pub fn owns_one(self, name: &str, target: &str, back_link: &str, keys: &[(&str, &str)]) -> Self {
        self.relation(name, target, false, back_link, keys)
    }

    fn relation(
        mut self,
        name: &str,
        target: &str,
        is_array: bool,
        back_link: &str,
        keys: &[(&str, &str)],
    ) -> Self {
        let mut field = FieldInfo::scalar(name, target);
        field.is_relation = true;
        field.is_array = is_array;
        field.is_optional = !is_array;
        field.relation = Some(RelationInfo {
            back_link: Some(back_link.to_string()),
            is_owner: !keys.is_empty(),
            foreign_key_mapping: keys
                .iter()
                .map(|(id, fk)| (id.to_string(), fk.to_string()))
                .collect(),
        });
        self.fields.insert(name.to_string(), field);
        self
    }

    /// Declare a delegate base model.
    pub fn extends(mut self, base: &str) -> Self {
        self.base_models.push(base.to_string());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.get(name)
    }

    /// Relation fields of this model.
    pub fn relations(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.values().filter(|f| f.is_relation)
    }
}

/// Model metadata for the whole schema.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelMeta {
    #[serde(default)]
    pub models: BTreeMap<String, ModelInfo>,
}

impl ModelMeta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load metadata emitted by the schema compiler as JSON.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn with_model(mut self, model: ModelInfo) -> Self {
        self.models.insert(model.name.clone(), model);
        self
    }

    pub fn model(&self, name: &str) -> Option<&ModelInfo> {
        self.models.get(name)
    }

    pub fn field(&self, model: &str, field: &str) -> Option<&FieldInfo> {
        self.model(model).and_then(|m| m.field(field))
    }

    /// Id fields of a model, empty for unknown models.
    pub fn id_fields(&self, model: &str) -> &[String] {
        self.model(model)
            .map(|m| m.id_fields.as_slice())
            .unwrap_or(&[])
    }

    /// The owning-side field at the other end of a relation, if the related
    /// model owns the foreign key.
    pub fn back_link_owner(&self, field: &FieldInfo) -> Option<&FieldInfo> {
        let back_link = field.relation.as_ref()?.back_link.as_deref()?;
        let related = self.field(field.relation_to()?, back_link)?;
        related.is_relation_owner().then_some(related)
    }

    /// Every delegate base of `model`, transitively. Cyclic declarations are
    /// tolerated by the visited set.
    pub fn base_models(&self, model: &str) -> BTreeSet<String> {
        let mut visited = BTreeSet::new();
        let mut stack = vec![model.to_string()];
        while let Some(current) = stack.pop() {
            let Some(info) = self.model(&current) else {
                continue;
            };
            for base in &info.base_models {
                if base != model && visited.insert(base.clone()) {
                    stack.push(base.clone());
                }
            }
        }
        visited
    }
}
