//! Affected-entry resolver.
//!
//! A cached query reads its own model, the delegate bases of that model,
//! and every model reachable through its `include`/`select` projection
//! (including `_count` selections). A key is affected when any model it
//! reads is mutated. Matching is by model identity only and deliberately
//! over-approximates: no per-row filter is evaluated here.

use qsync_cache::InfiniteData;
use qsync_core::{EffectDescription, ModelMeta, QueryKey};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

pub struct AffectedEntryResolver<'a> {
    meta: &'a ModelMeta,
}

impl<'a> AffectedEntryResolver<'a> {
    pub fn new(meta: &'a ModelMeta) -> Self {
        Self { meta }
    }

    /// Models a cached query reads. When the cached value is supplied, the
    /// relation fields actually present in it count as well, which covers
    /// servers that return relations the arguments did not request.
    pub fn read_models(&self, key: &QueryKey, entry: Option<&Value>) -> BTreeSet<String> {
        let mut models = BTreeSet::new();
        self.add_model(&mut models, key.model());

        let mut worklist: Vec<(String, &Map<String, Value>)> = Vec::new();
        if let Some(args) = key.args().and_then(Value::as_object) {
            worklist.push((key.model().to_string(), args));
        }
        while let Some((model, args)) = worklist.pop() {
            for projection in ["include", "select"] {
                let Some(fields) = args.get(projection).and_then(Value::as_object) else {
                    continue;
                };
                for (name, value) in fields {
                    if name == "_count" {
                        self.add_counted(&mut models, &model, value);
                        continue;
                    }
                    if value == &Value::Bool(false) || value.is_null() {
                        continue;
                    }
                    let Some(related) = self.meta.field(&model, name).and_then(|f| f.relation_to())
                    else {
                        continue;
                    };
                    self.add_model(&mut models, related);
                    if let Value::Object(nested) = value {
                        worklist.push((related.to_string(), nested));
                    }
                }
            }
        }

        if let Some(entry) = entry {
            if key.is_infinite() {
                if let Ok(data) = InfiniteData::from_entry(key, entry) {
                    for page in &data.pages {
                        self.add_from_data(&mut models, key.model(), page);
                    }
                }
            } else {
                self.add_from_data(&mut models, key.model(), entry);
            }
        }
        models
    }

    /// Whether a cached query reads any of the mutated models.
    pub fn is_affected(
        &self,
        mutated: &BTreeSet<String>,
        key: &QueryKey,
        entry: Option<&Value>,
    ) -> bool {
        self.read_models(key, entry)
            .iter()
            .any(|model| mutated.contains(model))
    }

    /// Cached keys affected by a mutation, judged by their arguments alone.
    pub fn resolve(&self, effect: &EffectDescription, keys: &[QueryKey]) -> Vec<QueryKey> {
        let mutated = effect.mutated_models(self.meta);
        keys.iter()
            .filter(|key| self.is_affected(&mutated, key, None))
            .cloned()
            .collect()
    }

    fn add_model(&self, models: &mut BTreeSet<String>, model: &str) {
        models.insert(model.to_string());
        models.extend(self.meta.base_models(model));
    }

    fn add_counted(&self, models: &mut BTreeSet<String>, model: &str, value: &Value) {
        let Some(info) = self.meta.model(model) else {
            return;
        };
        match value.get("select").and_then(Value::as_object) {
            Some(selected) => {
                for (name, on) in selected {
                    if on == &Value::Bool(false) {
                        continue;
                    }
                    if let Some(related) = info.field(name).and_then(|f| f.relation_to()) {
                        self.add_model(models, related);
                    }
                }
            }
            None if value == &Value::Bool(true) => {
                for field in info.relations().filter(|f| f.is_array) {
                    self.add_model(models, &field.type_name);
                }
            }
            None => {}
        }
    }

    fn add_from_data(&self, models: &mut BTreeSet<String>, model: &str, data: &Value) {
        let mut stack = vec![(model.to_string(), data)];
        while let Some((model, value)) = stack.pop() {
            match value {
                Value::Array(items) => {
                    stack.extend(items.iter().map(|item| (model.clone(), item)));
                }
                Value::Object(map) => {
                    let Some(info) = self.meta.model(&model) else {
                        continue;
                    };
                    for field in info.relations() {
                        match map.get(&field.name) {
                            None | Some(Value::Null) => {}
                            Some(nested) => {
                                self.add_model(models, &field.type_name);
                                stack.push((field.type_name.clone(), nested));
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
}
