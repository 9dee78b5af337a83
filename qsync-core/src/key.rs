//! Query key codec.
//!
//! A [`QueryKey`] is the canonical address of one cached result set. The
//! argument fingerprint serialises object fields in lexicographic key order at
//! every depth, so two structurally equal argument trees always address the
//! same entry no matter how the caller ordered their keys.

use crate::operation::QueryOperation;
use serde_json::Value;
use std::fmt;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};

/// Fingerprint of absent (`undefined`) arguments. Distinct from `{}` and `null`.
pub const UNDEFINED_ARGS: &str = "$undefined";

/// Prefix separating engine-managed keys from foreign cache keys.
pub const QUERY_KEY_PREFIX: &str = "qsync";

/// Per-query flags that take part in the key identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyFlags {
    pub infinite: bool,
    pub optimistic: bool,
}

impl KeyFlags {
    pub fn new(infinite: bool, optimistic: bool) -> Self {
        Self {
            infinite,
            optimistic,
        }
    }

    pub fn optimistic() -> Self {
        Self::new(false, true)
    }

    pub fn infinite() -> Self {
        Self::new(true, false)
    }
}

/// Canonical address of one cached query result.
///
/// Equality and hashing cover the model, operation, fingerprint and flags.
/// The parsed arguments are carried along for the resolver but never take
/// part in identity.
#[derive(Debug, Clone)]
pub struct QueryKey {
    model: String,
    operation: QueryOperation,
    fingerprint: String,
    flags: KeyFlags,
    args: Option<Value>,
}

impl QueryKey {
    /// Encode a query key. Total over every JSON value; never fails.
    pub fn encode(
        model: impl Into<String>,
        operation: impl Into<QueryOperation>,
        args: Option<&Value>,
        flags: KeyFlags,
    ) -> Self {
        let fingerprint = match args {
            Some(args) => fingerprint(args),
            None => UNDEFINED_ARGS.to_string(),
        };
        Self {
            model: model.into(),
            operation: operation.into(),
            fingerprint,
            flags,
            args: args.cloned(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn operation(&self) -> &QueryOperation {
        &self.operation
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn flags(&self) -> KeyFlags {
        self.flags
    }

    pub fn is_infinite(&self) -> bool {
        self.flags.infinite
    }

    pub fn is_optimistic(&self) -> bool {
        self.flags.optimistic
    }

    /// The arguments the key was encoded from.
    pub fn args(&self) -> Option<&Value> {
        self.args.as_ref()
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.model == other.model
            && self.operation == other.operation
            && self.fingerprint == other.fingerprint
            && self.flags == other.flags
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.model.hash(state);
        self.operation.hash(state);
        self.fingerprint.hash(state);
        self.flags.hash(state);
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}{}",
            QUERY_KEY_PREFIX,
            self.model,
            self.operation,
            self.fingerprint,
            match (self.flags.infinite, self.flags.optimistic) {
                (true, true) => "#infinite,optimistic",
                (true, false) => "#infinite",
                (false, true) => "#optimistic",
                (false, false) => "",
            }
        )
    }
}

/// Canonical serialisation of an argument tree.
///
/// Object fields are written in lexicographic key order at every depth,
/// arrays keep their positions, scalars use their JSON form.
pub fn fingerprint(args: &Value) -> String {
    let mut out = String::new();
    write_canonical(args, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_json_string(s, out),
        // Scalars have a single JSON form.
        scalar => {
            let _ = write!(out, "{}", scalar);
        }
    }
}

fn write_json_string(s: &str, out: &mut String) {
    // Display of a JSON string value is its escaped, quoted form.
    let _ = write!(out, "{}", Value::String(s.to_string()));
}
