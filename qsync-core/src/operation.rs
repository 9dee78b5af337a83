//! Query and mutation operation names.

use crate::error::PayloadError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Read operations a cached query can be addressed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryOperation {
    FindUnique,
    FindUniqueOrThrow,
    FindFirst,
    FindFirstOrThrow,
    FindMany,
    Count,
    Aggregate,
    GroupBy,
    /// Operations added by newer servers; addressed by name.
    #[serde(untagged)]
    Other(String),
}

impl QueryOperation {
    pub fn as_str(&self) -> &str {
        match self {
            Self::FindUnique => "findUnique",
            Self::FindUniqueOrThrow => "findUniqueOrThrow",
            Self::FindFirst => "findFirst",
            Self::FindFirstOrThrow => "findFirstOrThrow",
            Self::FindMany => "findMany",
            Self::Count => "count",
            Self::Aggregate => "aggregate",
            Self::GroupBy => "groupBy",
            Self::Other(name) => name,
        }
    }

    /// Entity-returning reads. Only these are patched optimistically;
    /// aggregates are only ever invalidated.
    pub fn is_find(&self) -> bool {
        self.as_str().starts_with("find")
    }
}

impl From<&str> for QueryOperation {
    fn from(name: &str) -> Self {
        match name {
            "findUnique" => Self::FindUnique,
            "findUniqueOrThrow" => Self::FindUniqueOrThrow,
            "findFirst" => Self::FindFirst,
            "findFirstOrThrow" => Self::FindFirstOrThrow,
            "findMany" => Self::FindMany,
            "count" => Self::Count,
            "aggregate" => Self::Aggregate,
            "groupBy" => Self::GroupBy,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for QueryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write operations a mutation can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationOperation {
    Create,
    CreateMany,
    Update,
    UpdateMany,
    Upsert,
    Delete,
    DeleteMany,
}

impl MutationOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::CreateMany => "createMany",
            Self::Update => "update",
            Self::UpdateMany => "updateMany",
            Self::Upsert => "upsert",
            Self::Delete => "delete",
            Self::DeleteMany => "deleteMany",
        }
    }

    /// Method the generated hooks send this operation with.
    pub fn http_method(&self) -> HttpMethod {
        match self {
            Self::Create | Self::CreateMany | Self::Upsert => HttpMethod::Post,
            Self::Update | Self::UpdateMany => HttpMethod::Put,
            Self::Delete | Self::DeleteMany => HttpMethod::Delete,
        }
    }
}

impl FromStr for MutationOperation {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "createMany" => Ok(Self::CreateMany),
            "update" => Ok(Self::Update),
            "updateMany" => Ok(Self::UpdateMany),
            "upsert" => Ok(Self::Upsert),
            "delete" => Ok(Self::Delete),
            "deleteMany" => Ok(Self::DeleteMany),
            other => Err(PayloadError::UnsupportedOperation(other.to_string())),
        }
    }
}

impl fmt::Display for MutationOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP method a request is sent with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Methods that carry their payload in the `q` query parameter instead
    /// of a JSON body.
    pub fn payload_in_query(&self) -> bool {
        matches!(self, Self::Get | Self::Delete)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
