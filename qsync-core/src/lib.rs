//! qsync Core - Metadata, Keys and Effects
//!
//! Shared vocabulary of the cache synchronisation engine: model metadata,
//! the query key codec, effect descriptions produced from mutation payloads,
//! the transport abstraction and the error taxonomy. All other crates depend
//! on this one.

pub mod effect;
pub mod error;
pub mod key;
pub mod meta;
pub mod operation;
pub mod transport;

pub use effect::{EffectDescription, EffectKind, EffectNode, FieldChange, OPTIMISTIC_MARKER};
pub use error::{
    CacheError, ConfigError, PayloadError, StateError, SyncError, SyncResult, TransportError,
};
pub use key::{fingerprint, KeyFlags, QueryKey, QUERY_KEY_PREFIX, UNDEFINED_ARGS};
pub use meta::{FieldInfo, ModelInfo, ModelMeta, RelationInfo};
pub use operation::{HttpMethod, MutationOperation, QueryOperation};
pub use transport::{Endpoint, Envelope, Transport, TransportRequest};
