//! Cache Types Module
//!
//! Shared data model for the cache tiers: cache parameters, formatted keys,
//! tier item shapes, and the context handed to `get_or_create` factories.

use crate::serializer::Serializer;
use crate::{CacheError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

/// Default TTL applied when none (or a zero duration) is supplied.
pub const DEFAULT_DURATION: Duration = Duration::from_secs(30 * 60);

/// Default estimated entry size in bytes for memory-tier accounting.
pub const DEFAULT_SIZE: u32 = 128;

/// Type-erased value shared between the memory tier and collapsed waiters.
pub type SharedValue = Arc<dyn Any + Send + Sync>;

/// Marker bounds for values the cache can carry end to end.
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// TTL and size estimate attached to a cache write.
///
/// `size` only feeds the memory tier's accounting; the other tiers ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheParameters {
    pub duration: Duration,
    pub size: u32,
}

impl CacheParameters {
    pub fn new(duration: Duration, size: u32) -> Self {
        Self { duration, size }.normalized()
    }

    /// Coerce degenerate values back to the defaults.
    pub fn normalized(mut self) -> Self {
        if self.duration.is_zero() {
            self.duration = DEFAULT_DURATION;
        }
        self
    }
}

impl Default for CacheParameters {
    fn default() -> Self {
        Self {
            duration: DEFAULT_DURATION,
            size: DEFAULT_SIZE,
        }
    }
}

/// Build the canonical cross-tier key:
/// `"<prefix>:<type-name>:<serializer-tag>:<user-key>"`.
///
/// The type segment scopes the same user key by logical value type; the
/// serializer tag invalidates entries whenever the encoder changes.
pub fn format_key<T: 'static, S: Serializer>(prefix: &str, serializer: &S, key: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        prefix,
        std::any::type_name::<T>(),
        serializer.description(),
        key
    )
}

/// Reject types that cannot round-trip through serialization because they
/// are (or wrap) a trait object.
pub fn reject_interface_type<T: 'static>() -> Result<()> {
    let name = std::any::type_name::<T>();
    if name.contains("dyn ") {
        return Err(CacheError::InterfaceType(format!(
            "cannot cache abstract type {}",
            name
        )));
    }
    Ok(())
}

/// True when `T` is the raw byte-array type, which bypasses the serializer
/// on writes and skips deserialization on reads.
pub fn is_byte_array<T: 'static>() -> bool {
    TypeId::of::<T>() == TypeId::of::<Vec<u8>>()
}

/// View a value as its raw bytes when `T` is the byte-array type.
pub fn value_as_bytes<T: Any>(value: &T) -> Option<&[u8]> {
    (value as &dyn Any)
        .downcast_ref::<Vec<u8>>()
        .map(|v| v.as_slice())
}

/// Serialize a value, passing raw bytes through untouched.
pub fn encode_value<S: Serializer, T: Serialize + Any>(serializer: &S, value: &T) -> Result<Vec<u8>> {
    if let Some(bytes) = value_as_bytes(value) {
        return Ok(bytes.to_vec());
    }
    serializer.serialize(value)
}

/// Deserialize payload bytes, passing raw bytes through untouched.
pub fn decode_value<S: Serializer, T: DeserializeOwned + Any>(
    serializer: &S,
    bytes: &[u8],
) -> Result<T> {
    if is_byte_array::<T>() {
        let boxed: Box<dyn Any> = Box::new(bytes.to_vec());
        return match boxed.downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(_) => Err(CacheError::InternalError(
                "byte-array downcast mismatch".to_string(),
            )),
        };
    }
    serializer.deserialize(bytes)
}

/// Materialised value read back from the file tier.
#[derive(Debug, Clone)]
pub struct FileCacheItem<T> {
    pub expires: SystemTime,
    pub value: T,
    pub size: u32,
}

/// Value plus remaining TTL read back from the distributed tier.
///
/// `bytes` and `expiry` are both set or both empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DistributedItem {
    pub bytes: Option<Vec<u8>>,
    pub expiry: Option<Duration>,
}

impl DistributedItem {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_value(bytes: Vec<u8>, expiry: Duration) -> Self {
        Self {
            bytes: Some(bytes),
            expiry: Some(expiry),
        }
    }

    pub fn has_value(&self) -> bool {
        self.bytes.is_some() && self.expiry.is_some()
    }
}

/// Context handed to a `get_or_create` factory.
///
/// The factory may adjust the parameters that govern how its result is
/// cached; the coordinator reads them back after the factory settles.
#[derive(Clone)]
pub struct GetOrCreateContext {
    key: Arc<str>,
    state: Option<SharedValue>,
    cancel: CancellationToken,
    params: Arc<Mutex<CacheParameters>>,
}

impl GetOrCreateContext {
    pub fn new(key: &str, state: Option<SharedValue>, cancel: CancellationToken) -> Self {
        Self {
            key: Arc::from(key),
            state,
            cancel,
            params: Arc::new(Mutex::new(CacheParameters::default())),
        }
    }

    /// The formatted key being loaded.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Opaque caller state passed through `get_or_create`.
    pub fn state(&self) -> Option<&SharedValue> {
        self.state.as_ref()
    }

    /// Cancellation signal for the in-flight load.
    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn parameters(&self) -> CacheParameters {
        *self.params.lock().unwrap()
    }

    pub fn duration(&self) -> Duration {
        self.params.lock().unwrap().duration
    }

    pub fn size(&self) -> u32 {
        self.params.lock().unwrap().size
    }

    pub fn set_duration(&self, duration: Duration) {
        self.params.lock().unwrap().duration = duration;
    }

    pub fn set_size(&self, size: u32) {
        self.params.lock().unwrap().size = size;
    }
}
