use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::CacheError;

/// The key a record is cached under.
///
/// Keys are opaque strings and cheap to clone. Uniqueness across unrelated operations is up to
/// the caller, usually by picking distinct operation names or prefixes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Derives a key with the [default strategy](KeyStrategy::Canonical).
    pub fn derive<A>(operation_name: &str, prefix: &str, args: &A) -> Result<Self, CacheError>
    where
        A: Serialize + ?Sized,
    {
        KeyStrategy::Canonical.derive(operation_name, None, prefix, args)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the relative path for this key.
    ///
    /// See [`hashed_path`].
    pub fn storage_path(&self) -> String {
        hashed_path(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.into())
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key.into())
    }
}

/// Returns a stable relative path for the given key.
///
/// The path is the sha-256 hash of the key, hex-formatted like so: `aa/bbccdd/eeff...`
pub fn hashed_path(key: &str) -> String {
    let hash = Sha256::digest(key.as_bytes());
    format!(
        "{}/{}/{}",
        hex::encode(&hash[..1]),
        hex::encode(&hash[1..4]),
        hex::encode(&hash[4..])
    )
}

/// What a custom [`KeyStrategy`] gets to see of a call.
#[derive(Debug, Clone, Copy)]
pub struct KeyInput<'a> {
    pub operation_name: &'a str,
    pub method_name: Option<&'a str>,
    /// The call arguments, serialized to JSON.
    pub args: &'a Value,
}

type KeyFn = dyn Fn(&KeyInput<'_>) -> String + Send + Sync;

/// How a [`CacheKey`] is computed from a call.
///
/// Keys have the shape `<operation>:<prefix>:<args>`, where `<operation>` is the operation name,
/// followed by `:<method>` if a method name is given. The canonical strategy fills in `<args>`.
///
/// A custom strategy also fills in `<args>` for plain operations. For methods it owns the whole
/// key, so the function's return value is exactly what the record is stored under.
#[derive(Clone, Default)]
pub enum KeyStrategy {
    /// A canonical JSON serialization of the arguments.
    ///
    /// Object keys are sorted, so neither field order nor map iteration order affect the key.
    #[default]
    Canonical,
    /// A caller provided function.
    ///
    /// Useful when the canonical form gets too long, or when some arguments should not be part of
    /// the key at all.
    Custom(Arc<KeyFn>),
}

impl KeyStrategy {
    /// Creates a [`KeyStrategy::Custom`] from a closure.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&KeyInput<'_>) -> String + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Derives the key for a call of `operation_name` with `args`.
    ///
    /// # Errors
    ///
    /// Fails with [`CacheError::KeyDerivation`] if the arguments cannot be serialized.
    pub fn derive<A>(
        &self,
        operation_name: &str,
        method_name: Option<&str>,
        prefix: &str,
        args: &A,
    ) -> Result<CacheKey, CacheError>
    where
        A: Serialize + ?Sized,
    {
        let args = serde_json::to_value(args).map_err(CacheError::key_derivation)?;

        let custom = match self {
            Self::Canonical => None,
            Self::Custom(f) => Some(f(&KeyInput {
                operation_name,
                method_name,
                args: &args,
            })),
        };
        if let (Some(custom), Some(_)) = (&custom, method_name) {
            return Ok(CacheKey::from(custom.as_str()));
        }

        let mut key = String::from(operation_name);
        if let Some(method_name) = method_name {
            key.push(':');
            key.push_str(method_name);
        }
        key.push(':');
        key.push_str(prefix);
        key.push(':');

        match custom {
            Some(custom) => key.push_str(&custom),
            None => write_canonical(&mut key, &args).map_err(CacheError::key_derivation)?,
        }

        Ok(CacheKey::from(key))
    }
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canonical => f.write_str("Canonical"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Writes `value` as compact JSON with object keys in sorted order.
fn write_canonical(out: &mut String, value: &Value) -> Result<(), serde_json::Error> {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(out, item)?;
            }
            out.push('}');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}
