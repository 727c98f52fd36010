//! Concrete types carried inside polymorphic call arguments and results.
//!
//! A polymorphic field travels as a [`TaggedValue`]: the registered type name
//! plus the JSON body. Both processes must register the same names before the
//! first call that uses them. Registration is local and never transmitted.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{Result, SprError};

type DecodeFn = fn(serde_json::Value) -> serde_json::Result<Box<dyn Any + Send>>;

fn decode_as<T: DeserializeOwned + Send + 'static>(
    value: serde_json::Value,
) -> serde_json::Result<Box<dyn Any + Send>> {
    Ok(Box::new(serde_json::from_value::<T>(value)?))
}

#[derive(Clone)]
struct TypeEntry {
    name: String,
    type_id: TypeId,
    rust_name: &'static str,
    decode: DecodeFn,
}

impl std::fmt::Debug for TypeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeEntry")
            .field("name", &self.name)
            .field("rust_name", &self.rust_name)
            .finish()
    }
}

/// Polymorphic value on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedValue {
    #[serde(rename = "type")]
    pub type_name: String,
    pub value: serde_json::Value,
}

/// Set of concrete types a service (or callback proxy) may carry.
#[derive(Debug, Clone, Default)]
pub struct TypeAdvertisement {
    entries: Vec<TypeEntry>,
}

impl TypeAdvertisement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `T` under the wire name `name`.
    pub fn with<T>(mut self, name: impl Into<String>) -> Self
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.entries.push(TypeEntry {
            name: name.into(),
            type_id: TypeId::of::<T>(),
            rust_name: std::any::type_name::<T>(),
            decode: decode_as::<T>,
        });
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Default)]
struct Tables {
    by_name: HashMap<String, TypeEntry>,
    by_id: HashMap<TypeId, String>,
}

/// Process-local table of types that may appear in [`TaggedValue`]s.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    tables: RwLock<Tables>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry used by callers, runners and listeners unless one is
    /// supplied explicitly.
    pub fn shared() -> Arc<TypeRegistry> {
        static SHARED: OnceLock<Arc<TypeRegistry>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(TypeRegistry::new())))
    }

    /// Register every type in `advertisement`.
    ///
    /// Re-registering a name for the same Rust type is a no-op. Nothing is
    /// registered if any name conflicts.
    pub fn register(&self, advertisement: &TypeAdvertisement) -> Result<()> {
        let mut tables = self.write();

        let mut incoming: HashMap<&str, TypeId> = HashMap::new();
        for entry in &advertisement.entries {
            let known = tables
                .by_name
                .get(&entry.name)
                .map(|existing| existing.type_id)
                .or_else(|| incoming.get(entry.name.as_str()).copied());
            if known.is_some_and(|type_id| type_id != entry.type_id) {
                return Err(SprError::TypeConflict {
                    name: entry.name.clone(),
                });
            }
            incoming.insert(entry.name.as_str(), entry.type_id);
        }

        for entry in &advertisement.entries {
            tracing::trace!(name = %entry.name, rust_type = entry.rust_name, "Registering type");
            tables
                .by_id
                .entry(entry.type_id)
                .or_insert_with(|| entry.name.clone());
            tables.by_name.insert(entry.name.clone(), entry.clone());
        }
        Ok(())
    }

    pub fn register_all<'a>(
        &self,
        advertisements: impl IntoIterator<Item = &'a TypeAdvertisement>,
    ) -> Result<()> {
        for advertisement in advertisements {
            self.register(advertisement)?;
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().by_name.contains_key(name)
    }

    /// Wrap a registered value for a polymorphic field.
    pub fn pack<T: Serialize + 'static>(&self, value: &T) -> Result<TaggedValue> {
        let type_name = self
            .read()
            .by_id
            .get(&TypeId::of::<T>())
            .cloned()
            .ok_or_else(|| SprError::UnregisteredType(std::any::type_name::<T>().to_string()))?;
        let value = serde_json::to_value(value)
            .map_err(|e| SprError::Internal(format!("encode {type_name}: {e}")))?;
        Ok(TaggedValue { type_name, value })
    }

    /// Decode a polymorphic field into its registered concrete type.
    pub fn unpack(&self, tagged: TaggedValue) -> Result<Box<dyn Any + Send>> {
        let decode = self
            .read()
            .by_name
            .get(&tagged.type_name)
            .map(|e| e.decode)
            .ok_or_else(|| SprError::UnregisteredType(tagged.type_name.clone()))?;
        decode(tagged.value)
            .map_err(|e| SprError::invalid_param(format!("decode {}: {e}", tagged.type_name)))
    }

    /// [`unpack`](Self::unpack) and downcast in one step.
    pub fn unpack_as<T: 'static>(&self, tagged: TaggedValue) -> Result<T> {
        let type_name = tagged.type_name.clone();
        self.unpack(tagged)?
            .downcast::<T>()
            .map(|boxed| *boxed)
            .map_err(|_| {
                SprError::invalid_param(format!(
                    "{type_name} is not a {}",
                    std::any::type_name::<T>()
                ))
            })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|p| p.into_inner())
    }
}
