//! Type converter registry.
//!
//! Converters are registered explicitly at configuration time and looked up
//! by a stable tag, so no reflection is involved.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// A value converter shared with generated data access code.
pub trait TypeConverter: Send + Sync + 'static {
    /// Stable tag identifying this converter type.
    const TAG: &'static str;
}

/// Converters keyed by [`TypeConverter::TAG`].
#[derive(Clone, Default)]
pub struct TypeConverters {
    converters: HashMap<&'static str, Arc<dyn Any + Send + Sync>>,
}

impl TypeConverters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a converter, replacing any converter with the same tag.
    pub fn insert<T: TypeConverter>(&mut self, converter: T) {
        self.converters.insert(T::TAG, Arc::new(converter));
    }

    /// Fetch the converter registered for `T`.
    pub fn get<T: TypeConverter>(&self) -> Option<Arc<T>> {
        self.converters
            .get(T::TAG)
            .cloned()
            .and_then(|converter| converter.downcast::<T>().ok())
    }

    pub fn contains_tag(&self, tag: &str) -> bool {
        self.converters.contains_key(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.converters.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.converters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }
}

impl std::fmt::Debug for TypeConverters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.converters.keys()).finish()
    }
}
