//! Default handshake fields.

use std::{fmt, sync::Arc};

use accord_net_codec::{Payload, Value};
use hashlink::LinkedHashMap;
use tracing::trace;

use crate::ConfigError;

/// Producer of a field value, evaluated against the handshake context on every
/// refresh.
pub type Producer<C> = Arc<dyn Fn(&C) -> Value + Send + Sync>;

/// Value registered for a template field.
pub enum FieldValue<C> {
    /// No value. Never stored; [`Handshake::set`](crate::Handshake::set) rejects it.
    Absent,
    Static(Value),
    Producer(Producer<C>),
}

impl<C> FieldValue<C> {
    pub fn producer<F>(producer: F) -> Self
    where
        F: Fn(&C) -> Value + Send + Sync + 'static,
    {
        Self::Producer(Arc::new(producer))
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    fn resolve(&self, context: &C) -> Option<Value> {
        match self {
            Self::Absent => None,
            Self::Static(value) => Some(value.clone()),
            Self::Producer(producer) => Some(producer(context)),
        }
    }
}

impl<C> Clone for FieldValue<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Absent => Self::Absent,
            Self::Static(value) => Self::Static(value.clone()),
            Self::Producer(producer) => Self::Producer(Arc::clone(producer)),
        }
    }
}

impl<C> fmt::Debug for FieldValue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => f.write_str("Absent"),
            Self::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Self::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

impl<C> From<Value> for FieldValue<C> {
    fn from(value: Value) -> Self {
        Self::Static(value)
    }
}

impl<C, T> From<Option<T>> for FieldValue<C>
where
    T: Into<FieldValue<C>>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Absent, Into::into)
    }
}

macro_rules! impl_from_static {
    ($($ty:ty),* $(,)?) => {
        $(
            impl<C> From<$ty> for FieldValue<C> {
                fn from(value: $ty) -> Self {
                    Self::Static(Value::from(value))
                }
            }
        )*
    };
}

impl_from_static!(&str, String, bool, i32, i64, u32, u64, f64);

/// Ordered set of default fields every negotiation starts from.
pub(crate) struct Template<C> {
    fields: LinkedHashMap<String, FieldValue<C>>,
}

impl<C> Template<C> {
    pub(crate) fn new() -> Self {
        Self {
            fields: LinkedHashMap::new(),
        }
    }

    /// Stores `value` under `name`. An existing field keeps its position.
    pub(crate) fn set(&mut self, name: String, value: FieldValue<C>) -> Result<(), ConfigError> {
        if value.is_absent() {
            return Err(ConfigError::AbsentValue { field: name });
        }

        trace!(field = %name, ?value, "template field set");
        match self.fields.get_mut(&name) {
            Some(slot) => *slot = value,
            None => {
                self.fields.insert(name, value);
            }
        }
        Ok(())
    }

    /// Evaluates every field, in insertion order, into a fresh payload.
    pub(crate) fn resolve(&self, context: &C) -> Payload {
        self.fields
            .iter()
            .filter_map(|(name, value)| Some((name.clone(), value.resolve(context)?)))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.fields.len()
    }
}

impl<C> Clone for Template<C> {
    fn clone(&self) -> Self {
        Self {
            fields: self.fields.clone(),
        }
    }
}
