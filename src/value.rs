//! Type-erased fixture and test values.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

/// A shared, type-erased value produced by a fixture or a test body.
///
/// Fixture values are looked up by name at run time, so they travel as
/// `Value` and are downcast by whoever consumes them.
///
/// # Example
///
/// ```rust
/// use loopbridge::Value;
///
/// let value = Value::new(42_u32);
/// assert_eq!(value.downcast_ref::<u32>(), Some(&42));
/// assert!(value.downcast_ref::<i64>().is_none());
/// ```
#[derive(Clone)]
pub struct Value {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Value {
    /// Wraps a value. Wrapping a `Value` returns it unchanged.
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        let boxed: Box<dyn Any + Send + Sync> = Box::new(value);
        match boxed.downcast::<Value>() {
            Ok(value) => *value,
            Err(boxed) => Self {
                inner: Arc::from(boxed),
                type_name: type_name::<T>(),
            },
        }
    }

    /// The unit value, used where a computation has no meaningful result.
    #[must_use]
    pub fn unit() -> Self {
        Self::new(())
    }

    /// Returns a reference to the inner value if it is a `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Returns true if the inner value is a `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    /// Name of the wrapped type, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", self.type_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_a_value_is_idempotent() {
        let inner = Value::new(String::from("fs"));
        let outer = Value::new(inner.clone());
        assert_eq!(outer.downcast_ref::<String>().map(String::as_str), Some("fs"));
        assert_eq!(outer.type_name(), inner.type_name());
    }

    #[test]
    fn test_unit_value() {
        let value = Value::unit();
        assert!(value.is::<()>());
        assert_eq!(format!("{value:?}"), "Value(())");
    }
}
