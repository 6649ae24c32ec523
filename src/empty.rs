//! Emptiness rule deciding whether cached data is worth serving.
//!
//! Numbers and booleans always carry a value, so `0` and `false` are never
//! empty. Strings, collections, `None` and `()` are empty when they hold no
//! content. Empty cached data forces a fetch regardless of the dedupe window
//! and counts as "still loading".

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

/// Trait that all data cached by a [`QueryCache`](crate::QueryCache) must implement.
///
/// The default is "never empty", which suits plain structs:
///
/// ```
/// use swr_kit::IsEmpty;
///
/// #[derive(Clone)]
/// struct User {
///     id: u64,
///     name: String,
/// }
///
/// impl IsEmpty for User {}
///
/// let user = User { id: 1, name: String::new() };
/// assert!(!user.is_empty_value());
/// ```
pub trait IsEmpty {
    /// Return `true` when the value holds nothing useful to display.
    fn is_empty_value(&self) -> bool {
        false
    }
}

/// Emptiness of an entry's data slot; an absent value is empty.
pub fn is_data_empty<D: IsEmpty + ?Sized>(value: Option<&D>) -> bool {
    value.map_or(true, |v| v.is_empty_value())
}

macro_rules! never_empty {
    ($($ty:ty),* $(,)?) => {
        $(impl IsEmpty for $ty {})*
    };
}

never_empty!(
    bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64
);

impl IsEmpty for () {
    fn is_empty_value(&self) -> bool {
        true
    }
}

impl IsEmpty for str {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl IsEmpty for String {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl<T> IsEmpty for [T] {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl<T> IsEmpty for Vec<T> {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl<T> IsEmpty for VecDeque<T> {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl<K, V, S> IsEmpty for HashMap<K, V, S> {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl<K, V> IsEmpty for BTreeMap<K, V> {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl<T, S> IsEmpty for HashSet<T, S> {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl<T> IsEmpty for BTreeSet<T> {
    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl<T: IsEmpty> IsEmpty for Option<T> {
    fn is_empty_value(&self) -> bool {
        is_data_empty(self.as_ref())
    }
}

impl<T: IsEmpty + ?Sized> IsEmpty for Box<T> {
    fn is_empty_value(&self) -> bool {
        (**self).is_empty_value()
    }
}

impl<T: IsEmpty + ?Sized> IsEmpty for Arc<T> {
    fn is_empty_value(&self) -> bool {
        (**self).is_empty_value()
    }
}

impl<T: IsEmpty + ?Sized> IsEmpty for Rc<T> {
    fn is_empty_value(&self) -> bool {
        (**self).is_empty_value()
    }
}

impl<T: IsEmpty + ?Sized> IsEmpty for &T {
    fn is_empty_value(&self) -> bool {
        (**self).is_empty_value()
    }
}

impl IsEmpty for serde_json::Value {
    fn is_empty_value(&self) -> bool {
        use serde_json::Value;

        match self {
            Value::Null => true,
            Value::Bool(_) | Value::Number(_) => false,
            Value::String(s) => s.is_empty(),
            Value::Array(items) => items.is_empty(),
            Value::Object(map) => map.is_empty(),
        }
    }
}
