use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, trace};

use super::{
    array::ArrayValue,
    error::{EngineError, Result},
    Name,
};

/// The symbol table: every live array by name.
///
/// Values sit behind an `Arc` so expression leaves can refer to a stored
/// array without copying it. A value whose `Arc` is unique is known not to be
/// reachable from the store, which is what lets the evaluator update
/// transient results in place.
#[derive(Default)]
pub struct ArrayStore {
    arrays: HashMap<Name, Arc<ArrayValue>>,
}

impl ArrayStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `value` under `name`, replacing whatever was there.
    pub fn insert(&mut self, name: Name, value: Arc<ArrayValue>) {
        trace!(%name, kind = %value.kind(), "storing array");
        if self.arrays.insert(name, value).is_some() {
            trace!(%name, "replaced existing array");
        }
    }

    pub fn lookup(&self, name: Name) -> Result<&Arc<ArrayValue>> {
        self.arrays.get(&name).ok_or_else(|| {
            debug!(%name, live = self.arrays.len(), "lookup of unknown array");
            EngineError::UnknownName(name)
        })
    }

    /// Removes `name`. Removing a name that is not stored does nothing.
    pub fn remove(&mut self, name: Name) -> bool {
        let removed = self.arrays.remove(&name).is_some();
        if removed {
            trace!(%name, "deleted array");
        }
        removed
    }

    pub fn contains(&self, name: Name) -> bool {
        self.arrays.contains_key(&name)
    }

    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn insert_overwrites() {
        let mut store = ArrayStore::new();
        store.insert(Name(1), Arc::new(ArrayValue::Scalar(1.0)));
        store.insert(Name(1), Arc::new(ArrayValue::Vector(array![2.0])));
        assert_eq!(store.len(), 1);
        assert_eq!(
            **store.lookup(Name(1)).unwrap(),
            ArrayValue::Vector(array![2.0])
        );
    }

    #[test]
    fn deleted_names_are_unknown() {
        let mut store = ArrayStore::new();
        store.insert(Name(7), Arc::new(ArrayValue::Scalar(3.0)));
        assert!(store.remove(Name(7)));
        assert_eq!(
            store.lookup(Name(7)).unwrap_err(),
            EngineError::UnknownName(Name(7))
        );
        // second delete is a no-op
        assert!(!store.remove(Name(7)));
        assert!(store.is_empty());
    }
}
