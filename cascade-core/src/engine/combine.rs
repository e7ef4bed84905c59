//! Combined Cells
//!
//! `combine_cells` derives a cell holding the latest value of each of a
//! sequence of cells. The derived cell is memoised on the engine per exact
//! source sequence, so asking twice for the same sources returns the same
//! token.

use std::rc::Rc;

use super::Engine;
use crate::error::{EngineError, EngineResult};
use crate::graph::{Connection, Inputs};
use crate::node::{NodeId, NodeKind, NodeRef, Value};

/// The latest values of a sequence of cells, in source order.
#[derive(Debug, Clone)]
pub struct Combined(Rc<[Value]>);

impl Combined {
    fn from_values(values: &[Option<Value>]) -> Option<Self> {
        values
            .iter()
            .cloned()
            .collect::<Option<Vec<Value>>>()
            .map(|values| Self(values.into()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The value at `index` as `T`.
    pub fn get<T: 'static>(&self, index: usize) -> Option<&T> {
        self.0.get(index).and_then(Value::downcast_ref::<T>)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

/// Element-wise identity: two snapshots are equal when every slot holds the
/// same allocation.
impl PartialEq for Combined {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self.0.iter().zip(other.0.iter()).all(|(a, b)| a.ptr_eq(b))
    }
}

impl Engine {
    /// Derive (or reuse) a cell tracking the latest values of `cells`.
    ///
    /// Every source must be a cell; the derived cell is seeded immediately
    /// and recomputed whenever any source resolves.
    ///
    /// # Example
    ///
    /// ```rust
    /// use cascade_core::{Engine, Registry};
    ///
    /// let registry = Registry::new();
    /// let width = registry.cell(3u32);
    /// let height = registry.cell(4u32);
    /// let engine = Engine::new(&registry);
    ///
    /// let size = engine.combine_cells(&[width.id(), height.id()]).unwrap();
    /// engine.publish(height, 5).unwrap();
    ///
    /// let snapshot = engine.get_value(size).unwrap();
    /// assert_eq!(snapshot.get::<u32>(0), Some(&3));
    /// assert_eq!(snapshot.get::<u32>(1), Some(&5));
    /// ```
    pub fn combine_cells(&self, cells: &[NodeId]) -> EngineResult<NodeRef<Combined>> {
        self.ensure_live()?;
        let key = cells.to_vec();
        let cached = self.state().combined.get(&key).copied();
        if let Some(sink) = cached {
            return Ok(NodeRef::from_id(sink));
        }

        for cell in cells {
            if self.registry().kind(*cell)? != NodeKind::Cell {
                return Err(EngineError::NotACell { node: *cell });
            }
        }

        let sink = self.registry().derived_cell::<Combined>();
        self.connect(Connection::new(cells.iter().copied(), sink.id(), snapshot))?;

        let current: Vec<Option<Value>> = cells.iter().map(|cell| self.current_value(*cell)).collect();
        if let Some(seed) = Combined::from_values(&current) {
            self.overwrite(sink.id(), Value::new(seed))?;
        }
        self.state_mut().combined.insert(key, sink.id());
        Ok(sink)
    }
}

fn snapshot(inputs: &Inputs<'_>) -> EngineResult<Option<Value>> {
    Ok(Combined::from_values(inputs.values()).map(Value::new))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Registry;
    use std::cell::RefCell;

    #[test]
    fn combined_cells_are_memoised() {
        let registry = Registry::new();
        let a = registry.cell(1);
        let b = registry.cell(2);
        let engine = Engine::new(&registry);

        let first = engine.combine_cells(&[a.id(), b.id()]).unwrap();
        let second = engine.combine_cells(&[a.id(), b.id()]).unwrap();
        let swapped = engine.combine_cells(&[b.id(), a.id()]).unwrap();

        assert_eq!(first, second);
        assert_ne!(first, swapped);
    }

    #[test]
    fn combined_cells_track_every_source() {
        let registry = Registry::new();
        let a = registry.cell(1);
        let b = registry.cell(String::from("x"));
        let engine = Engine::new(&registry);
        let combined = engine.combine_cells(&[a.id(), b.id()]).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        engine
            .subscribe(combined, move |value: &Combined, _| {
                let a = *value.get::<i32>(0).unwrap();
                let b = value.get::<String>(1).unwrap().clone();
                seen_clone.borrow_mut().push((a, b));
            })
            .unwrap();

        engine.publish(a, 5).unwrap();
        engine.publish(b, "y".to_string()).unwrap();
        assert_eq!(
            *seen.borrow(),
            vec![(5, "x".to_string()), (5, "y".to_string())]
        );
    }

    #[test]
    fn only_cells_can_be_combined() {
        let registry = Registry::new();
        let a = registry.cell(1);
        let s = registry.stream::<i32>();
        let engine = Engine::new(&registry);

        assert_eq!(
            engine.combine_cells(&[a.id(), s.id()]).err(),
            Some(EngineError::NotACell { node: s.id() })
        );
    }

    #[test]
    fn snapshots_compare_by_identity() {
        let one = Value::new(1);
        let a = Combined::from_values(&[Some(one.clone())]).unwrap();
        let b = Combined::from_values(&[Some(one)]).unwrap();
        let c = Combined::from_values(&[Some(Value::new(1))]).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(Combined::from_values(&[None]).is_none());
    }
}
