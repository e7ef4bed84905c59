//! Deferred Wiring
//!
//! The same helpers as the engine wiring, declared on the [`Registry`]
//! before any engine exists. Each one registers a node initializer, so the
//! wiring is applied to every engine the first time that engine instantiates
//! one of the nodes involved, and right away to engines that already have.

use std::rc::Rc;

use super::{NodeTuple, Pipe};
use crate::engine::Engine;
use crate::error::EngineResult;
use crate::node::{NodeId, NodeKind, NodeRef, Registry};

impl Registry {
    /// Deferred [`Engine::link`].
    pub fn link<T: 'static>(&self, source: NodeRef<T>, sink: NodeRef<T>) -> EngineResult<()> {
        self.register_initializer(&[source.id(), sink.id()], move |engine| {
            engine.link(source, sink).map(|_| ())
        })?;
        Ok(())
    }

    /// Deferred [`Engine::merge`].
    pub fn merge<T: 'static>(&self, sources: &[NodeRef<T>]) -> EngineResult<NodeRef<T>> {
        let out = self.stream::<T>();
        let sources: Rc<[NodeRef<T>]> = sources.into();
        let mut nodes: Vec<NodeId> = sources.iter().map(NodeRef::id).collect();
        nodes.push(out.id());
        self.register_initializer(&nodes, move |engine| engine.merge_into(&sources, out))?;
        Ok(out)
    }

    /// Deferred [`Engine::combine`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use cascade_core::{Engine, Registry};
    ///
    /// let registry = Registry::new();
    /// let first = registry.cell(String::from("Ada"));
    /// let last = registry.cell(String::from("Lovelace"));
    /// let full = registry
    ///     .pipe(registry.combine((first, last)).unwrap())
    ///     .map(|(first, last): &(String, String)| format!("{first} {last}"))
    ///     .into_node()
    ///     .unwrap();
    ///
    /// let engine = Engine::new(&registry);
    /// let seen = std::rc::Rc::new(std::cell::RefCell::new(String::new()));
    /// let seen_clone = seen.clone();
    /// engine
    ///     .subscribe(full, move |name: &String, _| *seen_clone.borrow_mut() = name.clone())
    ///     .unwrap();
    /// engine.publish(last, "Byron".to_string()).unwrap();
    /// assert_eq!(*seen.borrow(), "Ada Byron");
    /// ```
    pub fn combine<N: NodeTuple>(&self, nodes: N) -> EngineResult<NodeRef<N::Values>> {
        let ids = nodes.ids();
        let mut all_cells = true;
        for id in ids.iter() {
            all_cells &= self.kind(*id)? == NodeKind::Cell;
        }
        let out = if all_cells {
            self.derived_cell::<N::Values>()
        } else {
            self.stream::<N::Values>()
        };

        let mut watched: Vec<NodeId> = ids.to_vec();
        watched.push(out.id());
        self.register_initializer(&watched, move |engine| engine.combine_into(nodes, out))?;
        Ok(out)
    }

    /// Deferred [`Engine::change_with`].
    pub fn change_with<T: 'static, U: 'static>(
        &self,
        cell: NodeRef<T>,
        source: NodeRef<U>,
        reducer: impl Fn(&T, &U) -> T + 'static,
    ) -> EngineResult<()> {
        let reducer: Rc<dyn Fn(&T, &U) -> T> = Rc::new(reducer);
        self.register_initializer(&[cell.id(), source.id()], move |engine| {
            engine
                .change_with_shared(cell, source, Rc::clone(&reducer))
                .map(|_| ())
        })?;
        Ok(())
    }

    /// Deferred [`Engine::subscribe`]: every engine that instantiates `node`
    /// gets its own subscription.
    pub fn subscribe<T: 'static>(
        &self,
        node: NodeRef<T>,
        callback: impl Fn(&T, &Engine) + 'static,
    ) -> EngineResult<()> {
        let callback = Rc::new(callback);
        self.register_initializer(&[node.id()], move |engine| {
            let callback = Rc::clone(&callback);
            engine
                .subscribe(node, move |value, engine| callback(value, engine))
                .map(|_| ())
        })?;
        Ok(())
    }

    /// Deferred [`Engine::singleton_subscribe`].
    pub fn singleton_subscribe<T: 'static>(
        &self,
        node: NodeRef<T>,
        callback: impl Fn(&T, &Engine) + 'static,
    ) -> EngineResult<()> {
        let callback = Rc::new(callback);
        self.register_initializer(&[node.id()], move |engine| {
            let callback = Rc::clone(&callback);
            engine
                .singleton_subscribe(node, move |value, engine| callback(value, engine))
                .map(|_| ())
        })?;
        Ok(())
    }

    /// Deferred [`Engine::subscribe_multiple`].
    pub fn subscribe_multiple<N: NodeTuple>(
        &self,
        nodes: N,
        callback: impl Fn(&N::Partial, &Engine) + 'static,
    ) -> EngineResult<()> {
        let callback = Rc::new(callback);
        self.register_initializer(&nodes.ids(), move |engine| {
            let callback = Rc::clone(&callback);
            engine
                .subscribe_multiple(nodes, move |values, engine| callback(values, engine))
                .map(|_| ())
        })?;
        Ok(())
    }

    /// Start a pipeline of operators from `source`.
    pub fn pipe<T: 'static>(&self, source: NodeRef<T>) -> Pipe<T> {
        Pipe::new(self.clone(), source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[test]
    fn wiring_waits_for_an_engine() {
        let registry = Registry::new();
        let a = registry.stream::<u8>();
        let b = registry.stream::<u8>();
        registry.link(a, b).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        registry
            .subscribe(b, move |v: &u8, _| seen_clone.borrow_mut().push(*v))
            .unwrap();

        let first = Engine::new(&registry);
        let second = Engine::new(&registry);
        first.publish(a, 1).unwrap();
        second.publish(a, 2).unwrap();
        first.publish(a, 3).unwrap();

        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn wiring_applies_to_engines_that_already_own_the_nodes() {
        let registry = Registry::new();
        let a = registry.stream::<u8>();
        let engine = Engine::new(&registry);
        engine.register(a).unwrap();

        let calls = Rc::new(Cell::new(0));
        let calls_clone = calls.clone();
        registry
            .subscribe(a, move |_, _| calls_clone.set(calls_clone.get() + 1))
            .unwrap();

        engine.publish(a, 1).unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn deferred_merge_and_combine() {
        let registry = Registry::new();
        let a = registry.stream::<u8>();
        let b = registry.stream::<u8>();
        let merged = registry.merge(&[a, b]).unwrap();
        let count = registry.cell(0u32);
        registry.change_with(count, merged, |count, _| count + 1).unwrap();

        let x = registry.cell(1u8);
        let y = registry.cell(2u8);
        let both = registry.combine((x, y)).unwrap();

        let engine = Engine::new(&registry);
        engine.publish(a, 1).unwrap();
        engine.publish(b, 1).unwrap();
        assert_eq!(engine.get_value(count), Ok(2));

        assert_eq!(engine.get_value(both), Ok((1, 2)));
        engine.publish(y, 5).unwrap();
        assert_eq!(engine.get_value(both), Ok((1, 5)));
    }

    #[test]
    fn deferred_singletons_and_multi_subscriptions() {
        let registry = Registry::new();
        let a = registry.cell(0u8);
        let b = registry.cell(0u8);
        let seen = Rc::new(RefCell::new(Vec::new()));

        let seen_clone = seen.clone();
        registry
            .singleton_subscribe(a, move |v: &u8, _| seen_clone.borrow_mut().push(format!("a={v}")))
            .unwrap();
        let seen_clone = seen.clone();
        registry
            .subscribe_multiple((a, b), move |values: &(Option<u8>, Option<u8>), _| {
                seen_clone.borrow_mut().push(format!("{values:?}"))
            })
            .unwrap();

        let engine = Engine::new(&registry);
        engine.publish(b, 4).unwrap();
        engine.publish(a, 3).unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![
                "(Some(0), Some(4))".to_string(),
                "a=3".to_string(),
                "(Some(3), Some(4))".to_string(),
            ]
        );
    }
}
