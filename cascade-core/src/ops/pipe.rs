//! Pipe Operators
//!
//! A [`Pipe`] chains operators from a source node. Every operator declares
//! its output node in the registry and registers deferred wiring that
//! connects the output to its input, so a pipeline can be declared before
//! any engine exists.
//!
//! Operator outputs are streams, except [`Scan`], whose accumulator is a
//! cell. Errors from any step are carried to [`Pipe::into_node`].

use std::marker::PhantomData;
use std::rc::Rc;

use crate::engine::Engine;
use crate::error::EngineResult;
use crate::graph::Connection;
use crate::node::{Distinct, NodeId, NodeRef, Registry, Value};

/// One step of a pipeline.
pub trait Operator<In: 'static> {
    type Out: 'static;

    /// Declare the output node and wire it to `input`.
    fn apply(self, registry: &Registry, input: NodeRef<In>) -> EngineResult<NodeRef<Self::Out>>;
}

/// Register the wiring between an operator's input and output.
fn wire(
    registry: &Registry,
    input: NodeId,
    output: NodeId,
    init: impl Fn(&Engine) -> EngineResult<()> + 'static,
) -> EngineResult<()> {
    registry.register_initializer(&[input, output], init)?;
    Ok(())
}

/// Transform every value.
pub struct Map<F, U> {
    f: Rc<F>,
    _out: PhantomData<fn() -> U>,
}

impl<F, U> Map<F, U> {
    pub fn new(f: F) -> Self {
        Self {
            f: Rc::new(f),
            _out: PhantomData,
        }
    }
}

impl<T, U, F> Operator<T> for Map<F, U>
where
    T: 'static,
    U: 'static,
    F: Fn(&T) -> U + 'static,
{
    type Out = U;

    fn apply(self, registry: &Registry, input: NodeRef<T>) -> EngineResult<NodeRef<U>> {
        let out = registry.stream::<U>();
        let f = self.f;
        wire(registry, input.id(), out.id(), move |engine| {
            let f = Rc::clone(&f);
            engine
                .connect(Connection::new([input.id()], out.id(), move |inputs| {
                    Ok(Some(Value::new(f(inputs.require::<T>(0)?))))
                }))
                .map(|_| ())
        })?;
        Ok(out)
    }
}

/// Replace every value with a constant.
pub struct MapTo<U> {
    value: Value,
    _out: PhantomData<fn() -> U>,
}

impl<U: 'static> MapTo<U> {
    pub fn new(value: U) -> Self {
        Self {
            value: Value::new(value),
            _out: PhantomData,
        }
    }
}

impl<T: 'static, U: 'static> Operator<T> for MapTo<U> {
    type Out = U;

    fn apply(self, registry: &Registry, input: NodeRef<T>) -> EngineResult<NodeRef<U>> {
        let out = registry.stream::<U>();
        let value = self.value;
        wire(registry, input.id(), out.id(), move |engine| {
            let value = value.clone();
            engine
                .connect(Connection::new([input.id()], out.id(), move |_| {
                    Ok(Some(value.clone()))
                }))
                .map(|_| ())
        })?;
        Ok(out)
    }
}

/// Pass on only the values matching a predicate.
pub struct Filter<F> {
    predicate: Rc<F>,
}

impl<F> Filter<F> {
    pub fn new(predicate: F) -> Self {
        Self {
            predicate: Rc::new(predicate),
        }
    }
}

impl<T, F> Operator<T> for Filter<F>
where
    T: 'static,
    F: Fn(&T) -> bool + 'static,
{
    type Out = T;

    fn apply(self, registry: &Registry, input: NodeRef<T>) -> EngineResult<NodeRef<T>> {
        let out = registry.stream::<T>();
        let predicate = self.predicate;
        wire(registry, input.id(), out.id(), move |engine| {
            let predicate = Rc::clone(&predicate);
            engine
                .connect(Connection::new([input.id()], out.id(), move |inputs| {
                    if predicate(inputs.require::<T>(0)?) {
                        Ok(inputs.value(0)?.cloned())
                    } else {
                        Ok(None)
                    }
                }))
                .map(|_| ())
        })?;
        Ok(out)
    }
}

/// Fold values into an accumulator cell, emitting every new accumulator.
pub struct Scan<A, F> {
    seed: A,
    f: Rc<F>,
}

impl<A, F> Scan<A, F> {
    pub fn new(seed: A, f: F) -> Self {
        Self { seed, f: Rc::new(f) }
    }
}

impl<T, A, F> Operator<T> for Scan<A, F>
where
    T: 'static,
    A: 'static,
    F: Fn(&A, &T) -> A + 'static,
{
    type Out = A;

    fn apply(self, registry: &Registry, input: NodeRef<T>) -> EngineResult<NodeRef<A>> {
        let out = registry.cell_with(self.seed, Distinct::Never);
        let f = self.f;
        wire(registry, input.id(), out.id(), move |engine| {
            let f = Rc::clone(&f);
            engine
                .change_with_shared(out, input, Rc::new(move |acc: &A, item: &T| f(acc, item)))
                .map(|_| ())
        })?;
        Ok(out)
    }
}

/// Pair every value with the latest value of another node, without being
/// driven by it.
pub struct WithLatestFrom<U> {
    other: NodeRef<U>,
}

impl<U> WithLatestFrom<U> {
    pub fn new(other: NodeRef<U>) -> Self {
        Self { other }
    }
}

impl<T, U> Operator<T> for WithLatestFrom<U>
where
    T: Clone + 'static,
    U: Clone + 'static,
{
    type Out = (T, U);

    fn apply(self, registry: &Registry, input: NodeRef<T>) -> EngineResult<NodeRef<(T, U)>> {
        let out = registry.stream::<(T, U)>();
        let other = self.other;
        registry.register_initializer(&[input.id(), other.id(), out.id()], move |engine| {
            engine
                .connect(
                    Connection::new([input.id()], out.id(), move |inputs| {
                        let value = inputs.require::<T>(0)?;
                        Ok(inputs
                            .of(other)?
                            .map(|latest| Value::new((value.clone(), latest.clone()))))
                    })
                    .pulling([other.id()]),
                )
                .map(|_| ())
        })?;
        Ok(out)
    }
}

/// Pass on the first value only.
pub struct Once;

impl<T: 'static> Operator<T> for Once {
    type Out = T;

    fn apply(self, registry: &Registry, input: NodeRef<T>) -> EngineResult<NodeRef<T>> {
        let out = registry.stream::<T>();
        let done = registry.cell_with(false, Distinct::Never);
        wire(registry, input.id(), out.id(), move |engine| {
            engine.connect(
                Connection::new([input.id()], out.id(), move |inputs| {
                    if *inputs.require::<bool>(1)? {
                        Ok(None)
                    } else {
                        Ok(inputs.value(0)?.cloned())
                    }
                })
                .pulling([done.id()]),
            )?;
            engine
                .connect(Connection::new([out.id()], done.id(), |_| {
                    Ok(Some(Value::new(true)))
                }))
                .map(|_| ())
        })?;
        Ok(out)
    }
}

/// A pipeline under construction.
///
/// # Example
///
/// ```rust
/// use cascade_core::{Engine, Registry};
///
/// let registry = Registry::new();
/// let clicks = registry.stream::<u32>();
/// let total = registry
///     .pipe(clicks)
///     .filter(|n: &u32| n % 2 == 0)
///     .scan(0, |total: &u32, n: &u32| total + n)
///     .into_node()
///     .unwrap();
///
/// let engine = Engine::new(&registry);
/// for n in 1..=4 {
///     engine.publish(clicks, n).unwrap();
/// }
/// assert_eq!(engine.get_value(total).unwrap(), 6);
/// ```
pub struct Pipe<T> {
    registry: Registry,
    node: EngineResult<NodeRef<T>>,
}

impl<T: 'static> Pipe<T> {
    pub(crate) fn new(registry: Registry, source: NodeRef<T>) -> Self {
        Self {
            registry,
            node: Ok(source),
        }
    }

    /// Apply any operator.
    pub fn then<O: Operator<T>>(self, operator: O) -> Pipe<O::Out> {
        let node = match self.node {
            Ok(node) => operator.apply(&self.registry, node),
            Err(err) => Err(err),
        };
        Pipe {
            registry: self.registry,
            node,
        }
    }

    pub fn map<U: 'static>(self, f: impl Fn(&T) -> U + 'static) -> Pipe<U> {
        self.then(Map::new(f))
    }

    pub fn map_to<U: 'static>(self, value: U) -> Pipe<U> {
        self.then(MapTo::new(value))
    }

    pub fn filter(self, predicate: impl Fn(&T) -> bool + 'static) -> Pipe<T> {
        self.then(Filter::new(predicate))
    }

    pub fn scan<A: 'static>(self, seed: A, f: impl Fn(&A, &T) -> A + 'static) -> Pipe<A> {
        self.then(Scan::new(seed, f))
    }

    pub fn once(self) -> Pipe<T> {
        self.then(Once)
    }

    /// The node at the end of the pipeline.
    pub fn into_node(self) -> EngineResult<NodeRef<T>> {
        self.node
    }
}

impl<T: Clone + 'static> Pipe<T> {
    pub fn with_latest_from<U: Clone + 'static>(self, other: NodeRef<U>) -> Pipe<(T, U)> {
        self.then(WithLatestFrom::new(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::cell::RefCell;

    fn record<T: Clone + 'static>(
        engine: &Engine,
        node: NodeRef<T>,
    ) -> Rc<RefCell<Vec<T>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_clone = seen.clone();
        engine
            .subscribe(node, move |value: &T, _| seen_clone.borrow_mut().push(value.clone()))
            .unwrap();
        seen
    }

    #[test]
    fn map_and_map_to() {
        let registry = Registry::new();
        let source = registry.stream::<i32>();
        let labels = registry.pipe(source).map(|n: &i32| format!("#{n}")).into_node().unwrap();
        let pings = registry.pipe(source).map_to("ping").into_node().unwrap();

        let engine = Engine::new(&registry);
        let seen_labels = record(&engine, labels);
        let seen_pings = record(&engine, pings);
        engine.publish(source, 1).unwrap();
        engine.publish(source, 2).unwrap();

        assert_eq!(*seen_labels.borrow(), vec!["#1".to_string(), "#2".to_string()]);
        assert_eq!(*seen_pings.borrow(), vec!["ping", "ping"]);
    }

    #[test]
    fn filters_cancel_their_downstream() {
        let registry = Registry::new();
        let source = registry.stream::<i32>();
        let calls = Rc::new(RefCell::new(0));
        let calls_clone = calls.clone();
        let out = registry
            .pipe(source)
            .filter(|n: &i32| *n > 0)
            .map(move |n: &i32| {
                *calls_clone.borrow_mut() += 1;
                n * 10
            })
            .into_node()
            .unwrap();

        let engine = Engine::new(&registry);
        let seen = record(&engine, out);
        engine.publish(source, -1).unwrap();
        engine.publish(source, 3).unwrap();

        assert_eq!(*seen.borrow(), vec![30]);
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn with_latest_from_pulls_without_triggering() {
        let registry = Registry::new();
        let clicks = registry.stream::<u8>();
        let mode = registry.cell("idle");
        let tagged = registry.pipe(clicks).with_latest_from(mode).into_node().unwrap();

        let engine = Engine::new(&registry);
        let seen = record(&engine, tagged);
        engine.publish(clicks, 1).unwrap();
        engine.publish(mode, "busy").unwrap();
        engine.publish(clicks, 2).unwrap();

        assert_eq!(*seen.borrow(), vec![(1, "idle"), (2, "busy")]);
    }

    #[test]
    fn once_passes_only_the_first_value() {
        let registry = Registry::new();
        let source = registry.stream::<u8>();
        let first = registry.pipe(source).once().into_node().unwrap();

        let engine = Engine::new(&registry);
        let seen = record(&engine, first);
        for n in 1..=3 {
            engine.publish(source, n).unwrap();
        }
        assert_eq!(*seen.borrow(), vec![1]);

        // Every engine starts fresh.
        let other = Engine::new(&registry);
        let seen = record(&other, first);
        other.publish(source, 7).unwrap();
        assert_eq!(*seen.borrow(), vec![7]);
    }

    #[test]
    fn errors_surface_at_the_end_of_the_pipe() {
        let registry = Registry::new();
        let foreign = Registry::new().stream::<u8>();
        let result = registry.pipe(foreign).map(|n: &u8| *n).into_node();
        assert_eq!(result.err(), Some(EngineError::ForeignNode { node: foreign.id() }));
    }
}
