//! Subscriptions
//!
//! Subscribers are callbacks invoked synchronously, inside the propagation
//! cycle, each time their node resolves. A node has any number of ordinary
//! subscribers (run in subscription order) and at most one singleton
//! subscriber (run after them, replaced on every set).
//!
//! Subscriptions live on the engine that owns the node; subscribing through a
//! child to an ancestor-owned node registers on the ancestor.

use std::any;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Engine, WeakEngine};
use crate::error::{EngineError, EngineResult};
use crate::node::{NodeId, NodeRef, Value};

/// Type-erased subscriber callback.
pub(crate) type Callback = Rc<dyn Fn(&Value, &Engine) -> EngineResult<()>>;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Ordinary,
    Singleton,
}

/// Handle to a registered subscriber.
///
/// Dropping the handle keeps the subscriber; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
pub struct Subscription {
    engine: WeakEngine,
    node: NodeId,
    id: SubscriptionId,
    slot: Slot,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The node this subscription listens to.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Remove exactly this subscriber.
    ///
    /// A singleton subscription that has since been replaced is left alone.
    pub fn unsubscribe(self) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let removed = {
            let mut state = engine.state_mut();
            match self.slot {
                Slot::Ordinary => state
                    .subscribers
                    .get_mut(&self.node)
                    .and_then(|callbacks| callbacks.shift_remove(&self.id)),
                Slot::Singleton => {
                    if state.singletons.get(&self.node).map(|(id, _)| *id) == Some(self.id) {
                        state.singletons.remove(&self.node).map(|(_, callback)| callback)
                    } else {
                        None
                    }
                }
            }
        };
        drop(removed);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("slot", &self.slot)
            .finish()
    }
}

/// Wrap a typed callback. The scheduler only hands it values of `T`.
pub(crate) fn typed<T: 'static>(
    node: NodeId,
    callback: impl Fn(&T, &Engine) + 'static,
) -> Callback {
    Rc::new(move |value, engine| {
        let value = value
            .downcast_ref::<T>()
            .ok_or(EngineError::TypeMismatch {
                node,
                expected: any::type_name::<T>(),
            })?;
        callback(value, engine);
        Ok(())
    })
}

impl Engine {
    /// Call `callback` every time `node` resolves.
    ///
    /// # Example
    ///
    /// ```rust
    /// use std::cell::RefCell;
    /// use std::rc::Rc;
    ///
    /// use cascade_core::{Engine, Registry};
    ///
    /// let registry = Registry::new();
    /// let name = registry.cell(String::from("foo"));
    /// let engine = Engine::new(&registry);
    ///
    /// let seen = Rc::new(RefCell::new(Vec::new()));
    /// let seen_clone = seen.clone();
    /// let subscription = engine
    ///     .subscribe(name, move |value: &String, _| seen_clone.borrow_mut().push(value.clone()))
    ///     .unwrap();
    ///
    /// engine.publish(name, "foo".to_string()).unwrap();
    /// engine.publish(name, "bar".to_string()).unwrap();
    /// subscription.unsubscribe();
    /// engine.publish(name, "baz".to_string()).unwrap();
    ///
    /// assert_eq!(*seen.borrow(), vec!["bar".to_string()]);
    /// ```
    pub fn subscribe<T: 'static>(
        &self,
        node: NodeRef<T>,
        callback: impl Fn(&T, &Engine) + 'static,
    ) -> EngineResult<Subscription> {
        self.subscribe_raw(node.id(), typed(node.id(), callback))
    }

    pub(crate) fn subscribe_raw(&self, node: NodeId, callback: Callback) -> EngineResult<Subscription> {
        let owner = self.owner_for(node)?;
        let id = SubscriptionId::next();
        owner
            .state_mut()
            .subscribers
            .entry(node)
            .or_default()
            .insert(id, callback);
        Ok(Subscription {
            engine: owner.downgrade(),
            node,
            id,
            slot: Slot::Ordinary,
        })
    }

    /// Set the single subscriber of `node`, replacing any previous one.
    pub fn singleton_subscribe<T: 'static>(
        &self,
        node: NodeRef<T>,
        callback: impl Fn(&T, &Engine) + 'static,
    ) -> EngineResult<Subscription> {
        let owner = self.owner_for(node.id())?;
        let id = SubscriptionId::next();
        let previous = owner
            .state_mut()
            .singletons
            .insert(node.id(), (id, typed(node.id(), callback)));
        drop(previous);
        Ok(Subscription {
            engine: owner.downgrade(),
            node: node.id(),
            id,
            slot: Slot::Singleton,
        })
    }

    /// Remove the singleton subscriber of `node`, if any.
    pub fn clear_singleton_subscription<T>(&self, node: NodeRef<T>) -> EngineResult<()> {
        let owner = self.owner_for(node.id())?;
        let previous = owner.state_mut().singletons.remove(&node.id());
        drop(previous);
        Ok(())
    }

    /// Instantiate `node` if needed and return the engine that owns it.
    fn owner_for(&self, node: NodeId) -> EngineResult<Engine> {
        self.instantiate(node)?;
        self.owner_of(node).ok_or(EngineError::UnknownNode { node })
    }

    /// Ordinary callbacks of `node` followed by its singleton callback.
    pub(crate) fn callbacks_for(&self, node: NodeId) -> Vec<Callback> {
        let state = self.state();
        let mut callbacks: Vec<Callback> = state
            .subscribers
            .get(&node)
            .map(|callbacks| callbacks.values().cloned().collect())
            .unwrap_or_default();
        if let Some((_, singleton)) = state.singletons.get(&node) {
            callbacks.push(Rc::clone(singleton));
        }
        callbacks
    }
}
