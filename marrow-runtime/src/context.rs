//! Service context carried by each fiber.
//!
//! A [`Context`] is an immutable type-indexed map. `Effect::provide_service`
//! runs an effect under an extended copy; `Effect::service` reads from the
//! running fiber's current copy. Forked fibers inherit the context of the
//! fiber that forked them.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Type-indexed map of services.
#[derive(Clone, Default)]
pub struct Context {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Context {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a copy with `service` added, replacing any previous service
    /// of the same type.
    pub fn with<S: Send + Sync + 'static>(mut self, service: S) -> Self {
        self.services.insert(TypeId::of::<S>(), Arc::new(service));
        self
    }

    /// Look up a service by type.
    pub fn get<S: Send + Sync + 'static>(&self) -> Option<&S> {
        self.services
            .get(&TypeId::of::<S>())
            .and_then(|service| service.downcast_ref::<S>())
    }

    /// Returns true if a service of type `S` is present.
    pub fn contains<S: Send + Sync + 'static>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<S>())
    }

    /// Number of services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Returns true if no services are present.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("services", &self.services.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Greeting(&'static str);

    #[test]
    fn test_context_lookup() {
        let ctx = Context::new().with(Greeting("hi")).with(42u32);
        assert_eq!(ctx.get::<Greeting>(), Some(&Greeting("hi")));
        assert_eq!(ctx.get::<u32>(), Some(&42));
        assert!(ctx.get::<String>().is_none());
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_context_replace() {
        let ctx = Context::new().with(1u8).with(2u8);
        assert_eq!(ctx.get::<u8>(), Some(&2));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_context_copy_is_independent() {
        let base = Context::new().with(1u8);
        let extended = base.clone().with(Greeting("x"));
        assert!(!base.contains::<Greeting>());
        assert!(extended.contains::<Greeting>());
    }
}
