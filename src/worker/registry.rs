// src/worker/registry.rs
//! String-keyed registry of agent constructors
//!
//! Process boundaries share no object identity, so agent implementations are
//! resolved by name at worker start from an explicit table of factories,
//! never passed by reference and never reflected.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::agent::Runnable;
use crate::error::{AviaryError, Result};

/// Constructor-side metadata and builder for one agent implementation.
///
/// The factory is the spawn-time authority for the implementation's role and
/// for which child roles its agents may create.
pub trait AgentFactory: Send + Sync {
    /// Role tag of agents built by this factory
    fn role(&self) -> &str;

    /// Roles this implementation is allowed to spawn as children; enforced
    /// at spawn time, not at call time
    fn allowed_child_roles(&self) -> Vec<String> {
        Vec::new()
    }

    /// Construct a fresh runnable for the given goal and config
    fn build(&self, goal: &str, config: &serde_json::Value) -> Result<Box<dyn Runnable>>;
}

impl std::fmt::Debug for dyn AgentFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentFactory")
            .field("role", &self.role())
            .finish_non_exhaustive()
    }
}

type BuildFn =
    dyn Fn(&str, &serde_json::Value) -> Result<Box<dyn Runnable>> + Send + Sync + 'static;

struct FnFactory {
    role: String,
    allowed_child_roles: Vec<String>,
    build: Box<BuildFn>,
}

impl AgentFactory for FnFactory {
    fn role(&self) -> &str {
        &self.role
    }

    fn allowed_child_roles(&self) -> Vec<String> {
        self.allowed_child_roles.clone()
    }

    fn build(&self, goal: &str, config: &serde_json::Value) -> Result<Box<dyn Runnable>> {
        (self.build)(goal, config)
    }
}

/// Table of agent implementations known to this process
#[derive(Default)]
pub struct AgentRegistry {
    factories: HashMap<String, Arc<dyn AgentFactory>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its implementation key
    pub fn register(&mut self, key: impl Into<String>, factory: Arc<dyn AgentFactory>) {
        let key = key.into();
        info!(agent_impl = %key, role = %factory.role(), "registering agent implementation");
        self.factories.insert(key, factory);
    }

    /// Register a closure-backed factory
    pub fn register_fn<F>(
        &mut self,
        key: impl Into<String>,
        role: impl Into<String>,
        allowed_child_roles: Vec<String>,
        build: F,
    ) where
        F: Fn(&str, &serde_json::Value) -> Result<Box<dyn Runnable>> + Send + Sync + 'static,
    {
        self.register(
            key,
            Arc::new(FnFactory {
                role: role.into(),
                allowed_child_roles,
                build: Box::new(build),
            }),
        );
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn AgentFactory>> {
        self.factories.get(key).cloned()
    }

    /// Look up a factory, failing loudly on an unknown key
    pub fn resolve(&self, key: &str) -> Result<Arc<dyn AgentFactory>> {
        self.get(key)
            .ok_or_else(|| AviaryError::UnknownImpl(key.to_string()))
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.factories.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentCtx;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Runnable for Noop {
        async fn run(&mut self, _ctx: &mut AgentCtx) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = AgentRegistry::new();
        registry.register_fn("noop", "idler", vec![], |_, _| Ok(Box::new(Noop)));

        let factory = registry.resolve("noop").unwrap();
        assert_eq!(factory.role(), "idler");
        assert!(factory.allowed_child_roles().is_empty());
        assert!(factory.build("goal", &serde_json::json!({})).is_ok());
    }

    #[test]
    fn test_unknown_impl_is_an_error() {
        let registry = AgentRegistry::new();
        let err = registry.resolve("ghost").unwrap_err();
        assert!(matches!(err, AviaryError::UnknownImpl(_)));
    }

    #[test]
    fn test_keys_sorted() {
        let mut registry = AgentRegistry::new();
        registry.register_fn("b", "b", vec![], |_, _| Ok(Box::new(Noop)));
        registry.register_fn("a", "a", vec![], |_, _| Ok(Box::new(Noop)));
        assert_eq!(registry.keys(), vec!["a".to_string(), "b".to_string()]);
    }
}
