//! Namespaces claimed by live managers.
//!
//! A registry is created by the application and handed to every manager it
//! opens; at most one manager per namespace is live at a time. The claim is a
//! lease released when the manager closes or drops.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{HaulError, Result};

#[derive(Debug, Clone, Default)]
pub struct NamespaceRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl NamespaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn claim(&self, namespace: &str) -> Result<NamespaceLease> {
        if !self.lock().insert(namespace.to_string()) {
            return Err(HaulError::NamespaceInUse(namespace.to_string()));
        }
        Ok(NamespaceLease {
            namespace: namespace.to_string(),
            registry: self.clone(),
        })
    }

    pub fn is_active(&self, namespace: &str) -> bool {
        self.lock().contains(namespace)
    }
}

#[derive(Debug)]
pub struct NamespaceLease {
    namespace: String,
    registry: NamespaceRegistry,
}

impl NamespaceLease {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl Drop for NamespaceLease {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.namespace);
    }
}
