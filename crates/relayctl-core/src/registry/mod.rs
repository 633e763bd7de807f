//! Worker registry.
//!
//! Holds every configured worker for the lifetime of the process. Workers are
//! registered once at boot and never added or removed afterwards, so the
//! registry itself needs no lock; each [`Worker`] guards its own state.

use std::sync::Arc;

use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::warn;

use crate::worker::{Worker, WorkerSpec};

/// Longest accepted worker identity.
pub const MAX_IDENTITY_LEN: usize = 64;

/// Registration failure. Fatal at boot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Two workers would expose the same port.
    #[error("port {port} of worker '{identity}' is already used by worker '{existing}'")]
    DuplicatePort {
        /// Contested port.
        port: u16,
        /// Worker being registered.
        identity: String,
        /// Worker that already owns the port.
        existing: String,
    },

    /// Two workers would share a process name and config file.
    #[error("worker identity '{0}' is registered twice")]
    DuplicateIdentity(String),

    /// Identity unusable as a process name or file name component.
    #[error("invalid worker identity '{0}': use 1-64 characters from [A-Za-z0-9_.-]")]
    InvalidIdentity(String),
}

/// The fixed set of workers.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: Vec<Arc<Worker>>,
    window_capacity: usize,
}

impl WorkerRegistry {
    /// Creates an empty registry whose workers keep `window_capacity`
    /// samples.
    #[must_use]
    pub const fn new(window_capacity: usize) -> Self {
        Self {
            workers: Vec::new(),
            window_capacity,
        }
    }

    /// Registers a worker.
    ///
    /// Duplicate client keys are accepted with a warning; the first
    /// registered worker wins lookups.
    pub fn register(&mut self, spec: WorkerSpec) -> Result<Arc<Worker>, RegistryError> {
        if !is_valid_identity(&spec.identity) {
            return Err(RegistryError::InvalidIdentity(spec.identity));
        }

        for existing in &self.workers {
            if existing.identity() == spec.identity {
                return Err(RegistryError::DuplicateIdentity(spec.identity));
            }
            if existing.port() == spec.port {
                return Err(RegistryError::DuplicatePort {
                    port: spec.port,
                    identity: spec.identity,
                    existing: existing.identity().to_string(),
                });
            }
        }

        if let Some(shadowing) = self
            .workers
            .iter()
            .find(|w| w.spec().client_key_matches(spec.client_key.expose_secret()))
        {
            warn!(
                worker = %spec.identity,
                shadowed_by = %shadowing.identity(),
                "client key already used by another worker; telemetry will resolve to the first"
            );
        }

        let worker = Arc::new(Worker::new(spec, self.window_capacity));
        self.workers.push(Arc::clone(&worker));
        Ok(worker)
    }

    /// Finds the worker a telemetry client key belongs to.
    #[must_use]
    pub fn lookup_by_client_key(&self, key: &str) -> Option<Arc<Worker>> {
        self.workers
            .iter()
            .find(|w| w.spec().client_key_matches(key))
            .cloned()
    }

    /// Finds a worker by identity.
    #[must_use]
    pub fn get(&self, identity: &str) -> Option<Arc<Worker>> {
        self.workers
            .iter()
            .find(|w| w.identity() == identity)
            .cloned()
    }

    /// All workers in registration order.
    #[must_use]
    pub fn all(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Number of registered workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether no worker is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

fn is_valid_identity(identity: &str) -> bool {
    !identity.is_empty()
        && identity.len() <= MAX_IDENTITY_LEN
        && identity
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !identity.starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(specs: Vec<WorkerSpec>) -> Result<WorkerRegistry, RegistryError> {
        let mut registry = WorkerRegistry::new(50);
        for spec in specs {
            registry.register(spec)?;
        }
        Ok(registry)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = registry_with(vec![
            WorkerSpec::new("relay-a", 10080, "key-a"),
            WorkerSpec::new("relay-b", 10081, "key-b"),
        ])
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.lookup_by_client_key("key-b").unwrap().identity(),
            "relay-b"
        );
        assert!(registry.lookup_by_client_key("key-c").is_none());
        assert_eq!(registry.get("relay-a").unwrap().port(), 10080);
        assert!(registry.get("relay-c").is_none());
    }

    #[test]
    fn test_lookup_is_by_key_not_identity() {
        let registry = registry_with(vec![WorkerSpec::new("relay-a", 10080, "key-a")]).unwrap();
        assert!(registry.lookup_by_client_key("relay-a").is_none());
    }

    #[test]
    fn test_duplicate_port_rejected() {
        let err = registry_with(vec![
            WorkerSpec::new("relay-a", 10080, "key-a"),
            WorkerSpec::new("relay-b", 10080, "key-b"),
        ])
        .unwrap_err();

        assert_eq!(
            err,
            RegistryError::DuplicatePort {
                port: 10080,
                identity: "relay-b".to_string(),
                existing: "relay-a".to_string(),
            }
        );
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let err = registry_with(vec![
            WorkerSpec::new("relay-a", 10080, "key-a"),
            WorkerSpec::new("relay-a", 10081, "key-b"),
        ])
        .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateIdentity("relay-a".to_string()));
    }

    #[test]
    fn test_duplicate_client_key_first_wins() {
        let registry = registry_with(vec![
            WorkerSpec::new("relay-a", 10080, "shared"),
            WorkerSpec::new("relay-b", 10081, "shared"),
        ])
        .unwrap();
        assert_eq!(
            registry.lookup_by_client_key("shared").unwrap().identity(),
            "relay-a"
        );
    }

    #[test]
    fn test_invalid_identities() {
        for identity in ["", "has space", "../escape", ".hidden", "a/b"] {
            let err = registry_with(vec![WorkerSpec::new(identity, 10080, "k")]).unwrap_err();
            assert!(matches!(err, RegistryError::InvalidIdentity(_)), "{identity}");
        }
        assert!(registry_with(vec![WorkerSpec::new("relay_1.eu-west", 10080, "k")]).is_ok());
    }

    #[test]
    fn test_all_preserves_registration_order() {
        let registry = registry_with(vec![
            WorkerSpec::new("b", 2, "kb"),
            WorkerSpec::new("a", 1, "ka"),
        ])
        .unwrap();
        let order: Vec<_> = registry.all().iter().map(|w| w.identity()).collect();
        assert_eq!(order, vec!["b", "a"]);
    }
}
