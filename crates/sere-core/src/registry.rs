//! Concurrent reader registry
//!
//! Plugin bindings register and unregister readers from their own detection
//! threads while notification threads iterate. Iteration works on a
//! snapshot of `Arc` handles, so a mutation during a walk affects only
//! later snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::event::{EventBus, PluginEvent, PluginEventKind};
use crate::reader::SeReader;
use crate::transport::SeTransport;

/// Registry of the readers exposed by one plugin
pub struct ReaderRegistry<T: SeTransport + 'static> {
    readers: RwLock<HashMap<String, Arc<SeReader<T>>>>,
    events: EventBus<PluginEvent>,
}

impl<T: SeTransport + 'static> ReaderRegistry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            readers: RwLock::new(HashMap::new()),
            events: EventBus::new(),
        }
    }

    /// Register a reader, publishing a connection event
    ///
    /// Returns the previous reader registered under the same name, if any.
    pub fn insert(&self, reader: SeReader<T>) -> Option<Arc<SeReader<T>>> {
        let name = reader.name().to_owned();
        let previous = self
            .readers
            .write()
            .insert(name.clone(), Arc::new(reader));
        debug!(reader = %name, "Reader registered");
        self.events.publish(PluginEvent {
            reader_names: vec![name],
            kind: PluginEventKind::ReaderConnected,
        });
        previous
    }

    /// Remove a reader by name, publishing a disconnection event
    pub fn remove(&self, name: &str) -> Option<Arc<SeReader<T>>> {
        let removed = self.readers.write().remove(name);
        if removed.is_some() {
            debug!(reader = %name, "Reader unregistered");
            self.events.publish(PluginEvent {
                reader_names: vec![name.to_owned()],
                kind: PluginEventKind::ReaderDisconnected,
            });
        }
        removed
    }

    /// Look up a reader by name
    pub fn get(&self, name: &str) -> Option<Arc<SeReader<T>>> {
        self.readers.read().get(name).cloned()
    }

    /// Names of all registered readers
    pub fn names(&self) -> Vec<String> {
        self.readers.read().keys().cloned().collect()
    }

    /// Snapshot of all registered readers, safe to iterate while other
    /// threads mutate the registry
    pub fn snapshot(&self) -> Vec<Arc<SeReader<T>>> {
        self.readers.read().values().cloned().collect()
    }

    /// Number of registered readers
    pub fn len(&self) -> usize {
        self.readers.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.readers.read().is_empty()
    }

    /// Event bus carrying this registry's plugin events
    pub fn events(&self) -> &EventBus<PluginEvent> {
        &self.events
    }
}

impl<T: SeTransport + 'static> Default for ReaderRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SeTransport + 'static> std::fmt::Debug for ReaderRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderRegistry")
            .field("readers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::transport::mock::MockTransport;

    fn reader(name: &str) -> SeReader<MockTransport> {
        SeReader::new(name, MockTransport::new())
    }

    #[test]
    fn test_insert_remove_publish_events() {
        let registry: ReaderRegistry<MockTransport> = ReaderRegistry::new();
        let (_id, events) = registry.events().subscribe_channel();

        registry.insert(reader("reader-0"));
        let event = events.recv().unwrap();
        assert_eq!(event.kind, PluginEventKind::ReaderConnected);
        assert_eq!(event.reader_names, vec!["reader-0".to_string()]);

        assert!(registry.remove("reader-0").is_some());
        assert_eq!(
            events.recv().unwrap().kind,
            PluginEventKind::ReaderDisconnected
        );
        // Removing twice publishes nothing further
        assert!(registry.remove("reader-0").is_none());
        assert!(events.is_empty());
    }

    #[test]
    fn test_snapshot_survives_concurrent_mutation() {
        let registry: Arc<ReaderRegistry<MockTransport>> = Arc::new(ReaderRegistry::new());
        for i in 0..8 {
            registry.insert(reader(&format!("reader-{i}")));
        }

        let mutator = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for i in 0..8 {
                    registry.remove(&format!("reader-{i}"));
                    registry.insert(reader(&format!("reader-{}", i + 100)));
                }
            })
        };

        // Walk snapshots while the mutator churns the map
        for _ in 0..32 {
            for entry in registry.snapshot() {
                let _ = entry.name();
            }
        }

        mutator.join().unwrap();
        assert_eq!(registry.len(), 8);
    }
}
