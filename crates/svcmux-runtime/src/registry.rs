//! `SharedRegistry` — default `TransportRegistry` implementation.
//!
//! A reader/writer-locked descriptor map: the dispatch loop snapshots it
//! every iteration, accept/close logic writes to it rarely and from other
//! threads.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, RwLock};

use log::warn;

use svcmux_core::registry::{Interest, Pollable, TransportRegistry};
use svcmux_core::transport::Transport;

pub struct SharedRegistry {
    transports: RwLock<HashMap<RawFd, Arc<dyn Transport>>>,
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self {
            transports: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.transports.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SharedRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportRegistry for SharedRegistry {
    fn register(&self, transport: Arc<dyn Transport>) {
        let descriptor = transport.descriptor();
        let mut map = self.transports.write().unwrap();
        if map.insert(descriptor, transport).is_some() {
            // Descriptor numbers recycle; the old endpoint was never
            // unregistered properly.
            warn!("descriptor {} re-registered over a live endpoint", descriptor);
        }
    }

    fn unregister(&self, descriptor: RawFd) {
        self.transports.write().unwrap().remove(&descriptor);
    }

    fn lookup(&self, descriptor: RawFd) -> Option<Arc<dyn Transport>> {
        self.transports.read().unwrap().get(&descriptor).cloned()
    }

    fn pollable(&self) -> Vec<Pollable> {
        self.transports
            .read()
            .unwrap()
            .keys()
            .map(|&descriptor| Pollable {
                descriptor,
                interest: Interest::READ,
            })
            .collect()
    }

    fn clear(&self) {
        self.transports.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use svcmux_core::transport::{TransportClass, TransportStatus};

    struct NullTransport {
        descriptor: RawFd,
    }

    impl Transport for NullTransport {
        fn descriptor(&self) -> RawFd {
            self.descriptor
        }

        fn class(&self) -> TransportClass {
            TransportClass::Connection
        }

        fn status(&self) -> TransportStatus {
            TransportStatus::Idle
        }

        fn receive(&self, _frame: &mut Vec<u8>) -> bool {
            false
        }

        fn reply(&self, _frame: &[u8]) -> bool {
            true
        }
    }

    #[test]
    fn test_register_lookup_unregister() {
        let registry = SharedRegistry::new();
        registry.register(Arc::new(NullTransport { descriptor: 9 }));

        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(9).is_some());
        assert!(registry.lookup(10).is_none());

        registry.unregister(9);
        assert!(registry.lookup(9).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_pollable_snapshot() {
        let registry = SharedRegistry::new();
        registry.register(Arc::new(NullTransport { descriptor: 3 }));
        registry.register(Arc::new(NullTransport { descriptor: 4 }));

        let mut descriptors: Vec<RawFd> =
            registry.pollable().iter().map(|p| p.descriptor).collect();
        descriptors.sort_unstable();
        assert_eq!(descriptors, vec![3, 4]);
        assert!(registry.pollable()[0].interest.contains(Interest::READ));
    }

    #[test]
    fn test_clear_empties_pollable_set() {
        let registry = SharedRegistry::new();
        registry.register(Arc::new(NullTransport { descriptor: 3 }));
        registry.clear();
        assert!(registry.pollable().is_empty());
    }
}
