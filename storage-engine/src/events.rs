// SPDX-License-Identifier: GPL-3.0-only

//! Typed change notifications
//!
//! The engine emits these to registered observers (UI, logging, DBus
//! exporters). Consumers are pure observers: the engine never blocks
//! on a callback and never reads a return value.

use storage_types::{DeviceId, FormatKind};

/// One change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    DeviceAdded {
        device: DeviceId,
        name: String,
    },
    DeviceRemoved {
        device: DeviceId,
        name: String,
    },
    FormatAdded {
        device: DeviceId,
        kind: FormatKind,
    },
    FormatRemoved {
        device: DeviceId,
        kind: FormatKind,
    },
    ActionAdded {
        action: u64,
        summary: String,
    },
    ActionRemoved {
        action: u64,
        summary: String,
    },
    ActionExecuted {
        action: u64,
        summary: String,
    },
    ParentAdded {
        device: DeviceId,
        parent: DeviceId,
    },
    ParentRemoved {
        device: DeviceId,
        parent: DeviceId,
    },
    AttributeChanged {
        device: DeviceId,
        attribute: &'static str,
        old: String,
        new: String,
    },
}

type Subscriber = Box<dyn Fn(&ChangeEvent) + Send>;

/// Subscriber list for [`ChangeEvent`]s.
#[derive(Default)]
pub struct CallbackRegistry {
    subscribers: Vec<Subscriber>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: impl Fn(&ChangeEvent) + Send + 'static) {
        self.subscribers.push(Box::new(subscriber));
    }

    pub fn emit(&self, event: &ChangeEvent) {
        for subscriber in &self.subscribers {
            subscriber(event);
        }
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn every_subscriber_sees_every_event() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut registry = CallbackRegistry::new();

        for _ in 0..3 {
            let seen = Arc::clone(&seen);
            registry.subscribe(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        registry.emit(&ChangeEvent::ActionAdded {
            action: 1,
            summary: "create device sda1".to_string(),
        });

        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
