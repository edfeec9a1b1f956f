use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use serde_json::Value;

/// Server side: produces an event body at broadcast time.
pub type EventGenerator = dyn Fn() -> Value + Send + Sync;

/// Server side: turns a request body into a response body.
pub type Responder = dyn Fn(&str) -> Value + Send + Sync;

/// Client side: reacts to an inbound message body.
pub type MessageHandler = dyn Fn(&Value) + Send + Sync;

/// Runtime-mutable table of callbacks keyed by message key.
///
/// Lookups hand out a clone of the stored `Arc` so the lock is never held
/// while a callback runs; callbacks are free to insert or remove entries,
/// including their own.
pub struct HandlerTable<F: ?Sized> {
    entries: RwLock<HashMap<String, Arc<F>>>,
}

impl<F: ?Sized> HandlerTable<F> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registers `handler` under `key`, returning the entry it replaced.
    pub fn insert(&self, key: impl Into<String>, handler: Arc<F>) -> Option<Arc<F>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), handler)
    }

    /// Removes the entry for `key`; unknown keys are ignored.
    pub fn remove(&self, key: &str) -> Option<Arc<F>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn get(&self, key: &str) -> Option<Arc<F>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<F: ?Sized> Default for HandlerTable<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> fmt::Debug for HandlerTable<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<&String> = entries.keys().collect();
        keys.sort();
        f.debug_struct("HandlerTable").field("keys", &keys).finish()
    }
}

pub type EventTable = HandlerTable<EventGenerator>;
pub type ResponseTable = HandlerTable<Responder>;
pub type MessageHandlerTable = HandlerTable<MessageHandler>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn reinserting_a_key_overwrites_it() {
        let table = ResponseTable::new();
        table.insert("echo", Arc::new(|_: &str| json!("first")));
        let previous = table.insert("echo", Arc::new(|body: &str| json!(body)));

        assert!(previous.is_some());
        assert_eq!(table.len(), 1);
        let responder = table.get("echo").expect("registered");
        assert_eq!(responder("hi"), json!("hi"));
    }

    #[test]
    fn removing_an_unknown_key_is_a_no_op() {
        let table = EventTable::new();
        table.insert("tick", Arc::new(|| json!(1)));

        assert!(table.remove("missing").is_none());
        assert!(table.contains("tick"));
        assert!(table.remove("tick").is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn handler_can_remove_itself_while_running() {
        let table = Arc::new(MessageHandlerTable::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handler_table = Arc::clone(&table);
        let handler_calls = Arc::clone(&calls);
        table.insert(
            "once",
            Arc::new(move |_: &Value| {
                handler_calls.fetch_add(1, Ordering::SeqCst);
                handler_table.remove("once");
            }),
        );

        for _ in 0..3 {
            if let Some(handler) = table.get("once") {
                handler(&Value::Null);
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!table.contains("once"));
    }

    #[test]
    fn generators_run_at_call_time() {
        let table = EventTable::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let generator_counter = Arc::clone(&counter);
        table.insert(
            "count",
            Arc::new(move || json!(generator_counter.fetch_add(1, Ordering::SeqCst))),
        );

        let generator = table.get("count").expect("registered");
        assert_eq!(generator(), json!(0));
        assert_eq!(generator(), json!(1));
    }
}
