use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// well known state keys
pub mod keys {
    pub const REWRITE_URLS: &str = "rewrite_urls";
    pub const RULE: &str = "rule";
    pub const ORIGINAL_URI: &str = "original_uri";
    pub const PASSTHROUGH: &str = "passthrough";
    pub const DYNAMIC_HOST: &str = "dynamic_host";
    pub const DYNAMIC_PORT: &str = "dynamic_port";
}

/// how long a stored value lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifespan {
    /// cleared when the request side ends
    Request,
    /// outlives encoding, dies with the stream
    FilterChain,
    /// lives with the underlying network connection
    Connection,
}

/// write discipline for a stored value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    ReadOnly,
    Mutable,
}

struct Slot {
    value: Box<dyn Any + Send>,
    mutability: Mutability,
}

type ScopeMap = HashMap<&'static str, Slot>;

/// connection-scoped slice of the state bag, shared by every stream on
/// the same connection
#[derive(Clone, Default)]
pub struct ConnectionState(Arc<Mutex<ScopeMap>>);

/// typed keyed bag of per-stream values with three lifespans
pub struct FilterState {
    request: ScopeMap,
    filter_chain: ScopeMap,
    connection: ConnectionState,
}

impl FilterState {
    pub fn new(connection: ConnectionState) -> Self {
        FilterState {
            request: ScopeMap::new(),
            filter_chain: ScopeMap::new(),
            connection,
        }
    }

    /// store a value; overwriting a read-only slot is refused
    pub fn set<T: Any + Send>(
        &mut self,
        key: &'static str,
        value: T,
        lifespan: Lifespan,
        mutability: Mutability,
    ) -> bool {
        let slot = Slot {
            value: Box::new(value),
            mutability,
        };
        match lifespan {
            Lifespan::Request => insert_checked(&mut self.request, key, slot),
            Lifespan::FilterChain => insert_checked(&mut self.filter_chain, key, slot),
            Lifespan::Connection => insert_checked(&mut self.connection.0.lock(), key, slot),
        }
    }

    /// read a value; request scope shadows chain scope shadows connection
    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        if let Some(slot) = self.request.get(key).or_else(|| self.filter_chain.get(key)) {
            return slot.value.downcast_ref::<T>().cloned();
        }
        self.connection
            .0
            .lock()
            .get(key)
            .and_then(|slot| slot.value.downcast_ref::<T>().cloned())
    }

    pub fn has(&self, key: &str) -> bool {
        self.request.contains_key(key)
            || self.filter_chain.contains_key(key)
            || self.connection.0.lock().contains_key(key)
    }

    /// the request side ended: request-scoped values go away
    pub fn clear_request_scope(&mut self) {
        self.request.clear();
    }
}

fn insert_checked(map: &mut ScopeMap, key: &'static str, slot: Slot) -> bool {
    if let Some(existing) = map.get(key) {
        if existing.mutability == Mutability::ReadOnly {
            tracing::debug!(key, "refusing to overwrite read-only filter state");
            return false;
        }
    }
    map.insert(key, slot);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> FilterState {
        FilterState::new(ConnectionState::default())
    }

    #[test]
    fn set_and_get() {
        let mut fs = state();
        assert!(fs.set(
            keys::DYNAMIC_HOST,
            "example.com".to_string(),
            Lifespan::Request,
            Mutability::ReadOnly,
        ));
        assert_eq!(
            fs.get::<String>(keys::DYNAMIC_HOST).as_deref(),
            Some("example.com")
        );
    }

    #[test]
    fn read_only_refuses_overwrite() {
        let mut fs = state();
        fs.set(keys::RULE, 1u32, Lifespan::Request, Mutability::ReadOnly);
        assert!(!fs.set(keys::RULE, 2u32, Lifespan::Request, Mutability::ReadOnly));
        assert_eq!(fs.get::<u32>(keys::RULE), Some(1));
    }

    #[test]
    fn mutable_allows_overwrite() {
        let mut fs = state();
        fs.set(keys::RULE, 1u32, Lifespan::Request, Mutability::Mutable);
        assert!(fs.set(keys::RULE, 2u32, Lifespan::Request, Mutability::Mutable));
        assert_eq!(fs.get::<u32>(keys::RULE), Some(2));
    }

    #[test]
    fn request_scope_clears() {
        let mut fs = state();
        fs.set(
            keys::DYNAMIC_PORT,
            443u16,
            Lifespan::Request,
            Mutability::ReadOnly,
        );
        fs.set(
            keys::ORIGINAL_URI,
            "/x".to_string(),
            Lifespan::FilterChain,
            Mutability::ReadOnly,
        );
        fs.clear_request_scope();
        assert!(!fs.has(keys::DYNAMIC_PORT));
        assert!(fs.has(keys::ORIGINAL_URI));
    }

    #[test]
    fn connection_scope_shared_between_streams() {
        let connection = ConnectionState::default();
        let mut first = FilterState::new(connection.clone());
        first.set(
            keys::PASSTHROUGH,
            true,
            Lifespan::Connection,
            Mutability::Mutable,
        );
        let second = FilterState::new(connection);
        assert_eq!(second.get::<bool>(keys::PASSTHROUGH), Some(true));
    }

    #[test]
    fn wrong_type_reads_none() {
        let mut fs = state();
        fs.set(keys::RULE, 7u32, Lifespan::Request, Mutability::ReadOnly);
        assert_eq!(fs.get::<String>(keys::RULE), None);
    }
}
