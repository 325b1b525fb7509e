//! Shared server state: route table, counters, safe mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::http::handler::HandlerFactory;
use crate::http::request::Request;

/// State shared by every connection of a server: the handler-factory
/// registry, the safe-mode flag, and the connection counters.
pub struct ServerContext {
    safe_mode: bool,
    connections: AtomicUsize,
    active_requests: AtomicUsize,
    exact: HashMap<String, Arc<dyn HandlerFactory>>,
    prefixes: Vec<(String, Arc<dyn HandlerFactory>)>,
}

impl ServerContext {
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            safe_mode: false,
            exact: HashMap::new(),
            prefixes: Vec::new(),
        }
    }

    /// Looks up the handler factory for a request by its path, ignoring the
    /// query string. Exact routes win over prefix routes; among prefix
    /// routes the longest match wins.
    pub fn factory(&self, request: &Request) -> Option<Arc<dyn HandlerFactory>> {
        let path = request.path.split('?').next().unwrap_or("");

        if let Some(factory) = self.exact.get(path) {
            return Some(factory.clone());
        }

        self.prefixes
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, factory)| factory.clone())
    }

    /// Whether handler panics are contained instead of unwinding the
    /// connection task.
    pub fn safe_mode(&self) -> bool {
        self.safe_mode
    }

    /// Number of currently open connections.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Number of requests currently being processed by a handler.
    pub fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn note_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn note_request_started(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_request_done(&self) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Builder for a [`ServerContext`] in a fluent style.
pub struct ServerBuilder {
    safe_mode: bool,
    exact: HashMap<String, Arc<dyn HandlerFactory>>,
    prefixes: Vec<(String, Arc<dyn HandlerFactory>)>,
}

impl ServerBuilder {
    /// Registers a factory for exactly this path.
    pub fn route(
        mut self,
        path: impl Into<String>,
        factory: impl HandlerFactory + 'static,
    ) -> Self {
        self.exact.insert(path.into(), Arc::new(factory));
        self
    }

    /// Registers a factory for every path starting with this prefix.
    pub fn route_prefix(
        mut self,
        prefix: impl Into<String>,
        factory: impl HandlerFactory + 'static,
    ) -> Self {
        self.prefixes.push((prefix.into(), Arc::new(factory)));
        self
    }

    /// Contain handler panics at the callback boundary (status 598)
    /// instead of aborting the process.
    pub fn safe_mode(mut self, enabled: bool) -> Self {
        self.safe_mode = enabled;
        self
    }

    pub fn build(self) -> Arc<ServerContext> {
        Arc::new(ServerContext {
            safe_mode: self.safe_mode,
            connections: AtomicUsize::new(0),
            active_requests: AtomicUsize::new(0),
            exact: self.exact,
            prefixes: self.prefixes,
        })
    }
}
