//! Correlation of outstanding requests with their responses.
//!
//! Every request gets a fresh id and a one-shot slot registered here before
//! it is written. The reader loop resolves slots as responses arrive; callers
//! that give up abandon theirs. Counter, table, and closed flag live behind
//! one mutex because the reader loop and any number of callers contend on it.

use crate::error::McpError;
use crate::jsonrpc::{JsonRpcResponse, RequestId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::oneshot;

/// A caller waiting for exactly one response.
struct PendingCall {
    slot: oneshot::Sender<JsonRpcResponse>,
    created_at: Instant,
}

struct Inner {
    next_id: u64,
    calls: HashMap<u64, PendingCall>,
    closed: Option<String>,
}

/// Table of requests awaiting a response from one server.
pub struct PendingCalls {
    server: String,
    inner: Mutex<Inner>,
}

impl PendingCalls {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            inner: Mutex::new(Inner {
                next_id: 1,
                calls: HashMap::new(),
                closed: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next request id. Ids start at 1 and only grow.
    pub fn next_id(&self) -> u64 {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }

    /// Register a waiter for `id`. Must happen before the request is written.
    pub fn register(&self, id: u64) -> Result<oneshot::Receiver<JsonRpcResponse>, McpError> {
        let mut inner = self.lock();
        if let Some(reason) = &inner.closed {
            return Err(McpError::Closed {
                server: self.server.clone(),
                reason: reason.clone(),
            });
        }
        if inner.calls.contains_key(&id) {
            return Err(McpError::DuplicateRequestId(id));
        }
        let (slot, rx) = oneshot::channel();
        inner.calls.insert(
            id,
            PendingCall {
                slot,
                created_at: Instant::now(),
            },
        );
        Ok(rx)
    }

    /// Deliver `response` to the waiter registered under `id`.
    ///
    /// Returns `false` when nobody is waiting (unknown, abandoned, or
    /// non-integer id); the response is dropped.
    pub fn resolve(&self, id: &RequestId, response: JsonRpcResponse) -> bool {
        let Some(key) = id.as_u64() else {
            return false;
        };
        let Some(call) = self.lock().calls.remove(&key) else {
            return false;
        };
        tracing::trace!(
            server = %self.server,
            id = key,
            elapsed_ms = u64::try_from(call.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            "response delivered"
        );
        // The receiver may have been dropped between removal and send.
        call.slot.send(response).is_ok()
    }

    /// Remove the waiter for `id` without delivering anything.
    pub fn abandon(&self, id: u64) -> bool {
        self.lock().calls.remove(&id).is_some()
    }

    /// Refuse new registrations and release every waiter with a failure.
    ///
    /// Dropping a slot wakes its receiver with an error. The first reason
    /// given wins.
    pub fn close(&self, reason: impl Into<String>) -> usize {
        let drained: Vec<PendingCall> = {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.into());
            }
            inner.calls.drain().map(|(_, call)| call).collect()
        };
        drained.len()
    }

    /// Why the registry was closed, if it was.
    pub fn closed_reason(&self) -> Option<String> {
        self.lock().closed.clone()
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
