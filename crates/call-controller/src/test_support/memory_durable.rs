//! In-memory ended-call archive for testing.

use async_trait::async_trait;
use call_controller::errors::CallError;
use call_controller::models::EndedCall;
use call_controller::state::DurableCallStore;
use common::CallId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// In-memory stand-in for the Postgres archive.
#[derive(Debug, Clone, Default)]
pub struct MemoryDurable {
    records: Arc<Mutex<HashMap<CallId, EndedCall>>>,
    fail_writes: Arc<Mutex<bool>>,
}

impl MemoryDurable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of archived calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make subsequent writes fail, to exercise the best-effort archive
    /// path.
    pub fn fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap() = fail;
    }
}

#[async_trait]
impl DurableCallStore for MemoryDurable {
    async fn record(&self, call: &EndedCall) -> Result<(), CallError> {
        if *self.fail_writes.lock().unwrap() {
            return Err(CallError::Database("injected write failure".to_string()));
        }
        self.records
            .lock()
            .unwrap()
            .entry(call.id)
            .or_insert_with(|| call.clone());
        Ok(())
    }

    async fn fetch(&self, call_id: CallId) -> Result<Option<EndedCall>, CallError> {
        Ok(self.records.lock().unwrap().get(&call_id).cloned())
    }
}
