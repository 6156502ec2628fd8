//! Mock payment provider.

#![allow(clippy::missing_panics_doc)]

use guidepay_core::BoxFuture;
use guidepay_core::provider::{
    CreateIntentRequest, PaymentProvider, ProviderError, ProviderIntent, ProviderIntentStatus,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct ProviderState {
    intents: HashMap<String, ProviderIntent>,
    by_idempotency_key: HashMap<String, String>,
    create_failures: VecDeque<ProviderError>,
    retrieve_failures: VecDeque<ProviderError>,
}

/// Payment provider double.
///
/// Honours idempotency keys the way a real provider does: a repeated create
/// with the same key returns the intent created by the first call.
#[derive(Debug, Default)]
pub struct MockPaymentProvider {
    state: Mutex<ProviderState>,
    next_id: AtomicU64,
    create_calls: AtomicU32,
    retrieve_calls: AtomicU32,
}

impl MockPaymentProvider {
    /// Create an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next create call with `error`.
    pub fn fail_next_create(&self, error: ProviderError) {
        self.state().create_failures.push_back(error);
    }

    /// Fail the next retrieve call with `error`.
    pub fn fail_next_retrieve(&self, error: ProviderError) {
        self.state().retrieve_failures.push_back(error);
    }

    /// Store or replace an intent as provider truth.
    pub fn put_intent(&self, intent: ProviderIntent) {
        self.state().intents.insert(intent.id.clone(), intent);
    }

    /// Change the status of a stored intent.
    pub fn set_status(&self, intent_id: &str, status: ProviderIntentStatus) {
        if let Some(intent) = self.state().intents.get_mut(intent_id) {
            intent.status = status;
        }
    }

    /// Current provider view of an intent.
    #[must_use]
    pub fn intent(&self, intent_id: &str) -> Option<ProviderIntent> {
        self.state().intents.get(intent_id).cloned()
    }

    /// Number of create calls received, failed ones included.
    #[must_use]
    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of retrieve calls received, failed ones included.
    #[must_use]
    pub fn retrieve_calls(&self) -> u32 {
        self.retrieve_calls.load(Ordering::SeqCst)
    }

    /// Number of distinct intents created.
    #[must_use]
    pub fn intent_count(&self) -> usize {
        self.state().intents.len()
    }

    fn create_now(&self, request: CreateIntentRequest) -> Result<ProviderIntent, ProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(error) = state.create_failures.pop_front() {
            return Err(error);
        }
        if let Some(existing) = state
            .by_idempotency_key
            .get(&request.idempotency_key)
            .and_then(|id| state.intents.get(id))
        {
            return Ok(existing.clone());
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("pi_mock_{n:06}");
        let intent = ProviderIntent {
            id: id.clone(),
            status: ProviderIntentStatus::RequiresPaymentMethod,
            amount: request.amount,
            currency: request.currency,
            client_secret: Some(format!("{id}_secret")),
            metadata: request.metadata,
        };
        state.intents.insert(id.clone(), intent.clone());
        state.by_idempotency_key.insert(request.idempotency_key, id);
        Ok(intent)
    }

    fn retrieve_now(&self, intent_id: &str) -> Result<ProviderIntent, ProviderError> {
        self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(error) = state.retrieve_failures.pop_front() {
            return Err(error);
        }
        state
            .intents
            .get(intent_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(intent_id.to_string()))
    }
}

impl PaymentProvider for MockPaymentProvider {
    fn create_intent(
        &self,
        request: CreateIntentRequest,
    ) -> BoxFuture<'_, Result<ProviderIntent, ProviderError>> {
        Box::pin(async move { self.create_now(request) })
    }

    fn retrieve_intent<'a>(
        &'a self,
        intent_id: &'a str,
    ) -> BoxFuture<'a, Result<ProviderIntent, ProviderError>> {
        Box::pin(async move { self.retrieve_now(intent_id) })
    }
}
