//! Admission control for long-running transactions.
//!
//! When the restriction is enabled, at most one long-running transaction
//! may be in flight per matched route; further ones are rejected with 503
//! instead of tying up connector threads behind a slow backend.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::request::AjpRequest;
use crate::service::ProtocolSettings;

pub enum Admission {
    /// The slot was acquired; drop the permit to release it.
    Granted(OwnedSemaphorePermit),
    /// The target already has a long-running transaction in flight.
    Rejected,
    /// The request is not classified long-running, or the restriction is
    /// disabled.
    Unrestricted,
}

pub struct AdmissionControl {
    enabled: bool,
    path_prefix: String,
    parameter: String,
    slots: DashMap<String, Arc<Semaphore>>,
}

impl AdmissionControl {
    pub fn from_settings(settings: &ProtocolSettings) -> AdmissionControl {
        AdmissionControl {
            enabled: settings.restrict_long_running && !settings.long_running_path.is_empty(),
            path_prefix: settings.long_running_path.clone(),
            parameter: settings.long_running_param.clone(),
            slots: DashMap::new(),
        }
    }

    /// The fixed predicate: path prefix plus, when configured, the
    /// presence of a marker parameter.
    pub fn is_long_running(&self, request: &AjpRequest) -> bool {
        if !self.enabled {
            return false;
        }
        if !request.normalized_path().starts_with(&self.path_prefix) {
            return false;
        }
        self.parameter.is_empty() || request.parameter(&self.parameter).is_some()
    }

    pub fn try_admit(&self, request: &AjpRequest, route: &str) -> Admission {
        if !self.is_long_running(request) {
            return Admission::Unrestricted;
        }
        let slot = self
            .slots
            .entry(route.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();
        match slot.try_acquire_owned() {
            Ok(permit) => Admission::Granted(permit),
            Err(TryAcquireError::NoPermits) => Admission::Rejected,
            Err(TryAcquireError::Closed) => Admission::Rejected,
        }
    }
}
