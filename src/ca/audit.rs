//! Audit records for operations that change CA state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::commons::api::CaName;
use crate::constants::AUDIT_LOG_TARGET;


//------------ AuditStatus ---------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Successful,
    Failed,
}


//------------ AuditEvent ----------------------------------------------------

/// One auditable operation.
///
/// Events are started when the operation starts, collect parameters along
/// the way, and are written to the log target `caengine::audit` as a
/// single line of JSON when finished.
#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    id: Uuid,
    name: &'static str,
    ca: CaName,
    started: DateTime<Utc>,
    duration_ms: i64,
    status: AuditStatus,
    params: BTreeMap<&'static str, String>,
}

impl AuditEvent {
    pub fn start(name: &'static str, ca: &CaName) -> Self {
        AuditEvent {
            id: Uuid::new_v4(),
            name,
            ca: ca.clone(),
            started: Utc::now(),
            duration_ms: 0,
            status: AuditStatus::Successful,
            params: BTreeMap::new(),
        }
    }

    pub fn param(&mut self, key: &'static str, value: impl fmt::Display) {
        self.params.insert(key, value.to_string());
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn status(&self) -> AuditStatus {
        self.status
    }

    pub fn params(&self) -> &BTreeMap<&'static str, String> {
        &self.params
    }

    /// Finishes the event according to `result` and logs it.
    pub fn finish<T, E: fmt::Display>(mut self, result: &Result<T, E>) -> Self {
        self.duration_ms = (Utc::now() - self.started).num_milliseconds();
        if let Err(e) = result {
            self.status = AuditStatus::Failed;
            self.param("message", e);
        }
        self.log();
        self
    }

    fn log(&self) {
        match serde_json::to_string(self) {
            Ok(json) => info!(target: AUDIT_LOG_TARGET, "{}", json),
            Err(e) => warn!("Could not serialize audit event '{}': {}", self.name, e),
        }
    }
}


//------------ Tests ---------------------------------------------------------
