//! Removing expired certificates from the store.

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, info, warn};

use crate::commons::api::Permission;
use crate::commons::{CaResult, Error};
use crate::constants::REMOVE_EXPIRED_BATCH_SIZE;
use crate::store::SerialFilter;

use super::{AuditEvent, RunGuard, X509Ca};


//------------ RemoveExpiredCertsTask ----------------------------------------

/// A queued request to remove certificates that expired before a cutoff.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoveExpiredCertsTask {
    profile: Option<String>,
    user_like: Option<String>,

    /// The effective cutoff, never later than the CA's retention allows.
    expired_at: DateTime<Utc>,
    overlap: TimeDelta,

    /// The number of matching certificates when the task was created.
    estimated: usize,
}

impl RemoveExpiredCertsTask {
    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    pub fn user_like(&self) -> Option<&str> {
        self.user_like.as_deref()
    }

    pub fn expired_at(&self) -> DateTime<Utc> {
        self.expired_at
    }

    pub fn estimated(&self) -> usize {
        self.estimated
    }

    fn filter(&self) -> SerialFilter {
        SerialFilter {
            revoked_only: false,
            expired_before: Some(self.expired_at - self.overlap),
            profile: self.profile.clone(),
            user_like: self.user_like.clone(),
        }
    }
}


//------------ Reaper --------------------------------------------------------

impl X509Ca {
    /// Queues removal of the certificates that expired before `expired_at`.
    ///
    /// Certificates are kept for the CA's retention period no matter what
    /// `expired_at` says. The task runs on the next reaper tick.
    pub fn add_remove_expired_certs_task(
        &self,
        profile: Option<&str>,
        user_like: Option<&str>,
        expired_at: DateTime<Utc>,
    ) -> CaResult<RemoveExpiredCertsTask> {
        self.check_master()?;
        let ca = self.info();
        ca.check_permission(Permission::RemoveCert)?;

        let profile = match profile {
            Some(name) => Some(
                self.ctx
                    .profiles
                    .get(name)
                    .ok_or_else(|| Error::UnknownProfile(name.to_string()))?
                    .name()
                    .to_string(),
            ),
            None => None,
        };

        let retention = Utc::now() - TimeDelta::days(ca.keep_expired_certs_days());
        let mut task = RemoveExpiredCertsTask {
            profile,
            user_like: user_like.map(str::to_string),
            expired_at: expired_at.min(retention),
            overlap: ca.expired_certs_overlap(),
            estimated: 0,
        };
        task.estimated = self.ctx.store.count_serials(&task.filter())?;

        info!(
            "CA '{}' queued removal of about {} certificates expired before {}",
            ca.name(),
            task.estimated,
            task.expired_at
        );
        self.ctx
            .remove_expired_tasks
            .lock()
            .expect("poisoned lock")
            .push_back(task.clone());
        Ok(task)
    }

    /// The removal tasks still waiting to run.
    pub fn remove_expired_certs_tasks(&self) -> Vec<RemoveExpiredCertsTask> {
        self.ctx
            .remove_expired_tasks
            .lock()
            .expect("poisoned lock")
            .iter()
            .cloned()
            .collect()
    }

    /// Runs the oldest queued removal task.
    ///
    /// A task that did not remove every matching certificate goes back
    /// into the queue as a whole.
    pub fn remove_expired_certs(&self) -> CaResult<()> {
        if !self.ctx.manager.is_master() {
            return Ok(());
        }
        let Some(_running) = RunGuard::acquire(&self.ctx.reaper_running) else {
            debug!("Removal of expired certificates is already running");
            return Ok(());
        };

        let task = self
            .ctx
            .remove_expired_tasks
            .lock()
            .expect("poisoned lock")
            .pop_front();
        let Some(task) = task else {
            return Ok(());
        };

        let mut audit = AuditEvent::start("remove_expired_certs", &self.name());
        audit.param("expired_at", task.expired_at);
        if let Some(profile) = task.profile() {
            audit.param("profile", profile);
        }
        if let Some(user_like) = task.user_like() {
            audit.param("user_like", user_like);
        }

        let result = self.run_remove_expired_task(&task);
        match &result {
            Ok(removed) => audit.param("removed", removed),
            Err(_) => {
                warn!("Removal of expired certificates incomplete, queueing the task again");
                self.ctx
                    .remove_expired_tasks
                    .lock()
                    .expect("poisoned lock")
                    .push_back(task);
            }
        }
        audit.finish(&result);
        result.map(|_| ())
    }

    fn run_remove_expired_task(&self, task: &RemoveExpiredCertsTask) -> CaResult<usize> {
        let filter = task.filter();
        let mut after = None;
        let mut removed = 0;
        let mut failed = 0;

        loop {
            let serials = self.ctx.store.get_serials(after, REMOVE_EXPIRED_BATCH_SIZE, &filter)?;
            let Some(last) = serials.last() else {
                break;
            };
            after = Some(*last);
            let done = serials.len() < REMOVE_EXPIRED_BATCH_SIZE;

            for serial in serials {
                match self.remove_cert_internal(serial) {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        warn!("Could not remove expired certificate {}: {}", serial, e);
                        failed += 1;
                    }
                }
            }
            if done {
                break;
            }
        }

        if failed > 0 {
            Err(Error::system(format!(
                "{} expired certificates could not be removed",
                failed
            )))
        } else {
            info!("CA '{}' removed {} expired certificates", self.name(), removed);
            Ok(removed)
        }
    }
}
