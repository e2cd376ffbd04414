//! In-memory certificate store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::commons::api::{
    CertWithRevocationInfo, CrlInfo, CrlNumber, CrlScope, IssuedCertificate,
    RevocationInfo, Serial,
};

use super::{
    CertificateStore, IssuedQuery, RevokedCertInfo, SerialFilter, StoreError,
    StoreResult,
};


//------------ MemoryCertStore -----------------------------------------------

/// A [`CertificateStore`] keeping everything in memory.
///
/// All state sits behind one mutex, which makes every operation atomic.
#[derive(Debug, Default)]
pub struct MemoryCertStore {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    last_serial: u64,
    last_crl_number: u64,
    certs: BTreeMap<Serial, StoredCert>,
    crls: BTreeMap<CrlNumber, CrlInfo>,
    publish_queue: BTreeMap<String, BTreeSet<Serial>>,
    last_delta_id: u64,
    delta_cache: BTreeMap<u64, Serial>,
}

#[derive(Clone, Debug)]
struct StoredCert {
    cert: IssuedCertificate,
    revocation: Option<RevocationInfo>,
}

impl StoredCert {
    fn with_revocation_info(&self) -> CertWithRevocationInfo {
        CertWithRevocationInfo::new(self.cert.clone(), self.revocation)
    }

    fn in_scope(&self, scope: CrlScope) -> bool {
        match scope {
            CrlScope::All => true,
            CrlScope::CaCertsOnly => self.cert.is_ca(),
            CrlScope::UserCertsOnly => !self.cert.is_ca(),
        }
    }

    fn matches(&self, filter: &SerialFilter) -> bool {
        if filter.revoked_only && self.revocation.is_none() {
            return false;
        }
        if let Some(before) = filter.expired_before {
            if self.cert.not_after() >= before {
                return false;
            }
        }
        if let Some(profile) = &filter.profile {
            if self.cert.profile() != profile {
                return false;
            }
        }
        if let Some(pattern) = &filter.user_like {
            match self.cert.requestor() {
                Some(user) if like(pattern, user) => {}
                _ => return false,
            }
        }
        true
    }
}

impl MemoryCertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next allocated serial greater than `serial`.
    pub fn with_first_serial(self, serial: u64) -> Self {
        self.state.lock().expect("poisoned lock").last_serial = serial.saturating_sub(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("poisoned lock")
    }
}

impl CertificateStore for MemoryCertStore {
    fn next_serial(&self) -> StoreResult<Serial> {
        let mut state = self.state();
        state.last_serial += 1;
        Ok(Serial::from(state.last_serial))
    }

    fn next_crl_number(&self) -> StoreResult<CrlNumber> {
        Ok(CrlNumber::from(self.state().last_crl_number + 1))
    }

    fn add_certificate(&self, cert: &IssuedCertificate) -> StoreResult<()> {
        let mut state = self.state();
        let serial = cert.serial();
        if state.certs.contains_key(&serial) {
            return Err(StoreError::Duplicate(serial));
        }
        state.certs.insert(serial, StoredCert { cert: cert.clone(), revocation: None });
        Ok(())
    }

    fn get_cert_with_revocation_info(
        &self,
        serial: Serial,
    ) -> StoreResult<Option<CertWithRevocationInfo>> {
        Ok(self.state().certs.get(&serial).map(StoredCert::with_revocation_info))
    }

    fn find_issued(
        &self,
        query: IssuedQuery,
    ) -> StoreResult<Option<CertWithRevocationInfo>> {
        let state = self.state();
        let found = state.certs.values().find(|stored| {
            query.subject.is_none_or(|fp| stored.cert.subject_fingerprint() == fp)
                && query.key.is_none_or(|fp| stored.cert.key_fingerprint() == fp)
                && query.profile.is_none_or(|p| stored.cert.profile() == p)
        });
        Ok(found.map(StoredCert::with_revocation_info))
    }

    fn earliest_not_before(
        &self,
        cn: &str,
        profile: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let state = self.state();
        Ok(state
            .certs
            .values()
            .filter(|stored| {
                stored.cert.profile() == profile
                    && stored.cert.requested_subject().common_name() == Some(cn)
            })
            .map(|stored| stored.cert.validity().not_before())
            .min())
    }

    fn revoke_cert(
        &self,
        serial: Serial,
        revocation: RevocationInfo,
    ) -> StoreResult<CertWithRevocationInfo> {
        let mut state = self.state();
        let stored = state.certs.get_mut(&serial).ok_or(StoreError::NotFound(serial))?;
        stored.revocation = Some(revocation);
        Ok(stored.with_revocation_info())
    }

    fn unrevoke_cert(&self, serial: Serial) -> StoreResult<CertWithRevocationInfo> {
        let mut state = self.state();
        let stored = state.certs.get_mut(&serial).ok_or(StoreError::NotFound(serial))?;
        stored.revocation = None;
        Ok(stored.with_revocation_info())
    }

    fn remove_cert(&self, serial: Serial) -> StoreResult<()> {
        let mut state = self.state();
        state.certs.remove(&serial).ok_or(StoreError::NotFound(serial))?;
        for queue in state.publish_queue.values_mut() {
            queue.remove(&serial);
        }
        Ok(())
    }

    fn get_serials(
        &self,
        after: Option<Serial>,
        limit: usize,
        filter: &SerialFilter,
    ) -> StoreResult<Vec<Serial>> {
        let state = self.state();
        Ok(state
            .certs
            .iter()
            .filter(|(serial, _)| after.is_none_or(|after| **serial > after))
            .filter(|(_, stored)| stored.matches(filter))
            .map(|(serial, _)| *serial)
            .take(limit)
            .collect())
    }

    fn count_serials(&self, filter: &SerialFilter) -> StoreResult<usize> {
        let state = self.state();
        Ok(state.certs.values().filter(|stored| stored.matches(filter)).count())
    }

    fn get_revoked_certs(
        &self,
        not_expired_before: DateTime<Utc>,
        after: Option<Serial>,
        limit: usize,
        scope: CrlScope,
    ) -> StoreResult<Vec<RevokedCertInfo>> {
        let state = self.state();
        Ok(state
            .certs
            .iter()
            .filter(|(serial, _)| after.is_none_or(|after| **serial > after))
            .filter(|(_, stored)| {
                stored.in_scope(scope) && stored.cert.not_after() >= not_expired_before
            })
            .filter_map(|(serial, stored)| {
                stored.revocation.map(|revocation| RevokedCertInfo {
                    serial: *serial,
                    revocation,
                    not_after: stored.cert.not_after(),
                    ca: stored.cert.is_ca(),
                })
            })
            .take(limit)
            .collect())
    }

    fn has_certs_of_type(&self, ca: bool) -> StoreResult<bool> {
        Ok(self.state().certs.values().any(|stored| stored.cert.is_ca() == ca))
    }

    fn get_certs(
        &self,
        after: Option<Serial>,
        limit: usize,
        not_expired_before: Option<DateTime<Utc>>,
        scope: CrlScope,
    ) -> StoreResult<Vec<IssuedCertificate>> {
        let state = self.state();
        Ok(state
            .certs
            .iter()
            .filter(|(serial, _)| after.is_none_or(|after| **serial > after))
            .filter(|(_, stored)| {
                stored.in_scope(scope)
                    && not_expired_before.is_none_or(|t| stored.cert.not_after() >= t)
            })
            .map(|(_, stored)| stored.cert.clone())
            .take(limit)
            .collect())
    }

    fn add_crl(&self, crl: CrlInfo) -> StoreResult<()> {
        let mut state = self.state();
        let number = crl.crl_number().as_u64();
        if number <= state.last_crl_number {
            return Err(StoreError::other(format!(
                "CRL number {} is not above the last CRL number {}",
                number, state.last_crl_number
            )));
        }
        state.last_crl_number = number;
        state.crls.insert(crl.crl_number(), crl);
        Ok(())
    }

    fn get_crl(&self, crl_number: CrlNumber) -> StoreResult<Option<CrlInfo>> {
        Ok(self.state().crls.get(&crl_number).cloned())
    }

    fn get_latest_crl(&self, delta: bool) -> StoreResult<Option<CrlInfo>> {
        let state = self.state();
        Ok(state.crls.values().rev().find(|crl| crl.is_delta() == delta).cloned())
    }

    fn max_full_crl_number(&self) -> StoreResult<Option<CrlNumber>> {
        let state = self.state();
        Ok(state
            .crls
            .values()
            .rev()
            .find(|crl| !crl.is_delta())
            .map(CrlInfo::crl_number))
    }

    fn cleanup_crls(&self, keep: usize) -> StoreResult<usize> {
        let mut state = self.state();
        let full: Vec<CrlNumber> = state
            .crls
            .values()
            .filter(|crl| !crl.is_delta())
            .map(CrlInfo::crl_number)
            .collect();
        if full.len() <= keep {
            return Ok(0);
        }
        let Some(oldest_kept) = full.get(full.len() - keep).copied() else {
            // nothing is kept
            let removed = state.crls.len();
            state.crls.clear();
            return Ok(removed);
        };

        let before = state.crls.len();
        state.crls.retain(|number, crl| {
            let base = crl.base_crl_number().unwrap_or(*number);
            base >= oldest_kept
        });
        Ok(before - state.crls.len())
    }

    fn add_to_publish_queue(&self, publisher: &str, serial: Serial) -> StoreResult<()> {
        self.state()
            .publish_queue
            .entry(publisher.to_string())
            .or_default()
            .insert(serial);
        Ok(())
    }

    fn remove_from_publish_queue(&self, publisher: &str, serial: Serial) -> StoreResult<()> {
        if let Some(queue) = self.state().publish_queue.get_mut(publisher) {
            queue.remove(&serial);
        }
        Ok(())
    }

    fn get_publish_queue_entries(
        &self,
        publisher: &str,
        limit: usize,
    ) -> StoreResult<Vec<Serial>> {
        let state = self.state();
        Ok(state
            .publish_queue
            .get(publisher)
            .map(|queue| queue.iter().take(limit).copied().collect())
            .unwrap_or_default())
    }

    fn clear_publish_queue(&self, publisher: Option<&str>) -> StoreResult<()> {
        let mut state = self.state();
        match publisher {
            Some(publisher) => {
                state.publish_queue.remove(publisher);
            }
            None => state.publish_queue.clear(),
        }
        Ok(())
    }

    fn add_to_delta_crl_cache(&self, serial: Serial) -> StoreResult<()> {
        let mut state = self.state();
        state.last_delta_id += 1;
        let id = state.last_delta_id;
        state.delta_cache.insert(id, serial);
        Ok(())
    }

    fn get_delta_crl_cache(
        &self,
        after: Option<Serial>,
        limit: usize,
    ) -> StoreResult<Vec<Serial>> {
        let state = self.state();
        let serials: BTreeSet<Serial> = state
            .delta_cache
            .values()
            .filter(|serial| after.is_none_or(|after| **serial > after))
            .copied()
            .collect();
        Ok(serials.into_iter().take(limit).collect())
    }

    fn max_delta_crl_cache_id(&self) -> StoreResult<Option<u64>> {
        Ok(self.state().delta_cache.keys().next_back().copied())
    }

    fn clear_delta_crl_cache(&self, id: u64) -> StoreResult<()> {
        self.state().delta_cache.retain(|entry, _| *entry > id);
        Ok(())
    }
}


//------------ like ----------------------------------------------------------

/// Matches `value` against a SQL LIKE pattern.
fn like(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();

    // matches[j] holds whether the pattern so far matches value[..j]
    let mut matches = vec![false; value.len() + 1];
    matches[0] = true;
    for p in &pattern {
        let mut next = vec![false; value.len() + 1];
        match p {
            '%' => {
                let mut any = false;
                for j in 0..=value.len() {
                    any |= matches[j];
                    next[j] = any;
                }
            }
            '_' => {
                for j in 1..=value.len() {
                    next[j] = matches[j - 1];
                }
            }
            c => {
                for j in 1..=value.len() {
                    next[j] = matches[j - 1] && value[j - 1] == *c;
                }
            }
        }
        matches = next;
    }
    matches[value.len()]
}


//------------ Tests ---------------------------------------------------------
