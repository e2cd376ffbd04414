//! CRL scheduling and generation.

use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error, info, warn};

use crate::commons::api::{
    CaInfo, CrlCertEntry, CrlControl, CrlInfo, CrlIntervalState, CrlReason,
    CrlScope, CrlUpdateMode, IssuingDistributionPoint, Permission,
    RevokedEntry, Serial, TbsCrl, X509Crl,
};
use crate::commons::crypto::verify_signature;
use crate::commons::{CaResult, Error};
use crate::constants::{
    CRL_CERT_BATCH_SIZE, CRL_ENTRY_BATCH_SIZE, CRL_EXPIRED_CERT_BUFFER_SECONDS,
    CRL_MIN_VALIDITY_SECONDS,
};

use super::{AuditEvent, CrlSigner, RunGuard, X509Ca};


//------------ CrlKind -------------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CrlKind {
    Full,
    Delta,
}


//------------ CrlDecision ---------------------------------------------------

/// What the CRL scheduler should do on a tick.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CrlDecision {
    Skip,
    Generate {
        kind: CrlKind,

        /// The interval number to record once the CRL is generated.
        interval: u64,
        interval_date: DateTime<Utc>,
        next_update: DateTime<Utc>,
    },
}

/// Decides whether a CRL is due at `now`.
///
/// Intervals are numbered from the first CRL, which is always a full one
/// at interval 0. If the scheduler fell behind by several intervals, all
/// of them are scanned and a full CRL wins over a delta CRL.
pub fn crl_decision(
    control: &CrlControl,
    state: CrlIntervalState,
    now: DateTime<Utc>,
) -> CrlDecision {
    let interval = control.interval();

    let Some(last_date) = state.last_interval_date else {
        let date = first_interval_date(control, now);
        return CrlDecision::Generate {
            kind: CrlKind::Full,
            interval: 0,
            interval_date: date,
            next_update: next_update_after(control, 0, date, CrlKind::Full),
        };
    };

    let since = now - last_date;
    if since < interval {
        return CrlDecision::Skip;
    }

    let minutes = control.interval_minutes as i64;
    let skipped = (since.num_minutes() / minutes - 1).max(0) as u64;
    let this_interval = state.last_interval + 1;

    let mut kind = None;
    for n in this_interval..=this_interval + skipped {
        if n % control.full_crl_intervals == 0 {
            kind = Some(CrlKind::Full);
            break;
        }
        if control.delta_enabled() && n % control.delta_crl_intervals == 0 {
            kind = Some(CrlKind::Delta);
        }
    }

    match kind {
        None => CrlDecision::Skip,
        Some(kind) => {
            let interval_number = this_interval + skipped;
            let Some(interval_date) = i32::try_from(skipped + 1)
                .ok()
                .and_then(|n| interval.checked_mul(n))
                .and_then(|elapsed| last_date.checked_add_signed(elapsed))
            else {
                error!(
                    "Cannot compute the date of CRL interval {}, {} intervals after {}",
                    interval_number,
                    skipped + 1,
                    last_date
                );
                return CrlDecision::Skip;
            };
            CrlDecision::Generate {
                kind,
                interval: interval_number,
                interval_date,
                next_update: next_update_after(control, interval_number, interval_date, kind),
            }
        }
    }
}

/// The nextUpdate of a CRL generated for interval `interval` starting at
/// `date`.
///
/// This is the start of the next interval that gets a CRL, plus the
/// overlap. With `extended_next_update` a delta CRL points to the next
/// full CRL instead.
pub fn next_update_after(
    control: &CrlControl,
    interval: u64,
    date: DateTime<Utc>,
    kind: CrlKind,
) -> DateTime<Utc> {
    let full = control.full_crl_intervals;
    let next_full = (interval / full + 1) * full;

    let next_delta = if control.delta_enabled() {
        let delta = control.delta_crl_intervals;
        let mut n = (interval / delta + 1) * delta;
        while n % full == 0 {
            n += delta;
        }
        Some(n)
    } else {
        None
    };

    let next = match (kind, next_delta) {
        (CrlKind::Delta, _) if control.extended_next_update => next_full,
        (_, Some(next_delta)) => next_full.min(next_delta),
        (_, None) => next_full,
    };

    let ahead = i32::try_from(next - interval).unwrap_or(i32::MAX);
    control
        .interval()
        .checked_mul(ahead)
        .and_then(|until| until.checked_add(&control.overlap()))
        .and_then(|until| date.checked_add_signed(until))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn first_interval_date(control: &CrlControl, now: DateTime<Utc>) -> DateTime<Utc> {
    let Some(day_time) = control.interval_day_time else {
        return now;
    };
    let today = now.date_naive().and_time(day_time).and_utc();
    if today > now {
        today - TimeDelta::days(1)
    } else {
        today
    }
}


//------------ CRL generation ------------------------------------------------

impl X509Ca {
    /// Generates a CRL if one is due according to the CRL control of the
    /// CA. Returns the generated CRL, if any.
    ///
    /// Does nothing if another CRL generation is running.
    pub fn generate_crl_if_due(&self) -> CaResult<Option<CrlInfo>> {
        if !self.ctx.manager.is_master() || self.ctx.crl_signer.is_none() {
            return Ok(None);
        }
        let ca = self.info();
        let Some(control) = ca.crl_control().cloned() else {
            return Ok(None);
        };
        if control.update_mode != CrlUpdateMode::Interval {
            return Ok(None);
        }

        let Some(_running) = RunGuard::acquire(&self.ctx.crl_generation_running) else {
            debug!("CRL generation for CA '{}' is already running", ca.name());
            return Ok(None);
        };

        match crl_decision(&control, ca.crl_interval(), Utc::now()) {
            CrlDecision::Skip => Ok(None),
            CrlDecision::Generate { kind, interval, interval_date, next_update } => {
                let crl = self.generate_crl(&ca, &control, kind, Some(next_update))?;

                let state = CrlIntervalState {
                    last_interval: interval,
                    last_interval_date: Some(interval_date),
                };
                self.ctx
                    .info
                    .write()
                    .expect("poisoned lock")
                    .set_crl_interval(state);
                if let Err(e) = self.ctx.manager.save_crl_interval(ca.name(), state) {
                    error!(
                        "CA '{}' generated CRL {} but could not save CRL interval {}: {}",
                        ca.name(),
                        crl.crl_number(),
                        interval,
                        e
                    );
                }
                Ok(Some(crl))
            }
        }
    }

    /// Generates a full CRL now.
    ///
    /// Fails with `SystemUnavailable` while a scheduled generation runs.
    pub fn generate_crl_on_demand(&self) -> CaResult<CrlInfo> {
        self.check_master()?;
        let ca = self.info();
        ca.check_permission(Permission::GenCrl)?;
        if self.ctx.crl_signer.is_none() {
            return Err(Error::not_permitted(format!(
                "CA '{}' has no CRL signer",
                ca.name()
            )));
        }

        let Some(_running) = RunGuard::acquire(&self.ctx.crl_generation_running) else {
            return Err(Error::SystemUnavailable(
                "CRL generation is in progress, try again later".to_string(),
            ));
        };

        let control = ca.crl_control().cloned();
        let next_update = match &control {
            Some(control) if control.update_mode == CrlUpdateMode::Interval => {
                let now = Utc::now();
                let state = ca.crl_interval();
                let (interval, date) = match state.last_interval_date {
                    Some(date) => (state.last_interval, date),
                    None => (0, now),
                };
                let mut next = next_update_after(control, interval, date, CrlKind::Full);
                let min_validity = TimeDelta::seconds(2 * CRL_MIN_VALIDITY_SECONDS);
                while next - now < min_validity && control.interval() > TimeDelta::zero() {
                    next += control.interval();
                }
                Some(next)
            }
            _ => None,
        };

        self.generate_crl(&ca, &control.unwrap_or_default(), CrlKind::Full, next_update)
    }

    fn generate_crl(
        &self,
        ca: &CaInfo,
        control: &CrlControl,
        kind: CrlKind,
        next_update: Option<DateTime<Utc>>,
    ) -> CaResult<CrlInfo> {
        let mut audit = AuditEvent::start("generate_crl", ca.name());
        audit.param("kind", format!("{:?}", kind).to_lowercase());

        let result = self.build_and_sign_crl(ca, control, kind, next_update);
        if let Ok(crl) = &result {
            audit.param("crl_number", crl.crl_number());
        }
        audit.finish(&result);
        result
    }

    fn build_and_sign_crl(
        &self,
        ca: &CaInfo,
        control: &CrlControl,
        kind: CrlKind,
        next_update: Option<DateTime<Utc>>,
    ) -> CaResult<CrlInfo> {
        let store = &self.ctx.store;
        let crl_signer = self
            .ctx
            .crl_signer
            .as_ref()
            .ok_or_else(|| Error::not_permitted("no CRL signer"))?;

        let this_update = Utc::now();
        if let Some(next_update) = next_update {
            if next_update - this_update < TimeDelta::seconds(CRL_MIN_VALIDITY_SECONDS) {
                return Err(Error::crl(format!(
                    "nextUpdate {} is too close to thisUpdate {}",
                    next_update, this_update
                )));
            }
        }

        let base_crl_number = match kind {
            CrlKind::Full => None,
            CrlKind::Delta => Some(
                store
                    .max_full_crl_number()?
                    .ok_or_else(|| Error::crl("no full CRL to base a delta CRL on"))?,
            ),
        };

        // Cache entries added after this point go into the next delta.
        let delta_high_water = match kind {
            CrlKind::Full => store.max_delta_crl_cache_id()?,
            CrlKind::Delta => None,
        };

        let mut entries = match kind {
            CrlKind::Full => self.full_crl_entries(control, this_update)?,
            CrlKind::Delta => self.delta_crl_entries(control, this_update)?,
        };

        let indirect = crl_signer.is_indirect(ca);
        if indirect {
            if let Some(first) = entries.first_mut() {
                first.certificate_issuer = Some(ca.subject().clone());
            }
        }

        let (issuer, authority_key_id) = match crl_signer.certificate() {
            Some(cert) if indirect => (cert.subject().clone(), cert.key_identifier()),
            _ => (ca.subject().clone(), ca.cert().key_identifier()),
        };

        let (only_ca, only_user) = match control.scope {
            CrlScope::CaCertsOnly => (true, false),
            CrlScope::UserCertsOnly => (false, true),
            CrlScope::All => {
                let has_ca = store.has_certs_of_type(true)?;
                let has_user = store.has_certs_of_type(false)?;
                (has_ca && !has_user, has_user && !has_ca)
            }
        };
        let idp = IssuingDistributionPoint {
            only_contains_ca_certs: only_ca,
            only_contains_user_certs: only_user,
            indirect_crl: indirect,
        };

        let freshest_crl = match kind {
            CrlKind::Full if control.delta_enabled() => ca.uris().delta_crl.clone(),
            _ => vec![],
        };

        let certs = match kind {
            CrlKind::Full if control.include_certs => self.crl_certs(control, this_update)?,
            _ => vec![],
        };

        let crl_number = store.next_crl_number()?;
        let tbs = TbsCrl {
            issuer,
            this_update,
            next_update,
            entries,
            crl_number,
            base_crl_number,
            authority_key_id,
            issuing_distribution_point: (!idp.is_empty()).then_some(idp),
            freshest_crl,
            certs,
        };
        let crl = sign_crl(crl_signer, tbs)?;
        let encoded = crl.encode()?;
        let info = CrlInfo::new(&crl, encoded);
        store.add_crl(info.clone())?;

        for publisher in self.publishers() {
            match publisher.crl_added(&info) {
                Ok(true) => {}
                Ok(false) => warn!(
                    "Publisher '{}' declined CRL {}",
                    publisher.name(),
                    info.crl_number()
                ),
                Err(e) => warn!(
                    "Publisher '{}' failed to publish CRL {}: {}",
                    publisher.name(),
                    info.crl_number(),
                    e
                ),
            }
        }

        if let Some(id) = delta_high_water {
            store.clear_delta_crl_cache(id)?;
        }
        let removed = store.cleanup_crls(ca.num_crls())?;
        if removed > 0 {
            debug!("Removed {} old CRLs of CA '{}'", removed, ca.name());
        }

        info!(
            "CA '{}' generated {} CRL {} with {} entries",
            ca.name(),
            if info.is_delta() { "delta" } else { "full" },
            info.crl_number(),
            crl.tbs().entries.len()
        );
        Ok(info)
    }

    fn full_crl_entries(
        &self,
        control: &CrlControl,
        this_update: DateTime<Utc>,
    ) -> CaResult<Vec<RevokedEntry>> {
        let not_expired_before = if control.include_expired_certs {
            DateTime::<Utc>::MIN_UTC
        } else {
            this_update - TimeDelta::seconds(CRL_EXPIRED_CERT_BUFFER_SECONDS)
        };

        let mut entries = vec![];
        let mut after = None;
        loop {
            let batch = self.ctx.store.get_revoked_certs(
                not_expired_before,
                after,
                CRL_ENTRY_BATCH_SIZE,
                control.scope,
            )?;
            let Some(last) = batch.last() else {
                break;
            };
            after = Some(last.serial);
            let done = batch.len() < CRL_ENTRY_BATCH_SIZE;

            entries.extend(batch.into_iter().map(|revoked| RevokedEntry {
                serial: revoked.serial,
                revocation_date: revoked.revocation.revocation_time(),
                reason: revoked.revocation.reason(),
                invalidity_date: revoked.revocation.invalidity_time(),
                certificate_issuer: None,
            }));
            if done {
                break;
            }
        }
        Ok(entries)
    }

    /// Entries for every certificate whose revocation state changed since
    /// the last full CRL. Unrevoked certificates are listed with reason
    /// removeFromCRL.
    fn delta_crl_entries(
        &self,
        control: &CrlControl,
        this_update: DateTime<Utc>,
    ) -> CaResult<Vec<RevokedEntry>> {
        let mut entries = vec![];
        let mut after: Option<Serial> = None;
        loop {
            let serials = self.ctx.store.get_delta_crl_cache(after, CRL_ENTRY_BATCH_SIZE)?;
            let Some(last) = serials.last() else {
                break;
            };
            after = Some(*last);
            let done = serials.len() < CRL_ENTRY_BATCH_SIZE;

            for serial in serials {
                let Some(cert) = self.ctx.store.get_cert_with_revocation_info(serial)? else {
                    continue;
                };
                let in_scope = match control.scope {
                    CrlScope::All => true,
                    CrlScope::CaCertsOnly => cert.cert().is_ca(),
                    CrlScope::UserCertsOnly => !cert.cert().is_ca(),
                };
                if !in_scope {
                    continue;
                }
                let entry = match cert.revocation() {
                    Some(revocation) => RevokedEntry {
                        serial,
                        revocation_date: revocation.revocation_time(),
                        reason: revocation.reason(),
                        invalidity_date: revocation.invalidity_time(),
                        certificate_issuer: None,
                    },
                    None => RevokedEntry {
                        serial,
                        revocation_date: this_update,
                        reason: CrlReason::RemoveFromCrl,
                        invalidity_date: None,
                        certificate_issuer: None,
                    },
                };
                entries.push(entry);
            }
            if done {
                break;
            }
        }
        Ok(entries)
    }

    fn crl_certs(
        &self,
        control: &CrlControl,
        this_update: DateTime<Utc>,
    ) -> CaResult<Vec<CrlCertEntry>> {
        let not_expired_before = if control.include_expired_certs {
            None
        } else {
            Some(this_update)
        };

        let mut certs = vec![];
        let mut after = None;
        loop {
            let batch = self.ctx.store.get_certs(
                after,
                CRL_CERT_BATCH_SIZE,
                not_expired_before,
                control.scope,
            )?;
            let Some(last) = batch.last() else {
                break;
            };
            after = Some(last.serial());
            let done = batch.len() < CRL_CERT_BATCH_SIZE;

            certs.extend(batch.into_iter().map(|cert| CrlCertEntry {
                serial: cert.serial(),
                encoded: cert.encoded().clone(),
            }));
            if done {
                break;
            }
        }
        Ok(certs)
    }
}

fn sign_crl(crl_signer: &CrlSigner, tbs: TbsCrl) -> CaResult<X509Crl> {
    let signer = crl_signer.signer();
    let data = tbs.encode()?;
    let signature = signer.sign(&data)?;

    if !verify_signature(signer.public_key(), signer.algorithm(), &data, &signature)? {
        return Err(Error::system(format!(
            "signature of CRL {} does not verify with the CRL signer key",
            tbs.crl_number
        )));
    }
    Ok(X509Crl::new(tbs, signer.algorithm(), signature))
}


//------------ Tests ---------------------------------------------------------
