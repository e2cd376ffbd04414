//! Certificate issuance.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use log::{debug, info, warn};

use crate::commons::api::{
    oid, CaInfo, CaStatus, Certificate, CertificateRequest, DuplicationMode,
    Extension, ExtensionValue, Fingerprint, IssuedCertificate, Permission,
    RdnType, TbsCertificate, Validity, ValidityMode, X500Name,
};
use crate::commons::crypto::verify_signature;
use crate::commons::{CaResult, Error};
use crate::profile::{CertProfile, SerialNumberMode};
use crate::store::IssuedQuery;

use super::{AuditEvent, X509Ca};


//------------ PendingRequestRegistry ----------------------------------------

/// Subject and key fingerprints of requests currently being issued.
///
/// Every check-then-insert happens under one mutex. Entries are released
/// when the [`PendingGuard`] returned by `register` is dropped.
#[derive(Debug, Default)]
pub struct PendingRequestRegistry {
    inner: Mutex<PendingRequests>,
}

#[derive(Debug, Default)]
struct PendingRequests {
    subjects: HashMap<Fingerprint, Vec<String>>,
    keys: HashMap<Fingerprint, Vec<String>>,
}

impl PendingRequests {
    fn conflicts(
        map: &HashMap<Fingerprint, Vec<String>>,
        fingerprint: Fingerprint,
        mode: DuplicationMode,
        profile: &str,
    ) -> bool {
        let Some(profiles) = map.get(&fingerprint) else {
            return false;
        };
        match mode {
            DuplicationMode::Permitted => false,
            DuplicationMode::Forbidden => !profiles.is_empty(),
            DuplicationMode::ForbiddenWithinProfile => {
                profiles.iter().any(|p| p == profile)
            }
        }
    }

    fn remove(
        map: &mut HashMap<Fingerprint, Vec<String>>,
        fingerprint: Fingerprint,
        profile: &str,
    ) {
        if let Some(profiles) = map.get_mut(&fingerprint) {
            if let Some(pos) = profiles.iter().position(|p| p == profile) {
                profiles.swap_remove(pos);
            }
            if profiles.is_empty() {
                map.remove(&fingerprint);
            }
        }
    }
}

impl PendingRequestRegistry {
    pub fn register(
        &self,
        subject: Fingerprint,
        subject_mode: DuplicationMode,
        key: Fingerprint,
        key_mode: DuplicationMode,
        profile: &str,
    ) -> CaResult<PendingGuard<'_>> {
        let mut pending = self.inner.lock().expect("poisoned lock");
        if PendingRequests::conflicts(&pending.subjects, subject, subject_mode, profile) {
            return Err(Error::already_issued(
                "a certificate for the same subject is being issued",
            ));
        }
        if PendingRequests::conflicts(&pending.keys, key, key_mode, profile) {
            return Err(Error::already_issued(
                "a certificate for the same public key is being issued",
            ));
        }
        pending.subjects.entry(subject).or_default().push(profile.to_string());
        pending.keys.entry(key).or_default().push(profile.to_string());

        Ok(PendingGuard {
            registry: self,
            subject,
            key,
            profile: profile.to_string(),
        })
    }

    pub fn is_empty(&self) -> bool {
        let pending = self.inner.lock().expect("poisoned lock");
        pending.subjects.is_empty() && pending.keys.is_empty()
    }

    fn release(&self, subject: Fingerprint, key: Fingerprint, profile: &str) {
        let mut pending = self.inner.lock().expect("poisoned lock");
        PendingRequests::remove(&mut pending.subjects, subject, profile);
        PendingRequests::remove(&mut pending.keys, key, profile);
    }
}


//------------ PendingGuard --------------------------------------------------

pub struct PendingGuard<'a> {
    registry: &'a PendingRequestRegistry,
    subject: Fingerprint,
    key: Fingerprint,
    profile: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(self.subject, self.key, &self.profile);
    }
}


//------------ Issuance ------------------------------------------------------

/// The duplication mode in effect for a profile.
fn effective_mode(profile_permits: bool, ca_mode: DuplicationMode) -> DuplicationMode {
    if profile_permits {
        DuplicationMode::Permitted
    } else {
        ca_mode
    }
}

/// The notBefore of a new certificate.
///
/// A requested notBefore in the past is replaced by `now`. The result never
/// lies before the CA's own notBefore.
pub(crate) fn effective_not_before(
    ca: &CaInfo,
    profile: &dyn CertProfile,
    requested: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let ca_not_before = ca.validity().not_before();
    let not_before = match requested {
        Some(requested) if requested > now => requested,
        _ => now,
    }
    .max(ca_not_before);

    if profile.has_midnight_not_before() {
        let midnight = not_before.date_naive().and_time(NaiveTime::MIN).and_utc();
        if midnight < ca_not_before {
            midnight + TimeDelta::days(1)
        } else {
            midnight
        }
    } else {
        not_before
    }
}

/// The notAfter of a new certificate and an optional warning.
pub(crate) fn effective_not_after(
    ca: &CaInfo,
    profile: &dyn CertProfile,
    not_before: DateTime<Utc>,
    requested: Option<DateTime<Utc>>,
    hard_max: Option<DateTime<Utc>>,
) -> CaResult<(DateTime<Utc>, Option<String>)> {
    let validity = match profile.validity() {
        Some(validity) => validity.min(ca.max_validity()),
        None => ca.max_validity(),
    };

    let mut not_after = not_before + validity;
    if let Some(requested) = requested {
        if requested <= not_before {
            return Err(Error::bad_template("notAfter must be later than notBefore"));
        }
        not_after = not_after.min(requested);
    }
    let unclamped = not_after;

    if let Some(hard_max) = hard_max {
        not_after = not_after.min(hard_max);
    }

    let mut warning = None;
    let ca_not_after = ca.validity().not_after();
    if not_after > ca_not_after {
        match ca.validity_mode() {
            ValidityMode::Cutoff => {
                not_after = ca_not_after;
                warning = Some(format!(
                    "notAfter truncated to the notAfter of the CA ({})",
                    ca_not_after.format("%Y-%m-%dT%H:%M:%SZ")
                ));
            }
            ValidityMode::Strict => {
                return Err(Error::not_permitted(
                    "notAfter would lie after the notAfter of the CA",
                ));
            }
            ValidityMode::Lax => {}
        }
    }

    if profile.has_midnight_not_before() && not_after != unclamped {
        let day_before = (not_after - TimeDelta::days(1)).date_naive();
        if let Some(end_of_day) = day_before.and_hms_opt(23, 59, 59) {
            not_after = end_of_day.and_utc();
        }
    }

    if not_after <= not_before {
        return Err(Error::not_permitted("no validity left for the certificate"));
    }
    Ok((not_after, warning))
}

fn join_warnings(warnings: Vec<String>) -> Option<String> {
    if warnings.is_empty() {
        None
    } else {
        Some(warnings.join("; "))
    }
}

impl X509Ca {
    /// Issues a certificate.
    ///
    /// If the same subject, key and profile were issued before and
    /// duplicates of neither are permitted, the earlier certificate is
    /// returned marked as already issued.
    pub fn issue(&self, request: &CertificateRequest) -> CaResult<IssuedCertificate> {
        let mut audit = AuditEvent::start("issue_cert", &self.name());
        audit.param("profile", request.profile());
        audit.param("subject", request.subject());
        audit.param("key_id", hex::encode(request.public_key().key_identifier()));
        if let Some(requestor) = request.requestor() {
            audit.param("requestor", requestor);
        }

        let result = self.issue_internal(request);
        if let Ok(issued) = &result {
            audit.param("serial", issued.serial());
            audit.param("already_issued", issued.already_issued());
        }
        audit.finish(&result);
        result
    }

    fn issue_internal(&self, request: &CertificateRequest) -> CaResult<IssuedCertificate> {
        self.check_master()?;

        // Counted before the status check so that republishing, which
        // sets the CA inactive and then waits for this count to drop to
        // zero, cannot miss us.
        let _in_flight = self.in_flight();

        let ca = self.info();
        ca.check_permission(Permission::EnrollCert)?;
        if ca.status() != CaStatus::Active {
            return Err(Error::not_permitted(format!("CA '{}' is not active", ca.name())));
        }
        if ca.revocation().is_some() {
            return Err(Error::not_permitted(format!("CA '{}' is revoked", ca.name())));
        }

        let profile = self
            .ctx
            .profiles
            .get(request.profile())
            .ok_or_else(|| Error::UnknownProfile(request.profile().to_string()))?;
        if profile.is_ra_only() && !request.is_ra_origin() {
            return Err(Error::not_permitted(format!(
                "profile '{}' is only available to registration authorities",
                profile.name()
            )));
        }

        let requested_subject = request.subject().normalize();
        if requested_subject.is_empty() {
            return Err(Error::bad_template("empty subject"));
        }
        if requested_subject.contains(&RdnType::SerialNumber)
            && profile.serial_number_mode() == SerialNumberMode::Denied
        {
            return Err(Error::bad_template("subject must not contain a serialNumber"));
        }

        let now = Utc::now();
        let not_before = effective_not_before(&ca, profile.as_ref(), request.not_before(), now);
        if let Some(cutoff) = ca.no_new_certificate_after() {
            if not_before > cutoff {
                return Err(Error::not_permitted(format!(
                    "CA '{}' does not issue certificates after {}",
                    ca.name(),
                    cutoff
                )));
            }
        }

        profile.check_public_key(request.public_key())?;

        let mut subject = requested_subject.clone();
        let mut hard_max = None;
        if let Some(special) = profile.special_behavior() {
            let cn = requested_subject
                .common_name()
                .ok_or_else(|| Error::bad_template("subject has no common name"))?;
            let first = self
                .ctx
                .store
                .earliest_not_before(cn, profile.name())?
                .unwrap_or(not_before);
            hard_max = Some(first + special.max_lifetime);
            let suffixed = format!("{}-{}", cn, first.format("%Y%m%d"));
            subject = subject.with_replaced(&RdnType::CommonName, &suffixed);
        }

        let granted = profile.grant_subject(&subject)?;
        let mut warnings: Vec<String> = granted.warning.into_iter().collect();
        let mut subject = granted.value;
        if subject.fingerprint() == ca.subject().fingerprint() {
            return Err(Error::already_issued(
                "the granted subject is the subject of the CA",
            ));
        }

        let key = request.public_key().fingerprint();
        let key_mode = effective_mode(profile.duplicate_key_permitted(), ca.duplicate_key_mode());
        let subject_mode =
            effective_mode(profile.duplicate_subject_permitted(), ca.duplicate_subject_mode());

        if let Some(existing) =
            self.find_existing(&subject, key, key_mode, subject_mode, profile.as_ref())?
        {
            return Ok(existing);
        }
        self.check_key_duplication(key, key_mode, profile.name())?;
        subject = self.check_subject_duplication(subject, subject_mode, profile.as_ref(), &ca)?;

        let _pending = self.ctx.pending.register(
            subject.fingerprint(),
            subject_mode,
            key,
            key_mode,
            profile.name(),
        )?;

        // Another request may have finished between the checks above and
        // the registration.
        if let Some(existing) =
            self.find_existing(&subject, key, key_mode, subject_mode, profile.as_ref())?
        {
            return Ok(existing);
        }
        self.check_key_duplication(key, key_mode, profile.name())?;
        self.check_subject_unique(&subject, subject_mode, profile.name())?;

        let (not_after, validity_warning) = effective_not_after(
            &ca,
            profile.as_ref(),
            not_before,
            request.not_after(),
            hard_max,
        )?;
        warnings.extend(validity_warning);

        let (extensions, extension_warning) =
            self.build_extensions(&ca, profile.as_ref(), &subject, request)?;
        warnings.extend(extension_warning);

        let serial = self.ctx.store.next_serial()?;
        let tbs = TbsCertificate::new(
            serial,
            ca.subject().clone(),
            subject,
            Validity::new(not_before, not_after),
            request.public_key().clone(),
            extensions,
        );
        let certificate = self.sign_certificate(&ca, tbs)?;

        let issued = IssuedCertificate::new(
            certificate,
            profile.name(),
            requested_subject,
            request.requestor().map(str::to_string),
            profile.is_ca(),
        )?
        .with_warning(join_warnings(warnings));

        self.publish_certificate(&issued)?;
        info!(
            "CA '{}' issued certificate {} for '{}'",
            ca.name(),
            issued.serial(),
            issued.subject()
        );
        Ok(issued)
    }

    /// Returns an earlier certificate for the same subject, key and profile
    /// unless both duplicate keys and duplicate subjects are permitted.
    fn find_existing(
        &self,
        subject: &X500Name,
        key: Fingerprint,
        key_mode: DuplicationMode,
        subject_mode: DuplicationMode,
        profile: &dyn CertProfile,
    ) -> CaResult<Option<IssuedCertificate>> {
        if key_mode == DuplicationMode::Permitted && subject_mode == DuplicationMode::Permitted {
            return Ok(None);
        }
        let query = IssuedQuery {
            subject: Some(subject.fingerprint()),
            key: Some(key),
            profile: Some(profile.name()),
        };
        let Some(existing) = self.ctx.store.find_issued(query)? else {
            return Ok(None);
        };
        match existing.revocation() {
            None => {
                debug!(
                    "Returning already issued certificate {} for '{}'",
                    existing.cert().serial(),
                    subject
                );
                Ok(Some(existing.into_cert().mark_already_issued()))
            }
            Some(revocation) => {
                if key_mode == DuplicationMode::Forbidden {
                    Err(Error::already_issued(format!(
                        "certificate {} for this key exists and is revoked",
                        existing.cert().serial()
                    )))
                } else {
                    Err(Error::CertRevoked(existing.cert().serial(), revocation.reason()))
                }
            }
        }
    }

    fn check_key_duplication(
        &self,
        key: Fingerprint,
        mode: DuplicationMode,
        profile: &str,
    ) -> CaResult<()> {
        let query = match mode {
            DuplicationMode::Permitted => return Ok(()),
            DuplicationMode::Forbidden => IssuedQuery { key: Some(key), ..Default::default() },
            DuplicationMode::ForbiddenWithinProfile => IssuedQuery {
                key: Some(key),
                profile: Some(profile),
                ..Default::default()
            },
        };
        match self.ctx.store.find_issued(query)? {
            None => Ok(()),
            Some(existing) => Err(Error::already_issued(format!(
                "certificate {} was already issued for this public key",
                existing.cert().serial()
            ))),
        }
    }

    fn subject_taken(
        &self,
        subject: &X500Name,
        mode: DuplicationMode,
        profile: &str,
    ) -> CaResult<Option<IssuedCertificate>> {
        let query = match mode {
            DuplicationMode::Permitted => return Ok(None),
            DuplicationMode::Forbidden => IssuedQuery {
                subject: Some(subject.fingerprint()),
                ..Default::default()
            },
            DuplicationMode::ForbiddenWithinProfile => IssuedQuery {
                subject: Some(subject.fingerprint()),
                profile: Some(profile),
                ..Default::default()
            },
        };
        Ok(self.ctx.store.find_issued(query)?.map(|c| c.into_cert()))
    }

    fn check_subject_unique(
        &self,
        subject: &X500Name,
        mode: DuplicationMode,
        profile: &str,
    ) -> CaResult<()> {
        match self.subject_taken(subject, mode, profile)? {
            None => Ok(()),
            Some(existing) => Err(Error::already_issued(format!(
                "certificate {} was already issued for subject '{}'",
                existing.serial(),
                subject
            ))),
        }
    }

    /// Returns the subject to issue for, which may carry an added
    /// serialNumber RDN if the profile auto-increments it.
    fn check_subject_duplication(
        &self,
        subject: X500Name,
        mode: DuplicationMode,
        profile: &dyn CertProfile,
        ca: &CaInfo,
    ) -> CaResult<X500Name> {
        if self.subject_taken(&subject, mode, profile.name())?.is_none() {
            return Ok(subject);
        }
        if profile.serial_number_mode() != SerialNumberMode::AutoIncrement {
            return self.check_subject_unique(&subject, mode, profile.name()).map(|_| subject);
        }

        let attempts = ca.serial_increment_max_attempts();
        for increment in 1..=attempts {
            let candidate = if subject.contains(&RdnType::SerialNumber) {
                subject.with_replaced(&RdnType::SerialNumber, &increment.to_string())
            } else {
                subject.with_rdn(RdnType::SerialNumber, increment.to_string())
            };
            if self.subject_taken(&candidate, mode, profile.name())?.is_none() {
                debug!("Using subject '{}' after {} increments", candidate, increment);
                return Ok(candidate);
            }
        }
        Err(Error::already_issued(format!(
            "no unique subject for '{}' after {} serialNumber increments",
            subject, attempts
        )))
    }

    /// The engine produced extensions followed by those of the profile.
    fn build_extensions(
        &self,
        ca: &CaInfo,
        profile: &dyn CertProfile,
        subject: &X500Name,
        request: &CertificateRequest,
    ) -> CaResult<(Vec<Extension>, Option<String>)> {
        let mut extensions: Vec<Extension> = vec![];
        let uris = ca.uris();

        for control in profile.extension_controls() {
            let value = match control.oid.as_str() {
                oid::SUBJECT_KEY_IDENTIFIER => {
                    Some(ExtensionValue::KeyIdentifier(request.public_key().key_identifier()))
                }
                oid::AUTHORITY_KEY_IDENTIFIER => {
                    Some(ExtensionValue::KeyIdentifier(ca.cert().key_identifier()))
                }
                oid::AUTHORITY_INFO_ACCESS => {
                    let access: Vec<String> = uris
                        .ocsp
                        .iter()
                        .map(|uri| format!("ocsp:{}", uri))
                        .chain(uris.ca_issuers.iter().map(|uri| format!("caIssuers:{}", uri)))
                        .collect();
                    (!access.is_empty()).then_some(ExtensionValue::Uris(access))
                }
                oid::CRL_DISTRIBUTION_POINTS => {
                    (!uris.crl.is_empty()).then(|| ExtensionValue::Uris(uris.crl.clone()))
                }
                oid::FRESHEST_CRL => (!uris.delta_crl.is_empty())
                    .then(|| ExtensionValue::Uris(uris.delta_crl.clone())),
                oid::ISSUER_ALT_NAME => (!ca.issuer_alt_names().is_empty())
                    .then(|| ExtensionValue::Names(ca.issuer_alt_names().to_vec())),
                _ => None,
            };

            match value {
                Some(value) => {
                    extensions.push(Extension::new(control.oid.clone(), control.critical, value))
                }
                None if control.required => {
                    return Err(Error::invalid_extension(format!(
                        "required extension {} cannot be produced",
                        control.oid
                    )));
                }
                None => {}
            }
        }

        for (ext_oid, value) in [
            (oid::SUBJECT_KEY_IDENTIFIER, request.public_key().key_identifier()),
            (oid::AUTHORITY_KEY_IDENTIFIER, ca.cert().key_identifier()),
        ] {
            if !extensions.iter().any(|ext| ext.oid().as_str() == ext_oid) {
                extensions.push(Extension::new(ext_oid, false, ExtensionValue::KeyIdentifier(value)));
            }
        }

        let granted = profile.extensions_for(subject, request.extensions())?;
        for ext in granted.value {
            if extensions.iter().any(|existing| existing.oid() == ext.oid()) {
                return Err(Error::invalid_extension(format!(
                    "extension {} is present more than once",
                    ext.oid()
                )));
            }
            extensions.push(ext);
        }

        Ok((extensions, granted.warning))
    }

    /// Signs with a borrowed signer and checks the result against the CA
    /// key before accepting it.
    fn sign_certificate(&self, ca: &CaInfo, tbs: TbsCertificate) -> CaResult<Certificate> {
        let data = tbs.encode()?;
        let signature = self.ctx.signer.sign(&data)?;
        let algorithm = self.ctx.signer.algorithm();

        if !verify_signature(ca.cert().public_key(), algorithm, &data, &signature)? {
            warn!(
                "Signature of certificate {} does not verify with the key of CA '{}'",
                tbs.serial(),
                ca.name()
            );
            return Err(Error::system(format!(
                "signature of certificate {} does not verify with the CA key",
                tbs.serial()
            )));
        }

        Ok(Certificate::new(tbs, algorithm, signature))
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use chrono::TimeZone;

    use super::*;
    use crate::commons::api::{CaName, CaStatus};
    use crate::commons::test;
    use crate::commons::ErrorKind;
    use crate::profile::ConfiguredProfile;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint::of(s.as_bytes())
    }

    #[test]
    fn pending_registry_detects_in_flight_duplicates() {
        let registry = PendingRequestRegistry::default();
        let forbidden = DuplicationMode::Forbidden;

        let guard = registry
            .register(fp("subject"), forbidden, fp("key"), forbidden, "tls")
            .unwrap();

        let err = registry
            .register(fp("subject"), forbidden, fp("other"), forbidden, "smime")
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::AlreadyIssued);

        // within profile only conflicts for the same profile
        let within = DuplicationMode::ForbiddenWithinProfile;
        let other = registry
            .register(fp("other"), within, fp("key"), within, "smime")
            .unwrap();
        drop(other);

        drop(guard);
        assert!(registry.is_empty());
        assert!(
            registry
                .register(fp("subject"), forbidden, fp("key"), forbidden, "tls")
                .is_ok()
        );
    }

    fn ca_info(not_before: DateTime<Utc>, not_after: DateTime<Utc>, mode: ValidityMode) -> CaInfo {
        let ca = test::test_ca_cert(not_before, not_after);
        CaInfo::new(CaName::from("test"), ca)
            .with_max_validity(TimeDelta::days(3650))
            .with_validity_mode(mode)
    }

    #[test]
    fn not_before_is_clamped_and_snapped() {
        let ca_start = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let ca_end = Utc.with_ymd_and_hms(2036, 1, 1, 0, 0, 0).unwrap();
        let ca = ca_info(ca_start, ca_end, ValidityMode::Strict);

        let mut profile = ConfiguredProfile::named("tls");
        let before_ca = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        assert_eq!(effective_not_before(&ca, &profile, None, before_ca), ca_start);

        let now = Utc.with_ymd_and_hms(2026, 3, 5, 14, 30, 0).unwrap();
        let future = Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap();
        let past = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        assert_eq!(effective_not_before(&ca, &profile, Some(future), now), future);
        assert_eq!(effective_not_before(&ca, &profile, Some(past), now), now);

        profile.not_before_midnight = true;
        assert_eq!(
            effective_not_before(&ca, &profile, None, now),
            Utc.with_ymd_and_hms(2026, 3, 5, 0, 0, 0).unwrap()
        );
        // midnight before the CA starts moves to the next day
        assert_eq!(
            effective_not_before(&ca, &profile, None, before_ca),
            Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn not_after_follows_validity_mode() {
        let ca_start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let ca_end = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let not_before = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap();
        let requested = Utc.with_ymd_and_hms(2031, 1, 1, 0, 0, 0).unwrap();
        let profile = ConfiguredProfile::named("tls");

        let cutoff = ca_info(ca_start, ca_end, ValidityMode::Cutoff);
        let (not_after, warning) =
            effective_not_after(&cutoff, &profile, not_before, Some(requested), None).unwrap();
        assert_eq!(not_after, ca_end);
        assert!(warning.is_some());

        let strict = ca_info(ca_start, ca_end, ValidityMode::Strict);
        let err = effective_not_after(&strict, &profile, not_before, Some(requested), None)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotPermitted);

        let lax = ca_info(ca_start, ca_end, ValidityMode::Lax);
        let (not_after, warning) =
            effective_not_after(&lax, &profile, not_before, Some(requested), None).unwrap();
        assert_eq!(not_after, requested);
        assert!(warning.is_none());
    }

    #[test]
    fn not_after_clamped_to_hard_max_and_resnapped() {
        let ca_start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let ca_end = Utc.with_ymd_and_hms(2040, 1, 1, 0, 0, 0).unwrap();
        let ca = ca_info(ca_start, ca_end, ValidityMode::Strict);

        let mut profile = ConfiguredProfile::named("tls");
        profile.validity_days = Some(365);
        profile.not_before_midnight = true;

        let not_before = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap();
        let hard_max = Utc.with_ymd_and_hms(2027, 6, 1, 12, 0, 0).unwrap();
        let (not_after, _) =
            effective_not_after(&ca, &profile, not_before, None, Some(hard_max)).unwrap();
        assert_eq!(not_after, Utc.with_ymd_and_hms(2027, 5, 31, 23, 59, 59).unwrap());
    }

    #[test]
    fn requested_not_after_before_not_before_is_rejected() {
        let ca_start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let ca_end = Utc.with_ymd_and_hms(2040, 1, 1, 0, 0, 0).unwrap();
        let ca = ca_info(ca_start, ca_end, ValidityMode::Strict);
        let profile = ConfiguredProfile::named("tls");

        let not_before = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap();
        let err = effective_not_after(&ca, &profile, not_before, Some(ca_start), None)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::BadCertTemplate);
    }

    #[test]
    fn ca_subject_is_never_granted() {
        let env = test::TestCa::builder().build();
        let ca_subject = env.ca.info().subject().to_string();
        let request = env.request("tls", &ca_subject);

        let err = env.ca.issue(&request).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::AlreadyIssued);
    }

    #[test]
    fn inactive_ca_does_not_issue() {
        let env = test::TestCa::builder().build();
        env.ca.set_status(CaStatus::Inactive);
        let err = env.ca.issue(&env.request("tls", "CN=host")).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotPermitted);
    }

    #[test]
    fn auto_increment_serial_number() {
        let mut profile = ConfiguredProfile::named("device");
        profile.serial_number = SerialNumberMode::AutoIncrement;

        let env = test::TestCa::builder()
            .profile(profile)
            .duplicate_subject_mode(DuplicationMode::Forbidden)
            .build();

        let first = env.ca.issue(&env.request("device", "CN=sensor")).unwrap();
        let second = env.ca.issue(&env.request("device", "CN=sensor")).unwrap();
        let third = env.ca.issue(&env.request("device", "CN=sensor")).unwrap();

        assert_eq!(first.subject(), &X500Name::from_str("CN=sensor").unwrap());
        assert_eq!(second.subject(), &X500Name::from_str("CN=sensor,SERIALNUMBER=1").unwrap());
        assert_eq!(third.subject(), &X500Name::from_str("CN=sensor,SERIALNUMBER=2").unwrap());
        assert_eq!(
            second.requested_subject(),
            &X500Name::from_str("CN=sensor").unwrap()
        );
    }

    #[test]
    fn special_behavior_limits_lifetime_and_suffixes_cn() {
        let mut profile = ConfiguredProfile::named("short");
        profile.max_lifetime_days = Some(30);
        profile.validity_days = Some(365);

        let env = test::TestCa::builder().profile(profile).build();
        let issued = env.ca.issue(&env.request("short", "CN=box")).unwrap();

        let validity = issued.validity();
        let suffix = validity.not_before().format("%Y%m%d").to_string();
        assert_eq!(issued.subject().common_name(), Some(format!("box-{}", suffix).as_str()));
        assert!(validity.not_after() <= validity.not_before() + TimeDelta::days(30));
    }

    #[test]
    fn serial_number_rdn_needs_permission() {
        let env = test::TestCa::builder().build();
        let err = env
            .ca
            .issue(&env.request("tls", "CN=host,SERIALNUMBER=7"))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::BadCertTemplate);
    }

    #[test]
    fn required_extension_without_uris_fails() {
        let mut profile = ConfiguredProfile::named("ocsp");
        profile.extensions.push(crate::profile::ExtensionControl::new(
            oid::ISSUER_ALT_NAME,
            false,
            true,
        ));
        let env = test::TestCa::builder().profile(profile).build();

        let err = env.ca.issue(&env.request("ocsp", "CN=host")).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidExtension);
    }
}
