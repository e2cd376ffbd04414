//! Issuing certificates through the public engine API.

mod common;

use std::thread;

use chrono::{TimeDelta, TimeZone, Utc};

use caengine::commons::api::{CertificateRequest, DuplicationMode, ValidityMode};
use caengine::commons::ErrorKind;

use common::{name, new_public_key, TestEnv};

#[test]
fn serials_increase_strictly() {
    let env = TestEnv::builder().build();
    let ca_serial = env.ca.info().cert().serial();

    let mut last = ca_serial;
    for i in 0..20 {
        let issued = env
            .ca
            .issue(&env.request("tls", &format!("CN=host{}.example.com", i)))
            .unwrap();
        assert!(issued.serial() > last);
        last = issued.serial();
    }
}

#[test]
fn duplicate_request_returns_earlier_certificate() {
    let env = TestEnv::builder()
        .duplicate_key_mode(DuplicationMode::Forbidden)
        .duplicate_subject_mode(DuplicationMode::Forbidden)
        .build();

    let key = new_public_key();
    let request = CertificateRequest::new("tls", name("CN=www.example.com"), key);

    let first = env.ca.issue(&request).unwrap();
    assert!(!first.already_issued());
    assert_eq!(env.signatures(), 1);

    let second = env.ca.issue(&request).unwrap();
    assert!(second.already_issued());
    assert_eq!(second.serial(), first.serial());
    assert_eq!(env.signatures(), 1);

    // Same subject, other key.
    let err = env.ca.issue(&env.request("tls", "CN=www.example.com")).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::AlreadyIssued);
}

#[test]
fn duplicate_request_with_only_key_forbidden_returns_earlier_certificate() {
    let env = TestEnv::builder()
        .duplicate_key_mode(DuplicationMode::Forbidden)
        .duplicate_subject_mode(DuplicationMode::Permitted)
        .build();

    let request = CertificateRequest::new("tls", name("CN=mixed.example.com"), new_public_key());

    let first = env.ca.issue(&request).unwrap();
    let second = env.ca.issue(&request).unwrap();
    assert!(second.already_issued());
    assert_eq!(second.serial(), first.serial());
    assert_eq!(env.signatures(), 1);

    // Other subject, same key.
    let other = CertificateRequest::new(
        "tls",
        name("CN=other.example.com"),
        request.public_key().clone(),
    );
    let err = env.ca.issue(&other).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::AlreadyIssued);

    // Same subject, other key.
    let third = env.ca.issue(&env.request("tls", "CN=mixed.example.com")).unwrap();
    assert!(!third.already_issued());
    assert_eq!(env.signatures(), 2);
}

#[test]
fn concurrent_duplicate_is_refused_while_pending() {
    let env = TestEnv::builder()
        .duplicate_key_mode(DuplicationMode::Forbidden)
        .duplicate_subject_mode(DuplicationMode::Forbidden)
        .build();
    let request = env.request("tls", "CN=race.example.com");

    env.gate.close();
    thread::scope(|s| {
        let first = s.spawn(|| env.ca.issue(&request));
        env.gate.wait_for_arrival();

        let err = env.ca.issue(&request).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::AlreadyIssued);

        env.gate.open();
        let first = first.join().unwrap().unwrap();
        assert!(!first.already_issued());
    });

    // Once the first request is done, the same request gets its result.
    let again = env.ca.issue(&request).unwrap();
    assert!(again.already_issued());
    assert_eq!(env.signatures(), 1);
}

#[test]
fn cutoff_truncates_to_ca_not_after() {
    let ca_not_after = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
    let env = TestEnv::builder()
        .validity(Utc::now() - TimeDelta::days(1), ca_not_after)
        .max_validity(TimeDelta::days(3650))
        .validity_mode(ValidityMode::Cutoff)
        .build();

    let request = env
        .request("tls", "CN=long.example.com")
        .with_not_after(Utc.with_ymd_and_hms(2031, 1, 1, 0, 0, 0).unwrap());
    let issued = env.ca.issue(&request).unwrap();

    assert_eq!(issued.not_after(), ca_not_after);
    assert!(issued.warning().unwrap().contains("truncated"));
}

#[test]
fn strict_refuses_to_outlive_ca() {
    let env = TestEnv::builder()
        .validity(Utc::now() - TimeDelta::days(1), Utc::now() + TimeDelta::days(30))
        .validity_mode(ValidityMode::Strict)
        .build();

    let err = env.ca.issue(&env.request("tls", "CN=host")).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::NotPermitted);
    assert_eq!(env.signatures(), 0);
}

#[test]
fn lax_keeps_requested_not_after() {
    let ca_not_after = Utc::now() + TimeDelta::days(30);
    let env = TestEnv::builder()
        .validity(Utc::now() - TimeDelta::days(1), ca_not_after)
        .validity_mode(ValidityMode::Lax)
        .build();

    let issued = env.ca.issue(&env.request("tls", "CN=host")).unwrap();
    assert!(issued.not_after() > ca_not_after);
    assert!(issued.warning().is_none());
}

#[test]
fn unknown_profile_is_refused() {
    let env = TestEnv::builder().build();
    let err = env.ca.issue(&env.request("smime", "CN=host")).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::UnknownProfile);
}

#[test]
fn issued_certificate_can_be_read_back() {
    let env = TestEnv::builder().build();
    let issued = env.ca.issue(&env.request("tls", "CN=host,O=Example")).unwrap();

    let stored = env.ca.get_cert(issued.serial()).unwrap().unwrap();
    assert_eq!(stored.subject(), issued.subject());
    assert_eq!(stored.encoded(), issued.encoded());

    let with_info = env.ca.get_cert_with_revocation_info(issued.serial()).unwrap().unwrap();
    assert!(!with_info.is_revoked());
}
