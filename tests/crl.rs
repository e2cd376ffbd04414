//! Full and delta CRL generation.

mod common;

use std::thread;

use chrono::{TimeDelta, Utc};

use caengine::commons::api::{
    CrlControl, CrlIntervalState, CrlReason, CrlUpdateMode, X509Crl,
};
use caengine::commons::ErrorKind;
use caengine::store::CertificateStore;

use common::{name, RecordingPublisher, TestEnv};

fn last_interval_an_hour_ago() -> CrlIntervalState {
    CrlIntervalState {
        last_interval: 0,
        last_interval_date: Some(Utc::now() - TimeDelta::minutes(61)),
    }
}

fn hourly_with_deltas() -> CrlControl {
    CrlControl {
        update_mode: CrlUpdateMode::Interval,
        interval_minutes: 60,
        full_crl_intervals: 4,
        delta_crl_intervals: 1,
        ..Default::default()
    }
}

#[test]
fn crl_numbers_increase_and_deltas_point_at_full_crl() {
    let publisher = RecordingPublisher::new("repo");
    let env = TestEnv::builder()
        .crl_control(hourly_with_deltas())
        .crl_interval(CrlIntervalState {
            last_interval: 0,
            last_interval_date: Some(Utc::now() - TimeDelta::minutes(61)),
        })
        .publisher(publisher.clone())
        .build();

    let gone = env.ca.issue(&env.request("tls", "CN=gone")).unwrap().serial();
    env.ca.revoke_cert(gone, CrlReason::KeyCompromise, None, false).unwrap();

    let full = env.ca.generate_crl_on_demand().unwrap();
    assert!(!full.is_delta());
    assert!(full.next_update().unwrap() > full.this_update());
    let decoded = X509Crl::decode(full.encoded()).unwrap();
    assert_eq!(decoded.tbs().entries.len(), 1);
    assert_eq!(decoded.tbs().entries[0].serial, gone);

    // Changes after the full CRL go into the next delta.
    let held = env.ca.issue(&env.request("tls", "CN=held")).unwrap().serial();
    let revoked = env.ca.issue(&env.request("tls", "CN=revoked")).unwrap().serial();
    env.ca.revoke_cert(held, CrlReason::CertificateHold, None, false).unwrap();
    env.ca.unrevoke_cert(held, false).unwrap();
    env.ca.revoke_cert(revoked, CrlReason::Superseded, None, false).unwrap();

    let delta = env.ca.generate_crl_if_due().unwrap().unwrap();
    assert!(delta.is_delta());
    assert!(delta.crl_number() > full.crl_number());
    assert_eq!(delta.base_crl_number(), Some(full.crl_number()));

    let decoded = X509Crl::decode(delta.encoded()).unwrap();
    let entries = &decoded.tbs().entries;
    assert_eq!(entries.len(), 2);
    let held_entry = entries.iter().find(|e| e.serial == held).unwrap();
    assert_eq!(held_entry.reason, CrlReason::RemoveFromCrl);
    let revoked_entry = entries.iter().find(|e| e.serial == revoked).unwrap();
    assert_eq!(revoked_entry.reason, CrlReason::Superseded);

    // Nothing is due until the next interval.
    assert!(env.ca.generate_crl_if_due().unwrap().is_none());

    assert_eq!(env.ca.get_current_crl().unwrap().unwrap().crl_number(), full.crl_number());
    assert_eq!(
        env.ca.get_current_delta_crl().unwrap().unwrap().crl_number(),
        delta.crl_number()
    );
    assert!(env.ca.get_crl(full.crl_number()).unwrap().is_some());

    let crl_events: Vec<_> = publisher
        .events()
        .into_iter()
        .filter(|e| e.starts_with("crl "))
        .collect();
    assert_eq!(
        crl_events,
        vec![format!("crl {}", full.crl_number()), format!("crl {}", delta.crl_number())]
    );
}

#[test]
fn first_scheduled_crl_is_full() {
    let env = TestEnv::builder().crl_control(hourly_with_deltas()).build();

    let first = env.ca.generate_crl_if_due().unwrap().unwrap();
    assert!(!first.is_delta());
    assert!(env.ca.generate_crl_if_due().unwrap().is_none());

    let state = env.ca.info().crl_interval();
    assert_eq!(state.last_interval, 0);
    assert!(state.last_interval_date.is_some());
}

#[test]
fn on_demand_crl_numbers_increase() {
    let env = TestEnv::builder().build();

    let mut last = None;
    for _ in 0..5 {
        let crl = env.ca.generate_crl_on_demand().unwrap();
        assert!(!crl.is_delta());
        assert!(crl.next_update().is_none());
        if let Some(last) = last {
            assert!(crl.crl_number() > last);
        }
        last = Some(crl.crl_number());
    }
}

#[test]
fn non_interval_crl_control_is_not_scheduled() {
    let env = TestEnv::builder()
        .crl_control(CrlControl {
            update_mode: CrlUpdateMode::OnDemand,
            ..Default::default()
        })
        .build();

    assert!(env.ca.generate_crl_if_due().unwrap().is_none());
    let crl = env.ca.generate_crl_on_demand().unwrap();
    assert!(crl.next_update().is_none());
}

#[test]
fn unknown_revocation_target_is_reported() {
    let env = TestEnv::builder().build();
    let serial = env.ca.issue(&env.request("tls", "CN=host")).unwrap().serial();
    env.ca.remove_cert(serial).unwrap();

    let err = env
        .ca
        .revoke_cert(serial, CrlReason::KeyCompromise, None, false)
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::UnknownCert);
}

#[test]
fn failed_signature_does_not_use_up_crl_number() {
    let env = TestEnv::builder().build();
    let first = env.ca.generate_crl_on_demand().unwrap();

    env.set_signer_failing(true);
    assert!(env.ca.generate_crl_on_demand().is_err());
    assert!(env.ca.generate_crl_on_demand().is_err());

    env.set_signer_failing(false);
    let second = env.ca.generate_crl_on_demand().unwrap();
    assert_eq!(second.crl_number().as_u64(), first.crl_number().as_u64() + 1);
    assert_eq!(
        env.ca.get_current_crl().unwrap().unwrap().crl_number(),
        second.crl_number()
    );
}

#[test]
fn on_demand_crl_is_refused_while_generation_runs() {
    let env = TestEnv::builder().build();

    env.gate.close();
    thread::scope(|s| {
        let running = s.spawn(|| env.ca.generate_crl_on_demand());
        env.gate.wait_for_arrival();

        let err = env.ca.generate_crl_on_demand().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::SystemUnavailable);

        env.gate.open();
        running.join().unwrap().unwrap();
    });

    // The flag is released again.
    env.ca.generate_crl_on_demand().unwrap();
}

#[test]
fn revocation_during_full_crl_goes_into_next_delta() {
    let env = TestEnv::builder()
        .crl_control(hourly_with_deltas())
        .crl_interval(last_interval_an_hour_ago())
        .build();

    let early = env.ca.issue(&env.request("tls", "CN=early")).unwrap().serial();
    let late = env.ca.issue(&env.request("tls", "CN=late")).unwrap().serial();
    env.ca.revoke_cert(early, CrlReason::KeyCompromise, None, false).unwrap();

    env.gate.close();
    let full = thread::scope(|s| {
        let full = s.spawn(|| env.ca.generate_crl_on_demand());
        env.gate.wait_for_arrival();

        env.ca.revoke_cert(late, CrlReason::Superseded, None, false).unwrap();

        env.gate.open();
        full.join().unwrap().unwrap()
    });

    let decoded = X509Crl::decode(full.encoded()).unwrap();
    let serials: Vec<_> = decoded.tbs().entries.iter().map(|e| e.serial).collect();
    assert_eq!(serials, vec![early]);
    assert_eq!(env.store.get_delta_crl_cache(None, 10).unwrap(), vec![late]);

    let delta = env.ca.generate_crl_if_due().unwrap().unwrap();
    assert!(delta.is_delta());
    let decoded = X509Crl::decode(delta.encoded()).unwrap();
    let serials: Vec<_> = decoded.tbs().entries.iter().map(|e| e.serial).collect();
    assert_eq!(serials, vec![late]);
}

#[test]
fn indirect_crl_names_the_ca_and_the_crl_signer_key() {
    let env = TestEnv::builder().indirect_crl_signer().build();
    let crl_signer_cert = env.crl_signer_cert.clone().unwrap();

    let revoked: Vec<_> = (0..3)
        .map(|i| {
            let serial = env
                .ca
                .issue(&env.request("tls", &format!("CN=host{}", i)))
                .unwrap()
                .serial();
            env.ca.revoke_cert(serial, CrlReason::KeyCompromise, None, false).unwrap();
            serial
        })
        .collect();

    let crl = env.ca.generate_crl_on_demand().unwrap();
    let decoded = X509Crl::decode(crl.encoded()).unwrap();
    let tbs = decoded.tbs();

    assert_eq!(tbs.issuer, name("CN=CRL Signer,O=Example"));
    assert_eq!(tbs.authority_key_id, crl_signer_cert.key_identifier());
    assert_ne!(tbs.authority_key_id, env.ca.info().cert().key_identifier());
    assert!(tbs.issuing_distribution_point.as_ref().unwrap().indirect_crl);

    assert_eq!(tbs.entries.len(), revoked.len());
    assert_eq!(
        tbs.entries[0].certificate_issuer.as_ref(),
        Some(env.ca.info().subject())
    );
    assert!(tbs.entries[1..].iter().all(|e| e.certificate_issuer.is_none()));
}

#[test]
fn crl_can_carry_issued_certificates() {
    let env = TestEnv::builder()
        .crl_control(CrlControl {
            update_mode: CrlUpdateMode::OnDemand,
            include_certs: true,
            ..Default::default()
        })
        .build();

    let kept = env.ca.issue(&env.request("tls", "CN=kept")).unwrap().serial();
    let revoked = env.ca.issue(&env.request("tls", "CN=revoked")).unwrap().serial();
    env.ca.revoke_cert(revoked, CrlReason::Superseded, None, false).unwrap();

    let crl = env.ca.generate_crl_on_demand().unwrap();
    let decoded = X509Crl::decode(crl.encoded()).unwrap();
    let certs: Vec<_> = decoded.tbs().certs.iter().map(|c| c.serial).collect();
    assert!(certs.contains(&kept));
    assert!(certs.contains(&revoked));
    assert!(decoded.tbs().certs.iter().all(|c| !c.encoded.is_empty()));

    // Without the option nothing is carried.
    let env = TestEnv::builder().build();
    env.ca.issue(&env.request("tls", "CN=plain")).unwrap();
    let crl = env.ca.generate_crl_on_demand().unwrap();
    assert!(X509Crl::decode(crl.encoded()).unwrap().tbs().certs.is_empty());
}

#[test]
fn unsaved_crl_interval_is_still_advanced() {
    let dir = tempfile::tempdir().unwrap();
    let env = TestEnv::builder()
        .crl_control(hourly_with_deltas())
        .crl_state_dir(dir.path().join("missing"))
        .build();

    let first = env.ca.generate_crl_if_due().unwrap().unwrap();
    assert!(!first.is_delta());

    let state = env.ca.info().crl_interval();
    assert_eq!(state.last_interval, 0);
    assert!(state.last_interval_date.is_some());

    // The CA does not generate the same interval twice.
    assert!(env.ca.generate_crl_if_due().unwrap().is_none());
    assert_eq!(env.ca.get_current_crl().unwrap().unwrap().crl_number(), first.crl_number());
}
