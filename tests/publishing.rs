//! The publish queue and republishing.

mod common;

use std::thread;
use std::time::Duration;

use caengine::commons::api::{CaStatus, CrlReason};
use caengine::commons::ErrorKind;
use caengine::store::CertificateStore;

use common::{RecordingPublisher, TestEnv};

fn queued(env: &TestEnv, publisher: &str) -> usize {
    env.store.get_publish_queue_entries(publisher, 1000).unwrap().len()
}

#[test]
fn asynchronous_publisher_is_served_from_queue() {
    let publisher = RecordingPublisher::asynchronous("ldap");
    let env = TestEnv::builder().publisher(publisher.clone()).build();

    let first = env.ca.issue(&env.request("tls", "CN=one")).unwrap().serial();
    let second = env.ca.issue(&env.request("tls", "CN=two")).unwrap().serial();
    env.ca.revoke_cert(second, CrlReason::Superseded, None, false).unwrap();
    assert!(publisher.events().is_empty());
    assert_eq!(queued(&env, "ldap"), 2);

    env.ca.publish_certs_in_queue().unwrap();
    assert_eq!(
        publisher.events(),
        vec![format!("added {}", first), format!("revoked {}", second)]
    );
    assert_eq!(queued(&env, "ldap"), 0);
}

#[test]
fn failed_notifications_are_retried() {
    let publisher = RecordingPublisher::new("ocsp");
    let env = TestEnv::builder().publisher(publisher.clone()).build();

    publisher.set_failing(true);
    let serial = env.ca.issue(&env.request("tls", "CN=host")).unwrap().serial();
    assert_eq!(queued(&env, "ocsp"), 1);

    // Still failing: the entry stays.
    env.ca.publish_certs_in_queue().unwrap();
    assert_eq!(queued(&env, "ocsp"), 1);

    // Unhealthy publishers are not tried at all.
    publisher.set_failing(false);
    publisher.set_healthy(false);
    env.ca.publish_certs_in_queue().unwrap();
    assert_eq!(queued(&env, "ocsp"), 1);
    assert!(publisher.events().is_empty());

    publisher.set_healthy(true);
    env.ca.publish_certs_in_queue().unwrap();
    assert_eq!(queued(&env, "ocsp"), 0);
    assert_eq!(publisher.events(), vec![format!("added {}", serial)]);

    let health = env.ca.health_check();
    assert!(health.healthy);
    assert_eq!(health.publishers.get("ocsp"), Some(&true));
}

#[test]
fn clear_publish_queue_checks_names() {
    let publisher = RecordingPublisher::asynchronous("ldap");
    let env = TestEnv::builder().publisher(publisher.clone()).build();
    env.ca.issue(&env.request("tls", "CN=host")).unwrap();
    assert_eq!(queued(&env, "ldap"), 1);

    let err = env
        .ca
        .clear_publish_queue(Some(&["nope".to_string()]))
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::UnknownPublisher);
    assert_eq!(queued(&env, "ldap"), 1);

    env.ca.clear_publish_queue(Some(&["ldap".to_string()])).unwrap();
    assert_eq!(queued(&env, "ldap"), 0);
}

#[test]
fn republish_pushes_every_certificate_in_order() {
    let ocsp = RecordingPublisher::new("ocsp");
    let ldap = RecordingPublisher::asynchronous("ldap");
    let env = TestEnv::builder()
        .publisher(ocsp.clone())
        .publisher(ldap.clone())
        .build();

    let good = env.ca.issue(&env.request("tls", "CN=good")).unwrap().serial();
    let bad = env.ca.issue(&env.request("tls", "CN=bad")).unwrap().serial();
    env.ca.revoke_cert(bad, CrlReason::KeyCompromise, None, false).unwrap();
    ocsp.clear_events();
    assert_eq!(queued(&env, "ldap"), 2);

    env.ca.republish_certs(None).unwrap();

    let expected = vec![format!("added {}", good), format!("revoked {}", bad)];
    assert_eq!(ocsp.events(), expected);
    assert_eq!(ldap.events(), expected);
    assert_eq!(queued(&env, "ldap"), 0);
    assert_eq!(env.ca.status(), CaStatus::Active);
}

#[test]
fn republish_failure_restores_status() {
    let ocsp = RecordingPublisher::new("ocsp");
    let env = TestEnv::builder().publisher(ocsp.clone()).build();
    env.ca.issue(&env.request("tls", "CN=host")).unwrap();

    ocsp.set_failing(true);
    let err = env.ca.republish_certs(Some(&["ocsp".to_string()])).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::SystemFailure);
    assert_eq!(env.ca.status(), CaStatus::Active);

    let err = env.ca.republish_certs(Some(&["nope".to_string()])).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::UnknownPublisher);
}

#[test]
fn overlapping_republish_is_refused_and_status_comes_back() {
    let ocsp = RecordingPublisher::new("ocsp");
    let env = TestEnv::builder().publisher(ocsp.clone()).build();
    let request = env.request("tls", "CN=slow");

    env.gate.close();
    thread::scope(|s| {
        let issuing = s.spawn(|| env.ca.issue(&request));
        env.gate.wait_for_arrival();

        // Waits for the issuance that is still running.
        let republishing = s.spawn(|| env.ca.republish_certs(None));
        while env.ca.status() != CaStatus::Inactive {
            thread::sleep(Duration::from_millis(5));
        }

        let err = env.ca.republish_certs(None).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::SystemUnavailable);
        assert_eq!(env.ca.status(), CaStatus::Inactive);

        env.gate.open();
        let issued = issuing.join().unwrap().unwrap();
        republishing.join().unwrap().unwrap();
        assert!(ocsp.events().contains(&format!("added {}", issued.serial())));
    });

    assert_eq!(env.ca.status(), CaStatus::Active);
    env.ca.republish_certs(None).unwrap();
    assert_eq!(env.ca.status(), CaStatus::Active);
}
