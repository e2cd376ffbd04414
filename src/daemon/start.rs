use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use log::{error, info};

use crate::ca::{self_signed_ca_certificate, CrlSigner, StaticCaManager, X509Ca};
use crate::commons::api::Validity;
use crate::commons::crypto::{OpenSslKeyPair, OpenSslSignerFactory, SignerPool};
use crate::commons::error::Error;
use crate::commons::CaResult;
use crate::constants::{CAENGINE_SERVER_APP, CAENGINE_VERSION};
use crate::daemon::config::Config;
use crate::daemon::scheduler::Scheduler;
use crate::publisher::LogPublisher;
use crate::store::{CertificateStore, MemoryCertStore};


/// Builds the CA described by the config.
///
/// The CA key is loaded from its key file, or created there if missing.
/// The CA certificate is self-signed anew on every start, with a serial
/// taken from the store.
pub fn build_ca(config: &Config) -> CaResult<X509Ca> {
    let key = OpenSslKeyPair::load_or_create(&config.ca.key_file, config.ca.key_algorithm)?;
    let factory = OpenSslSignerFactory::new(key)?;
    let signer = Arc::new(SignerPool::build(
        Arc::new(factory),
        config.signer_pool_size,
        Duration::from_secs(config.signer_borrow_timeout_seconds),
    )?);

    let store = Arc::new(MemoryCertStore::new());
    let subject = config.ca.subject().map_err(Error::system)?;
    let now = Utc::now();
    let validity = Validity::new(now, now + TimeDelta::days(config.ca.validity_days));
    let cert = self_signed_ca_certificate(subject, validity, store.next_serial()?, &signer)?;
    info!(
        "CA '{}' uses certificate {} for '{}'",
        config.ca.name,
        cert.serial(),
        cert.subject()
    );

    let mut manager = StaticCaManager::new(config.master)
        .with_publisher(&config.ca.name, Arc::new(LogPublisher::new("log")));
    if let Some(dir) = &config.state_dir {
        manager = manager.with_state_dir(dir.clone());
    }

    let crl_signer = config
        .ca
        .crl_control
        .as_ref()
        .map(|_| CrlSigner::new(signer.clone(), None));

    X509Ca::build(
        config.ca_info(cert),
        store,
        signer,
        config.profile_registry(),
        Arc::new(manager),
        crl_signer,
    )
}

/// Runs the engine until interrupted.
pub async fn start_caengine(config: Arc<Config>) -> CaResult<()> {
    let ca = build_ca(&config)?;
    info!(
        "{} {} started CA '{}' with profiles {}",
        CAENGINE_SERVER_APP,
        CAENGINE_VERSION,
        ca.name(),
        config
            .profiles
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let health = ca.health_check();
    if !health.healthy {
        error!("CA '{}' is not healthy: {:?}", ca.name(), health);
    }

    if config.master {
        let scheduler = Scheduler::build(ca, &config);
        tokio::select!(
            _ = scheduler.run() => error!("scheduler stopped unexpectedly"),
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("Cannot listen for shutdown signal: {}", e);
                }
            }
        );
    } else {
        info!("Not the master instance, background tasks are disabled");
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for shutdown signal: {}", e);
        }
    }

    info!("{} stopped", CAENGINE_SERVER_APP);
    Ok(())
}
