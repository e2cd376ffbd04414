//! The environment a CA runs in.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use log::debug;

use crate::commons::api::{CaName, CrlIntervalState};
use crate::commons::{CaResult, Error};
use crate::publisher::Publisher;


//------------ CaManager -----------------------------------------------------

pub trait CaManager: Send + Sync {
    /// Whether this instance may change CA state. A non-master instance
    /// only reads.
    fn is_master(&self) -> bool;

    /// The publishers registered for a CA, in notification order.
    fn publishers(&self, ca: &CaName) -> Vec<Arc<dyn Publisher>>;

    /// Persists where the CRL scheduler left off for a CA.
    fn save_crl_interval(&self, ca: &CaName, state: CrlIntervalState) -> CaResult<()>;

    fn load_crl_interval(&self, ca: &CaName) -> CaResult<Option<CrlIntervalState>>;
}


//------------ StaticCaManager -----------------------------------------------

/// A [`CaManager`] with a fixed set of publishers.
///
/// CRL interval state is kept in memory and, if a state directory is
/// configured, written to `<dir>/<ca>-crl-interval.json`.
pub struct StaticCaManager {
    master: bool,
    publishers: HashMap<CaName, Vec<Arc<dyn Publisher>>>,
    state_dir: Option<PathBuf>,
    intervals: RwLock<HashMap<CaName, CrlIntervalState>>,
}

impl StaticCaManager {
    pub fn new(master: bool) -> Self {
        StaticCaManager {
            master,
            publishers: HashMap::new(),
            state_dir: None,
            intervals: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_publisher(mut self, ca: &CaName, publisher: Arc<dyn Publisher>) -> Self {
        self.publishers.entry(ca.clone()).or_default().push(publisher);
        self
    }

    pub fn with_state_dir(mut self, dir: PathBuf) -> Self {
        self.state_dir = Some(dir);
        self
    }

    fn state_file(&self, ca: &CaName) -> Option<PathBuf> {
        self.state_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}-crl-interval.json", ca)))
    }
}

impl CaManager for StaticCaManager {
    fn is_master(&self) -> bool {
        self.master
    }

    fn publishers(&self, ca: &CaName) -> Vec<Arc<dyn Publisher>> {
        self.publishers.get(ca).cloned().unwrap_or_default()
    }

    fn save_crl_interval(&self, ca: &CaName, state: CrlIntervalState) -> CaResult<()> {
        if let Some(path) = self.state_file(ca) {
            let json = serde_json::to_string_pretty(&state).map_err(Error::system)?;
            fs::write(&path, json).map_err(|e| {
                Error::system(format!(
                    "Could not write CRL interval state to '{}': {}",
                    path.to_string_lossy(),
                    e
                ))
            })?;
        }
        debug!("Saved CRL interval {} for CA '{}'", state.last_interval, ca);
        self.intervals
            .write()
            .expect("poisoned lock")
            .insert(ca.clone(), state);
        Ok(())
    }

    fn load_crl_interval(&self, ca: &CaName) -> CaResult<Option<CrlIntervalState>> {
        if let Some(state) = self.intervals.read().expect("poisoned lock").get(ca) {
            return Ok(Some(*state));
        }
        let Some(path) = self.state_file(ca) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path).map_err(|e| {
            Error::system(format!(
                "Could not read CRL interval state from '{}': {}",
                path.to_string_lossy(),
                e
            ))
        })?;
        let state: CrlIntervalState = serde_json::from_str(&json).map_err(Error::system)?;
        Ok(Some(state))
    }
}


//------------ Tests ---------------------------------------------------------
