//! Runs the periodic engine tasks.
//!
//! All engine operations are blocking, so every tick hands its work to
//! the blocking thread pool. A tick that finds the previous run of the
//! same task still busy is skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use tokio::time::{interval, MissedTickBehavior};

use crate::ca::X509Ca;
use crate::commons::CaResult;
use crate::daemon::config::Config;


//------------ Scheduler -----------------------------------------------------

pub struct Scheduler {
    ca: X509Ca,
    crl_tick: Duration,
    expired_certs_tick: Duration,
    publish_queue_tick: Duration,
}

impl Scheduler {
    pub fn build(ca: X509Ca, config: &Config) -> Self {
        Scheduler {
            ca,
            crl_tick: Duration::from_secs(config.crl_tick_seconds),
            expired_certs_tick: Duration::from_secs(config.expired_certs_tick_seconds),
            publish_queue_tick: Duration::from_secs(config.publish_queue_tick_seconds),
        }
    }

    /// Runs the tasks until the future is dropped.
    pub async fn run(self) {
        let crl = SkippingTask::new("generate CRL", self.ca.clone(), |ca| {
            ca.generate_crl_if_due().map(|_| ())
        });
        let reaper = SkippingTask::new("remove expired certificates", self.ca.clone(), |ca| {
            ca.remove_expired_certs()
        });
        let publish_queue = SkippingTask::new("publish queued certificates", self.ca.clone(), |ca| {
            ca.publish_certs_in_queue()
        });

        let mut crl_ticks = interval(self.crl_tick);
        let mut reaper_ticks = interval(self.expired_certs_tick);
        let mut publish_ticks = interval(self.publish_queue_tick);
        for ticks in [&mut crl_ticks, &mut reaper_ticks, &mut publish_ticks] {
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        loop {
            tokio::select! {
                _ = crl_ticks.tick() => crl.spawn(),
                _ = reaper_ticks.tick() => reaper.spawn(),
                _ = publish_ticks.tick() => publish_queue.spawn(),
            }
        }
    }
}


//------------ SkippingTask --------------------------------------------------

/// A blocking task of which at most one run is active at any time.
struct SkippingTask<F> {
    name: &'static str,
    ca: X509Ca,
    op: Arc<F>,
    running: Arc<AtomicBool>,
}

impl<F> SkippingTask<F>
where
    F: Fn(&X509Ca) -> CaResult<()> + Send + Sync + 'static,
{
    fn new(name: &'static str, ca: X509Ca, op: F) -> Self {
        SkippingTask {
            name,
            ca,
            op: Arc::new(op),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn spawn(&self) {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Skipping '{}', the previous run is still busy", self.name);
            return;
        }

        let name = self.name;
        let ca = self.ca.clone();
        let op = self.op.clone();
        let running = ResetOnDrop(self.running.clone());
        tokio::task::spawn_blocking(move || {
            let _running = running;
            if let Err(e) = op(&ca) {
                error!("Task '{}' for CA '{}' failed: {}", name, ca.name(), e);
            }
        });
    }
}

/// Clears a run flag when dropped, also if the run panics.
struct ResetOnDrop(Arc<AtomicBool>);

impl Drop for ResetOnDrop {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use crate::commons::test::TestCa;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn busy_task_is_skipped() {
        let env = TestCa::builder().build();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(AtomicBool::new(false));

        let task = {
            let calls = calls.clone();
            let gate = gate.clone();
            SkippingTask::new("test", env.ca.clone(), move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                while !gate.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            })
        };

        task.spawn();
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        task.spawn();
        task.spawn();
        gate.store(true, Ordering::SeqCst);

        while task.running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        task.spawn();
        while task.running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_run_releases_the_task() {
        let env = TestCa::builder().build();
        let calls = Arc::new(AtomicUsize::new(0));

        let task = {
            let calls = calls.clone();
            SkippingTask::new("test", env.ca.clone(), move |_| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first run fails");
                }
                Ok(())
            })
        };

        task.spawn();
        while calls.load(Ordering::SeqCst) == 0 || task.running.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        task.spawn();
        while calls.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
