//! The provider: pool ownership, lazily built readers, change polling and
//! the generational reader swap.
//!
//! Three cooperating tasks run while polling is enabled: the producer
//! polls the active-snapshot view and compares fingerprints; the update
//! dispatcher rebuilds and publishes reader generations and runs the
//! user's update callback; the error dispatcher delivers polling errors.
//! Both dispatch channels have capacity one and a latest-value slot, so a
//! blocked callback coalesces everything that arrives behind it into the
//! newest observation, and callbacks never run concurrently with
//! themselves.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use crate::basedirs::BaseDirsReader;
use crate::cache::NameCache;
use crate::config::Config;
use crate::db::{build_pool, pooled, with_timeout, Pool};
use crate::error::{Result, StoreError};
use crate::schema::ensure_schema;
use crate::snapshot::{fingerprint, list_active};
use crate::tree::Tree;

type UpdateCallback = Arc<dyn Fn() + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&StoreError) + Send + Sync>;

/// One published pair of readers. Old generations stay alive for reads
/// already holding them and close when the last handle drops.
struct Generation {
    tree: Arc<Tree>,
    basedirs: Arc<BaseDirsReader>,
}

async fn build_generation(pool: &Pool, cfg: &Config) -> Result<Generation> {
    let cache = Arc::new(match &cfg.owners_path {
        Some(path) => NameCache::with_owners_file(path)?,
        None => NameCache::new(),
    });

    let tree = Tree::new(pool.clone(), cfg, cache.clone()).await?;
    let basedirs = BaseDirsReader::new(pool.clone(), cfg, cache).await?;

    Ok(Generation {
        tree: Arc::new(tree),
        basedirs: Arc::new(basedirs),
    })
}

/// Record a polled fingerprint. The first observation is the baseline;
/// only a subsequent difference counts as a change.
fn record_change(last: &mut Option<String>, current: String) -> bool {
    match last {
        None => {
            *last = Some(current);
            false
        }
        Some(prev) if *prev != current => {
            *last = Some(current);
            true
        }
        _ => false,
    }
}

async fn poll_fingerprint(pool: &Pool, cfg: &Config) -> Result<String> {
    let conn = pooled(pool).await?;
    let snaps = with_timeout("poll_fingerprint", cfg.query_timeout, async {
        list_active(&conn).await
    })
    .await?;
    Ok(fingerprint(&snaps))
}

/// Read-surface entry point owning the connection pool and the current
/// reader generation.
pub struct Provider {
    cfg: Config,
    pool: Pool,
    generation: Arc<RwLock<Option<Generation>>>,
    update_cb: Arc<Mutex<Option<UpdateCallback>>>,
    error_cb: Arc<Mutex<Option<ErrorCallback>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Provider {
    /// Open the provider: validate the config, build the pool, bootstrap
    /// the schema and start the polling tasks (when enabled). Readers are
    /// built lazily on first access.
    pub async fn open(cfg: &Config) -> Result<Self> {
        let mut cfg = cfg.clone();
        cfg.validate()?;

        let pool = build_pool(&cfg).await?;
        {
            let conn = pooled(&pool).await?;
            ensure_schema(&conn).await?;
        }

        let generation: Arc<RwLock<Option<Generation>>> = Arc::new(RwLock::new(None));
        let update_cb: Arc<Mutex<Option<UpdateCallback>>> = Arc::new(Mutex::new(None));
        let error_cb: Arc<Mutex<Option<ErrorCallback>>> = Arc::new(Mutex::new(None));
        let (shutdown_tx, _) = watch::channel(false);

        let mut provider = Self {
            cfg,
            pool,
            generation,
            update_cb,
            error_cb,
            shutdown_tx,
            tasks: Vec::new(),
        };

        if provider.cfg.polling_enabled() {
            provider.spawn_pollers();
        }

        Ok(provider)
    }

    fn spawn_pollers(&mut self) {
        let (update_tx, mut update_rx) = mpsc::channel::<()>(1);
        let (error_tx, mut error_rx) = mpsc::channel::<()>(1);
        let latest_error: Arc<Mutex<Option<StoreError>>> = Arc::new(Mutex::new(None));

        // Producer: fingerprint the active-snapshot view on a ticker.
        {
            let pool = self.pool.clone();
            let cfg = self.cfg.clone();
            let latest_error = latest_error.clone();
            let error_tx = error_tx.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            self.tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(cfg.poll_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                let mut last: Option<String> = None;

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {}
                    }

                    match poll_fingerprint(&pool, &cfg).await {
                        Ok(fp) => {
                            if record_change(&mut last, fp) {
                                // A pending update already covers this change
                                let _ = update_tx.try_send(());
                            }
                        }
                        Err(e) => {
                            log::warn!("Active-snapshot poll failed: {}", e);
                            *latest_error.lock().expect("error slot poisoned") = Some(e);
                            let _ = error_tx.try_send(());
                        }
                    }
                }
            }));
        }

        // Update dispatcher: rebuild, publish, run the callback, then drop
        // the previous generation.
        {
            let pool = self.pool.clone();
            let cfg = self.cfg.clone();
            let generation = self.generation.clone();
            let update_cb = self.update_cb.clone();
            let latest_error = latest_error.clone();
            let error_tx = error_tx.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            self.tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        recv = update_rx.recv() => {
                            if recv.is_none() {
                                break;
                            }
                        }
                    }

                    let new_gen = match build_generation(&pool, &cfg).await {
                        Ok(g) => g,
                        Err(e) => {
                            log::error!("Reader rebuild failed after snapshot change: {}", e);
                            *latest_error.lock().expect("error slot poisoned") = Some(e);
                            let _ = error_tx.try_send(());
                            continue;
                        }
                    };

                    let old = {
                        let mut guard = generation.write().await;
                        guard.replace(new_gen)
                    };

                    let cb = update_cb.lock().expect("callback slot poisoned").clone();
                    if let Some(cb) = cb {
                        cb();
                    }

                    // In-flight reads keep the old generation alive; this
                    // handle drop is its close.
                    drop(old);
                }
            }));
        }

        // Error dispatcher: deliver the latest queued error, one at a time.
        {
            let error_cb = self.error_cb.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            self.tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        recv = error_rx.recv() => {
                            if recv.is_none() {
                                break;
                            }
                        }
                    }

                    let err = latest_error.lock().expect("error slot poisoned").take();
                    if let Some(err) = err {
                        let cb = error_cb.lock().expect("callback slot poisoned").clone();
                        if let Some(cb) = cb {
                            cb(&err);
                        }
                    }
                }
            }));
        }
    }

    async fn ensure_generation(&self) -> Result<()> {
        {
            let guard = self.generation.read().await;
            if guard.is_some() {
                return Ok(());
            }
        }

        let mut guard = self.generation.write().await;
        if guard.is_none() {
            *guard = Some(build_generation(&self.pool, &self.cfg).await?);
        }
        Ok(())
    }

    /// The current generation's tree reader.
    pub async fn tree(&self) -> Result<Arc<Tree>> {
        self.ensure_generation().await?;
        let guard = self.generation.read().await;
        Ok(guard.as_ref().expect("generation built").tree.clone())
    }

    /// The current generation's basedirs reader.
    pub async fn basedirs(&self) -> Result<Arc<BaseDirsReader>> {
        self.ensure_generation().await?;
        let guard = self.generation.read().await;
        Ok(guard.as_ref().expect("generation built").basedirs.clone())
    }

    /// Install the update callback, invoked once per observed change after
    /// the new generation is published. Never runs concurrently with
    /// itself.
    pub fn on_update(&self, cb: impl Fn() + Send + Sync + 'static) {
        *self.update_cb.lock().expect("callback slot poisoned") = Some(Arc::new(cb));
    }

    /// Install the error callback for transient polling errors. Never runs
    /// concurrently with itself; errors arriving while it runs coalesce to
    /// the latest.
    pub fn on_error(&self, cb: impl Fn(&StoreError) + Send + Sync + 'static) {
        *self.error_cb.lock().expect("callback slot poisoned") = Some(Arc::new(cb));
    }

    /// The shared read pool, for collaborators that run their own queries.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Stop polling, detach and drop the current generation, then release
    /// the pool.
    pub async fn close(mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                log::warn!("Poller task join failed: {}", e);
            }
        }

        let mut guard = self.generation.write().await;
        guard.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_change_baseline_then_diff() {
        let mut last = None;
        assert!(!record_change(&mut last, "a\n".to_string()));
        assert!(!record_change(&mut last, "a\n".to_string()));
        assert!(record_change(&mut last, "b\n".to_string()));
        assert!(!record_change(&mut last, "b\n".to_string()));
        assert!(record_change(&mut last, "a\n".to_string()));
    }

    #[test]
    fn test_error_slot_coalesces_to_latest() {
        let slot: Mutex<Option<StoreError>> = Mutex::new(None);

        *slot.lock().unwrap() = Some(StoreError::Pool("first".to_string()));
        *slot.lock().unwrap() = Some(StoreError::Pool("second".to_string()));

        let delivered = slot.lock().unwrap().take().unwrap();
        assert!(delivered.to_string().contains("second"));
        assert!(slot.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_channel_coalesces() {
        let (tx, mut rx) = mpsc::channel::<()>(1);

        // Three changes while the consumer is blocked collapse into one
        // pending notification.
        tx.try_send(()).unwrap();
        assert!(tx.try_send(()).is_err());
        assert!(tx.try_send(()).is_err());

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
