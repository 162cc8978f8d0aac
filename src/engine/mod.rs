mod conflict;
mod error;
mod mutations;
mod promotion;
mod queries;
mod store;

pub use conflict::{has_conflict, LOCKOUT_HOURS};
pub use error::EngineError;
pub use mutations::{BookingChange, ProviderChange};
pub use promotion::PromotionStrategy;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use store::InMemoryStore;

pub type SharedProviderState = Arc<RwLock<ProviderState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let result = wal.append_buffered(&event).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) promotion: PromotionStrategy,
    /// Serializes provider create/delete against WAL compaction.
    pub(super) catalog: Mutex<()>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        promotion: PromotionStrategy,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            notify,
            promotion,
            catalog: Mutex::new(()),
        };

        // Replay events. We're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never use blocking_write here because this may run
        // inside an async context.
        for event in &events {
            match event {
                Event::ProviderCreated {
                    id,
                    name,
                    experience_years,
                    specialty,
                } => {
                    let ps = ProviderState::new(ProviderInfo {
                        id: *id,
                        name: name.clone(),
                        experience_years: *experience_years,
                        specialty: specialty.clone(),
                    });
                    engine.store.insert_provider(*id, Arc::new(RwLock::new(ps)));
                }
                Event::ProviderDeleted { id } => {
                    engine.store.remove_provider(id);
                }
                other => {
                    for pid in other.provider_ids() {
                        let Some(ps) = engine.store.get_provider(&pid) else {
                            tracing::warn!("replay: event for unknown provider {pid} skipped");
                            continue;
                        };
                        match ps.try_write() {
                            Ok(mut guard) => engine.store.apply_event(&mut guard, other),
                            Err(_) => tracing::warn!("replay: provider {pid} unexpectedly locked"),
                        }
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.store.get_provider(id)
    }

    pub fn promotion_strategy(&self) -> PromotionStrategy {
        self.promotion
    }

    /// WAL-append + apply + notify in one call. `targets` are the locked providers the
    /// event touches.
    pub(super) async fn persist_and_apply(
        &self,
        targets: &mut [&mut ProviderState],
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        for ps in targets.iter_mut() {
            self.store.apply_event(ps, event);
            self.notify.send(ps.id(), event);
        }
        Ok(())
    }

    /// Write-lock a live provider. A provider deleted while we waited on its lock
    /// is reported as not found.
    pub(super) async fn lock_provider(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ProviderState>, EngineError> {
        let ps = self
            .store
            .get_provider(&id)
            .ok_or(EngineError::ProviderNotFound(id))?;
        let guard = ps.write_owned().await;
        if guard.deleted {
            return Err(EngineError::ProviderNotFound(id));
        }
        Ok(guard)
    }

    /// Acquire write locks on several providers in sorted id order (deadlock-free).
    pub(super) async fn lock_providers(
        &self,
        ids: &[Ulid],
    ) -> Result<Vec<(Ulid, OwnedRwLockWriteGuard<ProviderState>)>, EngineError> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push((id, self.lock_provider(id).await?));
        }
        Ok(guards)
    }
}

pub(super) fn guard_for(
    guards: &[(Ulid, OwnedRwLockWriteGuard<ProviderState>)],
    id: Ulid,
) -> Result<&ProviderState, EngineError> {
    guards
        .iter()
        .find(|(gid, _)| *gid == id)
        .map(|(_, g)| &**g)
        .ok_or(EngineError::ProviderNotFound(id))
}
