use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_future, check_lockout, check_no_conflict, now_ms, validate_start};
use super::{guard_for, Engine, EngineError, WalCommand};

/// Requested changes to an existing booking. `None` keeps the current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingChange {
    pub provider_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub user_id: Option<Ulid>,
}

/// Requested changes to a provider's details. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderChange {
    pub name: Option<String>,
    pub experience_years: Option<u32>,
    pub specialty: Option<String>,
}

/// Who is changing a booking: its owner (ownership + lockout enforced) or an administrator.
#[derive(Debug, Clone, Copy)]
enum Actor {
    Owner(Ulid),
    Admin,
}

impl Engine {
    // ── Providers ────────────────────────────────────────────

    pub async fn create_provider(
        &self,
        caller: &Caller,
        id: Ulid,
        name: String,
        experience_years: u32,
        specialty: String,
    ) -> Result<ProviderInfo, EngineError> {
        if !caller.is_admin {
            return Err(EngineError::NotAuthorized);
        }
        check_provider_fields(&name, &specialty)?;
        let _catalog = self.catalog.lock().await;
        if self.store.provider_count() >= MAX_PROVIDERS {
            return Err(EngineError::LimitExceeded("too many providers"));
        }
        if self.store.contains_provider(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let info = ProviderInfo {
            id,
            name,
            experience_years,
            specialty,
        };
        let event = Event::ProviderCreated {
            id,
            name: info.name.clone(),
            experience_years,
            specialty: info.specialty.clone(),
        };
        self.wal_append(&event).await?;
        self.store
            .insert_provider(id, Arc::new(RwLock::new(ProviderState::new(info.clone()))));
        self.notify.send(id, &event);
        info!("provider {id} created ({})", info.name);
        Ok(info)
    }

    pub async fn update_provider(
        &self,
        caller: &Caller,
        id: Ulid,
        change: ProviderChange,
    ) -> Result<ProviderInfo, EngineError> {
        if !caller.is_admin {
            return Err(EngineError::NotAuthorized);
        }
        let mut guard = self.lock_provider(id).await?;
        let current = &guard.info;
        let info = ProviderInfo {
            id,
            name: change.name.unwrap_or_else(|| current.name.clone()),
            experience_years: change.experience_years.unwrap_or(current.experience_years),
            specialty: change.specialty.unwrap_or_else(|| current.specialty.clone()),
        };
        check_provider_fields(&info.name, &info.specialty)?;

        let event = Event::ProviderUpdated { info: info.clone() };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        info!("provider {id} updated ({})", info.name);
        Ok(info)
    }

    pub async fn delete_provider(&self, caller: &Caller, id: Ulid) -> Result<(), EngineError> {
        if !caller.is_admin {
            return Err(EngineError::NotAuthorized);
        }
        let _catalog = self.catalog.lock().await;
        let mut guard = self.lock_provider(id).await?;
        if !guard.bookings.is_empty() || !guard.waitlist.is_empty() {
            return Err(EngineError::ProviderInUse(id));
        }

        let event = Event::ProviderDeleted { id };
        self.wal_append(&event).await?;
        guard.deleted = true;
        self.store.remove_provider(&id);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        info!("provider {id} deleted");
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn create_booking(
        &self,
        caller: &Caller,
        id: Ulid,
        provider_id: Ulid,
        start: Ms,
    ) -> Result<BookingInfo, EngineError> {
        validate_start(start)?;
        let mut guard = self.lock_provider(provider_id).await?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many bookings on provider"));
        }
        if self.store.provider_for_entity(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }

        let claim = self.store.claim_user(caller.user_id, id)?;
        let now = now_ms();
        check_future(start, now)?;
        check_no_conflict(&guard, start, None)?;

        let booking = Booking {
            id,
            user_id: caller.user_id,
            provider_id,
            start,
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        claim.commit();

        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!("booking {id} created for user {} with provider {provider_id} at {start}", caller.user_id);
        Ok(BookingInfo {
            booking,
            provider: guard.info.clone(),
        })
    }

    pub async fn update_own_booking(
        &self,
        caller: &Caller,
        new_provider_id: Option<Ulid>,
        new_start: Option<Ms>,
    ) -> Result<BookingInfo, EngineError> {
        let booking_id = self
            .store
            .booking_for_user(&caller.user_id)
            .ok_or(EngineError::NoBooking(caller.user_id))?;
        let change = BookingChange {
            provider_id: new_provider_id,
            start: new_start,
            user_id: None,
        };
        self.change_booking(booking_id, change, Actor::Owner(caller.user_id))
            .await
    }

    pub async fn admin_update_booking(
        &self,
        caller: &Caller,
        booking_id: Ulid,
        change: BookingChange,
    ) -> Result<BookingInfo, EngineError> {
        if !caller.is_admin {
            return Err(EngineError::NotAuthorized);
        }
        self.change_booking(booking_id, change, Actor::Admin).await
    }

    pub async fn cancel_own_booking(&self, caller: &Caller) -> Result<(), EngineError> {
        let booking_id = self
            .store
            .booking_for_user(&caller.user_id)
            .ok_or(EngineError::NoBooking(caller.user_id))?;
        self.remove_booking(booking_id, Actor::Owner(caller.user_id))
            .await
    }

    pub async fn admin_delete_booking(
        &self,
        caller: &Caller,
        booking_id: Ulid,
    ) -> Result<(), EngineError> {
        if !caller.is_admin {
            return Err(EngineError::NotAuthorized);
        }
        self.remove_booking(booking_id, Actor::Admin).await
    }

    async fn change_booking(
        &self,
        booking_id: Ulid,
        change: BookingChange,
        actor: Actor,
    ) -> Result<BookingInfo, EngineError> {
        if let Some(start) = change.start {
            validate_start(start)?;
        }
        let current_pid = self
            .store
            .provider_for_entity(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let target_pid = change.provider_id.unwrap_or(current_pid);
        let mut guards = self.lock_providers(&[current_pid, target_pid]).await?;

        let current = guard_for(&guards, current_pid)?
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        let now = now_ms();
        if let Actor::Owner(user_id) = actor {
            if current.user_id != user_id {
                return Err(EngineError::NotFound(booking_id));
            }
            check_lockout(current.start, now)?;
        }

        let start = change.start.unwrap_or(current.start);
        let user_id = change.user_id.unwrap_or(current.user_id);
        if start != current.start {
            check_future(start, now)?;
        }
        check_no_conflict(guard_for(&guards, target_pid)?, start, Some(booking_id))?;
        let claim = if user_id != current.user_id {
            Some(self.store.claim_user(user_id, booking_id)?)
        } else {
            None
        };

        let booking = Booking {
            id: booking_id,
            user_id,
            provider_id: target_pid,
            start,
            created_at: current.created_at,
            updated_at: now,
        };
        let event = Event::BookingUpdated {
            previous_provider_id: current_pid,
            previous_user_id: current.user_id,
            booking: booking.clone(),
        };
        {
            let mut targets: Vec<&mut ProviderState> =
                guards.iter_mut().map(|(_, g)| &mut **g).collect();
            self.persist_and_apply(&mut targets, &event).await?;
        }
        if let Some(claim) = claim {
            claim.commit();
        }
        let provider = guard_for(&guards, target_pid)?.info.clone();
        drop(guards);

        metrics::counter!(crate::observability::BOOKINGS_UPDATED_TOTAL).increment(1);
        info!("booking {booking_id} updated: provider {target_pid}, start {start}, user {user_id}");

        // A user-only reassignment frees nothing.
        if target_pid != current_pid || start != current.start {
            self.promote_waitlist(current_pid, current.start).await;
        }
        Ok(BookingInfo { booking, provider })
    }

    async fn remove_booking(&self, booking_id: Ulid, actor: Actor) -> Result<(), EngineError> {
        let provider_id = self
            .store
            .provider_for_entity(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let mut guard = self
            .lock_provider(provider_id)
            .await
            .map_err(|_| EngineError::NotFound(booking_id))?;
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if let Actor::Owner(user_id) = actor {
            if booking.user_id != user_id {
                return Err(EngineError::NotFound(booking_id));
            }
            check_lockout(booking.start, now_ms())?;
        }

        let event = Event::BookingCancelled {
            id: booking_id,
            provider_id,
            user_id: booking.user_id,
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        drop(guard);

        metrics::counter!(crate::observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!("booking {booking_id} cancelled, slot {} on provider {provider_id} freed", booking.start);
        self.promote_waitlist(provider_id, booking.start).await;
        Ok(())
    }

    // ── Waitlist ─────────────────────────────────────────────

    pub async fn join_waitlist(
        &self,
        caller: &Caller,
        id: Ulid,
        provider_id: Ulid,
        preferred_at: Ms,
    ) -> Result<WaitlistEntry, EngineError> {
        validate_start(preferred_at)?;
        let mut guard = self.lock_provider(provider_id).await?;
        if guard.waitlist.len() >= MAX_WAITLIST_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("waitlist full"));
        }
        if let Some(existing) = guard.pending().find(|e| e.user_id == caller.user_id) {
            return Err(EngineError::AlreadyWaitlisted(existing.id));
        }
        if self.store.provider_for_entity(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }

        let entry = WaitlistEntry {
            id,
            user_id: caller.user_id,
            provider_id,
            preferred_at,
            notified: false,
            created_at: now_ms(),
        };
        let event = Event::WaitlistJoined {
            entry: entry.clone(),
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        info!("user {} joined waitlist of provider {provider_id} for {preferred_at}", caller.user_id);
        Ok(entry)
    }

    pub async fn leave_waitlist(&self, caller: &Caller, entry_id: Ulid) -> Result<(), EngineError> {
        let provider_id = self
            .store
            .provider_for_entity(&entry_id)
            .ok_or(EngineError::NotFound(entry_id))?;
        let mut guard = self
            .lock_provider(provider_id)
            .await
            .map_err(|_| EngineError::NotFound(entry_id))?;
        let entry = guard
            .waitlist
            .iter()
            .find(|e| e.id == entry_id && e.user_id == caller.user_id)
            .cloned()
            .ok_or(EngineError::NotFound(entry_id))?;

        let event = Event::WaitlistLeft {
            id: entry.id,
            provider_id,
            user_id: entry.user_id,
        };
        self.persist_and_apply(&mut [&mut *guard], &event).await?;
        info!("user {} left waitlist entry {entry_id}", caller.user_id);
        Ok(())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    /// Every provider is read-locked until the rewrite is done, so no append can slip in between.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let mut guards = Vec::new();
        for (_, ps) in self.store.provider_handles() {
            guards.push(ps.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::ProviderCreated {
                id: guard.info.id,
                name: guard.info.name.clone(),
                experience_years: guard.info.experience_years,
                specialty: guard.info.specialty.clone(),
            });
        }
        for guard in &guards {
            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
            for entry in &guard.waitlist {
                events.push(Event::WaitlistJoined {
                    entry: entry.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn check_provider_fields(name: &str, specialty: &str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN || specialty.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("provider name too long"));
    }
    Ok(())
}
