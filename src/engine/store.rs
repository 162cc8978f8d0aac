use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::model::*;

use super::{EngineError, SharedProviderState};

pub struct InMemoryStore {
    providers: DashMap<Ulid, SharedProviderState>,
    /// Reverse lookup: entity (booking/waitlist entry) id → provider id
    entity_to_provider: DashMap<Ulid, Ulid>,
    /// user id → the user's single booking
    user_bookings: DashMap<Ulid, Ulid>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            providers: DashMap::new(),
            entity_to_provider: DashMap::new(),
            user_bookings: DashMap::new(),
        }
    }

    // ── Providers ────────────────────────────────────────────

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn contains_provider(&self, id: &Ulid) -> bool {
        self.providers.contains_key(id)
    }

    pub fn get_provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    pub fn insert_provider(&self, id: Ulid, state: SharedProviderState) {
        self.providers.insert(id, state);
    }

    pub fn remove_provider(&self, id: &Ulid) -> Option<(Ulid, SharedProviderState)> {
        self.providers.remove(id)
    }

    /// Snapshot of all provider handles, sorted by id. Never hold DashMap refs across an await.
    pub fn provider_handles(&self) -> Vec<(Ulid, SharedProviderState)> {
        let mut handles: Vec<_> = self
            .providers
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);
        handles
    }

    // ── Entity index ─────────────────────────────────────────

    pub fn provider_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_provider.get(entity_id).map(|e| *e.value())
    }

    // ── User index ───────────────────────────────────────────

    pub fn booking_for_user(&self, user_id: &Ulid) -> Option<Ulid> {
        self.user_bookings.get(user_id).map(|e| *e.value())
    }

    /// Atomically reserve the user's single booking slot for `booking_id`.
    /// The reservation is released on drop unless committed.
    pub fn claim_user(&self, user_id: Ulid, booking_id: Ulid) -> Result<UserClaim<'_>, EngineError> {
        match self.user_bookings.entry(user_id) {
            Entry::Occupied(e) => Err(EngineError::DuplicateBooking {
                user_id,
                existing: *e.get(),
            }),
            Entry::Vacant(e) => {
                e.insert(booking_id);
                Ok(UserClaim {
                    index: &self.user_bookings,
                    user_id,
                    booking_id,
                    committed: false,
                })
            }
        }
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event to one provider's state (caller holds its lock) and to the indexes.
    /// Index updates are idempotent, so an event touching two providers may be applied to both.
    pub fn apply_event(&self, ps: &mut ProviderState, event: &Event) {
        let pid = ps.id();
        match event {
            Event::BookingCreated { booking } => {
                ps.insert_booking(booking.clone());
                self.entity_to_provider.insert(booking.id, booking.provider_id);
                self.user_bookings.insert(booking.user_id, booking.id);
            }
            Event::BookingUpdated {
                previous_provider_id,
                previous_user_id,
                booking,
            } => {
                if pid == *previous_provider_id {
                    ps.remove_booking(booking.id);
                }
                if pid == booking.provider_id {
                    ps.insert_booking(booking.clone());
                }
                self.entity_to_provider.insert(booking.id, booking.provider_id);
                if *previous_user_id != booking.user_id {
                    self.user_bookings
                        .remove_if(previous_user_id, |_, b| *b == booking.id);
                }
                self.user_bookings.insert(booking.user_id, booking.id);
            }
            Event::BookingCancelled { id, user_id, .. } => {
                ps.remove_booking(*id);
                self.entity_to_provider.remove(id);
                self.user_bookings.remove_if(user_id, |_, b| b == id);
            }
            Event::WaitlistJoined { entry } => {
                ps.push_waitlist(entry.clone());
                self.entity_to_provider.insert(entry.id, entry.provider_id);
            }
            Event::WaitlistLeft { id, .. } => {
                ps.remove_waitlist(*id);
                self.entity_to_provider.remove(id);
            }
            Event::WaitlistPromoted { entry_id, booking } => {
                ps.remove_waitlist(*entry_id);
                self.entity_to_provider.remove(entry_id);
                ps.insert_booking(booking.clone());
                self.entity_to_provider.insert(booking.id, booking.provider_id);
                self.user_bookings.insert(booking.user_id, booking.id);
            }
            Event::ProviderUpdated { info } => {
                ps.info = info.clone();
            }
            // Handled at the DashMap level, not here
            Event::ProviderCreated { .. } | Event::ProviderDeleted { .. } => {}
        }
    }
}

/// Reservation of a user's single booking. Dropping without `commit` releases it.
pub struct UserClaim<'a> {
    index: &'a DashMap<Ulid, Ulid>,
    user_id: Ulid,
    booking_id: Ulid,
    committed: bool,
}

impl UserClaim<'_> {
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for UserClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let booking_id = self.booking_id;
            self.index.remove_if(&self.user_id, |_, b| *b == booking_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive_per_user() {
        let store = InMemoryStore::new();
        let user = Ulid::new();
        let first = Ulid::new();

        let claim = store.claim_user(user, first).unwrap();
        let second = store.claim_user(user, Ulid::new());
        assert!(matches!(
            second,
            Err(EngineError::DuplicateBooking { existing, .. }) if existing == first
        ));
        claim.commit();
        assert_eq!(store.booking_for_user(&user), Some(first));
    }

    #[test]
    fn dropped_claim_is_released() {
        let store = InMemoryStore::new();
        let user = Ulid::new();
        {
            let _claim = store.claim_user(user, Ulid::new()).unwrap();
            assert!(store.booking_for_user(&user).is_some());
        }
        assert!(store.booking_for_user(&user).is_none());
        assert!(store.claim_user(user, Ulid::new()).is_ok());
    }

    #[test]
    fn promotion_event_moves_entry_into_bookings() {
        let store = InMemoryStore::new();
        let pid = Ulid::new();
        let mut ps = ProviderState::new(ProviderInfo {
            id: pid,
            name: "Dr. A".into(),
            experience_years: 1,
            specialty: "General".into(),
        });
        let entry = WaitlistEntry {
            id: Ulid::new(),
            user_id: Ulid::new(),
            provider_id: pid,
            preferred_at: HOUR_MS,
            notified: false,
            created_at: 0,
        };
        store.apply_event(&mut ps, &Event::WaitlistJoined { entry: entry.clone() });
        assert_eq!(store.provider_for_entity(&entry.id), Some(pid));

        let booking = Booking {
            id: Ulid::new(),
            user_id: entry.user_id,
            provider_id: pid,
            start: entry.preferred_at,
            created_at: 1,
            updated_at: 1,
        };
        store.apply_event(
            &mut ps,
            &Event::WaitlistPromoted {
                entry_id: entry.id,
                booking: booking.clone(),
            },
        );
        assert!(ps.waitlist.is_empty());
        assert_eq!(ps.bookings, vec![booking.clone()]);
        assert_eq!(store.provider_for_entity(&entry.id), None);
        assert_eq!(store.booking_for_user(&entry.user_id), Some(booking.id));
    }
}
