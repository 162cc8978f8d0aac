use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// The caller's single booking with its provider attached.
    pub async fn get_own_booking(&self, caller: &Caller) -> Result<BookingInfo, EngineError> {
        let missing = || EngineError::NoBooking(caller.user_id);
        let booking_id = self.store.booking_for_user(&caller.user_id).ok_or_else(missing)?;
        let provider_id = self.store.provider_for_entity(&booking_id).ok_or_else(missing)?;
        let ps = self.store.get_provider(&provider_id).ok_or_else(missing)?;
        let guard = ps.read().await;
        let booking = guard.booking(booking_id).cloned().ok_or_else(missing)?;
        Ok(BookingInfo {
            booking,
            provider: guard.info.clone(),
        })
    }

    /// Every booking across all providers, ordered by start. Admin only.
    pub async fn list_bookings(&self, caller: &Caller) -> Result<Vec<BookingInfo>, EngineError> {
        if !caller.is_admin {
            return Err(EngineError::NotAuthorized);
        }
        let mut result = Vec::new();
        for (_, ps) in self.store.provider_handles() {
            let guard = ps.read().await;
            result.extend(guard.bookings.iter().map(|b| BookingInfo {
                booking: b.clone(),
                provider: guard.info.clone(),
            }));
        }
        result.sort_by_key(|b| (b.booking.start, b.booking.provider_id));
        Ok(result)
    }

    /// Pending waitlist entries, oldest first. Users see their own; admins see all.
    pub async fn list_waitlist(&self, caller: &Caller) -> Vec<WaitlistEntry> {
        let mut result = Vec::new();
        for (_, ps) in self.store.provider_handles() {
            let guard = ps.read().await;
            result.extend(
                guard
                    .pending()
                    .filter(|e| caller.is_admin || e.user_id == caller.user_id)
                    .cloned(),
            );
        }
        result.sort_by_key(|e| (e.created_at, e.id));
        result
    }

    /// Providers ordered by name, optionally narrowed to one id.
    pub async fn list_providers(&self, filter: Option<Ulid>) -> Vec<ProviderInfo> {
        let mut result = Vec::new();
        for (id, ps) in self.store.provider_handles() {
            if filter.is_some_and(|f| f != id) {
                continue;
            }
            result.push(ps.read().await.info.clone());
        }
        result.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        result
    }
}
