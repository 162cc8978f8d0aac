use std::str::FromStr;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;

use super::conflict::{has_conflict, now_ms};
use super::{Engine, EngineError};

/// Order in which pending waitlist entries are offered a freed slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PromotionStrategy {
    /// Oldest entry first.
    #[default]
    Fifo,
    /// Entry whose preferred time is closest to the freed slot first; ties in join order.
    Nearest,
}

impl FromStr for PromotionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "nearest" => Ok(Self::Nearest),
            other => Err(format!("unknown promotion strategy '{other}' (expected fifo or nearest)")),
        }
    }
}

/// Pending entries in the order they should be tried.
pub(crate) fn promotion_order(
    ps: &ProviderState,
    freed_at: Ms,
    strategy: PromotionStrategy,
) -> Vec<WaitlistEntry> {
    let mut entries: Vec<WaitlistEntry> = ps.pending().cloned().collect();
    if strategy == PromotionStrategy::Nearest {
        // Stable: equal distances keep join order.
        entries.sort_by_key(|e| (e.preferred_at - freed_at).unsigned_abs());
    }
    entries
}

impl Engine {
    /// Offer a freed slot on `provider_id` to the waitlist. Never fails the caller:
    /// errors are logged and counted, and the slot simply stays open.
    pub async fn promote_waitlist(&self, provider_id: Ulid, freed_at: Ms) -> Option<Promotion> {
        match self.try_promote(provider_id, freed_at).await {
            Ok(Some(promotion)) => {
                metrics::counter!(crate::observability::WAITLIST_PROMOTIONS_TOTAL).increment(1);
                info!(
                    "waitlist entry {} promoted to booking {} for user {} on provider {provider_id}",
                    promotion.entry.id, promotion.booking.id, promotion.booking.user_id
                );
                self.notify.send_promotion(provider_id, &promotion);
                Some(promotion)
            }
            Ok(None) => {
                debug!("no waitlist entry qualified for freed slot {freed_at} on provider {provider_id}");
                None
            }
            Err(e) => {
                metrics::counter!(crate::observability::WAITLIST_PROMOTION_FAILURES_TOTAL)
                    .increment(1);
                warn!("waitlist promotion on provider {provider_id} failed: {e}");
                None
            }
        }
    }

    async fn try_promote(
        &self,
        provider_id: Ulid,
        freed_at: Ms,
    ) -> Result<Option<Promotion>, EngineError> {
        let mut guard = match self.lock_provider(provider_id).await {
            Ok(guard) => guard,
            Err(EngineError::ProviderNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let now = now_ms();

        for entry in promotion_order(&guard, freed_at, self.promotion) {
            if entry.preferred_at <= now {
                debug!("waitlist entry {} skipped: preferred time has passed", entry.id);
                continue;
            }
            if has_conflict(&guard, entry.preferred_at, None) {
                debug!("waitlist entry {} skipped: preferred slot taken", entry.id);
                continue;
            }
            let booking_id = Ulid::new();
            let claim = match self.store.claim_user(entry.user_id, booking_id) {
                Ok(claim) => claim,
                Err(_) => {
                    debug!("waitlist entry {} skipped: user already booked", entry.id);
                    continue;
                }
            };

            let booking = Booking {
                id: booking_id,
                user_id: entry.user_id,
                provider_id,
                start: entry.preferred_at,
                created_at: now,
                updated_at: now,
            };
            let event = Event::WaitlistPromoted {
                entry_id: entry.id,
                booking: booking.clone(),
            };
            self.persist_and_apply(&mut [&mut *guard], &event).await?;
            claim.commit();

            return Ok(Some(Promotion {
                entry: WaitlistEntry {
                    notified: true,
                    ..entry
                },
                booking,
                freed_at,
            }));
        }
        Ok(None)
    }
}
