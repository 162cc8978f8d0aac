use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// One hour in ms.
pub const HOUR_MS: Ms = 3_600_000;

/// Every appointment occupies exactly one slot of this length.
pub const SLOT_DURATION_MS: Ms = HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// The slot an appointment starting at `start` occupies.
    pub fn slot(start: Ms) -> Self {
        Self::new(start, start + SLOT_DURATION_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Who is calling. Resolved by the front end before the engine is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Ulid,
    pub is_admin: bool,
}

impl Caller {
    pub fn user(user_id: Ulid) -> Self {
        Self { user_id, is_admin: false }
    }

    pub fn admin(user_id: Ulid) -> Self {
        Self { user_id, is_admin: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub provider_id: Ulid,
    /// Appointment start. The appointment lasts `SLOT_DURATION_MS`.
    pub start: Ms,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::slot(self.start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub user_id: Ulid,
    pub provider_id: Ulid,
    pub preferred_at: Ms,
    /// Set only on the audit copy of an entry consumed by promotion.
    pub notified: bool,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: Ulid,
    pub name: String,
    pub experience_years: u32,
    pub specialty: String,
}

#[derive(Debug, Clone)]
pub struct ProviderState {
    pub info: ProviderInfo,
    /// Bookings, sorted by `start`.
    pub bookings: Vec<Booking>,
    /// Waitlist entries in the order they were joined.
    pub waitlist: Vec<WaitlistEntry>,
    /// Set under the write lock when the provider is deleted. Tasks that were
    /// queued on the lock must treat the provider as gone.
    pub deleted: bool,
}

impl ProviderState {
    pub fn new(info: ProviderInfo) -> Self {
        Self {
            info,
            bookings: Vec::new(),
            waitlist: Vec::new(),
            deleted: false,
        }
    }

    pub fn id(&self) -> Ulid {
        self.info.id
    }

    /// Insert booking maintaining sort order by start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.start, |b| b.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// Return only bookings whose slot overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span().end > query.start)
    }

    pub fn push_waitlist(&mut self, entry: WaitlistEntry) {
        self.waitlist.push(entry);
    }

    pub fn remove_waitlist(&mut self, id: Ulid) -> Option<WaitlistEntry> {
        let pos = self.waitlist.iter().position(|e| e.id == id)?;
        Some(self.waitlist.remove(pos))
    }

    /// Un-notified entries, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &WaitlistEntry> {
        self.waitlist.iter().filter(|e| !e.notified)
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProviderCreated {
        id: Ulid,
        name: String,
        experience_years: u32,
        specialty: String,
    },
    ProviderDeleted {
        id: Ulid,
    },
    /// Full replacement of the provider's details.
    ProviderUpdated {
        info: ProviderInfo,
    },
    BookingCreated {
        booking: Booking,
    },
    /// `booking` is the new state; the previous provider/user are kept so that
    /// replay can unlink the old position.
    BookingUpdated {
        previous_provider_id: Ulid,
        previous_user_id: Ulid,
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        provider_id: Ulid,
        user_id: Ulid,
    },
    WaitlistJoined {
        entry: WaitlistEntry,
    },
    WaitlistLeft {
        id: Ulid,
        provider_id: Ulid,
        user_id: Ulid,
    },
    /// Booking created and waitlist entry consumed in one record.
    WaitlistPromoted {
        entry_id: Ulid,
        booking: Booking,
    },
}

impl Event {
    /// Providers whose state this event touches (none for provider create/delete).
    pub fn provider_ids(&self) -> Vec<Ulid> {
        match self {
            Event::ProviderCreated { .. } | Event::ProviderDeleted { .. } => Vec::new(),
            Event::BookingCreated { booking } | Event::WaitlistPromoted { booking, .. } => {
                vec![booking.provider_id]
            }
            Event::BookingUpdated {
                previous_provider_id,
                booking,
                ..
            } => {
                if *previous_provider_id == booking.provider_id {
                    vec![booking.provider_id]
                } else {
                    vec![*previous_provider_id, booking.provider_id]
                }
            }
            Event::BookingCancelled { provider_id, .. } | Event::WaitlistLeft { provider_id, .. } => {
                vec![*provider_id]
            }
            Event::WaitlistJoined { entry } => vec![entry.provider_id],
            Event::ProviderUpdated { info } => vec![info.id],
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// A booking with its provider's details attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub booking: Booking,
    pub provider: ProviderInfo,
}

/// Outcome of a successful waitlist promotion: who gets notified about which slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    /// The consumed entry, flagged `notified`.
    pub entry: WaitlistEntry,
    pub booking: Booking,
    /// Start of the slot whose release triggered the promotion.
    pub freed_at: Ms,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ProviderInfo {
        ProviderInfo {
            id: Ulid::new(),
            name: "Dr. Test".into(),
            experience_years: 3,
            specialty: "General".into(),
        }
    }

    fn booking_at(start: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            user_id: Ulid::new(),
            provider_id: Ulid::new(),
            start,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::slot(1000);
        assert_eq!(s.duration_ms(), SLOT_DURATION_MS);
        assert_eq!(s.end, 1000 + HOUR_MS);
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn bookings_kept_sorted() {
        let mut ps = ProviderState::new(info());
        ps.insert_booking(booking_at(3 * HOUR_MS));
        ps.insert_booking(booking_at(HOUR_MS));
        ps.insert_booking(booking_at(2 * HOUR_MS));
        let starts: Vec<Ms> = ps.bookings.iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![HOUR_MS, 2 * HOUR_MS, 3 * HOUR_MS]);
    }

    #[test]
    fn remove_booking_by_id() {
        let mut ps = ProviderState::new(info());
        let b = booking_at(HOUR_MS);
        let id = b.id;
        ps.insert_booking(b);
        assert!(ps.remove_booking(Ulid::new()).is_none());
        assert_eq!(ps.remove_booking(id).map(|b| b.id), Some(id));
        assert!(ps.bookings.is_empty());
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut ps = ProviderState::new(info());
        ps.insert_booking(booking_at(0)); // [0h, 1h)
        ps.insert_booking(booking_at(2 * HOUR_MS)); // [2h, 3h)
        ps.insert_booking(booking_at(5 * HOUR_MS)); // [5h, 6h)

        let query = Span::new(HOUR_MS + HOUR_MS / 2, 4 * HOUR_MS);
        let hits: Vec<_> = ps.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].start, 2 * HOUR_MS);
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut ps = ProviderState::new(info());
        ps.insert_booking(booking_at(0));
        let hits: Vec<_> = ps.overlapping(&Span::slot(HOUR_MS)).collect();
        assert!(hits.is_empty());
    }

    #[test]
    fn pending_skips_notified_entries() {
        let mut ps = ProviderState::new(info());
        let mk = |notified| WaitlistEntry {
            id: Ulid::new(),
            user_id: Ulid::new(),
            provider_id: Ulid::nil(),
            preferred_at: 0,
            notified,
            created_at: 0,
        };
        ps.push_waitlist(mk(false));
        ps.push_waitlist(mk(true));
        ps.push_waitlist(mk(false));
        assert_eq!(ps.pending().count(), 2);
    }

    #[test]
    fn moved_booking_touches_both_providers() {
        let b = booking_at(0);
        let previous = Ulid::new();
        let event = Event::BookingUpdated {
            previous_provider_id: previous,
            previous_user_id: b.user_id,
            booking: b.clone(),
        };
        assert_eq!(event.provider_ids(), vec![previous, b.provider_id]);

        let in_place = Event::BookingUpdated {
            previous_provider_id: b.provider_id,
            previous_user_id: b.user_id,
            booking: b.clone(),
        };
        assert_eq!(in_place.provider_ids(), vec![b.provider_id]);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::WaitlistPromoted {
            entry_id: Ulid::new(),
            booking: booking_at(HOUR_MS),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
