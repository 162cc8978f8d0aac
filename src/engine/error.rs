use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug)]
pub enum EngineError {
    ProviderNotFound(Ulid),
    /// Booking or waitlist entry.
    NotFound(Ulid),
    /// The caller has no active booking.
    NoBooking(Ulid),
    DuplicateBooking {
        user_id: Ulid,
        existing: Ulid,
    },
    PastDate(Ms),
    SlotConflict(Ulid),
    LockoutWindowViolation {
        hours_left: f64,
    },
    AlreadyWaitlisted(Ulid),
    AlreadyExists(Ulid),
    NotAuthorized,
    ProviderInUse(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ProviderNotFound(id) => write!(f, "provider not found: {id}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::NoBooking(user) => write!(f, "no booking found for user {user}"),
            EngineError::DuplicateBooking { user_id, existing } => write!(
                f,
                "user {user_id} already has booking {existing}; edit or cancel it first"
            ),
            EngineError::PastDate(start) => {
                write!(f, "appointment time {start} must be in the future")
            }
            EngineError::SlotConflict(id) => write!(f, "slot conflicts with booking: {id}"),
            EngineError::LockoutWindowViolation { hours_left } => write!(
                f,
                "bookings can only be changed at least 24 hours before the appointment ({hours_left:.2}h left)"
            ),
            EngineError::AlreadyWaitlisted(id) => {
                write!(f, "already on the waitlist for this provider (entry {id})")
            }
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NotAuthorized => write!(f, "not authorized"),
            EngineError::ProviderInUse(id) => {
                write!(f, "cannot delete provider {id}: has bookings or waitlist entries")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
