use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Owners cannot change or cancel a booking this close to its start.
pub const LOCKOUT_HOURS: f64 = 24.0;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

/// Upper bound only: anything at or before now is a `PastDate`, not a range error.
pub(crate) fn validate_start(start: Ms) -> Result<(), EngineError> {
    if start > crate::limits::MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// `start` must be strictly after `now`.
pub(crate) fn check_future(start: Ms, now: Ms) -> Result<(), EngineError> {
    if start <= now {
        return Err(EngineError::PastDate(start));
    }
    Ok(())
}

/// Reject when fewer than 24 hours remain before the stored appointment time.
/// Exactly 24.0 hours is still allowed.
pub(crate) fn check_lockout(appointment: Ms, now: Ms) -> Result<(), EngineError> {
    let hours_left = (appointment - now) as f64 / HOUR_MS as f64;
    if hours_left < LOCKOUT_HOURS {
        return Err(EngineError::LockoutWindowViolation { hours_left });
    }
    Ok(())
}

/// Fail with the id of the first booking whose slot overlaps a slot starting at `start`.
/// `exclude` skips a booking that is being moved in place.
pub(crate) fn check_no_conflict(
    ps: &ProviderState,
    start: Ms,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let candidate = Span::slot(start);
    for booking in ps.overlapping(&candidate) {
        if Some(booking.id) == exclude {
            continue;
        }
        if booking.span().overlaps(&candidate) {
            return Err(EngineError::SlotConflict(booking.id));
        }
    }
    Ok(())
}

pub fn has_conflict(ps: &ProviderState, start: Ms, exclude: Option<Ulid>) -> bool {
    check_no_conflict(ps, start, exclude).is_err()
}
