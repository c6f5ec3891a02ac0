use crate::limits;
use crate::model::{MachineState, Ms, TimeWindow};

use super::error::WindowViolation;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Admission-time window checks, in user-visible order: past, horizon,
/// then end-before-start. A start up to one minute ago still passes.
pub(crate) fn validate_window(window: &TimeWindow, now: Ms) -> Result<(), EngineError> {
    if window.start < limits::MIN_VALID_TIMESTAMP_MS
        || window.end > limits::MAX_VALID_TIMESTAMP_MS
    {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if window.start < now - limits::START_GRACE_MS {
        return Err(EngineError::InvalidWindow(WindowViolation::StartInPast));
    }
    if window.start > now + limits::BOOKING_HORIZON_MS {
        return Err(EngineError::InvalidWindow(WindowViolation::StartBeyondHorizon));
    }
    if window.end <= window.start {
        return Err(EngineError::InvalidWindow(WindowViolation::EndNotAfterStart));
    }
    Ok(())
}

/// First approved allocation on this machine that overlaps `window`,
/// if any. Overlap is half-open: touching windows do not conflict.
pub(crate) fn find_conflict(ms: &MachineState, window: &TimeWindow) -> Option<ulid::Ulid> {
    ms.overlapping(window).next().map(|a| a.booking_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Allocation, Machine, MachineKind, MachineStatus};
    use ulid::Ulid;

    const HOUR: Ms = 3_600_000;

    fn machine_state() -> MachineState {
        MachineState {
            machine: Machine {
                id: Ulid::new(),
                name: "TM-001".into(),
                kind: MachineKind::Lab,
                category: "Payments".into(),
                status: MachineStatus::Available,
                site_id: Ulid::new(),
            },
            allocations: Vec::new(),
        }
    }

    #[test]
    fn window_validation_order() {
        let now: Ms = 100 * HOUR;

        // Past start reported before the end<=start problem
        let past_and_backwards = TimeWindow { start: now - HOUR, end: now - 2 * HOUR };
        assert!(matches!(
            validate_window(&past_and_backwards, now),
            Err(EngineError::InvalidWindow(WindowViolation::StartInPast))
        ));

        let beyond = TimeWindow {
            start: now + limits::BOOKING_HORIZON_MS + 1,
            end: now + limits::BOOKING_HORIZON_MS + HOUR,
        };
        assert!(matches!(
            validate_window(&beyond, now),
            Err(EngineError::InvalidWindow(WindowViolation::StartBeyondHorizon))
        ));

        let backwards = TimeWindow { start: now + 2 * HOUR, end: now + HOUR };
        assert!(matches!(
            validate_window(&backwards, now),
            Err(EngineError::InvalidWindow(WindowViolation::EndNotAfterStart))
        ));

        let ok = TimeWindow { start: now + HOUR, end: now + 2 * HOUR };
        assert!(validate_window(&ok, now).is_ok());
    }

    #[test]
    fn start_grace_allows_recent_past() {
        let now: Ms = 100 * HOUR;
        let just_started = TimeWindow { start: now - 30_000, end: now + HOUR };
        assert!(validate_window(&just_started, now).is_ok());

        let too_old = TimeWindow { start: now - 2 * limits::START_GRACE_MS, end: now + HOUR };
        assert!(matches!(
            validate_window(&too_old, now),
            Err(EngineError::InvalidWindow(WindowViolation::StartInPast))
        ));
    }

    #[test]
    fn sanity_bounds_rejected_first() {
        let now: Ms = 100 * HOUR;
        let absurd = TimeWindow { start: -5, end: HOUR };
        assert!(matches!(
            validate_window(&absurd, now),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn conflict_on_overlap_only() {
        let mut ms = machine_state();
        let existing = Ulid::new();
        ms.insert_allocation(Allocation {
            booking_id: existing,
            window: TimeWindow::new(10 * HOUR, 12 * HOUR),
        });

        let overlapping = TimeWindow::new(11 * HOUR, 13 * HOUR);
        assert_eq!(find_conflict(&ms, &overlapping), Some(existing));

        // Touching at the boundary is fine
        let adjacent = TimeWindow::new(12 * HOUR, 14 * HOUR);
        assert_eq!(find_conflict(&ms, &adjacent), None);

        let disjoint = TimeWindow::new(20 * HOUR, 21 * HOUR);
        assert_eq!(find_conflict(&ms, &disjoint), None);
    }
}
