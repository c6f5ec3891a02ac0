use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::limits::MAX_NOTE_LEN;
use crate::model::*;

use super::conflict::{find_conflict, now_ms};
use super::{audit_entry, audit_event, notification_event, Engine, EngineError};

/// System note written when approval is refused by the conflict rule.
const CONFLICT_NOTE: &str = "Rejected due to conflict with an existing approved booking.";

impl Engine {
    /// Decide a pending booking. The conflict rule is enforced here, under
    /// write locks on the booking and on every named machine, so two
    /// approvers racing over overlapping requests cannot both win.
    ///
    /// A conflict is not an error: the booking converts to rejected with a
    /// system note and the outcome reports that.
    pub async fn approve_booking(
        &self,
        actor_id: Ulid,
        booking_id: Ulid,
    ) -> Result<Decision, EngineError> {
        let actor = self.require_actor(actor_id, Capability::DecideBookings)?;
        let arc = self
            .get_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let mut booking = arc.write().await;
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::InvalidState { id: booking_id, status: booking.status });
        }

        // Lock machines in sorted id order to prevent deadlocks. The booking
        // guard is always taken first, machines second, everywhere.
        let mut guards = self.lock_machines_sorted(&booking.machine_ids).await?;

        let now = now_ms();
        let conflicted = guards
            .iter()
            .any(|guard| find_conflict(guard, &booking.window).is_some());
        if conflicted {
            drop(guards);
            let note = Notification {
                id: Ulid::new(),
                user_id: booking.requester_id,
                message: format!(
                    "Booking #{booking_id} rejected: conflict with an existing approved booking."
                ),
                created_at: now,
                sent_at: None,
            };
            let audit = audit_entry(
                &actor.email,
                "booking_reject",
                format!("Rejected booking #{booking_id} due to conflict"),
                now,
            );
            let events = vec![
                Event::BookingRejected {
                    id: booking_id,
                    approver_id: actor.id,
                    note: CONFLICT_NOTE.to_string(),
                    at: now,
                },
                notification_event(&note),
                audit_event(&audit),
            ];
            self.wal_append(&events).await?;

            booking.status = BookingStatus::Rejected;
            booking.approver_id = Some(actor.id);
            booking.decision_note = Some(CONFLICT_NOTE.to_string());
            booking.decided_at = Some(now);
            drop(booking);
            self.store_notification(note);
            self.store_audit(audit);

            metrics::counter!(
                crate::observability::BOOKING_DECISIONS_TOTAL,
                "outcome" => crate::observability::decision_label(&Decision::RejectedDueToConflict),
            )
            .increment(1);
            metrics::gauge!(crate::observability::PENDING_BOOKINGS).decrement(1.0);
            return Ok(Decision::RejectedDueToConflict);
        }

        let note = Notification {
            id: Ulid::new(),
            user_id: booking.requester_id,
            message: format!("Booking #{booking_id} approved."),
            created_at: now,
            sent_at: None,
        };
        let audit = audit_entry(
            &actor.email,
            "booking_approve",
            format!("Approved booking #{booking_id}"),
            now,
        );
        let events = vec![
            Event::BookingApproved { id: booking_id, approver_id: actor.id, at: now },
            notification_event(&note),
            audit_event(&audit),
        ];
        self.wal_append(&events).await?;

        booking.status = BookingStatus::Approved;
        booking.approver_id = Some(actor.id);
        booking.decision_note = Some("Approved".to_string());
        booking.decided_at = Some(now);
        for guard in guards.iter_mut() {
            guard.insert_allocation(Allocation { booking_id, window: booking.window });
        }
        drop(guards);
        drop(booking);
        self.store_notification(note);
        self.store_audit(audit);

        metrics::counter!(
            crate::observability::BOOKING_DECISIONS_TOTAL,
            "outcome" => crate::observability::decision_label(&Decision::Approved),
        )
        .increment(1);
        metrics::gauge!(crate::observability::PENDING_BOOKINGS).decrement(1.0);
        Ok(Decision::Approved)
    }

    /// Reject a pending booking with a note. The note is trimmed and
    /// truncated; an empty note becomes "Rejected".
    pub async fn reject_booking(
        &self,
        actor_id: Ulid,
        booking_id: Ulid,
        note: &str,
    ) -> Result<(), EngineError> {
        let actor = self.require_actor(actor_id, Capability::DecideBookings)?;
        let arc = self
            .get_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let mut booking = arc.write().await;
        if booking.status != BookingStatus::Pending {
            return Err(EngineError::InvalidState { id: booking_id, status: booking.status });
        }

        let trimmed = note.trim();
        let note_text = if trimmed.is_empty() {
            "Rejected".to_string()
        } else {
            trimmed.chars().take(MAX_NOTE_LEN).collect()
        };

        let now = now_ms();
        let notification = Notification {
            id: Ulid::new(),
            user_id: booking.requester_id,
            message: format!("Booking #{booking_id} rejected: {note_text}"),
            created_at: now,
            sent_at: None,
        };
        let audit = audit_entry(
            &actor.email,
            "booking_reject",
            format!("Rejected booking #{booking_id}"),
            now,
        );
        let events = vec![
            Event::BookingRejected {
                id: booking_id,
                approver_id: actor.id,
                note: note_text.clone(),
                at: now,
            },
            notification_event(&notification),
            audit_event(&audit),
        ];
        self.wal_append(&events).await?;

        booking.status = BookingStatus::Rejected;
        booking.approver_id = Some(actor.id);
        booking.decision_note = Some(note_text);
        booking.decided_at = Some(now);
        drop(booking);
        self.store_notification(notification);
        self.store_audit(audit);

        metrics::counter!(
            crate::observability::BOOKING_DECISIONS_TOTAL,
            "outcome" => crate::observability::DECISION_REJECTED,
        )
        .increment(1);
        metrics::gauge!(crate::observability::PENDING_BOOKINGS).decrement(1.0);
        Ok(())
    }

    /// Cancel one's own pending or approved booking. Cancelling an approved
    /// booking frees its machine calendars immediately.
    pub async fn cancel_booking(
        &self,
        actor_id: Ulid,
        booking_id: Ulid,
    ) -> Result<(), EngineError> {
        let actor = self.require_actor(actor_id, Capability::SubmitBookings)?;
        let arc = self
            .get_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let mut booking = arc.write().await;
        if booking.requester_id != actor.id {
            return Err(EngineError::Forbidden("only the requester may cancel"));
        }
        let was = booking.status;
        if was != BookingStatus::Pending && was != BookingStatus::Approved {
            return Err(EngineError::InvalidState { id: booking_id, status: was });
        }

        // Same lock order as approval: booking first, then machines sorted
        let mut guards = if was == BookingStatus::Approved {
            self.lock_machines_sorted(&booking.machine_ids).await?
        } else {
            Vec::new()
        };

        let now = now_ms();
        let audit = audit_entry(
            &actor.email,
            "booking_cancel",
            format!("Cancelled booking #{booking_id}"),
            now,
        );
        let events = vec![
            Event::BookingCancelled { id: booking_id, at: now },
            audit_event(&audit),
        ];
        self.wal_append(&events).await?;

        for guard in guards.iter_mut() {
            guard.remove_allocation(booking_id);
        }
        drop(guards);
        booking.status = BookingStatus::Cancelled;
        booking.cancelled_at = Some(now);
        drop(booking);
        self.store_audit(audit);

        metrics::counter!(crate::observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        if was == BookingStatus::Pending {
            metrics::gauge!(crate::observability::PENDING_BOOKINGS).decrement(1.0);
        }
        Ok(())
    }

    /// Record presence for an approved booking. Only valid while the clock
    /// is inside the reserved window, endpoints included. Repeated check-in
    /// is a no-op.
    pub async fn check_in(&self, actor_id: Ulid, booking_id: Ulid) -> Result<(), EngineError> {
        let actor = self.require_actor(actor_id, Capability::SubmitBookings)?;
        let arc = self
            .get_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let mut booking = arc.write().await;
        if booking.requester_id != actor.id {
            return Err(EngineError::Forbidden("only the requester may check in"));
        }
        if booking.status != BookingStatus::Approved {
            return Err(EngineError::InvalidState { id: booking_id, status: booking.status });
        }
        if booking.checked_in {
            return Ok(());
        }
        let now = now_ms();
        if now < booking.window.start || now > booking.window.end {
            return Err(EngineError::OutsideWindow(booking_id));
        }

        let audit = audit_entry(
            &actor.email,
            "booking_checkin",
            format!("Checked in for booking #{booking_id}"),
            now,
        );
        let events = vec![Event::CheckedIn { id: booking_id }, audit_event(&audit)];
        self.wal_append(&events).await?;

        booking.checked_in = true;
        drop(booking);
        self.store_audit(audit);

        metrics::counter!(crate::observability::CHECKINS_TOTAL).increment(1);
        Ok(())
    }

    /// Acquire write guards for a booking's machines, in sorted id order.
    pub(super) async fn lock_machines_sorted(
        &self,
        machine_ids: &[Ulid],
    ) -> Result<Vec<OwnedRwLockWriteGuard<MachineState>>, EngineError> {
        let mut sorted: Vec<Ulid> = machine_ids.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for machine_id in &sorted {
            let ms = self
                .get_machine(machine_id)
                .ok_or(EngineError::UnknownMachine(*machine_id))?;
            guards.push(ms.write_owned().await);
        }
        Ok(guards)
    }
}
