use ulid::Ulid;

use crate::delivery::DeliveryChannel;
use crate::limits::NO_SHOW_GRACE_MS;
use crate::model::*;

use super::conflict::now_ms;
use super::{notification_event, Engine, EngineError, SharedBooking};

impl Engine {
    /// Mark approved bookings whose window ended more than the grace period
    /// ago without a check-in. Processes at most `batch_size` per run, oldest
    /// booking first; the next run picks up the rest.
    ///
    /// `now` is a parameter so callers control the clock.
    pub async fn run_no_show_sweep(
        &self,
        now: Ms,
        batch_size: usize,
    ) -> Result<usize, EngineError> {
        let cutoff = now - NO_SHOW_GRACE_MS;

        let arcs: Vec<SharedBooking> =
            self.bookings.iter().map(|entry| entry.value().clone()).collect();
        let mut candidates: Vec<(Ulid, SharedBooking)> = Vec::new();
        for arc in arcs {
            let b = arc.read().await;
            if is_no_show(&b, cutoff) {
                let id = b.id;
                drop(b);
                candidates.push((id, arc));
            }
        }
        candidates.sort_by_key(|(id, _)| *id);
        candidates.truncate(batch_size);

        let mut marked = 0;
        for (id, arc) in candidates {
            let mut booking = arc.write().await;
            // Re-verify under the write lock; a cancel or late check-in may
            // have won the race since the scan.
            if !is_no_show(&booking, cutoff) {
                continue;
            }

            let note = Notification {
                id: Ulid::new(),
                user_id: booking.requester_id,
                message: format!(
                    "No-show recorded for booking #{id}. If this is incorrect, contact an admin."
                ),
                created_at: now,
                sent_at: None,
            };
            let events = vec![Event::NoShowMarked { id }, notification_event(&note)];
            self.wal_append(&events).await?;

            booking.no_show = true;
            drop(booking);
            self.store_notification(note);

            metrics::counter!(crate::observability::NO_SHOWS_MARKED_TOTAL).increment(1);
            marked += 1;
        }

        if marked > 0 {
            tracing::info!(marked, "no-show sweep");
        }
        Ok(marked)
    }

    /// Deliver queued notifications through `channel`, oldest first, at most
    /// `batch_size` per run. A notification is stamped sent only after the
    /// channel accepts it; failures stay queued for the next run.
    pub async fn run_notification_dispatch(
        &self,
        channel: &dyn DeliveryChannel,
        batch_size: usize,
    ) -> Result<usize, EngineError> {
        // One dispatcher at a time, or two runs could deliver the same
        // notification before either stamps it sent.
        let _guard = self.dispatch_lock.lock().await;

        let mut queue: Vec<Notification> = self
            .notifications
            .iter()
            .filter(|n| n.sent_at.is_none())
            .map(|n| n.value().clone())
            .collect();
        queue.sort_by_key(|n| (n.created_at, n.id));
        queue.truncate(batch_size);

        let mut sent = 0;
        for note in queue {
            let Some(user) = self.users.get(&note.user_id).map(|u| u.value().clone()) else {
                continue;
            };
            match channel.deliver(&user, &note.message).await {
                Ok(()) => {
                    let at = now_ms();
                    self.wal_append(&[Event::NotificationSent { id: note.id, at }])
                        .await?;
                    if let Some(mut n) = self.notifications.get_mut(&note.id) {
                        n.sent_at = Some(at);
                    }
                    metrics::counter!(crate::observability::NOTIFICATIONS_SENT_TOTAL)
                        .increment(1);
                    sent += 1;
                }
                Err(e) => {
                    tracing::warn!(notification = %note.id, error = %e, "delivery failed; will retry");
                }
            }
        }
        Ok(sent)
    }
}

fn is_no_show(booking: &Booking, cutoff: Ms) -> bool {
    booking.status == BookingStatus::Approved
        && !booking.checked_in
        && !booking.no_show
        && booking.window.end < cutoff
}
