use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::delivery::DeliveryChannel;
use crate::engine::Engine;
use crate::limits::{DISPATCH_BATCH, NO_SHOW_BATCH};

fn wall_clock_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

/// Background task that periodically marks overdue no-shows.
pub async fn run_no_show_job(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.run_no_show_sweep(wall_clock_ms(), NO_SHOW_BATCH).await {
            Ok(0) => {}
            Ok(n) => info!("no-show job marked {n} bookings"),
            Err(e) => tracing::warn!("no-show sweep failed: {e}"),
        }
    }
}

/// Background task that drains the notification queue.
pub async fn run_dispatch_job(
    engine: Arc<Engine>,
    channel: Arc<dyn DeliveryChannel>,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine
            .run_notification_dispatch(channel.as_ref(), DISPATCH_BATCH)
            .await
        {
            Ok(0) => {}
            Ok(n) => info!("dispatched {n} notifications"),
            Err(e) => tracing::warn!("notification dispatch failed: {e}"),
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("compacted WAL after {appends} appends"),
                Err(e) => tracing::warn!("WAL compaction failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::EventHub;
    use crate::limits::NO_SHOW_GRACE_MS;
    use crate::model::*;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("rigbook_test_jobs");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn user(email: &str, role: Role) -> User {
        User {
            id: Ulid::new(),
            name: email.to_string(),
            email: email.to_string(),
            team: "QA".into(),
            manager_email: "manager@example.com".into(),
            role,
            status: UserStatus::Active,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn sweep_marks_unattended_booking() {
        let path = test_wal_path("sweep_marks.wal");
        let engine = Arc::new(Engine::new(path, Arc::new(EventHub::new())).unwrap());

        let site = Site {
            id: Ulid::new(),
            name: "North".into(),
            city: "Manchester".into(),
            lat: 53.4808,
            lon: -2.2426,
        };
        let machine = Machine {
            id: Ulid::new(),
            name: "TM-001".into(),
            kind: MachineKind::Lab,
            category: "Payments".into(),
            status: MachineStatus::Available,
            site_id: site.id,
        };
        let requester = user("user@example.com", Role::User);
        let approver = user("approver@example.com", Role::Approver);
        let requester_id = requester.id;
        let approver_id = approver.id;
        engine
            .bootstrap(vec![site], vec![machine.clone()], vec![requester, approver])
            .await
            .unwrap();

        let now = wall_clock_ms();
        let window = TimeWindow::new(now + 3_600_000, now + 2 * 3_600_000);
        let booking_id = engine
            .submit_booking(requester_id, window, "soak test", &[machine.id])
            .await
            .unwrap();
        engine.approve_booking(approver_id, booking_id).await.unwrap();

        // From the sweep's point of view the window ended long ago
        let later = window.end + NO_SHOW_GRACE_MS + 1;
        let marked = engine.run_no_show_sweep(later, NO_SHOW_BATCH).await.unwrap();
        assert_eq!(marked, 1);

        let booking = engine.booking(&booking_id).await.unwrap();
        assert!(booking.no_show);

        // Second pass has nothing left to do
        let marked_again = engine.run_no_show_sweep(later, NO_SHOW_BATCH).await.unwrap();
        assert_eq!(marked_again, 0);
    }
}
