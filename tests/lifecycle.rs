use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::broadcast;
use ulid::Ulid;

use rigbook::delivery::DeliveryChannel;
use rigbook::engine::{Engine, EngineError};
use rigbook::hub::EventHub;
use rigbook::limits::{DISPATCH_BATCH, NO_SHOW_BATCH, NO_SHOW_GRACE_MS};
use rigbook::model::*;
use rigbook::seed;

const H: Ms = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

fn fresh_wal_path() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("rigbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("rigbook.wal")
}

fn wall_ms() -> Ms {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as Ms
}

/// Delivery channel that collects (email, message) pairs in order.
struct CollectingChannel {
    sent: Mutex<Vec<(String, String)>>,
}

impl CollectingChannel {
    fn new() -> Self {
        Self { sent: Mutex::new(Vec::new()) }
    }

    fn messages(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryChannel for CollectingChannel {
    async fn deliver(&self, user: &User, message: &str) -> std::io::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((user.email.clone(), message.to_string()));
        Ok(())
    }
}

/// Wait for a live hub event with timeout.
async fn recv_event(
    rx: &mut broadcast::Receiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv())
        .await
        .ok()
        .and_then(|r| r.ok())
}

const SEED_JSON: &str = r#"{
    "sites": [
        {"name": "Test Hub North", "city": "Manchester", "lat": 53.4808, "lon": -2.2426},
        {"name": "Test Hub South", "city": "London", "lat": 51.5072, "lon": -0.1276}
    ],
    "machines": [
        {"name": "TM-ALPHA", "kind": "lab", "category": "Payments", "site": "Test Hub North"},
        {"name": "TM-BETA", "kind": "lab", "category": "Devices", "site": "Test Hub North"},
        {"name": "TM-GAMMA", "kind": "virtual", "category": "Devices", "site": "Test Hub South",
         "out_of_service": true}
    ],
    "users": [
        {"name": "Seed Admin", "email": "admin@example.com", "team": "Operations",
         "manager_email": "director@example.com", "role": "admin", "active": true},
        {"name": "Seed Approver", "email": "approver@example.com", "team": "QA Governance",
         "manager_email": "director@example.com", "role": "approver", "active": true}
    ]
}"#;

// ── Seeding ──────────────────────────────────────────────────

#[tokio::test]
async fn seed_file_boots_the_store() {
    let wal = fresh_wal_path();
    let seed_path = wal.with_file_name("seed.json");
    std::fs::write(&seed_path, SEED_JSON).unwrap();

    let engine = Engine::new(wal, Arc::new(EventHub::new())).unwrap();
    let seed_file = seed::load_from_path(&seed_path).unwrap();
    assert!(seed::apply(&engine, seed_file, wall_ms()).await.unwrap());

    assert_eq!(engine.list_sites().len(), 2);
    assert_eq!(engine.list_machines(None).await.len(), 3);
    assert!(engine.user_by_email("admin@example.com").is_some());
    assert_eq!(engine.active_users().len(), 2);

    let stats = engine.dashboard_stats(wall_ms()).await;
    assert_eq!(stats.machines_out_of_service, 1);

    // A second apply against the now-populated store is a no-op
    let again = seed::load_from_path(&seed_path).unwrap();
    assert!(!seed::apply(&engine, again, wall_ms()).await.unwrap());
    assert_eq!(engine.list_machines(None).await.len(), 3);
}

#[tokio::test]
async fn demo_seed_loads_and_lists() {
    let engine = Engine::new(fresh_wal_path(), Arc::new(EventHub::new())).unwrap();
    assert!(seed::apply(&engine, seed::demo(), wall_ms()).await.unwrap());

    assert_eq!(engine.list_sites().len(), 5);
    assert_eq!(engine.list_machines(None).await.len(), 100);
    assert_eq!(engine.active_users().len(), 3);

    // The demo rotates a few machines out of service
    let stats = engine.dashboard_stats(wall_ms()).await;
    assert_eq!(stats.machines_out_of_service, 8);

    let virtuals = engine.list_machines(Some("virtual")).await;
    assert_eq!(virtuals.len(), 25);
}

// ── Full lifecycle ───────────────────────────────────────────

/// Follows one requester through the whole system: seeded store, account
/// registration and activation, two approved bookings, a live subscription,
/// dispatch, a restart from the WAL, a conflict probe against the rebuilt
/// calendar, a no-show sweep, compaction, and a final restart.
#[tokio::test]
async fn booking_lifecycle_survives_restarts() {
    let wal = fresh_wal_path();
    let seed_path = wal.with_file_name("seed.json");
    std::fs::write(&seed_path, SEED_JSON).unwrap();

    let engine = Engine::new(wal.clone(), Arc::new(EventHub::new())).unwrap();
    let seed_file = seed::load_from_path(&seed_path).unwrap();
    assert!(seed::apply(&engine, seed_file, wall_ms()).await.unwrap());

    let admin = engine.user_by_email("admin@example.com").unwrap().id;
    let approver = engine.user_by_email("approver@example.com").unwrap().id;
    let alpha = engine.list_machines(Some("TM-ALPHA")).await[0].id;
    let beta = engine.list_machines(Some("TM-BETA")).await[0].id;

    // Self-service registration, then admin activation
    let requester = engine
        .register_user("Robin Field", "robin@example.com", "Engineering", "lead@example.com")
        .await
        .unwrap();
    assert!(matches!(
        engine
            .submit_booking(requester, TimeWindow::new(wall_ms() + H, wall_ms() + 2 * H), "x", &[alpha])
            .await,
        Err(EngineError::Forbidden(_))
    ));
    engine.approve_user(admin, requester).await.unwrap();

    // Booking A is already in progress when approved, so check-in works
    let now = wall_ms();
    let window_a = TimeWindow::new(now - 30_000, now + H);
    let booking_a = engine
        .submit_booking(requester, window_a, "firmware soak", &[alpha])
        .await
        .unwrap();

    let mut live = engine.hub.subscribe(requester);
    assert_eq!(
        engine.approve_booking(approver, booking_a).await.unwrap(),
        Decision::Approved
    );
    let event = recv_event(&mut live, Duration::from_secs(2)).await.unwrap();
    assert_eq!(event.message, format!("Booking #{booking_a} approved."));

    engine.check_in(requester, booking_a).await.unwrap();

    // Booking B is later today and will be left unattended
    let window_b = TimeWindow::new(now + H, now + 2 * H);
    let booking_b = engine
        .submit_booking(requester, window_b, "regression pass", &[beta])
        .await
        .unwrap();
    engine.approve_booking(approver, booking_b).await.unwrap();

    // Queued so far: account approval (1), decider notes for two submissions
    // (2 deciders x 2), decision notes for two approvals (2)
    let channel = CollectingChannel::new();
    let sent = engine
        .run_notification_dispatch(&channel, DISPATCH_BATCH)
        .await
        .unwrap();
    assert_eq!(sent, 7);
    assert!(channel
        .messages()
        .iter()
        .any(|(email, m)| email == "robin@example.com" && m.contains("approved")));

    // ── Restart: replay the WAL into a fresh engine ──────────
    let engine2 = Engine::new(wal.clone(), Arc::new(EventHub::new())).unwrap();

    let b = engine2.booking(&booking_a).await.unwrap();
    assert_eq!(b.status, BookingStatus::Approved);
    assert!(b.checked_in);
    assert_eq!(engine2.booking(&booking_b).await.unwrap().status, BookingStatus::Approved);
    assert_eq!(
        engine2.user_by_email("robin@example.com").unwrap().status,
        UserStatus::Active
    );
    let unsent = engine2
        .notifications_for(requester)
        .iter()
        .filter(|n| n.sent_at.is_none())
        .count();
    assert_eq!(unsent, 0, "sent stamps survive replay");

    // The rebuilt calendar still defends booking B's slot
    let probe_window = TimeWindow::new(window_b.start + H / 2, window_b.end + H / 2);
    let probe = engine2
        .submit_booking(requester, probe_window, "opportunist", &[beta])
        .await
        .unwrap();
    assert_eq!(
        engine2.approve_booking(approver, probe).await.unwrap(),
        Decision::RejectedDueToConflict
    );

    // Sweep well past booking B's window: B is marked, A was checked in
    let marked = engine2
        .run_no_show_sweep(window_b.end + NO_SHOW_GRACE_MS + 1, NO_SHOW_BATCH)
        .await
        .unwrap();
    assert_eq!(marked, 1);
    assert!(engine2.booking(&booking_b).await.unwrap().no_show);
    assert!(!engine2.booking(&booking_a).await.unwrap().no_show);

    // Deliver the backlog created since the first dispatch: the probe's
    // decider notes (2), its rejection (1), and the no-show notice (1)
    let channel = CollectingChannel::new();
    let sent = engine2
        .run_notification_dispatch(&channel, DISPATCH_BATCH)
        .await
        .unwrap();
    assert_eq!(sent, 4);
    assert!(channel
        .messages()
        .iter()
        .any(|(_, m)| m.contains("No-show recorded")));

    // ── Compact, then restart once more ──────────────────────
    let audit_before = engine2.audit_tail(50).len();
    engine2.compact_wal().await.unwrap();

    let engine3 = Engine::new(wal, Arc::new(EventHub::new())).unwrap();
    assert!(engine3.booking(&booking_b).await.unwrap().no_show);
    assert!(engine3.booking(&booking_a).await.unwrap().checked_in);
    assert_eq!(
        engine3.booking(&probe).await.unwrap().status,
        BookingStatus::Rejected
    );
    assert_eq!(engine3.audit_tail(50).len(), audit_before);
    assert!(engine3.pending_queue().await.is_empty());

    let upcoming = engine3.upcoming(wall_ms()).await;
    assert_eq!(upcoming.len(), 2);
    assert_eq!(upcoming[0].id, booking_a);
    assert_eq!(upcoming[1].id, booking_b);

    let report = engine3.utilisation(wall_ms(), 7).await;
    assert_eq!(report.by_machine.len(), 2);
    assert!(report.by_machine.iter().all(|m| m.hours > 0.9));
}
