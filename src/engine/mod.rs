mod admission;
mod approval;
mod conflict;
mod error;
mod lifecycle;
mod queries;

pub use error::{EngineError, WindowViolation};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::hub::EventHub;
use crate::model::*;
use crate::wal::Wal;

pub type SharedMachine = Arc<RwLock<MachineState>>;
pub type SharedBooking = Arc<RwLock<Booking>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        /// One logical transition: domain event plus its notification and
        /// audit tail. All-or-nothing on disk.
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                                .record(batch_event_count(&batch) as f64);
                            let flush_start = std::time::Instant::now();
                            let result = flush_batch(&mut wal, &mut batch);
                            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                                .record(flush_start.elapsed().as_secs_f64());
                            respond_batch(&mut batch, &result);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch_event_count(&batch) as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &mut batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    respond_batch(&mut batch, &result);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

fn batch_event_count(batch: &[PendingAppend]) -> usize {
    batch.iter().map(|(events, _)| events.len()).sum()
}

fn flush_batch(wal: &mut Wal, batch: &mut [PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'append: for (events, _) in batch.iter() {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'append;
            }
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

pub struct Engine {
    pub machines: DashMap<Ulid, SharedMachine>,
    pub bookings: DashMap<Ulid, SharedBooking>,
    pub sites: DashMap<Ulid, Site>,
    pub users: DashMap<Ulid, User>,
    /// Lowercased email → user id, for registration dedupe and lookup.
    pub(super) email_index: DashMap<String, Ulid>,
    pub notifications: DashMap<Ulid, Notification>,
    pub audit: DashMap<Ulid, AuditEntry>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub hub: Arc<EventHub>,
    /// Serializes dispatch runs so a notification is never delivered twice.
    pub(super) dispatch_lock: Mutex<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, hub: Arc<EventHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            machines: DashMap::new(),
            bookings: DashMap::new(),
            sites: DashMap::new(),
            users: DashMap::new(),
            email_index: DashMap::new(),
            notifications: DashMap::new(),
            audit: DashMap::new(),
            wal_tx,
            hub,
            dispatch_lock: Mutex::new(()),
        };

        // Replay events — we're the sole owner of these Arcs, so try_read/try_write
        // always succeed instantly (no contention). Never use blocking_read/blocking_write
        // here because this may run inside an async context.
        for event in events {
            engine.apply_replayed(event);
        }

        let pending = engine
            .bookings
            .iter()
            .filter(|entry| {
                entry.value().try_read().expect("replay: uncontended read").status
                    == BookingStatus::Pending
            })
            .count();
        metrics::gauge!(crate::observability::PENDING_BOOKINGS).set(pending as f64);

        Ok(engine)
    }

    /// Rebuild in-memory state from one replayed event. Single-threaded:
    /// only `new` calls this, before the engine is shared.
    fn apply_replayed(&self, event: Event) {
        match event {
            Event::SiteAdded { id, name, city, lat, lon } => {
                self.sites.insert(id, Site { id, name, city, lat, lon });
            }
            Event::MachineRegistered { id, name, kind, category, status, site_id } => {
                let machine = Machine { id, name, kind, category, status, site_id };
                self.machines
                    .insert(id, Arc::new(RwLock::new(MachineState::new(machine))));
            }
            Event::MachineStatusChanged { id, status } => {
                if let Some(entry) = self.machines.get(&id) {
                    let ms = entry.value().clone();
                    ms.try_write().expect("replay: uncontended write").machine.status = status;
                }
            }
            Event::UserRegistered {
                id,
                name,
                email,
                team,
                manager_email,
                role,
                status,
                created_at,
            } => {
                self.email_index.insert(email.clone(), id);
                self.users.insert(
                    id,
                    User { id, name, email, team, manager_email, role, status, created_at },
                );
            }
            Event::UserActivated { id } => {
                if let Some(mut user) = self.users.get_mut(&id) {
                    user.status = UserStatus::Active;
                }
            }
            Event::UserRejected { id } => {
                if let Some(mut user) = self.users.get_mut(&id) {
                    user.status = UserStatus::Rejected;
                }
            }
            Event::BookingSubmitted { id, requester_id, window, purpose, machine_ids } => {
                let booking = Booking {
                    id,
                    requester_id,
                    window,
                    purpose,
                    status: BookingStatus::Pending,
                    machine_ids,
                    approver_id: None,
                    decision_note: None,
                    decided_at: None,
                    cancelled_at: None,
                    checked_in: false,
                    no_show: false,
                };
                self.bookings.insert(id, Arc::new(RwLock::new(booking)));
            }
            Event::BookingApproved { id, approver_id, at } => {
                if let Some(entry) = self.bookings.get(&id) {
                    let arc = entry.value().clone();
                    let mut booking = arc.try_write().expect("replay: uncontended write");
                    booking.status = BookingStatus::Approved;
                    booking.approver_id = Some(approver_id);
                    booking.decision_note = Some("Approved".to_string());
                    booking.decided_at = Some(at);
                    for machine_id in &booking.machine_ids {
                        if let Some(m) = self.machines.get(machine_id) {
                            let ms = m.value().clone();
                            ms.try_write()
                                .expect("replay: uncontended write")
                                .insert_allocation(Allocation {
                                    booking_id: id,
                                    window: booking.window,
                                });
                        }
                    }
                }
            }
            Event::BookingRejected { id, approver_id, note, at } => {
                if let Some(entry) = self.bookings.get(&id) {
                    let arc = entry.value().clone();
                    let mut booking = arc.try_write().expect("replay: uncontended write");
                    booking.status = BookingStatus::Rejected;
                    booking.approver_id = Some(approver_id);
                    booking.decision_note = Some(note);
                    booking.decided_at = Some(at);
                }
            }
            Event::BookingCancelled { id, at } => {
                if let Some(entry) = self.bookings.get(&id) {
                    let arc = entry.value().clone();
                    let mut booking = arc.try_write().expect("replay: uncontended write");
                    if booking.status == BookingStatus::Approved {
                        for machine_id in &booking.machine_ids {
                            if let Some(m) = self.machines.get(machine_id) {
                                let ms = m.value().clone();
                                ms.try_write()
                                    .expect("replay: uncontended write")
                                    .remove_allocation(id);
                            }
                        }
                    }
                    booking.status = BookingStatus::Cancelled;
                    booking.cancelled_at = Some(at);
                }
            }
            Event::CheckedIn { id } => {
                if let Some(entry) = self.bookings.get(&id) {
                    let arc = entry.value().clone();
                    arc.try_write().expect("replay: uncontended write").checked_in = true;
                }
            }
            Event::NoShowMarked { id } => {
                if let Some(entry) = self.bookings.get(&id) {
                    let arc = entry.value().clone();
                    arc.try_write().expect("replay: uncontended write").no_show = true;
                }
            }
            Event::NotificationQueued { id, user_id, message, created_at } => {
                self.notifications
                    .insert(id, Notification { id, user_id, message, created_at, sent_at: None });
            }
            Event::NotificationSent { id, at } => {
                if let Some(mut n) = self.notifications.get_mut(&id) {
                    n.sent_at = Some(at);
                }
            }
            Event::AuditRecorded { id, at, actor_email, action, detail } => {
                self.audit.insert(id, AuditEntry { id, at, actor_email, action, detail });
            }
        }
    }

    /// Write a transition to the WAL via the background group-commit writer.
    /// Nothing may be applied to in-memory state until this returns Ok.
    pub(super) async fn wal_append(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_machine(&self, id: &Ulid) -> Option<SharedMachine> {
        self.machines.get(id).map(|e| e.value().clone())
    }

    pub fn get_booking(&self, id: &Ulid) -> Option<SharedBooking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    /// Store a committed notification and wake any live subscriber.
    pub(super) fn store_notification(&self, notification: Notification) {
        self.hub.publish(&notification);
        self.notifications.insert(notification.id, notification);
    }

    pub(super) fn store_audit(&self, entry: AuditEntry) {
        self.audit.insert(entry.id, entry);
    }

    /// Actor lookup + status + capability gate, in that order.
    pub(super) fn require_actor(
        &self,
        actor_id: Ulid,
        cap: Capability,
    ) -> Result<User, EngineError> {
        let user = self
            .users
            .get(&actor_id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::NotFound(actor_id))?;
        if user.status != UserStatus::Active {
            return Err(EngineError::Forbidden("account is not active"));
        }
        if !user.role.can(cap) {
            return Err(EngineError::Forbidden("role does not allow this action"));
        }
        Ok(user)
    }

    /// Queued notifications for every active user who can decide bookings.
    pub(super) fn notify_deciders(&self, message: &str, created_at: Ms) -> Vec<Notification> {
        let mut recipients: Vec<Ulid> = self
            .users
            .iter()
            .filter(|u| {
                u.status == UserStatus::Active && u.role.can(Capability::DecideBookings)
            })
            .map(|u| u.id)
            .collect();
        recipients.sort();
        recipients
            .into_iter()
            .map(|user_id| Notification {
                id: Ulid::new(),
                user_id,
                message: message.to_string(),
                created_at,
                sent_at: None,
            })
            .collect()
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate
    /// the current state. Audit history is preserved in full.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let events = self.snapshot_events().await;
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Minimal event sequence that replays into the current state.
    /// Ordering matters: sites and machines before bookings, submissions
    /// before decisions, so replay finds every referenced entity. Machine
    /// allocations are not snapshot — replaying the approvals rebuilds them.
    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        let mut sites: Vec<Site> = self.sites.iter().map(|s| s.value().clone()).collect();
        sites.sort_by_key(|s| s.id);
        for s in sites {
            events.push(Event::SiteAdded {
                id: s.id,
                name: s.name,
                city: s.city,
                lat: s.lat,
                lon: s.lon,
            });
        }

        let machine_arcs: Vec<SharedMachine> =
            self.machines.iter().map(|entry| entry.value().clone()).collect();
        let mut machines = Vec::with_capacity(machine_arcs.len());
        for arc in machine_arcs {
            machines.push(arc.read().await.machine.clone());
        }
        machines.sort_by_key(|m| m.id);
        for m in machines {
            // Current status folds into the registration record
            events.push(Event::MachineRegistered {
                id: m.id,
                name: m.name,
                kind: m.kind,
                category: m.category,
                status: m.status,
                site_id: m.site_id,
            });
        }

        let mut users: Vec<User> = self.users.iter().map(|u| u.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        for u in users {
            events.push(Event::UserRegistered {
                id: u.id,
                name: u.name,
                email: u.email,
                team: u.team,
                manager_email: u.manager_email,
                role: u.role,
                status: u.status,
                created_at: u.created_at,
            });
        }

        let booking_arcs: Vec<SharedBooking> =
            self.bookings.iter().map(|entry| entry.value().clone()).collect();
        let mut bookings = Vec::with_capacity(booking_arcs.len());
        for arc in booking_arcs {
            bookings.push(arc.read().await.clone());
        }
        bookings.sort_by_key(|b| b.id);
        for b in bookings {
            events.push(Event::BookingSubmitted {
                id: b.id,
                requester_id: b.requester_id,
                window: b.window,
                purpose: b.purpose.clone(),
                machine_ids: b.machine_ids.clone(),
            });
            match b.status {
                BookingStatus::Pending => {}
                BookingStatus::Approved => {
                    events.push(Event::BookingApproved {
                        id: b.id,
                        approver_id: b.approver_id.unwrap_or_default(),
                        at: b.decided_at.unwrap_or_default(),
                    });
                }
                BookingStatus::Rejected => {
                    events.push(Event::BookingRejected {
                        id: b.id,
                        approver_id: b.approver_id.unwrap_or_default(),
                        note: b.decision_note.clone().unwrap_or_default(),
                        at: b.decided_at.unwrap_or_default(),
                    });
                }
                BookingStatus::Cancelled => {
                    // A cancelled booking that once held the calendar must not
                    // re-claim it on replay, so replay the approval then the
                    // cancellation (cancel of approved frees the slots).
                    if let Some(approver_id) = b.approver_id {
                        events.push(Event::BookingApproved {
                            id: b.id,
                            approver_id,
                            at: b.decided_at.unwrap_or_default(),
                        });
                    }
                    events.push(Event::BookingCancelled {
                        id: b.id,
                        at: b.cancelled_at.unwrap_or_default(),
                    });
                }
            }
            if b.checked_in {
                events.push(Event::CheckedIn { id: b.id });
            }
            if b.no_show {
                events.push(Event::NoShowMarked { id: b.id });
            }
        }

        let mut notifications: Vec<Notification> =
            self.notifications.iter().map(|n| n.value().clone()).collect();
        notifications.sort_by_key(|n| n.id);
        for n in notifications {
            events.push(Event::NotificationQueued {
                id: n.id,
                user_id: n.user_id,
                message: n.message,
                created_at: n.created_at,
            });
            if let Some(at) = n.sent_at {
                events.push(Event::NotificationSent { id: n.id, at });
            }
        }

        let mut audit: Vec<AuditEntry> = self.audit.iter().map(|a| a.value().clone()).collect();
        audit.sort_by_key(|a| a.id);
        for a in audit {
            events.push(Event::AuditRecorded {
                id: a.id,
                at: a.at,
                actor_email: a.actor_email,
                action: a.action,
                detail: a.detail,
            });
        }

        events
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Build the audit tail for a committed action.
pub(super) fn audit_entry(actor_email: &str, action: &str, detail: String, at: Ms) -> AuditEntry {
    AuditEntry {
        id: Ulid::new(),
        at,
        actor_email: actor_email.to_string(),
        action: action.to_string(),
        detail,
    }
}

pub(super) fn notification_event(n: &Notification) -> Event {
    Event::NotificationQueued {
        id: n.id,
        user_id: n.user_id,
        message: n.message.clone(),
        created_at: n.created_at,
    }
}

pub(super) fn audit_event(a: &AuditEntry) -> Event {
    Event::AuditRecorded {
        id: a.id,
        at: a.at,
        actor_email: a.actor_email.clone(),
        action: a.action.clone(),
        detail: a.detail.clone(),
    }
}
