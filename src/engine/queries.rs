use std::collections::HashMap;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, SharedBooking, SharedMachine};

impl Engine {
    /// Inventory listing: name order, optionally filtered by a
    /// case-insensitive substring over name, category, and kind.
    pub async fn list_machines(&self, filter: Option<&str>) -> Vec<MachineInfo> {
        let needle = filter.map(|f| f.trim().to_lowercase()).filter(|f| !f.is_empty());

        let arcs: Vec<SharedMachine> =
            self.machines.iter().map(|entry| entry.value().clone()).collect();
        let mut rows = Vec::with_capacity(arcs.len());
        for arc in arcs {
            let guard = arc.read().await;
            let m = &guard.machine;
            if let Some(ref needle) = needle {
                let hit = m.name.to_lowercase().contains(needle)
                    || m.category.to_lowercase().contains(needle)
                    || m.kind.to_string().contains(needle.as_str());
                if !hit {
                    continue;
                }
            }
            let site_name = self
                .sites
                .get(&m.site_id)
                .map(|s| s.name.clone())
                .unwrap_or_default();
            rows.push(MachineInfo {
                id: m.id,
                name: m.name.clone(),
                kind: m.kind,
                category: m.category.clone(),
                status: m.status,
                site_id: m.site_id,
                site_name,
            });
        }
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows.truncate(INVENTORY_LIMIT);
        rows
    }

    pub fn list_sites(&self) -> Vec<Site> {
        let mut sites: Vec<Site> = self.sites.iter().map(|s| s.value().clone()).collect();
        sites.sort_by(|a, b| a.name.cmp(&b.name));
        sites
    }

    pub async fn booking(&self, id: &Ulid) -> Option<Booking> {
        let arc = self.get_booking(id)?;
        let guard = arc.read().await;
        Some(guard.clone())
    }

    /// The approval queue: pending bookings, soonest window first.
    pub async fn pending_queue(&self) -> Vec<Booking> {
        let mut rows = self
            .collect_bookings(|b| b.status == BookingStatus::Pending)
            .await;
        rows.sort_by_key(|b| (b.window.start, b.id));
        rows.truncate(PENDING_QUEUE_LIMIT);
        rows
    }

    /// One requester's bookings, newest window first.
    pub async fn bookings_for(&self, requester_id: Ulid) -> Vec<Booking> {
        let mut rows = self
            .collect_bookings(|b| b.requester_id == requester_id)
            .await;
        rows.sort_by_key(|b| (std::cmp::Reverse(b.window.start), std::cmp::Reverse(b.id)));
        rows
    }

    /// Approved bookings still ahead of (or within a day behind) `now`,
    /// soonest first. In-progress windows stay visible.
    pub async fn upcoming(&self, now: Ms) -> Vec<Booking> {
        let cutoff = now - DAY_MS;
        let mut rows = self
            .collect_bookings(|b| b.status == BookingStatus::Approved && b.window.start >= cutoff)
            .await;
        rows.sort_by_key(|b| (b.window.start, b.id));
        rows.truncate(UPCOMING_LIMIT);
        rows
    }

    pub fn notifications_for(&self, user_id: Ulid) -> Vec<Notification> {
        let mut rows: Vec<Notification> = self
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .map(|n| n.value().clone())
            .collect();
        rows.sort_by_key(|n| (std::cmp::Reverse(n.created_at), std::cmp::Reverse(n.id)));
        rows
    }

    pub fn user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|u| u.value().clone())
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        let email = email.trim().to_lowercase();
        let id = *self.email_index.get(&email)?;
        self.user(&id)
    }

    /// Accounts awaiting approval, oldest first.
    pub fn pending_users(&self) -> Vec<User> {
        let mut rows: Vec<User> = self
            .users
            .iter()
            .filter(|u| u.status == UserStatus::Pending)
            .map(|u| u.value().clone())
            .collect();
        rows.sort_by_key(|u| (u.created_at, u.id));
        rows
    }

    pub fn active_users(&self) -> Vec<User> {
        let mut rows: Vec<User> = self
            .users
            .iter()
            .filter(|u| u.status == UserStatus::Active)
            .map(|u| u.value().clone())
            .collect();
        rows.sort_by_key(|u| (std::cmp::Reverse(u.created_at), std::cmp::Reverse(u.id)));
        rows.truncate(ACTIVE_USERS_LIMIT);
        rows
    }

    /// Approved hours per machine and per category over the trailing
    /// `days`-day window. A booking counts its full duration once per
    /// machine it reserves.
    pub async fn utilisation(&self, now: Ms, days: i64) -> UtilisationReport {
        let since = now - days * DAY_MS;
        let bookings = self
            .collect_bookings(|b| b.status == BookingStatus::Approved && b.window.start >= since)
            .await;

        let mut hours_by_machine: HashMap<Ulid, f64> = HashMap::new();
        for b in &bookings {
            let hours = b.window.duration_ms() as f64 / 3_600_000.0;
            for machine_id in &b.machine_ids {
                *hours_by_machine.entry(*machine_id).or_default() += hours;
            }
        }

        let mut by_machine = Vec::with_capacity(hours_by_machine.len());
        let mut category_hours: HashMap<String, f64> = HashMap::new();
        for (machine_id, hours) in hours_by_machine {
            let Some(arc) = self.get_machine(&machine_id) else { continue };
            let guard = arc.read().await;
            let m = &guard.machine;
            *category_hours.entry(m.category.clone()).or_default() += hours;
            by_machine.push(MachineUsage {
                machine_id,
                name: m.name.clone(),
                category: m.category.clone(),
                hours,
            });
        }
        by_machine.sort_by(|a, b| b.hours.total_cmp(&a.hours).then(a.name.cmp(&b.name)));
        by_machine.truncate(UTILISATION_TOP_MACHINES);

        let mut by_category: Vec<CategoryUsage> = category_hours
            .into_iter()
            .map(|(category, hours)| CategoryUsage { category, hours })
            .collect();
        by_category.sort_by(|a, b| b.hours.total_cmp(&a.hours).then(a.category.cmp(&b.category)));

        UtilisationReport { since, by_machine, by_category }
    }

    /// Counters for the landing page: live pending total plus trailing
    /// 30-day cancellations and no-shows, and current out-of-service count.
    pub async fn dashboard_stats(&self, now: Ms) -> DashboardStats {
        let cutoff = now - DASHBOARD_WINDOW_MS;

        let mut pending_bookings = 0;
        let mut cancellations = 0;
        let mut no_shows = 0;
        let arcs: Vec<SharedBooking> =
            self.bookings.iter().map(|entry| entry.value().clone()).collect();
        for arc in arcs {
            let b = arc.read().await;
            match b.status {
                BookingStatus::Pending => pending_bookings += 1,
                BookingStatus::Cancelled => {
                    if b.cancelled_at.is_some_and(|at| at >= cutoff) {
                        cancellations += 1;
                    }
                }
                _ => {}
            }
            if b.no_show && b.window.end >= cutoff {
                no_shows += 1;
            }
        }

        let machine_arcs: Vec<SharedMachine> =
            self.machines.iter().map(|entry| entry.value().clone()).collect();
        let mut machines_out_of_service = 0;
        for arc in machine_arcs {
            if arc.read().await.machine.status == MachineStatus::OutOfService {
                machines_out_of_service += 1;
            }
        }

        DashboardStats { pending_bookings, cancellations, no_shows, machines_out_of_service }
    }

    /// Most recent audit entries, newest first.
    pub fn audit_tail(&self, limit: usize) -> Vec<AuditEntry> {
        let mut rows: Vec<AuditEntry> = self.audit.iter().map(|a| a.value().clone()).collect();
        rows.sort_by_key(|a| std::cmp::Reverse(a.id));
        rows.truncate(limit.min(AUDIT_TAIL_LIMIT));
        rows
    }

    async fn collect_bookings(&self, keep: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let arcs: Vec<SharedBooking> =
            self.bookings.iter().map(|entry| entry.value().clone()).collect();
        let mut rows = Vec::new();
        for arc in arcs {
            let guard = arc.read().await;
            if keep(&guard) {
                rows.push(guard.clone());
            }
        }
        rows
    }
}
