use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open booking window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Ms,
    pub end: Ms,
}

impl TimeWindow {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "TimeWindow start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Half-open overlap: touching endpoints do NOT overlap.
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Roles and capabilities ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Approver,
    Admin,
}

/// What an action requires, checked against the closed role set —
/// roles are never compared by name at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    SubmitBookings,
    DecideBookings,
    ManageUsers,
    ManageMachines,
}

impl Role {
    pub fn can(self, cap: Capability) -> bool {
        match (self, cap) {
            (_, Capability::SubmitBookings) => true,
            (Role::Approver | Role::Admin, Capability::DecideBookings) => true,
            (Role::Admin, Capability::ManageUsers | Capability::ManageMachines) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Pending,
    Active,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineKind {
    Lab,
    Virtual,
}

impl std::fmt::Display for MachineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineKind::Lab => write!(f, "lab"),
            MachineKind::Virtual => write!(f, "virtual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    Available,
    OutOfService,
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineStatus::Available => write!(f, "available"),
            MachineStatus::OutOfService => write!(f, "out_of_service"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingStatus::Pending => write!(f, "pending"),
            BookingStatus::Approved => write!(f, "approved"),
            BookingStatus::Rejected => write!(f, "rejected"),
            BookingStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ── Entities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: Ulid,
    pub name: String,
    pub city: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: Ulid,
    pub name: String,
    pub kind: MachineKind,
    pub category: String,
    pub status: MachineStatus,
    pub site_id: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub team: String,
    pub manager_email: String,
    pub role: Role,
    pub status: UserStatus,
    pub created_at: Ms,
}

/// An approved booking's claim on one machine's calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub booking_id: Ulid,
    pub window: TimeWindow,
}

/// A machine plus its approved-allocation index, sorted by `window.start`.
/// Only approvals insert here and only cancellations remove — pending
/// bookings never occupy the calendar.
#[derive(Debug, Clone)]
pub struct MachineState {
    pub machine: Machine,
    pub allocations: Vec<Allocation>,
}

impl MachineState {
    pub fn new(machine: Machine) -> Self {
        Self {
            machine,
            allocations: Vec::new(),
        }
    }

    /// Insert, maintaining sort order by window.start.
    pub fn insert_allocation(&mut self, alloc: Allocation) {
        let pos = self
            .allocations
            .binary_search_by_key(&alloc.window.start, |a| a.window.start)
            .unwrap_or_else(|e| e);
        self.allocations.insert(pos, alloc);
    }

    pub fn remove_allocation(&mut self, booking_id: Ulid) -> Option<Allocation> {
        if let Some(pos) = self.allocations.iter().position(|a| a.booking_id == booking_id) {
            Some(self.allocations.remove(pos))
        } else {
            None
        }
    }

    /// Allocations whose window overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &TimeWindow) -> impl Iterator<Item = &Allocation> {
        let right_bound = self
            .allocations
            .partition_point(|a| a.window.start < query.end);
        self.allocations[..right_bound]
            .iter()
            .filter(move |a| a.window.end > query.start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub window: TimeWindow,
    pub purpose: String,
    pub status: BookingStatus,
    /// De-duplicated, first-occurrence order from submission.
    pub machine_ids: Vec<Ulid>,
    pub approver_id: Option<Ulid>,
    pub decision_note: Option<String>,
    pub decided_at: Option<Ms>,
    pub cancelled_at: Option<Ms>,
    pub checked_in: bool,
    pub no_show: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: Ulid,
    pub user_id: Ulid,
    pub message: String,
    pub created_at: Ms,
    pub sent_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub id: Ulid,
    pub at: Ms,
    pub actor_email: String,
    pub action: String,
    pub detail: String,
}

/// Outcome of an approval attempt. A conflict never errors — it converts
/// the request into a rejection and reports that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    RejectedDueToConflict,
}

// ── Events ───────────────────────────────────────────────────────

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    SiteAdded {
        id: Ulid,
        name: String,
        city: String,
        lat: f64,
        lon: f64,
    },
    MachineRegistered {
        id: Ulid,
        name: String,
        kind: MachineKind,
        category: String,
        status: MachineStatus,
        site_id: Ulid,
    },
    MachineStatusChanged {
        id: Ulid,
        status: MachineStatus,
    },
    UserRegistered {
        id: Ulid,
        name: String,
        email: String,
        team: String,
        manager_email: String,
        role: Role,
        status: UserStatus,
        created_at: Ms,
    },
    UserActivated {
        id: Ulid,
    },
    UserRejected {
        id: Ulid,
    },
    BookingSubmitted {
        id: Ulid,
        requester_id: Ulid,
        window: TimeWindow,
        purpose: String,
        machine_ids: Vec<Ulid>,
    },
    BookingApproved {
        id: Ulid,
        approver_id: Ulid,
        at: Ms,
    },
    BookingRejected {
        id: Ulid,
        approver_id: Ulid,
        note: String,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        at: Ms,
    },
    CheckedIn {
        id: Ulid,
    },
    NoShowMarked {
        id: Ulid,
    },
    NotificationQueued {
        id: Ulid,
        user_id: Ulid,
        message: String,
        created_at: Ms,
    },
    NotificationSent {
        id: Ulid,
        at: Ms,
    },
    AuditRecorded {
        id: Ulid,
        at: Ms,
        actor_email: String,
        action: String,
        detail: String,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct MachineInfo {
    pub id: Ulid,
    pub name: String,
    pub kind: MachineKind,
    pub category: String,
    pub status: MachineStatus,
    pub site_id: Ulid,
    pub site_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MachineUsage {
    pub machine_id: Ulid,
    pub name: String,
    pub category: String,
    pub hours: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryUsage {
    pub category: String,
    pub hours: f64,
}

/// Approved hours over a trailing window, per machine (top N) and category.
#[derive(Debug, Clone, PartialEq)]
pub struct UtilisationReport {
    pub since: Ms,
    pub by_machine: Vec<MachineUsage>,
    pub by_category: Vec<CategoryUsage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DashboardStats {
    pub pending_bookings: usize,
    pub cancellations: usize,
    pub no_shows: usize,
    pub machines_out_of_service: usize,
}
