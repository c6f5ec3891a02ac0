use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_window};
use super::{audit_entry, audit_event, notification_event, Engine, EngineError};

impl Engine {
    pub async fn add_site(
        &self,
        actor_id: Ulid,
        name: &str,
        city: &str,
        lat: f64,
        lon: f64,
    ) -> Result<Ulid, EngineError> {
        let actor = self.require_actor(actor_id, Capability::ManageMachines)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::InvalidInput("site name must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("site name too long"));
        }
        if let Some(existing) = self.sites.iter().find(|s| s.name == name) {
            return Err(EngineError::AlreadyExists(existing.id));
        }

        let id = Ulid::new();
        let now = now_ms();
        let audit = audit_entry(&actor.email, "site_add", format!("Added site {name}"), now);
        let events = vec![
            Event::SiteAdded {
                id,
                name: name.to_string(),
                city: city.trim().to_string(),
                lat,
                lon,
            },
            audit_event(&audit),
        ];
        self.wal_append(&events).await?;

        self.sites.insert(
            id,
            Site { id, name: name.to_string(), city: city.trim().to_string(), lat, lon },
        );
        self.store_audit(audit);
        Ok(id)
    }

    pub async fn register_machine(
        &self,
        actor_id: Ulid,
        name: &str,
        kind: MachineKind,
        category: &str,
        site_id: Ulid,
    ) -> Result<Ulid, EngineError> {
        let actor = self.require_actor(actor_id, Capability::ManageMachines)?;
        let name = name.trim();
        let category = category.trim();
        if name.is_empty() {
            return Err(EngineError::InvalidInput("machine name must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("machine name too long"));
        }
        if category.len() > MAX_CATEGORY_LEN {
            return Err(EngineError::LimitExceeded("category too long"));
        }
        if self.machines.len() >= INVENTORY_LIMIT {
            return Err(EngineError::LimitExceeded("machine inventory full"));
        }
        if !self.sites.contains_key(&site_id) {
            return Err(EngineError::NotFound(site_id));
        }
        for entry in self.machines.iter() {
            // Registration is admin-only and rare; a linear scan is fine
            if let Ok(ms) = entry.value().try_read()
                && ms.machine.name == name
            {
                return Err(EngineError::AlreadyExists(ms.machine.id));
            }
        }

        let id = Ulid::new();
        let now = now_ms();
        let machine = Machine {
            id,
            name: name.to_string(),
            kind,
            category: category.to_string(),
            status: MachineStatus::Available,
            site_id,
        };
        let audit = audit_entry(
            &actor.email,
            "machine_register",
            format!("Registered machine {name}"),
            now,
        );
        let events = vec![
            Event::MachineRegistered {
                id,
                name: machine.name.clone(),
                kind,
                category: machine.category.clone(),
                status: machine.status,
                site_id,
            },
            audit_event(&audit),
        ];
        self.wal_append(&events).await?;

        self.machines
            .insert(id, Arc::new(RwLock::new(MachineState::new(machine))));
        self.store_audit(audit);
        Ok(id)
    }

    /// Flip a machine between available and out of service.
    /// Existing approved allocations are left untouched.
    pub async fn toggle_machine(
        &self,
        actor_id: Ulid,
        machine_id: Ulid,
    ) -> Result<MachineStatus, EngineError> {
        let actor = self.require_actor(actor_id, Capability::ManageMachines)?;
        let ms = self
            .get_machine(&machine_id)
            .ok_or(EngineError::NotFound(machine_id))?;
        let mut guard = ms.write().await;

        let next = match guard.machine.status {
            MachineStatus::Available => MachineStatus::OutOfService,
            MachineStatus::OutOfService => MachineStatus::Available,
        };
        let now = now_ms();
        let audit = audit_entry(
            &actor.email,
            "machine_toggle",
            format!("Toggled {} to {next}", guard.machine.name),
            now,
        );
        let events = vec![
            Event::MachineStatusChanged { id: machine_id, status: next },
            audit_event(&audit),
        ];
        self.wal_append(&events).await?;

        guard.machine.status = next;
        drop(guard);
        self.store_audit(audit);
        Ok(next)
    }

    /// Self-service registration. New accounts start pending and cannot act
    /// until an admin approves them.
    pub async fn register_user(
        &self,
        name: &str,
        email: &str,
        team: &str,
        manager_email: &str,
    ) -> Result<Ulid, EngineError> {
        let name = name.trim();
        let email = email.trim().to_lowercase();
        let team = team.trim();
        let manager_email = manager_email.trim().to_lowercase();

        if name.is_empty() {
            return Err(EngineError::InvalidInput("name must not be empty"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("name too long"));
        }
        if email.is_empty() || !email.contains('@') {
            return Err(EngineError::InvalidInput("a valid email is required"));
        }
        if email.len() > MAX_EMAIL_LEN {
            return Err(EngineError::LimitExceeded("email too long"));
        }
        if team.len() > MAX_TEAM_LEN {
            return Err(EngineError::LimitExceeded("team too long"));
        }
        if manager_email.len() > MAX_EMAIL_LEN {
            return Err(EngineError::LimitExceeded("manager email too long"));
        }
        if self.email_index.contains_key(&email) {
            return Err(EngineError::DuplicateEmail(email));
        }

        let id = Ulid::new();
        let now = now_ms();
        let user = User {
            id,
            name: name.to_string(),
            email: email.clone(),
            team: team.to_string(),
            manager_email,
            role: Role::User,
            status: UserStatus::Pending,
            created_at: now,
        };
        let audit = audit_entry(
            &email,
            "register",
            "User registered; awaiting manager approval".to_string(),
            now,
        );
        let events = vec![
            Event::UserRegistered {
                id,
                name: user.name.clone(),
                email: user.email.clone(),
                team: user.team.clone(),
                manager_email: user.manager_email.clone(),
                role: user.role,
                status: user.status,
                created_at: now,
            },
            audit_event(&audit),
        ];
        self.wal_append(&events).await?;

        self.email_index.insert(email, id);
        self.users.insert(id, user);
        self.store_audit(audit);
        Ok(id)
    }

    pub async fn approve_user(&self, actor_id: Ulid, user_id: Ulid) -> Result<(), EngineError> {
        let actor = self.require_actor(actor_id, Capability::ManageUsers)?;
        let target = self
            .users
            .get(&user_id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::NotFound(user_id))?;

        let now = now_ms();
        let note = Notification {
            id: Ulid::new(),
            user_id,
            message: "Your account has been approved. You can now sign in.".to_string(),
            created_at: now,
            sent_at: None,
        };
        let audit = audit_entry(
            &actor.email,
            "user_approve",
            format!("Approved user {}", target.email),
            now,
        );
        let events = vec![
            Event::UserActivated { id: user_id },
            notification_event(&note),
            audit_event(&audit),
        ];
        self.wal_append(&events).await?;

        if let Some(mut user) = self.users.get_mut(&user_id) {
            user.status = UserStatus::Active;
        }
        self.store_notification(note);
        self.store_audit(audit);
        Ok(())
    }

    pub async fn reject_user(&self, actor_id: Ulid, user_id: Ulid) -> Result<(), EngineError> {
        let actor = self.require_actor(actor_id, Capability::ManageUsers)?;
        let target = self
            .users
            .get(&user_id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::NotFound(user_id))?;

        let now = now_ms();
        let note = Notification {
            id: Ulid::new(),
            user_id,
            message: "Your account request has been rejected. Contact an admin if you think this is an error."
                .to_string(),
            created_at: now,
            sent_at: None,
        };
        let audit = audit_entry(
            &actor.email,
            "user_reject",
            format!("Rejected user {}", target.email),
            now,
        );
        let events = vec![
            Event::UserRejected { id: user_id },
            notification_event(&note),
            audit_event(&audit),
        ];
        self.wal_append(&events).await?;

        if let Some(mut user) = self.users.get_mut(&user_id) {
            user.status = UserStatus::Rejected;
        }
        self.store_notification(note);
        self.store_audit(audit);
        Ok(())
    }

    /// Admit a booking request into the pending queue.
    ///
    /// Admission checks the window, the machine set, and machine service
    /// status as of right now. It does NOT check the calendar: overlapping
    /// pending requests are allowed to queue up, and the conflict rule is
    /// enforced once, at approval time.
    pub async fn submit_booking(
        &self,
        actor_id: Ulid,
        window: TimeWindow,
        purpose: &str,
        machine_ids: &[Ulid],
    ) -> Result<Ulid, EngineError> {
        let actor = self.require_actor(actor_id, Capability::SubmitBookings)?;
        let now = now_ms();
        validate_window(&window, now)?;

        let purpose = purpose.trim();
        if purpose.chars().count() > MAX_PURPOSE_LEN {
            return Err(EngineError::LimitExceeded("purpose too long"));
        }

        // De-duplicate, keeping first-occurrence order
        let mut seen = HashSet::new();
        let machine_ids: Vec<Ulid> = machine_ids
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .collect();

        if machine_ids.is_empty() {
            return Err(EngineError::NoMachines);
        }
        if machine_ids.len() > MAX_MACHINES_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many machines in one booking"));
        }
        for machine_id in &machine_ids {
            let ms = self
                .get_machine(machine_id)
                .ok_or(EngineError::UnknownMachine(*machine_id))?;
            let guard = ms.read().await;
            if guard.machine.status != MachineStatus::Available {
                return Err(EngineError::MachineUnavailable(*machine_id));
            }
        }

        let id = Ulid::new();
        let audit = audit_entry(
            &actor.email,
            "booking_request",
            format!("Created booking request #{id}"),
            now,
        );
        let decider_notes =
            self.notify_deciders(&format!("New booking request #{id} awaiting approval."), now);

        let mut events = vec![Event::BookingSubmitted {
            id,
            requester_id: actor.id,
            window,
            purpose: purpose.to_string(),
            machine_ids: machine_ids.clone(),
        }];
        events.extend(decider_notes.iter().map(notification_event));
        events.push(audit_event(&audit));
        self.wal_append(&events).await?;

        let booking = Booking {
            id,
            requester_id: actor.id,
            window,
            purpose: purpose.to_string(),
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
        for note in decider_notes {
            self.store_notification(note);
        }
        self.store_audit(audit);

        metrics::counter!(crate::observability::BOOKINGS_SUBMITTED_TOTAL).increment(1);
        metrics::gauge!(crate::observability::PENDING_BOOKINGS).increment(1.0);
        Ok(id)
    }

    /// Load an initial dataset into an empty store. Returns false (and does
    /// nothing) if any state already exists. This is the only path that can
    /// create active users and non-default roles directly.
    pub async fn bootstrap(
        &self,
        sites: Vec<Site>,
        machines: Vec<Machine>,
        users: Vec<User>,
    ) -> Result<bool, EngineError> {
        if !self.sites.is_empty()
            || !self.machines.is_empty()
            || !self.users.is_empty()
            || !self.bookings.is_empty()
        {
            return Ok(false);
        }

        let site_ids: HashSet<Ulid> = sites.iter().map(|s| s.id).collect();
        for machine in &machines {
            if !site_ids.contains(&machine.site_id) {
                return Err(EngineError::NotFound(machine.site_id));
            }
        }
        let mut emails = HashSet::new();
        for user in &users {
            if !emails.insert(user.email.to_lowercase()) {
                return Err(EngineError::DuplicateEmail(user.email.clone()));
            }
        }

        let mut events = Vec::with_capacity(sites.len() + machines.len() + users.len());
        for s in &sites {
            events.push(Event::SiteAdded {
                id: s.id,
                name: s.name.clone(),
                city: s.city.clone(),
                lat: s.lat,
                lon: s.lon,
            });
        }
        for m in &machines {
            events.push(Event::MachineRegistered {
                id: m.id,
                name: m.name.clone(),
                kind: m.kind,
                category: m.category.clone(),
                status: m.status,
                site_id: m.site_id,
            });
        }
        for u in &users {
            events.push(Event::UserRegistered {
                id: u.id,
                name: u.name.clone(),
                email: u.email.to_lowercase(),
                team: u.team.clone(),
                manager_email: u.manager_email.clone(),
                role: u.role,
                status: u.status,
                created_at: u.created_at,
            });
        }
        self.wal_append(&events).await?;
        for event in events {
            self.apply_replayed(event);
        }
        Ok(true)
    }
}
