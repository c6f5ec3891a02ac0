use std::collections::HashMap;
use std::io;
use std::path::Path;

use serde::Deserialize;
use ulid::Ulid;

use crate::engine::Engine;
use crate::model::*;

/// On-disk seed format. Machines reference sites by name so the file can be
/// written by hand; ids are minted at load time.
#[derive(Debug, Deserialize)]
pub struct SeedFile {
    pub sites: Vec<SeedSite>,
    pub machines: Vec<SeedMachine>,
    pub users: Vec<SeedUser>,
}

#[derive(Debug, Deserialize)]
pub struct SeedSite {
    pub name: String,
    pub city: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Deserialize)]
pub struct SeedMachine {
    pub name: String,
    pub kind: MachineKind,
    pub category: String,
    pub site: String,
    #[serde(default)]
    pub out_of_service: bool,
}

#[derive(Debug, Deserialize)]
pub struct SeedUser {
    pub name: String,
    pub email: String,
    pub team: String,
    pub manager_email: String,
    pub role: Role,
    #[serde(default)]
    pub active: bool,
}

pub fn load_from_path(path: &Path) -> io::Result<SeedFile> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Convert a seed into model rows and load it into an empty engine.
/// Returns false if the engine already holds state (nothing is written).
pub async fn apply(engine: &Engine, seed: SeedFile, now: Ms) -> io::Result<bool> {
    let (sites, machines, users) = into_dataset(seed, now)?;
    engine
        .bootstrap(sites, machines, users)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

fn into_dataset(seed: SeedFile, now: Ms) -> io::Result<(Vec<Site>, Vec<Machine>, Vec<User>)> {
    let mut site_ids: HashMap<String, Ulid> = HashMap::new();
    let mut sites = Vec::with_capacity(seed.sites.len());
    for s in seed.sites {
        let id = Ulid::new();
        if site_ids.insert(s.name.clone(), id).is_some() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("duplicate site name: {}", s.name),
            ));
        }
        sites.push(Site { id, name: s.name, city: s.city, lat: s.lat, lon: s.lon });
    }

    let mut machines = Vec::with_capacity(seed.machines.len());
    for m in seed.machines {
        let site_id = *site_ids.get(&m.site).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("machine {} references unknown site {}", m.name, m.site),
            )
        })?;
        let status = if m.out_of_service {
            MachineStatus::OutOfService
        } else {
            MachineStatus::Available
        };
        machines.push(Machine {
            id: Ulid::new(),
            name: m.name,
            kind: m.kind,
            category: m.category,
            status,
            site_id,
        });
    }

    let mut users = Vec::with_capacity(seed.users.len());
    for u in seed.users {
        let status = if u.active { UserStatus::Active } else { UserStatus::Pending };
        users.push(User {
            id: Ulid::new(),
            name: u.name,
            email: u.email.trim().to_lowercase(),
            team: u.team,
            manager_email: u.manager_email.trim().to_lowercase(),
            role: u.role,
            status,
            created_at: now,
        });
    }

    Ok((sites, machines, users))
}

const DEMO_CATEGORIES: [&str; 5] =
    ["Payments", "Devices", "Networking", "Core Platform", "Data Pipelines"];

/// The built-in demo dataset: five UK sites, a hundred test machines with a
/// few out of service, and one account per role.
pub fn demo() -> SeedFile {
    let sites = vec![
        ("Test Hub North", "Manchester", 53.4808, -2.2426),
        ("Test Hub South", "London", 51.5072, -0.1276),
        ("Test Hub Central", "Milton Keynes", 52.0406, -0.7594),
        ("Test Hub West", "Bristol", 51.4545, -2.5879),
        ("Test Hub Scotland", "Edinburgh", 55.9533, -3.1883),
    ];
    let site_seeds: Vec<SeedSite> = sites
        .iter()
        .map(|(name, city, lat, lon)| SeedSite {
            name: name.to_string(),
            city: city.to_string(),
            lat: *lat,
            lon: *lon,
        })
        .collect();

    let machines = (1..=100)
        .map(|i| SeedMachine {
            name: format!("TM-{i:03}"),
            kind: if i % 4 == 0 { MachineKind::Virtual } else { MachineKind::Lab },
            category: DEMO_CATEGORIES[(i - 1) % DEMO_CATEGORIES.len()].to_string(),
            site: sites[(i - 1) % sites.len()].0.to_string(),
            out_of_service: i % 12 == 7,
        })
        .collect();

    let users = vec![
        SeedUser {
            name: "Demo Admin".into(),
            email: "admin@example.com".into(),
            team: "Operations".into(),
            manager_email: "director@example.com".into(),
            role: Role::Admin,
            active: true,
        },
        SeedUser {
            name: "Demo Approver".into(),
            email: "approver@example.com".into(),
            team: "QA Governance".into(),
            manager_email: "director@example.com".into(),
            role: Role::Approver,
            active: true,
        },
        SeedUser {
            name: "Demo User".into(),
            email: "user@example.com".into(),
            team: "Engineering".into(),
            manager_email: "manager@example.com".into(),
            role: Role::User,
            active: true,
        },
    ];

    SeedFile { sites: site_seeds, machines, users }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seed_json() {
        let raw = r#"{
            "sites": [{"name": "North", "city": "Manchester", "lat": 53.48, "lon": -2.24}],
            "machines": [
                {"name": "TM-001", "kind": "lab", "category": "Payments", "site": "North"},
                {"name": "TM-002", "kind": "virtual", "category": "Devices", "site": "North",
                 "out_of_service": true}
            ],
            "users": [
                {"name": "A", "email": "A@Example.com", "team": "QA",
                 "manager_email": "m@example.com", "role": "admin", "active": true}
            ]
        }"#;
        let seed: SeedFile = serde_json::from_str(raw).unwrap();
        assert_eq!(seed.sites.len(), 1);
        assert_eq!(seed.machines.len(), 2);
        assert!(seed.machines[1].out_of_service);
        assert!(!seed.machines[0].out_of_service);

        let (sites, machines, users) = into_dataset(seed, 1000).unwrap();
        assert_eq!(sites.len(), 1);
        assert_eq!(machines[0].site_id, sites[0].id);
        assert_eq!(machines[1].status, MachineStatus::OutOfService);
        // Emails normalize to lowercase at load
        assert_eq!(users[0].email, "a@example.com");
        assert_eq!(users[0].status, UserStatus::Active);
    }

    #[test]
    fn unknown_site_reference_fails() {
        let seed = SeedFile {
            sites: vec![],
            machines: vec![SeedMachine {
                name: "TM-001".into(),
                kind: MachineKind::Lab,
                category: "Payments".into(),
                site: "Nowhere".into(),
                out_of_service: false,
            }],
            users: vec![],
        };
        let err = into_dataset(seed, 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn demo_dataset_shape() {
        let seed = demo();
        assert_eq!(seed.sites.len(), 5);
        assert_eq!(seed.machines.len(), 100);
        assert_eq!(seed.users.len(), 3);

        let out = seed.machines.iter().filter(|m| m.out_of_service).count();
        assert!(out > 0 && out < 15, "a small slice is out of service, got {out}");
        assert!(seed.users.iter().all(|u| u.active));

        // Every machine resolves, so the dataset loads cleanly
        let (_, machines, _) = into_dataset(seed, 0).unwrap();
        assert_eq!(machines.len(), 100);
    }
}
