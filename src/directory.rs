use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::limits::MAX_SEED_BYTES;
use crate::model::*;

/// Read-only registry of companies, terminals and drivers.
///
/// Appointments hold ids only; every join goes through this trait.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn find_company(&self, id: CompanyId) -> Option<Company>;
    async fn find_terminal(&self, id: TerminalId) -> Option<Terminal>;
    async fn find_driver(&self, id: DriverId) -> Option<Driver>;
    async fn list_terminals(&self) -> Vec<Terminal>;

    /// True if any company or terminal is registered under `email`.
    async fn email_exists(&self, email: &str) -> bool;
    async fn gst_no_exists(&self, gst_no: &str) -> bool;
    async fn transport_lic_no_exists(&self, transport_lic_no: &str) -> bool;
}

/// Directory contents as loaded from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySeed {
    pub companies: Vec<Company>,
    pub terminals: Vec<Terminal>,
    pub drivers: Vec<Driver>,
}

#[derive(Debug)]
pub enum DirectoryError {
    Io(std::io::Error),
    Parse(String),
    DuplicateId(&'static str, u32),
    EmailTaken(String),
    GstNoTaken(String),
    TransportLicNoTaken(String),
    UnknownCompany { driver: DriverId, company: CompanyId },
    TooLarge(u64),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::Io(e) => write!(f, "directory io error: {e}"),
            DirectoryError::Parse(e) => write!(f, "directory parse error: {e}"),
            DirectoryError::DuplicateId(kind, id) => write!(f, "duplicate {kind} id: {id}"),
            DirectoryError::EmailTaken(email) => write!(f, "email already exists: {email}"),
            DirectoryError::GstNoTaken(n) => write!(f, "GST number already exists: {n}"),
            DirectoryError::TransportLicNoTaken(n) => {
                write!(f, "transport license number already exists: {n}")
            }
            DirectoryError::UnknownCompany { driver, company } => {
                write!(f, "driver {driver} references unknown company {company}")
            }
            DirectoryError::TooLarge(size) => write!(f, "directory seed too large: {size} bytes"),
        }
    }
}

impl std::error::Error for DirectoryError {}

impl From<std::io::Error> for DirectoryError {
    fn from(e: std::io::Error) -> Self {
        DirectoryError::Io(e)
    }
}

/// Directory held entirely in memory, built once from a seed.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    companies: BTreeMap<CompanyId, Company>,
    terminals: BTreeMap<TerminalId, Terminal>,
    drivers: BTreeMap<DriverId, Driver>,
}

impl InMemoryDirectory {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from a seed, applying the same uniqueness rules registration
    /// enforces: emails are unique across companies and terminals, GST and
    /// transport license numbers are unique across companies.
    pub fn from_seed(seed: DirectorySeed) -> Result<Self, DirectoryError> {
        let mut dir = Self::default();
        let mut emails = HashSet::new();
        let mut gst_nos = HashSet::new();
        let mut lic_nos = HashSet::new();

        for company in seed.companies {
            if dir.companies.contains_key(&company.id) {
                return Err(DirectoryError::DuplicateId("company", company.id.0));
            }
            if !emails.insert(company.email.clone()) {
                return Err(DirectoryError::EmailTaken(company.email));
            }
            if !gst_nos.insert(company.gst_no.clone()) {
                return Err(DirectoryError::GstNoTaken(company.gst_no));
            }
            if !lic_nos.insert(company.transport_lic_no.clone()) {
                return Err(DirectoryError::TransportLicNoTaken(company.transport_lic_no));
            }
            dir.companies.insert(company.id, company);
        }

        for terminal in seed.terminals {
            if dir.terminals.contains_key(&terminal.id) {
                return Err(DirectoryError::DuplicateId("terminal", terminal.id.0));
            }
            if !emails.insert(terminal.email.clone()) {
                return Err(DirectoryError::EmailTaken(terminal.email));
            }
            dir.terminals.insert(terminal.id, terminal);
        }

        for driver in seed.drivers {
            if dir.drivers.contains_key(&driver.id) {
                return Err(DirectoryError::DuplicateId("driver", driver.id.0));
            }
            if !dir.companies.contains_key(&driver.company_id) {
                return Err(DirectoryError::UnknownCompany {
                    driver: driver.id,
                    company: driver.company_id,
                });
            }
            dir.drivers.insert(driver.id, driver);
        }

        Ok(dir)
    }

    pub fn from_json(json: &str) -> Result<Self, DirectoryError> {
        let seed: DirectorySeed =
            serde_json::from_str(json).map_err(|e| DirectoryError::Parse(e.to_string()))?;
        Self::from_seed(seed)
    }

    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        let file = std::fs::File::open(path)?;
        let size = file.metadata()?.len();
        if size > MAX_SEED_BYTES {
            return Err(DirectoryError::TooLarge(size));
        }
        let mut json = String::with_capacity(size as usize);
        file.take(MAX_SEED_BYTES).read_to_string(&mut json)?;
        Self::from_json(&json)
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (self.companies.len(), self.terminals.len(), self.drivers.len())
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn find_company(&self, id: CompanyId) -> Option<Company> {
        self.companies.get(&id).cloned()
    }

    async fn find_terminal(&self, id: TerminalId) -> Option<Terminal> {
        self.terminals.get(&id).cloned()
    }

    async fn find_driver(&self, id: DriverId) -> Option<Driver> {
        self.drivers.get(&id).cloned()
    }

    async fn list_terminals(&self) -> Vec<Terminal> {
        self.terminals.values().cloned().collect()
    }

    async fn email_exists(&self, email: &str) -> bool {
        self.companies.values().any(|c| c.email == email)
            || self.terminals.values().any(|t| t.email == email)
    }

    async fn gst_no_exists(&self, gst_no: &str) -> bool {
        self.companies.values().any(|c| c.gst_no == gst_no)
    }

    async fn transport_lic_no_exists(&self, transport_lic_no: &str) -> bool {
        self.companies
            .values()
            .any(|c| c.transport_lic_no == transport_lic_no)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn company(id: u32, name: &str) -> Company {
        Company {
            id: CompanyId(id),
            name: name.into(),
            email: format!("ops{id}@{}.example", name.to_lowercase()),
            gst_no: format!("GST{id:05}"),
            transport_lic_no: format!("TL{id:05}"),
        }
    }

    pub fn terminal(id: u32, port: &str) -> Terminal {
        Terminal {
            id: TerminalId(id),
            port_name: port.into(),
            address: "1 Quay Road".into(),
            city: "Chennai".into(),
            state: "TN".into(),
            country: "IN".into(),
            email: format!("gate{id}@terminal.example"),
            created_at: ts("2023-01-01T00:00:00"),
            updated_at: ts("2023-06-01T00:00:00"),
        }
    }

    pub fn driver(id: u32, company: u32) -> Driver {
        Driver {
            id: DriverId(id),
            company_id: CompanyId(company),
            name: format!("Driver {id}"),
            plate_no: format!("TN01AB{id:04}"),
            phone_number: format!("+91 90000 {id:05}"),
        }
    }

    /// Acme (1) with driver 1 at terminal 7; "X" (2) has a one-letter name.
    pub fn seed() -> DirectorySeed {
        DirectorySeed {
            companies: vec![company(1, "Acme"), company(2, "X"), company(3, "bluewater")],
            terminals: vec![terminal(7, "Chennai Port"), terminal(42, "Ennore")],
            drivers: vec![driver(1, 1), driver(2, 2), driver(3, 3)],
        }
    }

    pub fn directory() -> InMemoryDirectory {
        InMemoryDirectory::from_seed(seed()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[tokio::test]
    async fn lookups_by_id() {
        let dir = directory();
        assert_eq!(dir.find_company(CompanyId(1)).await.unwrap().name, "Acme");
        assert_eq!(dir.find_terminal(TerminalId(7)).await.unwrap().port_name, "Chennai Port");
        assert_eq!(dir.find_driver(DriverId(1)).await.unwrap().company_id, CompanyId(1));
        assert!(dir.find_company(CompanyId(99)).await.is_none());
        assert!(dir.find_terminal(TerminalId(99)).await.is_none());
        assert!(dir.find_driver(DriverId(99)).await.is_none());
        assert_eq!(dir.list_terminals().await.len(), 2);
    }

    #[tokio::test]
    async fn existence_checks() {
        let dir = directory();
        assert!(dir.email_exists("ops1@acme.example").await);
        assert!(dir.email_exists("gate42@terminal.example").await);
        assert!(!dir.email_exists("nobody@example.com").await);
        assert!(dir.gst_no_exists("GST00003").await);
        assert!(!dir.gst_no_exists("GST99999").await);
        assert!(dir.transport_lic_no_exists("TL00002").await);
        assert!(!dir.transport_lic_no_exists("TL99999").await);
    }

    #[test]
    fn seed_rejects_email_shared_by_company_and_terminal() {
        let mut seed = seed();
        seed.terminals[0].email = seed.companies[0].email.clone();
        let err = InMemoryDirectory::from_seed(seed).unwrap_err();
        assert!(matches!(err, DirectoryError::EmailTaken(_)));
    }

    #[test]
    fn seed_rejects_duplicate_registration_numbers() {
        let mut seed = seed();
        seed.companies[1].gst_no = seed.companies[0].gst_no.clone();
        assert!(matches!(
            InMemoryDirectory::from_seed(seed).unwrap_err(),
            DirectoryError::GstNoTaken(_)
        ));

        let mut seed = super::fixtures::seed();
        seed.companies[2].transport_lic_no = seed.companies[0].transport_lic_no.clone();
        assert!(matches!(
            InMemoryDirectory::from_seed(seed).unwrap_err(),
            DirectoryError::TransportLicNoTaken(_)
        ));
    }

    #[test]
    fn seed_rejects_duplicate_ids_and_dangling_drivers() {
        let mut seed = seed();
        seed.terminals.push(terminal(7, "Again"));
        assert!(matches!(
            InMemoryDirectory::from_seed(seed).unwrap_err(),
            DirectoryError::DuplicateId("terminal", 7)
        ));

        let mut seed = super::fixtures::seed();
        seed.drivers.push(driver(9, 404));
        assert!(matches!(
            InMemoryDirectory::from_seed(seed).unwrap_err(),
            DirectoryError::UnknownCompany { .. }
        ));
    }

    #[test]
    fn from_json_accepts_partial_seed() {
        let json = r#"{
            "terminals": [{
                "id": 7, "port_name": "Chennai Port", "address": "1 Quay Road",
                "city": "Chennai", "state": "TN", "country": "IN",
                "email": "gate7@terminal.example",
                "created_at": "2023-01-01T00:00:00", "updated_at": "2023-01-01T00:00:00"
            }]
        }"#;
        let dir = InMemoryDirectory::from_json(json).unwrap();
        assert_eq!(dir.counts(), (0, 1, 0));
    }

    #[test]
    fn from_json_reports_parse_errors() {
        assert!(matches!(
            InMemoryDirectory::from_json("{ not json").unwrap_err(),
            DirectoryError::Parse(_)
        ));
    }
}
