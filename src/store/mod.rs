mod wal_store;

pub use wal_store::WalStore;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::model::{Appointment, AppointmentId};

/// Durable collection of appointments.
///
/// Container-number uniqueness among live appointments is enforced here, so
/// two racing bookings of the same container cannot both be inserted.
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    /// Persist a new appointment. The store assigns `id`; whatever the caller
    /// put there is overwritten. Returns the stored record.
    async fn insert(&self, appointment: Appointment) -> Result<Appointment, StoreError>;

    async fn find_by_id(&self, id: AppointmentId) -> Result<Option<Appointment>, StoreError>;

    /// Replace the stored record with the same id.
    async fn update(&self, appointment: Appointment) -> Result<(), StoreError>;

    async fn delete(&self, id: AppointmentId) -> Result<(), StoreError>;

    async fn exists_by_container_number(&self, container_number: &str) -> Result<bool, StoreError>;

    /// Appointments with `start <= created < end_exclusive`.
    async fn query_by_created_range(
        &self,
        start: NaiveDateTime,
        end_exclusive: NaiveDateTime,
    ) -> Result<Vec<Appointment>, StoreError>;

    async fn list_all(&self) -> Result<Vec<Appointment>, StoreError>;
}

#[derive(Debug)]
pub enum StoreError {
    DuplicateContainer(String),
    NotFound(AppointmentId),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DuplicateContainer(c) => write!(f, "container already booked: {c}"),
            StoreError::NotFound(id) => write!(f, "appointment not found: {id}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
