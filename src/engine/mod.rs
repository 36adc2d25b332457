mod booking;
mod error;
mod lifecycle;
mod queries;

pub use booking::gate_code;
pub use error::EngineError;

use std::sync::Arc;

use chrono::NaiveDateTime;

use crate::clock::Clock;
use crate::directory::Directory;
use crate::model::*;
use crate::store::AppointmentStore;

/// Appointment booking, lifecycle and query operations over a directory and a store.
///
/// Holds no per-request state; every operation is an independent unit of
/// work against the store.
pub struct Engine {
    pub(super) directory: Arc<dyn Directory>,
    pub(super) store: Arc<dyn AppointmentStore>,
    pub(super) clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(
        directory: Arc<dyn Directory>,
        store: Arc<dyn AppointmentStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { directory, store, clock }
    }

    /// Fetch an appointment or fail with `NotFound`.
    pub(super) async fn load(&self, id: AppointmentId) -> Result<Appointment, EngineError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    /// Modification timestamp that never goes backwards relative to `previous`.
    pub(super) fn stamp_after(&self, previous: NaiveDateTime) -> NaiveDateTime {
        self.clock.now().max(previous)
    }

    /// Join an appointment with its directory records.
    pub(super) async fn view(&self, appointment: Appointment) -> AppointmentView {
        let company = self.directory.find_company(appointment.company_id).await;
        let terminal = self.directory.find_terminal(appointment.terminal_id).await;
        let driver = self.directory.find_driver(appointment.driver_id).await;
        if company.is_none() || terminal.is_none() || driver.is_none() {
            tracing::warn!(
                "appointment {} has unresolved directory references",
                appointment.id
            );
        }
        AppointmentView { appointment, company, terminal, driver }
    }
}
