use tracing::info;

use crate::limits::MAX_FIELD_LEN;
use crate::model::*;
use crate::observability::LIFECYCLE_OPERATIONS_TOTAL;

use super::{Engine, EngineError};

// Every operation here is a single-record read-modify-write. Two writers
// racing on the same id are last-writer-wins: the later store write replaces
// the earlier one wholesale, status included.

impl Engine {
    /// Change the move type and visit time. `valid_through` follows the new
    /// visit time; the gate code never changes.
    pub async fn update_appointment(
        &self,
        id: AppointmentId,
        update: AppointmentUpdate,
    ) -> Result<Appointment, EngineError> {
        if update.move_type.len() > MAX_FIELD_LEN {
            return Err(EngineError::LimitExceeded("field too long"));
        }
        let valid_through = valid_through(update.created)
            .ok_or(EngineError::LimitExceeded("visit time out of range"))?;
        let mut appointment = self.load(id).await?;
        appointment.move_type = update.move_type;
        appointment.created = update.created;
        appointment.valid_through = valid_through;
        appointment.last_modified = self.stamp_after(appointment.last_modified);
        self.store.update(appointment.clone()).await?;

        metrics::counter!(LIFECYCLE_OPERATIONS_TOTAL, "op" => "update").increment(1);
        info!("updated appointment {id}");
        Ok(appointment)
    }

    pub async fn approve_appointment(&self, id: AppointmentId) -> Result<Appointment, EngineError> {
        self.transition(id, AppointmentStatus::Approved).await
    }

    pub async fn cancel_appointment(&self, id: AppointmentId) -> Result<Appointment, EngineError> {
        self.transition(id, AppointmentStatus::Canceled).await
    }

    /// Remove the appointment permanently. Its container number becomes free.
    pub async fn delete_appointment(&self, id: AppointmentId) -> Result<(), EngineError> {
        self.store.delete(id).await?;
        metrics::counter!(LIFECYCLE_OPERATIONS_TOTAL, "op" => "delete").increment(1);
        info!("deleted appointment {id}");
        Ok(())
    }

    async fn transition(
        &self,
        id: AppointmentId,
        to: AppointmentStatus,
    ) -> Result<Appointment, EngineError> {
        let mut appointment = self.load(id).await?;
        let from = appointment.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { id, from, to });
        }
        appointment.status = to;
        appointment.last_modified = self.stamp_after(appointment.last_modified);
        self.store.update(appointment.clone()).await?;

        let op = match to {
            AppointmentStatus::Approved => "approve",
            AppointmentStatus::Canceled => "cancel",
            AppointmentStatus::Scheduled => "reschedule",
        };
        metrics::counter!(LIFECYCLE_OPERATIONS_TOTAL, "op" => op).increment(1);
        info!("appointment {id}: {from} -> {to}");
        Ok(appointment)
    }
}
