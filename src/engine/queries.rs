use chrono::NaiveDateTime;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_appointment(&self, id: AppointmentId) -> Result<AppointmentView, EngineError> {
        let appointment = self.load(id).await?;
        Ok(self.view(appointment).await)
    }

    /// Every live appointment, joined. Order is unspecified.
    pub async fn get_appointments(&self) -> Result<Vec<AppointmentView>, EngineError> {
        let appointments = self.store.list_all().await?;
        Ok(self.views(appointments).await)
    }

    /// With a filter, only appointments whose visit time falls on the
    /// filter's calendar day; without, every appointment.
    pub async fn get_appointments_on(
        &self,
        filter_date: Option<NaiveDateTime>,
    ) -> Result<Vec<AppointmentView>, EngineError> {
        let Some(at) = filter_date else {
            return self.get_appointments().await;
        };
        let (start, end) = day_window(at);
        let appointments = self.store.query_by_created_range(start, end).await?;
        Ok(self.views(appointments).await)
    }

    pub async fn get_all_terminals(&self) -> Vec<Terminal> {
        self.directory.list_terminals().await
    }

    async fn views(&self, appointments: Vec<Appointment>) -> Vec<AppointmentView> {
        let mut views = Vec::with_capacity(appointments.len());
        for appointment in appointments {
            views.push(self.view(appointment).await);
        }
        views
    }
}
