use tracing::{debug, info};

use crate::limits::*;
use crate::model::*;
use crate::observability::{APPOINTMENTS_BOOKED_TOTAL, BOOKING_REJECTIONS_TOTAL};

use super::{Engine, EngineError};

/// Gate code: first two characters of the company name, uppercased, followed
/// by the terminal id zero-padded to three digits (`"Acme"`, 7 → `"AC007"`).
pub fn gate_code(company: &Company, terminal: TerminalId) -> Result<String, EngineError> {
    let prefix: String = company.name.chars().take(2).collect();
    if prefix.chars().count() < 2 {
        return Err(EngineError::InvalidCompanyName(company.id));
    }
    Ok(format!("{}{:03}", prefix.to_uppercase(), terminal.0))
}

fn validate_fields(request: &NewAppointment) -> Result<(), EngineError> {
    if request.container_number.trim().is_empty() {
        return Err(EngineError::LimitExceeded("container number is empty"));
    }
    let fields = [
        &request.container_number,
        &request.move_type,
        &request.size_type,
        &request.line,
        &request.chassis_no,
    ];
    if fields.iter().any(|f| f.len() > MAX_FIELD_LEN) {
        return Err(EngineError::LimitExceeded("field too long"));
    }
    Ok(())
}

impl Engine {
    /// Validate and book a container move. Nothing is persisted unless every
    /// check passes.
    pub async fn create_appointment(
        &self,
        request: NewAppointment,
    ) -> Result<AppointmentView, EngineError> {
        match self.book(request).await {
            Ok(view) => {
                metrics::counter!(APPOINTMENTS_BOOKED_TOTAL).increment(1);
                info!(
                    "booked appointment {} for container {} (gate {})",
                    view.appointment.id, view.appointment.container_number, view.appointment.gate_code
                );
                Ok(view)
            }
            Err(e) => {
                metrics::counter!(BOOKING_REJECTIONS_TOTAL, "reason" => e.kind()).increment(1);
                debug!("booking rejected: {e}");
                Err(e)
            }
        }
    }

    async fn book(&self, request: NewAppointment) -> Result<AppointmentView, EngineError> {
        validate_fields(&request)?;

        let company = self
            .directory
            .find_company(request.company_id)
            .await
            .ok_or(EngineError::InvalidCompany(request.company_id))?;
        let terminal = self
            .directory
            .find_terminal(request.terminal_id)
            .await
            .ok_or(EngineError::InvalidTerminal(request.terminal_id))?;
        let driver = self
            .directory
            .find_driver(request.driver_id)
            .await
            .ok_or(EngineError::InvalidDriver(request.driver_id))?;

        // Early out; the store's insert is what actually holds the line under races.
        if self
            .store
            .exists_by_container_number(&request.container_number)
            .await?
        {
            return Err(EngineError::DuplicateContainer(request.container_number));
        }

        let gate_code = gate_code(&company, terminal.id)?;
        let valid_through = valid_through(request.created)
            .ok_or(EngineError::LimitExceeded("visit time out of range"))?;
        let appointment = Appointment {
            id: AppointmentId(0),
            company_id: request.company_id,
            terminal_id: request.terminal_id,
            driver_id: request.driver_id,
            container_number: request.container_number,
            move_type: request.move_type,
            size_type: request.size_type,
            line: request.line,
            chassis_no: request.chassis_no,
            gate_code,
            status: AppointmentStatus::Scheduled,
            created: request.created,
            valid_through,
            last_modified: self.clock.now(),
        };

        let appointment = self.store.insert(appointment).await?;
        Ok(AppointmentView {
            appointment,
            company: Some(company),
            terminal: Some(terminal),
            driver: Some(driver),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::fixtures::company;

    #[test]
    fn gate_code_pads_terminal_id() {
        let acme = company(1, "Acme");
        assert_eq!(gate_code(&acme, TerminalId(7)).unwrap(), "AC007");
        assert_eq!(gate_code(&acme, TerminalId(42)).unwrap(), "AC042");
        assert_eq!(gate_code(&acme, TerminalId(123)).unwrap(), "AC123");
        // wider ids are not truncated
        assert_eq!(gate_code(&acme, TerminalId(1234)).unwrap(), "AC1234");
    }

    #[test]
    fn gate_code_uppercases_prefix() {
        assert_eq!(gate_code(&company(3, "bluewater"), TerminalId(1)).unwrap(), "BL001");
        assert_eq!(gate_code(&company(4, "éclair"), TerminalId(5)).unwrap(), "ÉC005");
    }

    #[test]
    fn gate_code_rejects_short_names() {
        for name in ["", "X"] {
            let c = company(9, name);
            assert!(matches!(
                gate_code(&c, TerminalId(7)),
                Err(EngineError::InvalidCompanyName(CompanyId(9)))
            ));
        }
    }
}
