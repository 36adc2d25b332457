use std::fmt;

use chrono::{Days, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

/// Days an appointment stays valid after its scheduled visit time.
pub const VALIDITY_DAYS: u64 = 2;

// ── Identifiers ──────────────────────────────────────────────────

/// Store-assigned appointment id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppointmentId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CompanyId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TerminalId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DriverId(pub u32);

macro_rules! display_id {
    ($($t:ty),*) => {
        $(impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_id!(AppointmentId, CompanyId, TerminalId, DriverId);

// ── Directory records ────────────────────────────────────────────

/// A registered trucking company.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    pub name: String,
    pub email: String,
    pub gst_no: String,
    pub transport_lic_no: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terminal {
    pub id: TerminalId,
    pub port_name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub country: String,
    pub email: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Driver {
    pub id: DriverId,
    pub company_id: CompanyId,
    pub name: String,
    pub plate_no: String,
    pub phone_number: String,
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Approved,
    Canceled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "Scheduled",
            AppointmentStatus::Approved => "Approved",
            AppointmentStatus::Canceled => "Canceled",
        }
    }

    /// Whether a lifecycle operation may move an appointment from `self` to `to`.
    /// Re-entering the current state is allowed; nothing leaves `Canceled`.
    pub fn can_transition_to(&self, to: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (*self, to),
            (Scheduled, Approved)
                | (Approved, Approved)
                | (Scheduled, Canceled)
                | (Approved, Canceled)
                | (Canceled, Canceled)
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A booked gate visit. Only the engine creates these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: AppointmentId,
    pub company_id: CompanyId,
    pub terminal_id: TerminalId,
    pub driver_id: DriverId,
    pub container_number: String,
    pub move_type: String,
    pub size_type: String,
    pub line: String,
    pub chassis_no: String,
    pub gate_code: String,
    pub status: AppointmentStatus,
    /// Intended visit time as supplied by the booking company.
    pub created: NaiveDateTime,
    pub valid_through: NaiveDateTime,
    pub last_modified: NaiveDateTime,
}

/// Booking request. Derived fields are never accepted from callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAppointment {
    pub company_id: CompanyId,
    pub terminal_id: TerminalId,
    pub driver_id: DriverId,
    pub container_number: String,
    pub move_type: String,
    pub size_type: String,
    pub line: String,
    pub chassis_no: String,
    pub created: NaiveDateTime,
}

/// The fields a booking company may change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentUpdate {
    pub move_type: String,
    pub created: NaiveDateTime,
}

/// Appointment joined with its directory records, ready for display.
/// A reference that no longer resolves is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentView {
    pub appointment: Appointment,
    pub company: Option<Company>,
    pub terminal: Option<Terminal>,
    pub driver: Option<Driver>,
}

// ── Time helpers ─────────────────────────────────────────────────

/// `created + 2` calendar days, or `None` past the end of the calendar.
pub fn valid_through(created: NaiveDateTime) -> Option<NaiveDateTime> {
    created.checked_add_days(Days::new(VALIDITY_DAYS))
}

/// Half-open window `[date 00:00, date + 1 day 00:00)` covering the calendar
/// day of `at`, in the timestamp's own reference frame.
pub fn day_window(at: NaiveDateTime) -> (NaiveDateTime, NaiveDateTime) {
    let start = at.date().and_time(NaiveTime::MIN);
    let end = at
        .date()
        .succ_opt()
        .unwrap_or(NaiveDate::MAX)
        .and_time(NaiveTime::MIN);
    (start, end)
}

/// The event types. Flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AppointmentBooked { appointment: Appointment },
    AppointmentUpdated { appointment: Appointment },
    AppointmentDeleted { id: AppointmentId },
    /// Written first by compaction so ids of deleted appointments are never reused.
    SequenceAt { next_id: u64 },
}

#[cfg(test)]
pub(crate) fn ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_is_two_calendar_days() {
        assert_eq!(valid_through(ts("2024-03-10T08:30:00")), Some(ts("2024-03-12T08:30:00")));
        // crosses a month boundary
        assert_eq!(valid_through(ts("2024-02-28T23:00:00")), Some(ts("2024-03-01T23:00:00")));
        assert_eq!(valid_through(NaiveDateTime::MAX), None);
    }

    #[test]
    fn day_window_is_half_open_calendar_day() {
        let (start, end) = day_window(ts("2024-03-10T17:45:12"));
        assert_eq!(start, ts("2024-03-10T00:00:00"));
        assert_eq!(end, ts("2024-03-11T00:00:00"));
    }

    #[test]
    fn status_transitions() {
        use AppointmentStatus::*;
        assert!(Scheduled.can_transition_to(Approved));
        assert!(Scheduled.can_transition_to(Canceled));
        assert!(Approved.can_transition_to(Canceled));
        assert!(Approved.can_transition_to(Approved));
        assert!(Canceled.can_transition_to(Canceled));
        assert!(!Canceled.can_transition_to(Approved));
        assert!(!Approved.can_transition_to(Scheduled));
        assert!(!Canceled.can_transition_to(Scheduled));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AppointmentBooked {
            appointment: Appointment {
                id: AppointmentId(1),
                company_id: CompanyId(3),
                terminal_id: TerminalId(7),
                driver_id: DriverId(11),
                container_number: "MSCU1234567".into(),
                move_type: "Import".into(),
                size_type: "40HC".into(),
                line: "MSC".into(),
                chassis_no: "CH-9".into(),
                gate_code: "AC007".into(),
                status: AppointmentStatus::Scheduled,
                created: ts("2024-03-10T08:00:00"),
                valid_through: ts("2024-03-12T08:00:00"),
                last_modified: ts("2024-03-09T12:00:00"),
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
