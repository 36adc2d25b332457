use crate::model::{AppointmentId, AppointmentStatus, CompanyId, DriverId, TerminalId};
use crate::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    InvalidCompany(CompanyId),
    InvalidTerminal(TerminalId),
    InvalidDriver(DriverId),
    /// Company name too short to derive a gate code from.
    InvalidCompanyName(CompanyId),
    DuplicateContainer(String),
    NotFound(AppointmentId),
    InvalidTransition {
        id: AppointmentId,
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    LimitExceeded(&'static str),
    /// Store failure, passed through untouched for the caller to retry or not.
    Store(String),
}

impl EngineError {
    /// Short stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidCompany(_) => "invalid_company",
            EngineError::InvalidTerminal(_) => "invalid_terminal",
            EngineError::InvalidDriver(_) => "invalid_driver",
            EngineError::InvalidCompanyName(_) => "invalid_company_name",
            EngineError::DuplicateContainer(_) => "duplicate_container",
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Store(_) => "store",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidCompany(id) => write!(f, "invalid trucking company: {id}"),
            EngineError::InvalidTerminal(id) => write!(f, "invalid terminal: {id}"),
            EngineError::InvalidDriver(id) => write!(f, "driver does not exist: {id}"),
            EngineError::InvalidCompanyName(id) => {
                write!(f, "company {id} name too short to derive a gate code")
            }
            EngineError::DuplicateContainer(c) => {
                write!(f, "appointment for container {c} already exists")
            }
            EngineError::NotFound(id) => write!(f, "appointment not found: {id}"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "appointment {id} cannot move from {from} to {to}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateContainer(c) => EngineError::DuplicateContainer(c),
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::LimitExceeded(msg) => EngineError::LimitExceeded(msg),
            StoreError::WalError(e) => EngineError::Store(e),
        }
    }
}
