use ulid::Ulid;

use crate::model::BookingStatus;

/// Why a requested time window was refused at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowViolation {
    StartInPast,
    StartBeyondHorizon,
    EndNotAfterStart,
}

impl std::fmt::Display for WindowViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowViolation::StartInPast => write!(f, "start time must be in the future"),
            WindowViolation::StartBeyondHorizon => {
                write!(f, "bookings can only be made up to 90 days ahead")
            }
            WindowViolation::EndNotAfterStart => {
                write!(f, "end time must be after start time")
            }
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidWindow(WindowViolation),
    NoMachines,
    UnknownMachine(Ulid),
    MachineUnavailable(Ulid),
    DuplicateEmail(String),
    InvalidInput(&'static str),
    InvalidState { id: Ulid, status: BookingStatus },
    OutsideWindow(Ulid),
    Forbidden(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidWindow(v) => write!(f, "invalid window: {v}"),
            EngineError::NoMachines => write!(f, "select at least one machine"),
            EngineError::UnknownMachine(id) => write!(f, "machine does not exist: {id}"),
            EngineError::MachineUnavailable(id) => {
                write!(f, "machine is out of service: {id}")
            }
            EngineError::DuplicateEmail(email) => {
                write!(f, "email already registered: {email}")
            }
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::InvalidState { id, status } => {
                write!(f, "booking {id} is {status}, operation not allowed")
            }
            EngineError::OutsideWindow(id) => {
                write!(f, "booking {id} is not within its reserved window")
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
