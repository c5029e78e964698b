use std::fmt;
use std::time::Duration;

use diesel::result::DatabaseErrorKind;
use diesel_async::pooled_connection::PoolError;
use shared::{InvalidTransition, UnknownStatus};
use thiserror::Error;

/// Unique constraints the schema declares by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueKey {
    SlotDoctorStart,
    AppointmentReference,
    Username,
    Other,
}

impl UniqueKey {
    fn from_constraint(name: Option<&str>) -> Self {
        match name {
            Some("slots_doctor_start_unique") => UniqueKey::SlotDoctorStart,
            Some("appointments_reference_unique") => UniqueKey::AppointmentReference,
            Some("users_username_unique") => UniqueKey::Username,
            _ => UniqueKey::Other,
        }
    }
}

impl fmt::Display for UniqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UniqueKey::SlotDoctorStart => "slot doctor/start",
            UniqueKey::AppointmentReference => "appointment reference",
            UniqueKey::Username => "username",
            UniqueKey::Other => "key",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("duplicate {0}")]
    Duplicate(UniqueKey),

    #[error("invalid stored value: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("store call did not finish within {0:?}")]
    Timeout(Duration),

    #[error("query failed: {0}")]
    Query(diesel::result::Error),
}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        if let diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) = &err {
            return StoreError::Duplicate(UniqueKey::from_constraint(info.constraint_name()));
        }
        StoreError::Query(err)
    }
}

impl From<bb8::RunError<PoolError>> for StoreError {
    fn from(err: bb8::RunError<PoolError>) -> Self {
        StoreError::Pool(err.to_string())
    }
}

impl From<UnknownStatus> for StoreError {
    fn from(err: UnknownStatus) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// What callers of the engine and the auth service can observe.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("service temporarily unavailable")]
    Transient(#[from] StoreError),

    #[error("internal error")]
    Internal(String),
}

impl ServiceError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ServiceError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ServiceError::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ServiceError::NotFound(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_names_map_to_keys() {
        assert_eq!(
            UniqueKey::from_constraint(Some("appointments_reference_unique")),
            UniqueKey::AppointmentReference
        );
        assert_eq!(
            UniqueKey::from_constraint(Some("slots_doctor_start_unique")),
            UniqueKey::SlotDoctorStart
        );
        assert_eq!(UniqueKey::from_constraint(None), UniqueKey::Other);
    }

    #[test]
    fn transient_hides_store_details() {
        let err = ServiceError::from(StoreError::Pool("connection refused".to_string()));
        assert_eq!(err.to_string(), "service temporarily unavailable");
    }

    #[test]
    fn unknown_status_is_corrupt() {
        let err = StoreError::from(UnknownStatus("released".to_string()));
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}
