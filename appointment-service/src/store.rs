//! Storage seam for the booking engine and the identity service.
//!
//! Every state transition is a single call here so that the implementation
//! can run it as one conditional write inside one transaction. Callers never
//! read a status and write it back themselves.

mod postgres;
#[cfg(test)]
pub mod memory;

pub use postgres::PgStore;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::*;
use uuid::Uuid;

use crate::error::StoreError;

/// Bounds a store call so a stuck connection surfaces as a fault instead of
/// holding the request open.
pub async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}

/// Appointment fields supplied by the booking transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAppointment {
    pub slot_id: Uuid,
    pub patient_name: String,
    pub contact: String,
    pub reason: Option<String>,
    pub reference: String,
}

/// What happened to the slot after its appointment was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRelease {
    Reopened,
    /// The slot exists but was not booked; it was left as is.
    NotBooked,
    /// The slot row is gone.
    Missing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cancellation {
    Cancelled {
        appointment: Appointment,
        slot: SlotRelease,
    },
    AlreadyCancelled(Appointment),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.id,
            username: self.username.clone(),
            role: self.role,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub token: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Fails with `Duplicate(SlotDoctorStart)` when the doctor already has a
    /// slot at `start`.
    async fn insert_slot(&self, slot: NewSlot) -> Result<Slot, StoreError>;

    /// Matching slots ordered by start, and the total match count.
    async fn list_slots(&self, query: &SlotQuery) -> Result<(Vec<Slot>, i64), StoreError>;

    /// Applies [`SlotStatus::BOOK`] and inserts the appointment atomically.
    /// `Ok(None)` when no available slot has this id. A duplicate reference
    /// undoes the flip and fails with `Duplicate(AppointmentReference)`.
    async fn book_slot(
        &self,
        slot_id: Uuid,
        appointment: NewAppointment,
    ) -> Result<Option<Appointment>, StoreError>;

    /// Cancels the booked appointment matching both fields exactly and
    /// releases its slot in the same transaction.
    async fn cancel_by_reference(
        &self,
        reference: &str,
        contact: &str,
    ) -> Result<Option<Cancellation>, StoreError>;

    /// Cancels by id. An already cancelled appointment is reported, not
    /// touched; any other non-booked status is an `InvalidTransition`.
    async fn cancel_by_id(&self, appointment_id: Uuid) -> Result<Option<Cancellation>, StoreError>;

    /// Newest first, with the slot when it still exists.
    async fn list_appointments(&self) -> Result<Vec<AppointmentWithSlot>, StoreError>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn insert_user(&self, user: NewUser) -> Result<UserRecord, StoreError>;

    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, StoreError>;

    async fn update_user(
        &self,
        user_id: Uuid,
        role: Role,
        password_hash: Option<String>,
    ) -> Result<UserRecord, StoreError>;

    async fn insert_session(&self, session: SessionRecord) -> Result<(), StoreError>;

    async fn find_session(&self, token: &str) -> Result<Option<(SessionRecord, UserRecord)>, StoreError>;

    async fn delete_session(&self, token: &str) -> Result<(), StoreError>;
}
