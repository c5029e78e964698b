//! The booking lifecycle: slot registry, the booking transaction and the two
//! cancellation paths.
//!
//! The engine never reads a status and writes it back. Each transition is
//! one store call that the store applies conditionally, so N concurrent
//! bookers of one slot produce exactly one appointment.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use shared::reference::{self, CodeSource};
use shared::*;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ServiceError, StoreError, UniqueKey};
use crate::store::{bounded, BookingStore, Cancellation, NewAppointment, SlotRelease};

pub const MAX_REFERENCE_ATTEMPTS: usize = 5;

pub const SLOT_NOT_AVAILABLE: &str = "slot not available";
pub const NO_ACTIVE_APPOINTMENT: &str = "no matching active appointment";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    pub slot_id: Option<String>,
    pub patient_name: Option<String>,
    pub contact: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelRequest {
    pub reference: Option<String>,
    pub contact: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSlotRequest {
    pub start: Option<String>,
    pub end: Option<String>,
    pub doctor: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdminCancel {
    Cancelled(Appointment),
    AlreadyCancelled(Appointment),
}

impl AdminCancel {
    pub fn message(&self) -> &'static str {
        match self {
            AdminCancel::Cancelled(_) => "Appointment cancelled",
            AdminCancel::AlreadyCancelled(_) => "Already cancelled",
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parses an RFC 3339 timestamp into UTC.
pub fn parse_instant(value: &str) -> Result<DateTime<Utc>, ServiceError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ServiceError::validation("invalid date format"))
}

pub struct BookingEngine {
    store: Arc<dyn BookingStore>,
    codes: Arc<dyn CodeSource>,
    store_timeout: Duration,
}

impl BookingEngine {
    pub fn new(store: Arc<dyn BookingStore>, codes: Arc<dyn CodeSource>, store_timeout: Duration) -> Self {
        Self { store, codes, store_timeout }
    }

    pub async fn ready(&self) -> Result<(), ServiceError> {
        bounded(self.store_timeout, self.store.ping()).await?;
        Ok(())
    }

    pub async fn list_slots(&self, query: SlotQuery) -> Result<Page<Slot>, ServiceError> {
        let (items, total) = bounded(self.store_timeout, self.store.list_slots(&query)).await?;
        Ok(Page::new(items, total, query.page))
    }

    pub async fn create_slot(&self, request: CreateSlotRequest) -> Result<Slot, ServiceError> {
        let (Some(start), Some(end)) = (non_blank(request.start), non_blank(request.end)) else {
            return Err(ServiceError::validation("start and end are required ISO dates"));
        };
        let start = parse_instant(&start)?;
        let end = parse_instant(&end)?;
        let slot = NewSlot::new(start, end, request.doctor.as_deref()).map_err(ServiceError::Validation)?;

        match bounded(self.store_timeout, self.store.insert_slot(slot)).await {
            Ok(slot) => {
                info!("Created slot {} for {} at {}", slot.id, slot.doctor, slot.start);
                Ok(slot)
            }
            Err(StoreError::Duplicate(UniqueKey::SlotDoctorStart)) => Err(ServiceError::conflict(
                "slot already exists for this doctor at this time",
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Books `slot_id` for the patient. Unknown and unavailable slots fail
    /// the same way. A reference collision rolls the whole attempt back and
    /// retries with a fresh code.
    pub async fn book_slot(&self, request: BookingRequest) -> Result<Appointment, ServiceError> {
        let (Some(slot_id), Some(patient_name), Some(contact)) = (
            non_blank(request.slot_id),
            non_blank(request.patient_name),
            non_blank(request.contact),
        ) else {
            return Err(ServiceError::validation(
                "slotId, patientName and contact are required",
            ));
        };
        let slot_id = Uuid::parse_str(&slot_id)
            .map_err(|_| ServiceError::validation("slotId is not a valid id"))?;
        let reason = non_blank(request.reason);

        for attempt in 1..=MAX_REFERENCE_ATTEMPTS {
            let draft = NewAppointment {
                slot_id,
                patient_name: patient_name.clone(),
                contact: contact.clone(),
                reason: reason.clone(),
                reference: self.codes.next_code(),
            };

            match bounded(self.store_timeout, self.store.book_slot(slot_id, draft)).await {
                Ok(Some(appointment)) => {
                    info!(
                        "Booked slot {} as appointment {} ({})",
                        slot_id, appointment.id, appointment.reference
                    );
                    return Ok(appointment);
                }
                Ok(None) => {
                    debug!("Slot {} not available for booking", slot_id);
                    return Err(ServiceError::conflict(SLOT_NOT_AVAILABLE));
                }
                Err(StoreError::Duplicate(UniqueKey::AppointmentReference)) => {
                    warn!("Reference collision booking slot {} (attempt {})", slot_id, attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }

        error!(
            "Gave up booking slot {} after {} reference collisions",
            slot_id, MAX_REFERENCE_ATTEMPTS
        );
        Err(StoreError::Duplicate(UniqueKey::AppointmentReference).into())
    }

    /// Self-service cancellation. Wrong reference, wrong contact and an
    /// already cancelled appointment are indistinguishable to the caller.
    pub async fn cancel_by_reference(&self, request: CancelRequest) -> Result<Appointment, ServiceError> {
        let (Some(reference), Some(contact)) = (non_blank(request.reference), non_blank(request.contact)) else {
            return Err(ServiceError::validation("reference and contact are required"));
        };
        let reference = reference::normalize(&reference);

        let outcome = bounded(
            self.store_timeout,
            self.store.cancel_by_reference(&reference, &contact),
        )
        .await?;

        match outcome {
            Some(Cancellation::Cancelled { appointment, slot }) => {
                self.log_release(&appointment, slot);
                info!("Appointment {} cancelled by patient", appointment.id);
                Ok(appointment)
            }
            Some(Cancellation::AlreadyCancelled(_)) | None => {
                Err(ServiceError::not_found(NO_ACTIVE_APPOINTMENT))
            }
        }
    }

    /// Administrative cancellation; repeating it is a no-op success.
    pub async fn cancel_by_id(&self, appointment_id: Uuid) -> Result<AdminCancel, ServiceError> {
        match bounded(self.store_timeout, self.store.cancel_by_id(appointment_id)).await {
            Ok(Some(Cancellation::Cancelled { appointment, slot })) => {
                self.log_release(&appointment, slot);
                info!("Appointment {} cancelled by administrator", appointment.id);
                Ok(AdminCancel::Cancelled(appointment))
            }
            Ok(Some(Cancellation::AlreadyCancelled(appointment))) => {
                debug!("Appointment {} was already cancelled", appointment.id);
                Ok(AdminCancel::AlreadyCancelled(appointment))
            }
            Ok(None) => Err(ServiceError::not_found("appointment not found")),
            Err(StoreError::Transition(e)) => Err(ServiceError::conflict(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_appointments(&self) -> Result<Vec<AppointmentWithSlot>, ServiceError> {
        Ok(bounded(self.store_timeout, self.store.list_appointments()).await?)
    }

    fn log_release(&self, appointment: &Appointment, slot: SlotRelease) {
        match slot {
            SlotRelease::Reopened => debug!("Slot {} reopened", appointment.slot_id),
            SlotRelease::Missing => warn!(
                "Appointment {} cancelled but its slot {} no longer exists",
                appointment.id, appointment.slot_id
            ),
            SlotRelease::NotBooked => warn!(
                "Appointment {} cancelled but slot {} was not booked; left unchanged",
                appointment.id, appointment.slot_id
            ),
        }
    }
}
