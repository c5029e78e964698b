use diesel::prelude::*;
use uuid::Uuid;
use chrono::{DateTime, Utc};
use shared::*;
use crate::error::StoreError;
use crate::store::{NewAppointment, SessionRecord, UserRecord};

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::slots)]
pub struct SlotRow {
    pub id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub doctor: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::slots)]
pub struct NewSlotRow {
    pub id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub doctor: String,
    pub status: String,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::appointments)]
pub struct AppointmentRow {
    pub id: Uuid,
    pub slot_id: Uuid,
    pub patient_name: String,
    pub contact: String,
    pub reason: Option<String>,
    pub status: String,
    pub reference: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::appointments)]
pub struct NewAppointmentRow {
    pub id: Uuid,
    pub slot_id: Uuid,
    pub patient_name: String,
    pub contact: String,
    pub reason: Option<String>,
    pub status: String,
    pub reference: String,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::users)]
pub struct UserRow {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::users)]
pub struct NewUserRow {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub role: String,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::sessions)]
pub struct SessionRow {
    pub token: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::sessions)]
pub struct NewSessionRow {
    pub token: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl From<NewSlot> for NewSlotRow {
    fn from(slot: NewSlot) -> Self {
        Self {
            id: Uuid::new_v4(),
            start_at: slot.start,
            end_at: slot.end,
            doctor: slot.doctor,
            status: SlotStatus::Available.as_str().to_string(),
        }
    }
}

impl From<NewAppointment> for NewAppointmentRow {
    fn from(appointment: NewAppointment) -> Self {
        Self {
            id: Uuid::new_v4(),
            slot_id: appointment.slot_id,
            patient_name: appointment.patient_name,
            contact: appointment.contact,
            reason: appointment.reason,
            status: AppointmentStatus::Booked.as_str().to_string(),
            reference: appointment.reference,
        }
    }
}

impl TryFrom<SlotRow> for Slot {
    type Error = StoreError;

    fn try_from(row: SlotRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            start: row.start_at,
            end: row.end_at,
            doctor: row.doctor,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<AppointmentRow> for Appointment {
    type Error = StoreError;

    fn try_from(row: AppointmentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            slot_id: row.slot_id,
            patient_name: row.patient_name,
            contact: row.contact,
            reason: row.reason,
            status: row.status.parse()?,
            reference: row.reference,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<UserRow> for UserRecord {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            username: row.username,
            password_hash: row.password_hash,
            role: row.role.parse()?,
            created_at: row.created_at,
        })
    }
}

impl From<SessionRow> for SessionRecord {
    fn from(row: SessionRow) -> Self {
        Self {
            token: row.token,
            user_id: row.user_id,
            expires_at: row.expires_at,
        }
    }
}

impl From<SessionRecord> for NewSessionRow {
    fn from(session: SessionRecord) -> Self {
        Self {
            token: session.token,
            user_id: session.user_id,
            expires_at: session.expires_at,
        }
    }
}
