//! In-process store for tests. Each call holds one lock for its whole
//! duration, which gives the same all-or-nothing behavior as a database
//! transaction.

use std::collections::HashMap;
use std::future::pending;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use shared::*;
use uuid::Uuid;

use super::{AccountStore, BookingStore, Cancellation, NewAppointment, NewUser, SessionRecord, SlotRelease, UserRecord};
use crate::error::{StoreError, UniqueKey};

#[derive(Default)]
struct State {
    slots: HashMap<Uuid, Slot>,
    appointments: Vec<Appointment>,
    users: Vec<UserRecord>,
    sessions: HashMap<String, SessionRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    stalled: AtomicBool,
    reopened: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later call hang, for timeout tests.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn remove_slot(&self, slot_id: Uuid) {
        self.state.lock().unwrap().slots.remove(&slot_id);
    }

    pub fn slot(&self, slot_id: Uuid) -> Option<Slot> {
        self.state.lock().unwrap().slots.get(&slot_id).cloned()
    }

    pub fn appointments_for(&self, slot_id: Uuid) -> Vec<Appointment> {
        self.state
            .lock()
            .unwrap()
            .appointments
            .iter()
            .filter(|a| a.slot_id == slot_id)
            .cloned()
            .collect()
    }

    /// Number of booked→available transitions applied so far.
    pub fn reopen_count(&self) -> usize {
        self.reopened.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    async fn gate(&self) {
        if self.stalled.load(Ordering::SeqCst) {
            pending::<()>().await;
        }
    }

    fn release(&self, state: &mut State, slot_id: Uuid) -> SlotRelease {
        match state.slots.get_mut(&slot_id) {
            None => SlotRelease::Missing,
            Some(slot) => match slot.status.apply(SlotStatus::RELEASE) {
                Ok(next) => {
                    slot.status = next;
                    slot.updated_at = Utc::now();
                    self.reopened.fetch_add(1, Ordering::SeqCst);
                    SlotRelease::Reopened
                }
                Err(_) => SlotRelease::NotBooked,
            },
        }
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.gate().await;
        Ok(())
    }

    async fn insert_slot(&self, slot: NewSlot) -> Result<Slot, StoreError> {
        self.gate().await;
        let mut state = self.state.lock().unwrap();
        if state
            .slots
            .values()
            .any(|s| s.doctor == slot.doctor && s.start == slot.start)
        {
            return Err(StoreError::Duplicate(UniqueKey::SlotDoctorStart));
        }

        let now = Utc::now();
        let created = Slot {
            id: Uuid::new_v4(),
            start: slot.start,
            end: slot.end,
            doctor: slot.doctor,
            status: SlotStatus::Available,
            created_at: now,
            updated_at: now,
        };
        state.slots.insert(created.id, created.clone());
        Ok(created)
    }

    async fn list_slots(&self, query: &SlotQuery) -> Result<(Vec<Slot>, i64), StoreError> {
        self.gate().await;
        let state = self.state.lock().unwrap();
        let mut matching: Vec<Slot> = state
            .slots
            .values()
            .filter(|s| query.range.contains(s.start))
            .filter(|s| query.status.map_or(true, |status| s.status == status))
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.start);

        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(query.page.offset() as usize)
            .take(query.page.limit as usize)
            .collect();
        Ok((items, total))
    }

    async fn book_slot(
        &self,
        slot_id: Uuid,
        appointment: NewAppointment,
    ) -> Result<Option<Appointment>, StoreError> {
        self.gate().await;
        let mut state = self.state.lock().unwrap();

        let booked = match state.slots.get(&slot_id) {
            Some(slot) => match slot.status.apply(SlotStatus::BOOK) {
                Ok(next) => next,
                Err(_) => return Ok(None),
            },
            None => return Ok(None),
        };
        if state.appointments.iter().any(|a| a.reference == appointment.reference) {
            return Err(StoreError::Duplicate(UniqueKey::AppointmentReference));
        }

        let now = Utc::now();
        if let Some(slot) = state.slots.get_mut(&slot_id) {
            slot.status = booked;
            slot.updated_at = now;
        }
        let created = Appointment {
            id: Uuid::new_v4(),
            slot_id,
            patient_name: appointment.patient_name,
            contact: appointment.contact,
            reason: appointment.reason,
            status: AppointmentStatus::Booked,
            reference: appointment.reference,
            created_at: now,
            updated_at: now,
        };
        state.appointments.push(created.clone());
        Ok(Some(created))
    }

    async fn cancel_by_reference(
        &self,
        reference: &str,
        contact: &str,
    ) -> Result<Option<Cancellation>, StoreError> {
        self.gate().await;
        let mut state = self.state.lock().unwrap();
        let cancel = AppointmentStatus::CANCEL;

        let Some(appointment) = state.appointments.iter_mut().find(|a| {
            a.reference == reference && a.contact == contact && a.status == cancel.from
        }) else {
            return Ok(None);
        };
        appointment.status = appointment.status.apply(cancel)?;
        appointment.updated_at = Utc::now();
        let appointment = appointment.clone();

        let slot = self.release(&mut state, appointment.slot_id);
        Ok(Some(Cancellation::Cancelled { appointment, slot }))
    }

    async fn cancel_by_id(&self, appointment_id: Uuid) -> Result<Option<Cancellation>, StoreError> {
        self.gate().await;
        let mut state = self.state.lock().unwrap();
        let cancel = AppointmentStatus::CANCEL;

        let Some(appointment) = state.appointments.iter_mut().find(|a| a.id == appointment_id) else {
            return Ok(None);
        };
        if appointment.status == cancel.to {
            return Ok(Some(Cancellation::AlreadyCancelled(appointment.clone())));
        }
        appointment.status = appointment.status.apply(cancel)?;
        appointment.updated_at = Utc::now();
        let appointment = appointment.clone();

        let slot = self.release(&mut state, appointment.slot_id);
        Ok(Some(Cancellation::Cancelled { appointment, slot }))
    }

    async fn list_appointments(&self) -> Result<Vec<AppointmentWithSlot>, StoreError> {
        self.gate().await;
        let state = self.state.lock().unwrap();
        let mut items: Vec<AppointmentWithSlot> = state
            .appointments
            .iter()
            .map(|a| AppointmentWithSlot {
                appointment: a.clone(),
                slot: state.slots.get(&a.slot_id).cloned(),
            })
            .collect();
        items.sort_by(|a, b| b.appointment.created_at.cmp(&a.appointment.created_at));
        Ok(items)
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn insert_user(&self, user: NewUser) -> Result<UserRecord, StoreError> {
        self.gate().await;
        let mut state = self.state.lock().unwrap();
        if state.users.iter().any(|u| u.username == user.username) {
            return Err(StoreError::Duplicate(UniqueKey::Username));
        }
        let record = UserRecord {
            id: Uuid::new_v4(),
            username: user.username,
            password_hash: user.password_hash,
            role: user.role,
            created_at: Utc::now(),
        };
        state.users.push(record.clone());
        Ok(record)
    }

    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        self.gate().await;
        let state = self.state.lock().unwrap();
        Ok(state.users.iter().find(|u| u.username == username).cloned())
    }

    async fn update_user(
        &self,
        user_id: Uuid,
        role: Role,
        password_hash: Option<String>,
    ) -> Result<UserRecord, StoreError> {
        self.gate().await;
        let mut state = self.state.lock().unwrap();
        let user = state
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or(StoreError::Query(diesel::result::Error::NotFound))?;
        user.role = role;
        if let Some(hash) = password_hash {
            user.password_hash = hash;
        }
        Ok(user.clone())
    }

    async fn insert_session(&self, session: SessionRecord) -> Result<(), StoreError> {
        self.gate().await;
        let mut state = self.state.lock().unwrap();
        state.sessions.insert(session.token.clone(), session);
        Ok(())
    }

    async fn find_session(&self, token: &str) -> Result<Option<(SessionRecord, UserRecord)>, StoreError> {
        self.gate().await;
        let state = self.state.lock().unwrap();
        let Some(session) = state.sessions.get(token) else {
            return Ok(None);
        };
        let user = state.users.iter().find(|u| u.id == session.user_id).cloned();
        Ok(user.map(|u| (session.clone(), u)))
    }

    async fn delete_session(&self, token: &str) -> Result<(), StoreError> {
        self.gate().await;
        self.state.lock().unwrap().sessions.remove(token);
        Ok(())
    }
}
