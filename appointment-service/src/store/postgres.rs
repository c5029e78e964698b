use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::{Pool, PooledConnection}, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::*;
use uuid::Uuid;

use super::{AccountStore, BookingStore, Cancellation, NewAppointment, NewUser, SessionRecord, SlotRelease, UserRecord};
use crate::error::StoreError;
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PooledConnection<'_, AsyncPgConnection>, StoreError> {
        Ok(self.pool.get().await?)
    }
}

fn filtered_slots(query: &SlotQuery) -> slots::BoxedQuery<'static, Pg> {
    let mut q = slots::table.into_boxed();
    if let Some(from) = query.range.from {
        q = q.filter(slots::start_at.ge(from));
    }
    if let Some(to) = query.range.to {
        q = q.filter(slots::start_at.le(to));
    }
    if let Some(status) = query.status {
        q = q.filter(slots::status.eq(status.as_str()));
    }
    q
}

/// Applies [`SlotStatus::RELEASE`] and reports what it found.
async fn release_slot(
    conn: &mut AsyncPgConnection,
    slot_id: Uuid,
    now: DateTime<Utc>,
) -> Result<SlotRelease, StoreError> {
    let release = SlotStatus::RELEASE;
    let reopened = diesel::update(
        slots::table
            .filter(slots::id.eq(slot_id))
            .filter(slots::status.eq(release.from.as_str())),
    )
    .set((slots::status.eq(release.to.as_str()), slots::updated_at.eq(now)))
    .execute(conn)
    .await?;

    if reopened > 0 {
        return Ok(SlotRelease::Reopened);
    }

    let existing: i64 = slots::table
        .filter(slots::id.eq(slot_id))
        .count()
        .get_result(conn)
        .await?;

    Ok(if existing == 0 {
        SlotRelease::Missing
    } else {
        SlotRelease::NotBooked
    })
}

async fn book_slot_tx(
    conn: &mut AsyncPgConnection,
    slot_id: Uuid,
    appointment: NewAppointment,
) -> Result<Option<AppointmentRow>, StoreError> {
    let now = Utc::now();
    let book = SlotStatus::BOOK;
    let new_row = NewAppointmentRow::from(appointment);

    conn.transaction::<_, StoreError, _>(|conn| {
        Box::pin(async move {
            let flipped = diesel::update(
                slots::table
                    .filter(slots::id.eq(slot_id))
                    .filter(slots::status.eq(book.from.as_str())),
            )
            .set((slots::status.eq(book.to.as_str()), slots::updated_at.eq(now)))
            .execute(conn)
            .await?;

            if flipped == 0 {
                return Ok(None);
            }

            let row = diesel::insert_into(appointments::table)
                .values(&new_row)
                .get_result::<AppointmentRow>(conn)
                .await?;

            Ok(Some(row))
        })
    })
    .await
}

async fn cancel_by_reference_tx(
    conn: &mut AsyncPgConnection,
    reference: String,
    contact: String,
) -> Result<Option<(AppointmentRow, SlotRelease)>, StoreError> {
    let now = Utc::now();
    let cancel = AppointmentStatus::CANCEL;

    conn.transaction::<_, StoreError, _>(|conn| {
        Box::pin(async move {
            let cancelled = diesel::update(
                appointments::table
                    .filter(appointments::reference.eq(reference.as_str()))
                    .filter(appointments::contact.eq(contact.as_str()))
                    .filter(appointments::status.eq(cancel.from.as_str())),
            )
            .set((appointments::status.eq(cancel.to.as_str()), appointments::updated_at.eq(now)))
            .get_result::<AppointmentRow>(conn)
            .await
            .optional()?;

            let Some(row) = cancelled else {
                return Ok(None);
            };

            let release = release_slot(conn, row.slot_id, now).await?;
            Ok(Some((row, release)))
        })
    })
    .await
}

async fn cancel_by_id_tx(
    conn: &mut AsyncPgConnection,
    appointment_id: Uuid,
) -> Result<Option<Cancellation>, StoreError> {
    let now = Utc::now();
    let cancel = AppointmentStatus::CANCEL;

    conn.transaction::<_, StoreError, _>(|conn| {
        Box::pin(async move {
            let current = appointments::table
                .filter(appointments::id.eq(appointment_id))
                .for_update()
                .first::<AppointmentRow>(conn)
                .await
                .optional()?;

            let Some(current) = current else {
                return Ok(None);
            };

            let current = Appointment::try_from(current)?;
            if current.status == cancel.to {
                return Ok(Some(Cancellation::AlreadyCancelled(current)));
            }
            current.status.apply(cancel)?;

            let row = diesel::update(appointments::table.filter(appointments::id.eq(appointment_id)))
                .set((appointments::status.eq(cancel.to.as_str()), appointments::updated_at.eq(now)))
                .get_result::<AppointmentRow>(conn)
                .await?;

            let slot = release_slot(conn, row.slot_id, now).await?;
            Ok(Some(Cancellation::Cancelled {
                appointment: Appointment::try_from(row)?,
                slot,
            }))
        })
    })
    .await
}

#[async_trait]
impl BookingStore for PgStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel::sql_query("SELECT 1").execute(&mut conn).await?;
        Ok(())
    }

    async fn insert_slot(&self, slot: NewSlot) -> Result<Slot, StoreError> {
        let mut conn = self.conn().await?;
        let row = diesel::insert_into(slots::table)
            .values(&NewSlotRow::from(slot))
            .get_result::<SlotRow>(&mut conn)
            .await?;
        Slot::try_from(row)
    }

    async fn list_slots(&self, query: &SlotQuery) -> Result<(Vec<Slot>, i64), StoreError> {
        let mut conn = self.conn().await?;

        let rows = filtered_slots(query)
            .order(slots::start_at.asc())
            .offset(query.page.offset())
            .limit(query.page.limit)
            .load::<SlotRow>(&mut conn)
            .await?;

        let total: i64 = filtered_slots(query)
            .count()
            .get_result(&mut conn)
            .await?;

        let items = rows
            .into_iter()
            .map(Slot::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((items, total))
    }

    async fn book_slot(
        &self,
        slot_id: Uuid,
        appointment: NewAppointment,
    ) -> Result<Option<Appointment>, StoreError> {
        let mut conn = self.conn().await?;
        let row = book_slot_tx(&mut conn, slot_id, appointment).await?;
        row.map(Appointment::try_from).transpose()
    }

    async fn cancel_by_reference(
        &self,
        reference: &str,
        contact: &str,
    ) -> Result<Option<Cancellation>, StoreError> {
        let mut conn = self.conn().await?;
        let outcome = cancel_by_reference_tx(&mut conn, reference.to_string(), contact.to_string()).await?;

        match outcome {
            Some((row, slot)) => Ok(Some(Cancellation::Cancelled {
                appointment: Appointment::try_from(row)?,
                slot,
            })),
            None => Ok(None),
        }
    }

    async fn cancel_by_id(&self, appointment_id: Uuid) -> Result<Option<Cancellation>, StoreError> {
        let mut conn = self.conn().await?;
        cancel_by_id_tx(&mut conn, appointment_id).await
    }

    async fn list_appointments(&self) -> Result<Vec<AppointmentWithSlot>, StoreError> {
        let mut conn = self.conn().await?;

        let rows = appointments::table
            .left_join(slots::table)
            .order(appointments::created_at.desc())
            .load::<(AppointmentRow, Option<SlotRow>)>(&mut conn)
            .await?;

        rows.into_iter()
            .map(|(appointment, slot)| {
                Ok(AppointmentWithSlot {
                    appointment: Appointment::try_from(appointment)?,
                    slot: slot.map(Slot::try_from).transpose()?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl AccountStore for PgStore {
    async fn insert_user(&self, user: NewUser) -> Result<UserRecord, StoreError> {
        let mut conn = self.conn().await?;
        let new_row = NewUserRow {
            id: Uuid::new_v4(),
            username: user.username,
            password_hash: user.password_hash,
            role: user.role.as_str().to_string(),
        };

        let row = diesel::insert_into(users::table)
            .values(&new_row)
            .get_result::<UserRow>(&mut conn)
            .await?;
        UserRecord::try_from(row)
    }

    async fn find_user(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        let mut conn = self.conn().await?;
        let row = users::table
            .filter(users::username.eq(username))
            .first::<UserRow>(&mut conn)
            .await
            .optional()?;
        row.map(UserRecord::try_from).transpose()
    }

    async fn update_user(
        &self,
        user_id: Uuid,
        role: Role,
        password_hash: Option<String>,
    ) -> Result<UserRecord, StoreError> {
        let mut conn = self.conn().await?;
        let target = users::table.filter(users::id.eq(user_id));

        let row = match password_hash {
            Some(hash) => {
                diesel::update(target)
                    .set((users::role.eq(role.as_str()), users::password_hash.eq(hash)))
                    .get_result::<UserRow>(&mut conn)
                    .await?
            }
            None => {
                diesel::update(target)
                    .set(users::role.eq(role.as_str()))
                    .get_result::<UserRow>(&mut conn)
                    .await?
            }
        };
        UserRecord::try_from(row)
    }

    async fn insert_session(&self, session: SessionRecord) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel::insert_into(sessions::table)
            .values(&NewSessionRow::from(session))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn find_session(&self, token: &str) -> Result<Option<(SessionRecord, UserRecord)>, StoreError> {
        let mut conn = self.conn().await?;
        let row = sessions::table
            .inner_join(users::table)
            .filter(sessions::token.eq(token))
            .first::<(SessionRow, UserRow)>(&mut conn)
            .await
            .optional()?;

        match row {
            Some((session, user)) => Ok(Some((SessionRecord::from(session), UserRecord::try_from(user)?))),
            None => Ok(None),
        }
    }

    async fn delete_session(&self, token: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        diesel::delete(sessions::table.filter(sessions::token.eq(token)))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}
