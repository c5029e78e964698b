use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

pub mod reference;

pub const DEFAULT_DOCTOR: &str = "Dr. Smith";
pub const DEFAULT_PAGE_LIMIT: i64 = 200;
pub const MAX_PAGE_LIMIT: i64 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub entity: &'static str,
    pub from: &'static str,
    pub to: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cannot move from {} to {}", self.entity, self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown status {:?}", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

/// A permitted edge in a status graph. Stores express the edge as a
/// conditional write (`WHERE status = from`, `SET status = to`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<S> {
    pub from: S,
    pub to: S,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Available,
    Booked,
    /// Reserved; nothing moves a slot here.
    Cancelled,
}

impl SlotStatus {
    pub const BOOK: Transition<SlotStatus> = Transition {
        from: SlotStatus::Available,
        to: SlotStatus::Booked,
    };
    pub const RELEASE: Transition<SlotStatus> = Transition {
        from: SlotStatus::Booked,
        to: SlotStatus::Available,
    };

    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Booked => "booked",
            SlotStatus::Cancelled => "cancelled",
        }
    }

    pub fn apply(self, transition: Transition<SlotStatus>) -> Result<SlotStatus, InvalidTransition> {
        if self == transition.from {
            Ok(transition.to)
        } else {
            Err(InvalidTransition {
                entity: "slot",
                from: self.as_str(),
                to: transition.to.as_str(),
            })
        }
    }
}

impl FromStr for SlotStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(SlotStatus::Available),
            "booked" => Ok(SlotStatus::Booked),
            "cancelled" => Ok(SlotStatus::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    Booked,
    Cancelled,
    /// Reserved; nothing moves an appointment here yet.
    Completed,
}

impl AppointmentStatus {
    pub const CANCEL: Transition<AppointmentStatus> = Transition {
        from: AppointmentStatus::Booked,
        to: AppointmentStatus::Cancelled,
    };

    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Booked => "booked",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
        }
    }

    pub fn apply(
        self,
        transition: Transition<AppointmentStatus>,
    ) -> Result<AppointmentStatus, InvalidTransition> {
        if self == transition.from {
            Ok(transition.to)
        } else {
            Err(InvalidTransition {
                entity: "appointment",
                from: self.as_str(),
                to: transition.to.as_str(),
            })
        }
    }
}

impl FromStr for AppointmentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "booked" => Ok(AppointmentStatus::Booked),
            "cancelled" => Ok(AppointmentStatus::Cancelled),
            "completed" => Ok(AppointmentStatus::Completed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub doctor: String,
    pub status: SlotStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A slot that passed interval validation and is ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub doctor: String,
}

impl NewSlot {
    /// Rejects `end <= start`. A blank doctor label becomes [`DEFAULT_DOCTOR`].
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, doctor: Option<&str>) -> Result<Self, String> {
        if end <= start {
            return Err("end must be after start".to_string());
        }
        let doctor = doctor
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(DEFAULT_DOCTOR)
            .to_string();
        Ok(Self { start, end, doctor })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: Uuid,
    pub slot_id: Uuid,
    pub patient_name: String,
    pub contact: String,
    pub reason: Option<String>,
    pub status: AppointmentStatus,
    pub reference: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentWithSlot {
    #[serde(flatten)]
    pub appointment: Appointment,
    pub slot: Option<Slot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Patient,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Patient => "patient",
        }
    }
}

impl FromStr for Role {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "patient" => Ok(Role::Patient),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub username: String,
    pub role: Role,
}

/// Inclusive bounds on slot start times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| at >= from) && self.to.map_or(true, |to| at <= to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: i64,
    pub limit: i64,
}

impl PageRequest {
    /// Clamps `page` to at least 1 and `limit` to `1..=MAX_PAGE_LIMIT`.
    pub fn new(page: Option<i64>, limit: Option<i64>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.limit)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotQuery {
    pub range: TimeRange,
    pub status: Option<SlotStatus>,
    pub page: PageRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub pages: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, request: PageRequest) -> Self {
        let pages = (total + request.limit - 1) / request.limit;
        Self {
            items,
            total,
            page: request.page,
            pages,
        }
    }
}
