//! Trip request details and timestamp types
use super::error::WorkflowError;
use chrono::{DateTime, TimeZone, Utc};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, PartialEq)]
pub enum TripCategory {
    #[n(0)]
    Standard,
    #[n(1)]
    DistanceBilled,
}

// Also used for constructing drafts. The requester is the only mandatory
// field; cost may legitimately be zero (no allocation is ever written for
// zero-cost trips).
#[derive(minicbor::Encode, minicbor::Decode, Debug, Default, Clone, Eq, PartialEq)]
pub struct TripDetails {
    #[n(0)]
    requester_id: Option<String>,
    #[n(1)]
    department_id: Option<String>,
    #[n(2)]
    project_id: Option<String>,
    #[n(3)]
    cost: u64,
    #[n(4)]
    kilometers: Option<u32>,
    #[n(5)]
    urgent: bool,
    #[n(6)]
    category: Option<TripCategory>,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl<T: TimeZone + PartialEq> PartialOrd for TimeStamp<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(&other.0)
    }
}

impl<T: TimeZone + Eq> Ord for TimeStamp<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// A timestamp strictly after this one. Synthetic history entries (the
    /// urgent bypass marker) must sort after the submission entry even when
    /// both are minted in the same instant.
    pub fn just_after(&self) -> Self {
        Self(self.0 + chrono::Duration::milliseconds(1))
    }
}

impl TripDetails {
    /// Construct a new builder object, this becomes the basis for a draft
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_requester(mut self, requester_id: &str) -> Self {
        self.requester_id = Some(requester_id.to_string());
        self
    }
    pub fn set_department(mut self, department_id: &str) -> Self {
        self.department_id = Some(department_id.to_string());
        self
    }
    pub fn set_project(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }
    pub fn set_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }
    pub fn set_kilometers(mut self, kilometers: u32) -> Self {
        self.kilometers = Some(kilometers);
        self
    }
    pub fn set_urgent(mut self, urgent: bool) -> Self {
        self.urgent = urgent;
        self
    }
    pub fn set_category(mut self, category: TripCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn requester_id(&self) -> Option<&str> {
        self.requester_id.as_deref()
    }
    pub fn department_id(&self) -> Option<&str> {
        self.department_id.as_deref()
    }
    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }
    pub fn cost(&self) -> u64 {
        self.cost
    }
    pub fn kilometers(&self) -> Option<u32> {
        self.kilometers
    }
    pub fn is_urgent(&self) -> bool {
        self.urgent
    }
    pub fn category(&self) -> TripCategory {
        self.category.unwrap_or(TripCategory::Standard)
    }

    // Checks fields before a draft is allowed into the workflow.
    pub fn validate_and_finalise(&self) -> anyhow::Result<()> {
        if self.requester_id.is_none() {
            return Err(WorkflowError::Validation("requester is not set".into()).into());
        }
        if self.category() == TripCategory::DistanceBilled && self.kilometers.is_none() {
            return Err(WorkflowError::Validation(
                "distance-billed trip has no kilometers".into(),
            )
            .into());
        }
        Ok(())
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}
impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}
impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}
