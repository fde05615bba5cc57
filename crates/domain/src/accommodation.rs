//! The CreateAccommodation saga: listing entity and message vocabulary.
//!
//! The entity merges the listing with its availability window. A listing
//! submitted without a price or a date range needs the availability step,
//! which the orchestrator runs as a linked child saga.

use chrono::NaiveDate;
use common::EntityId;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::message::{self, SagaEntity, SagaSchema, message_type};

pub const CREATE_ACCOMMODATION_COMMAND_TOPIC: &str = "create_accommodation.command";
pub const CREATE_ACCOMMODATION_REPLY_TOPIC: &str = "create_accommodation.reply";

/// Nightly price of a stay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub amount_cents: i64,
    /// Whether the amount is charged per guest rather than per stay.
    #[serde(default)]
    pub per_guest: bool,
}

impl Price {
    pub fn per_stay(amount_cents: i64) -> Self {
        Self {
            amount_cents,
            per_guest: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccommodationWithAvailability {
    pub id: EntityId,
    pub host_id: EntityId,
    pub name: String,
    pub location: String,
    pub min_guests: u32,
    pub max_guests: u32,
    #[serde(default)]
    pub amenities: Vec<String>,
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    /// Set by the availability service once the window is stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_id: Option<String>,
}

impl AccommodationWithAvailability {
    pub fn new(
        host_id: EntityId,
        name: impl Into<String>,
        location: impl Into<String>,
        min_guests: u32,
        max_guests: u32,
    ) -> Self {
        Self {
            id: EntityId::generate(),
            host_id,
            name: name.into(),
            location: location.into(),
            min_guests,
            max_guests,
            amenities: Vec::new(),
            price: None,
            start_date: None,
            end_date: None,
            availability_id: None,
        }
    }

    pub fn with_amenities<I, A>(mut self, amenities: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.amenities = amenities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_availability(mut self, price: Price, start: NaiveDate, end: NaiveDate) -> Self {
        self.price = Some(price);
        self.start_date = Some(start);
        self.end_date = Some(end);
        self
    }

    /// True when price and both dates are present.
    pub fn has_availability_window(&self) -> bool {
        self.price.is_some() && self.start_date.is_some() && self.end_date.is_some()
    }

    /// A listing missing any part of its window goes through the
    /// availability step before recommendations.
    pub fn needs_availability_step(&self) -> bool {
        !self.has_availability_window()
    }
}

impl SagaEntity for AccommodationWithAvailability {
    fn entity_id(&self) -> &EntityId {
        &self.id
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_blank() {
            return Err(ValidationError::Missing { field: "id" });
        }
        if self.host_id.is_blank() {
            return Err(ValidationError::Missing { field: "host_id" });
        }
        if self.name.trim().is_empty() {
            return Err(ValidationError::Missing { field: "name" });
        }
        if self.location.trim().is_empty() {
            return Err(ValidationError::Missing { field: "location" });
        }
        if self.min_guests == 0 {
            return Err(ValidationError::invalid("min_guests", "must be at least 1"));
        }
        if self.min_guests > self.max_guests {
            return Err(ValidationError::invalid(
                "max_guests",
                format!("{} is below min_guests {}", self.max_guests, self.min_guests),
            ));
        }
        if let Some(price) = self.price
            && price.amount_cents <= 0
        {
            return Err(ValidationError::invalid("price", "must be positive"));
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date)
            && start > end
        {
            return Err(ValidationError::invalid(
                "end_date",
                format!("{end} is before start_date {start}"),
            ));
        }
        Ok(())
    }
}

message_type! {
    /// Commands of the CreateAccommodation saga and its availability child.
    pub enum AccommodationCommandType {
        AddAccommodation,
        RollbackAccommodation,
        AddAvailability,
        CancelAvailability,
        AddRecommendation,
        RemoveRecommendation,
    }
}

message_type! {
    /// Replies of the CreateAccommodation saga and its availability child.
    pub enum AccommodationReplyType {
        AccommodationAdded,
        AccommodationNotAdded,
        AccommodationRolledBack,
        AvailabilityAdded,
        AvailabilityNotAdded,
        AvailabilityCancelled,
        RecommendationAdded,
        RecommendationNotAdded,
        RecommendationRemoved,
        CompensationFailed,
    }
}

/// Schema marker for the CreateAccommodation saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateAccommodation;

impl SagaSchema for CreateAccommodation {
    type Entity = AccommodationWithAvailability;
    type CommandType = AccommodationCommandType;
    type ReplyType = AccommodationReplyType;

    const NAME: &'static str = "CreateAccommodation";
    const COMMAND_TOPIC: &'static str = CREATE_ACCOMMODATION_COMMAND_TOPIC;
    const REPLY_TOPIC: &'static str = CREATE_ACCOMMODATION_REPLY_TOPIC;
}

pub type CreateAccommodationCommand = message::Command<CreateAccommodation>;
pub type CreateAccommodationReply = message::Reply<CreateAccommodation>;
