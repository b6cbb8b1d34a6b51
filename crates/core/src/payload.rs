use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Farm,
    Field,
    CropRecord,
    HistoryEvent,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Farm,
        EntityKind::Field,
        EntityKind::CropRecord,
        EntityKind::HistoryEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Farm => "farm",
            Self::Field => "field",
            Self::CropRecord => "crop_record",
            Self::HistoryEvent => "history_event",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "farm" => Ok(Self::Farm),
            "field" => Ok(Self::Field),
            "crop_record" => Ok(Self::CropRecord),
            "history_event" => Ok(Self::HistoryEvent),
            _ => Err(CoreError::Serialization(format!("unknown entity kind: {s}"))),
        }
    }

    /// Kind of the container this kind lives under. `None` means the owner's
    /// account.
    pub fn parent_kind(&self) -> Option<EntityKind> {
        match self {
            Self::Farm => None,
            Self::Field => Some(Self::Farm),
            Self::CropRecord | Self::HistoryEvent => Some(Self::Field),
        }
    }

    /// Distance from the account root. Parents always sync before children.
    pub fn depth(&self) -> u8 {
        match self.parent_kind() {
            None => 0,
            Some(parent) => parent.depth() + 1,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Boundary {
    pub points: Vec<GeoPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FarmPayload {
    pub name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub size: Option<f64>,
    #[serde(default)]
    pub size_unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldPayload {
    pub name: String,
    #[serde(default)]
    pub size: Option<f64>,
    #[serde(default)]
    pub size_unit: Option<String>,
    #[serde(default)]
    pub boundary: Option<Boundary>,
    #[serde(default)]
    pub location_description: Option<String>,
    #[serde(default)]
    pub soil_type: Option<String>,
    #[serde(default)]
    pub irrigation_type: Option<String>,
}

impl FieldPayload {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: None,
            size_unit: None,
            boundary: None,
            location_description: None,
            soil_type: None,
            irrigation_type: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropRecordPayload {
    pub crop_type: String,
    #[serde(default)]
    pub planting_date: Option<NaiveDate>,
    #[serde(default)]
    pub expected_harvest_date: Option<NaiveDate>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEventPayload {
    pub event_type: String,
    pub description: String,
    pub occurred_at: DateTime<Utc>,
}

/// Domain fields of an entity, one variant per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EntityPayload {
    Farm(FarmPayload),
    Field(FieldPayload),
    CropRecord(CropRecordPayload),
    HistoryEvent(HistoryEventPayload),
}

fn require_text(label: &str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::InvalidPayload(format!("{label} is required")));
    }
    Ok(())
}

fn check_size(size: Option<f64>) -> Result<(), CoreError> {
    match size {
        Some(s) if !s.is_finite() || s < 0.0 => Err(CoreError::InvalidPayload(format!(
            "size must be a non-negative number, got {s}"
        ))),
        _ => Ok(()),
    }
}

impl EntityPayload {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Farm(_) => EntityKind::Farm,
            Self::Field(_) => EntityKind::Field,
            Self::CropRecord(_) => EntityKind::CropRecord,
            Self::HistoryEvent(_) => EntityKind::HistoryEvent,
        }
    }

    /// Display name used in logs and listings.
    pub fn label(&self) -> &str {
        match self {
            Self::Farm(p) => &p.name,
            Self::Field(p) => &p.name,
            Self::CropRecord(p) => &p.crop_type,
            Self::HistoryEvent(p) => &p.event_type,
        }
    }

    /// Local schema checks. The remote store may still reject what passes here.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            Self::Farm(p) => {
                require_text("farm name", &p.name)?;
                check_size(p.size)
            }
            Self::Field(p) => {
                require_text("field name", &p.name)?;
                check_size(p.size)?;
                if let Some(boundary) = &p.boundary {
                    if boundary.points.len() < 3 {
                        return Err(CoreError::InvalidPayload(format!(
                            "boundary needs at least 3 points, got {}",
                            boundary.points.len()
                        )));
                    }
                    if !boundary.points.iter().all(GeoPoint::is_valid) {
                        return Err(CoreError::InvalidPayload(
                            "boundary contains an out-of-range coordinate".into(),
                        ));
                    }
                }
                Ok(())
            }
            Self::CropRecord(p) => {
                require_text("crop type", &p.crop_type)?;
                if let (Some(planted), Some(harvest)) = (p.planting_date, p.expected_harvest_date)
                    && harvest < planted
                {
                    return Err(CoreError::InvalidPayload(
                        "expected harvest date precedes planting date".into(),
                    ));
                }
                Ok(())
            }
            Self::HistoryEvent(p) => {
                require_text("event type", &p.event_type)?;
                require_text("event description", &p.description)
            }
        }
    }

    /// The mandatory subset of the payload, used for the single degraded
    /// create attempt after the remote store rejects the full record.
    pub fn minimal(&self) -> EntityPayload {
        match self {
            Self::Farm(p) => Self::Farm(FarmPayload {
                name: p.name.clone(),
                location: None,
                size: None,
                size_unit: None,
            }),
            Self::Field(p) => Self::Field(FieldPayload::named(p.name.clone())),
            Self::CropRecord(p) => Self::CropRecord(CropRecordPayload {
                crop_type: p.crop_type.clone(),
                planting_date: None,
                expected_harvest_date: None,
                status: None,
                notes: None,
            }),
            Self::HistoryEvent(p) => Self::HistoryEvent(p.clone()),
        }
    }

    /// Whether `minimal()` would drop anything.
    pub fn has_optional_fields(&self) -> bool {
        self.minimal() != *self
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}
