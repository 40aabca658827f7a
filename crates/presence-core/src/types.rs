use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// System-wide template dimensionality. Every enrolled and captured
/// template carries exactly this many components.
pub const TEMPLATE_DIM: usize = 128;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("template has {got} dimensions, expected {TEMPLATE_DIM}")]
    WrongDimension { got: usize },
}

/// Facial template vector (fixed [`TEMPLATE_DIM`] dimensions).
///
/// Serializes as a bare float array; deserialization goes through the
/// same dimension check as [`Template::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Template {
    values: Vec<f32>,
}

impl Template {
    /// Wrap a raw vector, rejecting anything that is not [`TEMPLATE_DIM`] long.
    pub fn new(values: Vec<f32>) -> Result<Self, TemplateError> {
        if values.len() != TEMPLATE_DIM {
            return Err(TemplateError::WrongDimension { got: values.len() });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Compute Euclidean distance to another template.
    pub fn euclidean_distance(&self, other: &Template) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl TryFrom<Vec<f32>> for Template {
    type Error = TemplateError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Template::new(values)
    }
}

impl From<Template> for Vec<f32> {
    fn from(template: Template) -> Self {
        template.values
    }
}

/// One enrolled person's template, as read from the template directory.
/// Exactly one template per person; re-enrollment overwrites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrolledTemplate {
    pub person_id: i64,
    pub name: String,
    pub template: Template,
}

/// Immutable point-in-time view of the enrolled gallery.
///
/// Owned by the caller and refreshed periodically; the matcher itself
/// holds no enrollment state.
#[derive(Debug, Clone)]
pub struct TemplateSnapshot {
    entries: Vec<EnrolledTemplate>,
    taken_at: DateTime<Utc>,
}

impl TemplateSnapshot {
    pub fn new(entries: Vec<EnrolledTemplate>) -> Self {
        Self {
            entries,
            taken_at: Utc::now(),
        }
    }

    /// Snapshot with no enrolled templates (daemon startup state).
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn entries(&self) -> &[EnrolledTemplate] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }
}

#[derive(Error, Debug)]
#[error("unknown capture method: {0}")]
pub struct ParseCaptureMethodError(String);

/// How a punch was captured at the station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMethod {
    Face,
    Card,
    Manual,
}

impl fmt::Display for CaptureMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureMethod::Face => write!(f, "face"),
            CaptureMethod::Card => write!(f, "card"),
            CaptureMethod::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for CaptureMethod {
    type Err = ParseCaptureMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "face" => Ok(CaptureMethod::Face),
            "card" => Ok(CaptureMethod::Card),
            "manual" => Ok(CaptureMethod::Manual),
            other => Err(ParseCaptureMethodError(other.to_string())),
        }
    }
}

/// One person's attendance for one calendar day.
///
/// At most one record per (person, day). A record is open until its exit
/// timestamp is set; once closed it is never mutated again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub person_id: i64,
    pub day: NaiveDate,
    pub entry_at: NaiveDateTime,
    pub exit_at: Option<NaiveDateTime>,
    /// Whole minutes past the expected start, floored at zero.
    pub lateness_minutes: i64,
    pub method: CaptureMethod,
}

impl AttendanceRecord {
    pub fn is_open(&self) -> bool {
        self.exit_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_rejects_wrong_dimension() {
        let err = Template::new(vec![0.0; 64]).unwrap_err();
        assert!(matches!(err, TemplateError::WrongDimension { got: 64 }));
    }

    #[test]
    fn test_template_accepts_exact_dimension() {
        let t = Template::new(vec![0.5; TEMPLATE_DIM]).unwrap();
        assert_eq!(t.values().len(), TEMPLATE_DIM);
    }

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Template::new(vec![0.3; TEMPLATE_DIM]).unwrap();
        let b = Template::new(vec![0.3; TEMPLATE_DIM]).unwrap();
        assert_eq!(a.euclidean_distance(&b), 0.0);
    }

    #[test]
    fn test_euclidean_distance_single_axis() {
        let mut va = vec![0.0; TEMPLATE_DIM];
        let mut vb = vec![0.0; TEMPLATE_DIM];
        va[0] = 0.0;
        vb[0] = 0.5;
        let a = Template::new(va).unwrap();
        let b = Template::new(vb).unwrap();
        assert_eq!(a.euclidean_distance(&b), 0.5);
    }

    #[test]
    fn test_template_deserialize_validates_dimension() {
        let short = serde_json::to_string(&vec![0.1f32; 10]).unwrap();
        assert!(serde_json::from_str::<Template>(&short).is_err());

        let full = serde_json::to_string(&vec![0.1f32; TEMPLATE_DIM]).unwrap();
        assert!(serde_json::from_str::<Template>(&full).is_ok());
    }

    #[test]
    fn test_capture_method_round_trip() {
        for m in [CaptureMethod::Face, CaptureMethod::Card, CaptureMethod::Manual] {
            assert_eq!(m.to_string().parse::<CaptureMethod>().unwrap(), m);
        }
        assert!("retina".parse::<CaptureMethod>().is_err());
    }

    #[test]
    fn test_record_open_state() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        let mut rec = AttendanceRecord {
            id: 1,
            person_id: 7,
            day,
            entry_at: day.and_hms_opt(8, 15, 0).unwrap(),
            exit_at: None,
            lateness_minutes: 15,
            method: CaptureMethod::Face,
        };
        assert!(rec.is_open());
        rec.exit_at = Some(day.and_hms_opt(17, 0, 0).unwrap());
        assert!(!rec.is_open());
    }
}
