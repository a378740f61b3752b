use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Core Record Types
// ============================================================================

/// The record that flows across every topic of the mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Sequence number and routing key (parity)
    pub id: i64,
    /// Identifies the originator instance; never used for routing
    pub label: String,
    pub departments: Vec<Department>,
    pub approval_status: ApprovalStatus,
}

impl Record {
    pub fn new(id: i64, label: impl Into<String>, departments: Vec<Department>) -> Self {
        Self {
            id,
            label: label.into(),
            departments,
            approval_status: ApprovalStatus::Pending,
        }
    }

    pub fn is_odd(&self) -> bool {
        self.id % 2 == 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "PENDING",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Department {
    pub id: i64,
    pub name: String,
    pub budget: Budget,
    pub created_at: DateTime<Utc>,
    pub employees: Vec<Employee>,
}

impl Department {
    /// Create a department stamped with the current time
    pub fn new(id: i64, name: impl Into<String>, budget: Budget, employees: Vec<Employee>) -> Self {
        Self {
            id,
            name: name.into(),
            budget,
            created_at: Utc::now(),
            employees,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Employee {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub title: String,
}

impl Employee {
    pub fn new(
        id: i64,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id,
            first_name: first_name.into(),
            last_name: last_name.into(),
            title: title.into(),
        }
    }
}

// ============================================================================
// Budget (fixed-point decimal)
// ============================================================================

/// Decimal amount with two fractional digits, stored as minor units.
///
/// Serialized as a string (`"1250000.50"`) so the wire value keeps its exact
/// decimal representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Budget {
    minor_units: i64,
}

impl Budget {
    const SCALE: i64 = 100;

    pub fn from_minor_units(minor_units: i64) -> Self {
        Self { minor_units }
    }

    pub fn from_units(units: i64) -> Self {
        Self { minor_units: units * Self::SCALE }
    }

    pub fn minor_units(&self) -> i64 {
        self.minor_units
    }
}

impl fmt::Display for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.minor_units < 0 { "-" } else { "" };
        let abs = self.minor_units.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / Self::SCALE as u64, abs % Self::SCALE as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid budget value: {0}")]
pub struct ParseBudgetError(String);

impl FromStr for Budget {
    type Err = ParseBudgetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseBudgetError(s.to_string());
        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if whole.is_empty() || fraction.len() > 2 || !all_digits(whole) || !all_digits(fraction) {
            return Err(invalid());
        }
        let whole: i64 = whole.parse().map_err(|_| invalid())?;
        let fraction: i64 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<i64>().map_err(|_| invalid())? * 10,
            _ => fraction.parse().map_err(|_| invalid())?,
        };
        let minor_units = whole
            .checked_mul(Self::SCALE)
            .and_then(|v| v.checked_add(fraction))
            .ok_or_else(invalid)?;
        Ok(Self {
            minor_units: if negative { -minor_units } else { minor_units },
        })
    }
}

impl Serialize for Budget {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Budget {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Parity Marker
// ============================================================================

/// Parity class permanently bound to one originator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Marker {
    Odd,
    Even,
}

impl Marker {
    /// Whether `id` belongs to this parity class
    pub fn matches(&self, id: i64) -> bool {
        match self {
            Marker::Odd => id.rem_euclid(2) == 1,
            Marker::Even => id.rem_euclid(2) == 0,
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Marker::Odd => f.write_str("ODD"),
            Marker::Even => f.write_str("EVEN"),
        }
    }
}

// ============================================================================
// Topics
// ============================================================================

/// Routing key stamped on every published message
pub const ROUTING_KEY: &str = "mesh-key";

/// The six topics of the fixed mesh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicNames {
    pub origin_1: String,
    pub origin_2: String,
    pub destination_1: String,
    pub destination_2: String,
    pub select_destination: String,
    pub select_origin: String,
}

impl TopicNames {
    pub fn all(&self) -> [&str; 6] {
        [
            &self.origin_1,
            &self.origin_2,
            &self.destination_1,
            &self.destination_2,
            &self.select_destination,
            &self.select_origin,
        ]
    }
}

impl Default for TopicNames {
    fn default() -> Self {
        Self {
            origin_1: "persistent://public/default/mesh-orig-1".to_string(),
            origin_2: "persistent://public/default/mesh-orig-2".to_string(),
            destination_1: "persistent://public/default/mesh-dest-1".to_string(),
            destination_2: "persistent://public/default/mesh-dest-2".to_string(),
            select_destination: "persistent://public/default/mesh-select-dest".to_string(),
            select_origin: "persistent://public/default/mesh-select-orig".to_string(),
        }
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Short random label identifying one originator instance
pub fn create_label() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_uppercase()
}

/// The department payload every originator attaches to its records
pub fn fixture_departments() -> Vec<Department> {
    vec![
        Department::new(
            1,
            "Research",
            Budget::from_minor_units(125_000_050),
            vec![
                Employee::new(101, "Ada", "Lovelace", "Analyst"),
                Employee::new(102, "Alan", "Turing", "Cryptographer"),
            ],
        ),
        Department::new(
            2,
            "Operations",
            Budget::from_units(480_000),
            vec![
                Employee::new(201, "Grace", "Hopper", "Rear Admiral"),
                Employee::new(202, "Edsger", "Dijkstra", "Programmer"),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_starts_pending() {
        let record = Record::new(7, "ABC", fixture_departments());
        assert_eq!(record.approval_status, ApprovalStatus::Pending);
        assert!(record.is_odd());
    }

    #[test]
    fn test_record_wire_layout() {
        let record = Record::new(2, "LBL", vec![]);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], 2);
        assert_eq!(json["label"], "LBL");
        assert_eq!(json["approvalStatus"], "PENDING");
        assert!(json["departments"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_nested_wire_layout() {
        let departments = fixture_departments();
        let json = serde_json::to_value(&departments[0]).unwrap();
        assert_eq!(json["budget"], "1250000.50");
        assert!(json.get("createdAt").is_some());
        assert_eq!(json["employees"][0]["firstName"], "Ada");
        assert_eq!(json["employees"][0]["lastName"], "Lovelace");
    }

    #[test]
    fn test_budget_parse_and_display() {
        assert_eq!("12.5".parse::<Budget>().unwrap().minor_units(), 1250);
        assert_eq!("-3.07".parse::<Budget>().unwrap().to_string(), "-3.07");
        assert_eq!(Budget::from_units(480_000).to_string(), "480000.00");
        assert!("1.234".parse::<Budget>().is_err());
        assert!(".5".parse::<Budget>().is_err());
        assert!("abc".parse::<Budget>().is_err());
        assert!("--5".parse::<Budget>().is_err());
        assert!("+5".parse::<Budget>().is_err());
        assert!("1.+5".parse::<Budget>().is_err());
        assert!("1.-5".parse::<Budget>().is_err());
        assert!("1.".parse::<Budget>().is_ok());
        assert!(serde_json::from_str::<Budget>("\"1.-5\"").is_err());
    }

    #[test]
    fn test_marker_matches() {
        assert!(Marker::Odd.matches(1));
        assert!(!Marker::Odd.matches(2));
        assert!(Marker::Even.matches(0));
        assert!(Marker::Even.matches(4));
        assert_eq!(Marker::Odd.to_string(), "ODD");
    }

    #[test]
    fn test_labels_are_distinct() {
        let a = create_label();
        let b = create_label();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }
}
