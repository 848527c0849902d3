use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

// ============================================================================
// Scenario status
// ============================================================================

/// Scenario status. Governs which lifecycle operations are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    /// Empty or recycled, available as a copy destination.
    Free,
    /// Populated and routable.
    InUse,
    /// A lifecycle operation is in flight.
    Busy,
}

impl ScenarioStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioStatus::Free => "free",
            ScenarioStatus::InUse => "in_use",
            ScenarioStatus::Busy => "busy",
        }
    }

    /// Whether `self -> to` is an edge of the scenario state machine.
    ///
    /// ```text
    /// free   -> busy
    /// in_use -> busy
    /// busy   -> in_use | free
    /// ```
    /// Row removal after a delete is the terminal edge and is not a status.
    pub fn can_transition_to(self, to: ScenarioStatus) -> bool {
        matches!(
            (self, to),
            (ScenarioStatus::Free, ScenarioStatus::Busy)
                | (ScenarioStatus::InUse, ScenarioStatus::Busy)
                | (ScenarioStatus::Busy, ScenarioStatus::InUse)
                | (ScenarioStatus::Busy, ScenarioStatus::Free)
        )
    }
}

impl fmt::Display for ScenarioStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ScenarioStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "free" => Ok(ScenarioStatus::Free),
            "in_use" => Ok(ScenarioStatus::InUse),
            "busy" => Ok(ScenarioStatus::Busy),
            other => Err(AppError::Validation(format!("Unknown scenario status '{other}'"))),
        }
    }
}

// ============================================================================
// Scenario
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    /// Unique alias. Immutable after creation.
    pub name: String,
    pub status: ScenarioStatus,
    pub description: Option<String>,
    /// Physical database file stem the alias currently points to.
    pub storage: String,
    pub last_modified: String,
    /// Last time the data was copied in or reset.
    pub last_refresh: Option<String>,
    /// Set only on the reserved production scenario.
    pub is_production: bool,
}

impl Scenario {
    /// Display label: description when present, else the name.
    pub fn tag(&self) -> &str {
        match self.description.as_deref() {
            Some(d) if !d.trim().is_empty() => d,
            _ => &self.name,
        }
    }
}

/// Generate a fresh, collision-free storage stem for a scenario name.
pub fn new_storage_name(name: &str) -> String {
    format!("{}-{}", name, uuid::Uuid::new_v4().simple())
}

/// Scenario names double as file stems and URL prefixes.
pub fn validate_scenario_name(name: &str) -> Result<(), AppError> {
    if name.trim().is_empty() {
        return Err(AppError::Validation("Scenario name cannot be empty".into()));
    }
    if name.len() > 300 {
        return Err(AppError::Validation("Scenario name must be at most 300 characters".into()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(AppError::Validation(format!(
            "Scenario name '{name}' may only contain ASCII letters, digits, '_' and '-'"
        )));
    }
    Ok(())
}

// ============================================================================
// Access grants
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub username: String,
    pub scenario: String,
    pub position: i64,
    pub granted_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        use ScenarioStatus::*;
        assert!(Free.can_transition_to(Busy));
        assert!(InUse.can_transition_to(Busy));
        assert!(Busy.can_transition_to(InUse));
        assert!(Busy.can_transition_to(Free));

        assert!(!Free.can_transition_to(InUse));
        assert!(!InUse.can_transition_to(Free));
        assert!(!Busy.can_transition_to(Busy));
        assert!(!Free.can_transition_to(Free));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("In use".parse::<ScenarioStatus>().unwrap(), ScenarioStatus::InUse);
        assert_eq!("in-use".parse::<ScenarioStatus>().unwrap(), ScenarioStatus::InUse);
        assert_eq!("FREE".parse::<ScenarioStatus>().unwrap(), ScenarioStatus::Free);
        assert!("gone".parse::<ScenarioStatus>().is_err());
    }

    #[test]
    fn test_validate_scenario_name() {
        assert!(validate_scenario_name("scenario_1").is_ok());
        assert!(validate_scenario_name("qa-2").is_ok());
        assert!(validate_scenario_name("").is_err());
        assert!(validate_scenario_name("../etc").is_err());
        assert!(validate_scenario_name("a b").is_err());
    }

    #[test]
    fn test_storage_names_are_unique() {
        assert_ne!(new_storage_name("qa"), new_storage_name("qa"));
        assert!(new_storage_name("qa").starts_with("qa-"));
    }
}
