// src/config.rs

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

use crate::error::InvoicingError;

pub const DEFAULT_AGILEDAY_API_URL: &str = "https://sevendos.agileday.io/api/v1";
pub const DEFAULT_INTERNAL_COMPANY: &str = "OrangIT Oy";
pub const DEFAULT_HOUR_STATUS: &str = "Submitted";
pub const MISSING_RATES_FILE_NAME: &str = "missing_from_rates.txt";

fn default_api_url() -> String {
    DEFAULT_AGILEDAY_API_URL.to_string()
}
fn default_internal_company() -> String {
    DEFAULT_INTERNAL_COMPANY.to_string()
}
fn default_company_code() -> String {
    "263".to_string()
}
fn default_reply_email() -> String {
    "laskutus@barona.fi".to_string()
}
fn default_source_system() -> String {
    "Orangit".to_string()
}
fn default_cost_center() -> String {
    "1999".to_string()
}
fn default_business_line() -> String {
    "IT".to_string()
}
fn default_area() -> String {
    "10091".to_string()
}
fn default_service() -> String {
    "KON".to_string()
}

/// Runtime settings read from the environment (and `.env` via dotenv).
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub agileday_token: Option<String>,
    #[serde(default = "default_api_url")]
    pub agileday_api_url: String,
    #[serde(default = "default_internal_company")]
    pub internal_company: String,
    #[serde(default = "default_company_code")]
    pub company_code: String,
    #[serde(default = "default_reply_email")]
    pub reply_email: String,
    #[serde(default = "default_source_system")]
    pub source_system: String,
    #[serde(default = "default_cost_center")]
    pub dim_cost_center: String,
    #[serde(default = "default_business_line")]
    pub dim_business_line: String,
    #[serde(default = "default_area")]
    pub dim_area: String,
    #[serde(default = "default_service")]
    pub dim_service: String,
    /// `Role=email,email;Role=email`
    #[serde(default)]
    pub role_emails: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self, InvoicingError> {
        envy::from_env::<Settings>().map_err(|e| InvoicingError::ConfigError(e.to_string()))
    }

    /// Token for the AgileDay API, trimmed. Only required by commands that talk to the API.
    pub fn require_token(&self) -> Result<String, InvoicingError> {
        self.agileday_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .ok_or_else(|| InvoicingError::MissingEnvVar("AGILEDAY_TOKEN".into()))
    }

    pub fn workday_profile(&self) -> WorkdayProfile {
        WorkdayProfile {
            company_code: self.company_code.clone(),
            reply_email: self.reply_email.clone(),
            source_system: self.source_system.clone(),
            dimensions: Dimensions {
                cost_center: self.dim_cost_center.clone(),
                business_line: self.dim_business_line.clone(),
                area: self.dim_area.clone(),
                service: self.dim_service.clone(),
            },
        }
    }

    pub fn role_directory(&self) -> RoleDirectory {
        self.role_emails
            .as_deref()
            .map(RoleDirectory::parse)
            .unwrap_or_default()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            agileday_token: None,
            agileday_api_url: default_api_url(),
            internal_company: default_internal_company(),
            company_code: default_company_code(),
            reply_email: default_reply_email(),
            source_system: default_source_system(),
            dim_cost_center: default_cost_center(),
            dim_business_line: default_business_line(),
            dim_area: default_area(),
            dim_service: default_service(),
            role_emails: None,
        }
    }
}

/// Organizational dimension codes written on every detail row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimensions {
    pub cost_center: String,
    pub business_line: String,
    pub area: String,
    pub service: String,
}

/// Deployment constants of the Workday transfer file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkdayProfile {
    pub company_code: String,
    pub reply_email: String,
    pub source_system: String,
    pub dimensions: Dimensions,
}

impl Default for WorkdayProfile {
    fn default() -> Self {
        Settings::default().workday_profile()
    }
}

// --- Roles ---

/// Declaration order is the row order of the role matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    Backoffice,
    ServiceLead,
    TeamLead,
    Engineer,
}

impl Role {
    pub fn parse(label: &str) -> Option<Role> {
        match label.trim().to_lowercase().as_str() {
            "backoffice" => Some(Role::Backoffice),
            "service lead" => Some(Role::ServiceLead),
            "team lead" => Some(Role::TeamLead),
            "engineer" => Some(Role::Engineer),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Role::Backoffice => "Backoffice",
            Role::ServiceLead => "Service Lead",
            Role::TeamLead => "Team Lead",
            Role::Engineer => "Engineer",
        };
        f.write_str(label)
    }
}

/// Email to role lookup. Unknown emails are engineers.
#[derive(Debug, Clone, Default)]
pub struct RoleDirectory {
    by_email: HashMap<String, Role>,
}

impl RoleDirectory {
    pub fn parse(raw: &str) -> Self {
        let mut by_email = HashMap::new();
        for group in raw.split(';').map(str::trim).filter(|g| !g.is_empty()) {
            let Some((label, emails)) = group.split_once('=') else {
                warn!("Ignoring role mapping without '=': '{}'", group);
                continue;
            };
            let Some(role) = Role::parse(label) else {
                warn!("Ignoring unknown role '{}' in role mapping", label.trim());
                continue;
            };
            for email in emails.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                debug!("Mapping {} to role {}", email, role);
                by_email.insert(email.to_lowercase(), role);
            }
        }
        Self { by_email }
    }

    #[cfg(test)]
    pub fn with_role(mut self, email: &str, role: Role) -> Self {
        self.by_email.insert(email.trim().to_lowercase(), role);
        self
    }

    pub fn role_for(&self, email: &str) -> Role {
        self.by_email
            .get(&email.trim().to_lowercase())
            .copied()
            .unwrap_or(Role::Engineer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_directory_parses_groups_and_defaults_to_engineer() {
        let roles = RoleDirectory::parse(
            "Backoffice=anna@orangit.fi, bob@orangit.fi; Team Lead=Cecilia@OrangIT.fi;Wizard=x@y.z",
        );
        assert_eq!(roles.role_for("ANNA@orangit.fi"), Role::Backoffice);
        assert_eq!(roles.role_for("bob@orangit.fi"), Role::Backoffice);
        assert_eq!(roles.role_for("cecilia@orangit.fi"), Role::TeamLead);
        assert_eq!(roles.role_for("x@y.z"), Role::Engineer);
        assert_eq!(roles.role_for("nobody@example.com"), Role::Engineer);
    }

    #[test]
    fn default_profile_matches_workday_constants() {
        let profile = WorkdayProfile::default();
        assert_eq!(profile.company_code, "263");
        assert_eq!(profile.source_system, "Orangit");
        assert_eq!(profile.dimensions.cost_center, "1999");
        assert_eq!(profile.dimensions.business_line, "IT");
        assert_eq!(profile.dimensions.area, "10091");
        assert_eq!(profile.dimensions.service, "KON");
    }

    #[test]
    fn missing_token_is_reported_by_name() {
        let settings = Settings {
            agileday_token: Some("   ".into()),
            ..Settings::default()
        };
        match settings.require_token() {
            Err(InvoicingError::MissingEnvVar(name)) => assert_eq!(name, "AGILEDAY_TOKEN"),
            other => panic!("expected MissingEnvVar, got {:?}", other),
        }
    }
}
