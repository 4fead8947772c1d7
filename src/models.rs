//! Domain Models
//!
//! Mirrors of the server-side user, workspace and sensor records.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub type UserId = i64;
pub type WorkspaceId = i64;
pub type SensorId = i64;

/// Account role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

/// Signed-in user, replaced wholesale on every identity fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(default = "default_role")]
    pub role: Role,
    #[serde(default)]
    pub is_validated: bool,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub address_line: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

fn default_role() -> Role {
    Role::User
}

/// Sensor attached to a workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: SensorId,
    pub name: String,
    /// Key for analytics and prediction queries
    #[serde(default)]
    pub source_id: Option<String>,
}

/// Workspace owned by the signed-in user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    #[serde(default)]
    pub user_id: Option<UserId>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sensors: Vec<Sensor>,
}

/// Body of a workspace creation
#[derive(Debug, Clone, Serialize)]
pub struct NewWorkspace {
    pub name: String,
    pub description: String,
    pub is_active: bool,
}

impl NewWorkspace {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            is_active: true,
        }
    }
}

/// Partial workspace update; `None` fields are left untouched
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkspacePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_active: Option<bool>,
}

impl WorkspacePatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.is_active.is_none()
    }
}

/// Accepts RFC 3339 as well as the naive ISO form the API emits
/// (`2024-05-01T10:00:00`), read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_workspace_from_api_shape() {
        let workspace: Workspace = serde_json::from_value(json!({
            "id": 1,
            "user_id": 4,
            "name": "Home",
            "description": "Flat",
            "is_active": true,
            "created_at": "2024-05-01T10:00:00",
            "updated_at": null,
            "sensors": [
                { "id": 10, "name": "Kitchen", "source_id": "A1" },
                { "id": 11, "name": "Cellar" }
            ]
        }))
        .unwrap();

        assert_eq!(workspace.sensors.len(), 2);
        assert_eq!(workspace.sensors[1].source_id, None);
        assert!(workspace.created_at.is_some());
        assert!(workspace.updated_at.is_none());
    }

    #[test]
    fn workspace_without_sensors_defaults_empty() {
        let workspace: Workspace =
            serde_json::from_value(json!({ "id": 2, "name": "Office" })).unwrap();
        assert!(workspace.sensors.is_empty());
    }

    #[test]
    fn decodes_user() {
        let user: User = serde_json::from_value(json!({
            "id": 7,
            "username": "jdoe",
            "email": "user@example.com",
            "role": "admin",
            "is_validated": true,
            "created_at": "2024-01-02T03:04:05Z",
            "city": "Paris"
        }))
        .unwrap();

        assert!(user.is_admin());
        assert_eq!(user.city.as_deref(), Some("Paris"));
        assert_eq!(user.postal_code, None);
    }

    #[test]
    fn patch_skips_unset_fields() {
        let patch = WorkspacePatch {
            name: Some("Renamed".into()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&patch).unwrap(), json!({ "name": "Renamed" }));
        assert!(WorkspacePatch::default().is_empty());
    }
}
