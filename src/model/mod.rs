use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Keeps an explicit `null` as `Some(Value::Null)` so it is written back
/// exactly as received; a missing key stays `None`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// One module as reported by the mirror host. Read-only on this side.
///
/// Only the fields the menus need are typed; everything else the host
/// sends rides along in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDescriptor {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub lock_strings: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModuleDescriptor {
    pub fn has_position(&self) -> bool {
        matches!(&self.position, Some(Value::String(p)) if !p.is_empty())
    }

    pub fn is_externally_locked(&self) -> bool {
        self.hidden && !self.lock_strings.is_empty()
    }
}

/// Full visibility/brightness state of the mirror. Replaced wholesale
/// whenever the host pushes `CURRENT_STATUS`.
///
/// Fields this side does not interpret are kept in `extra` so a saved
/// snapshot is a faithful copy of what the host sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub brightness: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_data: Option<Vec<ModuleDescriptor>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConfigSnapshot {
    /// Brightness as a whole number. Fractional and numeric-string values
    /// are rounded; anything else reads as unset.
    pub fn brightness_level(&self) -> Option<i64> {
        match self.brightness.as_ref()? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
            Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.round() as i64),
            _ => None,
        }
    }

    pub fn find_module(&self, identifier: &str) -> Option<&ModuleDescriptor> {
        self.module_data
            .as_deref()?
            .iter()
            .find(|m| m.identifier == identifier)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// JSON body returned by `/remote`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteResponse {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

impl RemoteResponse {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            reason: None,
            info: None,
        }
    }

    pub fn success_with_info(info: impl Into<String>) -> Self {
        Self {
            info: Some(info.into()),
            ..Self::success()
        }
    }

    pub fn failure(reason: &str, info: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            reason: Some(reason.to_string()),
            info: Some(info.into()),
        }
    }

    pub fn unknown_command(query_json: &str) -> Self {
        Self::failure("unknown_command", format!("original input: {query_json}"))
    }
}
