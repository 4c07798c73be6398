use serde::{Deserialize, Serialize};

pub const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// A pending device authorization, as handed to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    #[serde(default)]
    pub verification_uri: String,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_interval() -> u64 {
    5
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePoll {
    Authorized { access_token: String },
    Pending,
    SlowDown,
    Expired,
    AccessDenied,
    Failed(String),
}

impl DevicePoll {
    /// The OAuth error code for unfinished polls, used as the user-facing message.
    pub fn reason(&self) -> Option<&str> {
        match self {
            DevicePoll::Authorized { .. } => None,
            DevicePoll::Pending => Some("authorization_pending"),
            DevicePoll::SlowDown => Some("slow_down"),
            DevicePoll::Expired => Some("expired_token"),
            DevicePoll::AccessDenied => Some("access_denied"),
            DevicePoll::Failed(reason) => Some(reason.as_str()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct AccessTokenResponse {
    #[serde(default)]
    pub(crate) access_token: Option<String>,
    #[serde(default)]
    pub(crate) error: Option<String>,
    #[serde(default)]
    pub(crate) error_description: Option<String>,
}

impl From<AccessTokenResponse> for DevicePoll {
    fn from(payload: AccessTokenResponse) -> Self {
        if let Some(token) = payload.access_token
            && !token.trim().is_empty()
        {
            return DevicePoll::Authorized {
                access_token: token,
            };
        }
        match payload.error.as_deref() {
            Some("authorization_pending") => DevicePoll::Pending,
            Some("slow_down") => DevicePoll::SlowDown,
            Some("expired_token") => DevicePoll::Expired,
            Some("access_denied") => DevicePoll::AccessDenied,
            Some(other) => DevicePoll::Failed(
                payload
                    .error_description
                    .filter(|d| !d.trim().is_empty())
                    .map(|d| format!("{other}: {d}"))
                    .unwrap_or_else(|| other.to_string()),
            ),
            None => DevicePoll::Failed("token null".to_string()),
        }
    }
}
