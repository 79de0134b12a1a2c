//! Data model for actions and authorization status

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// String-keyed mapping of dynamically typed values
pub type VariantMap = BTreeMap<String, serde_json::Value>;

/// Details handed to the policy backend to enrich authorization prompts
pub type DetailsMap = BTreeMap<AuthDetail, serde_json::Value>;

/// Authorization status of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Denied = 0,
    Error = 1,
    Invalid = 2,
    Authorized = 3,
    AuthRequired = 4,
    UserCancelled = 5,
}

impl AuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStatus::Denied => "denied",
            AuthStatus::Error => "error",
            AuthStatus::Invalid => "invalid",
            AuthStatus::Authorized => "authorized",
            AuthStatus::AuthRequired => "auth_required",
            AuthStatus::UserCancelled => "user_cancelled",
        }
    }
}

impl std::str::FromStr for AuthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "denied" => Ok(AuthStatus::Denied),
            "error" => Ok(AuthStatus::Error),
            "invalid" => Ok(AuthStatus::Invalid),
            "authorized" => Ok(AuthStatus::Authorized),
            "auth_required" => Ok(AuthStatus::AuthRequired),
            "user_cancelled" => Ok(AuthStatus::UserCancelled),
            _ => Err(format!("Invalid auth status: {}", s)),
        }
    }
}

impl std::fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an execute job should do with its action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Authorize and run the helper
    Execute = 0,
    /// Only find out whether the action would be authorized
    AuthorizeOnly = 1,
}

impl ExecutionMode {
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(ExecutionMode::Execute),
            1 => Some(ExecutionMode::AuthorizeOnly),
            _ => None,
        }
    }
}

/// Keys of the details mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthDetail {
    Other = 0,
    Message = 1,
}

fn action_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z]+(\.[a-z]+)*$").expect("action name regex"))
}

/// Used when the backend cannot check existence itself
pub fn is_valid_action_name(name: &str) -> bool {
    action_name_regex().is_match(name)
}

/// A named privileged operation
///
/// Actions are plain values: cloning is cheap enough and two actions are
/// equal when their names are. Use [`crate::Broker::action`] to create one
/// bound to a policy backend so the backend can prepare its status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    name: String,
    helper_id: String,
    details: DetailsMap,
    arguments: VariantMap,
    timeout: i32,
    parent_window: Option<u64>,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            helper_id: String::new(),
            details: DetailsMap::new(),
            arguments: VariantMap::new(),
            timeout: -1,
            parent_window: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn helper_id(&self) -> &str {
        &self.helper_id
    }

    pub fn has_helper(&self) -> bool {
        !self.helper_id.is_empty()
    }

    pub fn set_helper_id(&mut self, helper_id: impl Into<String>) {
        self.helper_id = helper_id.into();
    }

    pub fn with_helper_id(mut self, helper_id: impl Into<String>) -> Self {
        self.set_helper_id(helper_id);
        self
    }

    pub fn details(&self) -> &DetailsMap {
        &self.details
    }

    pub fn set_details(&mut self, details: DetailsMap) {
        self.details = details;
    }

    pub fn with_detail(mut self, key: AuthDetail, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key, value.into());
        self
    }

    pub fn arguments(&self) -> &VariantMap {
        &self.arguments
    }

    pub fn set_arguments(&mut self, arguments: VariantMap) {
        self.arguments = arguments;
    }

    pub fn add_argument(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.arguments.insert(key.into(), value.into());
    }

    pub fn with_argument(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.add_argument(key, value);
        self
    }

    /// Milliseconds, -1 means the transport default
    pub fn timeout(&self) -> i32 {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: i32) {
        self.timeout = timeout;
    }

    pub fn parent_window(&self) -> Option<u64> {
        self.parent_window
    }

    pub fn set_parent_window(&mut self, parent_window: Option<u64>) {
        self.parent_window = parent_window;
    }
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Action {}
