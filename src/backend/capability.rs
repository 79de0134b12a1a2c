//! Capability model for policy backends
//!
//! A backend advertises which parts of the authorization protocol it
//! implements. The execute job never tests flags directly; it asks for the
//! [`AuthorizationStrategy`] the capabilities imply.

use serde::{Deserialize, Serialize};

/// Capabilities a policy backend can advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Authorization can be obtained in the client process
    AuthorizeFromClient,
    /// Authorization is decided inside the helper process
    AuthorizeFromHelper,
    /// The backend can tell whether an action is known
    CheckActionExistence,
    /// The backend wants a chance to prepare its prompt before authorizing
    PreAuthAction,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::AuthorizeFromClient => "authorize_from_client",
            Capability::AuthorizeFromHelper => "authorize_from_helper",
            Capability::CheckActionExistence => "check_action_existence",
            Capability::PreAuthAction => "pre_auth_action",
        }
    }

    pub fn bit(&self) -> u32 {
        match self {
            Capability::AuthorizeFromClient => 1,
            Capability::AuthorizeFromHelper => 2,
            Capability::CheckActionExistence => 4,
            Capability::PreAuthAction => 8,
        }
    }

    pub fn all() -> [Capability; 4] {
        [
            Capability::AuthorizeFromClient,
            Capability::AuthorizeFromHelper,
            Capability::CheckActionExistence,
            Capability::PreAuthAction,
        ]
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authorize_from_client" => Ok(Capability::AuthorizeFromClient),
            "authorize_from_helper" => Ok(Capability::AuthorizeFromHelper),
            "check_action_existence" => Ok(Capability::CheckActionExistence),
            "pre_auth_action" => Ok(Capability::PreAuthAction),
            _ => Err(format!("Invalid capability: {}", s)),
        }
    }
}

/// How an execute job obtains authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStrategy {
    /// Ask the backend in the client process, then run the helper
    FromClient { pre_auth: bool },
    /// Send the request to the helper, which asks the backend itself
    FromHelper { pre_auth: bool },
    /// The backend cannot authorize anything
    Unspecified,
}

/// A set of capabilities, stored as the bit pattern backends exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Capability>", into = "Vec<Capability>")]
pub struct Capabilities {
    bits: u32,
}

impl Capabilities {
    /// Create a new empty capability set
    pub fn new() -> Self {
        Self { bits: 0 }
    }

    /// Unknown bits are dropped
    pub fn from_bits(bits: u32) -> Self {
        let known = Capability::all().iter().fold(0, |acc, c| acc | c.bit());
        Self { bits: bits & known }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.bits & cap.bit() != 0
    }

    pub fn add(&mut self, cap: Capability) {
        self.bits |= cap.bit();
    }

    pub fn remove(&mut self, cap: Capability) {
        self.bits &= !cap.bit();
    }

    pub fn with(mut self, cap: Capability) -> Self {
        self.add(cap);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn to_vec(&self) -> Vec<Capability> {
        Capability::all()
            .into_iter()
            .filter(|c| self.has(*c))
            .collect()
    }

    /// Client-side authorization takes precedence when both are advertised
    pub fn strategy(&self) -> AuthorizationStrategy {
        let pre_auth = self.has(Capability::PreAuthAction);
        if self.has(Capability::AuthorizeFromClient) {
            AuthorizationStrategy::FromClient { pre_auth }
        } else if self.has(Capability::AuthorizeFromHelper) {
            AuthorizationStrategy::FromHelper { pre_auth }
        } else {
            AuthorizationStrategy::Unspecified
        }
    }
}

impl From<Vec<Capability>> for Capabilities {
    fn from(capabilities: Vec<Capability>) -> Self {
        capabilities
            .into_iter()
            .fold(Capabilities::new(), |set, cap| set.with(cap))
    }
}

impl From<Capabilities> for Vec<Capability> {
    fn from(set: Capabilities) -> Self {
        set.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_bits() {
        assert_eq!(Capability::AuthorizeFromClient.bit(), 1);
        assert_eq!(Capability::AuthorizeFromHelper.bit(), 2);
        assert_eq!(Capability::CheckActionExistence.bit(), 4);
        assert_eq!(Capability::PreAuthAction.bit(), 8);
    }

    #[test]
    fn test_capability_from_str() {
        assert_eq!(
            "authorize_from_helper".parse::<Capability>().unwrap(),
            Capability::AuthorizeFromHelper
        );
        assert_eq!(
            "pre_auth_action".parse::<Capability>().unwrap(),
            Capability::PreAuthAction
        );
        assert!("root".parse::<Capability>().is_err());
    }

    #[test]
    fn test_capabilities_basic_operations() {
        let mut caps = Capabilities::new();
        assert!(caps.is_empty());

        caps.add(Capability::CheckActionExistence);
        assert!(caps.has(Capability::CheckActionExistence));
        assert!(!caps.has(Capability::AuthorizeFromClient));
        assert_eq!(caps.bits(), 4);

        caps.remove(Capability::CheckActionExistence);
        assert!(caps.is_empty());
    }

    #[test]
    fn test_from_bits_drops_unknown() {
        let caps = Capabilities::from_bits(0xFF);
        assert_eq!(caps.bits(), 0x0F);
        assert_eq!(caps.to_vec().len(), 4);
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(
            Capabilities::new().strategy(),
            AuthorizationStrategy::Unspecified
        );
        assert_eq!(
            Capabilities::new()
                .with(Capability::CheckActionExistence)
                .strategy(),
            AuthorizationStrategy::Unspecified
        );
        assert_eq!(
            Capabilities::new()
                .with(Capability::AuthorizeFromHelper)
                .with(Capability::PreAuthAction)
                .strategy(),
            AuthorizationStrategy::FromHelper { pre_auth: true }
        );
        assert_eq!(
            Capabilities::new()
                .with(Capability::AuthorizeFromHelper)
                .with(Capability::AuthorizeFromClient)
                .strategy(),
            AuthorizationStrategy::FromClient { pre_auth: false }
        );
    }

    #[test]
    fn test_capabilities_serialization() {
        let caps: Capabilities = vec![
            Capability::AuthorizeFromHelper,
            Capability::CheckActionExistence,
        ]
        .into();
        let json = serde_json::to_string(&caps).unwrap();
        assert_eq!(json, "[\"authorize_from_helper\",\"check_action_existence\"]");

        let back: Capabilities = serde_json::from_str(&json).unwrap();
        assert_eq!(back, caps);
    }
}
