//! VM environment handed to the cloud driver.
//!
//! The env is a free-form JSON object. Agent settings live under the `agent`
//! key; this module only ever touches `agent.password` and `agent.credentials`.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::Credentials;

const AGENT_KEY: &str = "agent";
const PASSWORD_KEY: &str = "password";
const CREDENTIALS_KEY: &str = "credentials";

const PASSWORD_BYTES: usize = 32;

/// An owned VM environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmEnv(Map<String, Value>);

impl VmEnv {
    /// Wrap an env object.
    #[must_use]
    pub const fn new(env: Map<String, Value>) -> Self {
        Self(env)
    }

    /// Deep-merge `overrides` onto `defaults`. Objects merge recursively; any
    /// other value in `overrides` replaces the default outright.
    #[must_use]
    pub fn merged(defaults: &Map<String, Value>, overrides: &Map<String, Value>) -> Self {
        let mut env = defaults.clone();
        deep_merge(&mut env, overrides);
        Self(env)
    }

    /// The agent password, if set and non-empty.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.agent()
            .and_then(|agent| agent.get(PASSWORD_KEY))
            .and_then(Value::as_str)
            .filter(|password| !password.is_empty())
    }

    /// Set the agent password.
    pub fn set_password(&mut self, password: impl Into<String>) {
        let password = Value::String(password.into());
        self.update_agent(|agent| {
            agent.insert(PASSWORD_KEY.to_owned(), password);
        });
    }

    /// Credentials attached to the env, if any.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        self.agent()
            .and_then(|agent| agent.get(CREDENTIALS_KEY))
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Attach agent credentials.
    pub fn set_credentials(&mut self, credentials: &Credentials) {
        let value = serde_json::json!({
            "crypt_key": credentials.crypt_key,
            "sign_key": credentials.sign_key,
        });
        self.update_agent(|agent| {
            agent.insert(CREDENTIALS_KEY.to_owned(), value);
        });
    }

    /// Whether the env has an `agent` section.
    #[must_use]
    pub fn has_agent_section(&self) -> bool {
        self.0.contains_key(AGENT_KEY)
    }

    /// The env as a JSON object.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consume into a JSON object.
    #[must_use]
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    fn agent(&self) -> Option<&Map<String, Value>> {
        self.0.get(AGENT_KEY).and_then(Value::as_object)
    }

    /// Edit the `agent` section. A non-object section is replaced with a new object.
    fn update_agent(&mut self, f: impl FnOnce(&mut Map<String, Value>)) {
        let slot = self
            .0
            .entry(AGENT_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(agent) = slot {
            f(agent);
        } else {
            let mut agent = Map::new();
            f(&mut agent);
            *slot = Value::Object(agent);
        }
    }
}

/// Generate a random agent password.
#[must_use]
pub fn generate_password() -> String {
    let mut bytes = [0u8; PASSWORD_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn deep_merge(target: &mut Map<String, Value>, overrides: &Map<String, Value>) {
    for (key, value) in overrides {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
