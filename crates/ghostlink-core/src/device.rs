//! Device classification.
//!
//! Handheld clients get longer timeouts, shorter heartbeats, relay
//! reconnects, and are routed straight to the managed strategy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Environment variable forcing the device class
pub const DEVICE_ENV: &str = "GHOSTLINK_DEVICE";

/// User-agent tokens identifying handheld clients
const HANDHELD_TOKENS: &[&str] = &[
    "android",
    "webos",
    "iphone",
    "ipad",
    "ipod",
    "blackberry",
    "iemobile",
    "opera mini",
];

/// Local client class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Phone or tablet on a possibly cellular network
    Handheld,
    /// Everything else
    Desktop,
}

impl DeviceClass {
    /// Classify from environment signals
    ///
    /// Precedence: explicit override, then target OS, then user agent.
    #[must_use]
    pub fn classify(signals: &EnvironmentSignals) -> Self {
        if let Some(class) = signals.override_class {
            return class;
        }
        if signals.handheld_os {
            return Self::Handheld;
        }
        match &signals.user_agent {
            Some(ua) if is_handheld_agent(ua) => Self::Handheld,
            _ => Self::Desktop,
        }
    }

    /// Whether this is a handheld client
    #[must_use]
    pub fn is_handheld(self) -> bool {
        self == Self::Handheld
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handheld => write!(f, "handheld"),
            Self::Desktop => write!(f, "desktop"),
        }
    }
}

impl FromStr for DeviceClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "handheld" | "mobile" => Ok(Self::Handheld),
            "desktop" => Ok(Self::Desktop),
            other => Err(format!("unknown device class: {other}")),
        }
    }
}

/// Inputs to device classification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSignals {
    /// Forced class
    pub override_class: Option<DeviceClass>,
    /// Built for a handheld OS
    pub handheld_os: bool,
    /// Client user-agent string, if any
    pub user_agent: Option<String>,
}

impl EnvironmentSignals {
    /// Gather signals from the process environment
    ///
    /// Reads [`DEVICE_ENV`]; unparseable values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let override_class = std::env::var(DEVICE_ENV).ok().and_then(|v| match v.parse() {
            Ok(class) => Some(class),
            Err(e) => {
                tracing::warn!("Ignoring {DEVICE_ENV}: {e}");
                None
            }
        });

        Self {
            override_class,
            handheld_os: cfg!(any(target_os = "android", target_os = "ios")),
            user_agent: None,
        }
    }

    /// Set the user agent
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Case-insensitive handheld user-agent match
#[must_use]
pub fn is_handheld_agent(user_agent: &str) -> bool {
    let ua = user_agent.to_ascii_lowercase();
    HANDHELD_TOKENS.iter().any(|token| ua.contains(token))
}
