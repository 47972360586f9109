//! NAT-traversal helper servers.
//!
//! The provider table is static; [`ranked_ice_servers`] is a pure function
//! of the table and an optional user override.

use serde::{Deserialize, Serialize};

/// Helper server class
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HelperClass {
    /// Address discovery (STUN)
    Discovery,
    /// Traffic relaying (TURN)
    Relay,
}

/// Helper server provider entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperProvider {
    /// Provider name
    pub name: &'static str,
    /// Server URLs
    pub urls: Vec<String>,
    /// Username for relay servers
    pub username: Option<String>,
    /// Credential for relay servers
    pub credential: Option<String>,
    /// Lower values rank first within a class
    pub priority: u32,
}

impl HelperProvider {
    fn stun(name: &'static str, urls: &[&str], priority: u32) -> Self {
        Self {
            name,
            urls: urls.iter().map(|u| (*u).to_string()).collect(),
            username: None,
            credential: None,
            priority,
        }
    }

    fn turn(name: &'static str, urls: &[&str], user: &str, credential: &str, priority: u32) -> Self {
        Self {
            username: Some(user.to_string()),
            credential: Some(credential.to_string()),
            ..Self::stun(name, urls, priority)
        }
    }

    /// Class derived from the URL schemes
    ///
    /// A provider is discovery-class only if every URL is `stun:`/`stuns:`.
    #[must_use]
    pub fn class(&self) -> HelperClass {
        if self
            .urls
            .iter()
            .all(|u| u.starts_with("stun:") || u.starts_with("stuns:"))
        {
            HelperClass::Discovery
        } else {
            HelperClass::Relay
        }
    }
}

/// ICE server as handed to the negotiation primitive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs
    pub urls: Vec<String>,
    /// Username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl From<&HelperProvider> for IceServer {
    fn from(p: &HelperProvider) -> Self {
        Self {
            urls: p.urls.clone(),
            username: p.username.clone(),
            credential: p.credential.clone(),
        }
    }
}

/// ICE transport policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IcePolicy {
    /// Any candidate type
    #[default]
    All,
    /// Relay candidates only
    RelayOnly,
}

/// Complete ICE configuration for one negotiation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceConfig {
    /// Ranked helper servers
    pub servers: Vec<IceServer>,
    /// Transport policy
    pub policy: IcePolicy,
    /// Candidates gathered ahead of negotiation
    pub candidate_pool_size: u8,
}

/// Built-in provider table
#[must_use]
pub fn default_providers() -> Vec<HelperProvider> {
    vec![
        HelperProvider::turn(
            "metered-openrelay",
            &[
                "turns:openrelay.metered.ca:443?transport=tcp",
                "turn:openrelay.metered.ca:443?transport=tcp",
                "turn:openrelay.metered.ca:80?transport=tcp",
            ],
            "openrelayproject",
            "openrelayproject",
            10,
        ),
        HelperProvider::stun("twilio", &["stun:global.stun.twilio.com:3478"], 10),
        HelperProvider::turn(
            "viagenie",
            &[
                "turn:numb.viagenie.ca:3478?transport=tcp",
                "turn:numb.viagenie.ca:80?transport=tcp",
                "turn:numb.viagenie.ca:443?transport=tcp",
            ],
            "webrtc@live.com",
            "muazkh",
            20,
        ),
        HelperProvider::turn(
            "stuninator",
            &["turn:turn.stuninator.com:3478"],
            "test",
            "test",
            30,
        ),
        HelperProvider::turn(
            "tempturn",
            &[
                "turn:tempTURN.org:3478?transport=tcp",
                "turn:tempTURN.org:443?transport=tcp",
            ],
            "tempturn",
            "tempturn",
            40,
        ),
        HelperProvider::turn(
            "meetrix",
            &[
                "turn:meetrix.com:443?transport=tcp",
                "turn:meetrix.com:3478?transport=tcp",
            ],
            "meetrix",
            "meetrix",
            45,
        ),
        HelperProvider::turn(
            "metered-fallback",
            &["turn:relay.metered.ca:80"],
            "free",
            "free",
            50,
        ),
        HelperProvider::stun(
            "google",
            &[
                "stun:stun.l.google.com:19302",
                "stun:stun1.l.google.com:19302",
                "stun:stun2.l.google.com:19302",
                "stun:stun3.l.google.com:19302",
                "stun:stun4.l.google.com:19302",
            ],
            100,
        ),
        HelperProvider::stun("cloudflare", &["stun:stun.cloudflare.com:3478"], 101),
        HelperProvider::stun("syncthing", &["stun:stun.syncthing.net:3478"], 102),
        HelperProvider::stun("ideasip", &["stun:stun.ideasip.com:3478"], 103),
    ]
}

/// Rank helper servers
///
/// Discovery-class servers come first, then relay-class providers by
/// ascending priority, then `custom` if given. Ties keep table order.
#[must_use]
pub fn ranked_ice_servers(providers: &[HelperProvider], custom: Option<&IceServer>) -> Vec<IceServer> {
    let mut ranked: Vec<&HelperProvider> = providers.iter().collect();
    ranked.sort_by_key(|p| (p.class(), p.priority));

    ranked
        .into_iter()
        .map(IceServer::from)
        .chain(custom.cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_class() {
        let providers = default_providers();
        let twilio = providers.iter().find(|p| p.name == "twilio").unwrap();
        let viagenie = providers.iter().find(|p| p.name == "viagenie").unwrap();

        assert_eq!(twilio.class(), HelperClass::Discovery);
        assert_eq!(viagenie.class(), HelperClass::Relay);
    }

    #[test]
    fn test_discovery_first_then_relay_by_priority() {
        let servers = ranked_ice_servers(&default_providers(), None);

        let first_relay = servers
            .iter()
            .position(|s| !s.urls[0].starts_with("stun:"))
            .unwrap();
        assert!(servers[..first_relay].iter().all(|s| s.urls[0].starts_with("stun:")));
        assert!(servers[first_relay..].iter().all(|s| s.username.is_some()));

        assert_eq!(servers[0].urls[0], "stun:global.stun.twilio.com:3478");
        assert_eq!(servers[1].urls[0], "stun:stun.l.google.com:19302");
        assert_eq!(
            servers[first_relay].urls[0],
            "turns:openrelay.metered.ca:443?transport=tcp"
        );
        assert_eq!(servers.last().unwrap().urls[0], "turn:relay.metered.ca:80");
    }

    #[test]
    fn test_custom_override_appended() {
        let custom = IceServer {
            urls: vec!["turn:turn.example.org:3478".to_string()],
            username: Some("me".to_string()),
            credential: Some("secret".to_string()),
        };
        let servers = ranked_ice_servers(&default_providers(), Some(&custom));

        assert_eq!(servers.len(), default_providers().len() + 1);
        assert_eq!(servers.last(), Some(&custom));
    }

    #[test]
    fn test_ranking_is_pure() {
        let providers = default_providers();
        assert_eq!(
            ranked_ice_servers(&providers, None),
            ranked_ice_servers(&providers, None)
        );
        assert!(ranked_ice_servers(&[], None).is_empty());
    }

    #[test]
    fn test_ice_server_json_shape() {
        let stun = IceServer {
            urls: vec!["stun:stun.cloudflare.com:3478".to_string()],
            username: None,
            credential: None,
        };
        assert_eq!(
            serde_json::to_string(&stun).unwrap(),
            r#"{"urls":["stun:stun.cloudflare.com:3478"]}"#
        );
        assert_eq!(
            serde_json::to_string(&IcePolicy::RelayOnly).unwrap(),
            r#""relay-only""#
        );
    }
}
