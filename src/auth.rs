//! Who a client is, and what it may do
//!
//! A client declares an authentication method during connection validation. The
//! resulting [`ClientAuthentication`] is then used by a [`ServerAuthorization`]
//! to decide whether a PV may be written.

use std::{fmt, net::IpAddr};

use tracing::{debug, warn};

use crate::{data::PvStructure, tls::TlsHandshakeInfo};

/// Authentication methods we offer to clients
pub const AUTH_ANONYMOUS: &str = "anonymous";
pub const AUTH_CA: &str = "ca";
pub const AUTH_X509: &str = "x509";

/// Identity of a connected client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAuthentication {
    /// Nothing known but the address the client connected from
    Anonymous { host: IpAddr },
    /// User and host as claimed by the client
    Ca { user: String, host: String },
    /// Identity from a TLS client certificate that we validated
    X509 { principal: String, host: String },
}

impl ClientAuthentication {
    pub fn anonymous(peer: IpAddr) -> Self {
        ClientAuthentication::Anonymous { host: peer }
    }

    /// Interpret the authentication a client picked during connection validation.
    ///
    /// "x509" only uses what the TLS handshake established; anything the client
    /// sent along with it is ignored. Unknown or incomplete declarations fall back
    /// to anonymous.
    pub fn decode(
        method: &str,
        data: Option<&PvStructure>,
        tls: Option<&TlsHandshakeInfo>,
        peer: IpAddr,
    ) -> Self {
        match method {
            AUTH_CA => {
                let user = data.and_then(|d| d.get("user")).and_then(|v| v.as_str());
                let host = data.and_then(|d| d.get("host")).and_then(|v| v.as_str());
                match (user, host) {
                    (Some(user), Some(host)) => ClientAuthentication::Ca {
                        user: user.to_string(),
                        host: host.to_string(),
                    },
                    _ => {
                        warn!("Client {peer} requested 'ca' authentication without user and host");
                        ClientAuthentication::anonymous(peer)
                    }
                }
            }
            AUTH_X509 => match tls.and_then(|t| t.principal.as_ref()) {
                Some(principal) => ClientAuthentication::X509 {
                    principal: principal.clone(),
                    host: tls
                        .and_then(|t| t.hostname.clone())
                        .unwrap_or_else(|| peer.to_string()),
                },
                None => {
                    warn!("Client {peer} requested 'x509' authentication without a client certificate");
                    ClientAuthentication::anonymous(peer)
                }
            },
            AUTH_ANONYMOUS => ClientAuthentication::anonymous(peer),
            other => {
                debug!("Client {peer} requested unknown authentication '{other}', using anonymous");
                ClientAuthentication::anonymous(peer)
            }
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, ClientAuthentication::Anonymous { .. })
    }

    pub fn method(&self) -> &'static str {
        match self {
            ClientAuthentication::Anonymous { .. } => AUTH_ANONYMOUS,
            ClientAuthentication::Ca { .. } => AUTH_CA,
            ClientAuthentication::X509 { .. } => AUTH_X509,
        }
    }

    /// User name, empty when anonymous
    pub fn user(&self) -> &str {
        match self {
            ClientAuthentication::Anonymous { .. } => "",
            ClientAuthentication::Ca { user, .. } => user,
            ClientAuthentication::X509 { principal, .. } => principal,
        }
    }

    pub fn host(&self) -> String {
        match self {
            ClientAuthentication::Anonymous { host } => host.to_string(),
            ClientAuthentication::Ca { host, .. } | ClientAuthentication::X509 { host, .. } => {
                host.clone()
            }
        }
    }
}

impl fmt::Display for ClientAuthentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientAuthentication::Anonymous { host } => write!(f, "anonymous({host})"),
            ClientAuthentication::Ca { user, host } => write!(f, "ca({user}@{host})"),
            ClientAuthentication::X509 { principal, host } => write!(f, "x509({principal}@{host})"),
        }
    }
}

/// Policy deciding which PVs are visible to, and writable by, which clients
pub trait ServerAuthorization: Send + Sync {
    /// Should a search for `channel` from `peer` be answered?
    fn has_read_access(&self, channel: &str, peer: IpAddr) -> bool {
        let _ = (channel, peer);
        true
    }

    /// May this client write to `channel`?
    fn has_write_access(&self, channel: &str, client: &ClientAuthentication) -> bool {
        let _ = channel;
        !client.is_anonymous()
    }
}

/// Answers every search, lets any authenticated client write
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAuthorization;

impl ServerAuthorization for DefaultAuthorization {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{PvValue, StructureBuilder};

    fn peer() -> IpAddr {
        "10.0.0.5".parse().unwrap()
    }

    #[test]
    fn decode_ca() {
        let identity = StructureBuilder::new("")
            .add("user", PvValue::String("fred".into()))
            .add("host", PvValue::String("ws1".into()))
            .build();
        let auth = ClientAuthentication::decode("ca", Some(&identity), None, peer());
        assert_eq!(
            auth,
            ClientAuthentication::Ca {
                user: "fred".into(),
                host: "ws1".into()
            }
        );
        assert_eq!(auth.to_string(), "ca(fred@ws1)");

        // Missing host
        let partial = StructureBuilder::new("")
            .add("user", PvValue::String("fred".into()))
            .build();
        assert!(ClientAuthentication::decode("ca", Some(&partial), None, peer()).is_anonymous());
    }

    #[test]
    fn x509_needs_handshake() {
        let claimed = StructureBuilder::new("")
            .add("user", PvValue::String("root".into()))
            .build();
        let auth = ClientAuthentication::decode("x509", Some(&claimed), None, peer());
        assert!(auth.is_anonymous());

        let tls = TlsHandshakeInfo {
            principal: Some("ioc-operator".into()),
            hostname: Some("opi1".into()),
            status_pv: None,
        };
        let auth = ClientAuthentication::decode("x509", Some(&claimed), Some(&tls), peer());
        assert_eq!(auth.user(), "ioc-operator");
        assert_eq!(auth.host(), "opi1");
    }

    #[test]
    fn default_policy() {
        let policy = DefaultAuthorization;
        assert!(policy.has_read_access("anything", peer()));
        assert!(!policy.has_write_access("pv", &ClientAuthentication::anonymous(peer())));
        assert!(policy.has_write_access(
            "pv",
            &ClientAuthentication::Ca {
                user: "u".into(),
                host: "h".into()
            }
        ));
        assert!(ClientAuthentication::decode("kerberos", None, None, peer()).is_anonymous());
    }
}
