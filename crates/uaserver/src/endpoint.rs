//! The endpoint registry: one published URL bound to a security policy and a
//! message security mode.

use std::{fmt, str::FromStr, sync::Arc};

use common::{EndpointError, MessageSecurityMode};
use tracing::info;

use crate::crypto::SecurityPolicyInstance;

/// Port used when an `opc.tcp` URL does not name one.
pub const DEFAULT_PORT: u16 = 4840;

const SCHEME: &str = "opc.tcp://";

/// What a security policy can do, as far as binding it to an endpoint cares.
#[cfg_attr(test, mockall::automock)]
pub trait PolicyCapabilities {
    fn policy_uri(&self) -> &'static str;
    fn supports_signing(&self) -> bool;
    fn supports_encryption(&self) -> bool;
}

impl PolicyCapabilities for SecurityPolicyInstance {
    fn policy_uri(&self) -> &'static str {
        self.uri()
    }

    fn supports_signing(&self) -> bool {
        true
    }

    fn supports_encryption(&self) -> bool {
        true
    }
}

/// A parsed `opc.tcp://host[:port][/path]` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUrl {
    host: String,
    port: u16,
    path: String,
}

impl EndpointUrl {
    /// Host name or address, without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path after the authority, `""` when absent.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Same host (case-insensitive), port and path.
    pub fn matches(&self, other: &EndpointUrl) -> bool {
        self.host.eq_ignore_ascii_case(&other.host)
            && self.port == other.port
            && self.path == other.path
    }
}

impl FromStr for EndpointUrl {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| EndpointError::InvalidConfiguration(format!("endpoint url {s:?}: {reason}"));

        let rest = match s.get(..SCHEME.len()) {
            Some(scheme) if scheme.eq_ignore_ascii_case(SCHEME) => &s[SCHEME.len()..],
            _ => return Err(invalid("scheme must be opc.tcp")),
        };
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], rest[i..].trim_end_matches('/')),
            None => (rest, ""),
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let end = bracketed.find(']').ok_or_else(|| invalid("unterminated IPv6 address"))?;
            let after = &bracketed[end + 1..];
            let port = match after {
                "" => None,
                p => Some(p.strip_prefix(':').ok_or_else(|| invalid("junk after IPv6 address"))?),
            };
            (&bracketed[..end], port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            None => DEFAULT_PORT,
            Some(p) => match p.parse::<u16>() {
                Ok(0) | Err(_) => return Err(invalid("port must be 1-65535")),
                Ok(port) => port,
            },
        };

        Ok(Self {
            host: host.to_owned(),
            port,
            path: path.to_owned(),
        })
    }
}

impl fmt::Display for EndpointUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{SCHEME}[{}]:{}{}", self.host, self.port, self.path)
        } else {
            write!(f, "{SCHEME}{}:{}{}", self.host, self.port, self.path)
        }
    }
}

/// A published endpoint. The `Arc` keeps the policy alive for as long as the
/// endpoint (or any connection holding a clone) exists.
#[derive(Debug)]
pub struct Endpoint<P = SecurityPolicyInstance> {
    url: EndpointUrl,
    policy: Arc<P>,
    security_mode: MessageSecurityMode,
}

impl<P> Endpoint<P> {
    pub fn url(&self) -> &EndpointUrl {
        &self.url
    }

    pub fn policy(&self) -> &Arc<P> {
        &self.policy
    }

    pub fn security_mode(&self) -> MessageSecurityMode {
        self.security_mode
    }
}

impl<P> Clone for Endpoint<P> {
    fn clone(&self) -> Self {
        Self {
            url: self.url.clone(),
            policy: Arc::clone(&self.policy),
            security_mode: self.security_mode,
        }
    }
}

/// Holds at most one [`Endpoint`].
#[derive(Debug)]
pub struct EndpointRegistry<P = SecurityPolicyInstance> {
    endpoint: Option<Endpoint<P>>,
}

impl<P> Default for EndpointRegistry<P> {
    fn default() -> Self {
        Self { endpoint: None }
    }
}

impl<P: PolicyCapabilities> EndpointRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `url`, check `mode` against the policy's capabilities and
    /// publish the endpoint in one step. A failed call leaves the registry
    /// unchanged.
    ///
    /// # Errors
    ///
    /// - [`EndpointError::InvalidConfiguration`] if `url` is not
    ///   `opc.tcp://host[:port]`.
    /// - [`EndpointError::Conflict`] if an endpoint is already registered,
    ///   whether or not its URL is the same.
    /// - [`EndpointError::UnsupportedMode`] if `mode` needs signing or
    ///   encryption the policy lacks.
    pub fn add_endpoint(
        &mut self,
        url: &str,
        policy: Arc<P>,
        mode: MessageSecurityMode,
    ) -> Result<&Endpoint<P>, EndpointError> {
        let url: EndpointUrl = url.parse()?;

        if let Some(existing) = &self.endpoint {
            let reason = if existing.url.matches(&url) {
                format!("{url} is already registered")
            } else {
                format!("cannot add {url}: {} is already registered", existing.url)
            };
            return Err(EndpointError::Conflict(reason));
        }

        let capable = (!mode.requires_signing() || policy.supports_signing())
            && (!mode.requires_encryption() || policy.supports_encryption());
        if !capable {
            return Err(EndpointError::UnsupportedMode {
                mode,
                policy: policy.policy_uri().to_owned(),
            });
        }

        info!(url = %url, policy = policy.policy_uri(), mode = %mode, "endpoint registered");
        Ok(self.endpoint.insert(Endpoint {
            url,
            policy,
            security_mode: mode,
        }))
    }

    /// The endpoint registered under `url`, if any.
    pub fn find(&self, url: &str) -> Option<&Endpoint<P>> {
        let url: EndpointUrl = url.parse().ok()?;
        self.endpoint.as_ref().filter(|e| e.url.matches(&url))
    }
}

impl<P> EndpointRegistry<P> {
    /// The single registered endpoint.
    pub fn endpoint(&self) -> Option<&Endpoint<P>> {
        self.endpoint.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoint.is_none()
    }

    /// Drop the endpoint and with it this registry's reference to the policy.
    pub fn clear(&mut self) {
        self.endpoint = None;
    }
}
