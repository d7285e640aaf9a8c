use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;
use url::{Host, Url};

pub const DEFAULT_PRIMARY_DOMAIN: &str = "themag.dev";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OriginConfigError {
    #[error("invalid allowed origin '{0}': expected scheme://host[:port]")]
    InvalidOrigin(String),
    #[error("invalid primary domain '{0}'")]
    InvalidDomain(String),
}

/// Why a handshake was let through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OriginRule {
    AllowList,
    Loopback,
    PrimaryDomain,
}

/// Why a handshake was turned away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenyReason {
    Missing,
    Malformed,
    NotAllowed,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::Missing => "missing",
            DenyReason::Malformed => "malformed",
            DenyReason::NotAllowed => "not_allowed",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OriginDecision {
    Allowed(OriginRule),
    Denied(DenyReason),
}

impl OriginDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, OriginDecision::Allowed(_))
    }
}

/// Handshake authorization by declared page origin.
///
/// Accepts an origin when it is on the explicit allow-list, points at a
/// loopback host, or whose hostname is the primary domain or one of its
/// subdomains. Scheme (http or https) and port are not restricted.
#[derive(Clone, Debug)]
pub struct OriginPolicy {
    allowed: BTreeSet<String>,
    primary_domain: Option<String>,
}

impl Default for OriginPolicy {
    fn default() -> Self {
        Self {
            allowed: BTreeSet::new(),
            primary_domain: Some(DEFAULT_PRIMARY_DOMAIN.to_string()),
        }
    }
}

impl OriginPolicy {
    pub fn new<I, S>(primary_domain: Option<&str>, allowed: I) -> Result<Self, OriginConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let primary_domain = match primary_domain.map(str::trim) {
            None | Some("") => None,
            Some(domain) => Some(normalize_domain(domain)?),
        };

        let mut set = BTreeSet::new();
        for raw in allowed {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            let url = parse_origin(raw)
                .ok_or_else(|| OriginConfigError::InvalidOrigin(raw.to_string()))?;
            set.insert(url.origin().ascii_serialization());
        }

        Ok(Self {
            allowed: set,
            primary_domain,
        })
    }

    pub fn primary_domain(&self) -> Option<&str> {
        self.primary_domain.as_deref()
    }

    pub fn allowed_origins(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }

    pub fn authorize(&self, origin: Option<&str>) -> bool {
        self.evaluate(origin).is_allowed()
    }

    pub fn evaluate(&self, origin: Option<&str>) -> OriginDecision {
        let raw = match origin.map(str::trim) {
            None | Some("") => return OriginDecision::Denied(DenyReason::Missing),
            Some(raw) => raw,
        };
        let Some(url) = parse_origin(raw) else {
            return OriginDecision::Denied(DenyReason::Malformed);
        };

        if self.allowed.contains(&url.origin().ascii_serialization()) {
            return OriginDecision::Allowed(OriginRule::AllowList);
        }
        if is_loopback(&url) {
            return OriginDecision::Allowed(OriginRule::Loopback);
        }
        if self.matches_primary_domain(&url) {
            return OriginDecision::Allowed(OriginRule::PrimaryDomain);
        }
        OriginDecision::Denied(DenyReason::NotAllowed)
    }

    fn matches_primary_domain(&self, url: &Url) -> bool {
        let Some(domain) = self.primary_domain.as_deref() else {
            return false;
        };
        match url.host() {
            Some(Host::Domain(host)) => {
                host == domain
                    || host
                        .strip_suffix(domain)
                        .is_some_and(|prefix| prefix.len() > 1 && prefix.ends_with('.'))
            }
            _ => false,
        }
    }
}

/// Parses a serialized origin. Paths, queries, fragments and credentials are
/// never part of an origin a browser sends, so their presence is malformed.
fn parse_origin(raw: &str) -> Option<Url> {
    let url = Url::parse(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    if url.host().is_none()
        || !matches!(url.path(), "" | "/")
        || url.query().is_some()
        || url.fragment().is_some()
        || !url.username().is_empty()
        || url.password().is_some()
    {
        return None;
    }
    Some(url)
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(host)) => host.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}

fn normalize_domain(raw: &str) -> Result<String, OriginConfigError> {
    let candidate = raw.trim_start_matches("*.").trim_end_matches('.');
    match Host::parse(candidate) {
        Ok(Host::Domain(domain)) if !domain.is_empty() => Ok(domain),
        _ => Err(OriginConfigError::InvalidDomain(raw.to_string())),
    }
}
