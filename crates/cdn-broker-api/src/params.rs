//! Strict parsing of provision and update parameters

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use cdn_broker_control::{CreateRoute, UpdateRoute};

/// CloudFront caps whitelisted headers per cache behavior
pub const MAX_FORWARDED_HEADERS: usize = 10;

const HOST_HEADER: &str = "Host";
const WILDCARD_HEADER: &str = "*";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamsError {
    #[error("invalid parameters: {0}")]
    Malformed(String),

    #[error("must pass non-empty `domain`")]
    MissingDomain,

    #[error("invalid domain {0:?}")]
    InvalidDomain(String),

    #[error("must not pass `insecure_origin`; origins are always fetched over https")]
    InsecureOrigin,

    #[error("`default_ttl` must not be negative")]
    NegativeTtl,

    #[error("invalid header name {0:?}")]
    InvalidHeader(String),

    #[error("wildcard header `*` must be the only entry")]
    WildcardNotAlone,

    #[error("must not pass more than {MAX_FORWARDED_HEADERS} headers, got {0}")]
    TooManyHeaders(usize),
}

/// Parameters accepted on provision and update
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteParams {
    /// Comma separated domains; the first is the certificate common name
    pub domain: Option<String>,
    pub origin: Option<String>,
    pub default_ttl: Option<i64>,
    pub headers: Option<Vec<String>>,
    pub forward_cookies: Option<bool>,
    pub insecure_origin: Option<bool>,
}

/// Broker-wide defaults for omitted parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDefaults {
    pub origin: String,
    pub default_ttl: i64,
}

impl RouteParams {
    /// Absent or `null` parameters parse as all-`None`
    pub fn parse(raw: Option<&Value>) -> Result<Self, ParamsError> {
        let params = match raw {
            None | Some(Value::Null) => Self::default(),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|err| ParamsError::Malformed(err.to_string()))?,
        };

        if params.insecure_origin == Some(true) {
            return Err(ParamsError::InsecureOrigin);
        }
        if matches!(params.default_ttl, Some(ttl) if ttl < 0) {
            return Err(ParamsError::NegativeTtl);
        }

        Ok(params)
    }

    pub fn into_create(
        self,
        instance_id: &str,
        defaults: &RouteDefaults,
    ) -> Result<CreateRoute, ParamsError> {
        let domains = parse_domains(self.domain.as_deref().unwrap_or_default())?;
        let origin = self
            .origin
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .unwrap_or_else(|| defaults.origin.clone());

        Ok(CreateRoute {
            instance_id: instance_id.to_string(),
            domains,
            origin,
            default_ttl: self.default_ttl.unwrap_or(defaults.default_ttl),
            forwarded_headers: normalize_headers(self.headers.as_deref().unwrap_or_default())?,
            forward_cookies: self.forward_cookies.unwrap_or(true),
            tags: Default::default(),
        })
    }

    pub fn into_update(self) -> Result<UpdateRoute, ParamsError> {
        let domains = match self.domain.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(csv) => Some(parse_domains(csv)?),
        };

        Ok(UpdateRoute {
            domains,
            origin: self
                .origin
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty()),
            default_ttl: self.default_ttl,
            forwarded_headers: self
                .headers
                .as_deref()
                .map(normalize_headers)
                .transpose()?,
            forward_cookies: self.forward_cookies,
        })
    }
}

/// Split, trim and lowercase a domain list, dropping duplicates in order
pub fn parse_domains(csv: &str) -> Result<Vec<String>, ParamsError> {
    if csv.trim().is_empty() {
        return Err(ParamsError::MissingDomain);
    }

    let mut domains: Vec<String> = Vec::new();
    for entry in csv.split(',') {
        let domain = entry.trim().to_lowercase();
        if domain.is_empty()
            || domain.contains(char::is_whitespace)
            || domain.starts_with('.')
            || domain.ends_with('.')
        {
            return Err(ParamsError::InvalidDomain(entry.trim().to_string()));
        }
        if !domains.contains(&domain) {
            domains.push(domain);
        }
    }

    Ok(domains)
}

/// Canonicalize forwarded headers; `Host` is always forwarded unless wildcarded
pub fn normalize_headers(headers: &[String]) -> Result<Vec<String>, ParamsError> {
    if headers.iter().any(|h| h.trim() == WILDCARD_HEADER) {
        if headers.len() > 1 {
            return Err(ParamsError::WildcardNotAlone);
        }
        return Ok(vec![WILDCARD_HEADER.to_string()]);
    }

    let mut normalized: Vec<String> = Vec::with_capacity(headers.len() + 1);
    for header in headers {
        let header = header.trim();
        if header.is_empty()
            || !header
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ParamsError::InvalidHeader(header.to_string()));
        }

        let canonical = canonical_header(header);
        if !normalized.contains(&canonical) {
            normalized.push(canonical);
        }
    }

    if !normalized.iter().any(|h| h == HOST_HEADER) {
        normalized.push(HOST_HEADER.to_string());
    }
    if normalized.len() > MAX_FORWARDED_HEADERS {
        return Err(ParamsError::TooManyHeaders(normalized.len()));
    }

    Ok(normalized)
}

/// MIME canonical form: `x-forwarded-for` becomes `X-Forwarded-For`
pub fn canonical_header(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let mapped = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            mapped
        })
        .collect()
}
