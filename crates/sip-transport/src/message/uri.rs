use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::tuple::TransportType;

/// A `sip:` or `sips:` URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub secure: bool,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Vec<(String, Option<String>)>,
}

impl Uri {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            secure: false,
            user: None,
            host: host.into(),
            port: None,
            params: Vec::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.params.push((name.into(), value.map(str::to_string)));
        self
    }

    /// Value of a parameter, `Some(None)` for a flag parameter
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    /// Transport requested through the `transport` parameter
    pub fn transport_param(&self) -> Option<TransportType> {
        self.param("transport").flatten().and_then(|t| t.parse().ok())
    }

    /// Host without IPv6 brackets
    pub fn host_unbracketed(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.secure { "sips:" } else { "sip:" })?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(v) => write!(f, ";{}={}", name, v)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (secure, rest) = if let Some(rest) = strip_prefix_ci(s, "sips:") {
            (true, rest)
        } else if let Some(rest) = strip_prefix_ci(s, "sip:") {
            (false, rest)
        } else {
            return Err(Error::invalid_uri(s, "unsupported scheme"));
        };

        // headers (?...) are not interpreted
        let rest = rest.split('?').next().unwrap_or(rest);
        let mut parts = rest.split(';');
        let addr = parts.next().unwrap_or_default();
        let params = parts
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((n, v)) => (n.to_string(), Some(v.to_string())),
                None => (p.to_string(), None),
            })
            .collect();

        let (user, hostport) = match addr.rsplit_once('@') {
            Some((user, hostport)) => (Some(user.to_string()), hostport),
            None => (None, addr),
        };
        let (host, port) = split_host_port(hostport).ok_or_else(|| Error::invalid_uri(s, "bad host/port"))?;
        if host.is_empty() {
            return Err(Error::invalid_uri(s, "missing host"));
        }

        Ok(Uri {
            secure,
            user,
            host: host.to_string(),
            port,
            params,
        })
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Split `host[:port]`, keeping IPv6 references bracketed
pub(crate) fn split_host_port(s: &str) -> Option<(&str, Option<u16>)> {
    if s.starts_with('[') {
        let end = s.find(']')?;
        let host = &s[..=end];
        let rest = &s[end + 1..];
        if rest.is_empty() {
            return Some((host, None));
        }
        let port = rest.strip_prefix(':')?.parse().ok()?;
        return Some((host, Some(port)));
    }
    match s.rsplit_once(':') {
        Some((host, port)) => Some((host, Some(port.parse().ok()?))),
        None => Some((s, None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let uri: Uri = "sip:alice@example.com:5070;transport=tcp;lr".parse().unwrap();
        assert!(!uri.secure);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, Some(5070));
        assert_eq!(uri.transport_param(), Some(TransportType::Tcp));
        assert_eq!(uri.param("lr"), Some(None));
        assert_eq!(uri.to_string(), "sip:alice@example.com:5070;transport=tcp;lr");
    }

    #[test]
    fn test_parse_ipv6_and_sips() {
        let uri: Uri = "sips:[2001:db8::1]:5061".parse().unwrap();
        assert!(uri.secure);
        assert_eq!(uri.host, "[2001:db8::1]");
        assert_eq!(uri.host_unbracketed(), "2001:db8::1");
        assert_eq!(uri.port, Some(5061));
    }

    #[test]
    fn test_reject_other_schemes() {
        assert!("tel:+15551234".parse::<Uri>().is_err());
        assert!("sip:".parse::<Uri>().is_err());
    }
}
