use std::fmt;
use std::net::IpAddr;

/// Identity a request is rate limited under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientKey {
    ApiKey(String),
    Ip(IpAddr),
    Anonymous,
}

impl ClientKey {
    /// Prefer the API key, then the peer address.
    pub fn from_parts(api_key: Option<&str>, ip: Option<IpAddr>) -> Self {
        match (api_key.map(str::trim).filter(|key| !key.is_empty()), ip) {
            (Some(key), _) => Self::ApiKey(key.to_owned()),
            (None, Some(ip)) => Self::Ip(ip),
            (None, None) => Self::Anonymous,
        }
    }

    pub fn as_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey(key) => write!(f, "key:{key}"),
            Self::Ip(ip) => write!(f, "ip:{ip}"),
            Self::Anonymous => f.write_str("anonymous"),
        }
    }
}
