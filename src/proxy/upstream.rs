use std::fmt;

use super::ProxyError;

const SCHEME: &str = "http://";
const DEFAULT_PORT: u16 = 80;

/// Parsed location of the backend the gateway forwards to.
///
/// Only plain `http://host[:port][/base]` URLs are accepted. A non-empty
/// base path is prefixed to every forwarded request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    host: String,
    port: u16,
    base_path: String,
}

impl Upstream {
    /// Parses a backend URL.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidUrl`] for a missing or unsupported scheme,
    /// an empty host, a bad port, or a query or fragment in the URL.
    ///
    /// # Examples
    ///
    /// ```
    /// use visara_gateway::proxy::Upstream;
    ///
    /// let upstream = Upstream::parse("http://localhost:8000/api").unwrap();
    /// assert_eq!(upstream.authority(), "localhost:8000");
    /// assert_eq!(upstream.join_path("/users"), "/api/users");
    /// ```
    pub fn parse(url: &str) -> Result<Self, ProxyError> {
        let invalid = |reason: &'static str| ProxyError::InvalidUrl {
            url: url.to_owned(),
            reason,
        };

        let rest = url
            .get(..SCHEME.len())
            .filter(|scheme| scheme.eq_ignore_ascii_case(SCHEME))
            .map(|_| &url[SCHEME.len()..])
            .ok_or_else(|| invalid("only http:// backends are supported"))?;

        if rest.contains(['?', '#']) {
            return Err(invalid("query and fragment are not allowed"));
        }

        let (authority, path) = match rest.find('/') {
            Some(pos) => (&rest[..pos], &rest[pos..]),
            None => (rest, ""),
        };

        let (host, port) = match authority.rsplit_once(':') {
            // An IPv6 literal without a port ends in `]`.
            Some((host, port)) if !port.contains(']') => {
                let port = port.parse::<u16>().map_err(|_| invalid("port is not a number in 1..=65535"))?;
                if port == 0 {
                    return Err(invalid("port is not a number in 1..=65535"));
                }
                (host, port)
            }
            _ => (authority, DEFAULT_PORT),
        };

        if host.is_empty() || host.contains('@') {
            return Err(invalid("host is missing"));
        }

        Ok(Self {
            host: host.to_owned(),
            port,
            base_path: path.trim_end_matches('/').to_owned(),
        })
    }

    /// Host name or address literal, brackets included for IPv6.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host[:port]` as sent in the `Host` header; the default port is omitted.
    pub fn authority(&self) -> String {
        if self.port == DEFAULT_PORT {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Address to pass to `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Prefixes the base path to a request path with exactly one slash between them.
    pub fn join_path(&self, path: &str) -> String {
        let path = path.strip_prefix('/').unwrap_or(path);
        format!("{}/{}", self.base_path, path)
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}:{}{}", self.host, self.port, self.base_path)
    }
}
