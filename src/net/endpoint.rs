//! Physical listening identities.

use std::fmt;

/// Bind address used when an endpoint does not name one.
pub const ANY_ADDRESS: &str = "0.0.0.0";

/// A physical listening address: bind address + port + TLS-or-not.
///
/// Equality and hashing cover all three fields; the registry uses this as the
/// key that deduplicates OS socket binds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub bind_address: Option<String>,
    pub port: u16,
    pub tls: bool,
}

impl Endpoint {
    pub fn new(bind_address: Option<String>, port: u16, tls: bool) -> Self {
        Self {
            bind_address,
            port,
            tls,
        }
    }

    /// Endpoint on all interfaces.
    pub fn any(port: u16, tls: bool) -> Self {
        Self::new(None, port, tls)
    }

    /// `host:port` string suitable for `TcpListener::bind`.
    pub fn socket_addr_string(&self) -> String {
        let host = self.bind_address.as_deref().unwrap_or(ANY_ADDRESS);
        if host.contains(':') {
            format!("[{}]:{}", host, self.port)
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            self.socket_addr_string(),
            if self.tls { "/tls" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identity_covers_all_fields() {
        let mut seen = HashSet::new();
        assert!(seen.insert(Endpoint::any(9192, false)));
        assert!(seen.insert(Endpoint::any(9192, true)));
        assert!(seen.insert(Endpoint::new(Some("127.0.0.1".into()), 9192, false)));
        assert!(!seen.insert(Endpoint::any(9192, false)));
    }

    #[test]
    fn formats_bind_address() {
        assert_eq!(Endpoint::any(9192, true).to_string(), "0.0.0.0:9192/tls");
        assert_eq!(
            Endpoint::new(Some("::1".into()), 9192, false).socket_addr_string(),
            "[::1]:9192"
        );
    }
}
