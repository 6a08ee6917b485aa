//! Server configuration generator.
//!
//! [`generate`] is a pure function of the [`ServerIdentity`]: the same
//! identity always renders to the same bytes. Paths inside the document are
//! relative to the data directory, which the tunnel server is started in.

use crate::identity::ServerIdentity;
use crate::pki::{CA_CERT, SERVER_CERT, SERVER_KEY, TLS_AUTH_KEY};
use crate::layout::PKI_DIR;
use ipnetwork::{IpNetwork, Ipv4Network};
use shared_utils::config::{EnvironmentInputs, Protocol};
use std::fmt;
use std::fmt::Write as _;
use std::io;
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("invalid public endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("invalid subnet {subnet:?}: {reason}")]
    InvalidSubnet { subnet: String, reason: String },
}

fn invalid_endpoint(endpoint: &str, reason: impl Into<String>) -> GenerateError {
    GenerateError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.into(),
    }
}

fn invalid_subnet(subnet: &str, reason: impl Into<String>) -> GenerateError {
    GenerateError::InvalidSubnet {
        subnet: subnet.to_string(),
        reason: reason.into(),
    }
}

/// A parsed public endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(IpAddr::V6(ip)) => write!(f, "[{ip}]:{}", self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

fn valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

fn parse_port(raw: &str, port: &str) -> Result<u16, GenerateError> {
    match port.parse::<u16>() {
        Ok(0) => Err(invalid_endpoint(raw, "port must not be zero")),
        Ok(p) => Ok(p),
        Err(_) => Err(invalid_endpoint(raw, format!("{port:?} is not a valid port"))),
    }
}

/// Parse `host`, `host:port`, `[v6]:port` or a bare IPv6 address.
pub fn parse_endpoint(raw: &str) -> Result<Endpoint, GenerateError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid_endpoint(raw, "empty endpoint"));
    }

    let (host, port) = if let Some(rest) = trimmed.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| invalid_endpoint(raw, "unterminated IPv6 bracket"))?;
        let port = match after {
            "" => EnvironmentInputs::DEFAULT_PORT,
            p => parse_port(
                raw,
                p.strip_prefix(':')
                    .ok_or_else(|| invalid_endpoint(raw, "expected ':' after ']'"))?,
            )?,
        };
        if host.parse::<std::net::Ipv6Addr>().is_err() {
            return Err(invalid_endpoint(raw, format!("{host:?} is not an IPv6 address")));
        }
        (host.to_string(), port)
    } else if trimmed.parse::<std::net::Ipv6Addr>().is_ok() {
        (trimmed.to_string(), EnvironmentInputs::DEFAULT_PORT)
    } else {
        match trimmed.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), parse_port(raw, port)?),
            None => (trimmed.to_string(), EnvironmentInputs::DEFAULT_PORT),
        }
    };

    if host.parse::<IpAddr>().is_err() && !valid_hostname(&host) {
        return Err(invalid_endpoint(raw, format!("{host:?} is not a valid host name")));
    }

    Ok(Endpoint { host, port })
}

/// Parse the tunnel subnet. It must be an IPv4 network address with room
/// for at least two clients.
pub fn parse_subnet(raw: &str) -> Result<Ipv4Network, GenerateError> {
    let net: Ipv4Network = raw
        .trim()
        .parse()
        .map_err(|e| invalid_subnet(raw, format!("{e}")))?;
    if net.ip() != net.network() {
        return Err(invalid_subnet(
            raw,
            format!("host bits set; did you mean {}/{}?", net.network(), net.prefix()),
        ));
    }
    if net.prefix() > 29 {
        return Err(invalid_subnet(raw, "prefix longer than /29 leaves no client addresses"));
    }
    Ok(net)
}

/// Parse a pushed route. IPv4 and IPv6 are both accepted.
pub fn parse_route(raw: &str) -> Result<IpNetwork, GenerateError> {
    let net: IpNetwork = raw
        .trim()
        .parse()
        .map_err(|e| invalid_subnet(raw, format!("{e}")))?;
    if net.ip() != net.network() {
        return Err(invalid_subnet(raw, "host bits set in route"));
    }
    Ok(net)
}

/// Rendered server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDocument {
    text: String,
}

impl ConfigDocument {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }

    /// Persist the document. The rename makes the marker appear atomically.
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        crate::fsutil::write_atomic(path, self.as_bytes(), 0o644)
    }
}

/// `udp://203.0.113.5:1194` style URL for the identity's endpoint.
pub fn endpoint_url(protocol: Protocol, endpoint: &Endpoint) -> String {
    format!("{protocol}://{endpoint}")
}

/// Render the server configuration for `identity`.
pub fn generate(identity: &ServerIdentity) -> Result<ConfigDocument, GenerateError> {
    let endpoint = parse_endpoint(&identity.endpoint)?;
    let subnet = parse_subnet(&identity.tunnel_subnet)?;
    let routes = identity
        .routes
        .iter()
        .map(|r| parse_route(r))
        .collect::<Result<Vec<_>, _>>()?;

    // Writing into a String cannot fail.
    let mut out = String::new();
    let _ = writeln!(out, "# Generated by vpngate. Delete the data directory to re-provision.");
    let _ = writeln!(out, "# endpoint {}", endpoint_url(identity.protocol, &endpoint));
    let _ = writeln!(out, "server {} {}", subnet.network(), subnet.mask());
    let _ = writeln!(out, "topology subnet");
    let _ = writeln!(out, "proto {}", identity.protocol);
    let _ = writeln!(out, "port {}", endpoint.port);
    let _ = writeln!(out, "dev tun");
    let _ = writeln!(out);
    let _ = writeln!(out, "ca {PKI_DIR}/{CA_CERT}");
    let _ = writeln!(out, "cert {PKI_DIR}/{SERVER_CERT}");
    let _ = writeln!(out, "key {PKI_DIR}/{SERVER_KEY}");
    let _ = writeln!(out, "dh none");
    let _ = writeln!(out, "tls-auth {PKI_DIR}/{TLS_AUTH_KEY} 0");
    let _ = writeln!(out, "remote-cert-tls client");
    let _ = writeln!(out);
    let _ = writeln!(out, "keepalive 10 60");
    let _ = writeln!(out, "persist-key");
    let _ = writeln!(out, "persist-tun");
    let _ = writeln!(out, "user nobody");
    let _ = writeln!(out, "group nogroup");
    let _ = writeln!(out, "status openvpn-status.log");
    let _ = writeln!(out, "verb 3");
    if identity.protocol == Protocol::Udp {
        let _ = writeln!(out, "explicit-exit-notify 1");
    }

    if !identity.dns.is_empty() || !routes.is_empty() {
        let _ = writeln!(out);
    }
    for resolver in &identity.dns {
        let directive = match resolver {
            IpAddr::V4(_) => "DNS",
            IpAddr::V6(_) => "DNS6",
        };
        let _ = writeln!(out, "push \"dhcp-option {directive} {resolver}\"");
    }
    for route in &routes {
        match route {
            IpNetwork::V4(net) => {
                let _ = writeln!(out, "push \"route {} {}\"", net.network(), net.mask());
            }
            IpNetwork::V6(net) => {
                let _ = writeln!(out, "push \"route-ipv6 {net}\"");
            }
        }
    }

    Ok(ConfigDocument { text: out })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ServerIdentity {
        ServerIdentity {
            protocol: Protocol::Udp,
            endpoint: "203.0.113.5:1194".into(),
            tunnel_subnet: "10.8.0.0/24".into(),
            dns: vec!["1.1.1.1".parse().unwrap()],
            routes: ["192.168.10.0/24".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn renders_expected_directives() {
        let doc = generate(&identity()).unwrap();
        let text = doc.as_str();
        assert!(text.contains("# endpoint udp://203.0.113.5:1194\n"));
        assert!(text.contains("server 10.8.0.0 255.255.255.0\n"));
        assert!(text.contains("proto udp\n"));
        assert!(text.contains("port 1194\n"));
        assert!(text.contains("ca pki/ca.crt\n"));
        assert!(text.contains("tls-auth pki/ta.key 0\n"));
        assert!(text.contains("explicit-exit-notify 1\n"));
        assert!(text.contains("push \"dhcp-option DNS 1.1.1.1\"\n"));
        assert!(text.contains("push \"route 192.168.10.0 255.255.255.0\"\n"));
    }

    #[test]
    fn output_is_byte_identical_for_identical_input() {
        let a = generate(&identity()).unwrap();
        let b = generate(&identity().clone()).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn tcp_omits_exit_notify() {
        let mut id = identity();
        id.protocol = Protocol::Tcp;
        let doc = generate(&id).unwrap();
        assert!(doc.as_str().contains("proto tcp\n"));
        assert!(!doc.as_str().contains("explicit-exit-notify"));
    }

    #[test]
    fn endpoint_forms() {
        assert_eq!(
            parse_endpoint("vpn.example.com").unwrap(),
            Endpoint { host: "vpn.example.com".into(), port: 1194 }
        );
        assert_eq!(parse_endpoint("vpn.example.com:443").unwrap().port, 443);
        let v6 = parse_endpoint("[2001:db8::1]:1195").unwrap();
        assert_eq!(v6.host, "2001:db8::1");
        assert_eq!(v6.to_string(), "[2001:db8::1]:1195");
        assert_eq!(parse_endpoint("2001:db8::1").unwrap().port, 1194);
    }

    #[test]
    fn bad_endpoints_are_rejected() {
        for raw in ["", "host:0", "host:99999", "host:abc", "bad host:1194", "-x.example:1", "[::1"] {
            assert!(
                matches!(parse_endpoint(raw), Err(GenerateError::InvalidEndpoint { .. })),
                "{raw:?} should be rejected"
            );
        }

        let mut id = identity();
        id.endpoint = "exa mple.com".into();
        assert!(matches!(generate(&id), Err(GenerateError::InvalidEndpoint { .. })));
    }

    #[test]
    fn bad_subnets_and_routes_are_rejected() {
        assert!(parse_subnet("10.8.0.1/24").is_err());
        assert!(parse_subnet("10.8.0.0/30").is_err());
        assert!(parse_subnet("fd00::/64").is_err());
        assert!(parse_subnet("10.8.0.0/33").is_err());

        let mut id = identity();
        id.routes.insert("192.168.300.0/24".into());
        assert!(matches!(generate(&id), Err(GenerateError::InvalidSubnet { .. })));
    }

    #[test]
    fn ipv6_routes_and_resolvers() {
        let mut id = identity();
        id.routes.insert("fd00:1::/64".into());
        id.dns.push("2606:4700:4700::1111".parse().unwrap());
        let doc = generate(&id).unwrap();
        assert!(doc.as_str().contains("push \"route-ipv6 fd00:1::/64\"\n"));
        assert!(doc.as_str().contains("push \"dhcp-option DNS6 2606:4700:4700::1111\"\n"));
    }
}
