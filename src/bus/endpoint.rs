//! Endpoint strings: `tcp://<host>:<port>`.

use std::net::SocketAddr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::BusError;

static WILDCARD_ENDPOINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^tcp://(?:\*|0\.0\.0\.0)(:\d+)$").expect("wildcard endpoint pattern")
});

static ENDPOINT_PORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"tcp://.*:(\d+)").expect("endpoint port pattern"));

/// Loopback host used when a subscriber dials a wildcard publisher.
const LOOPBACK: &str = "127.0.0.1";

/// Rewrite a wildcard bind address into one a subscriber can dial.
///
/// `tcp://*:5555` and `tcp://0.0.0.0:5555` become `tcp://127.0.0.1:5555`;
/// anything else is returned unchanged.
pub fn subscriber_endpoint(endpoint: &str) -> String {
    WILDCARD_ENDPOINT
        .replace(endpoint, format!("tcp://{LOOPBACK}$1").as_str())
        .into_owned()
}

/// Port portion of an endpoint, or an empty string when there is none.
pub fn port_of(endpoint: &str) -> String {
    ENDPOINT_PORT
        .captures(endpoint)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// Endpoint string for a bound socket address.
pub fn from_socket_addr(addr: SocketAddr) -> String {
    format!("tcp://{addr}")
}

/// Split an endpoint into host and port.
pub fn parse(endpoint: &str) -> Result<(String, u16), BusError> {
    let invalid = |reason: &str| BusError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };

    let rest = endpoint
        .strip_prefix("tcp://")
        .ok_or_else(|| invalid("only tcp:// endpoints are supported"))?;
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;
    Ok((host.to_string(), port))
}

/// Address a publisher binds to. `*` means every interface.
pub fn bind_address(endpoint: &str) -> Result<String, BusError> {
    let (host, port) = parse(endpoint)?;
    let host = if host == "*" { "0.0.0.0".to_string() } else { host };
    Ok(format!("{host}:{port}"))
}

/// Address a subscriber dials.
pub fn dial_address(endpoint: &str) -> Result<String, BusError> {
    let (host, port) = parse(endpoint)?;
    if host == "*" {
        return Err(BusError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: "cannot dial a wildcard host".to_string(),
        });
    }
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_star_is_rewritten() {
        assert_eq!(subscriber_endpoint("tcp://*:5555"), "tcp://127.0.0.1:5555");
    }

    #[test]
    fn wildcard_any_interface_is_rewritten() {
        assert_eq!(
            subscriber_endpoint("tcp://0.0.0.0:5555"),
            "tcp://127.0.0.1:5555"
        );
    }

    #[test]
    fn concrete_address_is_unchanged() {
        assert_eq!(
            subscriber_endpoint("tcp://192.168.1.10:5555"),
            "tcp://192.168.1.10:5555"
        );
        assert_eq!(
            subscriber_endpoint("tcp://localhost:5555"),
            "tcp://localhost:5555"
        );
    }

    #[test]
    fn port_extraction() {
        assert_eq!(port_of("tcp://*:5555"), "5555");
        assert_eq!(port_of("tcp://127.0.0.1:6000"), "6000");
        assert_eq!(port_of("ipc:///tmp/agent"), "");
    }

    #[test]
    fn bind_address_maps_star() {
        assert_eq!(bind_address("tcp://*:5555").unwrap(), "0.0.0.0:5555");
        assert_eq!(bind_address("tcp://127.0.0.1:0").unwrap(), "127.0.0.1:0");
    }

    #[test]
    fn dial_rejects_wildcard() {
        assert!(dial_address("tcp://*:5555").is_err());
        assert_eq!(
            dial_address("tcp://127.0.0.1:5555").unwrap(),
            "127.0.0.1:5555"
        );
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(parse("udp://host:1").is_err());
        assert!(parse("tcp://host").is_err());
        assert!(parse("tcp://:1").is_err());
        assert!(parse("tcp://host:notaport").is_err());
    }

    #[test]
    fn socket_addr_round_trip() {
        let addr: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        assert_eq!(from_socket_addr(addr), "tcp://127.0.0.1:4242");
    }
}
