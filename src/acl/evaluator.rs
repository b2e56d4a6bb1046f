use std::net::IpAddr;

use crate::acl::parser::{RuleEntry, RuleSet};

/// Proxy command kinds. Only `Connect` can ever be authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl From<fast_socks5::Socks5Command> for Command {
    fn from(cmd: fast_socks5::Socks5Command) -> Self {
        match cmd {
            fast_socks5::Socks5Command::TCPConnect => Command::Connect,
            fast_socks5::Socks5Command::TCPBind => Command::Bind,
            fast_socks5::Socks5Command::UDPAssociate => Command::UdpAssociate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub command: Command,
    pub source: IpAddr,
    pub destination: IpAddr,
    pub port: u16,
}

impl RuleEntry {
    fn allows_port(&self, port: u16) -> bool {
        self.ports.is_empty() || self.ports.contains(&i64::from(port))
    }

    fn authorizes(&self, request: &ConnectionRequest) -> bool {
        for source in &self.sources {
            if !source.contains(&request.source) {
                continue;
            }
            for destination in &self.destinations {
                if destination.contains(&request.destination) && self.allows_port(request.port) {
                    return true;
                }
            }
        }
        false
    }
}

impl RuleSet {
    pub fn authorize(&self, request: &ConnectionRequest) -> bool {
        authorize_request(self, request)
    }
}

/// Deny-by-default evaluation: the first entry whose source, destination
/// and port all match authorizes the request. A port mismatch does not
/// stop the search.
pub fn authorize_request(rules: &RuleSet, request: &ConnectionRequest) -> bool {
    if request.command != Command::Connect {
        return false;
    }
    rules.entries().iter().any(|entry| entry.authorizes(request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::parser::parse_rules;

    fn connect(source: &str, destination: &str, port: u16) -> ConnectionRequest {
        ConnectionRequest {
            command: Command::Connect,
            source: source.parse().unwrap(),
            destination: destination.parse().unwrap(),
            port,
        }
    }

    #[test]
    fn test_port_restricted_rule() {
        let rules = parse_rules(
            "- from: [0.0.0.0/0]\n  to: [127.0.0.1/32, 127.0.0.2/32]\n  port: [443]\n",
        )
        .unwrap();

        for source in ["10.1.1.1", "192.168.7.7", "127.0.0.1"] {
            assert!(rules.authorize(&connect(source, "127.0.0.1", 443)));
            assert!(rules.authorize(&connect(source, "127.0.0.2", 443)));
            assert!(!rules.authorize(&connect(source, "127.0.0.1", 8080)));
            assert!(!rules.authorize(&connect(source, "127.0.0.3", 443)));
        }
    }

    #[test]
    fn test_empty_port_list_allows_any_port() {
        let rules = parse_rules("- from: [0.0.0.0/0]\n  to: [192.168.0.0/24]\n  port: []\n").unwrap();
        for port in [0, 1, 22, 443, 8080, 65535] {
            assert!(rules.authorize(&connect("1.2.3.4", "192.168.0.5", port)));
        }
        assert!(!rules.authorize(&connect("1.2.3.4", "192.168.1.5", 22)));
    }

    #[test]
    fn test_non_connect_commands_are_always_denied() {
        let rules = parse_rules("- from: [0.0.0.0/0, '::/0']\n  to: [0.0.0.0/0, '::/0']\n").unwrap();
        assert!(rules.authorize(&connect("1.2.3.4", "5.6.7.8", 80)));

        for command in [Command::Bind, Command::UdpAssociate] {
            let request = ConnectionRequest { command, ..connect("1.2.3.4", "5.6.7.8", 80) };
            assert!(!rules.authorize(&request), "{command:?}");
        }
    }

    #[test]
    fn test_port_mismatch_does_not_stop_search() {
        let rules = parse_rules(
            "- from: [10.0.0.0/8]\n  to: [8.8.8.8/32]\n  port: [53]\n\
             - from: [10.0.0.0/8]\n  to: [8.8.8.8/32]\n  port: [443]\n",
        )
        .unwrap();
        assert!(rules.authorize(&connect("10.2.3.4", "8.8.8.8", 443)));
        assert!(rules.authorize(&connect("10.2.3.4", "8.8.8.8", 53)));
        assert!(!rules.authorize(&connect("10.2.3.4", "8.8.8.8", 80)));
    }

    #[test]
    fn test_source_restrictions() {
        let rules = parse_rules(
            "- from: [0.0.0.0/0]\n  to: [192.168.0.0/24, 8.8.8.8/32]\n  port: [80, 443]\n\
             - from: [127.0.0.1/32]\n  to: [10.10.10.1/32, 10.9.0.0/16]\n",
        )
        .unwrap();

        assert!(rules.authorize(&connect("127.0.0.1", "8.8.8.8", 443)));
        assert!(rules.authorize(&connect("127.0.0.1", "10.9.200.1", 5432)));
        assert!(!rules.authorize(&connect("127.0.0.1", "8.8.8.9", 443)));
        assert!(!rules.authorize(&connect("127.0.0.1", "8.8.8.8", 449)));
        assert!(!rules.authorize(&connect("192.168.0.1", "10.10.10.1", 443)));
    }

    #[test]
    fn test_empty_rule_set_denies() {
        let rules = RuleSet::default();
        assert!(!authorize_request(&rules, &connect("127.0.0.1", "127.0.0.1", 80)));
    }

    #[test]
    fn test_ipv6_rules_do_not_match_ipv4_requests() {
        let rules = parse_rules("- from: ['::/0']\n  to: ['::/0']\n").unwrap();
        assert!(rules.authorize(&connect("::1", "2001:db8::1", 443)));
        assert!(!rules.authorize(&connect("127.0.0.1", "2001:db8::1", 443)));
        assert!(!rules.authorize(&connect("::1", "8.8.8.8", 443)));
    }
}
