//! Typed IPsec config model and byte-exact `ipsec.conf`/`ipsec.secrets`
//! rendering (§4.6, §6).

use std::{fmt::Write as _, net::Ipv4Addr};

use vnet_types::{ip::Cidr, mac::MacAddress};

/// The VPN service a set of site connections hangs off of (§3).
#[derive(Debug, Clone)]
pub struct IPSecServiceDef {
    pub name: String,
    pub filepath: String,
    pub local_endpoint_ip: Ipv4Addr,
    pub local_endpoint_mac: MacAddress,
    pub namespace_interface_ip: Cidr,
    pub namespace_gateway_ip: Ipv4Addr,
    pub namespace_gateway_mac: MacAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpdAction {
    Hold,
    Clear,
    Restart,
    RestartByPeer,
    Disabled,
}

impl DpdAction {
    fn as_str(self) -> &'static str {
        match self {
            DpdAction::Hold => "hold",
            DpdAction::Clear => "clear",
            DpdAction::Restart => "restart",
            DpdAction::RestartByPeer => "restart-by-peer",
            DpdAction::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    BiDirectional,
    ResponseOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IkeVersion {
    V1,
    V2,
}

#[derive(Debug, Clone, Copy)]
pub struct IkePolicy {
    pub version: IkeVersion,
    pub lifetime_seconds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpsecMode {
    Tunnel,
    Transport,
}

#[derive(Debug, Clone, Copy)]
pub struct IpsecPolicy {
    pub transform: &'static str,
    pub mode: IpsecMode,
    pub lifetime_seconds: u32,
}

/// A single site-to-site connection (§3).
#[derive(Debug, Clone)]
pub struct IPSecSiteConnection {
    pub name: String,
    pub admin_state_up: bool,
    pub peer_address: Ipv4Addr,
    pub psk: String,
    pub local_cidr: Cidr,
    pub peer_cidrs: Vec<Cidr>,
    pub mtu: u16,
    pub dpd_action: DpdAction,
    pub dpd_interval: u32,
    pub dpd_timeout: u32,
    pub initiator: Initiator,
    pub ike_policy: IkePolicy,
    pub ipsec_policy: IpsecPolicy,
}

/// Drops every byte outside `[A-Za-z0-9_]` (§4.6).
#[must_use]
pub fn sanitize_connection_name(name: &str) -> String {
    name.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_').collect()
}

fn admin_up(conns: &[IPSecSiteConnection]) -> impl Iterator<Item = &IPSecSiteConnection> {
    conns.iter().filter(|c| c.admin_state_up)
}

/// `ipsec.secrets`: one PSK line per admin-up connection (§6).
#[must_use]
pub fn render_secrets(service: &IPSecServiceDef, conns: &[IPSecSiteConnection]) -> String {
    let mut out = String::new();
    for conn in admin_up(conns) {
        let _ = writeln!(out, "{} {} : PSK \"{}\"", service.local_endpoint_ip, conn.peer_address, conn.psk);
    }
    out
}

/// `ipsec.conf`: fixed preamble then one `conn` block per admin-up
/// connection, fields in the exact order §6 specifies.
#[must_use]
pub fn render_conf(service: &IPSecServiceDef, conns: &[IPSecSiteConnection]) -> String {
    let mut out = String::new();
    out.push_str("config setup\n");
    out.push_str("    nat_traversal=yes\n");
    out.push_str("conn %default\n");
    out.push_str("    ikelifetime=480m\n");
    out.push_str("    keylife=60m\n");
    out.push_str("    keyingtries=%forever\n");

    for conn in admin_up(conns) {
        let sanitized = sanitize_connection_name(&conn.name);
        let auto = match conn.initiator {
            Initiator::BiDirectional => "start",
            Initiator::ResponseOnly => "add",
        };
        let ikev2 = match conn.ike_policy.version {
            IkeVersion::V1 => "never",
            IkeVersion::V2 => "insist",
        };
        let left_subnets = join_cidrs(std::slice::from_ref(&conn.local_cidr));
        let right_subnets = join_cidrs(&conn.peer_cidrs);
        let ipsec_type = match conn.ipsec_policy.mode {
            IpsecMode::Tunnel => "tunnel",
            IpsecMode::Transport => "transport",
        };

        let _ = writeln!(out, "conn {sanitized}");
        out.push_str("    leftnexthop=%defaultroute\n");
        out.push_str("    rightnexthop=%defaultroute\n");
        let _ = writeln!(out, "    left={}", service.local_endpoint_ip);
        let _ = writeln!(out, "    leftid={}", service.local_endpoint_ip);
        let _ = writeln!(out, "    auto={auto}");
        let _ = writeln!(out, "    leftsubnets={{ {left_subnets} }}");
        out.push_str("    leftupdown=\"ipsec _updown --route yes\"\n");
        let _ = writeln!(out, "    right={}", conn.peer_address);
        let _ = writeln!(out, "    rightid={}", conn.peer_address);
        let _ = writeln!(out, "    rightsubnets={{ {right_subnets} }}");
        let _ = writeln!(out, "    mtu={}", conn.mtu);
        let _ = writeln!(out, "    dpdaction={}", conn.dpd_action.as_str());
        let _ = writeln!(out, "    dpddelay={}", conn.dpd_interval);
        let _ = writeln!(out, "    dpdtimeout={}", conn.dpd_timeout);
        out.push_str("    authby=secret\n");
        let _ = writeln!(out, "    ikev2={ikev2}");
        out.push_str("    ike=aes128-sha1;modp1536\n");
        let _ = writeln!(out, "    ikelifetime={}s", conn.ike_policy.lifetime_seconds);
        let _ = writeln!(out, "    auth={}", conn.ipsec_policy.transform);
        out.push_str("    phase2alg=aes128-sha1;modp1536\n");
        let _ = writeln!(out, "    type={ipsec_type}");
        let _ = writeln!(out, "    lifetime={}s", conn.ipsec_policy.lifetime_seconds);
    }

    out
}

fn join_cidrs(cidrs: &[Cidr]) -> String {
    cidrs.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> IPSecServiceDef {
        IPSecServiceDef {
            name: "vpnservice-1".to_string(),
            filepath: "/tmp/vpn-1".to_string(),
            local_endpoint_ip: Ipv4Addr::new(172, 24, 4, 1),
            local_endpoint_mac: MacAddress::from([1; 6]),
            namespace_interface_ip: Cidr::new(Ipv4Addr::new(169, 254, 0, 2), 30),
            namespace_gateway_ip: Ipv4Addr::new(169, 254, 0, 1),
            namespace_gateway_mac: MacAddress::from([2; 6]),
        }
    }

    fn connection(name: &str, admin_state_up: bool) -> IPSecSiteConnection {
        IPSecSiteConnection {
            name: name.to_string(),
            admin_state_up,
            peer_address: Ipv4Addr::new(198, 51, 100, 10),
            psk: "super-secret".to_string(),
            local_cidr: Cidr::new(Ipv4Addr::new(10, 0, 0, 0), 24),
            peer_cidrs: vec![Cidr::new(Ipv4Addr::new(10, 1, 0, 0), 24)],
            mtu: 1446,
            dpd_action: DpdAction::Hold,
            dpd_interval: 30,
            dpd_timeout: 120,
            initiator: Initiator::BiDirectional,
            ike_policy: IkePolicy { version: IkeVersion::V1, lifetime_seconds: 3600 },
            ipsec_policy: IpsecPolicy { transform: "esp", mode: IpsecMode::Tunnel, lifetime_seconds: 3600 },
        }
    }

    /// S4: exactly one conn block and one PSK line for a single connection.
    #[test]
    fn single_connection_renders_one_block_and_one_secret() {
        let svc = service();
        let conns = vec![connection("site-A!", true)];

        let conf = render_conf(&svc, &conns);
        assert!(conf.starts_with("config setup\n    nat_traversal=yes\nconn %default\n"));
        assert_eq!(conf.matches("conn siteA").count(), 1);

        let secrets = render_secrets(&svc, &conns);
        assert_eq!(secrets.lines().count(), 1);
        assert_eq!(secrets, "172.24.4.1 198.51.100.10 : PSK \"super-secret\"\n");
    }

    #[test]
    fn admin_down_connections_are_omitted_from_both_files() {
        let svc = service();
        let conns = vec![connection("up", true), connection("down", false)];

        let conf = render_conf(&svc, &conns);
        assert!(conf.contains("conn up"));
        assert!(!conf.contains("conn down"));

        let secrets = render_secrets(&svc, &conns);
        assert_eq!(secrets.lines().count(), 1);
    }

    #[test]
    fn sanitization_strips_non_word_bytes() {
        assert_eq!(sanitize_connection_name("a-b c!d_1"), "abcd_1");
    }

    #[test]
    fn response_only_uses_auto_add() {
        let svc = service();
        let mut conn = connection("r", true);
        conn.initiator = Initiator::ResponseOnly;
        let conf = render_conf(&svc, &[conn]);
        assert!(conf.contains("auto=add"));
    }

    #[test]
    fn conn_header_matches_expected_pattern() {
        let svc = service();
        let conn = connection("weird!!name--here", true);
        let conf = render_conf(&svc, &[conn]);
        let header = conf.lines().find(|l| l.starts_with("conn ") && !l.contains('%')).unwrap();
        let name_part = header.strip_prefix("conn ").unwrap();
        assert!(!name_part.is_empty());
        assert!(name_part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }
}
