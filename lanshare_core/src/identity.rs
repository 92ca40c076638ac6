use std::net::IpAddr;
use uuid::Uuid;

use crate::transfer::session::PeerRef;

const FALLBACK_HOSTNAME: &str = "Unknown-PC";

/// Who this process is on the network. Regenerated on every start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// `{hostname}-{8 hex chars}`; a restart shows up as a new peer
    pub instance_id: String,
    pub display_name: String,
}

impl Identity {
    /// New identity; `display_name` falls back to the host name
    pub fn generate(display_name: Option<&str>) -> Self {
        let host = local_hostname();
        let suffix = Uuid::new_v4().simple().to_string();
        let instance_id = format!("{}-{}", host, &suffix[..8]);
        let display_name = display_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or(host);

        tracing::info!("Instance {} ({})", instance_id, display_name);
        Self {
            instance_id,
            display_name,
        }
    }

    pub fn as_peer(&self) -> PeerRef {
        PeerRef {
            peer_id: self.instance_id.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|s| s.into_string().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| FALLBACK_HOSTNAME.to_string())
}

/// Best guess at the address other LAN hosts reach us on.
/// Private ranges win over anything else; loopback and IPv6 are skipped.
pub fn lan_address() -> Option<IpAddr> {
    let ifaces = local_ip_address::list_afinet_netifas().ok()?;
    ifaces
        .into_iter()
        .map(|(_name, ip)| ip)
        .filter(|ip| ip.is_ipv4() && !ip.is_loopback())
        .min_by_key(|ip| lan_rank(ip))
}

fn lan_rank(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(v4) if v4.octets()[0] == 192 && v4.octets()[1] == 168 => 0,
        IpAddr::V4(v4) if v4.octets()[0] == 10 => 1,
        IpAddr::V4(v4) if v4.is_private() => 2,
        _ => 3,
    }
}
