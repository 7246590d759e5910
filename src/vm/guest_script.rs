// Guest Network Script
//
// Renders the shell script an operator drops into the guest image so eth0
// comes up with the static address the host side expects.

use crate::config::RuntimeConfig;

/// Interface name Firecracker exposes inside the guest
pub const GUEST_INTERFACE: &str = "eth0";

/// Resolvers written to the guest's /etc/resolv.conf
pub const GUEST_NAMESERVERS: [&str; 2] = ["8.8.8.8", "8.8.4.4"];

/// Render the guest-side network setup script
pub fn render(config: &RuntimeConfig) -> String {
    let nameservers: String = GUEST_NAMESERVERS
        .iter()
        .map(|ns| format!("nameserver {}\n", ns))
        .collect();

    format!(
        "#!/bin/sh\n\
         # Network setup for the Firecracker guest\n\
         ip addr add {cidr} dev {iface}\n\
         ip link set {iface} up\n\
         ip route add default via {gateway}\n\
         cat > /etc/resolv.conf <<EOF\n\
         {nameservers}\
         EOF\n",
        cidr = config.guest_cidr(),
        iface = GUEST_INTERFACE,
        gateway = config.host_ip,
    )
}
