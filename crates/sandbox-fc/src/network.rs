//! Per-VM network identity: allocation and revocation.
//!
//! Each live VM owns one slot index from a bitset. The index derives every
//! name and address the VM needs, so no two live VMs can collide:
//!
//! ```text
//! ┌──────────── netns skf-ns-00 ────────────┐
//! │  VM eth0 192.168.128.2/30               │
//! │     │ TAP skf-tap00  192.168.128.1      │
//! │  MASQUERADE → veth0 10.200.0.2/30       │
//! └──────┼──────────────────────────────────┘
//!        │ skf-ve-00 10.200.0.1 (host side)
//!        │ NAT / FORWARD / optional proxy REDIRECT
//!        ↓ default interface
//! ```
//!
//! The veth peer address (`10.200.x.y`) is the source IP the VM's egress
//! carries on the host, and therefore the identity the egress proxy keys on.
//!
//! Every host iptables rule is tagged with the namespace name in a comment;
//! release deletes by tag, so revocation is exact and idempotent even after
//! a partial allocation.

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::command::{Privilege, exec, exec_ignore_errors};
use crate::config::GUEST_INIT;

/// Namespace name prefix; also the iptables comment namespace.
pub const NS_PREFIX: &str = "skf-ns-";
const TAP_PREFIX: &str = "skf-tap";
const VETH_PREFIX: &str = "skf-ve-";
/// Peer device name inside each namespace.
const PEER_DEVICE: &str = "veth0";

/// Slot indices are a u8, bounding a host at 256 concurrent VMs.
pub const MAX_SLOTS: usize = 256;

/// TAP subnets come from 192.168.128.0/22 (256 × /30), veth subnets from
/// 10.200.0.0/22.
const TAP_NET: (u8, u8) = (192, 168);
const TAP_OCTET3_BASE: u32 = 128;
const VETH_NET: (u8, u8) = (10, 200);

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("all {MAX_SLOTS} network slots are in use")]
    Exhausted,

    #[error("network syscall failed: {0}")]
    Syscall(String),

    #[error("cannot determine default interface from: {0}")]
    NoDefaultInterface(String),
}

impl From<crate::command::CommandError> for NetworkError {
    fn from(e: crate::command::CommandError) -> Self {
        Self::Syscall(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;

/// A VM's complete network identity. Derived purely from the slot index.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct NetworkAlloc {
    pub index: u8,
    /// Network namespace holding the TAP device.
    pub netns: String,
    /// TAP device name inside the namespace.
    pub tap_device: String,
    /// Host-side veth device name.
    pub host_device: String,
    /// TAP address on the namespace side (the guest's default gateway).
    pub host_ip: String,
    /// Guest NIC address.
    pub guest_ip: String,
    pub guest_mac: String,
    /// Dotted netmask for the guest /30 (kernel boot args).
    pub netmask: String,
    pub prefix_len: u8,
    /// Host side of the veth pair.
    pub veth_host_ip: String,
    /// Namespace side of the veth pair: the source IP the egress proxy sees.
    pub veth_ns_ip: String,
}

fn hex_index(index: u8) -> String {
    format!("{index:02x}")
}

/// Derive the full identity for a slot index.
pub fn derive_alloc(index: u8) -> NetworkAlloc {
    let idx = u32::from(index);
    let tap_octet3 = TAP_OCTET3_BASE + idx / 64;
    let tap_base = (idx % 64) * 4;
    let veth_octet3 = idx / 64;
    let veth_base = (idx % 64) * 4;
    let hex = hex_index(index);

    NetworkAlloc {
        index,
        netns: format!("{NS_PREFIX}{hex}"),
        tap_device: format!("{TAP_PREFIX}{hex}"),
        host_device: format!("{VETH_PREFIX}{hex}"),
        host_ip: format!("{}.{}.{tap_octet3}.{}", TAP_NET.0, TAP_NET.1, tap_base + 1),
        guest_ip: format!("{}.{}.{tap_octet3}.{}", TAP_NET.0, TAP_NET.1, tap_base + 2),
        guest_mac: format!("02:fc:00:00:00:{hex}"),
        netmask: "255.255.255.252".to_string(),
        prefix_len: 30,
        veth_host_ip: format!("{}.{}.{veth_octet3}.{}", VETH_NET.0, VETH_NET.1, veth_base + 1),
        veth_ns_ip: format!("{}.{}.{veth_octet3}.{}", VETH_NET.0, VETH_NET.1, veth_base + 2),
    }
}

/// Kernel boot arguments for a fresh boot: the minimal fast-boot set, the
/// init binary, and the guest network line consumed by the kernel's ip=
/// autoconfiguration.
pub fn kernel_boot_args(alloc: &NetworkAlloc) -> String {
    format!(
        "pci=off nomodules random.trust_cpu=on quiet loglevel=0 nokaslr audit=0 numa=off \
         mitigations=off noresume init={GUEST_INIT} ip={}::{}:{}::eth0:off",
        alloc.guest_ip, alloc.host_ip, alloc.netmask,
    )
}

// ---------------------------------------------------------------------------
// Command helpers
// ---------------------------------------------------------------------------

async fn ip(args: &[&str]) -> Result<()> {
    exec("ip", args, Privilege::Sudo).await?;
    Ok(())
}

async fn ip_netns(ns: &str, args: &[&str]) -> Result<()> {
    let mut all = vec!["netns", "exec", ns, "ip"];
    all.extend_from_slice(args);
    exec("ip", &all, Privilege::Sudo).await?;
    Ok(())
}

async fn iptables_tagged(ns: &str, args: &[&str]) -> Result<()> {
    let mut all = args.to_vec();
    all.extend_from_slice(&["-m", "comment", "--comment", ns]);
    exec("iptables", &all, Privilege::Sudo).await?;
    Ok(())
}

async fn default_interface() -> Result<String> {
    let route = exec("ip", &["route", "get", "8.8.8.8"], Privilege::User).await?;
    route
        .split_whitespace()
        .skip_while(|&w| w != "dev")
        .nth(1)
        .map(String::from)
        .ok_or(NetworkError::NoDefaultInterface(route))
}

// ---------------------------------------------------------------------------
// Setup / teardown sequences
// ---------------------------------------------------------------------------

async fn create_namespace(alloc: &NetworkAlloc) -> Result<()> {
    let ns = &alloc.netns;
    let tap_with_prefix = format!("{}/{}", alloc.host_ip, alloc.prefix_len);

    ip(&["netns", "add", ns]).await?;
    exec(
        "ip",
        &["netns", "exec", ns, "ip", "tuntap", "add", &alloc.tap_device, "mode", "tap"],
        Privilege::Sudo,
    )
    .await?;
    ip_netns(ns, &["addr", "add", &tap_with_prefix, "dev", &alloc.tap_device]).await?;
    ip_netns(ns, &["link", "set", &alloc.tap_device, "up"]).await?;
    ip_netns(ns, &["link", "set", "lo", "up"]).await?;
    Ok(())
}

async fn create_veth(alloc: &NetworkAlloc) -> Result<()> {
    let ns = &alloc.netns;
    let ns_ip = format!("{}/{}", alloc.veth_ns_ip, 30);
    let host_ip = format!("{}/{}", alloc.veth_host_ip, 30);

    ip(&[
        "link", "add", &alloc.host_device, "type", "veth", "peer", "name", PEER_DEVICE, "netns", ns,
    ])
    .await?;
    ip_netns(ns, &["addr", "add", &ns_ip, "dev", PEER_DEVICE]).await?;
    ip_netns(ns, &["link", "set", PEER_DEVICE, "up"]).await?;
    ip(&["addr", "add", &host_ip, "dev", &alloc.host_device]).await?;
    ip(&["link", "set", &alloc.host_device, "up"]).await?;
    Ok(())
}

async fn configure_routing(alloc: &NetworkAlloc) -> Result<()> {
    let ns = &alloc.netns;
    let guest_subnet = format!("{}/{}", alloc.host_ip, alloc.prefix_len);

    ip_netns(ns, &["route", "add", "default", "via", &alloc.veth_host_ip]).await?;
    // Guest traffic leaves the namespace with the veth peer as its source.
    exec(
        "ip",
        &[
            "netns", "exec", ns, "iptables", "-t", "nat", "-A", "POSTROUTING", "-s", &guest_subnet,
            "-o", PEER_DEVICE, "-j", "MASQUERADE",
        ],
        Privilege::Sudo,
    )
    .await?;
    exec(
        "ip",
        &["netns", "exec", ns, "sysctl", "-w", "net.ipv4.ip_forward=1"],
        Privilege::Sudo,
    )
    .await?;
    Ok(())
}

async fn configure_host_nat(alloc: &NetworkAlloc, default_iface: &str) -> Result<()> {
    let src = format!("{}/32", alloc.veth_ns_ip);
    iptables_tagged(
        &alloc.netns,
        &["-t", "nat", "-A", "POSTROUTING", "-s", &src, "-o", default_iface, "-j", "MASQUERADE"],
    )
    .await?;
    iptables_tagged(
        &alloc.netns,
        &["-A", "FORWARD", "-i", &alloc.host_device, "-o", default_iface, "-j", "ACCEPT"],
    )
    .await?;
    iptables_tagged(
        &alloc.netns,
        &[
            "-A", "FORWARD", "-i", default_iface, "-o", &alloc.host_device, "-m", "state",
            "--state", "RELATED,ESTABLISHED", "-j", "ACCEPT",
        ],
    )
    .await?;
    Ok(())
}

/// Redirect this VM's outbound HTTP/HTTPS to the host proxy port and drop
/// direct access to the metadata and loopback ranges. Rules share the VM's
/// comment tag, so [`NetworkAllocator::release`] removes them with the rest.
pub async fn redirect_through_proxy(alloc: &NetworkAlloc, proxy_port: u16) -> Result<()> {
    let src = format!("{}/32", alloc.veth_ns_ip);
    let port = proxy_port.to_string();

    for dport in ["80", "443"] {
        iptables_tagged(
            &alloc.netns,
            &[
                "-t", "nat", "-A", "PREROUTING", "-s", &src, "-p", "tcp", "--dport", dport, "-j",
                "REDIRECT", "--to-port", &port,
            ],
        )
        .await?;
    }
    for range in ["169.254.0.0/16", "127.0.0.0/8"] {
        iptables_tagged(
            &alloc.netns,
            &["-A", "FORWARD", "-s", &src, "-d", range, "-j", "DROP"],
        )
        .await?;
    }
    Ok(())
}

/// Delete host iptables rules carrying `tag` from the nat and filter tables.
async fn delete_rules_by_tag(tag: &str) {
    for table in ["nat", "filter"] {
        let listing = match exec("iptables-save", &["-t", table], Privilege::Sudo).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(table, error = %e, "cannot list iptables rules for cleanup");
                continue;
            }
        };
        // Sequential: the xtables lock serialises same-table writes anyway.
        // iptables-save may quote comment values; tags never contain spaces,
        // so stripping quotes keeps the rule splittable.
        for line in listing
            .lines()
            .filter(|l| l.starts_with("-A ") && l.contains(tag))
        {
            let rule = line.replacen("-A ", "", 1).replace('"', "");
            let mut args = vec!["-t", table, "-D"];
            args.extend(rule.split_whitespace());
            exec_ignore_errors("iptables", &args, Privilege::Sudo).await;
        }
    }
}

async fn delete_namespace_resources(alloc: &NetworkAlloc) {
    delete_rules_by_tag(&alloc.netns).await;
    exec_ignore_errors("ip", &["link", "del", &alloc.host_device], Privilege::Sudo).await;
    exec_ignore_errors("ip", &["netns", "del", &alloc.netns], Privilege::Sudo).await;
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

struct Slots {
    used: Vec<bool>,
    default_iface: String,
}

/// Hands out and revokes per-VM network identities.
///
/// The slot bitmap and all privileged mutations of the host networking
/// tables are guarded by one mutex: the kernel state is single-writer.
pub struct NetworkAllocator {
    slots: Mutex<Slots>,
    capacity: usize,
}

impl NetworkAllocator {
    /// Initialise the allocator: enable IP forwarding, sweep orphans from a
    /// previous process, detect the default interface.
    pub async fn new(capacity: usize) -> Result<Self> {
        let capacity = capacity.clamp(1, MAX_SLOTS);

        exec("sysctl", &["-w", "net.ipv4.ip_forward=1"], Privilege::Sudo).await?;
        cleanup_orphans().await;
        let default_iface = default_interface().await?;

        info!(capacity, iface = %default_iface, "network allocator ready");
        Ok(Self {
            slots: Mutex::new(Slots {
                used: vec![false; capacity],
                default_iface,
            }),
            capacity,
        })
    }

    /// Allocate the lowest free slot and build its namespace, TAP, veth,
    /// and NAT rules. Partially created resources are torn down before an
    /// error is returned, and the slot is freed again.
    pub async fn allocate(&self) -> Result<NetworkAlloc> {
        let mut slots = self.slots.lock().await;

        let Some(index) = slots.used.iter().position(|used| !used) else {
            return Err(NetworkError::Exhausted);
        };
        if let Some(slot) = slots.used.get_mut(index) {
            *slot = true;
        }
        let alloc = derive_alloc(index as u8);
        let default_iface = slots.default_iface.clone();

        info!(ns = %alloc.netns, guest_ip = %alloc.guest_ip, "allocating network slot");

        let result = async {
            create_namespace(&alloc).await?;
            create_veth(&alloc).await?;
            configure_routing(&alloc).await?;
            configure_host_nat(&alloc, &default_iface).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            error!(ns = %alloc.netns, error = %e, "allocation failed, rolling back");
            delete_namespace_resources(&alloc).await;
            if let Some(slot) = slots.used.get_mut(index) {
                *slot = false;
            }
            return Err(e);
        }

        Ok(alloc)
    }

    /// Tear down everything tied to `alloc`. Idempotent and safe on a
    /// partially allocated identity.
    pub async fn release(&self, alloc: &NetworkAlloc) {
        let mut slots = self.slots.lock().await;
        delete_namespace_resources(alloc).await;
        if let Some(slot) = slots.used.get_mut(usize::from(alloc.index)) {
            *slot = false;
        }
        info!(ns = %alloc.netns, "network slot released");
    }

    /// Number of slots this allocator manages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Delete any namespace (and its tagged rules and veth) left behind by a
/// previous process.
pub async fn cleanup_orphans() {
    delete_rules_by_tag(NS_PREFIX).await;

    let Ok(listing) = exec("ip", &["netns", "list"], Privilege::Sudo).await else {
        error!("cannot list network namespaces for orphan cleanup");
        return;
    };
    let orphans: Vec<String> = listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|name| name.starts_with(NS_PREFIX))
        .map(String::from)
        .collect();

    if orphans.is_empty() {
        return;
    }
    info!(count = orphans.len(), "cleaning up orphaned namespaces");
    for name in orphans {
        if let Some(hex) = name.strip_prefix(NS_PREFIX)
            && let Ok(index) = u8::from_str_radix(hex, 16)
        {
            delete_namespace_resources(&derive_alloc(index)).await;
        }
    }
}
