//! Veth pair setup across the container/host namespace boundary.

use std::net::IpAddr;
use std::path::Path;

use ipnetwork::IpNetwork;
use ring::digest::{digest, SHA256};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::netlink::{Netlink, NetlinkError};
use crate::netns::{with_netns, Namespaces};
use crate::types::AddressAssignment;

/// Host end name for a pair, derived from `seed` so that concurrent
/// invocations never pick the same one. 12 bytes, within IFNAMSIZ.
pub fn host_veth_name(seed: &str) -> String {
    let hash = digest(&SHA256, seed.as_bytes());
    let suffix: String = hash.as_ref()[..4]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("veth{}", suffix)
}

/// Single-address network for `addr` (/32 or /128).
pub(crate) fn host_net(addr: IpAddr) -> IpNetwork {
    IpNetwork::from(addr)
}

/// Two-address point-to-point network for `addr` (/31 or /127).
pub(crate) fn point_to_point_net(addr: IpAddr) -> Result<IpNetwork> {
    let prefix = if addr.is_ipv4() { 31 } else { 127 };
    IpNetwork::new(addr, prefix)
        .map_err(|e| Error::config(format!("invalid point-to-point address {}: {}", addr, e)))
}

/// Delete one end of a pair, taking the other with it. Failures are only
/// logged so they never hide the error that triggered the cleanup.
/// Returns whether the pair was removed.
pub(crate) async fn remove_pair<K: Netlink>(kernel: &K, name: &str) -> bool {
    match kernel.del_link(name).await {
        Ok(()) => {
            debug!(link = name, "removed partially configured veth pair");
            true
        }
        Err(NetlinkError::NoDevice(_)) => {
            debug!(link = name, "veth pair end not found, nothing removed");
            false
        }
        Err(e) => {
            warn!(link = name, error = %e, "failed to remove veth pair");
            false
        }
    }
}

pub(crate) async fn add_route_idempotent<K: Netlink>(
    kernel: &K,
    dst: IpNetwork,
    gw: Option<IpAddr>,
    dev: &str,
) -> Result<()> {
    match kernel.add_route(dst, gw, dev).await {
        Ok(()) => Ok(()),
        Err(NetlinkError::Exists) => {
            debug!(%dst, dev, "route already present");
            Ok(())
        }
        Err(e) => Err(Error::kernel(
            format!("failed to add route {} via {}", dst, dev),
            e,
        )),
    }
}

/// Give the container end its address and routes. Route gateways default
/// to the assignment's gateway.
async fn apply_ip_config<K: Netlink>(
    kernel: &K,
    ifname: &str,
    assignment: &AddressAssignment,
) -> Result<()> {
    kernel
        .add_addr(ifname, assignment.ip)
        .await
        .map_err(|e| Error::kernel(format!("failed to add IP addr to {:?}", ifname), e))?;

    for route in &assignment.routes {
        add_route_idempotent(kernel, route.dst, route.gw.or(assignment.gateway), ifname).await?;
    }
    Ok(())
}

/// Create a veth pair inside the container namespace `netns`, configure the
/// container end as `ifname` and surface the other end in the host
/// namespace under `host_name`.
///
/// On return the host end lives in the caller's namespace but is not yet up;
/// its index changed during the move, so callers must look it up by name.
pub async fn setup_veth<K, S>(
    kernel: &K,
    namespaces: &S,
    netns: &Path,
    ifname: &str,
    host_name: &str,
    mtu: Option<u32>,
    assignment: &AddressAssignment,
) -> Result<()>
where
    K: Netlink,
    S: Namespaces,
{
    with_netns(namespaces, netns, |host_ns| async move {
        kernel
            .add_veth(ifname, host_name, mtu)
            .await
            .map_err(|e| match e {
                NetlinkError::Exists => Error::Conflict(format!(
                    "{:?} or {:?} already exists in container namespace",
                    ifname, host_name
                )),
                e => Error::kernel(format!("failed to create veth pair {:?}", ifname), e),
            })?;

        let configured = async {
            kernel
                .set_netns(host_name, &host_ns)
                .await
                .map_err(|e| {
                    Error::kernel(format!("failed to move {:?} to host namespace", host_name), e)
                })?;
            kernel
                .set_up(ifname)
                .await
                .map_err(|e| Error::kernel(format!("failed to set {:?} up", ifname), e))?;
            apply_ip_config(kernel, ifname, assignment).await
        }
        .await;

        if let Err(e) = configured {
            remove_pair(kernel, ifname).await;
            return Err(e);
        }

        info!(ifname, host = host_name, "created veth pair");
        Ok(())
    })
    .await
}
