//! Shared host bridge reconciliation.
//!
//! The bridge is shared by every container on the network and nobody owns
//! it, so there is no lock: observe what the kernel has, converge only when
//! something is missing, and refuse anything that contradicts the request.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::netlink::{Link, Netlink, NetlinkError};

/// First usable address of the network `assigned` belongs to.
///
/// Every container on a network must agree on this, so it depends on
/// nothing but the network itself.
pub fn gateway_for(assigned: IpNetwork) -> IpAddr {
    match assigned {
        IpNetwork::V4(net) => {
            IpAddr::V4(Ipv4Addr::from(u32::from(net.network()).wrapping_add(1)))
        }
        IpNetwork::V6(net) => {
            IpAddr::V6(Ipv6Addr::from(u128::from(net.network()).wrapping_add(1)))
        }
    }
}

/// Make sure a bridge called `name` exists, is up and, if `addr` is given,
/// carries exactly that address.
///
/// Losing a creation race to a concurrent invocation is not an error; the
/// bridge it created is validated like any other pre-existing one.
pub async fn ensure_bridge<K: Netlink>(
    kernel: &K,
    name: &str,
    addr: Option<IpNetwork>,
) -> Result<Link> {
    let br = match lookup(kernel, name).await? {
        Some(link) => link,
        None => {
            match kernel.add_bridge(name).await {
                Ok(()) => info!(bridge = name, "created bridge"),
                Err(NetlinkError::Exists) => {
                    debug!(bridge = name, "bridge created concurrently, validating it")
                }
                Err(e) => return Err(Error::kernel(format!("could not add {:?}", name), e)),
            }
            lookup(kernel, name).await?.ok_or_else(|| {
                Error::kernel(
                    format!("could not lookup {:?}", name),
                    NetlinkError::NoDevice(name.to_string()),
                )
            })?
        }
    };

    if !br.is_bridge() {
        return Err(Error::Conflict(format!(
            "{:?} already exists but is not a bridge",
            name
        )));
    }

    if let Some(addr) = addr {
        ensure_bridge_addr(kernel, name, addr).await?;
    }

    if !br.up {
        kernel
            .set_up(name)
            .await
            .map_err(|e| Error::kernel(format!("could not set {:?} up", name), e))?;
    }

    Ok(br)
}

async fn lookup<K: Netlink>(kernel: &K, name: &str) -> Result<Option<Link>> {
    kernel
        .link(name)
        .await
        .map_err(|e| Error::kernel(format!("could not lookup {:?}", name), e))
}

/// Addresses of the bridge in the same family as `want`.
async fn family_addrs<K: Netlink>(kernel: &K, name: &str, want: IpNetwork) -> Result<Vec<IpNetwork>> {
    let addrs = kernel
        .addrs(name)
        .await
        .map_err(|e| Error::kernel(format!("could not list addresses of {:?}", name), e))?;
    Ok(addrs
        .into_iter()
        .filter(|a| a.is_ipv4() == want.is_ipv4())
        .collect())
}

fn check_addrs(name: &str, existing: &[IpNetwork], want: IpNetwork) -> Result<()> {
    // Address and prefix must both match.
    if existing.iter().any(|a| a.to_string() == want.to_string()) {
        return Ok(());
    }
    Err(Error::Conflict(format!(
        "{:?} already has an IP address different from {}",
        name, want
    )))
}

async fn ensure_bridge_addr<K: Netlink>(kernel: &K, name: &str, want: IpNetwork) -> Result<()> {
    let existing = family_addrs(kernel, name, want).await?;
    if !existing.is_empty() {
        return check_addrs(name, &existing, want);
    }

    match kernel.add_addr(name, want).await {
        Ok(()) => {
            info!(bridge = name, addr = %want, "assigned bridge address");
            Ok(())
        }
        Err(NetlinkError::Exists) => {
            let existing = family_addrs(kernel, name, want).await?;
            check_addrs(name, &existing, want)
        }
        Err(e) => Err(Error::kernel(
            format!("could not add IP address to {:?}", name),
            e,
        )),
    }
}
