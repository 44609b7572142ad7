use std::path::Path;

use ipnetwork::IpNetwork;
use tracing::{debug, info, warn};

use crate::config::NetConf;
use crate::error::{Error, Result};
use crate::ipam::AddressDelegate;
use crate::netlink::{Netlink, NetlinkError};
use crate::netns::{with_netns, Namespaces};
use crate::types::{AddressAssignment, CmdArgs, IfConfig};

pub mod bridge;
pub mod veth;

pub use bridge::{ensure_bridge, gateway_for};
pub use veth::{host_veth_name, setup_veth};

/// How the host end of the pair is connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// Host ends are enslaved to a shared bridge.
    Bridge { name: String },
    /// Host end gets the gateway address and a route to the container.
    PointToPoint,
}

/// Attachment engine shared by the bridge and veth plugins
pub struct NetPlugin<K, S, D> {
    /// Network configuration
    config: NetConf,
    /// Command arguments
    args: CmdArgs,
    topology: Topology,
    kernel: K,
    namespaces: S,
    ipam: D,
}

impl<K, S, D> NetPlugin<K, S, D>
where
    K: Netlink,
    S: Namespaces,
    D: AddressDelegate,
{
    pub fn new(
        config: NetConf,
        args: CmdArgs,
        topology: Topology,
        kernel: K,
        namespaces: S,
        ipam: D,
    ) -> Self {
        Self {
            config,
            args,
            topology,
            kernel,
            namespaces,
            ipam,
        }
    }

    /// Attach the container to the network
    pub async fn add_network(&self) -> Result<IfConfig> {
        // Nothing has been created yet if this fails.
        let assignment = self.ipam.assign(&self.config).await?;
        info!(
            container = %self.args.container_id,
            ip = %assignment.ip,
            "address assigned"
        );

        let bridge = match &self.topology {
            Topology::Bridge { name } => {
                let gw = if self.config.is_gw {
                    Some(self.gateway_net(&assignment)?)
                } else {
                    None
                };
                ensure_bridge(&self.kernel, name, gw)
                    .await
                    .map_err(|e| match e {
                        Error::Kernel { op, source } => Error::Kernel {
                            op: format!("failed to create bridge {:?}: {}", name, op),
                            source,
                        },
                        e => e,
                    })?;
                Some(name.as_str())
            }
            Topology::PointToPoint => None,
        };

        let seed = format!("{}{}", self.args.container_id, self.args.ifname);
        let host_name = host_veth_name(&seed);

        setup_veth(
            &self.kernel,
            &self.namespaces,
            Path::new(&self.args.netns),
            &self.args.ifname,
            &host_name,
            self.config.mtu,
            &assignment,
        )
        .await?;

        if let Err(e) = self.attach_host_end(&host_name, bridge, &assignment).await {
            if !veth::remove_pair(&self.kernel, &host_name).await {
                self.remove_container_end().await;
            }
            return Err(e);
        }

        Ok(IfConfig {
            ip: assignment.ip.ip(),
        })
    }

    /// Detach the container from the network
    pub async fn del_network(&self) -> Result<()> {
        let ifname = self.args.ifname.as_str();
        let kernel = &self.kernel;

        let deleted = with_netns(&self.namespaces, Path::new(&self.args.netns), |_| async move {
            match kernel.del_link(ifname).await {
                Ok(()) => {
                    info!(ifname, "deleted container interface");
                    Ok(())
                }
                Err(NetlinkError::NoDevice(_)) => {
                    debug!(ifname, "container interface already gone");
                    Ok(())
                }
                Err(e) => Err(Error::kernel(format!("failed to delete {:?}", ifname), e)),
            }
        })
        .await;

        match deleted {
            Err(e) if e.is_missing_namespace(Path::new(&self.args.netns)) => {
                info!(netns = %self.args.netns, "network namespace already gone");
                Ok(())
            }
            other => other,
        }
    }

    /// Delete the pair from the container side when the host end could not
    /// be found.
    async fn remove_container_end(&self) {
        let ifname = self.args.ifname.as_str();
        let kernel = &self.kernel;
        let removed = with_netns(&self.namespaces, Path::new(&self.args.netns), |_| async move {
            Ok(veth::remove_pair(kernel, ifname).await)
        })
        .await;
        if let Err(e) = removed {
            warn!(ifname, error = %e, "failed to enter namespace to remove veth pair");
        }
    }

    /// Gateway address with the assignment's prefix, for the bridge.
    fn gateway_net(&self, assignment: &AddressAssignment) -> Result<IpNetwork> {
        let gw = assignment
            .gateway
            .unwrap_or_else(|| gateway_for(assignment.ip));
        IpNetwork::new(gw, assignment.ip.prefix())
            .map_err(|e| Error::config(format!("invalid gateway {}: {}", gw, e)))
    }

    async fn attach_host_end(
        &self,
        host_name: &str,
        bridge: Option<&str>,
        assignment: &AddressAssignment,
    ) -> Result<()> {
        // Re-resolve: the index changed when the link moved namespaces.
        let host = self
            .kernel
            .link(host_name)
            .await
            .map_err(|e| Error::kernel(format!("failed to lookup {:?}", host_name), e))?
            .ok_or_else(|| {
                Error::kernel(
                    format!("failed to lookup {:?}", host_name),
                    NetlinkError::NoDevice(host_name.to_string()),
                )
            })?;

        self.kernel
            .set_up(&host.name)
            .await
            .map_err(|e| Error::kernel(format!("failed to set {:?} up", host.name), e))?;

        match bridge {
            Some(br) => {
                self.kernel.set_master(&host.name, br).await.map_err(|e| {
                    Error::kernel(
                        format!("failed to connect {:?} to bridge {}", host.name, br),
                        e,
                    )
                })?;
                info!(host = %host.name, bridge = br, "connected veth to bridge");
            }
            None => {
                let gw = assignment
                    .gateway
                    .unwrap_or_else(|| gateway_for(assignment.ip));
                let local = veth::point_to_point_net(gw)?;
                self.kernel
                    .add_addr(&host.name, local)
                    .await
                    .map_err(|e| Error::kernel("failed to add IP addr to veth", e))?;

                let dst = veth::host_net(assignment.ip.ip());
                veth::add_route_idempotent(&self.kernel, dst, None, &host.name).await?;
                info!(host = %host.name, addr = %local, route = %dst, "configured point-to-point link");
            }
        }
        Ok(())
    }
}
