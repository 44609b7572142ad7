// In-memory stand-ins for the kernel, namespaces and IPAM plugin.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use ipnetwork::IpNetwork;
use podlink::config::NetConf;
use podlink::ipam::AddressDelegate;
use podlink::netlink::{Link, Netlink, NetlinkError};
use podlink::netns::{NamespaceGuard, Namespaces};
use podlink::types::{AddressAssignment, CmdArgs, ContainerId};
use podlink::{Error, Result};

pub const HOST_NS: &str = "/proc/1/ns/net";

#[derive(Debug, Clone, PartialEq)]
pub struct FakeLink {
    pub index: u32,
    pub kind: Option<String>,
    pub up: bool,
    pub master: Option<String>,
    pub addrs: Vec<IpNetwork>,
    /// Namespace and name of the other end of a veth pair
    pub peer: Option<(PathBuf, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeNs {
    pub links: BTreeMap<String, FakeLink>,
    pub routes: Vec<(IpNetwork, Option<IpAddr>, String)>,
}

#[derive(Debug)]
struct State {
    current: PathBuf,
    namespaces: HashMap<PathBuf, FakeNs>,
    next_index: u32,
    fail_on: Option<&'static str>,
    /// Bridge another "process" creates right before our add_bridge
    concurrent_bridge: Option<(String, Vec<IpNetwork>)>,
    mutations: Vec<String>,
    entered: Vec<PathBuf>,
    /// The calling thread's own namespace can no longer be opened
    origin_missing: bool,
    /// Links moved between namespaces disappear instead of arriving
    lose_moved_links: bool,
}

/// A fake kernel with several namespaces; the "calling thread" starts in
/// [`HOST_NS`].
#[derive(Debug, Clone)]
pub struct FakeKernel(Rc<RefCell<State>>);

impl FakeKernel {
    pub fn new() -> Self {
        let mut namespaces = HashMap::new();
        namespaces.insert(PathBuf::from(HOST_NS), FakeNs::default());
        Self(Rc::new(RefCell::new(State {
            current: PathBuf::from(HOST_NS),
            namespaces,
            next_index: 2,
            fail_on: None,
            concurrent_bridge: None,
            mutations: Vec::new(),
            entered: Vec::new(),
            origin_missing: false,
            lose_moved_links: false,
        })))
    }

    pub fn with_namespace(self, path: &str) -> Self {
        self.0
            .borrow_mut()
            .namespaces
            .insert(PathBuf::from(path), FakeNs::default());
        self
    }

    /// Make the named operation fail with a generic kernel error.
    pub fn fail_on(&self, op: &'static str) {
        self.0.borrow_mut().fail_on = Some(op);
    }

    pub fn lose_origin_namespace(&self) {
        self.0.borrow_mut().origin_missing = true;
    }

    pub fn lose_moved_links(&self) {
        self.0.borrow_mut().lose_moved_links = true;
    }

    pub fn race_bridge_creation(&self, name: &str, addrs: Vec<IpNetwork>) {
        self.0.borrow_mut().concurrent_bridge = Some((name.to_string(), addrs));
    }

    /// Put a link straight into a namespace, bypassing the recorded calls.
    pub fn seed_link(&self, ns: &str, name: &str, kind: &str, addrs: Vec<IpNetwork>) {
        let mut st = self.0.borrow_mut();
        let index = st.next_index;
        st.next_index += 1;
        st.namespaces.get_mut(Path::new(ns)).expect("namespace").links.insert(
            name.to_string(),
            FakeLink {
                index,
                kind: Some(kind.to_string()),
                up: false,
                master: None,
                addrs,
                peer: None,
            },
        );
    }

    pub fn ns(&self, path: &str) -> FakeNs {
        self.0.borrow().namespaces[Path::new(path)].clone()
    }

    pub fn link_in(&self, ns: &str, name: &str) -> Option<FakeLink> {
        self.ns(ns).links.get(name).cloned()
    }

    pub fn current(&self) -> PathBuf {
        self.0.borrow().current.clone()
    }

    pub fn mutations(&self) -> Vec<String> {
        self.0.borrow().mutations.clone()
    }

    pub fn entered(&self) -> Vec<PathBuf> {
        self.0.borrow().entered.clone()
    }

    fn begin(&self, op: &'static str, detail: String) -> std::result::Result<(), NetlinkError> {
        let mut st = self.0.borrow_mut();
        if st.fail_on == Some(op) {
            return Err(NetlinkError::Command {
                command: format!("{} {}", op, detail),
                stderr: "RTNETLINK answers: Operation not permitted".to_string(),
            });
        }
        Ok(())
    }

    fn record(&self, op: &str, detail: &str) {
        self.0
            .borrow_mut()
            .mutations
            .push(format!("{} {}", op, detail));
    }

    fn with_current<T>(&self, f: impl FnOnce(&mut FakeNs) -> T) -> T {
        let mut st = self.0.borrow_mut();
        let current = st.current.clone();
        f(st.namespaces.get_mut(&current).expect("current namespace"))
    }
}

impl Netlink for FakeKernel {
    async fn link(&self, name: &str) -> std::result::Result<Option<Link>, NetlinkError> {
        self.begin("link", name.to_string())?;
        Ok(self.with_current(|ns| {
            ns.links.get(name).map(|l| Link {
                index: l.index,
                name: name.to_string(),
                kind: l.kind.clone(),
                master: l.master.clone(),
                up: l.up,
            })
        }))
    }

    async fn add_bridge(&self, name: &str) -> std::result::Result<(), NetlinkError> {
        self.begin("add_bridge", name.to_string())?;
        let raced = self.0.borrow_mut().concurrent_bridge.take();
        if let Some((br, addrs)) = raced {
            let current = self.current();
            self.seed_link(current.to_str().unwrap(), &br, "bridge", addrs);
        }
        if self.with_current(|ns| ns.links.contains_key(name)) {
            return Err(NetlinkError::Exists);
        }
        self.record("add_bridge", name);
        let index = {
            let mut st = self.0.borrow_mut();
            st.next_index += 1;
            st.next_index
        };
        self.with_current(|ns| {
            ns.links.insert(
                name.to_string(),
                FakeLink {
                    index,
                    kind: Some("bridge".to_string()),
                    up: false,
                    master: None,
                    addrs: Vec::new(),
                    peer: None,
                },
            )
        });
        Ok(())
    }

    async fn set_up(&self, name: &str) -> std::result::Result<(), NetlinkError> {
        self.begin("set_up", name.to_string())?;
        self.record("set_up", name);
        self.with_current(|ns| match ns.links.get_mut(name) {
            Some(l) => {
                l.up = true;
                Ok(())
            }
            None => Err(NetlinkError::NoDevice(name.to_string())),
        })
    }

    async fn set_master(&self, name: &str, master: &str) -> std::result::Result<(), NetlinkError> {
        self.begin("set_master", name.to_string())?;
        self.record("set_master", name);
        self.with_current(|ns| {
            if !ns.links.contains_key(master) {
                return Err(NetlinkError::NoDevice(master.to_string()));
            }
            match ns.links.get_mut(name) {
                Some(l) => {
                    l.master = Some(master.to_string());
                    Ok(())
                }
                None => Err(NetlinkError::NoDevice(name.to_string())),
            }
        })
    }

    async fn addrs(&self, name: &str) -> std::result::Result<Vec<IpNetwork>, NetlinkError> {
        self.begin("addrs", name.to_string())?;
        self.with_current(|ns| {
            ns.links
                .get(name)
                .map(|l| l.addrs.clone())
                .ok_or_else(|| NetlinkError::NoDevice(name.to_string()))
        })
    }

    async fn add_addr(&self, name: &str, addr: IpNetwork) -> std::result::Result<(), NetlinkError> {
        self.begin("add_addr", name.to_string())?;
        self.record("add_addr", name);
        self.with_current(|ns| match ns.links.get_mut(name) {
            Some(l) if l.addrs.contains(&addr) => Err(NetlinkError::Exists),
            Some(l) => {
                l.addrs.push(addr);
                Ok(())
            }
            None => Err(NetlinkError::NoDevice(name.to_string())),
        })
    }

    async fn add_veth(
        &self,
        name: &str,
        peer: &str,
        _mtu: Option<u32>,
    ) -> std::result::Result<(), NetlinkError> {
        self.begin("add_veth", name.to_string())?;
        let current = self.current();
        if self.with_current(|ns| ns.links.contains_key(name) || ns.links.contains_key(peer)) {
            return Err(NetlinkError::Exists);
        }
        self.record("add_veth", name);
        let (a, b) = {
            let mut st = self.0.borrow_mut();
            st.next_index += 2;
            (st.next_index - 1, st.next_index)
        };
        self.with_current(|ns| {
            for (index, this, other) in [(a, name, peer), (b, peer, name)] {
                ns.links.insert(
                    this.to_string(),
                    FakeLink {
                        index,
                        kind: Some("veth".to_string()),
                        up: false,
                        master: None,
                        addrs: Vec::new(),
                        peer: Some((current.clone(), other.to_string())),
                    },
                );
            }
        });
        Ok(())
    }

    async fn set_netns(&self, name: &str, netns: &Path) -> std::result::Result<(), NetlinkError> {
        self.begin("set_netns", name.to_string())?;
        self.record("set_netns", name);
        let current = self.current();
        let mut st = self.0.borrow_mut();
        if !st.namespaces.contains_key(netns) {
            return Err(NetlinkError::Command {
                command: format!("set_netns {}", name),
                stderr: "Invalid \"netns\" value".to_string(),
            });
        }
        let mut link = st
            .namespaces
            .get_mut(&current)
            .and_then(|ns| ns.links.remove(name))
            .ok_or_else(|| NetlinkError::NoDevice(name.to_string()))?;
        // Moving a link brings it down and gives it a new index.
        link.up = false;
        link.master = None;
        link.index += 100;
        if st.lose_moved_links {
            return Ok(());
        }
        if let Some((peer_ns, peer_name)) = link.peer.clone() {
            if let Some(peer) = st
                .namespaces
                .get_mut(&peer_ns)
                .and_then(|ns| ns.links.get_mut(&peer_name))
            {
                peer.peer = Some((netns.to_path_buf(), name.to_string()));
            }
        }
        st.namespaces
            .get_mut(netns)
            .expect("target namespace")
            .links
            .insert(name.to_string(), link);
        Ok(())
    }

    async fn add_route(
        &self,
        dst: IpNetwork,
        gw: Option<IpAddr>,
        dev: &str,
    ) -> std::result::Result<(), NetlinkError> {
        self.begin("add_route", dst.to_string())?;
        self.with_current(|ns| {
            if !ns.links.contains_key(dev) {
                return Err(NetlinkError::NoDevice(dev.to_string()));
            }
            if ns.routes.iter().any(|(d, _, _)| *d == dst) {
                return Err(NetlinkError::Exists);
            }
            ns.routes.push((dst, gw, dev.to_string()));
            Ok(())
        })?;
        self.record("add_route", &dst.to_string());
        Ok(())
    }

    async fn del_link(&self, name: &str) -> std::result::Result<(), NetlinkError> {
        self.begin("del_link", name.to_string())?;
        let current = self.current();
        let mut st = self.0.borrow_mut();
        let link = st
            .namespaces
            .get_mut(&current)
            .and_then(|ns| ns.links.remove(name))
            .ok_or_else(|| NetlinkError::NoDevice(name.to_string()))?;
        st.mutations.push(format!("del_link {}", name));
        for ns in st.namespaces.values_mut() {
            ns.routes.retain(|(_, _, dev)| dev != name);
        }
        if let Some((peer_ns, peer_name)) = link.peer {
            if let Some(ns) = st.namespaces.get_mut(&peer_ns) {
                ns.links.remove(&peer_name);
                ns.routes.retain(|(_, _, dev)| *dev != peer_name);
            }
        }
        Ok(())
    }
}

pub struct FakeGuard {
    kernel: FakeKernel,
    origin: PathBuf,
}

impl NamespaceGuard for FakeGuard {
    fn origin(&self) -> PathBuf {
        self.origin.clone()
    }
}

impl Drop for FakeGuard {
    fn drop(&mut self) {
        self.kernel.0.borrow_mut().current = self.origin.clone();
    }
}

impl Namespaces for FakeKernel {
    type Guard = FakeGuard;

    fn enter(&self, target: &Path) -> Result<FakeGuard> {
        let mut st = self.0.borrow_mut();
        if st.origin_missing {
            return Err(Error::Namespace {
                path: st.current.clone(),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }
        if !st.namespaces.contains_key(target) {
            return Err(Error::Namespace {
                path: target.to_path_buf(),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }
        let origin = std::mem::replace(&mut st.current, target.to_path_buf());
        st.entered.push(target.to_path_buf());
        Ok(FakeGuard {
            kernel: self.clone(),
            origin,
        })
    }
}

/// IPAM stand-in returning a canned answer.
pub struct StubDelegate {
    answer: std::result::Result<AddressAssignment, String>,
    pub calls: Cell<usize>,
}

impl StubDelegate {
    pub fn returning(ip: &str) -> Self {
        Self::with(AddressAssignment::new(ip.parse().expect("cidr")))
    }

    pub fn with(assignment: AddressAssignment) -> Self {
        Self {
            answer: Ok(assignment),
            calls: Cell::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            answer: Err(reason.to_string()),
            calls: Cell::new(0),
        }
    }
}

impl AddressDelegate for StubDelegate {
    async fn assign(&self, conf: &NetConf) -> Result<AddressAssignment> {
        self.calls.set(self.calls.get() + 1);
        self.answer.clone().map_err(|reason| Error::Delegate {
            plugin: conf.ipam.ipam_type.clone(),
            reason,
        })
    }
}

pub fn cmd_args(container_id: &str, netns: &str, ifname: &str, conf: &str) -> CmdArgs {
    CmdArgs {
        container_id: ContainerId::parse(container_id).expect("container id"),
        netns: netns.to_string(),
        ifname: ifname.to_string(),
        args: HashMap::new(),
        path: "/opt/cni/bin".to_string(),
        stdin_data: conf.as_bytes().to_vec(),
    }
}

pub fn net_conf(json: &str) -> NetConf {
    NetConf::parse(json.as_bytes()).expect("valid network config")
}
