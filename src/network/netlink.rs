/*
Copyright 2022 The Kuasar Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::{
    fs::File,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    os::unix::io::AsRawFd,
};

use anyhow::anyhow;
use futures_util::{future, TryStreamExt};
use ipnetwork::IpNetwork;
use log::debug;
use netlink_packet_core::ErrorMessage;
use netlink_packet_route::{
    address::AddressMessage,
    link::{LinkAttribute, LinkFlag, LinkMessage},
    route::{RouteAddress, RouteAttribute, RouteMessage, RouteProtocol, RouteScope, RouteType},
    AddressFamily,
};
use nix::{
    errno::Errno,
    sched::{setns, CloneFlags},
};
use rtnetlink::{new_connection, Handle, LinkSetRequest};
use tokio::{
    runtime::{Builder, Runtime},
    task::spawn_blocking,
};

use crate::types::Route;

/// A route resolved from its string form, ready for the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub dest: IpNetwork,
    pub gw: Option<IpAddr>,
    pub src: Option<IpAddr>,
    pub dev: String,
}

fn parse_addr(kind: &str, s: &str) -> anyhow::Result<Option<IpAddr>> {
    if s.is_empty() {
        return Ok(None);
    }
    s.parse()
        .map(Some)
        .map_err(|e| anyhow!("invalid {} {}, {}", kind, s, e))
}

impl RouteSpec {
    /// An empty or `default` destination is the default route of the family
    /// the gateway or source address belongs to.
    pub fn from_route(route: &Route) -> anyhow::Result<Self> {
        if route.src.is_empty() && route.gw.is_empty() && route.dev.is_empty() {
            return Err(anyhow!("one of src, gw, dev should not be empty"));
        }
        let gw = parse_addr("gateway", &route.gw)?;
        let src = parse_addr("source", &route.src)?;
        let dest = match route.dest.as_str() {
            "" | "default" => {
                let v6 = matches!(gw.or(src), Some(IpAddr::V6(_)));
                let any = if v6 {
                    IpAddr::V6(Ipv6Addr::UNSPECIFIED)
                } else {
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
                };
                IpNetwork::new(any, 0).map_err(|e| anyhow!("invalid default route, {}", e))?
            }
            d => super::parse_ip_net(d)?,
        };
        for addr in [gw, src].into_iter().flatten() {
            if addr.is_ipv4() != dest.is_ipv4() {
                return Err(anyhow!(
                    "address {} and destination {} are of different families",
                    addr,
                    dest
                ));
            }
        }
        Ok(Self {
            dest,
            gw,
            src,
            dev: route.dev.clone(),
        })
    }
}

fn errno_of(msg: &ErrorMessage) -> Option<Errno> {
    msg.code.map(|c| Errno::from_i32(c.get().abs()))
}

fn is_errno(e: &rtnetlink::Error, errno: Errno) -> bool {
    matches!(e, rtnetlink::Error::NetlinkError(msg) if errno_of(msg) == Some(errno))
}

/// Runs `f` on a blocking thread that sits in the network namespace at `ns_path`.
async fn run_in_netns<F, T>(ns_path: &str, f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let netns =
        File::open(ns_path).map_err(|e| anyhow!("failed to open netns {}, {}", ns_path, e))?;
    spawn_blocking(move || {
        let old = File::open("/proc/thread-self/ns/net")
            .map_err(|e| anyhow!("failed to open current netns, {}", e))?;
        setns(netns.as_raw_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| anyhow!("failed to enter netns, {}", e))?;
        let res = f();
        setns(old.as_raw_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| anyhow!("failed to return to netns, {}", e))?;
        res
    })
    .await
    .map_err(|e| anyhow!("failed to wait for the netns: {}", e))?
}

/// A route netlink connection bound to one network namespace. The socket is
/// served by a private current-thread runtime, every call blocks until the
/// kernel answers.
pub struct Netlink {
    rt: Runtime,
    handle: Handle,
}

impl Netlink {
    /// Connects in the namespace of the caller.
    pub fn host() -> anyhow::Result<Self> {
        Self::connect("")
    }

    pub fn in_netns(ns_path: &str) -> anyhow::Result<Self> {
        Self::connect(ns_path)
    }

    fn connect(ns_path: &str) -> anyhow::Result<Self> {
        let rt = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| anyhow!("failed to build netlink runtime, {}", e))?;
        let ns_path = ns_path.to_string();
        let handle = rt.block_on(async move {
            let (connection, handle, _) = if ns_path.is_empty() {
                new_connection()?
            } else {
                run_in_netns(&ns_path, || {
                    new_connection().map_err(|e| anyhow!("failed to open netlink socket, {}", e))
                })
                .await?
            };
            tokio::spawn(connection);
            Ok::<Handle, anyhow::Error>(handle)
        })?;
        Ok(Self { rt, handle })
    }

    pub fn find_link(&self, name: &str) -> anyhow::Result<Option<LinkMessage>> {
        self.rt.block_on(async {
            let mut links = self
                .handle
                .link()
                .get()
                .match_name(name.to_string())
                .execute();
            match links.try_next().await {
                Ok(msg) => Ok(msg),
                Err(e) if is_errno(&e, Errno::ENODEV) => Ok(None),
                Err(e) => Err(anyhow!("failed to get link {}, {}", name, e)),
            }
        })
    }

    pub fn link_exists(&self, name: &str) -> anyhow::Result<bool> {
        Ok(!name.is_empty() && self.find_link(name)?.is_some())
    }

    fn link_index(&self, name: &str) -> anyhow::Result<u32> {
        self.find_link(name)?
            .map(|l| l.header.index)
            .ok_or_else(|| anyhow!("link {} not found", name))
    }

    pub fn link_is_up(&self, name: &str) -> anyhow::Result<bool> {
        let link = self
            .find_link(name)?
            .ok_or_else(|| anyhow!("link {} not found", name))?;
        Ok(link.header.flags.contains(&LinkFlag::Up))
    }

    fn set_link<F>(&self, name: &str, what: &str, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(LinkSetRequest) -> LinkSetRequest,
    {
        let index = self.link_index(name)?;
        debug!("set {} of link {}", what, name);
        self.rt
            .block_on(f(self.handle.link().set(index)).execute())
            .map_err(|e| anyhow!("failed to set {} of {}, {}", what, name, e))
    }

    pub fn set_up(&self, name: &str, up: bool) -> anyhow::Result<()> {
        if up {
            self.set_link(name, "up", |r| r.up())
        } else {
            self.set_link(name, "down", |r| r.down())
        }
    }

    pub fn set_mtu(&self, name: &str, mtu: u32) -> anyhow::Result<()> {
        self.set_link(name, "mtu", |r| r.mtu(mtu))
    }

    pub fn set_name(&self, name: &str, new_name: &str) -> anyhow::Result<()> {
        let new_name = new_name.to_string();
        self.set_link(name, "name", |r| r.name(new_name))
    }

    pub fn set_address(&self, name: &str, mac: &[u8; 6]) -> anyhow::Result<()> {
        self.set_link(name, "hardware address", |r| r.address(mac.to_vec()))
    }

    pub fn set_txqueuelen(&self, name: &str, qlen: u32) -> anyhow::Result<()> {
        self.set_link(name, "txqueuelen", |mut r| {
            r.message_mut()
                .attributes
                .push(LinkAttribute::TxQueueLen(qlen));
            r
        })
    }

    /// Moves the link into the network namespace at `ns_path`.
    pub fn set_netns(&self, name: &str, ns_path: &str) -> anyhow::Result<()> {
        let netns =
            File::open(ns_path).map_err(|e| anyhow!("failed to open netns {}, {}", ns_path, e))?;
        let fd = netns.as_raw_fd();
        self.set_link(name, "netns", |r| r.setns_by_fd(fd))
    }

    /// Enslaves the link to the bridge named `bridge`.
    pub fn set_controller(&self, name: &str, bridge: &str) -> anyhow::Result<()> {
        let bridge_index = self.link_index(bridge)?;
        self.set_link(name, "bridge", |r| r.controller(bridge_index))
    }

    pub fn add_veth(&self, name: &str, peer: &str, qlen: u32) -> anyhow::Result<()> {
        self.rt
            .block_on(async {
                let mut req = self
                    .handle
                    .link()
                    .add()
                    .veth(name.to_string(), peer.to_string());
                req.message_mut()
                    .attributes
                    .push(LinkAttribute::TxQueueLen(qlen));
                req.execute().await
            })
            .map_err(|e| anyhow!("failed to add veth {} <-> {}, {}", name, peer, e))
    }

    pub fn del_link(&self, name: &str) -> anyhow::Result<()> {
        let index = self.link_index(name)?;
        self.rt
            .block_on(self.handle.link().del(index).execute())
            .map_err(|e| anyhow!("failed to delete link {}, {}", name, e))
    }

    /// Drops every address of one family from the link.
    pub fn flush_addresses(&self, name: &str, ipv4: bool) -> anyhow::Result<()> {
        let index = self.link_index(name)?;
        let family = if ipv4 {
            AddressFamily::Inet
        } else {
            AddressFamily::Inet6
        };
        self.rt
            .block_on(async {
                let addrs: Vec<AddressMessage> = self
                    .handle
                    .address()
                    .get()
                    .set_link_index_filter(index)
                    .execute()
                    .try_filter(|m| future::ready(m.header.family == family))
                    .try_collect()
                    .await?;
                for addr in addrs {
                    self.handle.address().del(addr).execute().await?;
                }
                Ok::<(), rtnetlink::Error>(())
            })
            .map_err(|e| anyhow!("failed to flush addresses of {}, {}", name, e))
    }

    pub fn add_address(&self, name: &str, ip: IpNetwork) -> anyhow::Result<()> {
        let index = self.link_index(name)?;
        self.rt
            .block_on(
                self.handle
                    .address()
                    .add(index, ip.ip(), ip.prefix())
                    .execute(),
            )
            .map_err(|e| anyhow!("failed to add address {} to {}, {}", ip, name, e))
    }

    fn route_message(&self, spec: &RouteSpec) -> anyhow::Result<RouteMessage> {
        let oif = if spec.dev.is_empty() {
            None
        } else {
            Some(self.link_index(&spec.dev)?)
        };
        let mut req = self.handle.route().add().protocol(RouteProtocol::Boot);
        if spec.gw.is_none() {
            req = req.scope(RouteScope::Link);
        }
        let mut msg = match spec.dest {
            IpNetwork::V4(dest) => {
                let mut req = req.v4().destination_prefix(dest.ip(), dest.prefix());
                if let Some(IpAddr::V4(gw)) = spec.gw {
                    req = req.gateway(gw);
                }
                if let Some(index) = oif {
                    req = req.output_interface(index);
                }
                req.message_mut().clone()
            }
            IpNetwork::V6(dest) => {
                let mut req = req.v6().destination_prefix(dest.ip(), dest.prefix());
                if let Some(IpAddr::V6(gw)) = spec.gw {
                    req = req.gateway(gw);
                }
                if let Some(index) = oif {
                    req = req.output_interface(index);
                }
                req.message_mut().clone()
            }
        };
        let src = match spec.src {
            Some(IpAddr::V4(a)) => Some(RouteAddress::from(a)),
            Some(IpAddr::V6(a)) => Some(RouteAddress::from(a)),
            None => None,
        };
        if let Some(src) = src {
            msg.attributes.push(RouteAttribute::PrefSource(src));
        }
        Ok(msg)
    }

    pub fn add_route(&self, spec: &RouteSpec) -> anyhow::Result<()> {
        let msg = self.route_message(spec)?;
        let mut req = self.handle.route().add();
        *req.message_mut() = msg;
        self.rt
            .block_on(req.execute())
            .map_err(|e| anyhow!("{}", e))
    }

    /// Returns false when the kernel has no such route.
    pub fn del_route(&self, spec: &RouteSpec) -> anyhow::Result<bool> {
        let mut msg = self.route_message(spec)?;
        // match on what was given, like `ip route del`
        msg.header.protocol = RouteProtocol::Unspec;
        msg.header.scope = RouteScope::NoWhere;
        msg.header.kind = RouteType::Unspec;
        match self.rt.block_on(self.handle.route().del(msg).execute()) {
            Ok(_) => Ok(true),
            Err(e) if is_errno(&e, Errno::ESRCH) => Ok(false),
            Err(e) => Err(anyhow!("{}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::RouteSpec;
    use crate::types::Route;

    fn route(dest: &str, gw: &str, src: &str, dev: &str) -> Route {
        Route {
            dest: dest.to_string(),
            gw: gw.to_string(),
            src: src.to_string(),
            dev: dev.to_string(),
        }
    }

    #[test]
    fn test_default_route_family() {
        let r = RouteSpec::from_route(&route("default", "192.168.1.1", "", "")).unwrap();
        assert_eq!(r.dest.to_string(), "0.0.0.0/0");
        assert_eq!(r.gw, Some("192.168.1.1".parse::<IpAddr>().unwrap()));

        let r = RouteSpec::from_route(&route("", "fd00::1", "", "eth1")).unwrap();
        assert_eq!(r.dest.to_string(), "::/0");
        assert_eq!(r.dev, "eth1");

        let r = RouteSpec::from_route(&route("", "", "", "eth1")).unwrap();
        assert!(r.dest.is_ipv4());
        assert!(r.gw.is_none());
    }

    #[test]
    fn test_route_spec() {
        let r = RouteSpec::from_route(&route("10.0.0.0/8", "", "10.1.1.2", "eth1")).unwrap();
        assert_eq!(r.dest.to_string(), "10.0.0.0/8");
        assert_eq!(r.src, Some("10.1.1.2".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn test_route_spec_invalid() {
        // a destination alone says nothing about where to send
        assert!(RouteSpec::from_route(&route("10.0.0.0/8", "", "", "")).is_err());
        assert!(RouteSpec::from_route(&route("", "300.1.1.1", "", "")).is_err());
        assert!(RouteSpec::from_route(&route("10.0.0/33", "", "", "eth0")).is_err());
        let err = RouteSpec::from_route(&route("10.0.0.0/8", "fd00::1", "", "")).unwrap_err();
        assert!(err.to_string().contains("different families"));
    }
}
