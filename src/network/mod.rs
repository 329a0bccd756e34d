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

use std::str::FromStr;

use anyhow::anyhow;
use ipnetwork::IpNetwork;
use log::warn;

use crate::types::{InterfaceConf, Route};

pub use self::bridge::{BridgeDriver, BridgeRegistry};
pub use self::netlink::{Netlink, RouteSpec};
pub use self::route::{add_route_to_container, del_route_from_container};

pub mod bridge;
pub mod eth;
pub mod netlink;
pub mod route;
pub mod veth;

pub const MIN_MTU: i32 = 68;
pub const HOST_NET_NS: &str = "/proc/1/ns/net";

/// Moves and configures one network interface of a container.
pub trait LinkDriver {
    fn create_if(&mut self) -> anyhow::Result<()>;
    fn delete_if(&mut self) -> anyhow::Result<()>;
    /// Moves the interface into the container and configures both ends.
    fn join_and_configure(&mut self) -> anyhow::Result<()>;
    fn configure(&mut self) -> anyhow::Result<()>;
    fn add_to_bridge(&self) -> anyhow::Result<()>;
}

/// Everything nic and route operations need from the host network stack.
pub trait NetworkBackend {
    /// Builds the driver for the interface type of `conf`.
    fn driver<'a>(
        &'a self,
        conf: &InterfaceConf,
        ns_path: &str,
    ) -> anyhow::Result<Box<dyn LinkDriver + 'a>>;
    fn add_route(&self, ns_path: &str, route: &Route) -> anyhow::Result<()>;
    fn del_route(&self, ns_path: &str, route: &Route) -> anyhow::Result<()>;
}

/// Drives links and routes over route netlink, bridges are looked up in the registry.
pub struct NetlinkBackend {
    bridges: BridgeRegistry,
}

impl NetlinkBackend {
    pub fn new(bridges: BridgeRegistry) -> Self {
        Self { bridges }
    }
}

impl Default for NetlinkBackend {
    fn default() -> Self {
        Self::new(BridgeRegistry::default())
    }
}

impl NetworkBackend for NetlinkBackend {
    fn driver<'a>(
        &'a self,
        conf: &InterfaceConf,
        ns_path: &str,
    ) -> anyhow::Result<Box<dyn LinkDriver + 'a>> {
        let opts = NicOptions::new(conf, ns_path)?;
        match conf.nic_type.as_str() {
            "" | "veth" => Ok(Box::new(veth::VethDriver::new(opts, &self.bridges))),
            "eth" => Ok(Box::new(eth::EthDriver::new(opts))),
            _ => Err(anyhow!("network interface type not supported")),
        }
    }

    fn add_route(&self, ns_path: &str, route: &Route) -> anyhow::Result<()> {
        add_route_to_container(ns_path, route)
    }

    fn del_route(&self, ns_path: &str, route: &Route) -> anyhow::Result<()> {
        del_route_from_container(ns_path, route)
    }
}

/// Validated settings shared by the link drivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicOptions {
    pub ns_path: String,
    pub ctr_name: String,
    pub host_name: String,
    pub ip: IpNetwork,
    pub mac: Option<[u8; 6]>,
    pub mtu: u32,
    pub qlen: u32,
    pub bridge: String,
}

impl NicOptions {
    pub fn new(conf: &InterfaceConf, ns_path: &str) -> anyhow::Result<Self> {
        let ip = parse_ip_net(conf.ip.trim())?;
        let mac = match conf.mac.trim() {
            "" => None,
            m => Some(parse_mac_address(m)?),
        };
        if conf.mtu < MIN_MTU {
            return Err(anyhow!("mtu must not be less than {}", MIN_MTU));
        }
        let qlen =
            u32::try_from(conf.qlen).map_err(|_| anyhow!("qlen must not be less than 0"))?;
        Ok(Self {
            ns_path: ns_path.trim().to_string(),
            ctr_name: conf.ctr_nic_name.trim().to_string(),
            host_name: conf.host_nic_name.trim().to_string(),
            ip,
            mac,
            mtu: conf.mtu as u32,
            qlen,
            bridge: conf.bridge.trim().to_string(),
        })
    }
}

pub fn parse_ip_net(ip: &str) -> anyhow::Result<IpNetwork> {
    IpNetwork::from_str(ip).map_err(|e| anyhow!("invalid ip address {}, {}", ip, e))
}

pub fn parse_mac_address(addr: &str) -> anyhow::Result<[u8; 6]> {
    let parts: Vec<&str> = addr.split(':').collect();
    if parts.len() != 6 {
        return Err(anyhow!("invalid MAC address {}", addr));
    }
    let mut mac = [0u8; 6];
    for (i, p) in parts.iter().enumerate() {
        if p.len() != 2 {
            return Err(anyhow!("invalid MAC address {}", addr));
        }
        mac[i] = u8::from_str_radix(p, 16).map_err(|_| anyhow!("invalid MAC address {}", addr))?;
    }
    Ok(mac)
}

/// Whether a link named `name` exists in the caller's network namespace.
pub fn host_link_exists(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    match Netlink::host().and_then(|nl| nl.link_exists(name)) {
        Ok(exists) => exists,
        Err(e) => {
            warn!("failed to look up link {}, {}", name, e);
            false
        }
    }
}

/// Checks a nic given on the command line against the host before it is recorded.
pub fn valid_network_config(
    conf: &mut InterfaceConf,
    link_exists: impl Fn(&str) -> bool,
) -> anyhow::Result<()> {
    conf.ip = conf.ip.trim().to_string();
    parse_ip_net(&conf.ip)?;
    conf.mac = conf.mac.trim().to_string();
    if !conf.mac.is_empty() {
        parse_mac_address(&conf.mac)?;
    }
    match conf.nic_type.as_str() {
        "veth" => {
            if link_exists(&conf.host_nic_name) {
                return Err(anyhow!(
                    "host has nic with name {}, please choose another one",
                    conf.host_nic_name
                ));
            }
            conf.bridge = conf.bridge.trim().to_string();
            if conf.bridge.is_empty() {
                return Err(anyhow!("bridge must be specified"));
            }
        }
        "eth" => {
            if conf.host_nic_name.is_empty() {
                return Err(anyhow!("host nic name input error"));
            }
            if !conf.bridge.is_empty() {
                return Err(anyhow!("for eth type, bridge cannot be set"));
            }
            if !link_exists(&conf.host_nic_name) {
                return Err(anyhow!(
                    "host nic ({}) not found, please check",
                    conf.host_nic_name
                ));
            }
        }
        t => return Err(anyhow!("unsupported type {}", t)),
    }
    Ok(())
}

/// `iface` followed by a random hex suffix, short enough for IFNAMSIZ.
pub fn random_name(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", prefix, &id[..10])
}

/// Applies mac, mtu, queue length and the single ipv4/ipv6 address.
fn configure_link(nl: &Netlink, name: &str, opts: &NicOptions) -> anyhow::Result<()> {
    if let Some(mac) = &opts.mac {
        nl.set_address(name, mac)
            .map_err(|e| anyhow!("failed to set hardware, {}", e))?;
    }
    nl.set_mtu(name, opts.mtu)
        .map_err(|e| anyhow!("failed to set mtu, {}", e))?;
    nl.set_txqueuelen(name, opts.qlen)
        .map_err(|e| anyhow!("failed to set qlen({}) for nic({}), {}", opts.qlen, name, e))?;
    nl.flush_addresses(name, opts.ip.is_ipv4())
        .map_err(|e| anyhow!("failed to delete old ip address, {}", e))?;
    nl.add_address(name, opts.ip)
        .map_err(|e| anyhow!("failed to configure ip address, {}", e))?;
    Ok(())
}
