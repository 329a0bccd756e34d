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

use anyhow::anyhow;
use log::{error, info};

use super::{configure_link, random_name, BridgeRegistry, LinkDriver, Netlink, NicOptions};

/// A veth pair, one end kept on the host in a bridge, the peer moved into the container.
pub struct VethDriver<'a> {
    opts: NicOptions,
    bridges: &'a BridgeRegistry,
    // temporary names until the ends are renamed
    host_tmp: String,
    guest_tmp: String,
}

impl<'a> VethDriver<'a> {
    pub fn new(opts: NicOptions, bridges: &'a BridgeRegistry) -> Self {
        Self {
            opts,
            bridges,
            host_tmp: String::new(),
            guest_tmp: String::new(),
        }
    }

    fn host_name(&self) -> &str {
        if self.opts.host_name.is_empty() {
            &self.host_tmp
        } else {
            &self.opts.host_name
        }
    }

    fn setup_host(&self, host: &Netlink) -> anyhow::Result<()> {
        host.set_up(&self.host_tmp, false)?;
        host.set_up(&self.guest_tmp, false)?;
        host.set_netns(&self.guest_tmp, &self.opts.ns_path)
            .map_err(|e| anyhow!("failed to move {} to container, {}", self.guest_tmp, e))?;
        host.set_mtu(&self.host_tmp, self.opts.mtu)?;
        if !self.opts.host_name.is_empty() {
            host.set_name(&self.host_tmp, &self.opts.host_name)
                .map_err(|e| anyhow!("failed to rename host nic, {}", e))?;
        }
        self.add_to_bridge()?;
        host.set_up(self.host_name(), true)
    }

    fn setup_container(&self) -> anyhow::Result<()> {
        let guest = Netlink::in_netns(&self.opts.ns_path)?;
        guest
            .set_name(&self.guest_tmp, &self.opts.ctr_name)
            .map_err(|e| anyhow!("failed to rename container nic, {}", e))?;
        configure_link(&guest, &self.opts.ctr_name, &self.opts)?;
        guest.set_up(&self.opts.ctr_name, true)
    }
}

impl<'a> LinkDriver for VethDriver<'a> {
    fn create_if(&mut self) -> anyhow::Result<()> {
        self.host_tmp = random_name("veth");
        self.guest_tmp = random_name("veth");
        Netlink::host()?
            .add_veth(&self.host_tmp, &self.guest_tmp, self.opts.qlen)
            .map_err(|e| anyhow!("failed to create veth pair, {}", e))?;
        info!("created veth pair {} <-> {}", self.host_tmp, self.guest_tmp);
        Ok(())
    }

    /// Deleting the host end removes the peer as well.
    fn delete_if(&mut self) -> anyhow::Result<()> {
        let name = self.host_name().to_string();
        if name.is_empty() {
            return Ok(());
        }
        let host = Netlink::host()?;
        if !host.link_exists(&name)? {
            return Ok(());
        }
        host.del_link(&name)
            .map_err(|e| anyhow!("failed to delete host nic {}, {}", name, e))
    }

    fn join_and_configure(&mut self) -> anyhow::Result<()> {
        if self.host_tmp.is_empty() {
            return Err(anyhow!("veth pair must be created before joining"));
        }
        let host = Netlink::host()?;
        let res = self
            .setup_host(&host)
            .and_then(|_| self.setup_container());
        if let Err(e) = &res {
            error!("failed to join veth to container, {}", e);
            for name in [self.host_name().to_string(), self.host_tmp.clone()] {
                if let Ok(true) = host.link_exists(&name) {
                    if let Err(e) = host.del_link(&name) {
                        error!("rollback: delete {} failed, {}", name, e);
                    }
                }
            }
        }
        res
    }

    fn configure(&mut self) -> anyhow::Result<()> {
        let host = Netlink::host()?;
        let name = self.opts.host_name.as_str();
        host.set_up(name, false)?;
        host.set_mtu(name, self.opts.mtu)?;
        host.set_txqueuelen(name, self.opts.qlen)?;
        self.add_to_bridge()?;
        host.set_up(name, true)?;

        let guest = Netlink::in_netns(&self.opts.ns_path)?;
        guest.set_up(&self.opts.ctr_name, false)?;
        configure_link(&guest, &self.opts.ctr_name, &self.opts)?;
        guest.set_up(&self.opts.ctr_name, true)
    }

    fn add_to_bridge(&self) -> anyhow::Result<()> {
        if self.opts.bridge.is_empty() {
            return Err(anyhow!("bridge can't be empty"));
        }
        self.bridges
            .driver_for(&self.opts.bridge)?
            .add_to_bridge(self.host_name(), &self.opts.bridge)
    }
}
