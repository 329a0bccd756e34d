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
use log::{error, warn};

use super::{configure_link, random_name, LinkDriver, Netlink, NicOptions, HOST_NET_NS};

/// A physical nic of the host handed over to the container as a whole.
pub struct EthDriver {
    opts: NicOptions,
}

impl EthDriver {
    pub fn new(opts: NicOptions) -> Self {
        Self { opts }
    }

    fn guest(&self) -> anyhow::Result<Netlink> {
        Netlink::in_netns(&self.opts.ns_path)
    }

    /// Host side: `host_name` becomes `tmp` inside the container.
    fn move_in(&self, host: &Netlink, tmp: &str) -> anyhow::Result<()> {
        host.set_up(&self.opts.host_name, false)?;
        host.set_name(&self.opts.host_name, tmp)
            .map_err(|e| anyhow!("failed to rename host nic to {}, {}", tmp, e))?;
        if let Err(e) = host.set_netns(tmp, &self.opts.ns_path) {
            if let Err(re) = host.set_name(tmp, &self.opts.host_name) {
                error!("rollback: rename {} back failed, {}", tmp, re);
            }
            return Err(anyhow!("failed to move {} to container, {}", tmp, e));
        }
        Ok(())
    }

    /// Container side: `tmp` goes back to the host named `host_name`.
    fn move_out(&self, host: &Netlink, guest: &Netlink, tmp: &str) -> anyhow::Result<()> {
        guest
            .set_netns(tmp, HOST_NET_NS)
            .map_err(|e| anyhow!("failed to move {} to host, {}", tmp, e))?;
        if !host.link_exists(tmp)? {
            return Err(anyhow!("failed to get host link by name {}", tmp));
        }
        host.set_name(tmp, &self.opts.host_name)
            .map_err(|e| anyhow!("failed to rename {} to {}, {}", tmp, self.opts.host_name, e))
    }

    fn setup_container(&self, guest: &Netlink, tmp: &str) -> anyhow::Result<()> {
        guest
            .set_name(tmp, &self.opts.ctr_name)
            .map_err(|e| anyhow!("failed to rename container nic, {}", e))?;
        configure_link(guest, &self.opts.ctr_name, &self.opts)?;
        guest.set_up(&self.opts.ctr_name, true)
    }
}

impl LinkDriver for EthDriver {
    fn create_if(&mut self) -> anyhow::Result<()> {
        if self.opts.host_name.is_empty() || self.opts.ctr_name.is_empty() {
            return Err(anyhow!("both host nic name and container nic name are required"));
        }
        Netlink::host()?
            .set_txqueuelen(&self.opts.host_name, self.opts.qlen)
            .map_err(|e| anyhow!("failed to set qlen of {}, {}", self.opts.host_name, e))
    }

    fn delete_if(&mut self) -> anyhow::Result<()> {
        let guest = self.guest()?;
        if !guest.link_exists(&self.opts.ctr_name)? {
            warn!("link {} not found in container, skip", self.opts.ctr_name);
            return Ok(());
        }
        let host = Netlink::host()?;
        let tmp = random_name("eth");
        guest.set_up(&self.opts.ctr_name, false)?;
        guest
            .set_name(&self.opts.ctr_name, &tmp)
            .map_err(|e| anyhow!("failed to rename container nic to {}, {}", tmp, e))?;
        if let Err(e) = self.move_out(&host, &guest, &tmp) {
            if let Ok(true) = host.link_exists(&tmp) {
                if let Err(re) = host.set_netns(&tmp, &self.opts.ns_path) {
                    error!("rollback: move {} back to container failed, {}", tmp, re);
                }
            }
            if let Err(re) = guest.set_name(&tmp, &self.opts.ctr_name) {
                error!("rollback: rename {} back failed, {}", tmp, re);
            }
            return Err(e);
        }
        Ok(())
    }

    fn join_and_configure(&mut self) -> anyhow::Result<()> {
        let host = Netlink::host()?;
        let guest = self.guest()?;
        let tmp = random_name("eth");
        self.move_in(&host, &tmp)?;
        if let Err(e) = self.setup_container(&guest, &tmp) {
            let _ = guest.set_up(&self.opts.ctr_name, false);
            if let Ok(true) = guest.link_exists(&self.opts.ctr_name) {
                if let Err(re) = guest.set_name(&self.opts.ctr_name, &tmp) {
                    error!("rollback: rename {} failed, {}", self.opts.ctr_name, re);
                }
            }
            if let Err(re) = self.move_out(&host, &guest, &tmp) {
                error!("rollback: give {} back to host failed, {}", tmp, re);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Leaves the link down when it was down before.
    fn configure(&mut self) -> anyhow::Result<()> {
        let guest = self.guest()?;
        let was_up = guest.link_is_up(&self.opts.ctr_name)?;
        guest.set_up(&self.opts.ctr_name, false)?;
        configure_link(&guest, &self.opts.ctr_name, &self.opts)?;
        if was_up {
            guest.set_up(&self.opts.ctr_name, true)?;
        }
        Ok(())
    }

    fn add_to_bridge(&self) -> anyhow::Result<()> {
        if !self.opts.bridge.is_empty() {
            return Err(anyhow!("eth type nic can't be added to bridge"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::EthDriver;
    use crate::network::{LinkDriver, NicOptions};

    fn opts(host: &str, bridge: &str) -> NicOptions {
        NicOptions {
            ns_path: "/proc/1/ns/net".to_string(),
            ctr_name: "eth1".to_string(),
            host_name: host.to_string(),
            ip: "10.0.0.2/24".parse().unwrap(),
            mac: None,
            mtu: 1500,
            qlen: 1000,
            bridge: bridge.to_string(),
        }
    }

    #[test]
    fn test_create_requires_names() {
        let mut d = EthDriver::new(opts("", ""));
        assert!(d.create_if().is_err());
    }

    #[test]
    fn test_bridge_not_allowed() {
        assert!(EthDriver::new(opts("enp1s0", "br0")).add_to_bridge().is_err());
        EthDriver::new(opts("enp1s0", "")).add_to_bridge().unwrap();
    }
}
