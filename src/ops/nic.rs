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

use super::{is_running, locked, log_rollback, Backends};
use crate::{
    config::HookConfig, container::Container, network::NetworkBackend, types::InterfaceConf,
};

const HOST_NIC_PREFIX_LEN: usize = 9;

/// `<first 9 chars of ctr name>_<5 random hex>` for a nic added without a host name.
pub fn default_host_nic_name(ctr_nic_name: &str) -> String {
    let prefix: String = ctr_nic_name.chars().take(HOST_NIC_PREFIX_LEN).collect();
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &id[..5])
}

/// Creates the interface in the container netns and configures it.
pub fn add_nic_to_container(
    network: &dyn NetworkBackend,
    ns_path: &str,
    nic: &InterfaceConf,
) -> anyhow::Result<()> {
    let mut driver = network.driver(nic, ns_path)?;
    driver
        .create_if()
        .map_err(|e| anyhow!("failed to create interface, {}", e))?;
    driver.join_and_configure()
}

pub fn del_nic_from_container(
    network: &dyn NetworkBackend,
    ns_path: &str,
    nic: &InterfaceConf,
) -> anyhow::Result<()> {
    network.driver(nic, ns_path)?.delete_if()
}

fn flush(config: &mut HookConfig) -> anyhow::Result<()> {
    config
        .flush()
        .map_err(|e| anyhow!("failed to save network config, {}", e))
}

pub fn add_nic(
    c: &mut Container,
    b: &Backends,
    nic: &InterfaceConf,
    config_only: bool,
) -> anyhow::Result<()> {
    locked(c, |c| {
        let mut config = HookConfig::for_container(c.path())?;
        config.check_nic_num()?;
        config.is_conflict_interface(nic)?;
        config.update_network_interface(nic, true)?;
        if !config_only && is_running(c) {
            if let Err(e) = add_nic_to_container(b.network, &c.net_ns_path(), nic) {
                log_rollback("nic config", config.update_network_interface(nic, false));
                return Err(e);
            }
        }
        flush(&mut config)?;
        info!(
            "add network interface ({}) to container ({},{}) done",
            nic.host_nic_name,
            c.name(),
            nic.ctr_nic_name
        );
        Ok(())
    })
}

pub fn remove_nic(c: &mut Container, b: &Backends, nic: &InterfaceConf) -> anyhow::Result<()> {
    locked(c, |c| {
        let mut config = HookConfig::for_container(c.path())?;
        let stored = config.find_interface_by_name(nic).cloned().ok_or_else(|| {
            anyhow!(
                "network interface {},{} with type {} not exist in container {}",
                nic.host_nic_name,
                nic.ctr_nic_name,
                nic.nic_type,
                c.name()
            )
        })?;
        config.update_network_interface(&stored, false)?;
        if is_running(c) {
            if let Err(e) = del_nic_from_container(b.network, &c.net_ns_path(), &stored) {
                // the link is already gone from the host, nothing to restore
                if !e.to_string().contains("failed to get host link by name") {
                    log_rollback("nic config", config.update_network_interface(&stored, true));
                    return Err(e);
                }
                error!("remove network interface error: {}", e);
            }
        }
        flush(&mut config)?;
        info!(
            "remove network interface ({}) from container ({},{}) done",
            stored.host_nic_name,
            c.name(),
            stored.ctr_nic_name
        );
        Ok(())
    })
}

/// Fields left empty in `update` keep their stored value, a negative qlen
/// means not set.
fn merge_nic(stored: &InterfaceConf, update: &InterfaceConf) -> InterfaceConf {
    let pick = |new: &str, old: &str| {
        if new.is_empty() {
            old.to_string()
        } else {
            new.to_string()
        }
    };
    InterfaceConf {
        ip: pick(&update.ip, &stored.ip),
        mac: pick(&update.mac, &stored.mac),
        bridge: pick(&update.bridge, &stored.bridge),
        mtu: if update.mtu == 0 { stored.mtu } else { update.mtu },
        qlen: if update.qlen < 0 { stored.qlen } else { update.qlen },
        nic_type: stored.nic_type.clone(),
        host_nic_name: stored.host_nic_name.clone(),
        ctr_nic_name: update.ctr_nic_name.clone(),
    }
}

pub fn update_nic(
    c: &mut Container,
    b: &Backends,
    update: &InterfaceConf,
    config_only: bool,
) -> anyhow::Result<()> {
    locked(c, |c| {
        let mut config = HookConfig::for_container(c.path())?;
        let by_name = InterfaceConf {
            ctr_nic_name: update.ctr_nic_name.clone(),
            ..Default::default()
        };
        let stored = config
            .find_interface_by_name(&by_name)
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "network interface {} not exist in container {}",
                    update.ctr_nic_name,
                    c.name()
                )
            })?;
        let merged = merge_nic(&stored, update);
        if merged == stored {
            info!(
                "network interface {} in container {}: identical setting, nothing to change",
                update.ctr_nic_name,
                c.name()
            );
            return Ok(());
        }

        config.update_network_interface(&stored, false)?;
        let res = config.is_conflict_interface(&merged).and_then(|_| {
            if !config_only && is_running(c) {
                b.network.driver(&merged, &c.net_ns_path())?.configure()
            } else {
                Ok(())
            }
        });
        if let Err(e) = res {
            log_rollback("nic config", config.update_network_interface(&stored, true));
            return Err(e);
        }
        config.update_network_interface(&merged, true)?;
        flush(&mut config)?;
        info!(
            "network interface {} in container {} update successfully",
            update.ctr_nic_name,
            c.name()
        );
        Ok(())
    })
}

pub fn list_nic(c: &mut Container, filter: &InterfaceConf) -> anyhow::Result<Vec<InterfaceConf>> {
    locked(c, |c| {
        let config = HookConfig::for_container(c.path())?;
        Ok(config
            .network_interfaces(filter)
            .into_iter()
            .cloned()
            .collect())
    })
}

#[cfg(test)]
mod tests {
    use temp_dir::TempDir;

    use super::{add_nic, default_host_nic_name, list_nic, merge_nic, remove_nic, update_nic};
    use crate::{
        ops::tests::{backends, running, stopped, FakeCgroup, FakeDriver, FakeNetwork},
        types::InterfaceConf,
    };

    fn nic(host: &str, ctr: &str, ip: &str) -> InterfaceConf {
        InterfaceConf {
            ip: ip.to_string(),
            mtu: 1500,
            qlen: 1000,
            nic_type: "veth".to_string(),
            bridge: "br0".to_string(),
            host_nic_name: host.to_string(),
            ctr_nic_name: ctr.to_string(),
            ..Default::default()
        }
    }

    fn by_ctr_name(ctr: &str) -> InterfaceConf {
        InterfaceConf {
            ctr_nic_name: ctr.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_host_nic_name() {
        let name = default_host_nic_name("eth-very-long-name");
        assert!(name.starts_with("eth-very-_"));
        assert_eq!(name.len(), 15);
        assert!(default_host_nic_name("eth1").starts_with("eth1_"));
    }

    #[test]
    fn test_add_nic_rolls_back() {
        let dir = TempDir::new().unwrap();
        let (driver, cgroup) = (FakeDriver::default(), FakeCgroup::default());
        let mut net = FakeNetwork::default();
        net.fail.insert("eth2".to_string());
        net.fail_msg = "join failed".to_string();
        let b = backends(&driver, &cgroup, &net);
        let mut c = running(&dir);

        add_nic(&mut c, &b, &nic("veth1", "eth1", "10.0.0.2/24"), false).unwrap();
        assert!(add_nic(&mut c, &b, &nic("veth9", "eth9", "10.0.0.2/24"), false).is_err());
        assert!(add_nic(&mut c, &b, &nic("veth2", "eth2", "10.0.0.3/24"), false).is_err());
        assert_eq!(
            *net.calls.borrow(),
            vec!["create eth1", "join eth1", "create eth2", "join eth2"]
        );
        let nics = list_nic(&mut c, &InterfaceConf::default()).unwrap();
        assert_eq!(nics.len(), 1);
        assert_eq!(nics[0].ctr_nic_name, "eth1");
    }

    #[test]
    fn test_remove_nic() {
        let dir = TempDir::new().unwrap();
        let (driver, cgroup) = (FakeDriver::default(), FakeCgroup::default());
        let mut net = FakeNetwork::default();
        net.fail.insert("eth2".to_string());
        net.fail_msg = "failed to get host link by name".to_string();
        let b = backends(&driver, &cgroup, &net);
        let mut c = stopped(&dir);
        add_nic(&mut c, &b, &nic("veth1", "eth1", "10.0.0.2/24"), false).unwrap();
        add_nic(&mut c, &b, &nic("veth2", "eth2", "10.0.0.3/24"), false).unwrap();
        assert!(remove_nic(&mut c, &b, &by_ctr_name("eth3")).is_err());

        let mut c = running(&dir);
        // a link the host already lost is still removed from the config
        remove_nic(&mut c, &b, &by_ctr_name("eth2")).unwrap();
        remove_nic(&mut c, &b, &by_ctr_name("eth1")).unwrap();
        assert!(list_nic(&mut c, &InterfaceConf::default()).unwrap().is_empty());
    }

    #[test]
    fn test_update_nic() {
        let dir = TempDir::new().unwrap();
        let (driver, cgroup, net) = (FakeDriver::default(), FakeCgroup::default(), FakeNetwork::default());
        let b = backends(&driver, &cgroup, &net);
        let mut c = running(&dir);
        add_nic(&mut c, &b, &nic("veth1", "eth1", "10.0.0.2/24"), false).unwrap();
        add_nic(&mut c, &b, &nic("veth2", "eth2", "10.0.0.3/24"), false).unwrap();

        let same = InterfaceConf {
            qlen: -1,
            ..by_ctr_name("eth1")
        };
        update_nic(&mut c, &b, &same, false).unwrap();
        assert!(!net.calls.borrow().contains(&"configure eth1".to_string()));

        let clash = InterfaceConf {
            ip: "10.0.0.3/24".to_string(),
            qlen: -1,
            ..by_ctr_name("eth1")
        };
        assert!(update_nic(&mut c, &b, &clash, false).is_err());

        let mtu = InterfaceConf {
            mtu: 9000,
            qlen: -1,
            ..by_ctr_name("eth1")
        };
        update_nic(&mut c, &b, &mtu, false).unwrap();
        assert!(net.calls.borrow().contains(&"configure eth1".to_string()));
        let nics = list_nic(&mut c, &by_ctr_name("eth1")).unwrap();
        assert_eq!(nics.len(), 1);
        assert_eq!(nics[0].mtu, 9000);
        assert_eq!(nics[0].ip, "10.0.0.2/24");
        assert_eq!(nics[0].qlen, 1000);
    }

    #[test]
    fn test_merge_nic() {
        let stored = nic("veth1", "eth1", "10.0.0.2/24");
        let update = InterfaceConf {
            mac: "52:54:00:00:00:01".to_string(),
            qlen: 0,
            ..by_ctr_name("eth1")
        };
        let merged = merge_nic(&stored, &update);
        assert_eq!(merged.mac, "52:54:00:00:00:01");
        assert_eq!(merged.qlen, 0);
        assert_eq!(merged.mtu, 1500);
        assert_eq!(merged.host_nic_name, "veth1");
    }
}
