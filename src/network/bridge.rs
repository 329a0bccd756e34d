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

use std::{collections::HashMap, process::Command};

use anyhow::anyhow;
use log::debug;

use super::Netlink;
use crate::utils::execute;

pub const LINUX_BRIDGE: &str = "linux";
pub const OVS_BRIDGE: &str = "ovs";

pub trait BridgeDriver {
    fn name(&self) -> &'static str;
    fn add_to_bridge(&self, netif: &str, bridge: &str) -> anyhow::Result<()>;
}

pub struct LinuxBridge;

impl BridgeDriver for LinuxBridge {
    fn name(&self) -> &'static str {
        LINUX_BRIDGE
    }

    fn add_to_bridge(&self, netif: &str, bridge: &str) -> anyhow::Result<()> {
        Netlink::host()
            .and_then(|nl| nl.set_controller(netif, bridge))
            .map_err(|e| anyhow!("failed to add {} to linux bridge {}, {}", netif, bridge, e))
    }
}

pub struct OvsBridge;

impl OvsBridge {
    fn vsctl(args: &[&str]) -> anyhow::Result<String> {
        let mut cmd = Command::new("ovs-vsctl");
        cmd.args(args);
        execute(cmd)
    }

    pub fn bridge_exists(bridge: &str) -> bool {
        Self::vsctl(&["br-exists", bridge]).is_ok()
    }
}

impl BridgeDriver for OvsBridge {
    fn name(&self) -> &'static str {
        OVS_BRIDGE
    }

    fn add_to_bridge(&self, netif: &str, bridge: &str) -> anyhow::Result<()> {
        Self::vsctl(&["add-port", bridge, netif])
            .map_err(|e| anyhow!("failed to add {} to ovs bridge {}, {}", netif, bridge, e))?;
        Ok(())
    }
}

/// Bridge drivers by name, with the lookup that tells which one owns a bridge.
pub struct BridgeRegistry {
    drivers: HashMap<&'static str, Box<dyn BridgeDriver>>,
    kind_of: fn(&str) -> &'static str,
}

fn bridge_kind(bridge: &str) -> &'static str {
    if OvsBridge::bridge_exists(bridge) {
        OVS_BRIDGE
    } else {
        LINUX_BRIDGE
    }
}

impl Default for BridgeRegistry {
    fn default() -> Self {
        let mut r = Self::new(bridge_kind);
        r.register(Box::new(LinuxBridge));
        r.register(Box::new(OvsBridge));
        r
    }
}

impl BridgeRegistry {
    pub fn new(kind_of: fn(&str) -> &'static str) -> Self {
        Self {
            drivers: HashMap::new(),
            kind_of,
        }
    }

    pub fn register(&mut self, driver: Box<dyn BridgeDriver>) {
        self.drivers.insert(driver.name(), driver);
    }

    pub fn get(&self, name: &str) -> Option<&dyn BridgeDriver> {
        self.drivers.get(name).map(|d| d.as_ref())
    }

    pub fn driver_for(&self, bridge: &str) -> anyhow::Result<&dyn BridgeDriver> {
        let name = (self.kind_of)(bridge);
        debug!("bridge {} is driven by {}", bridge, name);
        self.get(name)
            .ok_or_else(|| anyhow!("bridge driver {} not registered", name))
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::{BridgeDriver, BridgeRegistry, LINUX_BRIDGE, OVS_BRIDGE};

    struct Recorder(&'static str, Rc<RefCell<Vec<String>>>);

    impl BridgeDriver for Recorder {
        fn name(&self) -> &'static str {
            self.0
        }

        fn add_to_bridge(&self, netif: &str, bridge: &str) -> anyhow::Result<()> {
            self.1
                .borrow_mut()
                .push(format!("{}:{}:{}", self.0, bridge, netif));
            Ok(())
        }
    }

    fn ovs_for_ovs_prefix(bridge: &str) -> &'static str {
        if bridge.starts_with("ovs") {
            OVS_BRIDGE
        } else {
            LINUX_BRIDGE
        }
    }

    #[test]
    fn test_registry_dispatch() {
        let calls = Rc::new(RefCell::new(vec![]));
        let mut r = BridgeRegistry::new(ovs_for_ovs_prefix);
        r.register(Box::new(Recorder(LINUX_BRIDGE, calls.clone())));
        r.register(Box::new(Recorder(OVS_BRIDGE, calls.clone())));
        r.driver_for("br0").unwrap().add_to_bridge("veth1", "br0").unwrap();
        r.driver_for("ovsbr").unwrap().add_to_bridge("veth2", "ovsbr").unwrap();
        assert_eq!(
            *calls.borrow(),
            vec!["linux:br0:veth1".to_string(), "ovs:ovsbr:veth2".to_string()]
        );
    }

    #[test]
    fn test_unregistered_driver() {
        let r = BridgeRegistry::new(ovs_for_ovs_prefix);
        assert!(r.get(LINUX_BRIDGE).is_none());
        assert!(r.driver_for("br0").is_err());
        let d = BridgeRegistry::default();
        assert_eq!(d.get(OVS_BRIDGE).unwrap().name(), "ovs");
    }
}
