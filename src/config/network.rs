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

use super::{HookConfig, MAX_NIC_NUM};
use crate::types::{InterfaceConf, Route};

impl HookConfig {
    /// Looks a nic up by container or host name, `nic_type` narrows when set.
    pub fn find_interface_by_name(&self, nic: &InterfaceConf) -> Option<&InterfaceConf> {
        self.network_interfaces.iter().find(|e| {
            if !nic.nic_type.is_empty() && nic.nic_type != e.nic_type {
                return false;
            }
            (nic.ctr_nic_name == e.ctr_nic_name
                && (nic.host_nic_name.is_empty() || nic.host_nic_name == e.host_nic_name))
                || (nic.host_nic_name == e.host_nic_name
                    && (nic.ctr_nic_name.is_empty() || nic.ctr_nic_name == e.ctr_nic_name))
        })
    }

    pub fn network_interfaces(&self, filter: &InterfaceConf) -> Vec<&InterfaceConf> {
        self.network_interfaces
            .iter()
            .filter(|n| filter.matches(n))
            .collect()
    }

    pub fn is_conflict_interface(&self, nic: &InterfaceConf) -> anyhow::Result<()> {
        for e in &self.network_interfaces {
            nic.conflicts_with(e)?;
        }
        Ok(())
    }

    pub fn is_same_interface(&self, nic: &InterfaceConf) -> bool {
        self.network_interfaces.iter().any(|e| nic.matches(e))
    }

    /// Removal drops the first stored nic matched by `nic`.
    pub fn update_network_interface(
        &mut self,
        nic: &InterfaceConf,
        is_add: bool,
    ) -> anyhow::Result<()> {
        if is_add {
            self.check_nic_num()?;
            self.dirty = true;
            self.network_interfaces.push(nic.clone());
            return Ok(());
        }
        if let Some(idx) = self.network_interfaces.iter().position(|e| nic.matches(e)) {
            self.dirty = true;
            self.network_interfaces.remove(idx);
        }
        Ok(())
    }

    pub fn check_nic_num(&self) -> anyhow::Result<()> {
        if self.network_interfaces.len() >= MAX_NIC_NUM {
            return Err(anyhow!("nic already reach max limit {}", MAX_NIC_NUM));
        }
        Ok(())
    }

    pub fn is_route_exist(&self, route: &Route) -> bool {
        self.network_routes.iter().any(|r| route.matches(r))
    }

    pub fn is_conflict_route(&self, route: &Route) -> anyhow::Result<()> {
        if self.is_route_exist(route) {
            return Err(anyhow!("route {} already exist", route));
        }
        Ok(())
    }

    pub fn routes(&self, filter: &Route) -> Vec<&Route> {
        self.network_routes
            .iter()
            .filter(|r| filter.matches(r))
            .collect()
    }

    pub fn update_network_route(&mut self, route: &Route, is_add: bool) -> anyhow::Result<()> {
        if is_add {
            self.dirty = true;
            self.network_routes.push(route.clone());
            return Ok(());
        }
        if let Some(idx) = self.network_routes.iter().position(|r| route.matches(r)) {
            self.dirty = true;
            self.network_routes.remove(idx);
        }
        Ok(())
    }
}
