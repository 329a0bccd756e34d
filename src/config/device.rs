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
use serde::{Deserialize, Serialize};

use super::{HookConfig, MAX_PATH_NUM};
use crate::types::{Bind, Device, Qos, QosType};

/// A device as recorded in the hook config.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMapping {
    #[serde(rename = "Type")]
    pub dev_type: String,
    #[serde(rename = "Minor")]
    pub minor: i64,
    #[serde(rename = "Major")]
    pub major: i64,
    #[serde(rename = "PathOnHost")]
    pub path_on_host: String,
    #[serde(rename = "PathInContainer")]
    pub path_in_container: String,
    #[serde(rename = "CgroupPermissions")]
    pub cgroup_permissions: String,
    #[serde(rename = "Parent", default)]
    pub parent: String,
}

impl From<&Device> for DeviceMapping {
    fn from(d: &Device) -> Self {
        Self {
            dev_type: d.dev_type.clone(),
            minor: d.minor,
            major: d.major,
            path_on_host: d.path_on_host.clone(),
            path_in_container: d.path.clone(),
            cgroup_permissions: d.permissions.clone(),
            parent: d.parent.clone(),
        }
    }
}

impl DeviceMapping {
    pub fn to_device(&self) -> Device {
        Device {
            dev_type: self.dev_type.clone(),
            path: self.path_in_container.clone(),
            path_on_host: self.path_on_host.clone(),
            major: self.major,
            minor: self.minor,
            permissions: self.cgroup_permissions.clone(),
            parent: self.parent.clone(),
            ..Default::default()
        }
    }
}

/// A stored bind string split into its three fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMapping {
    pub path_on_host: String,
    pub path_in_container: String,
    pub permission: String,
}

impl HostMapping {
    pub fn parse(bind: &str) -> anyhow::Result<Self> {
        let arr: Vec<&str> = bind.splitn(3, ':').collect();
        if arr.len() < 3 {
            return Err(anyhow!("bind must have two : in string"));
        }
        Ok(Self {
            path_on_host: arr[0].to_string(),
            path_in_container: arr[1].to_string(),
            permission: arr[2].to_string(),
        })
    }
}

impl HookConfig {
    fn qos_list_mut(&mut self, kind: QosType) -> &mut Vec<Qos> {
        match kind {
            QosType::ReadIops => &mut self.read_iops,
            QosType::WriteIops => &mut self.write_iops,
            QosType::ReadBps => &mut self.read_bps,
            QosType::WriteBps => &mut self.write_bps,
            QosType::BlkioWeight => &mut self.blkio_weight,
        }
    }

    pub fn qos(&self, kind: QosType) -> &[Qos] {
        match kind {
            QosType::ReadIops => &self.read_iops,
            QosType::WriteIops => &self.write_iops,
            QosType::ReadBps => &self.read_bps,
            QosType::WriteBps => &self.write_bps,
            QosType::BlkioWeight => &self.blkio_weight,
        }
    }

    pub fn devices(&self) -> &[DeviceMapping] {
        &self.devices
    }

    /// An empty host or container path in `device` matches any.
    pub fn device_index(&self, device: &Device) -> Option<usize> {
        self.devices.iter().position(|d| {
            (device.path_on_host.is_empty() && d.path_in_container == device.path)
                || (device.path.is_empty() && d.path_on_host == device.path_on_host)
                || (d.path_in_container == device.path && d.path_on_host == device.path_on_host)
        })
    }

    /// One host device may be exposed at several container paths, a
    /// container path holds at most one device.
    fn conflict_index(&self, device: &Device) -> Option<usize> {
        self.devices
            .iter()
            .position(|d| d.path_in_container == device.path)
    }

    pub fn find_device(&self, device: &Device) -> Option<Device> {
        self.devices
            .iter()
            .find(|d| d.path_on_host == device.path_on_host && d.path_in_container == device.path)
            .map(DeviceMapping::to_device)
    }

    /// Stored partitions whose base disk is `device`.
    pub fn find_sub_partitions(&self, device: &Device) -> Vec<Device> {
        self.devices
            .iter()
            .filter(|d| d.parent == device.path_on_host)
            .map(DeviceMapping::to_device)
            .collect()
    }

    pub fn update_device(&mut self, device: &Device, is_add: bool) -> anyhow::Result<()> {
        if is_add {
            if let Some(idx) = self.conflict_index(device) {
                let c = &self.devices[idx];
                return Err(anyhow!(
                    "device {}:{} has been already added into container",
                    c.path_on_host,
                    c.path_in_container
                ));
            }
            self.dirty = true;
            self.devices.push(DeviceMapping::from(device));
            return Ok(());
        }
        match self.device_index(device) {
            Some(idx) => {
                self.dirty = true;
                self.devices.remove(idx);
                Ok(())
            }
            None => Err(anyhow!(
                "device {}:{} has not been added into container",
                device.path_on_host,
                device.path
            )),
        }
    }

    /// Re-homes the numbers recorded for `host_path` on devices and limits.
    pub fn update_device_node(&mut self, host_path: &str, major: i64, minor: i64) {
        let mut changed = false;
        for d in self.devices.iter_mut().filter(|d| d.path_on_host == host_path) {
            if d.major != major || d.minor != minor {
                d.major = major;
                d.minor = minor;
                changed = true;
            }
        }
        for kind in QosType::ALL {
            for q in self
                .qos_list_mut(kind)
                .iter_mut()
                .filter(|q| q.path == host_path)
            {
                if q.major != major || q.minor != minor {
                    q.major = major;
                    q.minor = minor;
                    changed = true;
                }
            }
        }
        if changed {
            self.dirty = true;
        }
    }

    /// Upsert keyed by (major, minor). The device must already be recorded.
    pub fn update_qos(&mut self, qos: &Qos, kind: QosType) -> anyhow::Result<()> {
        if !self
            .devices
            .iter()
            .any(|d| d.major == qos.major && d.minor == qos.minor)
        {
            return Err(anyhow!(
                "device {}:{} is not added into container, can not set {}",
                qos.major,
                qos.minor,
                kind.cgroup_file()
            ));
        }
        let list = self.qos_list_mut(kind);
        let mut dirty = false;
        match list
            .iter_mut()
            .find(|q| q.major == qos.major && q.minor == qos.minor)
        {
            Some(q) => {
                if q.value != qos.value {
                    q.value = qos.value.clone();
                    dirty = true;
                }
            }
            None => {
                list.push(qos.clone());
                dirty = true;
            }
        }
        if dirty {
            self.dirty = true;
        }
        Ok(())
    }

    /// Returns false when the device had no limit of this kind.
    pub fn remove_qos(&mut self, device: &Device, kind: QosType) -> bool {
        let list = self.qos_list_mut(kind);
        match list
            .iter()
            .position(|q| q.major == device.major && q.minor == device.minor)
        {
            Some(idx) => {
                list.remove(idx);
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn binds(&self) -> &[String] {
        &self.binds
    }

    fn bind_index_of(&self, bind: &Bind) -> Option<usize> {
        self.binds.iter().position(|s| match HostMapping::parse(s) {
            Ok(mp) => mp.path_in_container == bind.container_path && mp.path_on_host == bind.host_path,
            Err(_) => false,
        })
    }

    pub fn is_bind_in_config(&self, bind: &Bind) -> bool {
        self.bind_index_of(bind).is_some()
    }

    pub fn bind_for(&self, bind: &Bind) -> anyhow::Result<HostMapping> {
        match self.bind_index_of(bind) {
            Some(idx) => HostMapping::parse(&self.binds[idx]),
            None => Err(anyhow!("fail to find bind: {}", bind)),
        }
    }

    /// On add returns whether the host path was already shared by another
    /// bind. On remove returns whether the host path has no referent left.
    pub fn update_bind(&mut self, bind: &Bind, is_add: bool) -> anyhow::Result<bool> {
        let bind_str = bind.to_string();
        if is_add {
            let exist = self.bind_index.add(&bind_str)?;
            if self.bind_index_of(bind).is_none() {
                self.dirty = true;
                self.binds.push(bind_str);
            }
            return Ok(exist);
        }
        let gone = self.bind_index.remove(&bind_str)?;
        if let Some(idx) = self.bind_index_of(bind) {
            self.dirty = true;
            self.binds.remove(idx);
        }
        Ok(gone)
    }

    pub fn check_path_num(&self) -> anyhow::Result<()> {
        if self.binds.len() >= MAX_PATH_NUM {
            return Err(anyhow!("path already reach max limit {}", MAX_PATH_NUM));
        }
        Ok(())
    }
}
