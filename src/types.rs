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

use std::fmt::{Display, Formatter};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

pub const WILDCARD: i64 = -1;

/// Result record written back by a namespace worker.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct ErrMsg {
    #[serde(rename = "Error")]
    pub error: String,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// "c" or "b"
    #[serde(rename = "Type")]
    pub dev_type: String,
    /// path in container
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "PathOnHost")]
    pub path_on_host: String,
    #[serde(rename = "Major")]
    pub major: i64,
    #[serde(rename = "Minor")]
    pub minor: i64,
    #[serde(rename = "Permissions")]
    pub permissions: String,
    /// permission bits only, the node type is taken from `dev_type`
    #[serde(rename = "FileMode")]
    pub file_mode: u32,
    #[serde(rename = "UID")]
    pub uid: u32,
    #[serde(rename = "GID")]
    pub gid: u32,
    #[serde(rename = "Allow")]
    pub allow: bool,
    /// base disk on host, empty for whole disks and lvm volumes
    #[serde(rename = "Parent")]
    pub parent: String,
}

impl Device {
    pub fn cgroup_string(&self) -> String {
        format!(
            "{} {}:{} {}",
            self.dev_type,
            device_number_string(self.major),
            device_number_string(self.minor),
            self.permissions
        )
    }

    pub fn is_block(&self) -> bool {
        self.dev_type == "b"
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.path_on_host, self.path, self.permissions)
    }
}

fn device_number_string(number: i64) -> String {
    if number == WILDCARD {
        return "*".to_string();
    }
    number.to_string()
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddDeviceMsg {
    #[serde(rename = "Force")]
    pub force: bool,
    #[serde(rename = "Device")]
    pub device: Device,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
    #[serde(rename = "HostPath")]
    pub host_path: String,
    #[serde(rename = "IsDir")]
    pub is_dir: bool,
    /// source of the in-container mount, reached through the transfer path
    #[serde(rename = "ResolvPath")]
    pub resolv_path: String,
    #[serde(rename = "ContainerPath")]
    pub container_path: String,
    #[serde(rename = "MountOption")]
    pub mount_option: String,
    #[serde(rename = "UID")]
    pub uid: i32,
    #[serde(rename = "GID")]
    pub gid: i32,
}

impl Display for Bind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.host_path, self.container_path, self.mount_option
        )
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qos {
    pub major: i64,
    pub minor: i64,
    pub path: String,
    pub value: String,
}

impl Display for Qos {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} {}", self.major, self.minor, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QosType {
    ReadIops,
    WriteIops,
    ReadBps,
    WriteBps,
    BlkioWeight,
}

impl QosType {
    pub const ALL: [QosType; 5] = [
        QosType::ReadIops,
        QosType::WriteIops,
        QosType::ReadBps,
        QosType::WriteBps,
        QosType::BlkioWeight,
    ];

    /// blkio controller file carrying this limit
    pub fn cgroup_file(&self) -> &'static str {
        match self {
            QosType::ReadIops => "blkio.throttle.read_iops_device",
            QosType::WriteIops => "blkio.throttle.write_iops_device",
            QosType::ReadBps => "blkio.throttle.read_bps_device",
            QosType::WriteBps => "blkio.throttle.write_bps_device",
            QosType::BlkioWeight => "blkio.weight_device",
        }
    }
}

#[derive(Default, Debug, Clone)]
pub struct AddDeviceOptions {
    pub read_bps: Vec<Qos>,
    pub write_bps: Vec<Qos>,
    pub read_iops: Vec<Qos>,
    pub write_iops: Vec<Qos>,
    pub blkio_weight: Vec<Qos>,
    pub force: bool,
    pub update_config_only: bool,
}

impl AddDeviceOptions {
    pub fn qos(&self, kind: QosType) -> &[Qos] {
        match kind {
            QosType::ReadIops => &self.read_iops,
            QosType::WriteIops => &self.write_iops,
            QosType::ReadBps => &self.read_bps,
            QosType::WriteBps => &self.write_bps,
            QosType::BlkioWeight => &self.blkio_weight,
        }
    }

    pub fn has_qos(&self) -> bool {
        QosType::ALL.iter().any(|k| !self.qos(*k).is_empty())
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sysctl {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value")]
    pub value: String,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    #[serde(rename = "Source")]
    pub source: String,
    #[serde(rename = "Destination")]
    pub destination: String,
    /// "move", "bind", "link" or a filesystem type
    #[serde(rename = "Type")]
    pub mount_type: String,
    #[serde(rename = "Options")]
    pub options: String,
    #[serde(rename = "UID")]
    pub uid: i32,
    #[serde(rename = "GID")]
    pub gid: i32,
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConf {
    #[serde(rename = "Ip")]
    pub ip: String,
    #[serde(rename = "Mac")]
    pub mac: String,
    #[serde(rename = "Mtu")]
    pub mtu: i32,
    #[serde(rename = "Qlen")]
    pub qlen: i32,
    #[serde(rename = "Type")]
    pub nic_type: String,
    #[serde(rename = "Bridge")]
    pub bridge: String,
    #[serde(rename = "HostNicName")]
    pub host_nic_name: String,
    #[serde(rename = "CtrNicName")]
    pub ctr_nic_name: String,
}

impl Display for InterfaceConf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Type:{},ip:{},name:{}->{}",
            self.nic_type, self.ip, self.host_nic_name, self.ctr_nic_name
        )
    }
}

impl InterfaceConf {
    /// Two interfaces conflict when they would fight over a name, a mac or an address.
    pub fn conflicts_with(&self, other: &InterfaceConf) -> anyhow::Result<()> {
        if self.ctr_nic_name == other.ctr_nic_name {
            return Err(anyhow!("interface name conflict: {}", self.ctr_nic_name));
        }
        if self.host_nic_name == other.host_nic_name {
            return Err(anyhow!("interface name conflict: {}", self.host_nic_name));
        }
        if !self.mac.is_empty() && self.mac == other.mac {
            return Err(anyhow!("interface mac conflict: {}", self.mac));
        }
        if self.ip == other.ip {
            return Err(anyhow!("interface ip conflict: {}", self.ip));
        }
        Ok(())
    }

    /// Filter match: empty strings and zero numbers in `self` match anything.
    pub fn matches(&self, other: &InterfaceConf) -> bool {
        wildcard_eq(&self.ip, &other.ip)
            && wildcard_eq(&self.mac, &other.mac)
            && (self.mtu == 0 || self.mtu == other.mtu)
            && (self.qlen == 0 || self.qlen == other.qlen)
            && wildcard_eq(&self.nic_type, &other.nic_type)
            && wildcard_eq(&self.bridge, &other.bridge)
            && wildcard_eq(&self.host_nic_name, &other.host_nic_name)
            && wildcard_eq(&self.ctr_nic_name, &other.ctr_nic_name)
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub dest: String,
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub gw: String,
    #[serde(default)]
    pub dev: String,
}

impl Display for Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{dest:{},src:{},gw:{},dev:{}}}",
            self.dest, self.src, self.gw, self.dev
        )
    }
}

impl Route {
    pub fn matches(&self, other: &Route) -> bool {
        wildcard_eq(&self.dest, &other.dest)
            && wildcard_eq(&self.src, &other.src)
            && wildcard_eq(&self.gw, &other.gw)
            && wildcard_eq(&self.dev, &other.dev)
    }
}

fn wildcard_eq(filter: &str, value: &str) -> bool {
    filter.is_empty() || filter == value
}
