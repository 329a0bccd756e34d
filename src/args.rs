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
use clap::{Parser, Subcommand};

use crate::hooks::Phase;

#[derive(Parser, Debug)]
#[command(name = "syscontainer-tools", author, version, about = "Enhanced tools for system containers", long_about = None)]
pub struct Args {
    /// Config file path, default is `/etc/syscontainer-tools/config.toml`
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<String>,

    // log_level is optional and should not have default value if not given, since
    // it can be defined in configuration file.
    /// Logging level [trace, debug, info, warn, error]
    #[arg(long, value_name = "STRING", global = true)]
    pub log_level: Option<String>,

    /// Log file path, logs go to stderr when not set
    #[arg(long, value_name = "FILE", global = true)]
    pub log: Option<String>,

    /// Pid of the container init, asked from the container runtime when not set
    #[arg(long, global = true)]
    pub pid: Option<i32>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add one or more host devices to container
    AddDevice(AddDeviceArgs),
    /// Remove one or more devices from container
    RemoveDevice(RemoveDeviceArgs),
    /// List all devices in container
    ListDevice(ListDeviceArgs),
    /// Update the throttles of devices in container
    UpdateDevice(UpdateDeviceArgs),
    /// Add one or more host paths to container
    AddPath(PathArgs),
    /// Remove one or more paths from container
    RemovePath(PathArgs),
    /// List all paths mounted to container
    ListPath(ListArgs),
    /// Create a new network interface for container
    AddNic(AddNicArgs),
    /// Remove a network interface from container
    RemoveNic(RemoveNicArgs),
    /// List network interfaces in container
    ListNic(ListFilterArgs),
    /// Update a network interface in container
    UpdateNic(UpdateNicArgs),
    /// Add network route rules into container
    AddRoute(RouteArgs),
    /// Remove network route rules from container
    RemoveRoute(RouteArgs),
    /// List network route rules in container
    ListRoute(ListFilterArgs),
}

#[derive(clap::Args, Debug, Default)]
pub struct QosArgs {
    /// Limit read rate (bytes per second) from a device
    #[arg(long = "device-read-bps", value_name = "PATH:RATE")]
    pub read_bps: Vec<String>,
    /// Limit write rate (bytes per second) to a device
    #[arg(long = "device-write-bps", value_name = "PATH:RATE")]
    pub write_bps: Vec<String>,
    /// Limit read rate (IO per second) from a device
    #[arg(long = "device-read-iops", value_name = "PATH:RATE")]
    pub read_iops: Vec<String>,
    /// Limit write rate (IO per second) to a device
    #[arg(long = "device-write-iops", value_name = "PATH:RATE")]
    pub write_iops: Vec<String>,
}

impl QosArgs {
    pub fn is_empty(&self) -> bool {
        self.read_bps.is_empty()
            && self.write_bps.is_empty()
            && self.read_iops.is_empty()
            && self.write_iops.is_empty()
    }
}

#[derive(clap::Args, Debug)]
pub struct AddDeviceArgs {
    pub container: String,
    /// hostdevice[:containerdevice][:permission]
    #[arg(required = true)]
    pub devices: Vec<String>,
    #[command(flatten)]
    pub qos: QosArgs,
    /// Set block IO weight (relative device weight, between 10 and 1000)
    #[arg(long = "blkio-weight-device", value_name = "PATH:WEIGHT")]
    pub blkio_weight: Vec<String>,
    /// If disk is a base device, add all the sub partitions to container
    #[arg(long)]
    pub follow_partition: bool,
    /// If device exists in container, will cover the old file
    #[arg(long)]
    pub force: bool,
    /// Update config only, the device is not added to the container
    #[arg(long)]
    pub update_config_only: bool,
}

#[derive(clap::Args, Debug)]
pub struct RemoveDeviceArgs {
    pub container: String,
    /// hostdevice[:containerdevice]
    #[arg(required = true)]
    pub devices: Vec<String>,
    /// If disk is a base device, remove all the sub partitions from container
    #[arg(long)]
    pub follow_partition: bool,
}

#[derive(clap::Args, Debug)]
pub struct ListDeviceArgs {
    pub container: String,
    /// List in pretty json form
    #[arg(short, long)]
    pub pretty: bool,
    /// List the sub partitions of base disks too
    #[arg(long)]
    pub sub_partition: bool,
}

#[derive(clap::Args, Debug)]
pub struct UpdateDeviceArgs {
    pub container: String,
    #[command(flatten)]
    pub qos: QosArgs,
}

#[derive(clap::Args, Debug)]
pub struct PathArgs {
    pub container: String,
    /// hostpath:containerpath[:permission]
    #[arg(required = true)]
    pub paths: Vec<String>,
}

#[derive(clap::Args, Debug)]
pub struct ListArgs {
    pub container: String,
    /// List in pretty json form
    #[arg(short, long)]
    pub pretty: bool,
}

#[derive(clap::Args, Debug)]
pub struct ListFilterArgs {
    pub container: String,
    /// List in pretty json form
    #[arg(short, long)]
    pub pretty: bool,
    /// Filter output by a json object, e.g. '{"Ip":"1.2.3.4/24"}'
    #[arg(short, long, value_name = "JSON")]
    pub filter: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct AddNicArgs {
    pub container: String,
    /// Network interface type (veth/eth)
    #[arg(long = "type", default_value = "veth")]
    pub nic_type: String,
    /// [host:]<container>, the host name of a veth is random when unset
    #[arg(long)]
    pub name: String,
    /// Ip address, e.g. 172.17.28.2/24
    #[arg(long, default_value = "")]
    pub ip: String,
    /// Mac address, e.g. 00:ff:48:23:e2:bb
    #[arg(long, default_value = "")]
    pub mac: String,
    /// Bridge the interface is attached to, not for eth
    #[arg(long, default_value = "")]
    pub bridge: String,
    #[arg(long, default_value_t = 1500)]
    pub mtu: i32,
    #[arg(long, default_value_t = 1000)]
    pub qlen: i32,
    /// Update config only, the interface is not added to the container
    #[arg(long)]
    pub update_config_only: bool,
}

#[derive(clap::Args, Debug)]
pub struct RemoveNicArgs {
    pub container: String,
    /// Network interface type (veth/eth)
    #[arg(long = "type", default_value = "")]
    pub nic_type: String,
    /// [host:]<container>
    #[arg(long)]
    pub name: String,
}

#[derive(clap::Args, Debug)]
pub struct UpdateNicArgs {
    pub container: String,
    /// Interface name in container
    #[arg(long)]
    pub name: String,
    #[arg(long, default_value = "")]
    pub ip: String,
    #[arg(long, default_value = "")]
    pub mac: String,
    #[arg(long, default_value = "")]
    pub bridge: String,
    /// 0 keeps the old value
    #[arg(long, default_value_t = 0)]
    pub mtu: i32,
    /// Keeps the old value when unset
    #[arg(long)]
    pub qlen: Option<i32>,
    #[arg(long)]
    pub update_config_only: bool,
}

#[derive(clap::Args, Debug)]
pub struct RouteArgs {
    pub container: String,
    /// Json list, e.g. '[{"dest":"default","gw":"192.168.10.1"}]'
    pub rules: String,
    /// Update config only, the container routing table is left alone
    #[arg(long)]
    pub update_config_only: bool,
}

/// `[host:]ctr` into (host, ctr).
pub fn parse_nic_name(name: &str) -> (String, String) {
    match name.split_once(':') {
        Some((host, ctr)) => (host.to_string(), ctr.to_string()),
        None => (String::new(), name.to_string()),
    }
}

#[derive(Parser, Debug)]
#[command(name = "syscontainer-hooks", author, version, about = "OCI hooks of syscontainer-tools", long_about = None)]
pub struct HookArgs {
    /// Config file path, default is `/etc/syscontainer-tools/config.toml`
    #[arg(long, value_name = "FILE")]
    pub config: Option<String>,

    /// Log file path, logs go to stderr when not set
    #[arg(long, value_name = "FILE")]
    pub log: Option<String>,

    /// Hook state: prestart, poststart or poststop
    #[arg(long, value_name = "STATE")]
    pub state: Phase,

    /// Relabel the container rootfs
    #[arg(long)]
    pub with_relabel: bool,
}
