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
use clap::Parser;
use log::{error, info};
use serde::Serialize;
use syscontainer_tools::{
    args::{parse_nic_name, Args, Command, ListFilterArgs, QosArgs, RouteArgs},
    bind::parse_bind,
    cgroup::FsCgroupWriter,
    container::Container,
    device::{parse_blkio_weight, parse_qos_options},
    network::{host_link_exists, valid_network_config, NetlinkBackend},
    nsexec::{worker::run_if_worker, Driver},
    ops::{self, Backends},
    settings::Settings,
    types::{AddDeviceOptions, Bind, InterfaceConf, Route},
    utils::{format_json, ignore_signals, init_logger},
};

fn main() {
    run_if_worker();
    let args = Args::parse();
    if let Err(e) = run(args) {
        error!("{:#}", e);
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    ignore_signals()?;
    let settings = Settings::load(Settings::config_path(args.config.as_deref()))?;
    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| settings.log_level.clone());
    init_logger(&log_level, args.log.as_deref())?;
    if let Err(e) = std::fs::create_dir_all(&settings.tool_dir) {
        error!("failed to create {}, {}", settings.tool_dir, e);
    }

    let tool = Tool {
        settings: &settings,
        pid: args.pid,
    };
    match args.command {
        Command::AddDevice(a) => {
            let opts = AddDeviceOptions {
                blkio_weight: parse_blkio_weight(&a.blkio_weight)?,
                force: a.force,
                update_config_only: a.update_config_only,
                ..qos_options(&a.qos)?
            };
            let mut devices = ops::collect_devices(&a.devices, a.follow_partition)?;
            let mut c = tool.container(&a.container)?;
            ops::set_devices_path(&mut c, &mut devices)?;
            let cgroup_path = c.cgroup_path()?;
            with_backends(c.pid(), &cgroup_path, |b| {
                ops::add_device(&mut c, &settings, b, devices, &opts)
            })
            .map_err(|e| anyhow!("failed to add device: {:#}", e))?;
            info!("add device to container {} successfully", a.container);
        }
        Command::RemoveDevice(a) => {
            let mut c = tool.container(&a.container)?;
            let mut devices = ops::collect_mappings(&a.devices)?;
            ops::set_devices_path(&mut c, &mut devices)?;
            let cgroup_path = c.cgroup_path()?;
            with_backends(c.pid(), &cgroup_path, |b| {
                ops::remove_device(&mut c, &settings, b, devices, a.follow_partition)
            })
            .map_err(|e| anyhow!("failed to remove device: {:#}", e))?;
            info!("remove device from container {} successfully", a.container);
        }
        Command::ListDevice(a) => {
            let mut c = tool.container(&a.container)?;
            let devices = ops::list_device(&mut c, a.sub_partition)
                .map_err(|e| anyhow!("failed to list device in container: {:#}", e))?;
            print_list(&devices, a.pretty)?;
            info!("list devices in container {} successfully", a.container);
        }
        Command::UpdateDevice(a) => {
            if a.qos.is_empty() {
                return Err(anyhow!(
                    "update device should specify at least one device QOS configuration"
                ));
            }
            let opts = qos_options(&a.qos)?;
            let mut c = tool.container(&a.container)?;
            let cgroup_path = c.cgroup_path()?;
            with_backends(c.pid(), &cgroup_path, |b| {
                ops::update_device(&mut c, b, &opts)
            })
            .map_err(|e| anyhow!("failed to update device: {:#}", e))?;
            info!(
                "update device configure in container {} successfully",
                a.container
            );
        }
        Command::AddPath(a) => {
            let mut c = tool.container(&a.container)?;
            let binds = parse_binds(&c, &a.paths, true)?;
            with_backends(c.pid(), "", |b| ops::add_path(&mut c, b, binds))
                .map_err(|e| anyhow!("failed to add path: {:#}", e))?;
            info!("add path to container {} successfully", a.container);
        }
        Command::RemovePath(a) => {
            let mut c = tool.container(&a.container)?;
            let binds = parse_binds(&c, &a.paths, false)?;
            with_backends(c.pid(), "", |b| ops::remove_path(&mut c, b, binds))
                .map_err(|e| anyhow!("failed to remove path: {:#}", e))?;
            info!("remove path from container {} successfully", a.container);
        }
        Command::ListPath(a) => {
            let mut c = tool.container(&a.container)?;
            let binds = ops::list_path(&mut c)
                .map_err(|e| anyhow!("failed to list path in container: {:#}", e))?;
            print_list(&binds, a.pretty)?;
            info!("list path in container {} successfully", a.container);
        }
        Command::AddNic(a) => {
            let (host, ctr) = parse_nic_name(&a.name);
            if ctr.is_empty() {
                return Err(anyhow!("failed to get container nic name"));
            }
            let mut c = tool.container(&a.container)?;
            let mut nic = InterfaceConf {
                ip: a.ip,
                mac: a.mac,
                mtu: a.mtu,
                qlen: a.qlen,
                nic_type: a.nic_type,
                bridge: a.bridge,
                host_nic_name: host,
                ctr_nic_name: ctr,
            };
            valid_network_config(&mut nic, host_link_exists)
                .map_err(|e| anyhow!("invalid network option: {:#}", e))?;
            if nic.host_nic_name.is_empty() {
                nic.host_nic_name = ops::default_host_nic_name(&nic.ctr_nic_name);
            }
            with_backends(c.pid(), "", |b| {
                ops::add_nic(&mut c, b, &nic, a.update_config_only)
            })
            .map_err(|e| anyhow!("failed to add nic into container: {:#}", e))?;
            info!("add network interface to container {} successfully", a.container);
        }
        Command::RemoveNic(a) => {
            let (host, ctr) = parse_nic_name(&a.name);
            let mut c = tool.container(&a.container)?;
            let nic = InterfaceConf {
                nic_type: a.nic_type,
                host_nic_name: host,
                ctr_nic_name: ctr,
                ..Default::default()
            };
            with_backends(c.pid(), "", |b| ops::remove_nic(&mut c, b, &nic))
                .map_err(|e| anyhow!("failed to remove nic from container: {:#}", e))?;
            info!(
                "remove network interface from container {} successfully",
                a.container
            );
        }
        Command::ListNic(a) => {
            let filter: InterfaceConf = parse_filter(&a)?;
            let mut c = tool.container(&a.container)?;
            let nics = ops::list_nic(&mut c, &filter)
                .map_err(|e| anyhow!("failed to list nic in container: {:#}", e))?;
            print_list(&nics, a.pretty)?;
            info!(
                "list network interface in container {} successfully",
                a.container
            );
        }
        Command::UpdateNic(a) => {
            if a.name.is_empty() {
                return Err(anyhow!(
                    "network interface name in container must be provided"
                ));
            }
            let mut c = tool.container(&a.container)?;
            let nic = InterfaceConf {
                ip: a.ip,
                mac: a.mac,
                mtu: a.mtu,
                qlen: a.qlen.unwrap_or(-1),
                bridge: a.bridge,
                ctr_nic_name: a.name,
                ..Default::default()
            };
            with_backends(c.pid(), "", |b| {
                ops::update_nic(&mut c, b, &nic, a.update_config_only)
            })
            .map_err(|e| anyhow!("failed to update nic in container: {:#}", e))?;
            info!(
                "update network interface in container {} successfully",
                a.container
            );
        }
        Command::AddRoute(a) => {
            let routes = parse_routes(&a)?;
            let mut c = tool.container(&a.container)?;
            with_backends(c.pid(), "", |b| {
                ops::add_routes(&mut c, b, &routes, a.update_config_only)
            })
            .map_err(|e| anyhow!("failed to add route: {:#}", e))?;
            info!("add route to container {} successfully", a.container);
        }
        Command::RemoveRoute(a) => {
            let routes = parse_routes(&a)?;
            let mut c = tool.container(&a.container)?;
            with_backends(c.pid(), "", |b| {
                ops::remove_routes(&mut c, b, &routes, a.update_config_only)
            })
            .map_err(|e| anyhow!("failed to remove route: {:#}", e))?;
            info!("remove route from container {} successfully", a.container);
        }
        Command::ListRoute(a) => {
            let filter: Route = parse_filter(&a)?;
            let mut c = tool.container(&a.container)?;
            let routes = ops::list_routes(&mut c, &filter)
                .map_err(|e| anyhow!("failed to get list routes: {:#}", e))?;
            print_list(&routes, a.pretty)?;
            info!("list route in container {} successfully", a.container);
        }
    }
    Ok(())
}

struct Tool<'a> {
    settings: &'a Settings,
    pid: Option<i32>,
}

impl<'a> Tool<'a> {
    fn container(&self, name: &str) -> anyhow::Result<Container> {
        let name = name.trim();
        if name.is_empty() {
            return Err(anyhow!("container-id can't be empty"));
        }
        Container::new(self.settings, name, self.pid)
            .map_err(|e| anyhow!("failed to get container info: {:#}", e))
    }
}

/// Production backends, the cgroup path matters only to device commands.
fn with_backends<T>(
    pid: i32,
    cgroup_path: &str,
    f: impl FnOnce(&Backends) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let driver = Driver::new();
    let cgroup = FsCgroupWriter::new(pid, cgroup_path);
    let network = NetlinkBackend::default();
    let backends = Backends {
        driver: &driver,
        cgroup: &cgroup,
        network: &network,
    };
    f(&backends)
}

fn qos_options(qos: &QosArgs) -> anyhow::Result<AddDeviceOptions> {
    Ok(AddDeviceOptions {
        read_bps: parse_qos_options(&qos.read_bps)?,
        write_bps: parse_qos_options(&qos.write_bps)?,
        read_iops: parse_qos_options(&qos.read_iops)?,
        write_iops: parse_qos_options(&qos.write_iops)?,
        ..Default::default()
    })
}

fn parse_binds(c: &Container, paths: &[String], create: bool) -> anyhow::Result<Vec<Bind>> {
    paths
        .iter()
        .map(|p| parse_bind(p, c.spec(), create))
        .collect()
}

fn parse_filter<T: serde::de::DeserializeOwned>(a: &ListFilterArgs) -> anyhow::Result<T> {
    let filter = a.filter.as_deref().map(str::trim).unwrap_or_default();
    let filter = if filter.is_empty() { "{}" } else { filter };
    serde_json::from_str(filter).map_err(|e| anyhow!("malformed filter format: {}", e))
}

fn parse_routes(a: &RouteArgs) -> anyhow::Result<Vec<Route>> {
    let rules = a.rules.trim();
    if rules.is_empty() {
        return Err(anyhow!("rule can't be empty"));
    }
    serde_json::from_str(rules).map_err(|e| anyhow!("malformed rule format: {}", e))
}

/// Prints nothing for an empty list.
fn print_list<T: Serialize>(items: &[T], pretty: bool) -> anyhow::Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    println!("{}", format_json(items, pretty)?);
    Ok(())
}
