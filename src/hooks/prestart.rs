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

use std::{
    fs::{DirBuilder, OpenOptions},
    os::unix::fs::{DirBuilderExt, OpenOptionsExt},
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::anyhow;
use lazy_static::lazy_static;
use log::{debug, error, info};
use oci_spec::runtime::{Mount as OciMount, Spec};
use regex::Regex;

use super::{relabel::prestart_relabel, run_actions, HookAction, HookContext, RunPolicy};
use crate::{
    bind::parse_bind,
    config::DeviceMapping,
    container::user_ns_ids,
    device::{device_type, get_device_num, parse_device, update_device_owner},
    mount::bind_mount,
    ops::{device::close_udev, device::open_udev, nic::add_nic_to_container},
    transfer::{prepare_host_path, prepare_transfer_path, transfer_base_bind},
    types::{Mount, Qos, QosType, Sysctl},
    udevd::{UdevController, UdevRule},
    utils::execute,
};

const KERNEL_MODULES_ENV: &str = "KERNEL_MODULES";

lazy_static! {
    static ref MODULE_NAME: Regex = Regex::new(r"^[A-Za-z0-9\-_]*$").unwrap();
}

/// Nodes recreated in a remounted `/dev` on top of the ones the spec lists.
const EXTRA_DEVICES: [&str; 2] = ["/dev/full", "/dev/tty"];

const DEV_LINKS: [(&str, &str); 6] = [
    ("/proc/self/fd", "/dev/fd"),
    ("/proc/self/fd/0", "/dev/stdin"),
    ("/proc/self/fd/1", "/dev/stdout"),
    ("/proc/self/fd/2", "/dev/stderr"),
    ("pts/ptmx", "/dev/ptmx"),
    ("/proc/kcore", "/dev/core"),
];

pub fn run(ctx: &mut HookContext, with_relabel: bool) -> anyhow::Result<()> {
    let mut actions: Vec<(&str, HookAction)> = vec![
        ("share path", share_path),
        ("adjust userns", adjust_userns),
        ("add devices", add_devices),
        ("add binds", add_binds),
        ("update qos", update_qos),
        ("update network", update_network),
        ("load kernel modules", load_kernel_modules),
    ];
    if with_relabel {
        actions.push(("relabel", prestart_relabel));
    }
    run_actions(RunPolicy::AbortOnError, &actions, ctx)
}

fn in_root(root: &str, path: &str) -> String {
    Path::new(root)
        .join(path.trim_start_matches('/'))
        .to_string_lossy()
        .to_string()
}

/// Device argument of a recorded device, its container path inside `root`.
pub(crate) fn device_in_root(root: &str, dev: &DeviceMapping) -> String {
    format!(
        "{}:{}:{}",
        dev.path_on_host,
        in_root(root, &dev.path_in_container),
        dev.cgroup_permissions
    )
}

/// Joins the container to the host side of the shared paths.
fn share_path(ctx: &mut HookContext) -> anyhow::Result<()> {
    let state = ctx.state;
    prepare_host_path(&state.id)?;
    ctx.backends
        .driver
        .add_transfer_base(state.pid, &transfer_base_bind(&state.root, &state.id))
}

/// Applies the spec sysctls and rebuilds a tmpfs `/dev` owned by the
/// container's root user. Only for containers with id mappings.
fn adjust_userns(ctx: &mut HookContext) -> anyhow::Result<()> {
    let linux = match ctx.spec.linux() {
        Some(l) => l,
        None => return Ok(()),
    };
    let no_uid_maps = linux.uid_mappings().as_ref().map_or(true, |m| m.is_empty());
    let no_gid_maps = linux.gid_mappings().as_ref().map_or(true, |m| m.is_empty());
    if no_uid_maps && no_gid_maps {
        return Ok(());
    }

    let driver = ctx.backends.driver;
    for (key, value) in linux.sysctl().iter().flatten() {
        let sysctl = Sysctl {
            key: key.clone(),
            value: value.clone(),
        };
        driver.update_sysctl(ctx.state.pid, &sysctl).map_err(|e| {
            error!("update sysctl {}:{} failed, {}", key, value, e);
            e
        })?;
    }

    for m in ctx.spec.mounts().iter().flatten() {
        if !is_dev_tmpfs(m) {
            continue;
        }
        for mnt in dev_remounts(&ctx.state.root, ctx.spec, m) {
            if let Err(e) = driver.mount(ctx.state.pid, &mnt) {
                error!(
                    "{} {} to {} failed: {}",
                    mnt.mount_type, mnt.source, mnt.destination, e
                );
            }
        }
    }
    Ok(())
}

fn is_dev_tmpfs(m: &OciMount) -> bool {
    m.destination() == Path::new("/dev")
        && m.typ().as_deref() == Some("tmpfs")
        && m.source().as_deref() == Some(Path::new("tmpfs"))
}

/// Mount steps that move the runtime's `/dev` aside, put a tmpfs owned by
/// the mapped root in its place and bring the nodes back.
fn dev_remounts(root: &str, spec: &Spec, dev: &OciMount) -> Vec<Mount> {
    let rootfs_dev = in_root(root, "/dev");
    let rootfs_bak_dev = in_root(root, "/.dev");
    let (uid, gid) = user_ns_ids(spec);
    let base_options = dev.options().clone().unwrap_or_default();

    let mut options = base_options.clone();
    options.push("dev".to_string());
    if uid != -1 {
        options.push(format!("uid={}", uid));
    }
    if gid != -1 {
        options.push(format!("gid={}", gid));
    }
    let mut remount_options = base_options;
    remount_options.push("remount".to_string());

    let mut mounts = vec![
        Mount {
            source: rootfs_dev.clone(),
            destination: rootfs_bak_dev.clone(),
            mount_type: "move".to_string(),
            ..Default::default()
        },
        Mount {
            source: "tmpfs".to_string(),
            destination: rootfs_dev.clone(),
            mount_type: "tmpfs".to_string(),
            options: options.join(","),
            ..Default::default()
        },
        Mount {
            source: rootfs_dev.clone(),
            destination: rootfs_dev,
            mount_type: "tmpfs".to_string(),
            options: remount_options.join(","),
            ..Default::default()
        },
    ];

    let (uid, gid) = (uid.max(0), gid.max(0));
    let sub_mounts = spec
        .mounts()
        .iter()
        .flatten()
        .map(|m| m.destination().clone());
    let devices = spec
        .linux()
        .as_ref()
        .and_then(|l| l.devices().clone())
        .unwrap_or_default()
        .into_iter()
        .map(|d| d.path().clone())
        .chain(EXTRA_DEVICES.iter().map(PathBuf::from));
    for path in sub_mounts.chain(devices) {
        if path == Path::new("/dev") || !path.to_string_lossy().contains("/dev") {
            continue;
        }
        let name = match path.file_name() {
            Some(n) => n.to_string_lossy().to_string(),
            None => continue,
        };
        mounts.push(Mount {
            source: Path::new(&rootfs_bak_dev)
                .join(&name)
                .to_string_lossy()
                .to_string(),
            destination: in_root(root, &format!("/dev/{}", name)),
            mount_type: "bind".to_string(),
            options: "bind".to_string(),
            uid,
            gid,
        });
    }

    for (src, link) in DEV_LINKS {
        mounts.push(Mount {
            source: src.to_string(),
            destination: in_root(root, link),
            mount_type: "link".to_string(),
            options: String::new(),
            uid,
            gid,
        });
    }
    mounts
}

/// Replays the recorded devices with the numbers they have on the host now.
fn add_devices(ctx: &mut HookContext) -> anyhow::Result<()> {
    let mut udev = open_udev(ctx.settings)?;
    let res = replay_devices(ctx, &mut udev);
    info!("start sync rules to disk");
    close_udev(udev);
    res
}

fn replay_devices(ctx: &mut HookContext, udev: &mut UdevController) -> anyhow::Result<()> {
    let state = ctx.state;
    let mappings = ctx.config.devices().to_vec();
    for dev in mappings {
        let resolv = device_in_root(&state.root, &dev);
        let mut device = parse_device(&resolv).map_err(|e| {
            error!("add device ({}), parse device failed: {}", resolv, e);
            e
        })?;
        if dev.major != device.major || dev.minor != device.minor {
            ctx.config
                .update_device_node(&dev.path_on_host, device.major, device.minor);
        }

        if device.dev_type != "c" && device_type(&device.path_on_host)? == "disk" {
            udev.add_rule(UdevRule::new(
                &dev.path_on_host,
                &dev.path_in_container,
                &state.id,
            ));
        }

        update_device_owner(Some(ctx.spec), &mut device);
        ctx.backends
            .driver
            .add_device(state.pid, &device, true)
            .map_err(|e| anyhow!("add device ({}) failed, {}", resolv, e))?;
        ctx.backends
            .cgroup
            .update_permission(&device, true)
            .map_err(|e| anyhow!("update add device ({}) cgroup failed, {}", resolv, e))?;
    }
    Ok(())
}

/// Failures are logged per bind, the remaining binds still go in.
fn add_binds(ctx: &mut HookContext) -> anyhow::Result<()> {
    let state = ctx.state;
    for bind_str in ctx.config.binds().to_vec() {
        let mut bind = match resolve_bind(&state.root, &bind_str)
            .and_then(|s| parse_bind(&s, Some(ctx.spec), true))
        {
            Ok(b) => b,
            Err(e) => {
                error!("parse bind {} error, {}, skipping", bind_str, e);
                continue;
            }
        };
        if let Err(e) = prepare_transfer_path(&state.root, &state.id, &mut bind, true) {
            error!("prepare transfer path ({}) failed, {}", bind_str, e);
        }
        if let Err(e) = ctx.backends.driver.add_bind(state.pid, &bind) {
            error!("add bind ({}) failed, {}", bind_str, e);
        }
    }
    Ok(())
}

/// `host:ctr:options` with the container side moved under `root`.
pub(crate) fn resolve_bind(root: &str, bind_str: &str) -> anyhow::Result<String> {
    let arr: Vec<&str> = bind_str.splitn(3, ':').collect();
    if arr.len() < 3 {
        return Err(anyhow!("bind {} lack of \":\"", bind_str));
    }
    Ok(format!("{}:{}:{}", arr[0], in_root(root, arr[1]), arr[2]))
}

fn update_qos(ctx: &mut HookContext) -> anyhow::Result<()> {
    for kind in QosType::ALL {
        for qos in ctx.config.qos(kind).to_vec() {
            let (major, minor) = get_device_num(&qos.path).map_err(|e| {
                error!("failed to update device num ({}) for container, {}", qos, e);
                e
            })?;
            ctx.config.update_device_node(&qos.path, major, minor);
            let current = Qos {
                major,
                minor,
                ..qos
            };
            ctx.backends
                .cgroup
                .update_qos(kind, &current.to_string())
                .map_err(|e| {
                    anyhow!(
                        "failed to update {} ({}) for container {}, {}",
                        kind.cgroup_file(),
                        current,
                        ctx.state.id,
                        e
                    )
                })?;
        }
    }
    Ok(())
}

/// Pins the container netns under the tools directory for poststop and
/// replays the interfaces and routes into it.
fn update_network(ctx: &mut HookContext) -> anyhow::Result<()> {
    let ns_path = format!("/proc/{}/ns/net", ctx.state.pid);
    let dir = ctx.settings.netns_dir();
    DirBuilder::new()
        .recursive(true)
        .mode(0o600)
        .create(&dir)
        .map_err(|e| anyhow!("failed to create netns dir {}, {}", dir.display(), e))?;
    let file = dir.join(&ctx.state.id);
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(&file)
        .map_err(|e| anyhow!("failed to create netns file {}, {}", file.display(), e))?;
    bind_mount(&ns_path, &file.to_string_lossy())
        .map_err(|e| anyhow!("failed to mount netns file, {}", e))?;
    replay_network(ctx, &ns_path)
}

fn replay_network(ctx: &mut HookContext, ns_path: &str) -> anyhow::Result<()> {
    let network = ctx.backends.network;
    for nic in ctx.config.network_interfaces(&Default::default()) {
        add_nic_to_container(network, ns_path, nic).map_err(|e| {
            anyhow!(
                "failed to add network interface ({}) to container {}, {}",
                nic,
                ctx.state.id,
                e
            )
        })?;
    }
    for route in ctx.config.routes(&Default::default()) {
        network.add_route(ns_path, route).map_err(|e| {
            anyhow!(
                "failed to add route rule ({}) to container {}, {}",
                route,
                ctx.state.id,
                e
            )
        })?;
    }
    Ok(())
}

/// Module names from `KERNEL_MODULES=a,b,c` in the process environment.
fn kernel_modules(env: &[String]) -> anyhow::Result<Vec<String>> {
    let value = env.iter().find_map(|e| {
        e.split_once('=')
            .filter(|(k, _)| *k == KERNEL_MODULES_ENV)
            .map(|(_, v)| v)
    });
    let mut modules = vec![];
    for module in value.unwrap_or_default().split(',') {
        if module.is_empty() {
            continue;
        }
        if !MODULE_NAME.is_match(module) {
            return Err(anyhow!(
                "failed to modprobe modules by module name is incorrect: {}",
                module
            ));
        }
        modules.push(module.to_string());
    }
    Ok(modules)
}

fn load_kernel_modules(ctx: &mut HookContext) -> anyhow::Result<()> {
    let env = ctx
        .spec
        .process()
        .as_ref()
        .and_then(|p| p.env().clone())
        .unwrap_or_default();
    let modules = kernel_modules(&env)?;
    if modules.is_empty() {
        return Ok(());
    }
    debug!("modprobe {:?}", modules);
    let mut cmd = Command::new("modprobe");
    cmd.arg("-a").args(&modules);
    execute(cmd).map_err(|e| anyhow!("failed to modprobe modules ({:?}) to host, {}", modules, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use oci_spec::runtime::{
        LinuxBuilder, LinuxIdMappingBuilder, LinuxNamespaceBuilder, LinuxNamespaceType, MountBuilder,
        Spec, SpecBuilder,
    };
    use temp_dir::TempDir;

    use super::{
        add_devices, adjust_userns, dev_remounts, kernel_modules, replay_network, resolve_bind,
    };
    use crate::{
        config::HookConfig,
        hooks::{tests::state, HookContext},
        ops::tests::{backends, settings, FakeCgroup, FakeDriver, FakeNetwork},
        types::{Device, InterfaceConf, Route},
    };

    fn userns_spec() -> Spec {
        let map = LinuxIdMappingBuilder::default()
            .container_id(0u32)
            .host_id(100000u32)
            .size(65536u32)
            .build()
            .unwrap();
        let linux = LinuxBuilder::default()
            .namespaces(vec![LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::User)
                .build()
                .unwrap()])
            .uid_mappings(vec![map.clone()])
            .gid_mappings(vec![map])
            .sysctl(HashMap::from([(
                "net.ipv4.ip_forward".to_string(),
                "1".to_string(),
            )]))
            .build()
            .unwrap();
        let dev = MountBuilder::default()
            .destination("/dev")
            .typ("tmpfs")
            .source("tmpfs")
            .options(vec!["nosuid".to_string(), "mode=755".to_string()])
            .build()
            .unwrap();
        let pts = MountBuilder::default()
            .destination("/dev/pts")
            .typ("devpts")
            .source("devpts")
            .build()
            .unwrap();
        SpecBuilder::default()
            .linux(linux)
            .mounts(vec![dev, pts])
            .build()
            .unwrap()
    }

    #[test]
    fn test_dev_remounts() {
        let spec = userns_spec();
        let dev = &spec.mounts().as_ref().unwrap()[0];
        let mounts = dev_remounts("/rootfs", &spec, dev);

        assert_eq!(mounts[0].mount_type, "move");
        assert_eq!(mounts[0].source, "/rootfs/dev");
        assert_eq!(mounts[0].destination, "/rootfs/.dev");
        assert_eq!(mounts[1].options, "nosuid,mode=755,dev,uid=100000,gid=100000");
        assert_eq!(mounts[2].options, "nosuid,mode=755,remount");

        let binds: Vec<&str> = mounts
            .iter()
            .filter(|m| m.mount_type == "bind")
            .map(|m| m.destination.as_str())
            .collect();
        assert_eq!(binds, vec!["/rootfs/dev/pts", "/rootfs/dev/full", "/rootfs/dev/tty"]);
        assert!(mounts
            .iter()
            .filter(|m| m.mount_type == "bind")
            .all(|m| m.uid == 100000 && m.gid == 100000));

        let links: Vec<&str> = mounts
            .iter()
            .filter(|m| m.mount_type == "link")
            .map(|m| m.destination.as_str())
            .collect();
        assert_eq!(links.len(), 6);
        assert_eq!(links[4], "/rootfs/dev/ptmx");
    }

    #[test]
    fn test_adjust_userns() {
        let dir = TempDir::new().unwrap();
        let (driver, cgroup, net) = (
            FakeDriver::default(),
            FakeCgroup::default(),
            FakeNetwork::default(),
        );
        let b = backends(&driver, &cgroup, &net);
        let s = settings(&dir);
        let st = state(42, "/rootfs");
        let mut config = HookConfig::default();

        // without id mappings nothing is touched
        let plain = SpecBuilder::default().build().unwrap();
        let mut ctx = HookContext {
            state: &st,
            spec: &plain,
            config: &mut config,
            settings: &s,
            backends: &b,
        };
        adjust_userns(&mut ctx).unwrap();
        assert!(driver.calls.borrow().is_empty());

        let spec = userns_spec();
        ctx.spec = &spec;
        adjust_userns(&mut ctx).unwrap();
        let calls = driver.calls.borrow();
        assert_eq!(calls[0], "update_sysctl net.ipv4.ip_forward");
        assert_eq!(calls[1], "mount /rootfs/.dev");
        assert_eq!(calls.len(), 1 + 3 + 3 + 6);
    }

    #[test]
    fn test_add_devices_refreshes_numbers() {
        let dir = TempDir::new().unwrap();
        let (driver, cgroup, net) = (
            FakeDriver::default(),
            FakeCgroup::default(),
            FakeNetwork::default(),
        );
        let b = backends(&driver, &cgroup, &net);
        let s = settings(&dir);
        let st = state(42, "/rootfs");
        let spec = SpecBuilder::default().build().unwrap();
        let mut config = HookConfig::default();
        config
            .update_device(
                &Device {
                    dev_type: "c".to_string(),
                    path: "/dev/mynull".to_string(),
                    path_on_host: "/dev/null".to_string(),
                    major: 0,
                    minor: 0,
                    permissions: "rwm".to_string(),
                    ..Default::default()
                },
                true,
            )
            .unwrap();

        let mut ctx = HookContext {
            state: &st,
            spec: &spec,
            config: &mut config,
            settings: &s,
            backends: &b,
        };
        add_devices(&mut ctx).unwrap();
        assert_eq!(*driver.calls.borrow(), vec!["add_device /rootfs/dev/mynull"]);
        assert_eq!(*cgroup.writes.borrow(), vec!["allow c 1:3 rwm"]);
        let dev = &config.devices()[0];
        assert_eq!((dev.major, dev.minor), (1, 3));
    }

    #[test]
    fn test_replay_network_aborts_on_failure() {
        let dir = TempDir::new().unwrap();
        let (driver, cgroup) = (FakeDriver::default(), FakeCgroup::default());
        let mut net = FakeNetwork::default();
        net.fail.insert("10.1.0.0/16".to_string());
        let b = backends(&driver, &cgroup, &net);
        let s = settings(&dir);
        let st = state(42, "/rootfs");
        let spec = SpecBuilder::default().build().unwrap();
        let mut config = HookConfig::default();
        config
            .update_network_interface(
                &InterfaceConf {
                    ip: "10.0.0.2/24".to_string(),
                    nic_type: "veth".to_string(),
                    host_nic_name: "veth1".to_string(),
                    ctr_nic_name: "eth1".to_string(),
                    ..Default::default()
                },
                true,
            )
            .unwrap();
        for dest in ["10.1.0.0/16", "10.2.0.0/16"] {
            config
                .update_network_route(
                    &Route {
                        dest: dest.to_string(),
                        dev: "eth1".to_string(),
                        ..Default::default()
                    },
                    true,
                )
                .unwrap();
        }

        let mut ctx = HookContext {
            state: &st,
            spec: &spec,
            config: &mut config,
            settings: &s,
            backends: &b,
        };
        assert!(replay_network(&mut ctx, "/proc/42/ns/net").is_err());
        assert_eq!(
            *net.calls.borrow(),
            vec!["create eth1", "join eth1", "add_route 10.1.0.0/16"]
        );
    }

    #[test]
    fn test_kernel_modules() {
        let env = vec![
            "PATH=/usr/bin".to_string(),
            "KERNEL_MODULES=ip_vs,,nf_nat".to_string(),
        ];
        assert_eq!(kernel_modules(&env).unwrap(), vec!["ip_vs", "nf_nat"]);
        assert!(kernel_modules(&["PATH=/bin".to_string()]).unwrap().is_empty());
        assert!(kernel_modules(&["KERNEL_MODULES=ip_vs;reboot".to_string()]).is_err());
        assert!(kernel_modules(&["MY_KERNEL_MODULES=x.y".to_string()])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_resolve_bind() {
        assert_eq!(
            resolve_bind("/rootfs", "/data:/mnt/data:rw,rslave").unwrap(),
            "/data:/rootfs/mnt/data:rw,rslave"
        );
        assert_eq!(
            resolve_bind("/", "/data:/mnt/data:ro").unwrap(),
            "/data:/mnt/data:ro"
        );
        assert!(resolve_bind("/rootfs", "/data:/mnt/data").is_err());
    }
}
