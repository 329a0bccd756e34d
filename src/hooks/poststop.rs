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
use log::{debug, error};
use nix::mount::MntFlags;

use super::{
    prestart::{device_in_root, resolve_bind},
    relabel::poststop_relabel,
    run_actions, HookAction, HookContext, RunPolicy,
};
use crate::{
    bind::parse_bind,
    device::{device_type, parse_device},
    mount::unmount,
    ops::{device::close_udev, device::open_udev, nic::del_nic_from_container},
    transfer::{remove_container_spec_path, remove_transfer_path},
    udevd::UdevRule,
};

/// Cleanup is best effort, every action runs whatever failed before it.
pub fn run(ctx: &mut HookContext, with_relabel: bool) {
    let mut actions: Vec<(&str, HookAction)> = vec![
        ("remove udev rules", remove_udev_rules),
        ("remove network", remove_network),
        ("remove shared path", remove_shared_path),
    ];
    if with_relabel {
        actions.push(("relabel", poststop_relabel));
    }
    // never fails under this policy
    let _ = run_actions(RunPolicy::ContinueOnError, &actions, ctx);
}

fn remove_udev_rules(ctx: &mut HookContext) -> anyhow::Result<()> {
    let mut udev = open_udev(ctx.settings)?;
    let mut res = Ok(());
    for dev in ctx.config.devices() {
        let resolv = device_in_root(&ctx.state.root, dev);
        let device = match parse_device(&resolv) {
            Ok(d) => d,
            Err(e) => {
                error!("parse device ({}) failed: {}", resolv, e);
                continue;
            }
        };
        if device.dev_type == "c" {
            continue;
        }
        match device_type(&device.path_on_host) {
            Ok(t) if t == "disk" => udev.remove_rule(&UdevRule::new(
                &dev.path_on_host,
                &dev.path_in_container,
                &ctx.state.id,
            )),
            Ok(_) => {}
            Err(e) => {
                res = Err(e);
                break;
            }
        }
    }
    close_udev(udev);
    res
}

/// Deletes the recorded interfaces through the netns pinned at prestart,
/// then drops the pin.
fn remove_network(ctx: &mut HookContext) -> anyhow::Result<()> {
    let file = ctx.settings.netns_dir().join(&ctx.state.id);
    if !file.exists() {
        return Err(anyhow!("failed to open netns file {}", file.display()));
    }
    let ns_path = file.to_string_lossy().to_string();
    for nic in ctx.config.network_interfaces(&Default::default()) {
        match del_nic_from_container(ctx.backends.network, &ns_path, nic) {
            Ok(_) => debug!(
                "removed {} interface: ({},{})",
                nic.nic_type, nic.host_nic_name, nic.ctr_nic_name
            ),
            Err(e) => error!(
                "failed to del network interface ({}) from container {}: {}",
                nic, ctx.state.id, e
            ),
        }
    }
    let res = unmount(&ns_path, MntFlags::MNT_DETACH)
        .map_err(|e| anyhow!("failed to unmount netns file, {}", e));
    if let Err(e) = std::fs::remove_file(&file) {
        error!("failed to remove {}, {}", file.display(), e);
    }
    res
}

fn remove_shared_path(ctx: &mut HookContext) -> anyhow::Result<()> {
    for bind_str in ctx.config.binds() {
        let bind = match resolve_bind("/", bind_str)
            .and_then(|s| parse_bind(&s, Some(ctx.spec), false))
        {
            Ok(b) => b,
            Err(e) => {
                error!("remove shared path {} failed: {}", bind_str, e);
                continue;
            }
        };
        remove_transfer_path(&ctx.state.id, &bind);
    }
    remove_container_spec_path(&ctx.state.id);
    Ok(())
}
