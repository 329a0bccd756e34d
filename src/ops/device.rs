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

use super::{finish, is_running, locked, log_rollback, Backends};
use crate::{
    cgroup::CgroupWriter,
    config::{DeviceMapping, HookConfig},
    container::Container,
    device::{
        base_dev_name, cfq_ability, device_type, find_sub_partition, parse_device, parse_mapping,
        set_default_path, update_device_owner,
    },
    settings::Settings,
    types::{AddDeviceOptions, Device, QosType},
    udevd::{UdevController, UdevRule},
    utils::MultiError,
};

/// Devices from `host[:ctr][:perm]` arguments. With `follow_partition` a
/// disk brings its partitions along.
pub fn collect_devices(args: &[String], follow_partition: bool) -> anyhow::Result<Vec<Device>> {
    let mut devices: Vec<Device> = vec![];
    for arg in args {
        let mut device =
            parse_device(arg).map_err(|e| anyhow!("failed to parse device: {}, {}", arg, e))?;
        if device.dev_type == "c" {
            if follow_partition {
                return Err(anyhow!("char device {} not support follow partition", arg));
            }
            devices.push(device);
            continue;
        }
        let base = base_dev_name(&device.path_on_host)?;
        let typ = device_type(&device.path_on_host)?;
        if typ != "lvm" {
            device.parent = base;
        }
        let subs = if follow_partition && typ == "disk" {
            find_sub_partition(&device)
        } else {
            vec![]
        };
        devices.push(device);
        for sub in subs {
            if !devices.iter().any(|d| d.path_on_host == sub.path_on_host) {
                devices.push(sub);
            }
        }
    }
    Ok(devices)
}

/// Device mappings from `host[:ctr]` arguments of remove-device.
pub fn collect_mappings(args: &[String]) -> anyhow::Result<Vec<Device>> {
    args.iter()
        .map(|a| {
            parse_mapping(a).map_err(|e| anyhow!("failed to parse device mapping: {}, {}", a, e))
        })
        .collect()
}

/// Completes each device from its stored entry, then fills the missing side.
pub fn set_devices_path(c: &mut Container, devices: &mut [Device]) -> anyhow::Result<()> {
    locked(c, |c| {
        let config = HookConfig::for_container(c.path())?;
        for dev in devices.iter_mut() {
            if let Some(idx) = config.device_index(dev) {
                let found = &config.devices()[idx];
                dev.path = found.path_in_container.clone();
                dev.path_on_host = found.path_on_host.clone();
            }
            set_default_path(dev);
        }
        Ok(())
    })
}

/// Every throttle must name a device being added or one already added.
fn check_device_qos(
    config: &HookConfig,
    devices: &[Device],
    opts: &AddDeviceOptions,
) -> anyhow::Result<()> {
    let stored: Vec<Device>;
    let devices = if devices.is_empty() {
        stored = config.devices().iter().map(DeviceMapping::to_device).collect();
        &stored
    } else {
        devices
    };
    let throttles = [
        QosType::ReadBps,
        QosType::WriteBps,
        QosType::ReadIops,
        QosType::WriteIops,
    ];
    for qos in throttles.iter().flat_map(|k| opts.qos(*k)) {
        if !devices
            .iter()
            .any(|d| d.major == qos.major && d.minor == qos.minor)
        {
            return Err(anyhow!(
                "device {} was not added to container or not in add-device args",
                qos.path
            ));
        }
    }
    Ok(())
}

fn is_disk(device: &Device) -> anyhow::Result<bool> {
    if device.dev_type == "c" {
        return Ok(false);
    }
    Ok(device_type(&device.path_on_host)? == "disk")
}

fn apply_qos(
    config: &mut HookConfig,
    cgroup: &dyn CgroupWriter,
    opts: &AddDeviceOptions,
) -> anyhow::Result<()> {
    for kind in QosType::ALL {
        for qos in opts.qos(kind) {
            if kind == QosType::BlkioWeight && !cfq_ability(qos).unwrap_or(false) {
                info!("device not support cfq: {}", qos.path);
                continue;
            }
            cgroup.update_qos(kind, &qos.to_string())?;
            config.update_qos(qos, kind)?;
            info!(
                "update {} for device ({},{}) done",
                kind.cgroup_file(),
                qos.path,
                qos.value
            );
        }
    }
    Ok(())
}

/// Resets every limit recorded for `device`.
fn clear_qos(
    config: &mut HookConfig,
    cgroup: &dyn CgroupWriter,
    device: &Device,
) -> anyhow::Result<()> {
    let clean = format!("{}:{} 0", device.major, device.minor);
    for kind in QosType::ALL {
        if config.remove_qos(device, kind) {
            cgroup.update_qos(kind, &clean)?;
            info!(
                "remove {} for device ({}) done",
                kind.cgroup_file(),
                device.path_on_host
            );
        }
    }
    Ok(())
}

pub(crate) fn open_udev(settings: &Settings) -> anyhow::Result<UdevController> {
    let mut udev = UdevController::new(settings);
    udev.lock()?;
    udev.load_rules()?;
    Ok(udev)
}

pub(crate) fn close_udev(mut udev: UdevController) {
    if let Err(e) = udev.to_disk() {
        error!("failed to save udev rules, {}", e);
    }
    udev.unlock();
}

pub fn add_device(
    c: &mut Container,
    settings: &Settings,
    b: &Backends,
    mut devices: Vec<Device>,
    opts: &AddDeviceOptions,
) -> anyhow::Result<()> {
    for dev in devices.iter_mut() {
        update_device_owner(c.spec(), dev);
    }
    locked(c, |c| {
        let mut config = HookConfig::for_container(c.path())?;
        check_device_qos(&config, &devices, opts)?;
        let mut udev = open_udev(settings)?;
        let running = !opts.update_config_only && is_running(c);

        let mut errs = MultiError::new();
        for dev in &devices {
            if let Err(e) = config.update_device(dev, true) {
                errs.push(e);
                continue;
            }
            let rule = UdevRule::new(&dev.path_on_host, &dev.path, c.id());
            match is_disk(dev) {
                Ok(true) => udev.add_rule(rule.clone()),
                Ok(false) => {}
                Err(e) => {
                    errs.push(e);
                    log_rollback("device config", config.update_device(dev, false));
                    continue;
                }
            }
            if running {
                if let Err(e) = b.driver.add_device(c.pid(), dev, opts.force) {
                    errs.push(e);
                    log_rollback("device config", config.update_device(dev, false));
                    udev.remove_rule(&rule);
                    continue;
                }
                if let Err(e) = b.cgroup.update_permission(dev, true) {
                    errs.push(e);
                    log_rollback("device node", b.driver.remove_device(c.pid(), dev));
                    log_rollback("device config", config.update_device(dev, false));
                    udev.remove_rule(&rule);
                    continue;
                }
            }
            info!(
                "add device ({}) to container({},{}) done",
                dev.path_on_host,
                c.name(),
                dev.path
            );
        }
        if let Err(e) = apply_qos(&mut config, b.cgroup, opts) {
            errs.push(e);
        }
        close_udev(udev);
        finish(&mut config, errs)
    })
}

/// Throttle changes for devices already in the container.
pub fn update_device(c: &mut Container, b: &Backends, opts: &AddDeviceOptions) -> anyhow::Result<()> {
    locked(c, |c| {
        let mut config = HookConfig::for_container(c.path())?;
        check_device_qos(&config, &[], opts)?;
        let mut errs = MultiError::new();
        if let Err(e) = apply_qos(&mut config, b.cgroup, opts) {
            errs.push(e);
        }
        finish(&mut config, errs)
    })
}

pub fn remove_device(
    c: &mut Container,
    settings: &Settings,
    b: &Backends,
    devices: Vec<Device>,
    follow_partition: bool,
) -> anyhow::Result<()> {
    locked(c, |c| {
        let mut config = HookConfig::for_container(c.path())?;
        let mut udev = open_udev(settings)?;
        let mut errs = MultiError::new();

        let mut targets: Vec<Device> = vec![];
        for dev in &devices {
            let found = match config.find_device(dev) {
                Some(f) => f,
                None => {
                    errs.push(anyhow!(
                        "device pair({}:{}) is not added by syscontainer-tools, can not remove it, please check input parameter",
                        dev.path_on_host,
                        dev.path
                    ));
                    continue;
                }
            };
            let subs = if follow_partition {
                config.find_sub_partitions(&found)
            } else {
                vec![]
            };
            targets.push(found);
            for sub in subs {
                if !targets
                    .iter()
                    .any(|t| t.path == sub.path && t.path_on_host == sub.path_on_host)
                {
                    targets.push(sub);
                }
            }
        }

        let running = is_running(c);
        for dev in &targets {
            if let Err(e) = config.update_device(dev, false) {
                errs.push(e);
                continue;
            }
            let rule = UdevRule::new(&dev.path_on_host, &dev.path, c.id());
            udev.remove_rule(&rule);
            if running {
                if let Err(e) = b.driver.remove_device(c.pid(), dev) {
                    errs.push(e);
                    log_rollback("device config", config.update_device(dev, true));
                    match is_disk(dev) {
                        Ok(true) => udev.add_rule(rule),
                        Ok(false) => {}
                        Err(e) => errs.push(e),
                    }
                    continue;
                }
                if !still_mapped(&config, dev) {
                    if let Err(e) = b.cgroup.update_permission(dev, false) {
                        errs.push(e);
                        continue;
                    }
                }
            }
            info!(
                "remove device ({}) from container({},{}) done",
                dev.path_on_host,
                c.name(),
                dev.path
            );
            if still_mapped(&config, dev) {
                continue;
            }
            if let Err(e) = clear_qos(&mut config, b.cgroup, dev) {
                errs.push(e);
            }
        }
        close_udev(udev);
        finish(&mut config, errs)
    })
}

/// The host device is still exposed at another container path.
fn still_mapped(config: &HookConfig, dev: &Device) -> bool {
    config
        .devices()
        .iter()
        .any(|d| d.path_on_host == dev.path_on_host)
}

/// Whole disks only, unless `sub_partition` asks for their partitions too.
pub fn list_device(c: &mut Container, sub_partition: bool) -> anyhow::Result<Vec<DeviceMapping>> {
    locked(c, |c| {
        let config = HookConfig::for_container(c.path())?;
        Ok(config
            .devices()
            .iter()
            .filter(|d| sub_partition || d.parent.is_empty())
            .cloned()
            .collect())
    })
}

#[cfg(test)]
mod tests {
    use temp_dir::TempDir;

    use super::{add_device, list_device, remove_device, update_device};
    use crate::{
        config::HookConfig,
        ops::tests::{backends, running, settings, stopped, FakeCgroup, FakeDriver, FakeNetwork},
        types::{AddDeviceOptions, Device, Qos, QosType},
        utils::MultiError,
    };

    fn chr(host: &str, ctr: &str, minor: i64) -> Device {
        Device {
            dev_type: "c".to_string(),
            path: ctr.to_string(),
            path_on_host: host.to_string(),
            major: 1,
            minor,
            permissions: "rwm".to_string(),
            file_mode: 0o666,
            ..Default::default()
        }
    }

    fn batch() -> Vec<Device> {
        vec![
            chr("/dev/null", "/dev/c0", 3),
            chr("/dev/zero", "/dev/c1", 5),
            chr("/dev/full", "/dev/c2", 7),
        ]
    }

    #[test]
    fn test_partial_failure_rolls_back_one_item() {
        let dir = TempDir::new().unwrap();
        let s = settings(&dir);
        let driver = FakeDriver::default();
        let mut cgroup = FakeCgroup::default();
        cgroup.fail.insert("/dev/c1".to_string());
        let net = FakeNetwork::default();
        let b = backends(&driver, &cgroup, &net);
        let mut c = running(&dir);

        let err = add_device(&mut c, &s, &b, batch(), &AddDeviceOptions::default()).unwrap_err();
        let errs = err.downcast_ref::<MultiError>().unwrap();
        assert_eq!(errs.len(), 1);
        assert!(errs.to_string().contains("/dev/c1"));
        // the node of the failed item was removed again
        assert!(driver
            .calls
            .borrow()
            .contains(&"remove_device /dev/c1".to_string()));

        let config = HookConfig::for_container(dir.path()).unwrap();
        let paths: Vec<&str> = config
            .devices()
            .iter()
            .map(|d| d.path_in_container.as_str())
            .collect();
        assert_eq!(paths, vec!["/dev/c0", "/dev/c2"]);
    }

    #[test]
    fn test_conflicts_are_reported_and_skipped() {
        let dir = TempDir::new().unwrap();
        let s = settings(&dir);
        let (driver, cgroup, net) = (FakeDriver::default(), FakeCgroup::default(), FakeNetwork::default());
        let b = backends(&driver, &cgroup, &net);
        let mut c = stopped(&dir);

        add_device(&mut c, &s, &b, batch(), &AddDeviceOptions::default()).unwrap();
        // stopped container: config only
        assert!(driver.calls.borrow().is_empty());

        let again = vec![chr("/dev/urandom", "/dev/c0", 9), chr("/dev/random", "/dev/c8", 8)];
        let err = add_device(&mut c, &s, &b, again, &AddDeviceOptions::default()).unwrap_err();
        assert_eq!(err.downcast_ref::<MultiError>().unwrap().len(), 1);
        assert_eq!(list_device(&mut c, false).unwrap().len(), 4);
    }

    #[test]
    fn test_qos_needs_device() {
        let dir = TempDir::new().unwrap();
        let s = settings(&dir);
        let (driver, cgroup, net) = (FakeDriver::default(), FakeCgroup::default(), FakeNetwork::default());
        let b = backends(&driver, &cgroup, &net);
        let mut c = running(&dir);
        let opts = AddDeviceOptions {
            read_bps: vec![Qos {
                major: 1,
                minor: 5,
                path: "/dev/zero".to_string(),
                value: "1048576".to_string(),
            }],
            ..Default::default()
        };
        assert!(update_device(&mut c, &b, &opts).is_err());
        assert!(cgroup.writes.borrow().is_empty());

        add_device(&mut c, &s, &b, batch(), &opts).unwrap();
        assert!(cgroup
            .writes
            .borrow()
            .contains(&"blkio.throttle.read_bps_device 1:5 1048576".to_string()));
        let config = HookConfig::for_container(dir.path()).unwrap();
        assert_eq!(config.qos(QosType::ReadBps).len(), 1);

        // removing the device resets its limit
        remove_device(&mut c, &s, &b, vec![chr("/dev/zero", "/dev/c1", 5)], false).unwrap();
        assert!(cgroup
            .writes
            .borrow()
            .contains(&"blkio.throttle.read_bps_device 1:5 0".to_string()));
        let config = HookConfig::for_container(dir.path()).unwrap();
        assert!(config.qos(QosType::ReadBps).is_empty());
    }

    #[test]
    fn test_shared_host_device_keeps_permission() {
        let dir = TempDir::new().unwrap();
        let s = settings(&dir);
        let (driver, cgroup, net) = (FakeDriver::default(), FakeCgroup::default(), FakeNetwork::default());
        let b = backends(&driver, &cgroup, &net);
        let mut c = running(&dir);

        let devs = vec![chr("/dev/null", "/dev/c0", 3), chr("/dev/null", "/dev/c9", 3)];
        add_device(&mut c, &s, &b, devs, &AddDeviceOptions::default()).unwrap();
        assert_eq!(list_device(&mut c, false).unwrap().len(), 2);

        remove_device(&mut c, &s, &b, vec![chr("/dev/null", "/dev/c9", 3)], false).unwrap();
        assert!(driver
            .calls
            .borrow()
            .contains(&"remove_device /dev/c9".to_string()));
        assert!(!cgroup.writes.borrow().iter().any(|w| w.starts_with("deny")));

        remove_device(&mut c, &s, &b, vec![chr("/dev/null", "/dev/c0", 3)], false).unwrap();
        assert!(cgroup.writes.borrow().iter().any(|w| w.starts_with("deny")));
        assert!(list_device(&mut c, false).unwrap().is_empty());
    }

    #[test]
    fn test_remove_failure_keeps_config() {
        let dir = TempDir::new().unwrap();
        let s = settings(&dir);
        let mut driver = FakeDriver::default();
        let (cgroup, net) = (FakeCgroup::default(), FakeNetwork::default());
        let mut c = running(&dir);
        {
            let b = backends(&driver, &cgroup, &net);
            add_device(&mut c, &s, &b, batch(), &AddDeviceOptions::default()).unwrap();
        }
        driver.fail.insert("/dev/c0".to_string());
        let b = backends(&driver, &cgroup, &net);
        let missing = chr("/dev/tty", "/dev/tty", 0);
        let err = remove_device(
            &mut c,
            &s,
            &b,
            vec![chr("/dev/null", "/dev/c0", 3), chr("/dev/full", "/dev/c2", 7), missing],
            false,
        )
        .unwrap_err();
        let errs = err.downcast_ref::<MultiError>().unwrap();
        assert_eq!(errs.len(), 2);
        assert!(errs.to_string().contains("is not added by syscontainer-tools"));
        let left: Vec<String> = list_device(&mut c, true)
            .unwrap()
            .into_iter()
            .map(|d| d.path_in_container)
            .collect();
        assert_eq!(left.len(), 2);
        assert!(left.contains(&"/dev/c0".to_string()));
        assert!(!left.contains(&"/dev/c2".to_string()));
    }
}
