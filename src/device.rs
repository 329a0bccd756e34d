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
    os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::anyhow;
use lazy_static::lazy_static;
use log::{debug, error, info};
use nix::{
    sys::stat::{major, makedev, minor, mknod, Mode, SFlag},
    unistd::{chown, Gid, Uid},
};
use oci_spec::runtime::Spec;
use regex::Regex;

use crate::{
    container::user_ns_ids,
    types::{Device, Qos},
    utils::execute,
};

pub const DEFAULT_DEVICE_PERMISSIONS: &str = "rwm";

const BLKIO_WEIGHT_MIN: u64 = 10;
const BLKIO_WEIGHT_MAX: u64 = 1000;

lazy_static! {
    static ref SIZE_REGEX: Regex =
        Regex::new(r"^(\d+(?:\.\d+)*)?([kKmMgGtTpP])?[bB]?$").unwrap();
}

/// Lexically cleans an absolute path, `/dev//sdb/../sdc` becomes `/dev/sdc`.
pub fn clean_path(path: &str) -> String {
    path_clean::clean(path).to_string_lossy().to_string()
}

/// Parses `host[:container][:permissions]`. With two fields the second one is
/// taken as permissions when it is a valid cgroup access mode.
pub fn parse_mapping(spec: &str) -> anyhow::Result<Device> {
    let arr: Vec<&str> = spec.split(':').collect();
    if arr.is_empty() || arr.len() > 3 {
        return Err(anyhow!("invalid device specification: {}", spec));
    }
    let mut src = arr[0].to_string();
    let mut dst = String::new();
    let mut permissions = DEFAULT_DEVICE_PERMISSIONS.to_string();
    match arr.len() {
        3 => {
            if !arr[2].is_empty() {
                permissions = arr[2].to_string();
            }
            dst = arr[1].to_string();
        }
        2 => {
            if check_device_mode(arr[1]) {
                permissions = arr[1].to_string();
            } else {
                dst = arr[1].to_string();
            }
        }
        _ => {}
    }

    if !check_device_mode(&permissions) {
        return Err(anyhow!("invalid permission: {}", permissions));
    }
    if !src.is_empty() {
        if !Path::new(&src).is_absolute() {
            return Err(anyhow!("hostpath should be an absolute path: {}", src));
        }
        src = clean_path(&src);
    }
    if !dst.is_empty() {
        if !Path::new(&dst).is_absolute() {
            return Err(anyhow!("containerpath should be an absolute path: {}", dst));
        }
        dst = clean_path(&dst);
    }
    if src.is_empty() && dst.is_empty() {
        return Err(anyhow!(
            "either of host path and container path should be assigned"
        ));
    }
    Ok(Device {
        path: dst,
        path_on_host: src,
        permissions,
        ..Default::default()
    })
}

/// A non-empty combination of `r`, `w` and `m`, each at most once.
pub fn check_device_mode(mode: &str) -> bool {
    if mode.is_empty() {
        return false;
    }
    let mut seen = vec![];
    for c in mode.chars() {
        if !matches!(c, 'r' | 'w' | 'm') || seen.contains(&c) {
            return false;
        }
        seen.push(c);
    }
    true
}

pub fn parse_device(spec: &str) -> anyhow::Result<Device> {
    let mapping = parse_mapping(spec)?;
    let mut dev = device_from_path(&mapping.path_on_host, &mapping.permissions)?;
    dev.path = mapping.path;
    Ok(dev)
}

/// Follows symlinks one hop at a time, relative targets resolve against the
/// link's directory.
pub fn device_real_path(path: &str) -> PathBuf {
    let mut resolved = PathBuf::from(path);
    while let Ok(target) = std::fs::read_link(&resolved) {
        resolved = if target.is_absolute() {
            target
        } else {
            resolved
                .parent()
                .map(|p| p.join(&target))
                .unwrap_or(target)
        };
    }
    resolved
}

pub fn device_from_path(path: &str, permissions: &str) -> anyhow::Result<Device> {
    let resolved = device_real_path(path);
    let meta = std::fs::symlink_metadata(&resolved)
        .map_err(|e| anyhow!("failed to stat {}, {}", resolved.display(), e))?;
    let file_type = meta.file_type();
    let dev_type = if file_type.is_char_device() {
        "c"
    } else if file_type.is_block_device() {
        "b"
    } else {
        return Err(anyhow!("{} is not a device", path));
    };
    let rdev = meta.rdev();
    Ok(Device {
        dev_type: dev_type.to_string(),
        path_on_host: path.to_string(),
        major: major(rdev) as i64,
        minor: minor(rdev) as i64,
        permissions: permissions.to_string(),
        file_mode: meta.permissions().mode() & 0o7777,
        uid: meta.uid(),
        gid: meta.gid(),
        ..Default::default()
    })
}

pub fn get_device_num(path: &str) -> anyhow::Result<(i64, i64)> {
    let dev = device_from_path(path, "")?;
    Ok((dev.major, dev.minor))
}

pub fn mknod_device(dest: &str, node: &Device) -> anyhow::Result<()> {
    let kind = match node.dev_type.as_str() {
        "c" => SFlag::S_IFCHR,
        "b" => SFlag::S_IFBLK,
        _ => {
            return Err(anyhow!(
                "{} is not a valid device type for device {}",
                node.dev_type,
                node.path
            ))
        }
    };
    mknod(
        dest,
        kind,
        Mode::from_bits_truncate(node.file_mode),
        makedev(node.major as u64, node.minor as u64),
    )
    .map_err(|e| anyhow!("failed to mknod {}, {}", dest, e))?;
    chown(
        dest,
        Some(Uid::from_raw(node.uid)),
        Some(Gid::from_raw(node.gid)),
    )
    .map_err(|e| anyhow!("failed to chown {}, {}", dest, e))
}

/// An empty side of the mapping takes the path of the other side.
pub fn set_default_path(dev: &mut Device) {
    if dev.path.is_empty() {
        dev.path = dev.path_on_host.clone();
    }
    if dev.path_on_host.is_empty() {
        dev.path_on_host = dev.path.clone();
    }
}

fn lsblk(args: &[&str], dev_name: &str) -> anyhow::Result<String> {
    let mut cmd = Command::new("lsblk");
    cmd.args(args).arg(dev_name);
    execute(cmd).map_err(|e| anyhow!("failed to lsblk {}, {}", dev_name, e))
}

/// Partitions of a disk, mapped into the container next to the disk: `sdb`
/// mapped to `/dev/xvdb` brings `sdb1` in as `/dev/xvdb1`.
pub fn find_sub_partition(device: &Device) -> Vec<Device> {
    let out = match lsblk(&["-n", "-p", "-r", "-o", "NAME"], &device.path_on_host) {
        Ok(o) => o,
        Err(e) => {
            error!("{}", e);
            return vec![];
        }
    };
    sub_partitions_from(&out, device)
}

fn sub_partitions_from(lsblk_out: &str, device: &Device) -> Vec<Device> {
    let mut subs = vec![];
    for name in lsblk_out.lines().skip(1).filter(|l| !l.is_empty()) {
        let mut try_device = name.to_string();
        if !device.path.is_empty() {
            let suffix = name.chars().last().map(String::from).unwrap_or_default();
            try_device = format!("{}:{}{}", try_device, device.path, suffix);
        }
        try_device = format!("{}:{}", try_device, device.permissions);
        match parse_device(&try_device) {
            Ok(mut dev) => {
                dev.parent = device.path_on_host.clone();
                subs.push(dev);
            }
            Err(e) => debug!("skip partition {}, {}", name, e),
        }
    }
    subs
}

/// The whole disk a partition lives on, empty when `dev_name` is a disk.
pub fn base_dev_name(dev_name: &str) -> anyhow::Result<String> {
    let out = lsblk(&["-n", "-p", "-r", "-s", "-o", "NAME"], dev_name)?;
    Ok(out.lines().nth(1).unwrap_or_default().to_string())
}

/// `disk`, `part`, `lvm`...
pub fn device_type(dev_name: &str) -> anyhow::Result<String> {
    let out = lsblk(&["-n", "-d", "-o", "TYPE"], dev_name)?;
    let typ = out.trim_matches('\n').to_string();
    debug!("{} type is {}", dev_name, typ);
    Ok(typ)
}

/// Human size with an optional binary unit: `10`, `1.5m`, `2GB`.
pub fn parse_size(size: &str) -> anyhow::Result<i64> {
    let caps = SIZE_REGEX
        .captures(size)
        .ok_or_else(|| anyhow!("invalid size: '{}'", size))?;
    let number = caps
        .get(1)
        .map(|m| m.as_str())
        .ok_or_else(|| anyhow!("invalid size: '{}'", size))?;
    let mut value: f64 = number
        .parse()
        .map_err(|e| anyhow!("invalid size: '{}', {}", size, e))?;
    if let Some(unit) = caps.get(2) {
        let exp = match unit.as_str().to_ascii_lowercase().as_str() {
            "k" => 1,
            "m" => 2,
            "g" => 3,
            "t" => 4,
            _ => 5,
        };
        value *= 1024f64.powi(exp);
    }
    Ok(value as i64)
}

fn qos_device(spec: &str) -> anyhow::Result<Device> {
    let dev = parse_device(spec)?;
    if dev.dev_type == "c" {
        return Err(anyhow!("cannot set Qos of a char device"));
    }
    if device_type(&dev.path_on_host)? == "part" {
        return Err(anyhow!("cannot set Qos of a child device"));
    }
    Ok(dev)
}

fn split_qos_option(val: &str) -> anyhow::Result<(&str, &str)> {
    val.split_once(':')
        .ok_or_else(|| anyhow!("bad format: {}", val))
}

/// Parses `<device-path>:<rate>` throttle options.
pub fn parse_qos_options(vals: &[String]) -> anyhow::Result<Vec<Qos>> {
    let mut qos = vec![];
    for val in vals {
        let (path, rate) = split_qos_option(val)?;
        let dev = qos_device(path)?;
        let rate = parse_size(rate).map_err(|_| {
            anyhow!(
                "invalid rate for device: {}. The correct format is <device-path>:<number>[<unit>]. \
                 Number must be a positive integer. Unit is optional and can be kb, mb, or gb",
                val
            )
        })?;
        qos.push(Qos {
            major: dev.major,
            minor: dev.minor,
            path: path.to_string(),
            value: rate.to_string(),
        });
    }
    Ok(qos)
}

/// Parses `<device-path>:<weight>`, weight is 0 or within 10..=1000.
pub fn parse_blkio_weight(vals: &[String]) -> anyhow::Result<Vec<Qos>> {
    let mut qos = vec![];
    for val in vals {
        let (path, weight) = split_qos_option(val)?;
        let dev = qos_device(path)?;
        let weight = parse_weight(weight).map_err(|_| anyhow!("invalid weight for device: {}", val))?;
        qos.push(Qos {
            major: dev.major,
            minor: dev.minor,
            path: path.to_string(),
            value: weight.to_string(),
        });
    }
    Ok(qos)
}

fn parse_weight(weight: &str) -> anyhow::Result<u64> {
    let w: u64 = weight.parse()?;
    if w > 0 && !(BLKIO_WEIGHT_MIN..=BLKIO_WEIGHT_MAX).contains(&w) {
        return Err(anyhow!("weight {} out of range", w));
    }
    Ok(w)
}

/// Whether the disk scheduler honors per-device blkio weights.
pub fn cfq_ability(qos: &Qos) -> anyhow::Result<bool> {
    let name = Path::new(&clean_path(&qos.path))
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let path = format!("/sys/block/{}/queue/scheduler", name);
    let content = std::fs::read_to_string(&path).map_err(|e| {
        info!("fail to open cfq file: {}", path);
        anyhow!("failed to read {}, {}", path, e)
    })?;
    let line = content.lines().next().unwrap_or_default();
    Ok(line.contains("cfq") || line.contains("bfq"))
}

/// Owner of created nodes follows the host id that container root maps to.
pub fn update_device_owner(spec: Option<&Spec>, device: &mut Device) {
    let spec = match spec {
        Some(s) => s,
        None => return,
    };
    let (uid, gid) = user_ns_ids(spec);
    if uid != -1 {
        device.uid = uid as u32;
    }
    if gid != -1 {
        device.gid = gid as u32;
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use temp_dir::TempDir;

    use super::{
        check_device_mode, device_from_path, device_real_path, parse_mapping, parse_size,
        parse_weight, set_default_path, sub_partitions_from,
    };
    use crate::types::Device;

    #[test]
    fn test_parse_mapping() {
        let d = parse_mapping("/dev/sdb1:/dev/xvdb:rwm").unwrap();
        assert_eq!(d.path_on_host, "/dev/sdb1");
        assert_eq!(d.path, "/dev/xvdb");
        assert_eq!(d.permissions, "rwm");

        // second field is permissions when it looks like one
        let d = parse_mapping("/dev/sdb:rw").unwrap();
        assert_eq!(d.path, "");
        assert_eq!(d.permissions, "rw");

        let d = parse_mapping("/dev//sdb/:/dev/xvdb/").unwrap();
        assert_eq!(d.path_on_host, "/dev/sdb");
        assert_eq!(d.path, "/dev/xvdb");
        assert_eq!(d.permissions, "rwm");

        let d = parse_mapping(":/dev/xvdb:").unwrap();
        assert_eq!(d.path_on_host, "");
        assert_eq!(d.permissions, "rwm");
    }

    #[test]
    fn test_parse_mapping_errors() {
        assert!(parse_mapping("/dev/sdb:/dev/xvdb:rwx").is_err());
        assert!(parse_mapping("dev/sdb").is_err());
        assert!(parse_mapping("/dev/sdb:dev/xvdb").is_err());
        assert!(parse_mapping("::").is_err());
        assert!(parse_mapping("/a:/b:r:w").is_err());
    }

    #[test]
    fn test_check_device_mode() {
        assert!(check_device_mode("rwm"));
        assert!(check_device_mode("mr"));
        assert!(!check_device_mode(""));
        assert!(!check_device_mode("rr"));
        assert!(!check_device_mode("rx"));
    }

    #[test]
    fn test_device_from_path() {
        let d = device_from_path("/dev/null", "rwm").unwrap();
        assert_eq!(d.dev_type, "c");
        assert_eq!((d.major, d.minor), (1, 3));
        assert_eq!(d.path_on_host, "/dev/null");

        let dir = TempDir::new().unwrap();
        let file = dir.child("plain");
        fs::write(&file, b"").unwrap();
        let e = device_from_path(file.to_str().unwrap(), "").unwrap_err();
        assert!(e.to_string().contains("not a device"));
    }

    #[test]
    fn test_device_real_path_follows_links() {
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink("/dev/null", dir.child("a")).unwrap();
        std::os::unix::fs::symlink("a", dir.child("b")).unwrap();
        let p = device_real_path(dir.child("b").to_str().unwrap());
        assert_eq!(p.to_str().unwrap(), "/dev/null");
        let d = device_from_path(dir.child("b").to_str().unwrap(), "r").unwrap();
        assert_eq!((d.major, d.minor), (1, 3));
    }

    #[test]
    fn test_sub_partitions_from_lsblk() {
        let disk = Device {
            path_on_host: "/dev/null".to_string(),
            path: "/dev/xvdb".to_string(),
            permissions: "rw".to_string(),
            ..Default::default()
        };
        // lsblk prints the disk itself first
        let subs = sub_partitions_from("/dev/null\n/dev/zero\n/dev/does-not-exist1\n", &disk);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].path_on_host, "/dev/zero");
        assert_eq!(subs[0].path, "/dev/xvdbo");
        assert_eq!(subs[0].parent, "/dev/null");
        assert_eq!(subs[0].permissions, "rw");
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("10").unwrap(), 10);
        assert_eq!(parse_size("1k").unwrap(), 1024);
        assert_eq!(parse_size("1.5MB").unwrap(), 1572864);
        assert_eq!(parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("ten").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_parse_weight() {
        assert_eq!(parse_weight("0").unwrap(), 0);
        assert_eq!(parse_weight("500").unwrap(), 500);
        assert!(parse_weight("5").is_err());
        assert!(parse_weight("1001").is_err());
        assert!(parse_weight("-1").is_err());
    }

    #[test]
    fn test_set_default_path() {
        let mut d = Device {
            path_on_host: "/dev/sdb".to_string(),
            ..Default::default()
        };
        set_default_path(&mut d);
        assert_eq!(d.path, "/dev/sdb");
    }
}
