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
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::anyhow;
use log::debug;
use procfs::process::{MountInfo, Process};

use crate::types::{Device, QosType};

pub const DEVICES_SUBSYSTEM: &str = "devices";
pub const BLKIO_SUBSYSTEM: &str = "blkio";

const CGROUP_NAME_PREFIX: &str = "name=";

/// Writes device access and blkio limits for one container.
pub trait CgroupWriter {
    fn update_permission(&self, device: &Device, is_add: bool) -> anyhow::Result<()>;
    fn update_qos(&self, kind: QosType, value: &str) -> anyhow::Result<()>;
}

/// Writes straight into the cgroup v1 hierarchy mounted on the host.
#[derive(Debug, Clone)]
pub struct FsCgroupWriter {
    pid: i32,
    inner_path: String,
}

impl FsCgroupWriter {
    pub fn new(pid: i32, inner_path: &str) -> Self {
        Self {
            pid,
            inner_path: inner_path.to_string(),
        }
    }
}

impl CgroupWriter for FsCgroupWriter {
    fn update_permission(&self, device: &Device, is_add: bool) -> anyhow::Result<()> {
        let base = find_cgroup_path(self.pid, DEVICES_SUBSYSTEM, &self.inner_path)?;
        let file = if is_add {
            "devices.allow"
        } else {
            "devices.deny"
        };
        write_cgroup_file(&base.join(file), &device.cgroup_string())
    }

    fn update_qos(&self, kind: QosType, value: &str) -> anyhow::Result<()> {
        // nothing to throttle for a stopped container
        if self.pid == 0 {
            return Ok(());
        }
        let base = find_cgroup_path(self.pid, BLKIO_SUBSYSTEM, &self.inner_path)?;
        let res = write_cgroup_file(&base.join(kind.cgroup_file()), value);
        if kind == QosType::BlkioWeight {
            return res.map_err(|e| {
                anyhow!(
                    "{}, please check whether current OS support blkio weight device configuration for bfq scheduler",
                    e
                )
            });
        }
        res
    }
}

fn write_cgroup_file(path: &Path, value: &str) -> anyhow::Result<()> {
    debug!("write {} to {}", value, path.display());
    std::fs::write(path, value.as_bytes())
        .map_err(|e| anyhow!("failed to write {} to {}, {}", value, path.display(), e))
}

/// Parses `/proc/<pid>/cgroup` into controller -> path.
pub fn parse_cgroup_file(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let parts: Vec<&str> = line.splitn(3, ':').collect();
        if parts.len() != 3 {
            continue;
        }
        for controller in parts[1].split(',').filter(|c| !c.is_empty()) {
            map.insert(controller.to_string(), parts[2].to_string());
        }
    }
    map
}

pub fn cgroup_dir(pid: i32, subsystem: &str) -> anyhow::Result<String> {
    let path = format!("/proc/{}/cgroup", pid);
    let content = std::fs::read_to_string(&path)
        .map_err(|e| anyhow!("failed to read {}, {}", path, e))?;
    let map = parse_cgroup_file(&content);
    map.get(subsystem)
        .or_else(|| map.get(&format!("{}{}", CGROUP_NAME_PREFIX, subsystem)))
        .cloned()
        .ok_or_else(|| anyhow!("controller path of {} is not found", subsystem))
}

fn has_subsystem(m: &MountInfo, subsystem: &str) -> bool {
    if m.fs_type != "cgroup" {
        return false;
    }
    if m.super_options.contains_key(subsystem) {
        return true;
    }
    matches!(
        subsystem.strip_prefix(CGROUP_NAME_PREFIX),
        Some(name) if m.super_options.get("name") == Some(&Some(name.to_string()))
    )
}

/// Mount point and root of the cgroup v1 hierarchy carrying `subsystem`.
pub fn find_mountpoint_and_root(subsystem: &str) -> anyhow::Result<(PathBuf, PathBuf)> {
    let infos = Process::myself()
        .and_then(|p| p.mountinfo())
        .map_err(|e| anyhow!("failed to read mountinfo, {}", e))?;
    infos
        .into_iter()
        .find(|m| has_subsystem(m, subsystem))
        .map(|m| (m.mount_point, PathBuf::from(m.root)))
        .ok_or_else(|| anyhow!("mountpoint for {} not found", subsystem))
}

/// Host path of the container's cgroup for `subsystem`. An absolute
/// `inner_path` is taken under the hierarchy root, otherwise the path comes
/// from the process' own cgroup membership.
pub fn find_cgroup_path(pid: i32, subsystem: &str, inner_path: &str) -> anyhow::Result<PathBuf> {
    let (mnt, root) = find_mountpoint_and_root(subsystem)?;
    let cgroup_root = mnt
        .parent()
        .ok_or_else(|| anyhow!("invalid cgroup mountpoint {}", mnt.display()))?;
    if Path::new(inner_path).is_absolute() {
        let base = mnt.file_name().unwrap_or_default();
        return Ok(cgroup_root
            .join(base)
            .join(inner_path.trim_start_matches('/')));
    }
    let init_path = cgroup_dir(pid, subsystem)?;
    Ok(join_relative(&mnt, &root, &init_path))
}

// /proc/<pid>/cgroup shows host paths, nested hierarchies are rooted deeper
fn join_relative(mnt: &Path, root: &Path, init_path: &str) -> PathBuf {
    let init = Path::new(init_path);
    let rel = init
        .strip_prefix(root)
        .unwrap_or_else(|_| init.strip_prefix("/").unwrap_or(init));
    mnt.join(rel)
}
