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
    fs::{File, Permissions},
    io::ErrorKind,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use anyhow::anyhow;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::types::{InterfaceConf, Qos, Route};

pub mod device;
pub mod network;

pub use device::{DeviceMapping, HostMapping};

pub const HOOK_CONFIG_FILE: &str = "device_hook.json";
pub const MAX_PATH_NUM: usize = 128;
pub const MAX_NIC_NUM: usize = 128;

#[derive(Debug)]
struct HostPathInfo {
    count: usize,
    perm: String,
}

/// Reference counts of the stored binds: the host path behind each container
/// path, and how many binds share each host path.
#[derive(Debug, Default)]
struct BindIndex {
    host_paths: HashMap<String, HostPathInfo>,
    container_paths: HashMap<String, String>,
}

fn same_permissions(old: &str, new: &str) -> bool {
    let set = |s: &str| {
        let mut v: Vec<String> = s.replace(' ', "").split(',').map(String::from).collect();
        v.sort();
        v.dedup();
        v
    };
    set(old) == set(new)
}

impl BindIndex {
    /// Returns whether the host path already had another referent.
    fn add(&mut self, bind_str: &str) -> anyhow::Result<bool> {
        let mp = HostMapping::parse(bind_str)
            .map_err(|e| anyhow!("wrong bind format: {}, {}", bind_str, e))?;
        if self.container_paths.contains_key(&mp.path_in_container) {
            return Err(anyhow!(
                "mount more than one host paths to a single path in container: {}",
                mp.path_in_container
            ));
        }
        if let Some(info) = self.host_paths.get(&mp.path_on_host) {
            if !same_permissions(&info.perm, &mp.permission) {
                return Err(anyhow!(
                    "mount one host path with different permissions, old: {}, new: {}",
                    info.perm,
                    mp.permission
                ));
            }
        }
        self.container_paths
            .insert(mp.path_in_container, mp.path_on_host.clone());
        match self.host_paths.get_mut(&mp.path_on_host) {
            Some(info) => {
                info.count += 1;
                Ok(true)
            }
            None => {
                self.host_paths.insert(
                    mp.path_on_host,
                    HostPathInfo {
                        count: 1,
                        perm: mp.permission,
                    },
                );
                Ok(false)
            }
        }
    }

    /// Returns whether the last referent of the host path is gone. Nothing
    /// changes unless the container path is held by this very host path.
    fn remove(&mut self, bind_str: &str) -> anyhow::Result<bool> {
        let mp = HostMapping::parse(bind_str)
            .map_err(|e| anyhow!("wrong bind format: {}, {}", bind_str, e))?;
        if self.container_paths.get(&mp.path_in_container) != Some(&mp.path_on_host) {
            return Err(anyhow!(
                "{}:{} not in memory database",
                mp.path_on_host,
                mp.path_in_container
            ));
        }
        let info = self
            .host_paths
            .get_mut(&mp.path_on_host)
            .ok_or_else(|| anyhow!("{} not in memory database", mp.path_on_host))?;
        self.container_paths.remove(&mp.path_in_container);
        info.count = info.count.saturating_sub(1);
        if info.count == 0 {
            self.host_paths.remove(&mp.path_on_host);
            return Ok(true);
        }
        Ok(false)
    }
}

/// Everything hot-plugged into one container, replayed by the prestart hook.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct HookConfig {
    #[serde(rename = "bindToAdd", default, skip_serializing_if = "Vec::is_empty")]
    binds: Vec<String>,
    #[serde(rename = "deviceToAdd", default, skip_serializing_if = "Vec::is_empty")]
    devices: Vec<DeviceMapping>,
    #[serde(rename = "readIops", default, skip_serializing_if = "Vec::is_empty")]
    read_iops: Vec<Qos>,
    #[serde(rename = "writeIops", default, skip_serializing_if = "Vec::is_empty")]
    write_iops: Vec<Qos>,
    #[serde(rename = "readBps", default, skip_serializing_if = "Vec::is_empty")]
    read_bps: Vec<Qos>,
    #[serde(rename = "writeBps", default, skip_serializing_if = "Vec::is_empty")]
    write_bps: Vec<Qos>,
    #[serde(rename = "blkioWeight", default, skip_serializing_if = "Vec::is_empty")]
    blkio_weight: Vec<Qos>,
    #[serde(
        rename = "networkInterfaces",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    network_interfaces: Vec<InterfaceConf>,
    #[serde(rename = "networkRoute", default, skip_serializing_if = "Vec::is_empty")]
    network_routes: Vec<Route>,
    #[serde(skip)]
    path: PathBuf,
    #[serde(skip)]
    dirty: bool,
    #[serde(skip)]
    bind_index: BindIndex,
}

impl HookConfig {
    /// Loads the store of the container whose config directory is `dir`.
    pub fn for_container<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        Self::load(dir.as_ref().join(HOOK_CONFIG_FILE))
    }

    /// A missing file is an empty store. Stored binds are replayed through
    /// the bind index, a bind that does not fit is a corrupt store.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = match std::fs::read(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} not found, start with empty hook config", path.display());
                return Ok(Self {
                    path: path.to_path_buf(),
                    ..Default::default()
                });
            }
            Err(e) => return Err(anyhow!("failed to read {}, {}", path.display(), e)),
        };
        let mut config: HookConfig = serde_json::from_slice(&content)
            .map_err(|e| anyhow!("failed to parse {}, {}", path.display(), e))?;
        for bind_str in &config.binds {
            config.bind_index.add(bind_str)?;
        }
        config.path = path.to_path_buf();
        Ok(config)
    }

    /// Rewrites the whole document with mode 0600, only when something changed.
    pub fn flush(&mut self) -> anyhow::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let file = File::create(&self.path)
            .map_err(|e| anyhow!("failed to create {}, {}", self.path.display(), e))?;
        file.set_permissions(Permissions::from_mode(0o600))
            .map_err(|e| anyhow!("failed to chmod {}, {}", self.path.display(), e))?;
        serde_json::to_writer(&file, &*self)
            .map_err(|e| anyhow!("failed to write {}, {}", self.path.display(), e))?;
        self.dirty = false;
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use temp_dir::TempDir;

    use super::{same_permissions, HookConfig};
    use crate::types::{Bind, Device, InterfaceConf, Qos, QosType, Route};

    pub(crate) fn bind(host: &str, ctr: &str, opt: &str) -> Bind {
        Bind {
            host_path: host.to_string(),
            container_path: ctr.to_string(),
            mount_option: opt.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_same_permissions() {
        assert!(same_permissions("rw,rslave", "rslave,rw"));
        assert!(same_permissions("rw, rslave", "rw,rslave"));
        assert!(!same_permissions("ro,rslave", "rw,rslave"));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let mut config = HookConfig::for_container(dir.path()).unwrap();
        assert!(config.devices().is_empty());
        assert!(config.binds().is_empty());
        assert!(!config.is_dirty());
        // nothing to write
        config.flush().unwrap();
        assert!(!config.path().exists());
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut config = HookConfig::for_container(dir.path()).unwrap();
        let dev = Device {
            dev_type: "b".to_string(),
            path: "/dev/xvdb".to_string(),
            path_on_host: "/dev/sdb1".to_string(),
            major: 8,
            minor: 17,
            permissions: "rwm".to_string(),
            parent: "/dev/sdb".to_string(),
            ..Default::default()
        };
        config.update_device(&dev, true).unwrap();
        config.update_bind(&bind("/data", "/mnt/a", "rw,rslave"), true).unwrap();
        config.update_bind(&bind("/data", "/mnt/b", "rslave,rw"), true).unwrap();
        config
            .update_qos(
                &Qos {
                    major: 8,
                    minor: 17,
                    path: "/dev/sdb1".to_string(),
                    value: "1048576".to_string(),
                },
                QosType::ReadBps,
            )
            .unwrap();
        config
            .update_network_interface(
                &InterfaceConf {
                    ip: "192.168.1.2/24".to_string(),
                    nic_type: "veth".to_string(),
                    host_nic_name: "veth1".to_string(),
                    ctr_nic_name: "eth1".to_string(),
                    bridge: "br0".to_string(),
                    ..Default::default()
                },
                true,
            )
            .unwrap();
        config
            .update_network_route(
                &Route {
                    dest: "default".to_string(),
                    gw: "192.168.1.1".to_string(),
                    ..Default::default()
                },
                true,
            )
            .unwrap();
        config.flush().unwrap();
        assert!(!config.is_dirty());

        let content = std::fs::read_to_string(config.path()).unwrap();
        assert!(content.contains("\"bindToAdd\""));
        assert!(!content.contains("\"writeIops\""));

        let mut loaded = HookConfig::for_container(dir.path()).unwrap();
        assert_eq!(loaded.devices(), config.devices());
        assert_eq!(loaded.binds(), config.binds());
        assert_eq!(
            loaded.qos(QosType::ReadBps),
            config.qos(QosType::ReadBps)
        );
        assert_eq!(
            loaded.network_interfaces(&InterfaceConf::default()).len(),
            1
        );
        assert_eq!(loaded.routes(&Route::default()).len(), 1);

        // rebuilt index: the container path is taken, the host path has two referents
        assert!(loaded
            .update_bind(&bind("/other", "/mnt/a", "rw,rslave"), true)
            .is_err());
        assert!(!loaded
            .update_bind(&bind("/data", "/mnt/a", "rw,rslave"), false)
            .unwrap());
        assert!(loaded
            .update_bind(&bind("/data", "/mnt/b", "rw,rslave"), false)
            .unwrap());
    }

    #[test]
    fn test_failed_remove_keeps_container_path() {
        let dir = TempDir::new().unwrap();
        let mut config = HookConfig::for_container(dir.path()).unwrap();
        config.update_bind(&bind("/data", "/mnt/a", "rw"), true).unwrap();
        assert!(config.update_bind(&bind("/other", "/mnt/a", "rw"), false).is_err());
        assert!(config.update_bind(&bind("/x", "/mnt/a", "rw"), true).is_err());
        let on_a: Vec<&String> = config
            .binds()
            .iter()
            .filter(|b| b.split(':').nth(1) == Some("/mnt/a"))
            .collect();
        assert_eq!(on_a, vec!["/data:/mnt/a:rw"]);
        assert!(config.update_bind(&bind("/data", "/mnt/a", "rw"), false).unwrap());
    }

    #[test]
    fn test_corrupt_bind_fails_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.child("device_hook.json");
        std::fs::write(&path, r#"{"bindToAdd":["/data:/mnt/a:rw","/other:/mnt/a:rw"]}"#).unwrap();
        assert!(HookConfig::load(&path).is_err());
        std::fs::write(&path, r#"{"bindToAdd":["/data"]}"#).unwrap();
        assert!(HookConfig::load(&path).is_err());
    }
}
