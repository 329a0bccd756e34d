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
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::anyhow;
use lazy_static::lazy_static;
use log::warn;
use oci_spec::runtime::{LinuxIdMapping, LinuxNamespaceType, Spec};
use regex::Regex;

use crate::{config::HOOK_CONFIG_FILE, settings::Settings, utils::execute, utils::FileLock};

const DEVICE_HOOK_LOCK: &str = ".device_hook.lock";
const RESTRICTED_NAME_CHARS: &str = "[a-zA-Z0-9][a-zA-Z0-9_.-]";
const DEFAULT_CGROUP_PARENT: &str = "/lxc";

lazy_static! {
    static ref NAME_PATTERN: Regex =
        Regex::new(&format!("^/?{}+$", RESTRICTED_NAME_CHARS)).unwrap();
}

/// A container the tools operate on: identity, config directory and the
/// lock serializing every change to that directory.
pub struct Container {
    pid: i32,
    id: String,
    name: String,
    path: PathBuf,
    spec: Option<Spec>,
    runtime: String,
    lock: Option<FileLock>,
}

impl Container {
    /// Resolves `name` through the container runtime cli. A pid from the
    /// command line wins over the one the runtime reports.
    pub fn new(settings: &Settings, name: &str, pid: Option<i32>) -> anyhow::Result<Self> {
        if !NAME_PATTERN.is_match(name) {
            return Err(anyhow!(
                "invalid container name ({}), only {} are allowed",
                name,
                RESTRICTED_NAME_CHARS
            ));
        }
        let id = inspect(&settings.runtime, name, "{{json .Id}}")?
            .trim_matches('"')
            .to_string();
        let pid = match pid {
            Some(p) => p,
            None => {
                let out = inspect(&settings.runtime, name, "{{json .State.Pid}}")?;
                out.parse::<i32>()
                    .map_err(|e| anyhow!("failed to convert {:?} to int, {}", out, e))?
            }
        };
        let path = Path::new(&settings.container_root).join(&id);
        let spec = match load_spec(path.join("config.json")) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("fail to get container {} spec, {}", id, e);
                None
            }
        };
        Ok(Self {
            pid,
            id,
            name: name.to_string(),
            path,
            spec,
            runtime: settings.runtime.clone(),
            lock: None,
        })
    }

    /// Container known from a hook invocation, nothing is asked from the runtime.
    pub fn from_parts<P: AsRef<Path>>(id: &str, pid: i32, path: P, spec: Option<Spec>) -> Self {
        Self {
            pid,
            id: id.to_string(),
            name: id.to_string(),
            path: path.as_ref().to_path_buf(),
            spec,
            runtime: Settings::default().runtime,
            lock: None,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn spec(&self) -> Option<&Spec> {
        self.spec.as_ref()
    }

    pub fn set_path<P: AsRef<Path>>(&mut self, path: P) {
        self.path = path.as_ref().to_path_buf();
    }

    pub fn hook_config_path(&self) -> PathBuf {
        self.path.join(HOOK_CONFIG_FILE)
    }

    pub fn net_ns_path(&self) -> String {
        format!("/proc/{}/ns/net", self.pid)
    }

    /// A running container has a live init process.
    pub fn check_pid_exist(&self) -> bool {
        self.pid > 0 && Path::new(&format!("/proc/{}", self.pid)).exists()
    }

    /// Blocks until no other tool or hook holds the container.
    pub fn lock(&mut self) -> anyhow::Result<()> {
        self.lock = Some(FileLock::lock(self.path.join(DEVICE_HOOK_LOCK))?);
        Ok(())
    }

    pub fn unlock(&mut self) {
        self.lock.take();
    }

    /// Cgroup path of the container below the hierarchy root.
    pub fn cgroup_path(&self) -> anyhow::Result<String> {
        let out = inspect(&self.runtime, &self.name, "{{json .HostConfig.CgroupParent}}")?;
        let parent = out.trim_matches('"');
        let parent = if parent.is_empty() {
            DEFAULT_CGROUP_PARENT
        } else {
            parent
        };
        Ok(Path::new(parent)
            .join(&self.id)
            .to_string_lossy()
            .to_string())
    }
}

fn inspect(runtime: &str, name: &str, format: &str) -> anyhow::Result<String> {
    let mut cmd = Command::new(runtime);
    cmd.args(["inspect", "-f", format, name]);
    let out = execute(cmd)?;
    Ok(out.trim_end_matches('\n').to_string())
}

pub fn load_spec<P: AsRef<Path>>(path: P) -> anyhow::Result<Spec> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(anyhow!("config file {} not found", path.display()));
    }
    Spec::load(path).map_err(|e| anyhow!("failed to load spec {}, {}", path.display(), e))
}

fn host_id_from_mapping(container_id: u32, mappings: &Option<Vec<LinuxIdMapping>>) -> i32 {
    for m in mappings.iter().flatten() {
        if container_id >= m.container_id()
            && container_id < m.container_id().saturating_add(m.size())
        {
            let id = m
                .host_id()
                .checked_add(container_id - m.container_id())
                .and_then(|id| i32::try_from(id).ok());
            return match id {
                Some(id) => id,
                None => {
                    warn!(
                        "host id of {} overflows mapping {}:{}:{}",
                        container_id,
                        m.container_id(),
                        m.host_id(),
                        m.size()
                    );
                    -1
                }
            };
        }
    }
    -1
}

/// Host uid and gid of root in the container, -1 without a user namespace.
pub fn user_ns_ids(spec: &Spec) -> (i32, i32) {
    let linux = match spec.linux() {
        Some(l) => l,
        None => return (-1, -1),
    };
    let has_userns = linux
        .namespaces()
        .iter()
        .flatten()
        .any(|ns| ns.typ() == LinuxNamespaceType::User);
    if !has_userns {
        return (-1, -1);
    }
    (
        host_id_from_mapping(0, linux.uid_mappings()),
        host_id_from_mapping(0, linux.gid_mappings()),
    )
}

#[cfg(test)]
mod tests {
    use oci_spec::runtime::{LinuxIdMapping, Spec};
    use temp_dir::TempDir;

    use super::{host_id_from_mapping, load_spec, user_ns_ids, Container, NAME_PATTERN};

    pub(crate) fn userns_spec() -> Spec {
        serde_json::from_str(
            r#"{
                "ociVersion": "1.0.2",
                "linux": {
                    "namespaces": [{"type": "mount"}, {"type": "user"}],
                    "uidMappings": [{"containerID": 0, "hostID": 100000, "size": 65536}],
                    "gidMappings": [{"containerID": 0, "hostID": 200000, "size": 65536}]
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_name_pattern() {
        assert!(NAME_PATTERN.is_match("web-1"));
        assert!(NAME_PATTERN.is_match("/db_2.x"));
        assert!(NAME_PATTERN.is_match("0123456789abcdef"));
        assert!(!NAME_PATTERN.is_match("-web"));
        assert!(!NAME_PATTERN.is_match("a/b"));
        assert!(!NAME_PATTERN.is_match(""));
    }

    #[test]
    fn test_user_ns_ids() {
        assert_eq!(user_ns_ids(&userns_spec()), (100000, 200000));
        let plain: Spec = serde_json::from_str(
            r#"{"ociVersion": "1.0.2", "linux": {"namespaces": [{"type": "mount"}],
                "uidMappings": [{"containerID": 0, "hostID": 1000, "size": 1}]}}"#,
        )
        .unwrap();
        assert_eq!(user_ns_ids(&plain), (-1, -1));
        let unmapped: Spec = serde_json::from_str(
            r#"{"ociVersion": "1.0.2", "linux": {"namespaces": [{"type": "user"}],
                "uidMappings": [{"containerID": 1, "hostID": 1000, "size": 10}]}}"#,
        )
        .unwrap();
        assert_eq!(user_ns_ids(&unmapped), (-1, -1));
    }

    #[test]
    fn test_host_id_out_of_range() {
        let mappings: Vec<LinuxIdMapping> = serde_json::from_str(
            r#"[{"containerID": 0, "hostID": 4294967294, "size": 10},
                {"containerID": 100, "hostID": 3000000000, "size": 10}]"#,
        )
        .unwrap();
        let mappings = Some(mappings);
        assert_eq!(host_id_from_mapping(0, &mappings), -1);
        // u32 overflow
        assert_eq!(host_id_from_mapping(5, &mappings), -1);
        // past i32::MAX
        assert_eq!(host_id_from_mapping(101, &mappings), -1);
        assert_eq!(host_id_from_mapping(200, &mappings), -1);
    }

    #[test]
    fn test_container_from_parts() {
        let dir = TempDir::new().unwrap();
        assert!(load_spec(dir.child("config.json")).is_err());

        let mut c = Container::from_parts("abc", 0, dir.path(), None);
        assert!(!c.check_pid_exist());
        assert_eq!(c.hook_config_path(), dir.child("device_hook.json"));
        assert_eq!(c.net_ns_path(), "/proc/0/ns/net");
        c.lock().unwrap();
        assert!(dir.child(".device_hook.lock").exists());
        c.unlock();

        let me = Container::from_parts("abc", std::process::id() as i32, dir.path(), None);
        assert!(me.check_pid_exist());
    }
}
