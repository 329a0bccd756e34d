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
    fs::read_to_string,
    path::{Path, PathBuf},
};

use anyhow::anyhow;
use log::debug;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/syscontainer-tools/config.toml";
pub const CONFIG_PATH_ENV: &str = "SYSCONTAINER_TOOLS_CONFIG";

const TOOL_NAME: &str = "syscontainer-tools";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// runtime state of the tools: udev lock file, netns bind files
    pub tool_dir: String,
    /// parent of the per-container config directories
    pub container_root: String,
    pub udev_rules: String,
    pub udev_helper: String,
    pub log_level: String,
    pub relabel: bool,
    /// cli used to inspect containers
    pub runtime: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            tool_dir: format!("/run/{}", TOOL_NAME),
            container_root: "/var/lib/isulad/engines/lcr".to_string(),
            udev_rules: format!("/etc/udev/rules.d/99-{}.rules", TOOL_NAME),
            udev_helper: format!("/lib/udev/{}_wrapper", TOOL_NAME),
            log_level: "info".to_string(),
            relabel: false,
            runtime: "isula".to_string(),
        }
    }
}

impl Settings {
    /// Loads the settings file, a missing file gives the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("config {} not found, use default settings", path.display());
            return Ok(Settings::default());
        }
        let toml_str = read_to_string(path)
            .map_err(|e| anyhow!("failed to read config {}, {}", path.display(), e))?;
        let settings: Self = toml::from_str(&toml_str)
            .map_err(|e| anyhow!("failed to parse config {}, {}", path.display(), e))?;
        Ok(settings)
    }

    /// `--config` wins over the environment, which wins over the default path.
    pub fn config_path(flag: Option<&str>) -> PathBuf {
        if let Some(p) = flag {
            return PathBuf::from(p);
        }
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(p) if !p.is_empty() => PathBuf::from(p),
            _ => PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }

    pub fn netns_dir(&self) -> PathBuf {
        Path::new(&self.tool_dir).join("netns")
    }

    pub fn udev_lock_file(&self) -> PathBuf {
        Path::new(&self.tool_dir).join("udevd_config_locker")
    }
}

#[cfg(test)]
mod tests {
    use std::fs::write;

    use temp_dir::TempDir;

    use super::Settings;

    #[test]
    fn test_missing_config_is_default() {
        let dir = TempDir::new().unwrap();
        let s = Settings::load(dir.child("none.toml")).unwrap();
        assert_eq!(s, Settings::default());
        assert_eq!(
            s.udev_lock_file().to_str().unwrap(),
            "/run/syscontainer-tools/udevd_config_locker"
        );
    }

    #[test]
    fn test_partial_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.child("config.toml");
        write(&path, "tool_dir = \"/tmp/tools\"\nrelabel = true\n").unwrap();
        let s = Settings::load(&path).unwrap();
        assert_eq!(s.tool_dir, "/tmp/tools");
        assert!(s.relabel);
        assert_eq!(s.log_level, "info");
        assert_eq!(s.runtime, "isula");
        assert_eq!(s.netns_dir().to_str().unwrap(), "/tmp/tools/netns");
    }

    #[test]
    fn test_flag_overrides_env() {
        assert_eq!(
            Settings::config_path(Some("/a/b.toml")).to_str().unwrap(),
            "/a/b.toml"
        );
    }
}
