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
    fs::{File, Permissions},
    io::{ErrorKind, Write},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::anyhow;
use log::{error, info};

use crate::{
    settings::Settings,
    utils::{execute, FileLock},
};

const RULES_HEADER: &str =
    "## This File is auto-generated by syscontainer-tools.\n## DO   NOT  EDIT   IT\n\n";
const SHORT_ID_LEN: usize = 8;
const MIN_RUN_ARGS: usize = 6;

/// Forwards partition events of a host disk into one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdevRule {
    /// host device, `/dev/sdb`
    pub name: String,
    pub ctr_dev_name: String,
    pub container: String,
}

impl UdevRule {
    pub fn new(name: &str, ctr_dev_name: &str, container: &str) -> Self {
        Self {
            name: name.to_string(),
            ctr_dev_name: ctr_dev_name.to_string(),
            container: container.to_string(),
        }
    }

    pub fn trim_container_id(&self) -> &str {
        match self.container.char_indices().nth(SHORT_ID_LEN) {
            Some((idx, _)) => &self.container[..idx],
            None => &self.container,
        }
    }

    pub fn to_rule_string(&self, helper: &str) -> String {
        let base = Path::new(&self.name)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        format!(
            "KERNEL==\"{}*\",ACTION==\"add|remove\", ENV{{DEVTYPE}}==\"partition\", SUBSYSTEM==\"block\", RUN{{program}}+=\"{} $env{{ACTION}} {} $name {} {}\"",
            base,
            helper,
            self.trim_container_id(),
            self.ctr_dev_name,
            base
        )
    }

    fn same_as(&self, other: &UdevRule) -> bool {
        self.name == other.name
            && self.ctr_dev_name == other.ctr_dev_name
            && self.trim_container_id() == other.trim_container_id()
    }
}

pub fn save_rules<P: AsRef<Path>>(path: P, rules: &[UdevRule], helper: &str) -> anyhow::Result<()> {
    let path = path.as_ref();
    let mut f = File::create(path)
        .map_err(|e| anyhow!("failed to create {}, {}", path.display(), e))?;
    f.set_permissions(Permissions::from_mode(0o600))
        .map_err(|e| anyhow!("failed to chmod {}, {}", path.display(), e))?;
    f.write_all(RULES_HEADER.as_bytes())
        .map_err(|e| anyhow!("failed to write {}, {}", path.display(), e))?;
    for r in rules {
        if let Err(e) = writeln!(f, "{}", r.to_rule_string(helper)) {
            error!("failed to write rule of {}, {}", r.name, e);
        }
    }
    f.sync_all()
        .map_err(|e| anyhow!("failed to sync {}, {}", path.display(), e))
}

/// Reads back the rules written by [`save_rules`]. Lines that do not carry a
/// device name, a container id and a container device are skipped.
pub fn load_rules<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<UdevRule>> {
    let path = path.as_ref();
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(anyhow!("failed to read {}, {}", path.display(), e)),
    };
    info!("start load rules from path: {}", path.display());
    let mut rules = vec![];
    for line in content.lines() {
        let text = line.trim_start_matches(' ');
        if text.starts_with('#') {
            continue;
        }
        if let Some(rule) = parse_rule_line(text) {
            rules.push(rule);
        }
    }
    info!("finish load rules from path: {}", path.display());
    Ok(rules)
}

fn quoted(tag: &str) -> Option<&str> {
    tag.split('"').nth(1)
}

fn parse_rule_line(text: &str) -> Option<UdevRule> {
    let mut name = "";
    let mut ctr_dev_name = "";
    let mut container = "";
    for tag in text.split(',').map(|t| t.trim_matches(' ')) {
        if tag.starts_with("KERNEL") {
            // KERNEL=="sdb*"
            if let Some(sub) = quoted(tag) {
                name = sub.strip_suffix('*').unwrap_or(sub);
            }
        } else if tag.starts_with("RUN") {
            if let Some(sub) = quoted(tag) {
                let args: Vec<&str> = sub.split(' ').collect();
                if args.len() >= MIN_RUN_ARGS {
                    container = args[2];
                    ctr_dev_name = args[4];
                }
            }
        }
    }
    if name.is_empty() || container.is_empty() || ctr_dev_name.is_empty() {
        return None;
    }
    Some(UdevRule::new(
        &Path::new("/dev").join(name).to_string_lossy(),
        ctr_dev_name,
        container,
    ))
}

/// The host-wide rule set, read and written under its own lock file.
pub struct UdevController {
    config_file: PathBuf,
    lock_file: PathBuf,
    helper: String,
    rules: Vec<UdevRule>,
    dirty: bool,
    lock: Option<FileLock>,
}

impl UdevController {
    pub fn new(settings: &Settings) -> Self {
        Self {
            config_file: PathBuf::from(&settings.udev_rules),
            lock_file: settings.udev_lock_file(),
            helper: settings.udev_helper.clone(),
            rules: vec![],
            dirty: false,
            lock: None,
        }
    }

    pub fn lock(&mut self) -> anyhow::Result<()> {
        if let Some(dir) = self.lock_file.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| anyhow!("failed to create {}, {}", dir.display(), e))?;
        }
        self.lock = Some(FileLock::lock(&self.lock_file)?);
        Ok(())
    }

    pub fn unlock(&mut self) {
        self.lock.take();
    }

    pub fn load_rules(&mut self) -> anyhow::Result<()> {
        self.rules = load_rules(&self.config_file)?;
        Ok(())
    }

    /// In memory only, see [`UdevController::to_disk`].
    pub fn add_rule(&mut self, rule: UdevRule) {
        if self.rules.iter().any(|r| r.same_as(&rule)) {
            return;
        }
        self.dirty = true;
        self.rules.push(rule);
    }

    pub fn remove_rule(&mut self, rule: &UdevRule) {
        if let Some(idx) = self.rules.iter().position(|r| r.same_as(rule)) {
            self.dirty = true;
            self.rules.remove(idx);
        }
    }

    pub fn rules(&self) -> &[UdevRule] {
        &self.rules
    }

    pub fn to_disk(&mut self) -> anyhow::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        save_rules(&self.config_file, &self.rules, &self.helper)?;
        self.dirty = false;
        reload_config()
    }
}

fn reload_config() -> anyhow::Result<()> {
    let mut cmd = Command::new("udevadm");
    cmd.args(["control", "--reload"]);
    execute(cmd).map(|_| ())
}

#[cfg(test)]
mod tests {
    use temp_dir::TempDir;

    use super::{load_rules, parse_rule_line, save_rules, UdevController, UdevRule};
    use crate::settings::Settings;

    const HELPER: &str = "/lib/udev/syscontainer-tools_wrapper";

    #[test]
    fn test_rule_string() {
        let r = UdevRule::new("/dev/sdb", "/dev/xvdb", "0123456789abcdef");
        assert_eq!(r.trim_container_id(), "01234567");
        assert_eq!(
            r.to_rule_string(HELPER),
            "KERNEL==\"sdb*\",ACTION==\"add|remove\", ENV{DEVTYPE}==\"partition\", SUBSYSTEM==\"block\", \
             RUN{program}+=\"/lib/udev/syscontainer-tools_wrapper $env{ACTION} 01234567 $name /dev/xvdb sdb\""
        );
        assert_eq!(UdevRule::new("/dev/sdb", "/dev/xvdb", "abc").trim_container_id(), "abc");
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.child("99-syscontainer-tools.rules");
        assert!(load_rules(&path).unwrap().is_empty());

        let rules = vec![
            UdevRule::new("/dev/sdb", "/dev/xvdb", "0123456789abcdef"),
            UdevRule::new("/dev/vdc", "/dev/vdc", "fedcba9876543210"),
        ];
        save_rules(&path, &rules, HELPER).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("## This File is auto-generated by syscontainer-tools.\n"));

        let loaded = load_rules(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "/dev/sdb");
        assert_eq!(loaded[0].ctr_dev_name, "/dev/xvdb");
        assert_eq!(loaded[0].container, "01234567");
        assert!(loaded[0].same_as(&rules[0]));
    }

    #[test]
    fn test_parse_rule_line_skips_garbage() {
        assert!(parse_rule_line("").is_none());
        assert!(parse_rule_line("KERNEL==\"sdb*\"").is_none());
        assert!(parse_rule_line("KERNEL==\"sdb*\", RUN{program}+=\"/bin/x add\"").is_none());
    }

    #[test]
    fn test_controller_dedupe() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            tool_dir: dir.path().to_string_lossy().to_string(),
            udev_rules: dir.child("rules").to_string_lossy().to_string(),
            ..Default::default()
        };
        let mut c = UdevController::new(&settings);
        c.lock().unwrap();
        c.load_rules().unwrap();
        c.add_rule(UdevRule::new("/dev/sdb", "/dev/xvdb", "0123456789abcdef"));
        // same short id, same rule
        c.add_rule(UdevRule::new("/dev/sdb", "/dev/xvdb", "01234567ffff"));
        assert_eq!(c.rules().len(), 1);
        c.remove_rule(&UdevRule::new("/dev/sdb", "/dev/xvdb", "01234567"));
        assert!(c.rules().is_empty());
        c.remove_rule(&UdevRule::new("/dev/sdb", "/dev/xvdb", "01234567"));
        c.unlock();
    }
}
