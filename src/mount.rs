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
    ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use log::debug;
use nix::mount::{MntFlags, MsFlags};
use procfs::process::{MountOptFields, Process};

pub const MNT_OPTION_MAX_LEN: usize = 4096;

struct Flag {
    clear: bool,
    flags: MsFlags,
}

lazy_static! {
    static ref MOUNT_FLAGS: HashMap<&'static str, Flag> = {
        let table: [(&'static str, bool, MsFlags); 36] = [
            ("async", true, MsFlags::MS_SYNCHRONOUS),
            ("atime", true, MsFlags::MS_NOATIME),
            ("bind", false, MsFlags::MS_BIND),
            ("defaults", false, MsFlags::empty()),
            ("dev", true, MsFlags::MS_NODEV),
            ("diratime", true, MsFlags::MS_NODIRATIME),
            ("dirsync", false, MsFlags::MS_DIRSYNC),
            ("exec", true, MsFlags::MS_NOEXEC),
            ("mand", false, MsFlags::MS_MANDLOCK),
            ("noatime", false, MsFlags::MS_NOATIME),
            ("nodev", false, MsFlags::MS_NODEV),
            ("nodiratime", false, MsFlags::MS_NODIRATIME),
            ("noexec", false, MsFlags::MS_NOEXEC),
            ("nomand", true, MsFlags::MS_MANDLOCK),
            ("norelatime", true, MsFlags::MS_RELATIME),
            ("nostrictatime", true, MsFlags::MS_STRICTATIME),
            ("nosuid", false, MsFlags::MS_NOSUID),
            ("rbind", false, MsFlags::MS_BIND.bitor(MsFlags::MS_REC)),
            ("relatime", false, MsFlags::MS_RELATIME),
            ("remount", false, MsFlags::MS_REMOUNT),
            ("ro", false, MsFlags::MS_RDONLY),
            ("rw", true, MsFlags::MS_RDONLY),
            ("strictatime", false, MsFlags::MS_STRICTATIME),
            ("suid", true, MsFlags::MS_NOSUID),
            ("sync", false, MsFlags::MS_SYNCHRONOUS),
            ("private", false, MsFlags::MS_PRIVATE),
            ("rprivate", false, MsFlags::MS_PRIVATE.bitor(MsFlags::MS_REC)),
            ("shared", false, MsFlags::MS_SHARED),
            ("rshared", false, MsFlags::MS_SHARED.bitor(MsFlags::MS_REC)),
            ("slave", false, MsFlags::MS_SLAVE),
            ("rslave", false, MsFlags::MS_SLAVE.bitor(MsFlags::MS_REC)),
            ("unbindable", false, MsFlags::MS_UNBINDABLE),
            ("runbindable", false, MsFlags::MS_UNBINDABLE.bitor(MsFlags::MS_REC)),
            ("move", false, MsFlags::MS_MOVE),
            ("silent", false, MsFlags::MS_SILENT),
            ("loud", true, MsFlags::MS_SILENT),
        ];
        table
            .into_iter()
            .map(|(name, clear, flags)| (name, Flag { clear, flags }))
            .collect()
    };
    static ref PROPAGATION_TYPES: MsFlags = MsFlags::MS_SHARED
        .bitor(MsFlags::MS_PRIVATE)
        .bitor(MsFlags::MS_SLAVE)
        .bitor(MsFlags::MS_UNBINDABLE);
    static ref MS_BIND_RO: MsFlags = MsFlags::MS_BIND.bitor(MsFlags::MS_RDONLY);
}

/// Mounts `source` on `target`. `options` is a comma separated list, known
/// flags become mount flags and everything else is passed as data.
pub fn mount(source: &str, target: &str, fs_type: &str, options: &str) -> Result<()> {
    let (flags, data) = parse_options(options);
    let opt = data.join(",");
    if opt.len() > MNT_OPTION_MAX_LEN {
        return Err(anyhow!("mount option is too long"));
    }
    let data = if !data.is_empty() {
        Some(opt.as_str())
    } else {
        None
    };

    // mount with non-propagation first
    let oflags = flags.bitand(PROPAGATION_TYPES.not());
    nix::mount::mount(Some(source), target, Some(fs_type), oflags, data)
        .map_err(|e| anyhow!("failed to mount {} to {}, err: {}", source, target, e))?;

    if oflags.bitand(*MS_BIND_RO).eq(&MS_BIND_RO) {
        nix::mount::mount(
            Some(source),
            target,
            Some(fs_type),
            oflags.bitor(MsFlags::MS_REMOUNT),
            data,
        )
        .map_err(|e| anyhow!("failed change read only of {}, err: {}", target, e))?;
    }

    // change the propagation type
    if !flags.bitand(*PROPAGATION_TYPES).is_empty() {
        nix::mount::mount::<str, str, str, str>(
            Some("none"),
            target,
            Some("none"),
            flags.bitand(PROPAGATION_TYPES.bitor(MsFlags::MS_REC)),
            None,
        )
        .map_err(|e| anyhow!("failed change mount propagation of {}, err: {}", target, e))?;
    }
    Ok(())
}

pub fn bind_mount(source: &str, target: &str) -> Result<()> {
    nix::mount::mount::<str, str, str, str>(Some(source), target, None, MsFlags::MS_BIND, None)
        .map_err(|e| anyhow!("failed to bind mount {} to {}, {}", source, target, e))
}

/// Unmounts `target`, a target that does not exist counts as unmounted.
pub fn unmount(target: &str, flags: MntFlags) -> Result<()> {
    match nix::mount::umount2(target, flags) {
        Ok(_) => Ok(()),
        Err(nix::errno::Errno::ENOENT) => {
            debug!("the umount path {} not exist", target);
            Ok(())
        }
        Err(e) => Err(anyhow!("failed to umount {}, {}", target, e)),
    }
}

pub fn parse_options(options: &str) -> (MsFlags, Vec<String>) {
    let mut flags = MsFlags::empty();
    let mut data: Vec<String> = Vec::new();
    for opt in options.split(',').map(|o| o.trim()).filter(|o| !o.is_empty()) {
        if let Some(f) = MOUNT_FLAGS.get(opt) {
            if f.clear {
                flags.bitand_assign(f.flags.not());
            } else {
                flags.bitor_assign(f.flags)
            }
        } else {
            data.push(opt.to_string())
        }
    }
    (flags, data)
}

pub fn is_mounted<P: AsRef<Path>>(path: P) -> Result<bool> {
    let path = path.as_ref();
    let infos = Process::myself()
        .and_then(|p| p.mountinfo())
        .map_err(|e| anyhow!("failed to read mountinfo, {}", e))?;
    Ok(infos.into_iter().any(|m| m.mount_point == path))
}

/// A bind with shared or slave propagation needs a source that can propagate.
pub fn valid_mount_propagation(path: &str, options: &str) -> Result<()> {
    let opts: Vec<&str> = options.split(',').collect();
    if !opts.contains(&"bind") {
        return Ok(());
    }
    let shared = opts.contains(&"shared") || opts.contains(&"rshared");
    let slave = opts.contains(&"slave") || opts.contains(&"rslave");
    if !shared && !slave {
        return Ok(());
    }

    let (source, fields) = mount_source(path)?;
    let shared_mnt = fields
        .iter()
        .any(|f| matches!(f, MountOptFields::Shared(_)));
    let slave_mnt = fields
        .iter()
        .any(|f| matches!(f, MountOptFields::Master(_)));
    if shared && !shared_mnt {
        return Err(anyhow!(
            "path {} is mounted on {} but it is not a shared mount",
            path,
            source.display()
        ));
    }
    if slave && !shared_mnt && !slave_mnt {
        return Err(anyhow!(
            "path {} is mounted on {} but it is not a shared or slave mount",
            path,
            source.display()
        ));
    }
    Ok(())
}

fn mount_source(path: &str) -> Result<(PathBuf, Vec<MountOptFields>)> {
    let mut current = std::fs::canonicalize(path)
        .map_err(|e| anyhow!("failed to resolve {}, {}", path, e))?;
    let infos: Vec<_> = Process::myself()
        .and_then(|p| p.mountinfo())
        .map_err(|e| anyhow!("failed to read mountinfo, {}", e))?
        .into_iter()
        .collect();
    loop {
        if let Some(m) = infos.iter().find(|m| m.mount_point == current) {
            return Ok((current, m.opt_fields.clone()));
        }
        match current.parent() {
            Some(p) => current = p.to_path_buf(),
            None => return Err(anyhow!("could not find mount {}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use nix::mount::MsFlags;

    use super::{is_mounted, parse_options};

    #[test]
    fn test_parse_options() {
        let (flags, data) = parse_options("ro,bind,rslave");
        assert!(flags.contains(MsFlags::MS_RDONLY));
        assert!(flags.contains(MsFlags::MS_BIND));
        assert!(flags.contains(MsFlags::MS_SLAVE));
        assert!(flags.contains(MsFlags::MS_REC));
        assert!(data.is_empty());

        let (flags, data) = parse_options("rw, nosuid,size=16m,mode=755");
        assert!(!flags.contains(MsFlags::MS_RDONLY));
        assert!(flags.contains(MsFlags::MS_NOSUID));
        assert_eq!(data, vec!["size=16m".to_string(), "mode=755".to_string()]);
    }

    #[test]
    fn test_clear_flag_overrides() {
        let (flags, _) = parse_options("nodev,dev");
        assert!(!flags.contains(MsFlags::MS_NODEV));
        let (flags, data) = parse_options("");
        assert!(flags.is_empty());
        assert!(data.is_empty());
    }

    #[test]
    fn test_root_is_mounted() {
        assert!(is_mounted("/").unwrap());
    }
}
