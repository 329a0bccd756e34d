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

use std::{fs::DirBuilder, io::ErrorKind, os::unix::fs::DirBuilderExt, path::Path};

use anyhow::anyhow;
use log::error;
use nix::unistd::{chown, Gid, Uid};
use oci_spec::runtime::Spec;

use crate::{container::user_ns_ids, device::clean_path, types::Bind};

pub const DEFAULT_BIND_PERMISSIONS: &str = "rw,rslave";

const VALID_MOUNT_OPTIONS: [&str; 5] = ["ro", "rw", "private", "rprivate", "rslave"];

/// Every option is known and none is given twice.
pub fn valid_mount_option(option: &str) -> bool {
    let mut seen = vec![];
    for op in option.split(',') {
        if !VALID_MOUNT_OPTIONS.contains(&op) || seen.contains(&op) {
            return false;
        }
        seen.push(op);
    }
    true
}

/// Parses `host:container[:options]`.
///
/// With `create` set the bind is about to be mounted: ownership follows the
/// container's user namespace, and when a spec is at hand a missing host
/// directory is created for it.
pub fn parse_bind(bind_str: &str, spec: Option<&Spec>, create: bool) -> anyhow::Result<Bind> {
    let arr: Vec<&str> = bind_str.split(':').collect();
    let mut permissions = DEFAULT_BIND_PERMISSIONS.to_string();
    match arr.len() {
        3 => {
            if !valid_mount_option(arr[2]) {
                return Err(anyhow!("invalid permissions: {}", arr[2]));
            }
            permissions = arr[2].to_string();
        }
        2 => {}
        _ => return Err(anyhow!("invalid path specification: {}", bind_str)),
    }
    let src = clean_path(arr[0]);
    let dst = clean_path(arr[1]);
    if !Path::new(&src).is_absolute() || !Path::new(&dst).is_absolute() {
        return Err(anyhow!(
            "invalid path specification: {}, only absolute path is allowed",
            bind_str
        ));
    }

    let mut bind = Bind {
        host_path: src,
        container_path: dst,
        mount_option: permissions,
        ..Default::default()
    };

    let link = std::fs::symlink_metadata(&bind.host_path);
    if let Err(e) = &link {
        error!("failed to lstat {}, {}", bind.host_path, e);
    }
    let info = std::fs::metadata(&bind.host_path);
    if let (Ok(l), Err(e)) = (&link, &info) {
        if l.file_type().is_symlink() {
            return Err(anyhow!("failed to get symlink source of {}, {}", bind_str, e));
        }
    }

    if create {
        if let Some(spec) = spec {
            let (uid, gid) = user_ns_ids(spec);
            bind.uid = uid.max(0);
            bind.gid = gid.max(0);
        }
        match info {
            Ok(i) => bind.is_dir = i.is_dir(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                bind.is_dir = true;
                if spec.is_some() {
                    DirBuilder::new()
                        .recursive(true)
                        .mode(0o755)
                        .create(&bind.host_path)
                        .map_err(|e| anyhow!("failed to create dir {}, {}", bind.host_path, e))?;
                    chown(
                        bind.host_path.as_str(),
                        Some(Uid::from_raw(bind.uid as u32)),
                        Some(Gid::from_raw(bind.gid as u32)),
                    )
                    .map_err(|e| anyhow!("failed to chown {}, {}", bind.host_path, e))?;
                }
            }
            Err(_) => return Err(anyhow!("invalid path specification: {}", bind_str)),
        }
    } else {
        match info {
            Ok(i) => bind.is_dir = i.is_dir(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(bind),
            Err(_) => return Err(anyhow!("invalid path specification: {}", bind_str)),
        }
    }
    Ok(bind)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use temp_dir::TempDir;

    use super::{parse_bind, valid_mount_option};

    #[test]
    fn test_valid_mount_option() {
        assert!(valid_mount_option("ro"));
        assert!(valid_mount_option("rw,rslave"));
        assert!(valid_mount_option("rprivate,ro"));
        assert!(!valid_mount_option("rw,rw"));
        assert!(!valid_mount_option("shared"));
        assert!(!valid_mount_option(""));
    }

    #[test]
    fn test_parse_bind() {
        let dir = TempDir::new().unwrap();
        let host = dir.child("data");
        fs::create_dir_all(&host).unwrap();
        let b = parse_bind(&format!("{}/:/mnt//data", host.display()), None, true).unwrap();
        assert_eq!(b.host_path, host.to_str().unwrap());
        assert_eq!(b.container_path, "/mnt/data");
        assert_eq!(b.mount_option, "rw,rslave");
        assert!(b.is_dir);

        let file = dir.child("file");
        fs::write(&file, b"x").unwrap();
        let b = parse_bind(&format!("{}:/etc/file:ro", file.display()), None, false).unwrap();
        assert!(!b.is_dir);
        assert_eq!(b.mount_option, "ro");
    }

    #[test]
    fn test_parse_bind_missing_source() {
        let dir = TempDir::new().unwrap();
        let missing = dir.child("missing");
        let spec = format!("{}:/data", missing.display());
        let b = parse_bind(&spec, None, false).unwrap();
        assert!(!b.is_dir);
        // without an oci spec nothing is created on the host
        let b = parse_bind(&spec, None, true).unwrap();
        assert!(b.is_dir);
        assert!(!missing.exists());
    }

    #[test]
    fn test_parse_bind_errors() {
        assert!(parse_bind("/a", None, false).is_err());
        assert!(parse_bind("a:/b", None, false).is_err());
        assert!(parse_bind("/a:/b:rw,shared", None, false).is_err());

        let dir = TempDir::new().unwrap();
        let link = dir.child("dangling");
        std::os::unix::fs::symlink(dir.child("nowhere"), &link).unwrap();
        assert!(parse_bind(&format!("{}:/data", link.display()), None, false).is_err());
    }
}
