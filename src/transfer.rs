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

//! Host paths reach a running container through mount propagation.
//!
//! The prestart hook mounts `/.sharedpath/master/<id>` (host side, rshared)
//! on `/.sharedpath` inside the container (rslave, ro). Adding `/host1` then
//! bind mounts it on `/.sharedpath/midpath/<id>/<sha>` and again on
//! `/.sharedpath/master/<id>/<sha>`, the latter propagates into the container
//! where the worker binds `/.sharedpath/<sha>` on the final destination.

use std::{
    fs::{DirBuilder, OpenOptions},
    os::unix::fs::{DirBuilderExt, OpenOptionsExt},
    path::{Path, PathBuf},
};

use anyhow::anyhow;
use log::error;
use nix::mount::{MntFlags, MsFlags};

use crate::{
    mount::{is_mounted, mount, unmount, valid_mount_propagation},
    types::Bind,
    utils::sha256_hex,
};

pub const MASTER_PATH: &str = "/.sharedpath/master";
pub const MID_TRANSFER_PATH: &str = "/.sharedpath/midpath";
pub const SLAVE_PATH: &str = "/.sharedpath";

const MASTER_TMPFS_OPTIONS: &str = "size=16m";

pub fn transfer_base(host_path: &str) -> String {
    sha256_hex(host_path)
}

pub fn container_spec_dir(id: &str) -> PathBuf {
    Path::new(MASTER_PATH).join(id)
}

pub fn container_mid_dir(id: &str) -> PathBuf {
    Path::new(MID_TRANSFER_PATH).join(id)
}

/// (mid path, master path) of one host path.
pub fn transfer_paths(id: &str, host_path: &str) -> (PathBuf, PathBuf) {
    let base = transfer_base(host_path);
    (container_mid_dir(id).join(&base), container_spec_dir(id).join(&base))
}

fn mkdir_all(path: &Path) -> anyhow::Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o600)
        .create(path)
        .map_err(|e| anyhow!("failed to create dir {}, {}", path.display(), e))
}

fn prepare_mountpoint(src: &str, dst: &Path, options: &str, is_dir: bool) -> anyhow::Result<()> {
    if is_dir {
        mkdir_all(dst)?;
    } else {
        if let Some(parent) = dst.parent() {
            mkdir_all(parent)?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(dst)
            .map_err(|e| anyhow!("fail to create transfer path {}, {}", dst.display(), e))?;
    }
    if is_mounted(dst)? {
        return Ok(());
    }
    mount(src, &dst.to_string_lossy(), "none", options)
}

/// Points `bind.resolv_path` at the shared copy of the host path seen from
/// `root`. With `do_mount` the host side mounts are set up as well, which is
/// needed only for the first bind of a host path.
pub fn prepare_transfer_path(
    root: &str,
    id: &str,
    bind: &mut Bind,
    do_mount: bool,
) -> anyhow::Result<()> {
    let (mid, master) = transfer_paths(id, &bind.host_path);
    bind.mount_option.push_str(",bind");
    bind.resolv_path = Path::new(root)
        .join(SLAVE_PATH.trim_start_matches('/'))
        .join(transfer_base(&bind.host_path))
        .to_string_lossy()
        .to_string();
    if !do_mount {
        return Ok(());
    }
    valid_mount_propagation(&bind.host_path, &bind.mount_option)?;
    prepare_mountpoint(&bind.host_path, &mid, &bind.mount_option, bind.is_dir)?;
    prepare_mountpoint(
        &mid.to_string_lossy(),
        &master,
        &bind.mount_option,
        bind.is_dir,
    )
}

fn release_mountpoint(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if let Err(e) = unmount(&path.to_string_lossy(), MntFlags::empty()) {
        error!(
            "failed to umount {}, {}, still try to remove it",
            path.display(),
            e
        );
    }
    let res = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    res.map_err(|e| anyhow!("failed to remove {}, {}", path.display(), e))
}

/// Failures are only logged, the paths are left for the poststop hook.
pub fn remove_transfer_path(id: &str, bind: &Bind) {
    let (mid, master) = transfer_paths(id, &bind.host_path);
    for p in [mid, master] {
        if let Err(e) = release_mountpoint(&p) {
            error!("remove transfer path failed, {}", e);
        }
    }
}

pub fn remove_container_spec_path(id: &str) {
    for dir in [container_mid_dir(id), container_spec_dir(id)] {
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!("remove shared path {} failed, {}", dir.display(), e);
            }
        }
    }
}

/// Makes the rshared tmpfs master once per host, then the container's directory in it.
pub fn prepare_host_path(id: &str) -> anyhow::Result<()> {
    mkdir_all(Path::new(MASTER_PATH))
        .map_err(|e| anyhow!("create host shared path failed, {}", e))?;
    if !is_mounted(MASTER_PATH).unwrap_or(false) {
        mount("none", MASTER_PATH, "tmpfs", MASTER_TMPFS_OPTIONS)
            .map_err(|e| anyhow!("mount host shared path failed, {}", e))?;
        nix::mount::mount::<str, str, str, str>(
            Some("none"),
            MASTER_PATH,
            Some("none"),
            MsFlags::MS_SHARED | MsFlags::MS_REC,
            None,
        )
        .map_err(|e| anyhow!("failed to make mountpoint shared, {}", e))?;
    }
    mkdir_all(&container_spec_dir(id))
        .map_err(|e| anyhow!("create host shared path failed, {}", e))
}

/// Bind the prestart hook hands to the worker to join the container to the master.
pub fn transfer_base_bind(root: &str, id: &str) -> Bind {
    Bind {
        host_path: container_spec_dir(id).to_string_lossy().to_string(),
        is_dir: true,
        container_path: Path::new(root)
            .join(SLAVE_PATH.trim_start_matches('/'))
            .to_string_lossy()
            .to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{prepare_transfer_path, transfer_base, transfer_base_bind, transfer_paths};
    use crate::types::Bind;

    #[test]
    fn test_transfer_paths() {
        let base = transfer_base("/data");
        assert_eq!(base.len(), 64);
        let (mid, master) = transfer_paths("abc", "/data");
        assert_eq!(mid, Path::new("/.sharedpath/midpath/abc").join(&base));
        assert_eq!(master, Path::new("/.sharedpath/master/abc").join(&base));
    }

    #[test]
    fn test_prepare_without_mount() {
        let mut bind = Bind {
            host_path: "/data".to_string(),
            container_path: "/mnt/data".to_string(),
            mount_option: "rw,rslave".to_string(),
            is_dir: true,
            ..Default::default()
        };
        prepare_transfer_path("/", "abc", &mut bind, false).unwrap();
        assert_eq!(bind.mount_option, "rw,rslave,bind");
        assert_eq!(
            bind.resolv_path,
            format!("/.sharedpath/{}", transfer_base("/data"))
        );

        let mut bind = Bind {
            host_path: "/data".to_string(),
            mount_option: "ro".to_string(),
            ..Default::default()
        };
        prepare_transfer_path("/var/lib/rootfs", "abc", &mut bind, false).unwrap();
        assert!(bind
            .resolv_path
            .starts_with("/var/lib/rootfs/.sharedpath/"));
    }

    #[test]
    fn test_transfer_base_bind() {
        let b = transfer_base_bind("/rootfs", "abc");
        assert_eq!(b.host_path, "/.sharedpath/master/abc");
        assert_eq!(b.container_path, "/rootfs/.sharedpath");
        assert!(b.is_dir);
    }
}
