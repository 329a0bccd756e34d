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
    fs::{remove_file, set_permissions, DirBuilder, File, OpenOptions, Permissions},
    io::ErrorKind,
    os::unix::{
        fs::{lchown, symlink, DirBuilderExt, OpenOptionsExt, PermissionsExt},
        io::{AsRawFd, RawFd},
    },
    path::{Path, PathBuf},
};

use anyhow::anyhow;
use log::{debug, error, info};
use nix::{
    mount::{MntFlags, MsFlags},
    sched::{setns, CloneFlags},
    sys::stat::{umask, Mode},
    unistd::{chown, Gid, Uid},
};

use crate::{
    device::{device_from_path, mknod_device},
    mount::{mount, unmount},
    nsexec::{
        message::{read_frame, write_frame, ControlMessage},
        WorkType, INIT_PIPE_ENV, NSENTER_REEXEC_NAME, WORK_TYPE_ENV,
    },
    types::{AddDeviceMsg, Bind, Device, ErrMsg, Mount, Sysctl},
    MNT_NAMESPACE, USER_NAMESPACE,
};

/// Turns the process into a namespace worker when it was started under the
/// reserved name. Does not return in that case.
pub fn run_if_worker() {
    let is_worker = std::env::args_os()
        .next()
        .map(|a| a == NSENTER_REEXEC_NAME)
        .unwrap_or(false);
    if !is_worker {
        return;
    }
    let _ = env_logger::builder()
        .format_timestamp_micros()
        .filter_level(log::LevelFilter::Info)
        .try_init();
    work_in_container();
    std::process::exit(0);
}

fn work_in_container() {
    let pipe = match env_number(INIT_PIPE_ENV) {
        Ok(fd) => fd as RawFd,
        Err(e) => {
            error!("{}", e);
            return;
        }
    };

    // once the pipe is known a result record is always sent back
    let msg = match serve(pipe) {
        Ok(_) => ErrMsg::default(),
        Err(e) => ErrMsg {
            error: format!("{:#}", e),
        },
    };
    let sent = serde_json::to_vec(&msg)
        .map_err(|e| anyhow!("failed to encode result, {}", e))
        .and_then(|buf| write_frame(pipe, &buf));
    if let Err(e) = sent {
        error!("failed to send result to caller, {}", e);
    }
}

fn serve(pipe: RawFd) -> anyhow::Result<()> {
    let work_type = WorkType::try_from(env_number(WORK_TYPE_ENV)?)?;
    let ctrl = ControlMessage::read_from(pipe)?;
    join_namespaces(&ctrl.ns_paths()?)?;
    let payload = read_frame(pipe)?.ok_or_else(|| anyhow!("no {} request received", work_type))?;
    debug!("worker handling {}", work_type);
    dispatch(work_type, &payload)
}

fn env_number(name: &str) -> anyhow::Result<i32> {
    let v = std::env::var(name).unwrap_or_default();
    v.parse::<i32>()
        .map_err(|_| anyhow!("unable to convert {}={} to int", name, v))
}

fn clone_flag(kind: &str) -> anyhow::Result<CloneFlags> {
    match kind {
        "mnt" => Ok(CloneFlags::CLONE_NEWNS),
        "net" => Ok(CloneFlags::CLONE_NEWNET),
        "ipc" => Ok(CloneFlags::CLONE_NEWIPC),
        "uts" => Ok(CloneFlags::CLONE_NEWUTS),
        "pid" => Ok(CloneFlags::CLONE_NEWPID),
        "user" => Ok(CloneFlags::CLONE_NEWUSER),
        "cgroup" => Ok(CloneFlags::CLONE_NEWCGROUP),
        _ => Err(anyhow!("unknown namespace kind {}", kind)),
    }
}

/// User namespace first so the rest are joined with its credentials, mount
/// namespace last so the other paths still resolve against the host `/proc`.
fn join_order(paths: &[(String, String)]) -> Vec<(String, String)> {
    let mut ordered: Vec<(String, String)> = paths
        .iter()
        .filter(|(k, _)| k == USER_NAMESPACE)
        .cloned()
        .collect();
    ordered.extend(
        paths
            .iter()
            .filter(|(k, _)| k != USER_NAMESPACE && k != MNT_NAMESPACE)
            .cloned(),
    );
    ordered.extend(paths.iter().filter(|(k, _)| k == MNT_NAMESPACE).cloned());
    ordered
}

fn join_namespaces(paths: &[(String, String)]) -> anyhow::Result<()> {
    let mut opened: Vec<(CloneFlags, String, File)> = vec![];
    for (kind, path) in join_order(paths) {
        let flag = clone_flag(&kind)?;
        let f = File::open(&path)
            .map_err(|e| anyhow!("failed to open namespace {}, {}", path, e))?;
        opened.push((flag, path, f));
    }
    for (flag, path, f) in opened {
        setns(f.as_raw_fd(), flag)
            .map_err(|e| anyhow!("failed to join namespace {}, {}", path, e))?;
    }
    Ok(())
}

pub fn dispatch(work_type: WorkType, payload: &[u8]) -> anyhow::Result<()> {
    match work_type {
        WorkType::AddDevice => do_add_device(decode(payload)?),
        WorkType::RemoveDevice => do_remove_device(decode(payload)?),
        WorkType::AddBind => do_add_bind(decode(payload)?),
        WorkType::RemoveBind => do_remove_bind(decode(payload)?),
        WorkType::AddTransferBase => do_add_transfer_base(decode(payload)?),
        WorkType::UpdateSysctl => do_update_sysctl(decode(payload)?),
        WorkType::Mount => do_mount(decode(payload)?),
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: &[u8]) -> anyhow::Result<T> {
    serde_json::from_slice(payload).map_err(|e| anyhow!("failed to decode request, {}", e))
}

/// Ancestors of `path` that do not exist yet, nearest first.
fn missing_ancestors(path: &Path) -> Vec<PathBuf> {
    let mut dirs = vec![];
    let mut dir = path.parent();
    while let Some(d) = dir {
        match std::fs::metadata(d) {
            Err(e) if e.kind() == ErrorKind::NotFound => dirs.push(d.to_path_buf()),
            _ => break,
        }
        dir = d.parent();
    }
    dirs
}

fn chown_logged<P: AsRef<Path>>(path: P, uid: i32, gid: i32) {
    let path = path.as_ref();
    if let Err(e) = chown(path, id_of(uid).map(Uid::from_raw), id_of(gid).map(Gid::from_raw)) {
        error!("failed to chown {}, {}", path.display(), e);
    }
}

// -1 leaves the owner unchanged, as chown(2) does
fn id_of(id: i32) -> Option<u32> {
    if id < 0 {
        None
    } else {
        Some(id as u32)
    }
}

fn do_add_device(msg: AddDeviceMsg) -> anyhow::Result<()> {
    let device = &msg.device;
    if let Ok(exist) = device_from_path(&device.path, "") {
        if exist.major == device.major
            && exist.minor == device.minor
            && exist.dev_type == device.dev_type
        {
            if let Err(e) = set_permissions(&device.path, Permissions::from_mode(device.file_mode)) {
                error!("failed to chmod {}, {}", device.path, e);
            }
            chown_logged(&device.path, device.uid as i32, device.gid as i32);
            return Ok(());
        }
    }

    if msg.force && Path::new(&device.path).symlink_metadata().is_ok() {
        info!("path {} in container already exists, removing it", device.path);
        if let Err(e) = remove_file(&device.path) {
            error!("failed to remove {}, {}", device.path, e);
        }
    }

    let old_mask = umask(Mode::empty());
    let res = create_device_node(device);
    umask(old_mask);
    res
}

fn create_device_node(device: &Device) -> anyhow::Result<()> {
    let path = Path::new(&device.path);
    let missing = missing_ancestors(path);
    if let Some(parent) = path.parent() {
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(parent)
            .map_err(|e| anyhow!("failed to create dir {}, {}", parent.display(), e))?;
    }
    for dir in &missing {
        chown_logged(dir, device.uid as i32, device.gid as i32);
    }
    mknod_device(&device.path, device).map_err(|e| {
        anyhow!(
            "current OS kernel do not support mknod in container user namespace for root, err: {}",
            e
        )
    })
}

fn do_remove_device(device: Device) -> anyhow::Result<()> {
    // the device may never have been created when only the config was updated
    match std::fs::metadata(&device.path) {
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        _ => {}
    }
    device_from_path(&device.path, "")?;
    remove_file(&device.path).map_err(|e| anyhow!("failed to remove {}, {}", device.path, e))
}

fn create_file(path: &str) -> anyhow::Result<()> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(0o600)
        .open(path)
        .map(|_| ())
        .map_err(|e| anyhow!("failed to create {}, {}", path, e))
}

fn mkdir_all(path: &Path, mode: u32) -> anyhow::Result<()> {
    DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .map_err(|e| anyhow!("failed to create dir {}, {}", path.display(), e))
}

fn do_add_bind(bind: Bind) -> anyhow::Result<()> {
    let dst = Path::new(&bind.container_path);
    let missing = missing_ancestors(dst);
    if bind.is_dir {
        mkdir_all(dst, 0o600)?;
    } else {
        if let Some(parent) = dst.parent() {
            mkdir_all(parent, 0o600)?;
        }
        create_file(&bind.container_path)?;
    }
    chown_logged(dst, bind.uid, bind.gid);
    for dir in &missing {
        chown_logged(dir, bind.uid, bind.gid);
    }

    mount(&bind.resolv_path, &bind.container_path, "none", &bind.mount_option)
        .map_err(|e| anyhow!("fail to mount via transfer path: {}, err: {}", bind, e))
}

fn do_remove_bind(bind: Bind) -> anyhow::Result<()> {
    unmount(&bind.container_path, MntFlags::MNT_DETACH)
}

fn do_add_transfer_base(bind: Bind) -> anyhow::Result<()> {
    mkdir_all(Path::new(&bind.container_path), 0o600)
        .map_err(|e| anyhow!("failed to create transfer dir in container, {}", e))?;
    mount(&bind.host_path, &bind.container_path, "none", "ro,bind,rslave")
        .map_err(|e| anyhow!("failed to mount transfer dir in container, {}", e))
}

pub fn sysctl_path(key: &str) -> PathBuf {
    Path::new("/proc/sys").join(key.replace('.', "/"))
}

fn do_update_sysctl(sysctl: Sysctl) -> anyhow::Result<()> {
    let path = sysctl_path(&sysctl.key);
    std::fs::write(&path, sysctl.value.as_bytes())
        .map_err(|e| anyhow!("failed to write {}, {}", path.display(), e))
}

fn do_mount(mnt: Mount) -> anyhow::Result<()> {
    let dst = Path::new(&mnt.destination);
    match mnt.mount_type.as_str() {
        "move" => {
            mkdir_all(dst, 0o600)?;
            nix::mount::mount::<str, str, str, str>(
                Some(mnt.source.as_str()),
                mnt.destination.as_str(),
                None,
                MsFlags::MS_MOVE,
                None,
            )
            .map_err(|e| {
                anyhow!(
                    "failed to move mount {} to {}, {}",
                    mnt.source,
                    mnt.destination,
                    e
                )
            })
        }
        "bind" => {
            let meta = std::fs::metadata(&mnt.source)
                .map_err(|e| anyhow!("failed to stat {} in container, {}", mnt.source, e))?;
            chown(
                mnt.source.as_str(),
                id_of(mnt.uid).map(Uid::from_raw),
                id_of(mnt.gid).map(Gid::from_raw),
            )
            .map_err(|e| anyhow!("failed to chown {}, {}", mnt.source, e))?;
            if meta.is_dir() {
                mkdir_all(dst, 0o600)?;
            } else {
                create_file(&mnt.destination)?;
            }
            mount(&mnt.source, &mnt.destination, "none", &mnt.options)
        }
        "link" => {
            match symlink(&mnt.source, dst) {
                Err(e) if e.kind() != ErrorKind::NotFound => {
                    return Err(anyhow!(
                        "failed to symlink {} to {}, {}",
                        mnt.source,
                        mnt.destination,
                        e
                    ));
                }
                _ => {}
            }
            if let Err(e) = lchown(dst, id_of(mnt.uid), id_of(mnt.gid)) {
                error!("failed to lchown {}, {}", mnt.destination, e);
            }
            if let Some(legacy) = legacy_dev_path(dst) {
                if let Err(e) = remove_file(&legacy) {
                    error!("failed to remove {}, {}", legacy.display(), e);
                }
            }
            Ok(())
        }
        _ => mount(&mnt.source, &mnt.destination, &mnt.mount_type, &mnt.options),
    }
}

/// Where prestart parked the old entry of a link placed directly in a `dev`
/// directory: the same name under the sibling `.dev`.
fn legacy_dev_path(destination: &Path) -> Option<PathBuf> {
    let parent = destination.parent()?;
    if parent.file_name()? != "dev" {
        return None;
    }
    Some(parent.with_file_name(".dev").join(destination.file_name()?))
}
