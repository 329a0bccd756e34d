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

//! Runs privileged operations inside the namespaces of a container.
//!
//! The caller never joins a namespace itself. It re-executes its own image as
//! a short lived worker, hands it one end of a socket pair as fd 3, sends the
//! namespace paths to join and the operation payload, and waits for the
//! worker to write back a result record before exiting.

use std::{
    fmt::{Display, Formatter},
    mem,
    os::{
        fd::IntoRawFd,
        unix::{
            io::{AsRawFd, FromRawFd, OwnedFd, RawFd},
            process::CommandExt,
        },
    },
    process::Command,
};

use anyhow::anyhow;
use log::debug;
use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    sys::socket::{shutdown, socketpair, AddressFamily, Shutdown, SockFlag, SockType},
    unistd::dup2,
};
use serde::Serialize;

use crate::{
    nsexec::message::{read_frame, write_frame, ControlMessage},
    types::{AddDeviceMsg, Bind, Device, ErrMsg, Mount, Sysctl},
    IPC_NAMESPACE, MNT_NAMESPACE, NET_NAMESPACE,
};

pub mod message;
pub mod worker;

pub const NSENTER_REEXEC_NAME: &str = "nsenter-init";
pub const INIT_PIPE_ENV: &str = "_SYSCONTAINER_INITPIPE";
pub const WORK_TYPE_ENV: &str = "_SYSCONTAINER_WORKTYPE";
pub const INIT_PIPE_FD: RawFd = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkType {
    AddDevice = 1,
    RemoveDevice = 2,
    AddBind = 3,
    RemoveBind = 4,
    AddTransferBase = 5,
    UpdateSysctl = 6,
    Mount = 7,
}

impl TryFrom<i32> for WorkType {
    type Error = anyhow::Error;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(WorkType::AddDevice),
            2 => Ok(WorkType::RemoveDevice),
            3 => Ok(WorkType::AddBind),
            4 => Ok(WorkType::RemoveBind),
            5 => Ok(WorkType::AddTransferBase),
            6 => Ok(WorkType::UpdateSysctl),
            7 => Ok(WorkType::Mount),
            _ => Err(anyhow!("unknown worktype=({})", value)),
        }
    }
}

impl Display for WorkType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkType::AddDevice => "add-device",
            WorkType::RemoveDevice => "remove-device",
            WorkType::AddBind => "add-bind",
            WorkType::RemoveBind => "remove-bind",
            WorkType::AddTransferBase => "add-transfer-base",
            WorkType::UpdateSysctl => "update-sysctl",
            WorkType::Mount => "mount",
        };
        write!(f, "{}", s)
    }
}

/// Operations that must run inside a container's namespaces.
pub trait NsDriver {
    fn add_device(&self, pid: i32, device: &Device, force: bool) -> anyhow::Result<()>;
    fn remove_device(&self, pid: i32, device: &Device) -> anyhow::Result<()>;
    fn add_bind(&self, pid: i32, bind: &Bind) -> anyhow::Result<()>;
    fn remove_bind(&self, pid: i32, bind: &Bind) -> anyhow::Result<()>;
    fn add_transfer_base(&self, pid: i32, bind: &Bind) -> anyhow::Result<()>;
    fn update_sysctl(&self, pid: i32, sysctl: &Sysctl) -> anyhow::Result<()>;
    fn mount(&self, pid: i32, mount: &Mount) -> anyhow::Result<()>;
}

/// Builds the command that starts a worker. The driver adds the pipe
/// descriptor and the operation selector on top of it.
pub trait WorkerLauncher {
    fn command(&self) -> Command;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SelfExecLauncher;

impl WorkerLauncher for SelfExecLauncher {
    fn command(&self) -> Command {
        let mut cmd = Command::new("/proc/self/exe");
        cmd.arg0(NSENTER_REEXEC_NAME).env_clear();
        cmd
    }
}

#[derive(Debug, Default, Clone)]
pub struct Driver<L: WorkerLauncher = SelfExecLauncher> {
    launcher: L,
}

impl Driver<SelfExecLauncher> {
    pub fn new() -> Self {
        Driver {
            launcher: SelfExecLauncher,
        }
    }
}

impl<L: WorkerLauncher> Driver<L> {
    pub fn with_launcher(launcher: L) -> Self {
        Driver { launcher }
    }

    fn exec<T: Serialize>(
        &self,
        pid: i32,
        namespaces: &[&str],
        work_type: WorkType,
        data: &T,
    ) -> anyhow::Result<()> {
        let ns_paths = build_ns_string(pid, namespaces);
        let payload = serde_json::to_vec(data)
            .map_err(|e| anyhow!("failed to encode {} request, {}", work_type, e))?;

        let (parent, child) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| anyhow!("failed to create socket pair, {}", e))?;
        // SAFETY: both fds were just created and are owned here
        let parent = unsafe { OwnedFd::from_raw_fd(parent) };
        let child = unsafe { OwnedFd::from_raw_fd(child) };

        // the command owns the child end, dropping it closes our copy
        let mut worker = {
            let mut cmd = self.launcher.command();
            cmd.env(INIT_PIPE_ENV, INIT_PIPE_FD.to_string())
                .env(WORK_TYPE_ENV, (work_type as i32).to_string());
            set_cmd_fd(&mut cmd, vec![child]);
            cmd.spawn()
                .map_err(|e| anyhow!("failed to start namespace worker, {}", e))?
        };
        debug!(
            "started worker {} for {} in {}",
            worker.id(),
            work_type,
            ns_paths
        );

        let fd = parent.as_raw_fd();
        let sent = ControlMessage::with_ns_paths(&ns_paths)
            .write_to(fd)
            .and_then(|_| write_frame(fd, &payload))
            .and_then(|_| {
                shutdown(fd, Shutdown::Write)
                    .map_err(|e| anyhow!("failed to shutdown request pipe, {}", e))
            });

        let status = worker
            .wait()
            .map_err(|e| anyhow!("failed to wait namespace worker, {}", e))?;

        let record = match read_frame(fd) {
            Ok(Some(r)) => r,
            other => {
                if let Err(e) = sent {
                    return Err(anyhow!(
                        "failed to send {} request to namespace worker, {}",
                        work_type,
                        e
                    ));
                }
                let reason = match other {
                    Err(e) => e.to_string(),
                    _ => format!("no result record, worker exited with {}", status),
                };
                return Err(anyhow!("failed to decode worker result, {}", reason));
            }
        };
        let msg: ErrMsg = serde_json::from_slice(&record)
            .map_err(|e| anyhow!("failed to decode worker result, {}", e))?;
        if !msg.error.is_empty() {
            return Err(anyhow!("{}", msg.error));
        }
        Ok(())
    }
}

impl<L: WorkerLauncher> NsDriver for Driver<L> {
    fn add_device(&self, pid: i32, device: &Device, force: bool) -> anyhow::Result<()> {
        let msg = AddDeviceMsg {
            force,
            device: device.clone(),
        };
        self.exec(pid, &[MNT_NAMESPACE], WorkType::AddDevice, &msg)
    }

    fn remove_device(&self, pid: i32, device: &Device) -> anyhow::Result<()> {
        self.exec(pid, &[MNT_NAMESPACE], WorkType::RemoveDevice, device)
    }

    fn add_bind(&self, pid: i32, bind: &Bind) -> anyhow::Result<()> {
        self.exec(pid, &[MNT_NAMESPACE], WorkType::AddBind, bind)
    }

    fn remove_bind(&self, pid: i32, bind: &Bind) -> anyhow::Result<()> {
        self.exec(pid, &[MNT_NAMESPACE], WorkType::RemoveBind, bind)
    }

    fn add_transfer_base(&self, pid: i32, bind: &Bind) -> anyhow::Result<()> {
        self.exec(pid, &[MNT_NAMESPACE], WorkType::AddTransferBase, bind)
    }

    fn update_sysctl(&self, pid: i32, sysctl: &Sysctl) -> anyhow::Result<()> {
        self.exec(
            pid,
            &[IPC_NAMESPACE, NET_NAMESPACE, MNT_NAMESPACE],
            WorkType::UpdateSysctl,
            sysctl,
        )
    }

    fn mount(&self, pid: i32, mount: &Mount) -> anyhow::Result<()> {
        self.exec(pid, &[MNT_NAMESPACE], WorkType::Mount, mount)
    }
}

pub fn build_ns_string(pid: i32, namespaces: &[&str]) -> String {
    namespaces
        .iter()
        .map(|ns| format!("{}:/proc/{}/ns/{}", ns, pid, ns))
        .collect::<Vec<String>>()
        .join(",")
}

fn set_cmd_fd(cmd: &mut Command, mut fds: Vec<OwnedFd>) {
    unsafe {
        cmd.pre_exec(move || {
            for (i, fd) in mem::take(&mut fds).into_iter().enumerate() {
                let new_fd = INIT_PIPE_FD + i as RawFd;
                let old_fd = fd.into_raw_fd();
                if old_fd == new_fd {
                    // already in place, only drop CLOEXEC so it survives execve
                    let flags = fcntl(old_fd, FcntlArg::F_GETFD)?;
                    let flags = FdFlag::from_bits_truncate(flags) & !FdFlag::FD_CLOEXEC;
                    fcntl(old_fd, FcntlArg::F_SETFD(flags))?;
                } else {
                    // the duplicate never carries CLOEXEC, the original is closed by execve
                    dup2(old_fd, new_fd)?;
                }
            }
            Ok(())
        })
    };
}
