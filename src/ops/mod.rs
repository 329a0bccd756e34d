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

//! Operator commands. Each one holds the container lock for its whole run,
//! mutates the hook config in memory, applies the change to a running
//! container and undoes the config change when that fails.

use log::error;

use crate::{
    cgroup::CgroupWriter, config::HookConfig, container::Container, network::NetworkBackend,
    nsexec::NsDriver, utils::MultiError,
};

pub mod device;
pub mod nic;
pub mod path;
pub mod route;

pub use self::device::{
    add_device, collect_devices, collect_mappings, list_device, remove_device, set_devices_path,
    update_device,
};
pub use self::nic::{add_nic, default_host_nic_name, list_nic, remove_nic, update_nic};
pub use self::path::{add_path, list_path, remove_path};
pub use self::route::{add_routes, list_routes, remove_routes};

/// Privileged backends the commands drive for a running container.
pub struct Backends<'a> {
    pub driver: &'a dyn NsDriver,
    pub cgroup: &'a dyn CgroupWriter,
    pub network: &'a dyn NetworkBackend,
}

/// Runs `f` under the container lock.
pub fn locked<T>(
    c: &mut Container,
    f: impl FnOnce(&Container) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    c.lock()?;
    let res = f(&*c);
    c.unlock();
    res
}

pub(crate) fn is_running(c: &Container) -> bool {
    c.pid() > 0 && c.check_pid_exist()
}

/// Writes the config back, a failed write joins the errors of the batch.
pub(crate) fn finish(config: &mut HookConfig, mut errs: MultiError) -> anyhow::Result<()> {
    if let Err(e) = config.flush() {
        errs.push(e);
    }
    errs.into_result()
}

pub(crate) fn log_rollback(what: &str, res: anyhow::Result<()>) {
    if let Err(e) = res {
        error!("rollback {} failed, {}", what, e);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{cell::RefCell, collections::HashSet};

    use anyhow::anyhow;
    use temp_dir::TempDir;

    use super::Backends;
    use crate::{
        cgroup::CgroupWriter,
        container::Container,
        network::{LinkDriver, NetworkBackend},
        nsexec::NsDriver,
        settings::Settings,
        types::{Bind, Device, InterfaceConf, Mount, QosType, Route, Sysctl},
    };

    /// Records driver calls, fails the ones whose key is in `fail`.
    #[derive(Default)]
    pub(crate) struct FakeDriver {
        pub calls: RefCell<Vec<String>>,
        pub fail: HashSet<String>,
    }

    impl FakeDriver {
        fn record(&self, call: String, key: &str) -> anyhow::Result<()> {
            self.calls.borrow_mut().push(call);
            if self.fail.contains(key) {
                return Err(anyhow!("worker failed on {}", key));
            }
            Ok(())
        }
    }

    impl NsDriver for FakeDriver {
        fn add_device(&self, _pid: i32, device: &Device, _force: bool) -> anyhow::Result<()> {
            self.record(format!("add_device {}", device.path), &device.path)
        }

        fn remove_device(&self, _pid: i32, device: &Device) -> anyhow::Result<()> {
            self.record(format!("remove_device {}", device.path), &device.path)
        }

        fn add_bind(&self, _pid: i32, bind: &Bind) -> anyhow::Result<()> {
            self.record(format!("add_bind {}", bind.container_path), &bind.container_path)
        }

        fn remove_bind(&self, _pid: i32, bind: &Bind) -> anyhow::Result<()> {
            self.record(
                format!("remove_bind {}", bind.container_path),
                &bind.container_path,
            )
        }

        fn add_transfer_base(&self, _pid: i32, bind: &Bind) -> anyhow::Result<()> {
            self.record(
                format!("add_transfer_base {}", bind.container_path),
                &bind.container_path,
            )
        }

        fn update_sysctl(&self, _pid: i32, sysctl: &Sysctl) -> anyhow::Result<()> {
            self.record(format!("update_sysctl {}", sysctl.key), &sysctl.key)
        }

        fn mount(&self, _pid: i32, mount: &Mount) -> anyhow::Result<()> {
            self.record(format!("mount {}", mount.destination), &mount.destination)
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeCgroup {
        pub writes: RefCell<Vec<String>>,
        pub fail: HashSet<String>,
    }

    impl CgroupWriter for FakeCgroup {
        fn update_permission(&self, device: &Device, is_add: bool) -> anyhow::Result<()> {
            if self.fail.contains(&device.path) {
                return Err(anyhow!("failed to write devices cgroup for {}", device.path));
            }
            let file = if is_add { "allow" } else { "deny" };
            self.writes
                .borrow_mut()
                .push(format!("{} {}", file, device.cgroup_string()));
            Ok(())
        }

        fn update_qos(&self, kind: QosType, value: &str) -> anyhow::Result<()> {
            self.writes
                .borrow_mut()
                .push(format!("{} {}", kind.cgroup_file(), value));
            Ok(())
        }
    }

    pub(crate) struct FakeLink<'a> {
        name: String,
        net: &'a FakeNetwork,
    }

    impl<'a> LinkDriver for FakeLink<'a> {
        fn create_if(&mut self) -> anyhow::Result<()> {
            self.net.record(format!("create {}", self.name), "")
        }

        fn delete_if(&mut self) -> anyhow::Result<()> {
            self.net.record(format!("delete {}", self.name), &self.name)
        }

        fn join_and_configure(&mut self) -> anyhow::Result<()> {
            self.net.record(format!("join {}", self.name), &self.name)
        }

        fn configure(&mut self) -> anyhow::Result<()> {
            self.net.record(format!("configure {}", self.name), &self.name)
        }

        fn add_to_bridge(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Fails link operations on container nic names and routes on destinations in `fail`.
    #[derive(Default)]
    pub(crate) struct FakeNetwork {
        pub calls: RefCell<Vec<String>>,
        pub fail: HashSet<String>,
        pub fail_msg: String,
    }

    impl FakeNetwork {
        fn record(&self, call: String, key: &str) -> anyhow::Result<()> {
            self.calls.borrow_mut().push(call);
            if self.fail.contains(key) {
                return Err(anyhow!("{} {}", self.fail_msg, key));
            }
            Ok(())
        }
    }

    impl NetworkBackend for FakeNetwork {
        fn driver<'a>(
            &'a self,
            conf: &InterfaceConf,
            _ns_path: &str,
        ) -> anyhow::Result<Box<dyn LinkDriver + 'a>> {
            Ok(Box::new(FakeLink {
                name: conf.ctr_nic_name.clone(),
                net: self,
            }))
        }

        fn add_route(&self, _ns_path: &str, route: &Route) -> anyhow::Result<()> {
            self.record(format!("add_route {}", route.dest), &route.dest)
        }

        fn del_route(&self, _ns_path: &str, route: &Route) -> anyhow::Result<()> {
            self.record(format!("del_route {}", route.dest), &route.dest)
        }
    }

    pub(crate) fn backends<'a>(
        driver: &'a FakeDriver,
        cgroup: &'a FakeCgroup,
        network: &'a FakeNetwork,
    ) -> Backends<'a> {
        Backends {
            driver,
            cgroup,
            network,
        }
    }

    pub(crate) fn settings(dir: &TempDir) -> Settings {
        Settings {
            tool_dir: dir.child("run").to_string_lossy().to_string(),
            container_root: dir.path().to_string_lossy().to_string(),
            udev_rules: dir.child("99-test.rules").to_string_lossy().to_string(),
            ..Default::default()
        }
    }

    /// A container whose init is the test process itself, so it counts as running.
    pub(crate) fn running(dir: &TempDir) -> Container {
        Container::from_parts("abc", std::process::id() as i32, dir.path(), None)
    }

    pub(crate) fn stopped(dir: &TempDir) -> Container {
        Container::from_parts("abc", 0, dir.path(), None)
    }
}
