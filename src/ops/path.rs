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

use anyhow::anyhow;
use log::{debug, info};

use super::{finish, is_running, locked, log_rollback, Backends};
use crate::{
    config::HookConfig,
    container::Container,
    transfer::{prepare_transfer_path, remove_transfer_path},
    types::Bind,
    utils::MultiError,
};

pub fn add_path(c: &mut Container, b: &Backends, binds: Vec<Bind>) -> anyhow::Result<()> {
    locked(c, |c| {
        let mut config = HookConfig::for_container(c.path())?;
        let running = is_running(c);
        let mut errs = MultiError::new();
        for mut bind in binds {
            debug!("adding path: {:?}", bind);
            if let Err(e) = config.check_path_num() {
                errs.push(e);
                break;
            }
            let host_path_exist = match config.update_bind(&bind, true) {
                Ok(exist) => exist,
                Err(e) => {
                    errs.push(anyhow!("failed to add bind {}, {}", bind, e));
                    continue;
                }
            };
            if running {
                let res = prepare_transfer_path("/", c.id(), &mut bind, !host_path_exist)
                    .map_err(|e| anyhow!("failed to prepare transfer base, {}", e))
                    .and_then(|_| b.driver.add_bind(c.pid(), &bind));
                if let Err(e) = res {
                    errs.push(anyhow!("failed to add path {}, {}", bind.host_path, e));
                    log_rollback("bind config", config.update_bind(&bind, false).map(|_| ()));
                    if !host_path_exist {
                        remove_transfer_path(c.id(), &bind);
                    }
                    continue;
                }
            }
            info!(
                "add path ({}) to container({},{}) done",
                bind.host_path,
                c.name(),
                bind.container_path
            );
        }
        finish(&mut config, errs)
    })
}

pub fn remove_path(c: &mut Container, b: &Backends, binds: Vec<Bind>) -> anyhow::Result<()> {
    locked(c, |c| {
        let mut config = HookConfig::for_container(c.path())?;
        let running = is_running(c);
        let mut errs = MultiError::new();
        for mut bind in binds {
            let stored = match config.bind_for(&bind) {
                Ok(mp) => mp,
                Err(_) => {
                    errs.push(anyhow!(
                        "path pair({}:{}) is not added by syscontainer-tools, can not remove it, please check input parameter",
                        bind.host_path,
                        bind.container_path
                    ));
                    continue;
                }
            };
            bind.mount_option = stored.permission;
            let remove_host_path = match config.update_bind(&bind, false) {
                Ok(last) => last,
                Err(e) => {
                    errs.push(anyhow!(
                        "failed to update bind({}), {}, still try to remove it",
                        bind,
                        e
                    ));
                    false
                }
            };
            if running {
                if let Err(e) = b.driver.remove_bind(c.pid(), &bind) {
                    errs.push(anyhow!("failed to remove bind({}), {}", bind, e));
                    log_rollback("bind config", config.update_bind(&bind, true).map(|_| ()));
                    continue;
                }
                if remove_host_path {
                    remove_transfer_path(c.id(), &bind);
                }
            }
            info!(
                "remove path ({}) from container({},{}) done",
                bind.host_path,
                c.name(),
                bind.container_path
            );
        }
        finish(&mut config, errs)
    })
}

pub fn list_path(c: &mut Container) -> anyhow::Result<Vec<String>> {
    locked(c, |c| Ok(HookConfig::for_container(c.path())?.binds().to_vec()))
}
