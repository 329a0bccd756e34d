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
use log::info;

use super::{finish, is_running, locked, log_rollback, Backends};
use crate::{config::HookConfig, container::Container, types::Route, utils::MultiError};

/// Stops at the first route that can not be added, earlier ones stay.
pub fn add_routes(
    c: &mut Container,
    b: &Backends,
    routes: &[Route],
    config_only: bool,
) -> anyhow::Result<()> {
    locked(c, |c| {
        let mut config = HookConfig::for_container(c.path())?;
        let running = !config_only && is_running(c);
        let mut errs = MultiError::new();
        for route in routes {
            if let Err(e) = config.is_conflict_route(route) {
                errs.push(e);
                break;
            }
            config.update_network_route(route, true)?;
            if running {
                if let Err(e) = b.network.add_route(&c.net_ns_path(), route) {
                    log_rollback("route config", config.update_network_route(route, false));
                    errs.push(e);
                    break;
                }
            }
            info!("add route to container {}, route: {} done", c.name(), route);
        }
        finish(&mut config, errs)
    })
}

/// Every stored route matched by one of `routes` is removed.
pub fn remove_routes(
    c: &mut Container,
    b: &Backends,
    routes: &[Route],
    config_only: bool,
) -> anyhow::Result<()> {
    locked(c, |c| {
        let mut config = HookConfig::for_container(c.path())?;
        let running = !config_only && is_running(c);
        let mut errs = MultiError::new();
        for filter in routes {
            if !config.is_route_exist(filter) {
                errs.push(anyhow!(
                    "route({}) is not added by syscontainer-tools, can not remove it, please check input parameter",
                    filter
                ));
                continue;
            }
            let matched: Vec<Route> = config.routes(filter).into_iter().cloned().collect();
            for route in matched {
                if let Err(e) = config.update_network_route(&route, false) {
                    errs.push(e);
                    continue;
                }
                if running {
                    if let Err(e) = b.network.del_route(&c.net_ns_path(), &route) {
                        log_rollback("route config", config.update_network_route(&route, true));
                        errs.push(e);
                        continue;
                    }
                }
                info!("remove route from container {}, route: {} done", c.name(), route);
            }
        }
        finish(&mut config, errs)
    })
}

pub fn list_routes(c: &mut Container, filter: &Route) -> anyhow::Result<Vec<Route>> {
    locked(c, |c| {
        let config = HookConfig::for_container(c.path())?;
        Ok(config.routes(filter).into_iter().cloned().collect())
    })
}

#[cfg(test)]
mod tests {
    use temp_dir::TempDir;

    use super::{add_routes, list_routes, remove_routes};
    use crate::{
        ops::tests::{backends, running, FakeCgroup, FakeDriver, FakeNetwork},
        types::Route,
        utils::MultiError,
    };

    fn route(dest: &str, dev: &str) -> Route {
        Route {
            dest: dest.to_string(),
            gw: "10.0.0.1".to_string(),
            dev: dev.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_add_routes_stops_at_failure() {
        let dir = TempDir::new().unwrap();
        let (driver, cgroup) = (FakeDriver::default(), FakeCgroup::default());
        let mut net = FakeNetwork::default();
        net.fail.insert("192.168.0.0/16".to_string());
        net.fail_msg = "RTNETLINK answers: Network is unreachable".to_string();
        let b = backends(&driver, &cgroup, &net);
        let mut c = running(&dir);

        let routes = vec![
            route("default", "eth1"),
            route("192.168.0.0/16", "eth1"),
            route("172.16.0.0/12", "eth1"),
        ];
        assert!(add_routes(&mut c, &b, &routes, false).is_err());
        let stored = list_routes(&mut c, &Route::default()).unwrap();
        assert_eq!(stored, vec![route("default", "eth1")]);

        // a route already recorded conflicts
        assert!(add_routes(&mut c, &b, &routes[..1], true).is_err());
    }

    #[test]
    fn test_remove_routes_by_filter() {
        let dir = TempDir::new().unwrap();
        let (driver, cgroup) = (FakeDriver::default(), FakeCgroup::default());
        let mut net = FakeNetwork::default();
        net.fail.insert("10.2.0.0/16".to_string());
        let b = backends(&driver, &cgroup, &net);
        let mut c = running(&dir);
        let routes = vec![
            route("10.1.0.0/16", "eth1"),
            route("10.2.0.0/16", "eth1"),
            route("10.3.0.0/16", "eth2"),
        ];
        add_routes(&mut c, &b, &routes, true).unwrap();

        let by_dev = Route {
            dev: "eth1".to_string(),
            ..Default::default()
        };
        let unknown = Route {
            dev: "eth9".to_string(),
            ..Default::default()
        };
        let err = remove_routes(&mut c, &b, &[by_dev, unknown], false).unwrap_err();
        assert_eq!(err.downcast_ref::<MultiError>().unwrap().len(), 2);
        let left = list_routes(&mut c, &Route::default()).unwrap();
        assert_eq!(left, vec![route("10.3.0.0/16", "eth2"), route("10.2.0.0/16", "eth1")]);
    }
}
