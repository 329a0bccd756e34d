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
use log::warn;

use super::netlink::{Netlink, RouteSpec};
use crate::types::Route;

pub fn add_route_to_container(ns_path: &str, route: &Route) -> anyhow::Result<()> {
    let res = RouteSpec::from_route(route)
        .and_then(|spec| Netlink::in_netns(ns_path)?.add_route(&spec));
    res.map_err(|e| anyhow!("failed to add route {}, {}", route, e))
}

/// A route the kernel no longer has counts as deleted.
pub fn del_route_from_container(ns_path: &str, route: &Route) -> anyhow::Result<()> {
    let res = RouteSpec::from_route(route)
        .and_then(|spec| Netlink::in_netns(ns_path)?.del_route(&spec));
    match res {
        Ok(true) => Ok(()),
        Ok(false) => {
            warn!("route {} already gone", route);
            Ok(())
        }
        Err(e) => Err(anyhow!("failed to delete route {}, {}", route, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::{add_route_to_container, del_route_from_container};
    use crate::types::Route;

    #[test]
    fn test_invalid_route_fails_before_netns() {
        let only_dest = Route {
            dest: "10.0.0.0/8".to_string(),
            ..Default::default()
        };
        let err = add_route_to_container("/nonexistent/netns", &only_dest).unwrap_err();
        assert!(err.to_string().contains("one of src, gw, dev"));
        let err = del_route_from_container("/nonexistent/netns", &only_dest).unwrap_err();
        assert!(err.to_string().contains("failed to delete route"));
    }

    #[test]
    fn test_missing_netns() {
        let r = Route {
            dest: "default".to_string(),
            gw: "192.168.1.1".to_string(),
            ..Default::default()
        };
        let err = add_route_to_container("/nonexistent/netns", &r).unwrap_err();
        assert!(err.to_string().contains("failed to open netns"));
    }
}
