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

//! Runtime hooks. The runtime runs them at prestart, poststart and poststop
//! with the container state on stdin; they replay what the hook config
//! records against the container process.

use std::{
    io::Read,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::anyhow;
use log::{error, info};
use oci_spec::runtime::Spec;
use serde::Deserialize;

use crate::{
    cgroup::FsCgroupWriter,
    config::HookConfig,
    container::{load_spec, Container},
    network::NetlinkBackend,
    nsexec::Driver,
    ops::{locked, Backends},
    settings::Settings,
};

pub mod poststop;
pub mod prestart;
pub mod relabel;

const BUNDLE_CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Prestart,
    Poststart,
    Poststop,
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prestart" => Ok(Phase::Prestart),
            "poststart" => Ok(Phase::Poststart),
            "poststop" => Ok(Phase::Poststop),
            _ => Err(format!("unknown hook state {}", s)),
        }
    }
}

/// Container state the runtime writes to the hook's stdin.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HookState {
    pub pid: i32,
    pub id: String,
    /// rootfs of the container, older runtimes only
    pub root: String,
    #[serde(alias = "bundlePath")]
    pub bundle: String,
}

impl HookState {
    pub fn parse<R: Read>(reader: R) -> anyhow::Result<Self> {
        let state: HookState = serde_json::from_reader(reader)
            .map_err(|e| anyhow!("failed to parse hook state, {}", e))?;
        if state.id.is_empty() {
            return Err(anyhow!("hook state has no container id"));
        }
        Ok(state)
    }

    /// Fills in the rootfs from the spec when the runtime did not pass one.
    pub fn resolve_root(&mut self, spec: &Spec) {
        if !self.root.is_empty() {
            return;
        }
        if let Some(root) = spec.root() {
            let path = root.path();
            self.root = if path.is_absolute() {
                path.to_string_lossy().to_string()
            } else {
                Path::new(&self.bundle)
                    .join(path)
                    .to_string_lossy()
                    .to_string()
            };
        }
    }
}

/// What one hook action gets to work with.
pub struct HookContext<'a> {
    pub state: &'a HookState,
    pub spec: &'a Spec,
    pub config: &'a mut HookConfig,
    pub settings: &'a Settings,
    pub backends: &'a Backends<'a>,
}

pub type HookAction = fn(&mut HookContext) -> anyhow::Result<()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPolicy {
    /// the first failure stops the phase and is returned
    AbortOnError,
    /// failures are logged, every action runs
    ContinueOnError,
}

pub fn run_actions(
    policy: RunPolicy,
    actions: &[(&str, HookAction)],
    ctx: &mut HookContext,
) -> anyhow::Result<()> {
    for (name, action) in actions {
        if let Err(e) = action(ctx) {
            error!("hook action {} failed with err: {:#}", name, e);
            if policy == RunPolicy::AbortOnError {
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Reads the state from `input`, loads the bundle spec and runs `phase`
/// with the production backends.
pub fn run<R: Read>(
    phase: Phase,
    input: R,
    settings: &Settings,
    with_relabel: bool,
) -> anyhow::Result<()> {
    let mut state = HookState::parse(input)?;
    let spec = load_spec(Path::new(&state.bundle).join(BUNDLE_CONFIG_FILE)).map_err(|e| {
        anyhow!("failed to load spec for container {}, {}", state.id, e)
    })?;
    state.resolve_root(&spec);

    let inner_path = spec
        .linux()
        .as_ref()
        .and_then(|l| l.cgroups_path().as_ref())
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();
    let driver = Driver::new();
    let cgroup = FsCgroupWriter::new(state.pid, &inner_path);
    let network = NetlinkBackend::default();
    let backends = Backends {
        driver: &driver,
        cgroup: &cgroup,
        network: &network,
    };
    run_with(phase, &state, &spec, settings, &backends, with_relabel)
}

pub fn run_with(
    phase: Phase,
    state: &HookState,
    spec: &Spec,
    settings: &Settings,
    backends: &Backends,
    with_relabel: bool,
) -> anyhow::Result<()> {
    let dir = container_dir(settings, &state.id);
    let mut config = HookConfig::for_container(&dir)
        .map_err(|e| anyhow!("failed to parse config for container {}, {}", state.id, e))?;
    if let Err(e) = std::fs::create_dir_all(&settings.tool_dir) {
        error!("failed to create {}, {}", settings.tool_dir, e);
    }

    if phase != Phase::Poststop && state.pid <= 0 {
        error!("can't get correct pid of container: {}", state.pid);
        return Ok(());
    }
    let mut ctx = HookContext {
        state,
        spec,
        config: &mut config,
        settings,
        backends,
    };
    match phase {
        Phase::Prestart => prestart::run(&mut ctx, with_relabel)?,
        Phase::Poststart => {}
        Phase::Poststop => {
            poststop::run(&mut ctx, with_relabel);
            return Ok(());
        }
    }
    update_hook_data(&dir, state, &mut config)
}

fn container_dir(settings: &Settings, id: &str) -> PathBuf {
    Path::new(&settings.container_root).join(id)
}

/// Saves device numbers that moved since the config was written.
fn update_hook_data(dir: &Path, state: &HookState, config: &mut HookConfig) -> anyhow::Result<()> {
    if !config.is_dirty() {
        return Ok(());
    }
    let mut c = Container::from_parts(&state.id, state.pid, dir, None);
    locked(&mut c, |_| config.flush())?;
    info!("hook config of container {} updated", state.id);
    Ok(())
}
