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

use clap::Parser;
use log::error;
use syscontainer_tools::{
    args::HookArgs,
    hooks,
    nsexec::worker::run_if_worker,
    settings::Settings,
    utils::{ignore_signals, init_logger},
};

fn main() {
    run_if_worker();
    let args = HookArgs::parse();
    if let Err(e) = run(args) {
        error!("{:#}", e);
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(args: HookArgs) -> anyhow::Result<()> {
    ignore_signals()?;
    let settings = Settings::load(Settings::config_path(args.config.as_deref()))?;
    init_logger(&settings.log_level, args.log.as_deref())?;
    let with_relabel = args.with_relabel || settings.relabel;
    hooks::run(args.state, std::io::stdin().lock(), &settings, with_relabel)
}
