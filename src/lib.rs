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

pub mod args;
pub mod bind;
pub mod cgroup;
pub mod config;
pub mod container;
pub mod device;
pub mod hooks;
pub mod mount;
pub mod network;
pub mod nsexec;
pub mod ops;
pub mod settings;
pub mod transfer;
pub mod types;
pub mod udevd;
pub mod utils;

pub const MNT_NAMESPACE: &str = "mnt";
pub const NET_NAMESPACE: &str = "net";
pub const IPC_NAMESPACE: &str = "ipc";
pub const USER_NAMESPACE: &str = "user";
