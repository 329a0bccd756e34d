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

use std::{path::Path, process::Command};

use anyhow::anyhow;
use log::{debug, info};

use super::HookContext;
use crate::utils::execute;

const SELINUX_ENFORCE: &str = "/sys/fs/selinux/enforce";
const AUTORELABEL_MARKERS: [&str; 2] = [".autorelabel", ".container_autorelabel"];

fn selinux_enabled() -> bool {
    Path::new(SELINUX_ENFORCE).exists()
}

/// Restores the file contexts of the container rootfs.
pub fn prestart_relabel(ctx: &mut HookContext) -> anyhow::Result<()> {
    if !selinux_enabled() {
        info!("host SELinux disabled, skip relabel");
        return Ok(());
    }
    let mut cmd = Command::new("restorecon");
    cmd.args(["-R", ctx.state.root.as_str()]);
    execute(cmd).map_err(|e| anyhow!("failed to relabel {}, {}", ctx.state.root, e))?;
    info!("relabel {} done", ctx.state.root);
    Ok(())
}

/// Drops the relabel requests left in the rootfs so the next start does not
/// relabel again.
pub fn poststop_relabel(ctx: &mut HookContext) -> anyhow::Result<()> {
    remove_markers(&ctx.state.root)
}

fn remove_markers(root: &str) -> anyhow::Result<()> {
    for marker in AUTORELABEL_MARKERS {
        let path = Path::new(root).join(marker);
        match std::fs::remove_file(&path) {
            Ok(_) => debug!("removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(anyhow!("failed to remove {}, {}", path.display(), e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use temp_dir::TempDir;

    use super::remove_markers;

    #[test]
    fn test_remove_markers() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.child(".autorelabel"), "").unwrap();
        std::fs::write(dir.child("keep"), "").unwrap();
        remove_markers(&dir.path().to_string_lossy()).unwrap();
        assert!(!dir.child(".autorelabel").exists());
        assert!(dir.child("keep").exists());
    }
}
