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
    fmt::{Display, Formatter},
    fs::{File, OpenOptions},
    os::unix::{
        fs::OpenOptionsExt,
        io::{AsRawFd, RawFd},
    },
    path::Path,
    process::Command,
};

use anyhow::anyhow;
use log::LevelFilter;
use nix::{
    errno::Errno,
    fcntl::{flock, FlockArg},
    sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
    unistd::{read, write},
};
use serde::Serialize;
use sha2::{Digest, Sha256};

pub fn read_count(fd: RawFd, count: usize) -> Result<Vec<u8>, anyhow::Error> {
    let mut buf = vec![0u8; count];
    let mut idx = 0;
    loop {
        if idx == count {
            return Ok(buf);
        }
        let l = match read(fd, &mut buf[idx..]) {
            Ok(l) => l,
            Err(e) => {
                if e == Errno::EINTR {
                    continue;
                } else {
                    return Err(anyhow!("failed to read from pipe {}", e));
                }
            }
        };
        if l == 0 {
            buf.truncate(idx);
            return Ok(buf);
        }
        idx += l;
    }
}

pub fn write_all(fd: RawFd, buf: &[u8]) -> Result<(), anyhow::Error> {
    let mut idx = 0;
    let count = buf.len();
    loop {
        if idx == count {
            return Ok(());
        }
        let l = match write(fd, &buf[idx..]) {
            Ok(l) => l,
            Err(e) => {
                if e == Errno::EINTR {
                    continue;
                } else {
                    return Err(anyhow!("failed to write to pipe {}", e));
                }
            }
        };
        idx += l;
    }
}

/// Errors collected from a batch where every item is attempted.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<anyhow::Error>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, e: anyhow::Error) {
        self.errors.push(e);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn into_result(self) -> anyhow::Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(anyhow::Error::new(self))
    }
}

impl std::error::Error for MultiError {}

impl Display for MultiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let msgs: Vec<String> = self.errors.iter().map(|e| format!("{:#}", e)).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

/// Exclusive advisory lock on a file, held until dropped. A process that dies
/// while holding it releases it with its descriptors.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Blocks until the lock is granted.
    pub fn lock<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .write(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| anyhow!("failed to open lock file {}, {}", path.display(), e))?;
        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusive) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(anyhow!("failed to lock {}, {}", path.display(), e));
                }
            }
        }
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}

pub fn execute(mut cmd: Command) -> anyhow::Result<String> {
    let output = cmd
        .output()
        .map_err(|e| anyhow!("failed to execute {:?}, {}", cmd, e))?;
    if !output.status.success() {
        return Err(anyhow!(
            "failed to execute command, command return {:?}, stdout: {}, stderr: {}",
            output.status.code(),
            String::from_utf8_lossy(output.stdout.as_slice()),
            String::from_utf8_lossy(output.stderr.as_slice())
        ));
    }
    String::from_utf8(output.stdout).map_err(|e| anyhow!("failed to execute command: {}", e))
}

/// Mutating commands must never be cut in half by a terminal signal.
pub fn ignore_signals() -> anyhow::Result<()> {
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    for sig in [
        Signal::SIGINT,
        Signal::SIGHUP,
        Signal::SIGQUIT,
        Signal::SIGTERM,
    ] {
        unsafe { sigaction(sig, &ignore) }
            .map_err(|e| anyhow!("failed to ignore signal {}, {}", sig, e))?;
    }
    Ok(())
}

pub fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}

/// Json for list commands, pretty form indents with tabs.
pub fn format_json<T: Serialize + ?Sized>(value: &T, pretty: bool) -> anyhow::Result<String> {
    if !pretty {
        return serde_json::to_string(value).map_err(|e| anyhow!("failed to marshal, {}", e));
    }
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value
        .serialize(&mut ser)
        .map_err(|e| anyhow!("failed to marshal, {}", e))?;
    String::from_utf8(buf).map_err(|e| anyhow!("failed to marshal, {}", e))
}

pub fn init_logger(level: &str, log_file: Option<&str>) -> anyhow::Result<()> {
    let filter = level
        .parse::<LevelFilter>()
        .map_err(|e| anyhow!("failed to parse log level {}, {}", level, e))?;
    let mut builder = env_logger::builder();
    builder.format_timestamp_micros().filter_level(filter);
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(Path::new(path))
            .map_err(|e| anyhow!("failed to open log file {}, {}", path, e))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder
        .try_init()
        .map_err(|e| anyhow!("failed to init logger, {}", e))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::anyhow;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::unistd::close;

    use temp_dir::TempDir;

    use super::{format_json, read_count, sha256_hex, write_all, FileLock, MultiError};

    #[test]
    fn test_file_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.child(".device_hook.lock");
        let held = FileLock::lock(&path).unwrap();
        // flock locks belong to the open file description, a second open waits
        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = std::thread::spawn(move || {
            let _lock = FileLock::lock(&path).unwrap();
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(held);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_format_json() {
        let v = vec!["/a:/b:rw".to_string()];
        assert_eq!(format_json(&v, false).unwrap(), r#"["/a:/b:rw"]"#);
        assert_eq!(format_json(&v, true).unwrap(), "[\n\t\"/a:/b:rw\"\n]");
    }

    #[test]
    fn test_multi_error_join() {
        let mut errs = MultiError::new();
        assert!(errs.is_empty());
        assert!(MultiError::new().into_result().is_ok());
        errs.push(anyhow!("device /dev/sdb failed"));
        errs.push(anyhow!("device /dev/sdc failed"));
        assert_eq!(errs.len(), 2);
        let e = errs.into_result().unwrap_err();
        assert_eq!(
            e.to_string(),
            "device /dev/sdb failed; device /dev/sdc failed"
        );
        assert_eq!(e.downcast_ref::<MultiError>().unwrap().len(), 2);
    }

    #[test]
    fn test_read_count_stops_at_eof() {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        write_all(a, b"hello").unwrap();
        close(a).unwrap();
        let buf = read_count(b, 16).unwrap();
        assert_eq!(buf, b"hello");
        close(b).unwrap();
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
