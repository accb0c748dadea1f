//! Network namespace handles and the container runtime collaborator.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::process::Command;
use std::sync::Arc;

use log::{error, info};
use wormhole_common::ErrorKind;

const NETNS_RUN_DIR: &str = "/var/run/netns";

#[derive(Debug)]
struct NsInner {
    path: String,
    file: Option<File>,
}

/// An opaque, cloneable reference to a network namespace.
///
/// The default handle refers to the caller's own namespace. A resolved handle
/// holds the namespace file open so the namespace outlives its creator, the
/// way a held netns fd does. Handles compare by the path they were resolved
/// from.
#[derive(Debug, Clone, Default)]
pub struct NsHandle {
    inner: Option<Arc<NsInner>>,
}

impl NsHandle {
    pub fn none() -> NsHandle {
        NsHandle::default()
    }

    /// Open a namespace by filesystem path (`/var/run/netns/NAME` or
    /// `/proc/PID/ns/net`).
    pub fn from_path(path: &str) -> Result<NsHandle, ErrorKind> {
        let file = File::open(path)
            .map_err(|e| ErrorKind::NamespaceNotFound(format!("{}: {}", path, e)))?;
        Ok(NsHandle {
            inner: Some(Arc::new(NsInner {
                path: path.to_string(),
                file: Some(file),
            })),
        })
    }

    /// A handle that carries only an identity, without an open namespace.
    /// Used by kernels and runtimes that do not touch the real host.
    pub fn labeled(path: &str) -> NsHandle {
        NsHandle {
            inner: Some(Arc::new(NsInner {
                path: path.to_string(),
                file: None,
            })),
        }
    }

    pub fn is_set(&self) -> bool {
        self.inner.is_some()
    }

    pub fn path(&self) -> Option<&str> {
        self.inner.as_deref().map(|i| i.path.as_str())
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.inner
            .as_deref()
            .and_then(|i| i.file.as_ref())
            .map(|f| f.as_raw_fd())
    }
}

impl PartialEq for NsHandle {
    fn eq(&self, other: &NsHandle) -> bool {
        self.path() == other.path()
    }
}

impl Eq for NsHandle {}

/// Run `f` with the calling OS thread switched into `ns`, restoring the
/// original namespace afterwards. Callers must invoke this from a thread they
/// own for the duration (e.g. inside `spawn_blocking`); a handle without an
/// open fd runs `f` in place.
pub fn with_netns<T>(ns: &NsHandle, f: impl FnOnce() -> io::Result<T>) -> io::Result<T> {
    let Some(fd) = ns.raw_fd() else {
        return f();
    };
    let original = File::open("/proc/self/ns/net")?;
    setns(fd)?;
    let result = f();
    setns(original.as_raw_fd())?;
    result
}

fn setns(fd: RawFd) -> io::Result<()> {
    let ret = unsafe { libc::setns(fd, libc::CLONE_NEWNET) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Container runtime collaborator: namespace resolution and container
/// lifecycle, as needed by the docker-ns and docker-run segment commands.
pub trait ContainerRuntime: Send + Sync {
    /// Resolve a named network namespace (`ip netns` style).
    fn namespace_by_name(&self, name: &str) -> Result<NsHandle, ErrorKind>;

    /// Resolve the network namespace of a running container.
    fn namespace_by_container(&self, id: &str) -> Result<NsHandle, ErrorKind>;

    /// `docker run -d ARGS...`; returns the new container id.
    fn run_container(&self, args: &str) -> Result<String, ErrorKind>;

    /// Force-remove containers created by a segment. Failures are logged,
    /// not raised; this runs on cleanup paths.
    fn remove_containers(&self, ids: &[String]);
}

/// Shells out to `docker`, the same way every other control surface of the
/// daemon drives its external tool.
#[derive(Debug, Default)]
pub struct DockerRuntime;

impl DockerRuntime {
    fn docker(&self, args: &[&str]) -> Result<String, ErrorKind> {
        let output = Command::new("docker")
            .args(args)
            .output()
            .map_err(|e| ErrorKind::ContainerFailed(format!("failed to execute docker: {}", e)))?;
        if !output.status.success() {
            return Err(ErrorKind::ContainerFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl ContainerRuntime for DockerRuntime {
    fn namespace_by_name(&self, name: &str) -> Result<NsHandle, ErrorKind> {
        NsHandle::from_path(&format!("{}/{}", NETNS_RUN_DIR, name))
    }

    fn namespace_by_container(&self, id: &str) -> Result<NsHandle, ErrorKind> {
        let pid = self.docker(&["inspect", "-f", "{{.State.Pid}}", id])?;
        let pid: u32 = pid
            .parse()
            .map_err(|_| ErrorKind::NamespaceNotFound(format!("container {}: pid {}", id, pid)))?;
        NsHandle::from_path(&format!("/proc/{}/ns/net", pid))
    }

    fn run_container(&self, args: &str) -> Result<String, ErrorKind> {
        let mut argv = vec!["run", "-d"];
        argv.extend(args.split_whitespace());
        let id = self.docker(&argv)?;
        info!("Started container {}", id);
        Ok(id)
    }

    fn remove_containers(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let mut argv = vec!["rm", "-f"];
        argv.extend(ids.iter().map(String::as_str));
        if let Err(e) = self.docker(&argv) {
            error!("Error deleting docker containers {:?}: {}", ids, e);
        }
    }
}
