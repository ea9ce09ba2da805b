//! Bus endpoints and how they map to ZeroMQ addresses.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::BusError;

/// Directory for IPC sockets created by name with [`Transport::ipc`].
pub const IPC_SOCKET_DIR: &str = "/tmp/datasource-bus";

/// Where a socket binds or connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Unix domain socket. Only reachable from the same host.
    Ipc(PathBuf),

    /// TCP; needed as soon as managers run on more than one host.
    Tcp { host: String, port: u16 },
}

impl Transport {
    /// IPC socket `name.sock` under [`IPC_SOCKET_DIR`].
    pub fn ipc(name: &str) -> Self {
        Self::Ipc(Path::new(IPC_SOCKET_DIR).join(format!("{name}.sock")))
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parse `tcp://host:port` or `ipc://<absolute path>`.
    pub fn parse(endpoint: &str) -> Result<Self, BusError> {
        let invalid = |why: &str| BusError::Config(format!("endpoint '{endpoint}': {why}"));

        match endpoint.split_once("://") {
            Some(("ipc", path)) => {
                if path.is_empty() {
                    return Err(invalid("missing socket path"));
                }
                Ok(Self::Ipc(PathBuf::from(path)))
            }
            Some(("tcp", addr)) => {
                let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
                if host.is_empty() {
                    return Err(invalid("missing host"));
                }
                let port = port.parse().map_err(|_| invalid("port is not a number"))?;
                Ok(Self::tcp(host, port))
            }
            _ => Err(invalid("expected tcp:// or ipc://")),
        }
    }

    /// The address string handed to ZeroMQ.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Ipc(path) => format!("ipc://{}", path.display()),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }

    /// Create the socket's directory. No-op for TCP.
    ///
    /// Binding an IPC socket fails if its directory does not exist.
    pub fn ensure_ipc_dir(&self) -> std::io::Result<()> {
        match self {
            Self::Ipc(path) => match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir),
                _ => Ok(()),
            },
            Self::Tcp { .. } => Ok(()),
        }
    }

    /// Delete a socket file left behind by a broker that did not exit cleanly;
    /// otherwise the next bind fails with `EADDRINUSE`. No-op for TCP.
    pub fn remove_stale_socket(&self) -> std::io::Result<()> {
        let Self::Ipc(path) = self else {
            return Ok(());
        };
        match std::fs::remove_file(path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "removed stale IPC socket");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.endpoint())
    }
}
