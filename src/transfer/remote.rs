//! Remote file store seam
//!
//! The handshake protocol only needs existence checks, uploads, and
//! deletes, so those are the whole [`RemoteStore`] surface. Production
//! speaks SFTP through libssh2; tests use an in-memory fake.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;

use log::info;

use crate::error::{SyncError, SyncResult};

/// Minimal file operations against the downstream system's drop site.
/// Implementations are blocking; the runner drives them from a blocking
/// task.
pub trait RemoteStore {
    fn exists(&self, remote_path: &str) -> anyhow::Result<bool>;
    fn upload_file(&self, local: &Path, remote_path: &str) -> anyhow::Result<()>;
    fn upload_bytes(&self, bytes: &[u8], remote_path: &str) -> anyhow::Result<()>;
    fn delete(&self, remote_path: &str) -> anyhow::Result<()>;
}

/// SFTP-backed remote store. Connecting performs the TCP dial, SSH
/// handshake, and password auth in one step; any failure there is fatal
/// for the whole handoff.
pub struct SftpStore {
    sftp: ssh2::Sftp,
    // The sftp channel borrows from the session internally; keep it alive.
    _session: ssh2::Session,
}

impl SftpStore {
    pub fn connect(host: &str, user: &str, password: &str) -> SyncResult<Self> {
        let addr = if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:22")
        };

        let connect = || -> anyhow::Result<Self> {
            let tcp = TcpStream::connect(&addr)?;
            let mut session = ssh2::Session::new()?;
            session.set_tcp_stream(tcp);
            session.handshake()?;
            session.userauth_password(user, password)?;
            let sftp = session.sftp()?;
            Ok(Self {
                sftp,
                _session: session,
            })
        };

        let store = connect().map_err(|e| SyncError::HandshakeConnect {
            host: host.to_string(),
            message: e.to_string(),
        })?;
        info!("Connected to remote file endpoint {}", host);
        Ok(store)
    }
}

impl RemoteStore for SftpStore {
    fn exists(&self, remote_path: &str) -> anyhow::Result<bool> {
        match self.sftp.stat(Path::new(remote_path)) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ssh2::ErrorCode::SFTP(2) => Ok(false), // NO_SUCH_FILE
            Err(e) => Err(e.into()),
        }
    }

    fn upload_file(&self, local: &Path, remote_path: &str) -> anyhow::Result<()> {
        let mut source = std::fs::File::open(local)?;
        let mut dest = self.sftp.create(Path::new(remote_path))?;
        let mut buf = [0u8; 32 * 1024];
        loop {
            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n])?;
        }
        Ok(())
    }

    fn upload_bytes(&self, bytes: &[u8], remote_path: &str) -> anyhow::Result<()> {
        let mut dest = self.sftp.create(Path::new(remote_path))?;
        dest.write_all(bytes)?;
        Ok(())
    }

    fn delete(&self, remote_path: &str) -> anyhow::Result<()> {
        self.sftp.unlink(Path::new(remote_path))?;
        Ok(())
    }
}
