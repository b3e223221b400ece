use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    pin::Pin,
    task::{ready, Context, Poll},
};

use portable_pty::{native_pty_system, Child, CommandBuilder, ExitStatus, MasterPty, PtySize};
use thiserror::Error;
use tokio::io::{unix::AsyncFd, AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub(crate) enum LaunchError {
    #[error("shell command template is empty or has invalid quoting")]
    InvalidTemplate,

    #[error("failed to open pty: {0}")]
    OpenPty(String),

    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("pty master exposes no file descriptor")]
    NoMasterFd,

    #[error("failed to prepare pty for async io: {0}")]
    AsyncIo(#[source] io::Error),
}

/// Program plus arguments, parsed from a shell-words template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ShellCommand {
    program: String,
    args: Vec<String>,
}

impl ShellCommand {
    pub(crate) fn parse(template: &str) -> Result<Self, LaunchError> {
        let mut tokens = shlex::split(template.trim()).ok_or(LaunchError::InvalidTemplate)?;
        if tokens.is_empty() {
            return Err(LaunchError::InvalidTemplate);
        }

        let program = tokens.remove(0);
        Ok(Self {
            program,
            args: tokens,
        })
    }

    pub(crate) fn program(&self) -> &str {
        &self.program
    }

    pub(crate) fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Starts one shell per connection on a fresh pseudo-terminal.
#[derive(Debug, Clone)]
pub(crate) struct ShellLauncher {
    command: ShellCommand,
    token_env: String,
    term: String,
    cols: u16,
    rows: u16,
}

impl ShellLauncher {
    pub(crate) fn new(command: ShellCommand, token_env: String, cols: u16, rows: u16) -> Self {
        Self {
            command,
            token_env,
            term: "xterm-256color".to_string(),
            cols,
            rows,
        }
    }

    /// Spawns the command with `access_token` exported only to the child.
    pub(crate) fn launch(&self, access_token: &str) -> Result<ShellProcess, LaunchError> {
        let mut cmd = CommandBuilder::new(&self.command.program);
        for arg in &self.command.args {
            cmd.arg(arg);
        }
        cmd.env("TERM", &self.term);
        cmd.env(&self.token_env, access_token);

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: self.rows,
                cols: self.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|error| LaunchError::OpenPty(error.to_string()))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|error| LaunchError::Spawn {
                program: self.command.program.clone(),
                message: error.to_string(),
            })?;
        // The child holds its own slave handle; ours must go so EOF reaches the master.
        drop(pair.slave);

        let mut process = ShellProcess {
            child: Some(child),
            master: pair.master,
            stream: None,
        };

        let raw = process.master.as_raw_fd().ok_or(LaunchError::NoMasterFd)?;
        let stream = PtyStream::from_master_fd(raw).map_err(LaunchError::AsyncIo)?;
        process.stream = Some(stream);

        debug!(
            command = %self.command.display(),
            pid = ?process.pid(),
            "shell spawned"
        );
        Ok(process)
    }
}

/// A spawned shell and its PTY. Dropping it kills the child.
pub(crate) struct ShellProcess {
    child: Option<Box<dyn Child + Send + Sync>>,
    master: Box<dyn MasterPty + Send>,
    stream: Option<PtyStream>,
}

impl ShellProcess {
    pub(crate) fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|child| child.process_id())
    }

    /// Hands out the duplex PTY stream. Only the first call returns it.
    pub(crate) fn take_stream(&mut self) -> Option<PtyStream> {
        self.stream.take()
    }

    /// Kills the child if it is still running and reaps it.
    pub(crate) async fn terminate(mut self) -> Option<ExitStatus> {
        let mut child = self.child.take()?;
        let joined = tokio::task::spawn_blocking(move || {
            if let Ok(Some(status)) = child.try_wait() {
                return Some(status);
            }
            if let Err(error) = child.kill() {
                debug!(%error, "shell already gone");
            }
            child.wait().ok()
        })
        .await;

        match joined {
            Ok(status) => status,
            Err(error) => {
                warn!(%error, "failed to reap shell");
                None
            }
        }
    }
}

/// Fallback for paths that never reached `terminate`. SIGKILL makes the
/// blocking wait short, and it keeps the child from lingering as a zombie.
impl Drop for ShellProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            if let Err(error) = child.kill() {
                debug!(%error, "shell already gone");
            }
            if let Err(error) = child.wait() {
                warn!(%error, "failed to reap shell on drop");
            }
        }
    }
}

/// Non-blocking handle on a duplicate of the PTY master descriptor.
pub(crate) struct PtyStream {
    fd: AsyncFd<OwnedFd>,
}

impl PtyStream {
    fn from_master_fd(raw: RawFd) -> io::Result<Self> {
        // SAFETY: `raw` belongs to a live MasterPty. F_DUPFD_CLOEXEC hands back
        // a new descriptor that only this stream owns.
        let dup = unsafe { libc::fcntl(raw, libc::F_DUPFD_CLOEXEC, 0) };
        if dup < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `dup` was just returned by fcntl and is not owned elsewhere.
        let owned = unsafe { OwnedFd::from_raw_fd(dup) };

        // SAFETY: plain flag manipulation on a descriptor we own.
        let flags = unsafe { libc::fcntl(dup, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above.
        if unsafe { libc::fcntl(dup, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd: AsyncFd::new(owned)?,
        })
    }
}

fn read_fd(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: `buf` is valid for `buf.len()` writable bytes.
    let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
    if n >= 0 {
        return Ok(n as usize);
    }

    let error = io::Error::last_os_error();
    // Linux reports a hung-up slave as EIO rather than EOF.
    if error.raw_os_error() == Some(libc::EIO) {
        return Ok(0);
    }
    Err(error)
}

fn write_fd(fd: &OwnedFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: `buf` is valid for `buf.len()` readable bytes.
    let n = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

impl AsyncRead for PtyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| read_fd(inner.get_ref(), unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(error)) => return Poll::Ready(Err(error)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for PtyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| write_fd(inner.get_ref(), buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
