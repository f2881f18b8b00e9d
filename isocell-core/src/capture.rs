//! Output Capture
//!
//! Redirects the process-level stdout/stderr descriptors into per-item files
//! so output written by native code, child processes and `print!` alike lands
//! in the capture of the test that produced it. The files live on disk, which
//! lets the supervisor recover the partial output of a test whose worker died
//! mid-test.

use isocell_ipc::MAX_FRAME_SIZE;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Largest share of one stream sent back in a result; both streams together
/// stay well under the frame limit.
pub const MAX_CAPTURE_BYTES: usize = MAX_FRAME_SIZE / 4;

/// Capture file locations for one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturePaths {
    /// Captured standard output
    pub stdout: PathBuf,
    /// Captured standard error
    pub stderr: PathBuf,
}

impl CapturePaths {
    /// Read whatever the files hold right now; missing files read as empty
    pub fn read(&self) -> CapturedOutput {
        CapturedOutput {
            stdout: read_lossy(&self.stdout),
            stderr: read_lossy(&self.stderr),
        }
    }

    /// Whether any capture file exists for this item
    pub fn exists(&self) -> bool {
        self.stdout.exists() || self.stderr.exists()
    }
}

/// Capture paths of the item at `position` inside `dir`
pub fn capture_paths(dir: &Path, position: u32) -> CapturePaths {
    CapturePaths {
        stdout: dir.join(format!("{position}.stdout")),
        stderr: dir.join(format!("{position}.stderr")),
    }
}

/// Output captured for one item
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl CapturedOutput {
    /// Keep at most `limit` bytes of each stream, dropping the oldest output
    pub fn truncated(self, limit: usize) -> Self {
        Self {
            stdout: keep_tail(self.stdout, limit),
            stderr: keep_tail(self.stderr, limit),
        }
    }
}

fn keep_tail(text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut cut = text.len() - limit;
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    format!("[... {cut} bytes truncated]\n{}", &text[cut..])
}

fn read_lossy(path: &Path) -> String {
    std::fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn flush_std() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}

/// Active redirection of fds 1 and 2; restored on `finish` or drop
pub struct CaptureGuard {
    paths: CapturePaths,
    #[cfg(unix)]
    saved: Option<(i32, i32)>,
}

#[cfg(unix)]
impl CaptureGuard {
    /// Truncate the item's capture files and redirect stdout/stderr into them
    pub fn begin(paths: &CapturePaths) -> io::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let out = std::fs::File::create(&paths.stdout)?;
        let err = std::fs::File::create(&paths.stderr)?;

        flush_std();

        let saved_out = dup(libc::STDOUT_FILENO)?;
        let saved_err = match dup(libc::STDERR_FILENO) {
            Ok(fd) => fd,
            Err(e) => {
                close(saved_out);
                return Err(e);
            }
        };

        let guard = Self {
            paths: paths.clone(),
            saved: Some((saved_out, saved_err)),
        };

        // On failure the guard's drop puts back whatever was redirected
        dup2(out.as_raw_fd(), libc::STDOUT_FILENO)?;
        dup2(err.as_raw_fd(), libc::STDERR_FILENO)?;

        Ok(guard)
    }

    fn restore(&mut self) {
        if let Some((saved_out, saved_err)) = self.saved.take() {
            flush_std();
            let _ = dup2(saved_out, libc::STDOUT_FILENO);
            let _ = dup2(saved_err, libc::STDERR_FILENO);
            close(saved_out);
            close(saved_err);
        }
    }
}

#[cfg(not(unix))]
impl CaptureGuard {
    /// Descriptor redirection is Unix-only; elsewhere nothing is captured
    pub fn begin(paths: &CapturePaths) -> io::Result<Self> {
        Ok(Self {
            paths: paths.clone(),
        })
    }

    fn restore(&mut self) {
        flush_std();
    }
}

impl CaptureGuard {
    /// Restore the original descriptors and return what was captured
    pub fn finish(mut self) -> CapturedOutput {
        self.restore();
        self.paths.read()
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

#[cfg(unix)]
fn dup(fd: i32) -> io::Result<i32> {
    let new = unsafe { libc::dup(fd) };
    if new < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(new)
    }
}

#[cfg(unix)]
fn dup2(src: i32, dst: i32) -> io::Result<()> {
    if unsafe { libc::dup2(src, dst) } < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(unix)]
fn close(fd: i32) {
    unsafe {
        libc::close(fd);
    }
}
