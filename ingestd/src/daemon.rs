//! Minimal Unix daemonization (spec.md §6 `--daemon`).

use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::path::Path;

/// Forks, detaches from the controlling terminal, and redirects standard
/// streams: stdout to `log_file`, stdin and stderr to `/dev/null`. The
/// parent process exits immediately on a successful fork.
pub fn daemonize(log_file: &Path) -> Result<(), String> {
    unsafe {
        match libc::fork() {
            -1 => return Err("fork failed".to_string()),
            0 => {}
            _ => std::process::exit(0),
        }

        if libc::setsid() == -1 {
            return Err("setsid failed".to_string());
        }

        redirect_stdio(log_file)?;
    }

    Ok(())
}

unsafe fn redirect_stdio(log_file: &Path) -> Result<(), String> {
    let devnull = CString::new("/dev/null").expect("no interior nul");
    let devnull_fd = libc::open(devnull.as_ptr(), libc::O_RDWR);
    if devnull_fd == -1 {
        return Err("cannot open /dev/null".to_string());
    }
    if libc::dup2(devnull_fd, libc::STDIN_FILENO) == -1 {
        return Err("cannot redirect stdin".to_string());
    }
    if libc::dup2(devnull_fd, libc::STDERR_FILENO) == -1 {
        return Err("cannot redirect stderr".to_string());
    }
    libc::close(devnull_fd);

    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(|e| format!("cannot open {}: {e}", log_file.display()))?;
    if libc::dup2(log.as_raw_fd(), libc::STDOUT_FILENO) == -1 {
        return Err("cannot redirect stdout".to_string());
    }
    // `log`'s fd has been duplicated onto stdout; let the original drop.

    Ok(())
}
