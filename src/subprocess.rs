// Copyright 2026 Alexander Orlov <alexander.orlov@loxal.net>

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::process::{Child, Command, ExitStatus, Stdio};

/// How one side of the child's stdio is wired up.
pub enum ChildIo {
    /// Create a pipe and let `communicate` pump it.
    Pipe,
    /// Donate an existing descriptor to the child.
    Fd(File),
}

/// A spawned child process with poll-multiplexed pipe I/O.
///
/// The pump is readiness-based on both pipes at once: writing everything to
/// the child's stdin before reading its stdout deadlocks as soon as either
/// payload exceeds the kernel pipe buffer.
pub struct Subprocess {
    child: Child,
}

impl Subprocess {
    pub fn spawn(argv: &[String], stdin: ChildIo, stdout: ChildIo) -> io::Result<Self> {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.stdin(match stdin {
            ChildIo::Pipe => Stdio::piped(),
            ChildIo::Fd(f) => Stdio::from(f),
        });
        cmd.stdout(match stdout {
            ChildIo::Pipe => Stdio::piped(),
            ChildIo::Fd(f) => Stdio::from(f),
        });

        let child = cmd.spawn()?;
        if let Some(stdin) = &child.stdin {
            set_nonblocking(stdin.as_raw_fd())?;
        }
        if let Some(stdout) = &child.stdout {
            set_nonblocking(stdout.as_raw_fd())?;
        }
        Ok(Self { child })
    }

    /// Pump up to `out.len()` bytes from the child's stdout and up to
    /// `input.len()` bytes into its stdin, whichever pipes exist. Returns
    /// `(bytes_read, bytes_written)` once both directions have gone as far
    /// as they can: all input written (the stdin pipe is then closed so the
    /// child sees EOF), the output buffer full, or a pipe closed by the
    /// child (EOF on its stdout, EPIPE on its stdin).
    pub fn communicate(&mut self, out: &mut [u8], input: &[u8]) -> io::Result<(usize, usize)> {
        let mut read_total = 0usize;
        let mut written_total = 0usize;

        loop {
            if written_total == input.len() {
                // EOF for the child; also where a fully-written round ends.
                self.child.stdin.take();
            }
            let want_write = self.child.stdin.is_some();
            let want_read = self.child.stdout.is_some() && read_total < out.len();

            if !want_read {
                if !want_write {
                    break;
                }
                if self.child.stdout.is_some() {
                    // Output buffer is full while input remains. Stopping
                    // the read side here would wedge the child, so hand the
                    // partial transfer back to the caller.
                    break;
                }
            }

            let mut fds = [libc::pollfd { fd: -1, events: 0, revents: 0 }; 2];
            let mut nfds = 0usize;
            let mut stdin_slot = None;
            let mut stdout_slot = None;
            if want_write {
                fds[nfds] = libc::pollfd {
                    fd: self.child.stdin.as_ref().unwrap().as_raw_fd(),
                    events: libc::POLLOUT,
                    revents: 0,
                };
                stdin_slot = Some(nfds);
                nfds += 1;
            }
            if want_read {
                fds[nfds] = libc::pollfd {
                    fd: self.child.stdout.as_ref().unwrap().as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                };
                stdout_slot = Some(nfds);
                nfds += 1;
            }

            let rc = unsafe { libc::poll(fds.as_mut_ptr(), nfds as libc::nfds_t, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            if let Some(slot) = stdout_slot {
                if fds[slot].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                    let stdout = self.child.stdout.as_mut().unwrap();
                    match stdout.read(&mut out[read_total..]) {
                        Ok(0) => {
                            self.child.stdout.take();
                            return Ok((read_total, written_total));
                        }
                        Ok(n) => read_total += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            if let Some(slot) = stdin_slot {
                if fds[slot].revents & (libc::POLLOUT | libc::POLLHUP | libc::POLLERR) != 0 {
                    let stdin = self.child.stdin.as_mut().unwrap();
                    match stdin.write(&input[written_total..]) {
                        Ok(n) => written_total += n,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                            self.child.stdin.take();
                            return Ok((read_total, written_total));
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        Ok((read_total, written_total))
    }

    /// Close any remaining pipes and reap the child.
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.stdin.take();
        self.child.stdout.take();
        self.child.wait()
    }
}

fn set_nonblocking(fd: libc::c_int) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
