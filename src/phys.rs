use std::cell::RefCell;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Instant;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::pty::openpty;
use nix::unistd::{close, read, ttyname, write};

use crate::link::SerialLine;
use crate::sched::TimerQueue;
use crate::Error;

const CHUNK: usize = 1500;

/// A serial line backed by a pseudo-terminal pair.
///
/// The stack owns the nonblocking master side; the peer attaches to the
/// slave device at [`path`]. The slave fd is kept open so the line does not
/// report hangup before anyone attaches.
///
/// [`path`]: PtyLine::path
pub struct PtyLine {
    master: RawFd,
    slave: RawFd,
    path: PathBuf,
    handler: RefCell<Option<Box<dyn FnMut(&[u8])>>>,
}

impl PtyLine {
    pub fn open() -> Result<Self, Error> {
        let pty = openpty(None, None)?;

        let path = ttyname(pty.slave)?;
        fcntl(pty.master, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

        Ok(PtyLine {
            master: pty.master,
            slave: pty.slave,
            path,
            handler: RefCell::new(None),
        })
    }

    /// Path of the slave device the peer should attach to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.master
    }

    /// Reads everything currently buffered on the line and feeds it to the
    /// registered receiver, one chunk at a time.
    pub fn drain(&self) -> Result<(), Error> {
        let mut buf = [0u8; CHUNK];

        loop {
            match read(self.master, &mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    if let Some(handler) = self.handler.borrow_mut().as_mut() {
                        handler(&buf[..n]);
                    }
                }
                Err(Errno::EAGAIN) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl SerialLine for PtyLine {
    fn register_receiver(&self, handler: Box<dyn FnMut(&[u8])>) {
        *self.handler.borrow_mut() = Some(handler);
    }

    fn send(&self, chunk: &[u8]) {
        let mut rest = chunk;

        while !rest.is_empty() {
            match write(self.master, rest) {
                Ok(n) => rest = &rest[n..],
                // The pty buffer is full; frames are small, so spin until
                // the reader catches up rather than dropping mid-frame.
                Err(Errno::EAGAIN) => continue,
                Err(err) => {
                    log::warn!("pty: write on {} failed: {err}", self.path.display());
                    return;
                }
            }
        }
    }
}

impl Drop for PtyLine {
    fn drop(&mut self) {
        let _ = close(self.master);
        let _ = close(self.slave);
    }
}

/// Drives the stack: sleeps until serial input or the next timer deadline,
/// drains readable lines, then fires due timers. Never returns except on a
/// device error.
pub fn serve(lines: &[Rc<PtyLine>], timers: &TimerQueue) -> Result<(), Error> {
    loop {
        let timeout = match timers.next_deadline() {
            // Round up so the deadline has passed when poll wakes us.
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                left.as_millis().min(60_000) as i32 + 1
            }
            None => -1,
        };

        let mut fds: Vec<PollFd> = lines
            .iter()
            .map(|line| PollFd::new(line.raw_fd(), PollFlags::POLLIN))
            .collect();

        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err.into()),
        }

        for (fd, line) in fds.iter().zip(lines) {
            if fd.revents().map_or(false, |r| r.intersects(PollFlags::POLLIN)) {
                line.drain()?;
            }
        }

        timers.fire_due(Instant::now());
    }
}
