//! Single-threaded socket reactor.
//!
//! Grounded on `sockcallback.c`: one dedicated thread multiplexes an
//! arbitrary set of file descriptors with `poll(2)`, registration from other
//! threads flows through a mutex-guarded queue, and a self-pipe wakes the
//! poll loop whenever that queue changes or shutdown begins. `libc` is the
//! one place this crate reaches below `std` — there's no portable safe
//! multi-fd readiness primitive in the standard library.
//!
//! Unlike the original, which lazily spawns its thread on the first
//! `Ns_SockCallback` call, `SocketReactor::new` spawns it immediately. The
//! lazy version exists to avoid paying for a thread nobody ends up needing;
//! here the reactor is always constructed as part of bringing the server
//! up, so eager spawn is simpler and sidesteps an unsafe-adjacent
//! double-checked-locking dance for on-demand thread creation.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::thread::JoinHandle;

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

bitflags! {
    pub struct Interest: u8 {
        const READ = 0b0001;
        const WRITE = 0b0010;
        const EXCEPTION = 0b0100;
        /// Not pollable — set this to ask for a callback when the reactor
        /// shuts down. Registrations that don't include it are dropped
        /// silently at shutdown instead of being invoked.
        const EXIT = 0b1000;
    }
}

/// Returns `false` to ask the reactor to stop watching this fd for the
/// interests that just fired.
pub type SockProc = Box<dyn FnMut(RawFd, Interest) -> bool + Send>;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("reactor is shutting down")]
    ShuttingDown,
    #[error("i/o error communicating with the reactor thread: {0}")]
    Io(#[from] std::io::Error),
}

struct Registration {
    fd: RawFd,
    interest: Interest,
    proc: Option<SockProc>,
}

enum QueueOp {
    Add(Registration),
    Cancel(RawFd),
}

struct Shared {
    queue: Vec<QueueOp>,
    shutdown_pending: bool,
    running: bool,
}

pub struct SocketReactor {
    shared: Mutex<Shared>,
    condvar: Condvar,
    trigger_write_fd: RawFd,
    join: Mutex<Option<JoinHandle<()>>>,
    trigger_read_fd: RawFd,
}

// SAFETY: raw fds are just integers; all actual use is funneled through the
// mutex-protected queue or the reactor thread itself.
unsafe impl Send for SocketReactor {}
unsafe impl Sync for SocketReactor {}

impl SocketReactor {
    pub fn new() -> std::sync::Arc<Self> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            log::error!("reactor: failed to create trigger pipe: {}", std::io::Error::last_os_error());
            std::process::abort();
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let reactor = std::sync::Arc::new(SocketReactor {
            shared: Mutex::new(Shared { queue: Vec::new(), shutdown_pending: false, running: true }),
            condvar: Condvar::new(),
            trigger_write_fd: write_fd,
            trigger_read_fd: read_fd,
            join: Mutex::new(None),
        });

        let thread_reactor = std::sync::Arc::clone(&reactor);
        let handle = std::thread::Builder::new()
            .name("sockreactor".into())
            .spawn(move || reactor_thread(thread_reactor, read_fd))
            .expect("failed to spawn reactor thread");
        *reactor.join.lock() = Some(handle);

        reactor
    }

    /// Registers `fd` for `interest`; `proc` is invoked from the reactor
    /// thread whenever one of the pollable interests (`READ` / `WRITE` /
    /// `EXCEPTION`) is ready. If `interest` also includes `EXIT`, `proc` is
    /// invoked once more at shutdown with `Interest::EXIT` — entries that
    /// didn't ask for `EXIT` are simply dropped at shutdown without a call.
    pub fn register(&self, fd: RawFd, interest: Interest, proc: SockProc) -> Result<(), ReactorError> {
        {
            let mut guard = self.shared.lock();
            if guard.shutdown_pending {
                return Err(ReactorError::ShuttingDown);
            }
            guard.queue.push(QueueOp::Add(Registration { fd, interest, proc: Some(proc) }));
        }
        self.trigger()
    }

    pub fn cancel(&self, fd: RawFd) -> Result<(), ReactorError> {
        {
            let mut guard = self.shared.lock();
            guard.queue.push(QueueOp::Cancel(fd));
        }
        self.trigger()
    }

    fn trigger(&self) -> Result<(), ReactorError> {
        let byte = [1u8];
        let n = unsafe { libc::write(self.trigger_write_fd, byte.as_ptr() as *const _, 1) };
        if n != 1 {
            log::error!("reactor: trigger pipe write failed: {}", std::io::Error::last_os_error());
            std::process::abort();
        }
        Ok(())
    }

    /// Marks shutdown pending; the reactor thread fires every registered
    /// callback's EXIT once, in whatever order the table iterates, then
    /// exits its loop.
    pub fn begin_shutdown(&self) {
        {
            let mut guard = self.shared.lock();
            guard.shutdown_pending = true;
        }
        let _ = self.trigger();
    }

    /// Blocks until the reactor thread has finished its shutdown pass, then
    /// joins it and closes the trigger pipe — mirroring `NsWaitSockShutdown`,
    /// which closes `trigPipe` only after the thread has exited, not before.
    pub fn await_shutdown(&self) {
        {
            let mut guard = self.shared.lock();
            while guard.running {
                self.condvar.wait(&mut guard);
            }
        }
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
        unsafe {
            libc::close(self.trigger_read_fd);
            libc::close(self.trigger_write_fd);
        }
    }
}

fn reactor_thread(reactor: std::sync::Arc<SocketReactor>, trigger_read_fd: RawFd) {
    let mut table: HashMap<RawFd, Registration> = HashMap::new();

    loop {
        let shutdown_requested = {
            let mut guard = reactor.shared.lock();
            for op in guard.queue.drain(..) {
                match op {
                    QueueOp::Add(reg) => {
                        table.insert(reg.fd, reg);
                    }
                    QueueOp::Cancel(fd) => {
                        table.remove(&fd);
                    }
                }
            }
            guard.shutdown_pending
        };

        if shutdown_requested {
            break;
        }

        let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(table.len() + 1);
        pollfds.push(libc::pollfd { fd: trigger_read_fd, events: libc::POLLIN, revents: 0 });
        let fds_in_order: Vec<RawFd> = table.keys().copied().collect();
        for &fd in &fds_in_order {
            let interest = table[&fd].interest;
            let mut events = 0;
            if interest.contains(Interest::READ) {
                events |= libc::POLLIN;
            }
            if interest.contains(Interest::WRITE) {
                events |= libc::POLLOUT;
            }
            if interest.contains(Interest::EXCEPTION) {
                events |= libc::POLLPRI;
            }
            pollfds.push(libc::pollfd { fd, events, revents: 0 });
        }

        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("reactor: poll failed: {err}");
            std::process::abort();
        }

        if pollfds[0].revents & libc::POLLIN != 0 {
            let mut drain = [0u8; 64];
            loop {
                let n = unsafe { libc::read(trigger_read_fd, drain.as_mut_ptr() as *mut _, drain.len()) };
                if n <= 0 {
                    break;
                }
            }
        }

        for (idx, &fd) in fds_in_order.iter().enumerate() {
            let revents = pollfds[idx + 1].revents;
            if revents == 0 {
                continue;
            }
            let mut fired = Interest::empty();
            if revents & libc::POLLIN != 0 {
                fired |= Interest::READ;
            }
            if revents & (libc::POLLOUT) != 0 {
                fired |= Interest::WRITE;
            }
            if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL | libc::POLLPRI) != 0 {
                fired |= Interest::EXCEPTION;
            }
            if fired.is_empty() {
                continue;
            }
            if let Some(reg) = table.get_mut(&fd) {
                let keep = reg.proc.as_mut().map(|p| p(fd, fired)).unwrap_or(false);
                if !keep {
                    table.remove(&fd);
                }
            }
        }
    }

    for (fd, mut reg) in table.drain() {
        if !reg.interest.contains(Interest::EXIT) {
            continue;
        }
        if let Some(mut proc) = reg.proc.take() {
            proc(fd, Interest::EXIT);
        }
    }

    let mut guard = reactor.shared.lock();
    guard.running = false;
    reactor.condvar.notify_all();
}
