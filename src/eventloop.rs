use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

pub const POLL_NULL: u32 = 0x00;
pub const POLL_IN: u32 = 0x01;
pub const POLL_OUT: u32 = 0x04;
pub const POLL_ERR: u32 = 0x08;
pub const POLL_HUP: u32 = 0x10;

/// Cadence of the periodic callbacks (cache sweeps, idle checks).
pub const TIMEOUT_PRECISION: Duration = Duration::from_secs(10);

const MAX_EVENTS: usize = 1024;

/// One readiness interface over whatever the host kernel offers. All
/// backends are level-triggered and expose identical bookkeeping, so the
/// relays never know which one is underneath.
trait Poller {
    fn add(&mut self, fd: RawFd, mask: u32) -> io::Result<()>;
    fn modify(&mut self, fd: RawFd, mask: u32) -> io::Result<()>;
    fn remove(&mut self, fd: RawFd) -> io::Result<()>;

    /// Wait up to `timeout` (forever when `None`) and append ready
    /// `(fd, mask)` pairs, one entry per fd. An interrupted wait comes
    /// back as an empty round; the caller just polls again.
    fn poll(&mut self, timeout: Option<Duration>, events: &mut Vec<(RawFd, u32)>)
        -> io::Result<()>;

    fn name(&self) -> &'static str;
}

fn unknown_fd(fd: RawFd) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("fd {} not registered", fd),
    )
}

#[cfg(target_os = "linux")]
mod epoll {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use super::*;

    fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
        match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
        }
    }

    pub struct Epoll {
        epfd: OwnedFd,
        events: Vec<libc::epoll_event>,
    }

    impl Epoll {
        pub fn new() -> io::Result<Epoll> {
            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if epfd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Epoll {
                epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
                events: Vec::with_capacity(MAX_EVENTS),
            })
        }

        fn ctl(&mut self, op: libc::c_int, fd: RawFd, mask: u32) -> io::Result<()> {
            let mut event = libc::epoll_event {
                events: to_epoll(mask),
                u64: fd as u64,
            };
            let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    fn to_epoll(mask: u32) -> u32 {
        let mut events = 0;
        if mask & POLL_IN != 0 {
            events |= libc::EPOLLIN as u32;
        }
        if mask & POLL_OUT != 0 {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }

    fn from_epoll(events: u32) -> u32 {
        let mut mask = POLL_NULL;
        if events & (libc::EPOLLIN as u32 | libc::EPOLLPRI as u32) != 0 {
            mask |= POLL_IN;
        }
        if events & libc::EPOLLOUT as u32 != 0 {
            mask |= POLL_OUT;
        }
        if events & libc::EPOLLERR as u32 != 0 {
            mask |= POLL_ERR;
        }
        if events & libc::EPOLLHUP as u32 != 0 {
            mask |= POLL_HUP;
        }
        mask
    }

    impl Poller for Epoll {
        fn add(&mut self, fd: RawFd, mask: u32) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, mask)
        }

        fn modify(&mut self, fd: RawFd, mask: u32) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, mask)
        }

        fn remove(&mut self, fd: RawFd) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_DEL, fd, POLL_NULL)
        }

        fn poll(
            &mut self,
            timeout: Option<Duration>,
            events: &mut Vec<(RawFd, u32)>,
        ) -> io::Result<()> {
            self.events.clear();
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd.as_raw_fd(),
                    self.events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    timeout_millis(timeout),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(());
                }
                return Err(err);
            }

            unsafe { self.events.set_len(n as usize) };
            for event in &self.events {
                events.push((event.u64 as RawFd, from_epoll(event.events)));
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "epoll"
        }
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "openbsd"
))]
mod kqueue {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::ptr;

    use super::*;

    pub struct Kqueue {
        kq: OwnedFd,
        interests: HashMap<RawFd, u32>,
        events: Vec<libc::kevent>,
    }

    impl Kqueue {
        pub fn new() -> io::Result<Kqueue> {
            let kq = unsafe { libc::kqueue() };
            if kq < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Kqueue {
                kq: unsafe { OwnedFd::from_raw_fd(kq) },
                interests: HashMap::new(),
                events: Vec::with_capacity(MAX_EVENTS),
            })
        }

        // struct layout differs between the BSDs, zeroing sidesteps the
        // fields this code never touches
        fn change(fd: RawFd, filter: i16, flags: u16) -> libc::kevent {
            let mut ev: libc::kevent = unsafe { mem::zeroed() };
            ev.ident = fd as libc::uintptr_t;
            ev.filter = filter;
            ev.flags = flags;
            ev
        }

        fn control(&mut self, fd: RawFd, mask: u32, flags: u16) -> io::Result<()> {
            let mut changes = Vec::with_capacity(2);
            if mask & POLL_IN != 0 {
                changes.push(Self::change(fd, libc::EVFILT_READ, flags));
            }
            if mask & POLL_OUT != 0 {
                changes.push(Self::change(fd, libc::EVFILT_WRITE, flags));
            }
            if changes.is_empty() {
                return Ok(());
            }

            let rc = unsafe {
                libc::kevent(
                    self.kq.as_raw_fd(),
                    changes.as_ptr(),
                    changes.len() as libc::c_int,
                    ptr::null_mut(),
                    0,
                    ptr::null(),
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    impl Poller for Kqueue {
        fn add(&mut self, fd: RawFd, mask: u32) -> io::Result<()> {
            self.control(fd, mask, libc::EV_ADD)?;
            self.interests.insert(fd, mask);
            Ok(())
        }

        fn modify(&mut self, fd: RawFd, mask: u32) -> io::Result<()> {
            let old = *self.interests.get(&fd).ok_or_else(|| unknown_fd(fd))?;
            self.control(fd, old, libc::EV_DELETE)?;
            self.control(fd, mask, libc::EV_ADD)?;
            self.interests.insert(fd, mask);
            Ok(())
        }

        fn remove(&mut self, fd: RawFd) -> io::Result<()> {
            let old = self.interests.remove(&fd).ok_or_else(|| unknown_fd(fd))?;
            self.control(fd, old, libc::EV_DELETE)
        }

        fn poll(
            &mut self,
            timeout: Option<Duration>,
            events: &mut Vec<(RawFd, u32)>,
        ) -> io::Result<()> {
            let ts = timeout.map(|d| libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: libc::c_long::from(d.subsec_nanos() as i32),
            });
            let ts_ptr = ts
                .as_ref()
                .map(|ts| ts as *const libc::timespec)
                .unwrap_or(ptr::null());

            self.events.clear();
            let n = unsafe {
                libc::kevent(
                    self.kq.as_raw_fd(),
                    ptr::null(),
                    0,
                    self.events.as_mut_ptr(),
                    MAX_EVENTS as libc::c_int,
                    ts_ptr,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(());
                }
                return Err(err);
            }
            unsafe { self.events.set_len(n as usize) };

            // one merged mask per fd, read and write filters arrive as
            // separate kevents
            let mut merged: HashMap<RawFd, u32> = HashMap::new();
            for event in &self.events {
                let fd = event.ident as RawFd;
                let mut mask = match event.filter {
                    libc::EVFILT_READ => POLL_IN,
                    libc::EVFILT_WRITE => POLL_OUT,
                    _ => POLL_NULL,
                };
                if event.flags & libc::EV_ERROR != 0 {
                    mask |= POLL_ERR;
                }
                *merged.entry(fd).or_insert(POLL_NULL) |= mask;
            }
            events.extend(merged);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "kqueue"
        }
    }
}

/// Portable fallback: fixed-size fd sets rebuilt and linearly scanned on
/// every wait.
mod select {
    use super::*;

    pub struct Select {
        interests: HashMap<RawFd, u32>,
    }

    impl Select {
        pub fn new() -> io::Result<Select> {
            Ok(Select {
                interests: HashMap::new(),
            })
        }
    }

    impl Poller for Select {
        fn add(&mut self, fd: RawFd, mask: u32) -> io::Result<()> {
            if fd as usize >= libc::FD_SETSIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("fd {} above FD_SETSIZE", fd),
                ));
            }
            self.interests.insert(fd, mask);
            Ok(())
        }

        fn modify(&mut self, fd: RawFd, mask: u32) -> io::Result<()> {
            match self.interests.get_mut(&fd) {
                Some(old) => {
                    *old = mask;
                    Ok(())
                }
                None => Err(unknown_fd(fd)),
            }
        }

        fn remove(&mut self, fd: RawFd) -> io::Result<()> {
            self.interests.remove(&fd).map(|_| ()).ok_or_else(|| unknown_fd(fd))
        }

        fn poll(
            &mut self,
            timeout: Option<Duration>,
            events: &mut Vec<(RawFd, u32)>,
        ) -> io::Result<()> {
            let mut rset: libc::fd_set = unsafe { mem::zeroed() };
            let mut wset: libc::fd_set = unsafe { mem::zeroed() };
            let mut eset: libc::fd_set = unsafe { mem::zeroed() };

            let mut nfds = 0;
            for (&fd, &mask) in &self.interests {
                nfds = nfds.max(fd + 1);
                unsafe {
                    if mask & POLL_IN != 0 {
                        libc::FD_SET(fd, &mut rset);
                    }
                    if mask & POLL_OUT != 0 {
                        libc::FD_SET(fd, &mut wset);
                    }
                    if mask & POLL_ERR != 0 {
                        libc::FD_SET(fd, &mut eset);
                    }
                }
            }

            let mut tv = timeout.map(|d| libc::timeval {
                tv_sec: d.as_secs() as libc::time_t,
                tv_usec: d.subsec_micros() as libc::suseconds_t,
            });
            let tv_ptr = tv
                .as_mut()
                .map(|tv| tv as *mut libc::timeval)
                .unwrap_or(std::ptr::null_mut());

            let rc = unsafe { libc::select(nfds, &mut rset, &mut wset, &mut eset, tv_ptr) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(());
                }
                return Err(err);
            }
            if rc == 0 {
                return Ok(());
            }

            for (&fd, _) in &self.interests {
                let mut mask = POLL_NULL;
                unsafe {
                    if libc::FD_ISSET(fd, &rset) {
                        mask |= POLL_IN;
                    }
                    if libc::FD_ISSET(fd, &wset) {
                        mask |= POLL_OUT;
                    }
                    if libc::FD_ISSET(fd, &eset) {
                        mask |= POLL_ERR;
                    }
                }
                if mask != POLL_NULL {
                    events.push((fd, mask));
                }
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "select"
        }
    }
}

fn default_poller() -> io::Result<Box<dyn Poller>> {
    #[cfg(target_os = "linux")]
    {
        return Ok(Box::new(epoll::Epoll::new()?));
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "openbsd"
    ))]
    {
        return Ok(Box::new(kqueue::Kqueue::new()?));
    }

    #[allow(unreachable_code)]
    Ok(Box::new(select::Select::new()?))
}

/// Anything owning fds driven by the loop. Handlers run one at a time
/// per worker; they may register and unregister fds (their own included)
/// from inside a callback.
pub trait EventHandler {
    fn handle_event(&mut self, lp: &mut EventLoop, fd: RawFd, events: u32);

    /// Called on the `TIMEOUT_PRECISION` cadence for handlers registered
    /// with `add_periodic`.
    fn handle_periodic(&mut self, _lp: &mut EventLoop) {}
}

pub struct EventLoop {
    poller: Box<dyn Poller>,
    handlers: HashMap<RawFd, Rc<RefCell<dyn EventHandler>>>,
    periodic: Vec<Rc<RefCell<dyn EventHandler>>>,
    ready: Vec<(RawFd, u32)>,
    last_periodic: Instant,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        let poller = default_poller()?;
        debug!("using event model {}", poller.name());

        Ok(EventLoop {
            poller,
            handlers: HashMap::new(),
            periodic: Vec::new(),
            ready: Vec::with_capacity(MAX_EVENTS),
            last_periodic: Instant::now(),
        })
    }

    pub fn add(
        &mut self,
        fd: RawFd,
        mask: u32,
        handler: Rc<RefCell<dyn EventHandler>>,
    ) -> io::Result<()> {
        if self.handlers.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("fd {} already registered", fd),
            ));
        }
        self.poller.add(fd, mask)?;
        self.handlers.insert(fd, handler);
        Ok(())
    }

    pub fn modify(&mut self, fd: RawFd, mask: u32) -> io::Result<()> {
        if !self.handlers.contains_key(&fd) {
            return Err(unknown_fd(fd));
        }
        self.poller.modify(fd, mask)
    }

    /// Unregister `fd`. Must happen before the fd is closed, or a reused
    /// descriptor number could receive a dead connection's events.
    pub fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        if self.handlers.remove(&fd).is_none() {
            return Err(unknown_fd(fd));
        }
        self.poller.remove(fd)
    }

    pub fn add_periodic(&mut self, handler: Rc<RefCell<dyn EventHandler>>) {
        self.periodic.push(handler);
    }

    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.run_once(Some(TIMEOUT_PRECISION))?;
        }
    }

    /// One poll round: wait, dispatch ready fds, fire periodic callbacks
    /// when the cadence elapsed.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let mut ready = mem::take(&mut self.ready);
        ready.clear();

        if let Err(err) = self.poller.poll(timeout, &mut ready) {
            self.ready = ready;
            return Err(err);
        }

        for &(fd, events) in &ready {
            // a handler earlier in this round may have unregistered it
            let handler = self.handlers.get(&fd).cloned();
            if let Some(handler) = handler {
                handler.borrow_mut().handle_event(self, fd, events);
            }
        }
        self.ready = ready;

        if self.last_periodic.elapsed() >= TIMEOUT_PRECISION {
            self.last_periodic = Instant::now();
            for i in 0..self.periodic.len() {
                let handler = self.periodic[i].clone();
                handler.borrow_mut().handle_periodic(self);
            }
        }
        Ok(())
    }
}
