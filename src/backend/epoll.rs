use log::{debug, error};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::GpioError;
use crate::gpio::{EdgePoller, PollEvent, Pollable, WatchToken};

const EPOLL_EVENT_BUFFER_CAPACITY: usize = 64;

/// sysfs signals a value change as an exceptional condition; edge-triggered so
/// each transition is reported once.
fn edge_interest() -> EpollFlags {
    EpollFlags::EPOLLPRI | EpollFlags::EPOLLET
}

pub struct EpollEdgePoller {
    epoll: Arc<Epoll>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpollEdgePoller {
    fn wait_loop(
        epoll: Arc<Epoll>,
        running: Arc<AtomicBool>,
        ready_tx: UnboundedSender<PollEvent>,
        timeout_ms: u16,
    ) {
        let mut events = [EpollEvent::empty(); EPOLL_EVENT_BUFFER_CAPACITY];

        while running.load(Ordering::Acquire) {
            let count = match epoll.wait(&mut events, timeout_ms) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!("edge poller wait failed: {e}");
                    let _ = ready_tx.send(PollEvent::Failed(e.to_string()));
                    return;
                }
            };

            let ready: Vec<_> = events[..count]
                .iter()
                .filter(|evt| evt.events().contains(EpollFlags::EPOLLPRI))
                .map(|evt| evt.data())
                .collect();
            if ready.is_empty() {
                continue;
            }

            if ready_tx.send(PollEvent::Ready(ready)).is_err() {
                debug!("edge consumer gone, stopping poller");
                return;
            }
        }
        debug!("edge poller stopped");
    }
}

impl EdgePoller for EpollEdgePoller {
    fn start(
        running: Arc<AtomicBool>,
        ready_tx: UnboundedSender<PollEvent>,
        timeout: Duration,
    ) -> Result<Self, GpioError> {
        let epoll = Arc::new(
            Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
                .map_err(|e| GpioError::Io(format!("epoll create: {e}")))?,
        );
        let timeout_ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);

        let handle = std::thread::Builder::new()
            .name("gpio-edge-poller".into())
            .spawn({
                let epoll = epoll.clone();
                let running = running.clone();
                move || Self::wait_loop(epoll, running, ready_tx, timeout_ms)
            })
            .map_err(|e| GpioError::Io(format!("spawn edge poller: {e}")))?;

        Ok(Self {
            epoll,
            running,
            handle: Some(handle),
        })
    }

    fn register(&self, source: &dyn Pollable, token: WatchToken) -> Result<(), GpioError> {
        let fd = source.descriptor();
        let event = EpollEvent::new(edge_interest(), token);
        self.epoll
            .add(fd, event)
            .map_err(|e| GpioError::Io(format!("epoll add fd {}: {e}", fd.as_raw_fd())))
    }

    fn unregister(&self, source: &dyn Pollable) -> Result<(), GpioError> {
        let fd = source.descriptor();
        self.epoll
            .delete(fd)
            .map_err(|e| GpioError::Io(format!("epoll delete fd {}: {e}", fd.as_raw_fd())))
    }

    /// Returns within one wait timeout.
    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EpollEdgePoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::{AsFd, BorrowedFd};
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    use nix::libc;

    use tokio::sync::mpsc;

    use super::*;

    struct Socket<S: AsFd>(S);

    impl<S: AsFd> Pollable for Socket<S> {
        fn descriptor(&self) -> BorrowedFd<'_> {
            self.0.as_fd()
        }
    }

    fn recv_within(
        rx: &mut mpsc::UnboundedReceiver<PollEvent>,
        limit: Duration,
    ) -> Option<PollEvent> {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if let Ok(event) = rx.try_recv() {
                return Some(event);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    fn start_poller() -> (EpollEdgePoller, mpsc::UnboundedReceiver<PollEvent>) {
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel();
        let poller = EpollEdgePoller::start(running, tx, Duration::from_millis(10)).unwrap();
        (poller, rx)
    }

    #[test]
    fn stop_joins_within_a_timeout() {
        let (mut poller, _rx) = start_poller();
        let started = Instant::now();
        poller.stop();
        assert!(poller.handle.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
        poller.stop();
    }

    #[test]
    fn register_and_unregister_socket() {
        let (poller, mut rx) = start_poller();
        let (left, _right) = UnixStream::pair().unwrap();
        let source = Socket(left);

        poller.register(&source, 1).unwrap();
        assert!(poller.register(&source, 2).is_err());
        poller.unregister(&source).unwrap();
        assert!(poller.unregister(&source).is_err());

        // plain readiness without EPOLLPRI never produces a batch
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn regular_files_cannot_be_registered() {
        let (poller, _rx) = start_poller();
        let file = tempfile::tempfile().unwrap();

        struct Plain(std::fs::File);
        impl Pollable for Plain {
            fn descriptor(&self) -> BorrowedFd<'_> {
                self.0.as_fd()
            }
        }

        let err = poller.register(&Plain(file), 1).unwrap_err();
        assert!(matches!(err, GpioError::Io(_)));
    }

    #[test]
    fn urgent_data_is_forwarded_as_ready_batch() {
        let (poller, mut rx) = start_poller();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let sender = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (receiver, _) = listener.accept().unwrap();
        let source = Socket(receiver);

        poller.register(&source, 42).unwrap();

        // out-of-band TCP data raises EPOLLPRI, like a sysfs value change
        let sent = unsafe {
            libc::send(
                sender.as_raw_fd(),
                b"!".as_ptr().cast(),
                1,
                libc::MSG_OOB,
            )
        };
        assert_eq!(sent, 1);

        let event = recv_within(&mut rx, Duration::from_secs(2));
        assert_eq!(event, Some(PollEvent::Ready(vec![42])));

        poller.unregister(&source).unwrap();
    }

    #[test]
    fn unregistered_source_stays_silent() {
        let (poller, mut rx) = start_poller();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let sender = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (receiver, _) = listener.accept().unwrap();
        let source = Socket(receiver);

        poller.register(&source, 7).unwrap();
        poller.unregister(&source).unwrap();

        let sent = unsafe {
            libc::send(
                sender.as_raw_fd(),
                b"!".as_ptr().cast(),
                1,
                libc::MSG_OOB,
            )
        };
        assert_eq!(sent, 1);

        assert_eq!(recv_within(&mut rx, Duration::from_millis(200)), None);
    }
}
