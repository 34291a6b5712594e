//! In-process event loop on a background thread.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use wspool::{Callbacks, EventLoop, ServerConfig, bind_listener};

/// An event loop serving on an ephemeral localhost port.
pub struct TestServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Start a loop with default settings.
    ///
    /// `callbacks` runs on the loop thread, since callbacks are not `Send`.
    pub fn spawn(callbacks: impl FnOnce() -> Callbacks + Send + 'static) -> Self {
        Self::spawn_with(ServerConfig::default(), callbacks)
    }

    /// Start a loop with `config`; its listen address is ignored.
    pub fn spawn_with(
        config: ServerConfig,
        callbacks: impl FnOnce() -> Callbacks + Send + 'static,
    ) -> Self {
        let config = config
            .with_select_timeout(Duration::from_millis(20))
            .with_accept_timeout(Duration::ZERO);
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let flag = stop.clone();
        let handle = thread::spawn(move || {
            let listener =
                bind_listener("127.0.0.1:0".parse().unwrap(), config.backlog, false).unwrap();
            let mut event_loop = EventLoop::new(listener, &config, callbacks()).unwrap();
            tx.send(event_loop.local_addr().unwrap()).unwrap();
            event_loop
                .run_until(|| flag.load(Ordering::SeqCst))
                .unwrap();
        });

        let addr = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        Self {
            addr,
            stop,
            handle: Some(handle),
        }
    }

    /// Address the loop listens on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
