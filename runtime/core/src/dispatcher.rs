// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2020 Takashi Sakamoto

use {
    super::*,
    glib::{source, ControlFlow, FileError, MainContext, MainLoop, Source},
    nix::sys::signal,
    std::{
        sync::{mpsc, Arc},
        thread,
        time::Duration,
    },
    tracing::warn,
};

/// The thread to dispatch events of signal and timer in own context of GLib.
pub struct Dispatcher {
    name: String,
    th: Option<thread::JoinHandle<()>>,
    ev_loop: Arc<MainLoop>,
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.ev_loop.quit();

        if let Some(th) = self.th.take() {
            if th.join().is_err() {
                warn!(name = %self.name, "Fail to join thread");
            }
        }
    }
}

impl Dispatcher {
    pub fn run(name: String) -> Result<Dispatcher, Error> {
        // Use own context.
        let ctx = MainContext::new();
        let ev_loop = Arc::new(MainLoop::new(Some(&ctx), false));

        // The idle source is dispatched at first iteration of the loop.
        let (tx, rx) = mpsc::channel();
        let src = source::idle_source_new(None, source::Priority::HIGH, move || {
            let _ = tx.send(());
            ControlFlow::Break
        });
        src.attach(Some(&ctx));

        // launch one thread to dispatch all events.
        let l = ev_loop.clone();
        let th = thread::Builder::new()
            .name(name.clone())
            .spawn(move || l.run())
            .map_err(|e| {
                let msg = format!("Fail to spawn thread for {}: {}", name, e);
                Error::new(FileError::Nomem, &msg)
            })?;

        rx.recv().map_err(|_| {
            let msg = format!("Event loop for {} is not launched", name);
            Error::new(FileError::Failed, &msg)
        })?;

        let th = Some(th);
        Ok(Dispatcher { name, th, ev_loop })
    }

    pub fn stop(&mut self) {
        self.ev_loop.quit();
    }

    fn attach_src_to_ctx(&mut self, src: &Source) {
        let ctx = self.ev_loop.context();
        src.attach(Some(&ctx));
    }

    pub fn attach_signal_handler<F>(&mut self, signum: signal::Signal, cb: F)
    where
        F: FnMut() -> ControlFlow + Send + 'static,
    {
        let src =
            source::unix_signal_source_new(signum as i32, None, source::Priority::DEFAULT_IDLE, cb);

        self.attach_src_to_ctx(&src);
    }

    pub fn attach_interval_handler<F>(&mut self, interval: Duration, cb: F)
    where
        F: FnMut() -> ControlFlow + Send + 'static,
    {
        let src = source::timeout_source_new(interval, None, source::Priority::DEFAULT_IDLE, cb);

        self.attach_src_to_ctx(&src);
    }
}
