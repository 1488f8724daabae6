// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Handler of isochronous context, and its manager.
//!
//! Each handler owns one isochronous context and dedicates one thread to it. The thread waits
//! for the interrupt of the context and processes the batch of packets by invoking the callback
//! of stream. The manager maintains handlers for their lifetime, and recovers them from bus
//! reset.

use {
    super::iso_stream::*,
    firewire_isoch_protocols::IsochStreamError,
    glib::Error,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc, Arc,
        },
        thread,
        time::Duration,
    },
    tracing::{debug, debug_span, warn},
};

/// The operation of isochronous context in the OS layer.
pub trait IsoContext: Send {
    fn direction(&self) -> IsoDirection;

    fn channel(&self) -> u8;

    /// Start the context. It fails when the generation of bus is expired.
    fn start(&mut self) -> Result<(), IsochStreamError>;

    fn stop(&mut self);

    /// Wait for the interrupt of context or the timeout.
    fn wait(&mut self, timeout: Duration) -> Result<(), IsochStreamError>;

    /// Process the batch of packets with callback of the stream, then return the number of
    /// processed packets.
    fn process(&mut self, stream: &mut IsoStream) -> Result<usize, IsochStreamError>;
}

/// The provider of isochronous context and channel in the bus.
pub trait IsoContextProvider {
    type Context: IsoContext + 'static;

    /// The generation of bus, incremented at bus reset.
    fn generation(&self) -> u32;

    /// Allocate the channel. The specific channel is allocated when given.
    fn allocate_channel(&self, channel: Option<u8>) -> Result<u8, Error>;

    fn release_channel(&self, channel: u8);

    fn create_context(
        &self,
        direction: IsoDirection,
        channel: u8,
        irq_interval: usize,
        max_packet_size: usize,
    ) -> Result<Self::Context, Error>;
}

/// The event from the thread of handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandlerEvent {
    /// The thread finished due to the cause.
    Stopped { id: usize, cause: IsochStreamError },
}

/// The interval to check the request to stop.
const WAIT_TIMEOUT: Duration = Duration::from_millis(10);

struct HandlerCore<C: IsoContext> {
    context: C,
    stream: IsoStream,
    started: bool,
}

impl<C: IsoContext> HandlerCore<C> {
    fn start(&mut self) -> Result<(), IsochStreamError> {
        self.context.start()?;
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.context.stop();
        self.started = false;
    }
}

struct HandlerWorker<C: IsoContext> {
    running: Arc<AtomicBool>,
    th: thread::JoinHandle<HandlerCore<C>>,
}

/// The handler of isochronous context.
pub struct IsoHandler<C: IsoContext + 'static> {
    id: usize,
    name: String,
    core: Option<HandlerCore<C>>,
    worker: Option<HandlerWorker<C>>,
}

impl<C: IsoContext + 'static> Drop for IsoHandler<C> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(name = %self.name, "{}", e);
        }
    }
}

fn not_in_state(name: &str, state: &str) -> Error {
    let msg = format!("Handler {} is not {}", name, state);
    Error::new(IsochStreamError::InvalidState, &msg)
}

impl<C: IsoContext + 'static> IsoHandler<C> {
    pub fn new(id: usize, name: &str, context: C, stream: IsoStream) -> Self {
        Self {
            id,
            name: name.to_string(),
            core: Some(HandlerCore {
                context,
                stream,
                started: false,
            }),
            worker: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Start the context, then launch the thread to process it.
    pub fn start(&mut self, events: mpsc::SyncSender<HandlerEvent>) -> Result<(), Error> {
        let mut core = self
            .core
            .take()
            .ok_or_else(|| not_in_state(&self.name, "stopped"))?;

        if let Err(cause) = core.start() {
            self.core = Some(core);
            let msg = format!("Fail to start context for {}", self.name);
            return Err(Error::new(cause, &msg));
        }

        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        let id = self.id;
        let th = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                while r.load(Ordering::Acquire) {
                    let res = core
                        .context
                        .wait(WAIT_TIMEOUT)
                        .and_then(|_| core.context.process(&mut core.stream));
                    if let Err(cause) = res {
                        let _ = events.try_send(HandlerEvent::Stopped { id, cause });
                        break;
                    }
                }
                core.stop();
                core
            })
            .map_err(|e| {
                let msg = format!("Fail to spawn thread for {}: {}", self.name, e);
                Error::new(IsochStreamError::ContextFailed, &msg)
            })?;

        debug!(name = %self.name, "started");
        self.worker = Some(HandlerWorker { running, th });

        Ok(())
    }

    /// Stop the thread and join it. No callback is invoked after return.
    pub fn stop(&mut self) -> Result<(), Error> {
        if let Some(worker) = self.worker.take() {
            worker.running.store(false, Ordering::Release);
            let core = worker.th.join().map_err(|_| {
                let msg = format!("Thread for {} panicked", self.name);
                Error::new(IsochStreamError::ContextFailed, &msg)
            })?;
            self.core = Some(core);
            debug!(name = %self.name, "stopped");
        }
        Ok(())
    }

    /// Process one batch in the current thread. The handler should be stopped. The context is
    /// started at the first call.
    pub fn iterate(&mut self) -> Result<usize, IsochStreamError> {
        let core = self.core.as_mut().ok_or(IsochStreamError::InvalidState)?;
        if !core.started {
            core.start()?;
        }
        core.context.process(&mut core.stream)
    }

    /// Replace the context, typically after bus reset. The handler should be stopped.
    pub fn replace_context(&mut self, context: C) -> Result<C, Error> {
        let core = self
            .core
            .as_mut()
            .ok_or_else(|| not_in_state(&self.name, "stopped"))?;
        if core.started {
            core.stop();
        }
        core.stream.set_channel(context.channel());
        Ok(std::mem::replace(&mut core.context, context))
    }

    pub fn stream(&self) -> Option<&IsoStream> {
        self.core.as_ref().map(|core| &core.stream)
    }

    /// Release the stream. The handler should be stopped.
    pub fn into_stream(mut self) -> Result<IsoStream, Error> {
        self.stop()?;
        match self.core.take() {
            Some(core) => Ok(core.stream),
            None => Err(not_in_state(&self.name, "available")),
        }
    }
}

struct ManagedHandler<C: IsoContext + 'static> {
    handler: IsoHandler<C>,
    direction: IsoDirection,
    channel: u8,
    allocated: bool,
    irq_interval: usize,
    max_packet_size: usize,
    stats: Arc<IsoStreamStats>,
}

/// The manager of handlers.
pub struct IsoHandlerManager<P: IsoContextProvider> {
    provider: P,
    handlers: Vec<Option<ManagedHandler<P::Context>>>,
    tx: mpsc::SyncSender<HandlerEvent>,
    rx: mpsc::Receiver<HandlerEvent>,
    running: bool,
    bus_resets: u64,
}

const EVENT_QUEUE_SIZE: usize = 32;

impl<P: IsoContextProvider> Drop for IsoHandlerManager<P> {
    fn drop(&mut self) {
        let _ = self.stop();
        self.handlers.iter_mut().for_each(|entry| {
            if let Some(entry) = entry.take() {
                if entry.allocated {
                    self.provider.release_channel(entry.channel);
                }
            }
        });
    }
}

impl<P: IsoContextProvider> IsoHandlerManager<P> {
    pub fn new(provider: P) -> Self {
        let (tx, rx) = mpsc::sync_channel(EVENT_QUEUE_SIZE);
        Self {
            provider,
            handlers: Default::default(),
            tx,
            rx,
            running: false,
            bus_resets: 0,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Register the stream. The channel is allocated for transmit stream, while the given
    /// channel is listened for receive stream. Any failure leaves nothing registered.
    pub fn open(
        &mut self,
        name: &str,
        mut stream: IsoStream,
        channel: Option<u8>,
        irq_interval: usize,
        max_packet_size: usize,
    ) -> Result<usize, Error> {
        let direction = stream.direction();
        let (channel, allocated) = match direction {
            IsoDirection::Transmit => (self.provider.allocate_channel(channel)?, true),
            IsoDirection::Receive => {
                let channel = channel.ok_or_else(|| {
                    let msg = format!("Channel is required to receive packets for {}", name);
                    Error::new(IsochStreamError::ChannelUnavailable, &msg)
                })?;
                (channel, false)
            }
        };

        let context = self
            .provider
            .create_context(direction, channel, irq_interval, max_packet_size)
            .map_err(|e| {
                if allocated {
                    self.provider.release_channel(channel);
                }
                e
            })?;

        stream.set_channel(channel);
        let stats = stream.stats().clone();

        let id = self
            .handlers
            .iter()
            .position(|entry| entry.is_none())
            .unwrap_or(self.handlers.len());
        let entry = ManagedHandler {
            handler: IsoHandler::new(id, name, context, stream),
            direction,
            channel,
            allocated,
            irq_interval,
            max_packet_size,
            stats,
        };
        if id < self.handlers.len() {
            self.handlers[id] = Some(entry);
        } else {
            self.handlers.push(Some(entry));
        }

        debug!(name, id, channel, ?direction, "opened");

        Ok(id)
    }

    /// Unregister the stream, then return it.
    pub fn close(&mut self, id: usize) -> Result<IsoStream, Error> {
        let entry = self
            .handlers
            .get_mut(id)
            .and_then(|entry| entry.take())
            .ok_or_else(|| not_in_state(&id.to_string(), "registered"))?;

        if entry.allocated {
            self.provider.release_channel(entry.channel);
        }

        debug!(id, channel = entry.channel, "closed");

        entry.handler.into_stream()
    }

    /// Start all of handlers. When any handler fails, the others are stopped.
    pub fn start(&mut self) -> Result<(), Error> {
        let tx = self.tx.clone();
        let res = self
            .handlers
            .iter_mut()
            .flatten()
            .filter(|entry| !entry.handler.is_running())
            .try_for_each(|entry| entry.handler.start(tx.clone()));

        if let Err(e) = res {
            let _ = self.stop();
            Err(e)
        } else {
            self.running = true;
            Ok(())
        }
    }

    /// Stop all of handlers and join their threads. This is the first phase to stop streaming,
    /// the consumers of packet buffer should be stopped after it.
    pub fn stop(&mut self) -> Result<(), Error> {
        self.running = false;
        self.handlers
            .iter_mut()
            .flatten()
            .try_for_each(|entry| entry.handler.stop())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Process one batch for each handler in the current thread, then recover from bus reset
    /// if detected. The manager should be stopped.
    pub fn iterate(&mut self) -> Result<usize, Error> {
        let mut count = 0;
        let mut bus_reset = false;

        for entry in self.handlers.iter_mut().flatten() {
            match entry.handler.iterate() {
                Ok(processed) => count += processed,
                Err(IsochStreamError::BusReset) => bus_reset = true,
                Err(cause) => {
                    let msg = format!("Fail to process {}", entry.handler.name());
                    return Err(Error::new(cause, &msg));
                }
            }
        }

        if bus_reset {
            self.handle_bus_reset()?;
        }

        Ok(count)
    }

    /// Handle events from threads of handlers, then return the number of handled events.
    pub fn poll_events(&mut self) -> Result<usize, Error> {
        let mut count = 0;
        let mut bus_reset = false;

        while let Ok(event) = self.rx.try_recv() {
            count += 1;
            match event {
                HandlerEvent::Stopped { id, cause } => {
                    let _enter = debug_span!("handler", id).entered();
                    match cause {
                        IsochStreamError::BusReset => {
                            debug!("bus reset detected");
                            bus_reset = true;
                        }
                        IsochStreamError::InvalidState => {
                            debug!("packet buffer is released");
                        }
                        _ => {
                            let name = self.handler_name(id);
                            let msg = format!("Handler {} stopped: {}", name, cause);
                            return Err(Error::new(cause, &msg));
                        }
                    }
                }
            }
        }

        if bus_reset {
            self.handle_bus_reset()?;
        }

        Ok(count)
    }

    fn handler_name(&self, id: usize) -> String {
        self.handlers
            .get(id)
            .and_then(|entry| entry.as_ref())
            .map(|entry| entry.handler.name().to_string())
            .unwrap_or_else(|| id.to_string())
    }

    /// Stop all handlers, allocate channels again in the new generation, then restart handlers
    /// when they were running. The same channel is preferred. A receive handler listening to the
    /// channel renumbered for transmission follows the new number, while the channel of the other
    /// node is left as given at open.
    pub fn handle_bus_reset(&mut self) -> Result<(), Error> {
        let _enter = debug_span!("bus-reset").entered();

        let was_running = self.running;
        self.stop()?;

        // Events from threads stopped for the same bus reset.
        while self.rx.try_recv().is_ok() {}

        self.bus_resets += 1;
        let generation = self.provider.generation();
        debug!(generation, "recover");

        let mut renumbered = Vec::new();
        for entry in self.handlers.iter_mut().flatten().filter(|entry| entry.allocated) {
            self.provider.release_channel(entry.channel);
            let channel = self
                .provider
                .allocate_channel(Some(entry.channel))
                .or_else(|_| self.provider.allocate_channel(None))?;

            if channel != entry.channel {
                warn!(
                    name = entry.handler.name(),
                    old = entry.channel,
                    new = channel,
                    "channel renumbered"
                );
                renumbered.push((entry.channel, channel));
                entry.channel = channel;
            }
        }

        for entry in self.handlers.iter_mut().flatten() {
            if !entry.allocated {
                let followed = renumbered.iter().find(|(old, _)| *old == entry.channel);
                if let Some(&(old, new)) = followed {
                    debug!(name = entry.handler.name(), old, new, "channel followed");
                    entry.channel = new;
                }
            }

            let context = self.provider.create_context(
                entry.direction,
                entry.channel,
                entry.irq_interval,
                entry.max_packet_size,
            )?;
            entry.handler.replace_context(context)?;
        }

        if was_running {
            self.start()?;
        }

        Ok(())
    }

    pub fn channel(&self, id: usize) -> Option<u8> {
        self.handlers
            .get(id)
            .and_then(|entry| entry.as_ref())
            .map(|entry| entry.channel)
    }

    pub fn stats(&self, id: usize) -> Option<Arc<IsoStreamStats>> {
        self.handlers
            .get(id)
            .and_then(|entry| entry.as_ref())
            .map(|entry| entry.stats.clone())
    }

    pub fn bus_resets(&self) -> u64 {
        self.bus_resets
    }
}
