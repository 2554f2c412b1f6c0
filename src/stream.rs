//! Flow-controlled byte streams.
//!
//! A [`Stream`] connects one producer and one consumer through a fixed ring.
//! Each side registers a [`StreamListener`]; the stream tells the consumer
//! when data arrives and the producer when space is freed, and runs a
//! connect handshake so either side may come up first.
//!
//! Listeners run synchronously inside `push`/`pop`. They must not touch the
//! stream again; the intended listener is [`EventNotify`], which only posts a
//! pending event to the owning machine.

use crate::error::{SmError, SmResult};
use crate::event::Event;
use crate::fifo::Fifo;
use crate::machine::SmId;
use crate::mailbox::Mailbox;

/// Notification capability for one end of a stream.
pub trait StreamListener: Sync {
    /// Consumer side: new data arrived. Producer side: space was freed.
    fn on_transfer(&self) {}

    /// The opposite end announced itself after this end did.
    fn on_connect(&self) {}
}

pub struct Stream<'a, const N: usize> {
    fifo: Fifo<N>,
    // told about freed space and a connecting consumer
    producer: Option<&'a dyn StreamListener>,
    // told about new data and a connecting producer
    consumer: Option<&'a dyn StreamListener>,
    tx_ready: bool,
    rx_ready: bool,
    overflow: bool,
}

impl<'a, const N: usize> Default for Stream<'a, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const N: usize> Stream<'a, N> {
    pub const fn new() -> Self {
        Stream {
            fifo: Fifo::new(),
            producer: None,
            consumer: None,
            tx_ready: false,
            rx_ready: false,
            overflow: false,
        }
    }

    /// Empties the ring and clears the overflow flag. Listeners and the
    /// handshake state are kept.
    pub fn init(&mut self) {
        self.fifo.reset();
        self.overflow = false;
    }

    /// Detaches both listeners and forgets the handshake.
    pub fn fini(&mut self) {
        self.producer = None;
        self.consumer = None;
        self.tx_ready = false;
        self.rx_ready = false;
    }

    pub fn set_producer(&mut self, listener: Option<&'a dyn StreamListener>) {
        self.producer = listener;
    }

    pub fn set_consumer(&mut self, listener: Option<&'a dyn StreamListener>) {
        self.consumer = listener;
    }

    pub fn push(&mut self, data: &[u8]) -> usize {
        let count = self.fifo.push(data);

        if count < data.len() {
            if !self.overflow {
                warn!("stream overflow: {} of {} bytes accepted", count, data.len());
            }
            self.overflow = true;
        }
        if count > 0 {
            if let Some(consumer) = self.consumer {
                consumer.on_transfer();
            }
        }
        count
    }

    pub fn pop(&mut self, out: &mut [u8]) -> usize {
        let count = self.fifo.pop(out);

        if count > 0 {
            if let Some(producer) = self.producer {
                producer.on_transfer();
            }
        }
        count
    }

    pub fn data_size(&self) -> usize {
        self.fifo.data_len()
    }

    pub fn free_size(&self) -> usize {
        self.fifo.avail_len()
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn overflowed(&self) -> bool {
        self.overflow
    }

    pub fn is_tx_ready(&self) -> bool {
        self.tx_ready
    }

    pub fn is_rx_ready(&self) -> bool {
        self.rx_ready
    }

    /// The consumer announces itself. Returns whether the producer was
    /// already there; if it was, the producer's `on_connect` fires.
    pub fn connect_rx(&mut self) -> bool {
        if self.rx_ready {
            return self.tx_ready;
        }
        self.rx_ready = true;
        if self.tx_ready {
            if let Some(producer) = self.producer {
                producer.on_connect();
            }
        }
        self.tx_ready
    }

    /// The producer announces itself. Returns whether the consumer was
    /// already there; if it was, the consumer's `on_connect` fires.
    pub fn connect_tx(&mut self) -> bool {
        if self.tx_ready {
            return self.rx_ready;
        }
        self.tx_ready = true;
        if self.rx_ready {
            if let Some(consumer) = self.consumer {
                consumer.on_connect();
            }
        }
        self.rx_ready
    }
}

/// A stream reachable from both interrupt and task context.
///
/// Task code may block on [`SharedStream::lock`]; interrupt code must use the
/// `try_*` methods, which report contention as [`SmError::WouldBlock`] so the
/// driver can keep its endpoint paused and retry later.
pub struct SharedStream<'a, const N: usize> {
    inner: spin::Mutex<Stream<'a, N>>,
}

impl<'a, const N: usize> Default for SharedStream<'a, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const N: usize> SharedStream<'a, N> {
    pub const fn new() -> Self {
        SharedStream {
            inner: spin::Mutex::new(Stream::new()),
        }
    }

    pub fn lock(&self) -> spin::MutexGuard<'_, Stream<'a, N>> {
        self.inner.lock()
    }

    pub fn try_push(&self, data: &[u8]) -> SmResult<usize> {
        let mut stream = self.inner.try_lock().ok_or(SmError::WouldBlock)?;
        Ok(stream.push(data))
    }

    pub fn try_pop(&self, out: &mut [u8]) -> SmResult<usize> {
        let mut stream = self.inner.try_lock().ok_or(SmError::WouldBlock)?;
        Ok(stream.pop(out))
    }

    pub fn try_free_size(&self) -> SmResult<usize> {
        let stream = self.inner.try_lock().ok_or(SmError::WouldBlock)?;
        Ok(stream.free_size())
    }

    pub fn try_data_size(&self) -> SmResult<usize> {
        let stream = self.inner.try_lock().ok_or(SmError::WouldBlock)?;
        Ok(stream.data_size())
    }
}

/// Listener that turns stream notifications into pending events for one
/// machine.
pub struct EventNotify<'m> {
    mailbox: &'m Mailbox,
    target: SmId,
    transfer: Option<Event>,
    connect: Option<Event>,
}

impl<'m> EventNotify<'m> {
    pub const fn new(
        mailbox: &'m Mailbox,
        target: SmId,
        transfer: Option<Event>,
        connect: Option<Event>,
    ) -> Self {
        EventNotify {
            mailbox,
            target,
            transfer,
            connect,
        }
    }

    fn notify(&self, evt: Option<Event>) {
        if let Some(evt) = evt {
            if let Err(err) = self.mailbox.post_pending(self.target, evt) {
                warn!("stream notification to {} lost: {}", self.target, err);
            }
        }
    }
}

impl StreamListener for EventNotify<'_> {
    fn on_transfer(&self) {
        self.notify(self.transfer);
    }

    fn on_connect(&self) {
        self.notify(self.connect);
    }
}
