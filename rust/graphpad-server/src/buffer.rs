//! Per-room command coalescing.
//!
//! Commands accumulate briefly so bursts broadcast as one batch: a full
//! buffer flushes immediately, otherwise a one-shot timer flushes
//! `buffer_ms` after the first pending command. Flushes sort by client
//! timestamp; the sort is stable so ties keep arrival order.

use std::sync::{Arc, Weak};
use std::time::Duration;

use graphpad_proto::Command;
use parking_lot::Mutex;

use crate::sched::{TimerHandle, safe_timeout};

pub struct CommandBuffer {
    buffer_ms: u64,
    max_batch: usize,
    on_flush: Box<dyn Fn(Vec<Command>) + Send + Sync>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    pending: Vec<Command>,
    timer: Option<TimerHandle>,
}

impl CommandBuffer {
    pub fn new(
        buffer_ms: u64,
        max_batch: usize,
        on_flush: impl Fn(Vec<Command>) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            buffer_ms,
            max_batch,
            on_flush: Box::new(on_flush),
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn add_command(self: &Arc<Self>, command: Command) {
        let flush_now = {
            let mut inner = self.inner.lock();
            inner.pending.push(command);
            if inner.pending.len() >= self.max_batch {
                true
            } else {
                if inner.timer.is_none() {
                    inner.timer = Some(self.schedule_flush());
                }
                false
            }
        };
        if flush_now {
            self.flush();
        }
    }

    pub fn add_commands(self: &Arc<Self>, commands: Vec<Command>) {
        for command in commands {
            self.add_command(command);
        }
    }

    fn schedule_flush(self: &Arc<Self>) -> TimerHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        safe_timeout(
            "command-buffer-flush",
            Duration::from_millis(self.buffer_ms),
            move || {
                if let Some(buffer) = weak.upgrade() {
                    buffer.flush();
                }
                Ok(())
            },
        )
    }

    /// Drain, sort by timestamp, hand to the flush callback. Empty buffers
    /// flush to nothing.
    pub fn flush(&self) {
        let mut batch = {
            let mut inner = self.inner.lock();
            inner.timer = None;
            std::mem::take(&mut inner.pending)
        };
        if batch.is_empty() {
            return;
        }
        batch.sort_by_key(|c| c.timestamp);
        (self.on_flush)(batch);
    }

    /// Drop pending commands without flushing.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock();
        inner.timer = None;
        inner.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }
}
