//! Module kernel and FIFO message bus.
//!
//! Modules are registered in a fixed load order at daemon startup instead
//! of being `dlopen`ed; every module's `handle` is consulted in ascending
//! load-priority order for each dispatched message. Draining is
//! reentrant-safe: a handler that enqueues a follow-up message never
//! recurses into any `handle` call, since follow-ups land in a side buffer
//! that is only appended to the main queue once the whole module list has
//! been walked for the current message.

use crate::message::Message;
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, trace};

/// Implemented by every module that observes bus traffic.
pub trait Module: Send {
    /// Name used in logs and for [`Bus::unload`].
    fn name(&self) -> &str;

    /// Handle one message. Implementations that aren't interested in a
    /// given `msg.kind()` should simply return.
    fn handle(&mut self, msg: &Message, ctx: &mut BusContext<'_>);
}

/// Handle passed to a module's `handle` so it can enqueue follow-up
/// messages without re-entering the bus.
pub struct BusContext<'a> {
    outgoing: &'a mut VecDeque<Message>,
}

impl<'a> BusContext<'a> {
    /// Build a context around a caller-owned outgoing buffer. Used by the
    /// bus itself during dispatch, and by other crates' module tests that
    /// need a `BusContext` without spinning up a whole [`Bus`].
    pub fn new(outgoing: &'a mut VecDeque<Message>) -> Self {
        Self { outgoing }
    }

    /// Enqueue a message to be dispatched after the current one finishes
    /// being handled by every module.
    pub fn send(&mut self, msg: Message) {
        self.outgoing.push_back(msg);
    }
}

struct ModuleSlot {
    priority: i32,
    module: Box<dyn Module>,
}

/// Wraps a module behind an `Arc<Mutex<_>>` so the same instance can be
/// both loaded into the [`Bus`] (as a `Box<dyn Module>`) and held elsewhere
/// (e.g. `dsme-daemon::diagnostics`) for out-of-band reads of its state.
pub struct SharedModule<T> {
    name: String,
    inner: std::sync::Arc<std::sync::Mutex<T>>,
}

impl<T> SharedModule<T> {
    /// Wrap `inner` for loading into a [`Bus`] under `name`.
    #[must_use]
    pub fn new(name: impl Into<String>, inner: std::sync::Arc<std::sync::Mutex<T>>) -> Self {
        Self { name: name.into(), inner }
    }
}

impl<T: Module + Send + 'static> Module for SharedModule<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&mut self, msg: &Message, ctx: &mut BusContext<'_>) {
        self.inner.lock().unwrap().handle(msg, ctx);
    }
}

/// The module kernel: an ordered module registry plus a FIFO message
/// queue, fed either locally via [`Bus::post`] or from other threads via
/// the cloneable [`Bus::sender`] handle (used by the socket server and the
/// hardware watchdog kicker thread).
pub struct Bus {
    modules: Vec<ModuleSlot>,
    queue: VecDeque<Message>,
    sender: Sender<Message>,
    receiver: Receiver<Message>,
}

impl Bus {
    /// Create an empty bus with no modules loaded.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            modules: Vec::new(),
            queue: VecDeque::new(),
            sender,
            receiver,
        }
    }

    /// A cloneable handle other threads can use to inject messages.
    #[must_use]
    pub fn sender(&self) -> Sender<Message> {
        self.sender.clone()
    }

    /// Register a module. Modules are consulted in ascending `priority`
    /// order; ties preserve registration order.
    pub fn load(&mut self, priority: i32, module: Box<dyn Module>) {
        debug!(module = module.name(), priority, "loading module");
        self.modules.push(ModuleSlot { priority, module });
        self.modules.sort_by_key(|slot| slot.priority);
    }

    /// Remove a module by name.
    pub fn unload(&mut self, name: &str) {
        self.modules.retain(|slot| slot.module.name() != name);
    }

    /// Enqueue a message from within the owning thread.
    pub fn post(&mut self, msg: Message) {
        self.queue.push_back(msg);
    }

    /// Pull any messages sent from other threads into the local FIFO queue
    /// without blocking.
    pub fn drain_external(&mut self) {
        while let Ok(msg) = self.receiver.try_recv() {
            self.queue.push_back(msg);
        }
    }

    /// Dispatch every message currently queued, including messages handlers
    /// enqueue in response, until the queue is empty.
    pub fn dispatch_pending(&mut self) {
        self.dispatch_pending_with_sink(|_| {});
    }

    /// Like [`Bus::dispatch_pending`], but calls `sink` once for every
    /// message as it comes off the queue, before any module sees it. Lets a
    /// caller (the control socket server) observe bus traffic for relay
    /// without modules needing direct socket access.
    pub fn dispatch_pending_with_sink(&mut self, mut sink: impl FnMut(&Message)) {
        while let Some(msg) = self.queue.pop_front() {
            trace!(kind = ?msg.kind(), "dispatching message");
            sink(&msg);
            let mut outgoing = VecDeque::new();
            for slot in &mut self.modules {
                let mut ctx = BusContext { outgoing: &mut outgoing };
                slot.module.handle(&msg, &mut ctx);
            }
            self.queue.append(&mut outgoing);
        }
    }

    /// Number of modules currently loaded.
    #[must_use]
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Module for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn handle(&mut self, _msg: &Message, _ctx: &mut BusContext<'_>) {
            self.log.lock().unwrap().push(self.name);
        }
    }

    #[test]
    fn dispatch_order_follows_priority() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = Bus::new();
        bus.load(20, Box::new(Recorder { name: "late", log: log.clone() }));
        bus.load(10, Box::new(Recorder { name: "early", log: log.clone() }));

        bus.post(Message::RebootReq);
        bus.dispatch_pending();

        assert_eq!(*log.lock().unwrap(), vec!["early", "late"]);
    }

    struct Chainer {
        fired: Arc<Mutex<u32>>,
    }

    impl Module for Chainer {
        fn name(&self) -> &str {
            "chainer"
        }

        fn handle(&mut self, msg: &Message, ctx: &mut BusContext<'_>) {
            let mut count = self.fired.lock().unwrap();
            *count += 1;
            if matches!(msg, Message::RebootReq) && *count == 1 {
                ctx.send(Message::ShutdownReq);
            }
        }
    }

    #[test]
    fn enqueued_followups_drain_without_recursion() {
        let fired = Arc::new(Mutex::new(0));
        let mut bus = Bus::new();
        bus.load(0, Box::new(Chainer { fired: fired.clone() }));

        bus.post(Message::RebootReq);
        bus.dispatch_pending();

        assert_eq!(*fired.lock().unwrap(), 2);
    }

    #[test]
    fn external_sender_feeds_queue() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = Bus::new();
        bus.load(0, Box::new(Recorder { name: "only", log: log.clone() }));

        let tx = bus.sender();
        tx.send(Message::BatteryEmpty).unwrap();

        bus.drain_external();
        bus.dispatch_pending();

        assert_eq!(*log.lock().unwrap(), vec!["only"]);
    }

    #[test]
    fn unload_removes_module() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = Bus::new();
        bus.load(0, Box::new(Recorder { name: "gone", log: log.clone() }));
        bus.unload("gone");
        assert_eq!(bus.module_count(), 0);
    }

    #[test]
    fn shared_module_is_visible_to_bus_and_external_holder() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let shared = Arc::new(Mutex::new(Recorder { name: "shared", log: log.clone() }));

        let mut bus = Bus::new();
        bus.load(0, Box::new(SharedModule::new("shared", shared.clone())));

        bus.post(Message::RebootReq);
        bus.dispatch_pending();

        assert_eq!(*log.lock().unwrap(), vec!["shared"]);
        assert_eq!(shared.lock().unwrap().name, "shared");
    }
}
