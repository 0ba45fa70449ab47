//! Event bus: named typed subjects, command events with single-shot
//! completion, and the blocking queue used by every worker loop.

use std::any::{Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{mpsc, Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use log::warn;

/// Command codes understood by every worker.
pub mod command {
    pub const START: i32 = 1;
    pub const STOP: i32 = 2;
    pub const PAUSE: i32 = 3;
    pub const RESUME: i32 = 4;
    pub const READ: i32 = 5;
    pub const WRITE: i32 = 6;
    pub const CONFIGURE: i32 = 7;
    pub const QUERY: i32 = 8;
    pub const CLEAR: i32 = 9;
}

/// Rejection codes shared across workers.
pub mod reject {
    pub const UNKNOWN_COMMAND: i32 = 1;
    pub const TASK_DISABLED: i32 = 2;
    pub const INVALID_CONFIG: i32 = 3;
}

/// Closed value type for event arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    String(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// Outcome delivered to the event originator.
#[derive(Debug, Clone, PartialEq)]
pub enum EventResponse {
    Resolved(Option<String>),
    Rejected { code: i32, message: String },
}

/// A command or status event.
///
/// Exactly one of [`resolve`](Event::resolve) / [`reject`](Event::reject)
/// fires per event; later completions are ignored.
#[derive(Clone)]
pub struct Event {
    pub code: i32,
    args: HashMap<String, Value>,
    responder: Arc<Mutex<Option<SyncSender<EventResponse>>>>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("code", &self.code).field("args", &self.args).finish()
    }
}

impl Event {
    /// Fire-and-forget event without completion tracking.
    pub fn new(code: i32) -> Self {
        Event { code, args: HashMap::new(), responder: Arc::new(Mutex::new(None)) }
    }

    /// Command event: the returned receiver observes resolve/reject.
    pub fn command(code: i32) -> (Self, Receiver<EventResponse>) {
        let (tx, rx) = mpsc::sync_channel(1);
        let event =
            Event { code, args: HashMap::new(), responder: Arc::new(Mutex::new(Some(tx))) };
        (event, rx)
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.args.insert(key.to_owned(), value);
        self
    }

    /// The conventional JSON payload travels under the `data` key.
    pub fn with_data(self, data: impl Into<String>) -> Self {
        self.with("data", Value::String(data.into()))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.args.get(key)
    }

    pub fn data(&self) -> Option<&str> {
        self.get("data").and_then(Value::as_str)
    }

    pub fn resolve(&self, payload: Option<String>) {
        if let Some(tx) = self.responder.lock().unwrap().take() {
            let _ = tx.try_send(EventResponse::Resolved(payload));
        }
    }

    pub fn reject(&self, code: i32, message: impl Into<String>) {
        if let Some(tx) = self.responder.lock().unwrap().take() {
            let _ = tx.try_send(EventResponse::Rejected { code, message: message.into() });
        }
    }
}

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SubjectState<T> {
    handlers: Vec<(u64, Handler<T>)>,
    sticky: Option<T>,
    next_id: u64,
}

/// A named broadcast stream of values of one type.
///
/// Delivery is synchronous on the publisher's thread, in subscription order.
/// Sticky publications are replayed to late subscribers on attach.
pub struct Subject<T> {
    name: String,
    state: Arc<RwLock<SubjectState<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Subject<T> {
    fn new(name: &str) -> Self {
        Subject {
            name: name.to_owned(),
            state: Arc::new(RwLock::new(SubjectState {
                handlers: Vec::new(),
                sticky: None,
                next_id: 0,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach a handler; it stays active until the returned subscription is
    /// dropped. A retained sticky value is delivered immediately.
    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Subscription<T> {
        let handler: Handler<T> = Arc::new(handler);

        let (id, sticky) = {
            let mut state = self.state.write().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            state.handlers.push((id, handler.clone()));
            (id, state.sticky.clone())
        };

        if let Some(value) = sticky {
            handler(&value);
        }

        Subscription { id, state: self.state.clone() }
    }

    pub fn publish(&self, value: T) {
        self.deliver(value, false);
    }

    /// Publish and retain the value for future subscribers.
    pub fn publish_sticky(&self, value: T) {
        self.deliver(value, true);
    }

    fn deliver(&self, value: T, sticky: bool) {
        let handlers: Vec<Handler<T>> = {
            let mut state = self.state.write().unwrap();
            if sticky {
                state.sticky = Some(value.clone());
            }
            state.handlers.iter().map(|(_, h)| h.clone()).collect()
        };
        for handler in handlers {
            handler(&value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.read().unwrap().handlers.len()
    }
}

impl<T> Clone for Subject<T> {
    fn clone(&self) -> Self {
        Subject { name: self.name.clone(), state: self.state.clone() }
    }
}

/// Keeps the associated handler alive; dropping it unsubscribes.
pub struct Subscription<T> {
    id: u64,
    state: Arc<RwLock<SubjectState<T>>>,
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.write() {
            state.handlers.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Process-wide subject registry keyed by `(type, topic name)`.
///
/// Handed to every worker at construction; no global state.
#[derive(Clone, Default)]
pub struct Bus {
    subjects: Arc<Mutex<HashMap<(TypeId, String), Box<dyn Any + Send + Sync>>>>,
}

impl Bus {
    pub fn new() -> Self {
        Bus::default()
    }

    /// Look up or create the subject carrying `T` under `name`.
    pub fn subject<T: Clone + Send + Sync + 'static>(&self, name: &str) -> Subject<T> {
        let key = (TypeId::of::<T>(), name.to_owned());
        let mut subjects = self.subjects.lock().unwrap();
        let entry = subjects.entry(key).or_insert_with(|| Box::new(Subject::<T>::new(name)));
        match entry.downcast_ref::<Subject<T>>() {
            Some(subject) => subject.clone(),
            None => {
                // unreachable: the key embeds the TypeId
                warn!("subject {name} has mismatched type");
                Subject::new(name)
            }
        }
    }
}

/// Bounded-wait FIFO shared between producers and one consumer.
pub struct BlockingQueue<T> {
    inner: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        BlockingQueue { inner: Mutex::new(VecDeque::new()), available: Condvar::new() }
    }

    pub fn add(&self, value: T) {
        self.inner.lock().unwrap().push_back(value);
        self.available.notify_one();
    }

    /// Pop the next value, waiting up to `timeout` when empty. `None` timeout
    /// polls without blocking.
    pub fn get(&self, timeout: Option<Duration>) -> Option<T> {
        let mut queue = self.inner.lock().unwrap();
        if let Some(value) = queue.pop_front() {
            return Some(value);
        }

        let timeout = timeout?;
        let (mut queue, result) =
            self.available.wait_timeout_while(queue, timeout, |q| q.is_empty()).unwrap();
        if result.timed_out() && queue.is_empty() {
            return None;
        }
        queue.pop_front()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        BlockingQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subjects_are_shared_by_name() {
        let bus = Bus::new();
        let a = bus.subject::<i32>("test.topic");
        let b = bus.subject::<i32>("test.topic");

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let _sub = a.subscribe(move |v| {
            seen2.fetch_add(*v as usize, Ordering::SeqCst);
        });

        b.publish(5);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn delivery_follows_subscription_order() {
        let bus = Bus::new();
        let subject = bus.subject::<u32>("ordered");

        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let _s1 = subject.subscribe(move |_| o1.lock().unwrap().push(1));
        let _s2 = subject.subscribe(move |_| o2.lock().unwrap().push(2));

        subject.publish(0);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn sticky_value_reaches_late_subscriber() {
        let bus = Bus::new();
        let subject = bus.subject::<String>("status");

        subject.publish_sticky("streaming".to_owned());

        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let _sub = subject.subscribe(move |v: &String| {
            *seen2.lock().unwrap() = Some(v.clone());
        });

        assert_eq!(seen.lock().unwrap().as_deref(), Some("streaming"));
    }

    #[test]
    fn dropping_subscription_detaches_handler() {
        let bus = Bus::new();
        let subject = bus.subject::<i32>("detach");

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let sub = subject.subscribe(move |_| {
            seen2.fetch_add(1, Ordering::SeqCst);
        });
        subject.publish(1);
        drop(sub);
        subject.publish(2);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(subject.subscriber_count(), 0);
    }

    #[test]
    fn event_resolves_exactly_once() {
        let (event, rx) = Event::command(command::START);
        event.resolve(Some("ok".to_owned()));
        event.reject(1, "late");

        assert_eq!(rx.recv().unwrap(), EventResponse::Resolved(Some("ok".to_owned())));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn event_reject_carries_code_and_message() {
        let (event, rx) = Event::command(command::WRITE);
        event.reject(7, "missing file name");
        assert_eq!(
            rx.recv().unwrap(),
            EventResponse::Rejected { code: 7, message: "missing file name".to_owned() }
        );
    }

    #[test]
    fn blocking_queue_timeout() {
        let queue: BlockingQueue<u8> = BlockingQueue::new();
        assert_eq!(queue.get(Some(Duration::from_millis(10))), None);

        queue.add(1);
        queue.add(2);
        assert_eq!(queue.get(None), Some(1));
        assert_eq!(queue.len(), 1);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn blocking_queue_wakes_waiting_consumer() {
        let queue: Arc<BlockingQueue<u8>> = Arc::new(BlockingQueue::new());
        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.add(9);
        });
        assert_eq!(queue.get(Some(Duration::from_secs(2))), Some(9));
        handle.join().unwrap();
    }
}
