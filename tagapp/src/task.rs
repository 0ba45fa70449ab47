//! Shared plumbing for worker tasks: each task owns a `{topic}.status`
//! subject for sticky status events and a `{topic}.command` subject whose
//! events are funnelled into a blocking queue for the worker loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::info;
use serde_json::Value as Json;

use crate::event::{Bus, Event, Subject, Subscription};
use crate::event::BlockingQueue;

pub struct TaskContext {
    name: String,
    status_subject: Subject<Event>,
    command_queue: Arc<BlockingQueue<Event>>,
    _command_subscription: Subscription<Event>,
    last_status: Mutex<Option<Json>>,
}

impl TaskContext {
    pub fn new(bus: &Bus, name: &str, topic: &str) -> Self {
        let status_subject = bus.subject::<Event>(&format!("{topic}.status"));
        let command_subject = bus.subject::<Event>(&format!("{topic}.command"));

        let command_queue = Arc::new(BlockingQueue::new());
        let queue = command_queue.clone();
        let command_subscription = command_subject.subscribe(move |event: &Event| {
            queue.add(event.clone());
        });

        TaskContext {
            name: name.to_owned(),
            status_subject,
            command_queue,
            _command_subscription: command_subscription,
            last_status: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pop the next pending command, waiting up to `timeout`.
    pub fn next_command(&self, timeout: Option<Duration>) -> Option<Event> {
        self.command_queue.get(timeout)
    }

    /// Publish a sticky status event carrying `data` as its JSON payload.
    pub fn update_status(&self, code: i32, data: Json) {
        {
            let mut last = self.last_status.lock().unwrap();
            if last.as_ref() != Some(&data) {
                info!("{} status update: {data}", self.name);
                *last = Some(data.clone());
            }
        }

        self.status_subject.publish_sticky(Event::new(code).with_data(data.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::command;

    #[test]
    fn commands_flow_into_queue() {
        let bus = Bus::new();
        let task = TaskContext::new(&bus, "worker.Test", "test");

        bus.subject::<Event>("test.command").publish(Event::new(command::QUERY));

        let event = task.next_command(Some(Duration::from_millis(100))).expect("command");
        assert_eq!(event.code, command::QUERY);
    }

    #[test]
    fn status_is_sticky_for_late_subscribers() {
        let bus = Bus::new();
        let task = TaskContext::new(&bus, "worker.Test", "test2");

        task.update_status(1, serde_json::json!({"status": "idle"}));

        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        let _sub = bus.subject::<Event>("test2.status").subscribe(move |e: &Event| {
            *seen2.lock().unwrap() = e.data().map(str::to_owned);
        });

        let payload = seen.lock().unwrap().clone().expect("sticky status");
        assert!(payload.contains("idle"));
    }
}
