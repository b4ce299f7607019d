// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cooperative scheduling surface. Kernel paths never preempt each
//! other; they suspend at the yield points below and are woken through
//! the per-task flags. The context switch itself lives outside the
//! substrate; this module tracks the state those switch points consume.

extern crate alloc;

use crate::hypervisor::TaskServices;

use alloc::collections::BTreeMap;
use alloc::string::String;

pub type TaskId = u64;

#[derive(Debug, Default)]
pub struct TaskControl {
    pub name: String,
    /// Task parked until a message or interrupt arrives.
    pub message_waiting: bool,
    pub interruptible: bool,
    pub interrupt_received: bool,
}

#[derive(Debug)]
pub struct TaskSystem {
    tasks: BTreeMap<TaskId, TaskControl>,
    current: TaskId,
    next_id: TaskId,
    yield_count: u64,
}

impl Default for TaskSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSystem {
    pub fn new() -> Self {
        let mut tasks = BTreeMap::new();
        tasks.insert(
            1,
            TaskControl {
                name: String::from("kernel"),
                ..TaskControl::default()
            },
        );
        Self {
            tasks,
            current: 1,
            next_id: 2,
            yield_count: 0,
        }
    }

    pub fn create_task(&mut self, name: &str) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        self.tasks.insert(
            id,
            TaskControl {
                name: String::from(name),
                ..TaskControl::default()
            },
        );
        log::debug!("task {} created: {}", id, name);
        id
    }

    pub fn current_task(&self) -> TaskId {
        self.current
    }

    pub fn yield_count(&self) -> u64 {
        self.yield_count
    }

    /// Cooperative yield point. A task that flagged itself message
    /// waiting stays parked until a wake-up arrives.
    pub fn task_yield(&mut self) {
        self.yield_count += 1;
    }

    pub fn set_message_waiting(&mut self) {
        if let Some(task) = self.tasks.get_mut(&self.current) {
            task.message_waiting = true;
        }
    }

    pub fn set_interruptible(&mut self) {
        if let Some(task) = self.tasks.get_mut(&self.current) {
            task.interruptible = true;
        }
    }

    /// Wake-up delivered by an interrupt handler or a completing
    /// service: clears the waiting state of the target task.
    pub fn set_interrupt_received(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.interrupt_received = true;
            task.message_waiting = false;
        }
    }

    pub fn is_message_waiting(&self, id: TaskId) -> bool {
        self.tasks.get(&id).map(|t| t.message_waiting).unwrap_or(false)
    }

    pub fn take_interrupt_received(&mut self, id: TaskId) -> bool {
        match self.tasks.get_mut(&id) {
            Some(task) => core::mem::take(&mut task.interrupt_received),
            None => false,
        }
    }

    pub fn switch_to(&mut self, id: TaskId) {
        if self.tasks.contains_key(&id) {
            self.current = id;
        }
    }

    pub fn end_task(&mut self, id: TaskId) {
        self.tasks.remove(&id);
        if self.current == id {
            self.current = 1;
        }
    }
}

impl TaskServices for TaskSystem {
    fn task_yield(&mut self) {
        TaskSystem::task_yield(self);
    }

    fn set_message_waiting(&mut self) {
        TaskSystem::set_message_waiting(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wakeup_clears_waiting() {
        let mut tasks = TaskSystem::new();
        let worker = tasks.create_task("worker");

        tasks.switch_to(worker);
        tasks.set_message_waiting();
        tasks.task_yield();
        assert!(tasks.is_message_waiting(worker));

        tasks.set_interrupt_received(worker);
        assert!(!tasks.is_message_waiting(worker));
        assert!(tasks.take_interrupt_received(worker));
        assert!(!tasks.take_interrupt_received(worker));
    }

    #[test]
    fn test_end_task_falls_back_to_kernel() {
        let mut tasks = TaskSystem::new();
        let worker = tasks.create_task("worker");
        tasks.switch_to(worker);
        tasks.end_task(worker);
        assert_eq!(tasks.current_task(), 1);
    }
}
