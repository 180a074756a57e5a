use std::sync::mpsc as channel;
use std::thread::{Builder, JoinHandle};

use crate::error::Result;

pub const DEFAULT_POOL_CAPACITY: usize = 4;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum WorkerMessage {
    Task(Task),
    Terminate,
}

/// Fixed set of worker threads, each draining its own FIFO queue.
///
/// [`ThreadPool::exec_keyed`] always routes the same key to the same worker,
/// which is how the reactor keeps every connection on a single thread of
/// execution: two readiness events for one token never run concurrently and
/// run in arrival order.
pub struct ThreadPool {
    workers: Vec<Worker>,
    senders: Vec<channel::Sender<WorkerMessage>>,
}

impl ThreadPool {
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        let mut workers = Vec::with_capacity(capacity);
        let mut senders = Vec::with_capacity(capacity);

        for id in 0..capacity {
            let (sender, receiver) = channel::channel::<WorkerMessage>();
            workers.push(Worker::new(id, receiver)?);
            senders.push(sender);
        }

        Ok(Self { workers, senders })
    }

    pub fn exec_keyed<F>(&self, key: usize, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let index = key % self.senders.len();
        Ok(self.senders[index].send(WorkerMessage::Task(Box::new(task)))?)
    }

    pub fn workers_len(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for sender in &self.senders {
            let _ = sender.send(WorkerMessage::Terminate);
        }
        for worker in &mut self.workers {
            if let Some(t) = worker.take_thread() {
                let _ = t.join();
            }
        }
    }
}

struct Worker {
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, receiver: channel::Receiver<WorkerMessage>) -> Result<Self> {
        let thread = Builder::new()
            .name(format!("mill-raw-worker-{id}"))
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        WorkerMessage::Task(task) => task(),
                        WorkerMessage::Terminate => break,
                    }
                }
            })?;

        Ok(Self {
            thread: Some(thread),
        })
    }

    fn take_thread(&mut self) -> Option<JoinHandle<()>> {
        self.thread.take()
    }
}
