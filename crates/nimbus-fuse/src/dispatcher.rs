//! Forwards the client's node events to the inode and file layers.
//!
//! The dispatcher is the only observer registered with the client. Batches
//! are queued as they arrive and applied in order on one `node-events`
//! thread: first to the [`InodeDB`], then to the [`FileService`]. Whatever
//! thread the client emits on only pays for a channel send.

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use nimbus_core::{Client, NodeEventObserver, NodeEventQueue, ObserverId};
use nimbus_file_service::FileService;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info_span, trace};

use crate::inode_db::InodeDB;

enum Message {
    Events(NodeEventQueue),
    /// Answered once every batch queued before it has been applied.
    Sync(Sender<()>),
}

pub(crate) struct NodeEventDispatcher {
    client: Arc<dyn Client>,
    sender: Mutex<Option<Sender<Message>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    observer: Mutex<Option<ObserverId>>,
}

impl NodeEventDispatcher {
    /// Starts the dispatch thread and registers with `client`.
    pub(crate) fn start(
        client: Arc<dyn Client>,
        inode_db: Arc<InodeDB>,
        file_service: Arc<FileService>,
    ) -> Arc<Self> {
        let (tx, rx) = unbounded();
        let thread = thread::Builder::new()
            .name("node-events".to_string())
            .spawn(move || dispatch(&rx, &inode_db, &file_service))
            .expect("failed to spawn node event thread");

        let dispatcher = Arc::new(Self {
            client: Arc::clone(&client),
            sender: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
            observer: Mutex::new(None),
        });
        let observer: Arc<dyn NodeEventObserver> = Arc::<Self>::clone(&dispatcher);
        *dispatcher.observer.lock() = Some(client.add_event_observer(Arc::downgrade(&observer)));
        dispatcher
    }

    /// Blocks until every batch received so far has been applied.
    pub(crate) fn sync(&self) {
        let (tx, rx) = bounded(1);
        let sent = self
            .sender
            .lock()
            .as_ref()
            .is_some_and(|sender| sender.send(Message::Sync(tx)).is_ok());
        if sent {
            let _ = rx.recv();
        }
    }

    /// Unregisters from the client and waits for queued batches to drain.
    pub(crate) fn stop(&self) {
        if let Some(id) = self.observer.lock().take() {
            self.client.remove_event_observer(id);
        }
        drop(self.sender.lock().take());
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl NodeEventObserver for NodeEventDispatcher {
    fn updated(&self, events: &NodeEventQueue) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(Message::Events(events.clone()));
        }
    }
}

impl Drop for NodeEventDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch(rx: &Receiver<Message>, inode_db: &InodeDB, file_service: &FileService) {
    let span = info_span!("node_events");
    let _entered = span.enter();
    debug!("Node event dispatch started");

    for message in rx {
        match message {
            Message::Events(events) => {
                trace!(events = events.len(), "Dispatching node events");
                inode_db.apply(&events);
                file_service.apply(&events);
            }
            Message::Sync(done) => {
                let _ = done.send(());
            }
        }
    }

    debug!("Node event dispatch stopped");
}
