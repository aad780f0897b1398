use crate::io::step_queue::StepQueue;
use crate::message::Message;
use parking_lot::RwLock;
use std::collections::BTreeSet;

/// The shared half of a component: its queues and declared tags.
///
/// The router holds an `Arc<Mailbox>` per node and never touches the
/// component itself, so routing runs while the component's task executes.
pub struct Mailbox {
    name: String,
    inbox: StepQueue,
    outbox: StepQueue,
    consumes: RwLock<BTreeSet<String>>,
    produces: RwLock<BTreeSet<String>>,
}

impl Mailbox {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inbox: StepQueue::new(),
            outbox: StepQueue::new(),
            consumes: RwLock::new(BTreeSet::new()),
            produces: RwLock::new(BTreeSet::new()),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn inbox(&self) -> &StepQueue {
        &self.inbox
    }

    #[inline]
    pub fn outbox(&self) -> &StepQueue {
        &self.outbox
    }

    /// Queues a message for the router.
    #[inline]
    pub fn send(&self, msg: Message) {
        self.outbox.push(msg);
    }

    pub fn consumes(&self) -> BTreeSet<String> {
        self.consumes.read().clone()
    }

    pub fn produces(&self) -> BTreeSet<String> {
        self.produces.read().clone()
    }

    pub fn consumes_tag(&self, tag: &str) -> bool {
        self.consumes.read().contains(tag)
    }

    pub fn add_consumes<I, S>(&self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.consumes.write().extend(tags.into_iter().map(Into::into));
    }

    pub fn add_produces<I, S>(&self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.produces.write().extend(tags.into_iter().map(Into::into));
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("name", &self.name)
            .field("inbox", &self.inbox.len())
            .field("outbox", &self.outbox.len())
            .field("consumes", &*self.consumes.read())
            .field("produces", &*self.produces.read())
            .finish()
    }
}
