//! RemoteDocument<T> — an observable `Option<T>` mirroring one remote document.
//!
//! Each document snapshot replaces the local value and fires
//! `MODIFY(old, new)`, where either side may be absent. Registering a
//! listener after the first snapshot replays `MODIFY(current, current)`.
//! Local edits made with [`RemoteDocument::set_data`] fire nothing; they reach
//! the store with [`RemoteDocument::commit`] and come back through the feed.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::{
    error::{PtkitError, Result},
    mailbox::Mailbox,
    reactive::{
        change::{Change, ChangeKind},
        event_bus::{EventBus, ListenerFn},
        Element,
    },
};

use super::types::{Decoder, DocumentFeed, DocumentRef, DocumentSnapshot, RemoteStore};

/// Configuration for [`RemoteDocument`].
pub struct RemoteDocumentOptions<T> {
    pub store: Arc<dyn RemoteStore>,
    pub document: DocumentRef,
    pub decoder: Decoder<T>,
    pub prepare: Option<Arc<dyn Fn(T) -> T + Send + Sync>>,
}

struct DocumentState<T> {
    name: Arc<str>,
    data: Option<T>,
    initialized: bool,
    published: Arc<RwLock<Option<T>>>,
    bus: EventBus<Change<T>>,
}

impl<T: Element> DocumentState<T> {
    fn replace(&mut self, data: Option<T>) -> Option<T> {
        let old = std::mem::replace(&mut self.data, data);
        *self.published.write() = self.data.clone();
        old
    }

    fn receive(&mut self, data: Option<T>) {
        let old = self.replace(data);
        self.initialized = true;
        let change = Change {
            kind: ChangeKind::Modify,
            before: old,
            after: self.data.clone(),
        };
        tracing::debug!(document = %self.name, "document updated");
        self.bus.dispatch(&change);
    }

    fn register(&mut self, name: String, callback: Box<ListenerFn<Change<T>>>) {
        let bootstrap = self.initialized.then(|| Change {
            kind: ChangeKind::Modify,
            before: self.data.clone(),
            after: self.data.clone(),
        });
        self.bus.register_with(name, callback, bootstrap);
    }

    fn clean(&mut self) {
        self.bus.clear();
        self.replace(None);
        self.initialized = false;
    }
}

pub struct RemoteDocument<T: Element> {
    name: Arc<str>,
    store: Arc<dyn RemoteStore>,
    document: DocumentRef,
    decoder: Decoder<T>,
    prepare: Option<Arc<dyn Fn(T) -> T + Send + Sync>>,
    published: Arc<RwLock<Option<T>>>,
    mailbox: Mailbox<DocumentState<T>>,
    subscription: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Element> RemoteDocument<T> {
    /// # Panics
    /// Panics when called outside a Tokio runtime.
    pub fn new(name: impl Into<String>, options: RemoteDocumentOptions<T>) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let published = Arc::new(RwLock::new(None));
        let state = DocumentState {
            name: Arc::clone(&name),
            data: None,
            initialized: false,
            published: Arc::clone(&published),
            bus: EventBus::new(Arc::clone(&name)),
        };
        Self {
            mailbox: Mailbox::spawn(Arc::clone(&name), state),
            name,
            store: options.store,
            document: options.document,
            decoder: options.decoder,
            prepare: options.prepare,
            published,
            subscription: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn document(&self) -> &DocumentRef {
        &self.document
    }

    /// The current local value.
    pub fn data(&self) -> Option<T> {
        self.published.read().clone()
    }

    /// Replace the local value without notifying listeners.
    pub async fn set_data(&self, data: Option<T>) -> Result<()> {
        self.mailbox
            .call(move |state| {
                state.replace(data);
            })
            .await
    }

    pub fn register_listener(
        &self,
        name: impl Into<String>,
        callback: impl Fn(&Change<T>) + Send + Sync + 'static,
    ) -> Result<()> {
        let name = name.into();
        let callback: Box<ListenerFn<Change<T>>> = Box::new(callback);
        self.mailbox.post(move |state| state.register(name, callback))
    }

    pub fn remove_listener(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.mailbox.post(move |state| {
            state.bus.remove(&name);
        })
    }

    pub async fn flush(&self) -> Result<()> {
        self.mailbox.call(|_| ()).await
    }

    // -----------------------------------------------------------------------
    // Subscription lifecycle
    // -----------------------------------------------------------------------

    pub async fn subscribe(&self) -> Result<()> {
        if self.is_subscribed() {
            tracing::warn!(document = %self.name, "already subscribed");
            return Ok(());
        }

        let feed = self
            .store
            .subscribe_document(&self.document)
            .await
            .map_err(|e| {
                tracing::error!(document = %self.document.path(), error = %e, "failed to subscribe to document");
                e
            })?;

        let mut slot = self.subscription.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        *slot = Some(tokio::spawn(follow(
            Arc::clone(&self.name),
            self.mailbox.clone(),
            Arc::clone(&self.decoder),
            self.prepare.clone(),
            feed,
        )));
        Ok(())
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn unsubscribe(&self) {
        if let Some(handle) = self.subscription.lock().take() {
            handle.abort();
        }
    }

    /// Unsubscribe, clear the local value and drop all listeners.
    pub async fn clean(&self) -> Result<()> {
        self.unsubscribe();
        self.mailbox.call(DocumentState::clean).await
    }
}

impl<T: Element + Serialize> RemoteDocument<T> {
    /// Write the local value to the store (`merge` overwrites only its fields).
    ///
    /// # Errors
    /// [`PtkitError::NullCommit`] when there is no local value.
    pub async fn commit(&self, merge: bool) -> Result<()> {
        let Some(data) = self.data() else {
            tracing::error!(document = %self.document.path(), "committing null object");
            return Err(PtkitError::NullCommit);
        };
        let record = serde_json::to_value(&data)?;
        match self
            .store
            .set_record(&self.document.collection, &self.document.id, record, merge)
            .await
        {
            Ok(()) => {
                tracing::debug!(document = %self.document.path(), "successfully committed object");
                Ok(())
            }
            Err(e) => {
                tracing::error!(document = %self.document.path(), error = %e, "error committing object");
                Err(e.into())
            }
        }
    }
}

impl<T: Element> fmt::Debug for RemoteDocument<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteDocument")
            .field("document", &self.document)
            .field("data", &self.data())
            .finish()
    }
}

async fn follow<T: Element>(
    name: Arc<str>,
    mailbox: Mailbox<DocumentState<T>>,
    decoder: Decoder<T>,
    prepare: Option<Arc<dyn Fn(T) -> T + Send + Sync>>,
    mut feed: DocumentFeed,
) {
    while let Some(item) = feed.recv().await {
        let DocumentSnapshot { id, data } = match item {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(document = %name, error = %e, "error listening to document, updates halted until re-subscribed");
                return;
            }
        };

        let data = match data.map(|raw| decoder(&id, &raw)).transpose() {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(document = %name, error = %e, "error decoding document, skipping");
                continue;
            }
        };
        let data = match (&prepare, data) {
            (Some(prepare), Some(d)) => Some(prepare(d)),
            (_, data) => data,
        };

        if mailbox.call(move |state| state.receive(data)).await.is_err() {
            return;
        }
    }
}
