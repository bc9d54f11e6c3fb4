//! Dispatch effects bound to the session store and a connection's
//! mutable session-id cell.

use std::sync::{Arc, RwLock};

use agent_relay_core::{PendingQuestion, PermissionDenial, SessionId, SessionStore, ToolActivity};
use agent_relay_events::SessionEffects;

/// Effects context for one connection.
///
/// The session id is read through a shared cell at dispatch time, never
/// captured, so handlers survive a mid-stream rekey without being
/// re-subscribed.
pub(crate) struct ConnEffects {
    store: Arc<SessionStore>,
    cell: Arc<RwLock<SessionId>>,
    /// Delta text appended since the last take; drives flush throttling.
    appended: String,
}

impl ConnEffects {
    pub(crate) fn new(store: Arc<SessionStore>, cell: Arc<RwLock<SessionId>>) -> Self {
        Self {
            store,
            cell,
            appended: String::new(),
        }
    }

    pub(crate) fn current_session(&self) -> SessionId {
        self.cell.read().unwrap().clone()
    }

    /// Take the delta text accumulated since the last call.
    pub(crate) fn take_appended(&mut self) -> String {
        std::mem::take(&mut self.appended)
    }
}

impl SessionEffects for ConnEffects {
    fn append_delta(&mut self, text: &str) {
        let id = self.current_session();
        self.store.append_assistant_delta(&id, text);
        self.appended.push_str(text);
    }

    fn set_running(&mut self) {
        let id = self.current_session();
        self.store.mark_running(&id);
    }

    fn set_activity(&mut self, activity: Option<ToolActivity>) {
        let id = self.current_session();
        self.store.set_activity(&id, activity);
    }

    fn take_activity(&mut self) -> Option<ToolActivity> {
        let id = self.current_session();
        self.store.take_activity(&id)
    }

    fn set_denials(&mut self, denials: Vec<PermissionDenial>) {
        let id = self.current_session();
        self.store.set_denials(&id, denials);
    }

    fn set_pending_question(&mut self, question: PendingQuestion) {
        let id = self.current_session();
        self.store.set_pending_question(&id, question);
    }

    fn rekey(&mut self, new_id: SessionId) {
        let old = self.current_session();
        if old == new_id {
            return;
        }
        self.store.rekey(&old, &new_id);
        *self.cell.write().unwrap() = new_id;
    }

    fn draft(&self) -> String {
        let id = self.current_session();
        self.store
            .transcript(&id)
            .map(|(_, draft)| draft)
            .unwrap_or_default()
    }
}
