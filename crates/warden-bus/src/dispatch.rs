//! Protected credential-listener dispatch.
//!
//! Credential listeners are user-supplied and may be swapped or removed
//! while the transport has requests in flight. This module is the
//! indirection that makes that safe:
//!
//! - Every inbound call checks the listener out under a reference count and
//!   checks it back in on completion — including when the calling future is
//!   dropped. [`ProtectedListenerDispatch::set_listener`] first clears the
//!   active listener (so no *new* request sees it), force-rejects that
//!   listener's pending deferred requests, then waits for the count to drain
//!   before installing the replacement. No request ever observes a
//!   half-swapped listener.
//! - Deferred requests park a one-shot completion channel in the dispatch's
//!   own [`PendingRegistry`], keyed by the opaque token handed to the
//!   listener. The original caller waits on that channel with a fixed bound
//!   (two minutes); a request that times out or is torn down resolves as
//!   rejected credentials, never as a hang or a crash.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lock_ladder::{LockLevel, OrderedMutex};
use tokio::sync::{oneshot, Notify};
use tracing::debug;

use crate::attachment::AuthMechanism;
use crate::credentials::{
    CompletionToken, CredentialListener, CredentialQuery, CredentialReply, Credentials,
};
use crate::error::BusError;

/// How long a deferred credential request may stay unanswered.
pub const ASYNC_AUTH_TIMEOUT: Duration = Duration::from_secs(120);

/// Lock level of the listener checkout state.
const STATE_LEVEL: LockLevel = LockLevel::Rung(10);
/// Lock level of the pending-request registry. Acquired after (never inside)
/// the state lock.
const REGISTRY_LEVEL: LockLevel = LockLevel::Rung(20);

#[derive(Default)]
struct ListenerState {
    listener: Option<Arc<dyn CredentialListener>>,
    refcount: usize,
}

/// Registry of outstanding deferred requests, owned by one dispatch.
pub(crate) struct PendingRegistry {
    pending: OrderedMutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
}

struct Pending {
    listener: Arc<dyn CredentialListener>,
    sender: oneshot::Sender<CredentialReply>,
}

impl PendingRegistry {
    fn new() -> Self {
        Self {
            pending: OrderedMutex::new("dispatch-registry", REGISTRY_LEVEL, HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn register(
        &self,
        listener: Arc<dyn CredentialListener>,
    ) -> (u64, oneshot::Receiver<CredentialReply>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.pending
            .lock()
            .insert(id, Pending { listener, sender });
        (id, receiver)
    }

    /// Resolves a pending request. Returns `false` when it is no longer
    /// pending.
    pub(crate) fn complete(&self, id: u64, reply: CredentialReply) -> bool {
        let entry = self.pending.lock().remove(&id);
        match entry {
            Some(pending) => pending.sender.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drops a request the caller has given up on.
    fn discard(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    /// Force-rejects every pending request registered for `listener`,
    /// waking each blocked caller.
    fn reject_all_for(&self, listener: &Arc<dyn CredentialListener>) {
        let mut removed = Vec::new();
        {
            let mut pending = self.pending.lock();
            let dead: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| Arc::ptr_eq(&p.listener, listener))
                .map(|(id, _)| *id)
                .collect();
            for id in dead {
                if let Some(entry) = pending.remove(&id) {
                    removed.push(entry);
                }
            }
        }
        for entry in removed {
            // A dropped receiver means the caller already gave up; fine.
            let _ = entry.sender.send(CredentialReply::Rejected);
        }
    }

    fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Reference-counted front for the active [`CredentialListener`].
pub struct ProtectedListenerDispatch {
    state: OrderedMutex<ListenerState>,
    drained: Notify,
    registry: Arc<PendingRegistry>,
    timeout: Duration,
}

impl ProtectedListenerDispatch {
    /// Creates a dispatch with no listener and the standard two-minute
    /// deferred-request bound.
    pub fn new() -> Self {
        Self::with_timeout(ASYNC_AUTH_TIMEOUT)
    }

    /// Creates a dispatch with a custom deferred-request bound. Meant for
    /// tests; production uses [`ASYNC_AUTH_TIMEOUT`].
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            state: OrderedMutex::new("dispatch-state", STATE_LEVEL, ListenerState::default()),
            drained: Notify::new(),
            registry: Arc::new(PendingRegistry::new()),
            timeout,
        }
    }

    /// Installs `listener` as the active listener (or clears it with
    /// `None`).
    ///
    /// Does not return until every in-flight call against the previous
    /// listener has completed or been force-rejected — the previous
    /// listener may be dropped safely once this returns.
    pub async fn set_listener(&self, listener: Option<Arc<dyn CredentialListener>>) {
        let old = {
            let mut state = self.state.lock();
            state.listener.take()
        };
        if let Some(old) = old {
            self.registry.reject_all_for(&old);
        }
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().refcount == 0 {
                break;
            }
            notified.await;
        }
        self.state.lock().listener = listener;
    }

    /// Number of deferred requests currently parked. Test hook.
    pub fn pending_requests(&self) -> usize {
        self.registry.len()
    }

    /// Asks the active listener for credentials.
    ///
    /// Tries the deferred variant first; a listener that does not implement
    /// it is called immediately instead. No listener, a timeout, or a
    /// teardown all resolve as [`CredentialReply::Rejected`].
    pub async fn request_credentials(&self, query: &CredentialQuery) -> CredentialReply {
        let Some((listener, _guard)) = self.checkout() else {
            return CredentialReply::Rejected;
        };
        let (id, receiver) = self.registry.register(Arc::clone(&listener));
        let token = CompletionToken {
            id,
            registry: Arc::downgrade(&self.registry),
        };
        match listener.request_credentials_deferred(query, token) {
            Ok(()) => self.await_reply(id, receiver).await,
            Err(_) => {
                self.registry.discard(id);
                listener.request_credentials(query)
            }
        }
    }

    /// Asks the active listener to verify peer-supplied credentials.
    pub async fn verify_credentials(&self, peer: &str, credentials: &Credentials) -> bool {
        let Some((listener, _guard)) = self.checkout() else {
            return false;
        };
        let (id, receiver) = self.registry.register(Arc::clone(&listener));
        let token = CompletionToken {
            id,
            registry: Arc::downgrade(&self.registry),
        };
        match listener.verify_credentials_deferred(peer, credentials, token) {
            Ok(()) => self.await_reply(id, receiver).await.is_granted(),
            Err(_) => {
                self.registry.discard(id);
                listener.verify_credentials(peer, credentials)
            }
        }
    }

    /// Forwards an authentication-complete notification.
    pub fn authentication_complete(&self, mechanism: AuthMechanism, peer: &str, success: bool) {
        if let Some((listener, _guard)) = self.checkout() {
            listener.authentication_complete(mechanism, peer, success);
        }
    }

    /// Forwards a security-violation notification.
    pub fn security_violation(&self, error: &BusError) {
        if let Some((listener, _guard)) = self.checkout() {
            listener.security_violation(error);
        }
    }

    async fn await_reply(
        &self,
        id: u64,
        receiver: oneshot::Receiver<CredentialReply>,
    ) -> CredentialReply {
        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                // Sender dropped without completing: registry torn down.
                CredentialReply::Rejected
            }
            Err(_) => {
                debug!(id, "deferred credential request timed out");
                self.registry.discard(id);
                CredentialReply::Rejected
            }
        }
    }

    fn checkout(&self) -> Option<(Arc<dyn CredentialListener>, CheckoutGuard<'_>)> {
        let mut state = self.state.lock();
        let listener = state.listener.clone()?;
        state.refcount += 1;
        Some((listener, CheckoutGuard { dispatch: self }))
    }
}

impl Default for ProtectedListenerDispatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks the listener back in, even when the requesting future is dropped
/// mid-wait.
struct CheckoutGuard<'a> {
    dispatch: &'a ProtectedListenerDispatch,
}

impl Drop for CheckoutGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.dispatch.state.lock();
        state.refcount -= 1;
        let drained = state.refcount == 0;
        drop(state);
        if drained {
            self.dispatch.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::attachment::AuthMechanism;

    fn query() -> CredentialQuery {
        CredentialQuery {
            mechanism: AuthMechanism::EcdheSpeke,
            peer: ":1.23".to_string(),
            attempt: 1,
            user_name: None,
            requested: Credentials::PASSWORD,
        }
    }

    /// Answers immediately with a fixed password.
    struct ImmediateListener;

    impl CredentialListener for ImmediateListener {
        fn request_credentials(&self, _query: &CredentialQuery) -> CredentialReply {
            CredentialReply::Granted(Credentials {
                password: Some("sesame".to_string()),
                ..Credentials::default()
            })
        }
    }

    /// Stashes tokens; the test decides when (whether) to complete them.
    #[derive(Default)]
    struct DeferredListener {
        tokens: Mutex<Vec<CompletionToken>>,
    }

    impl CredentialListener for DeferredListener {
        fn request_credentials_deferred(
            &self,
            _query: &CredentialQuery,
            token: CompletionToken,
        ) -> Result<(), crate::credentials::NotSupported> {
            self.tokens.lock().unwrap().push(token);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_no_listener_rejects() {
        let dispatch = ProtectedListenerDispatch::new();
        assert_eq!(
            dispatch.request_credentials(&query()).await,
            CredentialReply::Rejected
        );
    }

    #[tokio::test]
    async fn test_immediate_fallback() {
        let dispatch = ProtectedListenerDispatch::new();
        dispatch.set_listener(Some(Arc::new(ImmediateListener))).await;

        let reply = dispatch.request_credentials(&query()).await;
        assert!(reply.is_granted());
        assert_eq!(dispatch.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_deferred_completion() {
        let dispatch = Arc::new(ProtectedListenerDispatch::new());
        let listener = Arc::new(DeferredListener::default());
        dispatch.set_listener(Some(listener.clone())).await;

        let request = tokio::spawn({
            let dispatch = Arc::clone(&dispatch);
            async move { dispatch.request_credentials(&query()).await }
        });

        // Wait for the token to land, then complete it.
        let token = loop {
            if let Some(token) = listener.tokens.lock().unwrap().pop() {
                break token;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(token.complete(CredentialReply::Granted(Credentials::default())));

        assert!(request.await.unwrap().is_granted());
        assert_eq!(dispatch.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_deferred_timeout_is_rejection() {
        let dispatch = ProtectedListenerDispatch::with_timeout(Duration::from_millis(30));
        let listener = Arc::new(DeferredListener::default());
        dispatch.set_listener(Some(listener.clone())).await;

        let reply = dispatch.request_credentials(&query()).await;
        assert_eq!(reply, CredentialReply::Rejected);
        assert_eq!(dispatch.pending_requests(), 0);

        // Completing after the timeout reports failure to the completer.
        let token = listener.tokens.lock().unwrap().pop().unwrap();
        assert!(!token.complete(CredentialReply::Granted(Credentials::default())));
    }

    #[tokio::test]
    async fn test_swap_waits_for_outstanding_requests() {
        let dispatch = Arc::new(ProtectedListenerDispatch::new());
        let listener = Arc::new(DeferredListener::default());
        dispatch.set_listener(Some(listener.clone())).await;

        const N: usize = 5;
        let mut requests = Vec::new();
        for _ in 0..N {
            let dispatch = Arc::clone(&dispatch);
            requests.push(tokio::spawn(async move {
                dispatch.request_credentials(&query()).await
            }));
        }

        // Let all N requests park.
        while dispatch.pending_requests() < N {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Swapping in a replacement force-rejects all N and only returns
        // once every caller has been released.
        dispatch.set_listener(Some(Arc::new(ImmediateListener))).await;
        assert_eq!(dispatch.pending_requests(), 0);

        for request in requests {
            assert_eq!(request.await.unwrap(), CredentialReply::Rejected);
        }

        // The replacement serves new requests.
        assert!(dispatch.request_credentials(&query()).await.is_granted());
    }

    #[tokio::test]
    async fn test_remove_all_releases_blocked_callers() {
        let dispatch = Arc::new(ProtectedListenerDispatch::new());
        let listener = Arc::new(DeferredListener::default());
        dispatch.set_listener(Some(listener.clone())).await;

        let request = tokio::spawn({
            let dispatch = Arc::clone(&dispatch);
            async move { dispatch.request_credentials(&query()).await }
        });
        while dispatch.pending_requests() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        dispatch.set_listener(None).await;
        let reply = tokio::time::timeout(Duration::from_secs(1), request)
            .await
            .expect("caller must be released promptly")
            .unwrap();
        assert_eq!(reply, CredentialReply::Rejected);
    }

    #[tokio::test]
    async fn test_verify_credentials_deferred_and_fallback() {
        let dispatch = Arc::new(ProtectedListenerDispatch::new());

        // Fallback path: default immediate verify denies.
        dispatch.set_listener(Some(Arc::new(ImmediateListener))).await;
        assert!(
            !dispatch
                .verify_credentials(":1.9", &Credentials::default())
                .await
        );

        // Deferred path.
        let listener = Arc::new(VerifyListener::default());
        dispatch.set_listener(Some(listener.clone())).await;
        let verify = tokio::spawn({
            let dispatch = Arc::clone(&dispatch);
            async move { dispatch.verify_credentials(":1.9", &Credentials::default()).await }
        });
        let token = loop {
            if let Some(token) = listener.tokens.lock().unwrap().pop() {
                break token;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        token.complete(CredentialReply::Granted(Credentials::default()));
        assert!(verify.await.unwrap());
    }

    #[derive(Default)]
    struct VerifyListener {
        tokens: Mutex<Vec<CompletionToken>>,
    }

    impl CredentialListener for VerifyListener {
        fn verify_credentials_deferred(
            &self,
            _peer: &str,
            _credentials: &Credentials,
            token: CompletionToken,
        ) -> Result<(), crate::credentials::NotSupported> {
            self.tokens.lock().unwrap().push(token);
            Ok(())
        }
    }
}
