//! Secured-session brokering.
//!
//! RPC calls against a peer do not hold a session open permanently; each
//! logical operation acquires a short-lived secured session of the
//! authentication type that operation requires, performs its calls, and
//! releases the session again. [`ProxyObjectManager`] owns that discipline:
//!
//! - [`ProxyObjectManager::get_proxy_object`] /
//!   [`ProxyObjectManager::release_proxy_object`] are a hard pairing —
//!   sessions are a shared, finite transport resource, and every successful
//!   get must be matched by exactly one release.
//! - A `SessionLost` notification from the transport immediately invalidates
//!   every outstanding handle on that session: the next call on such a
//!   handle fails with [`warden_bus::BusError::SessionLost`] instead of
//!   hanging into the transport timeout.

use std::collections::HashMap;
use std::sync::Arc;

use lock_ladder::{LockLevel, OrderedMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use warden_bus::{AuthMechanism, BusAttachment, SessionEvent, WireValue};
use warden_model::ApplicationInfo;

use crate::proxy::{members, PermissionProxy};
use crate::Result;

/// Lock level of the session table. The highest rung in the workspace: it
/// may be taken while the catalog or store locks are held, never the other
/// way around.
const SESSIONS_LEVEL: LockLevel = LockLevel::Rung(50);

pub(crate) struct SessionEntry {
    pub(crate) lost: bool,
}

/// State shared between the broker and the proxies it hands out.
pub(crate) struct BrokerCore {
    pub(crate) bus: Arc<dyn BusAttachment>,
    pub(crate) object_path: String,
    pub(crate) interface: String,
    pub(crate) sessions: OrderedMutex<HashMap<u64, SessionEntry>>,
}

/// Brokers per-operation secured sessions to target applications.
pub struct ProxyObjectManager {
    core: Arc<BrokerCore>,
    method_auth: HashMap<&'static str, AuthMechanism>,
    watcher: JoinHandle<()>,
}

impl ProxyObjectManager {
    /// Creates a broker over `bus`. Must be called within a tokio runtime:
    /// the broker spawns a task watching for session-lost events.
    pub fn new(
        bus: Arc<dyn BusAttachment>,
        object_path: impl Into<String>,
        interface: impl Into<String>,
    ) -> Self {
        let core = Arc::new(BrokerCore {
            bus,
            object_path: object_path.into(),
            interface: interface.into(),
            sessions: OrderedMutex::new("broker-sessions", SESSIONS_LEVEL, HashMap::new()),
        });

        let watcher = tokio::spawn(watch_sessions(Arc::clone(&core)));

        Self {
            core,
            method_auth: method_auth_table(),
            watcher,
        }
    }

    /// The session authentication type `member` requires.
    ///
    /// Claim-window operations run over anonymous key exchange (there is no
    /// prior trust to build on); everything post-claim requires the
    /// certificate-based mechanism. The PSK class is never selected.
    pub fn required_mechanism(&self, member: &str) -> AuthMechanism {
        self.method_auth
            .get(member)
            .copied()
            .unwrap_or(AuthMechanism::EcdheEcdsa)
    }

    /// Opens a secured session of `mechanism` to `app` and returns a proxy
    /// bound to it.
    ///
    /// Every successful call must be matched by exactly one
    /// [`Self::release_proxy_object`].
    pub async fn get_proxy_object(
        &self,
        app: &ApplicationInfo,
        mechanism: AuthMechanism,
    ) -> Result<PermissionProxy> {
        let session = self
            .core
            .bus
            .join_session(&app.bus_address, mechanism)
            .await?;
        self.core
            .sessions
            .lock()
            .insert(session.0, SessionEntry { lost: false });
        debug!(%session, mechanism = %mechanism, peer = %app.bus_address, "session opened");
        Ok(PermissionProxy::bind(Arc::clone(&self.core), session))
    }

    /// Releases a proxy and closes its session. Releasing a proxy whose
    /// session was lost is not an error — the transport already tore the
    /// session down.
    pub async fn release_proxy_object(&self, proxy: PermissionProxy) -> Result<()> {
        let session = proxy.session();
        let was_lost = {
            let mut sessions = self.core.sessions.lock();
            let was_lost = sessions.get(&session.0).is_some_and(|e| e.lost);
            sessions.remove(&session.0);
            was_lost
        };
        proxy.mark_released();
        if !was_lost {
            self.core.bus.leave_session(session).await?;
        }
        debug!(%session, "session released");
        Ok(())
    }

    /// One-shot convenience: acquire the right session for `member`, call
    /// it, release, and return the reply.
    pub async fn method_call(
        &self,
        app: &ApplicationInfo,
        member: &str,
        args: Vec<WireValue>,
    ) -> Result<Vec<WireValue>> {
        let mechanism = self.required_mechanism(member);
        let proxy = self.get_proxy_object(app, mechanism).await?;
        let reply = proxy.raw_call(member, args).await;
        let released = self.release_proxy_object(proxy).await;
        let reply = reply?;
        released?;
        Ok(reply)
    }

    /// Number of sessions currently held open by proxies. Test hook.
    pub fn active_sessions(&self) -> usize {
        self.core.sessions.lock().len()
    }
}

impl Drop for ProxyObjectManager {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

async fn watch_sessions(core: Arc<BrokerCore>) {
    let mut events = core.bus.session_events();
    loop {
        match events.recv().await {
            Ok(SessionEvent::SessionLost { id, reason }) => {
                let mut sessions = core.sessions.lock();
                if let Some(entry) = sessions.get_mut(&id.0) {
                    entry.lost = true;
                    warn!(session = %id, %reason, "session lost with outstanding handle");
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                // Missed events: fail safe by invalidating everything we
                // cannot account for.
                warn!(skipped, "session event stream lagged; invalidating open sessions");
                let mut sessions = core.sessions.lock();
                for entry in sessions.values_mut() {
                    entry.lost = true;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn method_auth_table() -> HashMap<&'static str, AuthMechanism> {
    let mut table = HashMap::new();
    // Claim-window operations: no prior trust exists yet.
    table.insert(members::CLAIM, AuthMechanism::EcdheNull);
    table.insert(members::GET_MANIFEST, AuthMechanism::EcdheNull);
    table.insert(members::GET_PUBLIC_KEY, AuthMechanism::EcdheNull);
    // Post-claim configuration requires certificate-based authentication.
    table.insert(members::INSTALL_POLICY, AuthMechanism::EcdheEcdsa);
    table.insert(members::GET_POLICY, AuthMechanism::EcdheEcdsa);
    table.insert(members::REMOVE_POLICY, AuthMechanism::EcdheEcdsa);
    table.insert(members::INSTALL_MEMBERSHIP, AuthMechanism::EcdheEcdsa);
    table.insert(members::INSTALL_MEMBERSHIP_AUTH_DATA, AuthMechanism::EcdheEcdsa);
    table.insert(members::REMOVE_MEMBERSHIP, AuthMechanism::EcdheEcdsa);
    table.insert(members::INSTALL_IDENTITY, AuthMechanism::EcdheEcdsa);
    table.insert(members::GET_IDENTITY, AuthMechanism::EcdheEcdsa);
    table.insert(members::RESET, AuthMechanism::EcdheEcdsa);
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mechanism_table() {
        let bus = Arc::new(crate::testing::MockPeer::claimable());
        let broker = ProxyObjectManager::new(bus, "/p", "net.warden.PermissionMgmt");

        assert_eq!(
            broker.required_mechanism(members::CLAIM),
            AuthMechanism::EcdheNull
        );
        assert_eq!(
            broker.required_mechanism(members::INSTALL_POLICY),
            AuthMechanism::EcdheEcdsa
        );
        // Unknown members default to the strongest requirement.
        assert_eq!(
            broker.required_mechanism("Frobnicate"),
            AuthMechanism::EcdheEcdsa
        );
    }
}
