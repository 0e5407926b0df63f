//! In-process mock peer.
//!
//! [`MockPeer`] implements [`BusAttachment`] as if it were the transport
//! *and* the single remote application behind it: it accepts secured
//! sessions, answers the permission-management interface the way a real
//! peer's configurator does, and lets tests inject the interesting
//! failures — refusals in either wire spelling, a killed process, lost
//! sessions, missing state introspection.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use warden_bus::error::{
    ERROR_MESSAGE_PERMISSION_DENIED, ERROR_NAME_GENERIC, ERROR_NAME_PERMISSION_DENIED,
};
use warden_bus::{
    AuthMechanism, BusAttachment, BusError, CredentialQuery, CredentialReply, Credentials,
    ProtectedListenerDispatch, SessionEvent, SessionId, WireValue,
};
use warden_model::{
    ApplicationInfo, ApplicationState, KeyInfo, Member, MemberAction, PermissionPolicy,
    PublicKey, Rule, SigningKey,
};

use crate::codec;
use crate::proxy::members;

struct PeerState {
    claim_state: ApplicationState,
    manifest_template: Vec<Rule>,
    trust_anchor: Option<PublicKey>,
    received_identity_chain: Vec<Vec<u8>>,
    installed_identity: Option<(u8, Vec<u8>)>,
    policy: Option<PermissionPolicy>,
    memberships: Vec<MembershipRecord>,
    alive: bool,
    deny: HashSet<String>,
    deny_generic_spelling: bool,
    supports_state_introspection: bool,
    open: HashSet<u64>,
    total_opened: u64,
    passcode: Option<(String, std::sync::Arc<ProtectedListenerDispatch>)>,
}

struct MembershipRecord {
    serial: String,
    issuer_key_id: Vec<u8>,
    authorization: Option<PermissionPolicy>,
}

/// A fake remote application living on a fake bus.
pub struct MockPeer {
    key: SigningKey,
    bus_address: String,
    state: Mutex<PeerState>,
    events: broadcast::Sender<SessionEvent>,
    next_session: AtomicU64,
}

impl MockPeer {
    /// A running, claimable peer with a small door-style manifest template.
    pub fn claimable() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            key: SigningKey::generate().expect("peer key generation"),
            bus_address: ":1.peer".to_string(),
            state: Mutex::new(PeerState {
                claim_state: ApplicationState::Claimable,
                manifest_template: vec![Rule::for_interface(
                    "net.warden.Door",
                    vec![
                        Member::any("Open", MemberAction(MemberAction::MODIFY)),
                        Member::any("State", MemberAction(MemberAction::OBSERVE)),
                    ],
                )],
                trust_anchor: None,
                received_identity_chain: Vec::new(),
                installed_identity: None,
                policy: None,
                memberships: Vec::new(),
                alive: true,
                deny: HashSet::new(),
                deny_generic_spelling: false,
                supports_state_introspection: true,
                open: HashSet::new(),
                total_opened: 0,
                passcode: None,
            }),
            events,
            next_session: AtomicU64::new(1),
        }
    }

    /// Replaces the peer's manifest template.
    pub fn with_manifest(self, rules: Vec<Rule>) -> Self {
        self.state.lock().unwrap().manifest_template = rules;
        self
    }

    /// The peer's public key.
    pub fn public_key(&self) -> PublicKey {
        *self.key.public_key()
    }

    /// Descriptor for this peer as the manager would discover it.
    pub fn application_info(&self) -> ApplicationInfo {
        ApplicationInfo::discovered(
            self.public_key(),
            self.bus_address.clone(),
            self.state.lock().unwrap().claim_state,
        )
    }

    /// Refuse `member` with the dedicated permission-denied error name.
    pub fn deny(&self, member: &str) {
        self.state.lock().unwrap().deny.insert(member.to_string());
    }

    /// Refuse with the generic error name + well-known message instead.
    pub fn deny_with_generic_spelling(&self, member: &str) {
        let mut state = self.state.lock().unwrap();
        state.deny.insert(member.to_string());
        state.deny_generic_spelling = true;
    }

    /// Simulate the peer process dying: existing sessions are lost, new
    /// sessions and calls fail with a connectivity error.
    pub fn kill(&self) {
        let open: Vec<u64> = {
            let mut state = self.state.lock().unwrap();
            state.alive = false;
            state.open.drain().collect()
        };
        for id in open {
            let _ = self.events.send(SessionEvent::SessionLost {
                id: SessionId(id),
                reason: "peer process exited".to_string(),
            });
        }
    }

    /// Tear down one session without killing the peer.
    pub fn lose_session(&self, session: SessionId) {
        self.state.lock().unwrap().open.remove(&session.0);
        let _ = self.events.send(SessionEvent::SessionLost {
            id: session,
            reason: "peer left the session".to_string(),
        });
    }

    /// Require a passcode for SPEKE sessions, negotiated through
    /// `dispatch` the way a real transport would route credential requests.
    pub fn require_passcode(
        &self,
        passcode: impl Into<String>,
        dispatch: std::sync::Arc<ProtectedListenerDispatch>,
    ) {
        self.state.lock().unwrap().passcode = Some((passcode.into(), dispatch));
    }

    /// Pretend the peer does not implement state introspection.
    pub fn disable_state_introspection(&self) {
        self.state.lock().unwrap().supports_state_introspection = false;
    }

    /// Force the peer into a claim state (e.g. `NeedUpdate` after an
    /// upgrade).
    pub fn set_claim_state(&self, state: ApplicationState) {
        self.state.lock().unwrap().claim_state = state;
    }

    /// The peer's current claim state.
    pub fn claim_state(&self) -> ApplicationState {
        self.state.lock().unwrap().claim_state
    }

    /// The CA key the peer trusts, once claimed.
    pub fn trust_anchor(&self) -> Option<PublicKey> {
        self.state.lock().unwrap().trust_anchor
    }

    /// Number of identity certificates received in the claim call.
    pub fn received_identity_chain_len(&self) -> usize {
        self.state.lock().unwrap().received_identity_chain.len()
    }

    /// Membership serials currently installed.
    pub fn membership_serials(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .memberships
            .iter()
            .map(|m| m.serial.clone())
            .collect()
    }

    /// The peer's installed policy.
    pub fn installed_policy(&self) -> Option<PermissionPolicy> {
        self.state.lock().unwrap().policy.clone()
    }

    /// Embedded authorization rules installed for a membership, if any.
    pub fn membership_authorization(&self, serial: &str) -> Option<PermissionPolicy> {
        self.state
            .lock()
            .unwrap()
            .memberships
            .iter()
            .find(|m| m.serial == serial)
            .and_then(|m| m.authorization.clone())
    }

    /// Currently open sessions.
    pub fn open_sessions(&self) -> usize {
        self.state.lock().unwrap().open.len()
    }

    /// Sessions opened over the peer's lifetime.
    pub fn total_sessions_opened(&self) -> u64 {
        self.state.lock().unwrap().total_opened
    }

    fn refusal(&self, state: &PeerState) -> BusError {
        if state.deny_generic_spelling {
            BusError::error_reply(ERROR_NAME_GENERIC, ERROR_MESSAGE_PERMISSION_DENIED)
        } else {
            BusError::error_reply(ERROR_NAME_PERMISSION_DENIED, "policy refused the call")
        }
    }

    fn handle_claim(state: &mut PeerState, args: &[WireValue]) -> Result<Vec<WireValue>, BusError> {
        if state.claim_state != ApplicationState::Claimable {
            return Err(BusError::error_reply(
                ERROR_NAME_GENERIC,
                "application is not claimable",
            ));
        }
        if args.len() != 7 {
            return Err(BusError::Decode(format!(
                "Claim expects 7 arguments, got {}",
                args.len()
            )));
        }
        let ca_key = codec::decode_public_key(&args[0])?;
        let _ca_key_id = args[1].expect_bytes()?;
        let group_guid = args[2].expect_bytes()?;
        if group_guid.len() != 16 {
            return Err(BusError::Decode("group id must be 16 bytes".to_string()));
        }
        let _group_key = codec::decode_public_key(&args[3])?;
        let _group_key_id = args[4].expect_bytes()?;
        let chain = args[5].expect_array()?;
        let mut received = Vec::new();
        for entry in chain {
            let fields = entry.expect_struct(2)?;
            let _encoding = fields[0].expect_byte()?;
            received.push(fields[1].expect_bytes()?.to_vec());
        }
        // Manifest rules: decode to validate shape, then discard — the
        // template is what GetManifest serves.
        codec::decode_rules(&args[6])?;

        state.trust_anchor = Some(ca_key);
        state.received_identity_chain = received;
        state.claim_state = ApplicationState::Claimed;
        Ok(vec![])
    }
}

#[async_trait]
impl BusAttachment for MockPeer {
    async fn join_session(
        &self,
        bus_address: &str,
        mechanism: AuthMechanism,
    ) -> Result<SessionId, BusError> {
        let negotiation = {
            let state = self.state.lock().unwrap();
            if !state.alive {
                return Err(BusError::Connection("peer process is gone".to_string()));
            }
            if bus_address != self.bus_address {
                return Err(BusError::Connection(format!(
                    "no peer at address {bus_address}"
                )));
            }
            match mechanism {
                AuthMechanism::EcdhePsk => {
                    return Err(BusError::Connection(
                        "peer refuses the deprecated PSK exchange".to_string(),
                    ));
                }
                AuthMechanism::EcdheNull if state.claim_state == ApplicationState::Claimed => {
                    return Err(BusError::Connection(
                        "claimed peer refuses anonymous key exchange".to_string(),
                    ));
                }
                _ => {}
            }
            match (&state.passcode, mechanism) {
                (Some((expected, dispatch)), AuthMechanism::EcdheSpeke) => {
                    Some((expected.clone(), std::sync::Arc::clone(dispatch)))
                }
                _ => None,
            }
        };

        // Credential negotiation runs outside the state lock, like a real
        // transport's authentication round trip.
        if let Some((expected, dispatch)) = negotiation {
            let query = CredentialQuery {
                mechanism,
                peer: bus_address.to_string(),
                attempt: 1,
                user_name: None,
                requested: Credentials::PASSWORD,
            };
            let granted = match dispatch.request_credentials(&query).await {
                CredentialReply::Granted(credentials) => {
                    credentials.password.as_deref() == Some(expected.as_str())
                }
                CredentialReply::Rejected => false,
            };
            dispatch.authentication_complete(mechanism, bus_address, granted);
            if !granted {
                return Err(BusError::Connection(
                    "authentication failed".to_string(),
                ));
            }
        }

        let mut state = self.state.lock().unwrap();
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        state.open.insert(id);
        state.total_opened += 1;
        Ok(SessionId(id))
    }

    async fn leave_session(&self, session: SessionId) -> Result<(), BusError> {
        self.state.lock().unwrap().open.remove(&session.0);
        Ok(())
    }

    async fn method_call(
        &self,
        session: SessionId,
        _object_path: &str,
        _interface: &str,
        member: &str,
        args: Vec<WireValue>,
    ) -> Result<Vec<WireValue>, BusError> {
        let mut state = self.state.lock().unwrap();
        if !state.alive {
            return Err(BusError::Connection("peer process is gone".to_string()));
        }
        if !state.open.contains(&session.0) {
            return Err(BusError::SessionLost(session));
        }
        if state.deny.contains(member) {
            return Err(self.refusal(&state));
        }
        match member {
            members::CLAIM => Self::handle_claim(&mut state, &args),
            members::INSTALL_POLICY => {
                let value = args
                    .first()
                    .ok_or_else(|| BusError::Decode("missing policy argument".to_string()))?;
                state.policy = Some(codec::decode_policy(value)?);
                Ok(vec![])
            }
            members::GET_POLICY => match &state.policy {
                Some(policy) => Ok(vec![codec::encode_policy(policy)]),
                None => Err(BusError::error_reply(
                    ERROR_NAME_GENERIC,
                    "no policy installed",
                )),
            },
            members::REMOVE_POLICY => {
                state.policy = None;
                Ok(vec![])
            }
            members::INSTALL_MEMBERSHIP => {
                let chain = args
                    .first()
                    .ok_or_else(|| BusError::Decode("missing chain argument".to_string()))?
                    .expect_array()?;
                for entry in chain {
                    let fields = entry.expect_struct(2)?;
                    let der = fields[1].expect_bytes()?.to_vec();
                    let cert = warden_model::MembershipCertificate::from_der(der)
                        .map_err(|e| BusError::Decode(e.to_string()))?;
                    state.memberships.push(MembershipRecord {
                        serial: cert.serial().to_string(),
                        issuer_key_id: cert.issuer_key_id().to_vec(),
                        authorization: None,
                    });
                }
                Ok(vec![])
            }
            members::INSTALL_MEMBERSHIP_AUTH_DATA => {
                let serial = args[0].expect_str()?.to_string();
                let key_id = args[1].expect_bytes()?;
                let policy = codec::decode_policy(&args[2])?;
                let record = state
                    .memberships
                    .iter_mut()
                    .find(|m| m.serial == serial && m.issuer_key_id == key_id);
                match record {
                    Some(record) => {
                        record.authorization = Some(policy);
                        Ok(vec![])
                    }
                    None => Err(BusError::error_reply(
                        ERROR_NAME_GENERIC,
                        "no such membership",
                    )),
                }
            }
            members::REMOVE_MEMBERSHIP => {
                let serial = args[0].expect_str()?;
                let key_id = args[1].expect_bytes()?;
                let before = state.memberships.len();
                state
                    .memberships
                    .retain(|m| !(m.serial == serial && m.issuer_key_id == key_id));
                if state.memberships.len() == before {
                    Err(BusError::error_reply(
                        ERROR_NAME_GENERIC,
                        "no such membership",
                    ))
                } else {
                    Ok(vec![])
                }
            }
            members::INSTALL_IDENTITY => {
                let fields = args
                    .first()
                    .ok_or_else(|| BusError::Decode("missing certificate".to_string()))?
                    .expect_struct(2)?;
                state.installed_identity =
                    Some((fields[0].expect_byte()?, fields[1].expect_bytes()?.to_vec()));
                Ok(vec![])
            }
            members::GET_IDENTITY => match &state.installed_identity {
                Some((tag, bytes)) => Ok(vec![WireValue::Struct(vec![
                    WireValue::Byte(*tag),
                    WireValue::Bytes(bytes.clone()),
                ])]),
                None => Err(BusError::error_reply(
                    ERROR_NAME_GENERIC,
                    "no identity installed",
                )),
            },
            members::GET_MANIFEST => Ok(vec![WireValue::Struct(vec![
                WireValue::Byte(0),
                WireValue::variant(codec::encode_rules(&state.manifest_template)),
            ])]),
            members::GET_PUBLIC_KEY => {
                let mut info = KeyInfo::new(*self.key.public_key());
                info.key_id_or_generate();
                Ok(vec![codec::encode_public_key(&info)])
            }
            members::RESET => {
                state.trust_anchor = None;
                state.received_identity_chain.clear();
                state.installed_identity = None;
                state.policy = None;
                state.memberships.clear();
                state.claim_state = ApplicationState::Claimable;
                Ok(vec![])
            }
            other => Err(BusError::NotImplemented(other.to_string())),
        }
    }

    async fn get_property(
        &self,
        session: SessionId,
        _interface: &str,
        property: &str,
    ) -> Result<WireValue, BusError> {
        let state = self.state.lock().unwrap();
        if !state.alive {
            return Err(BusError::Connection("peer process is gone".to_string()));
        }
        if !state.open.contains(&session.0) {
            return Err(BusError::SessionLost(session));
        }
        match property {
            members::VERSION_PROPERTY => Ok(WireValue::U16(1)),
            members::APPLICATION_STATE_PROPERTY => {
                if state.supports_state_introspection {
                    Ok(WireValue::Byte(state.claim_state.to_wire()))
                } else {
                    Err(BusError::NotImplemented(property.to_string()))
                }
            }
            other => Err(BusError::NotImplemented(other.to_string())),
        }
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

/// Accepts every manifest. The usual callback in tests.
pub fn accept_all_manifests(_app: &ApplicationInfo, _rules: &[Rule]) -> bool {
    true
}

/// Rejects every manifest.
pub fn reject_all_manifests(_app: &ApplicationInfo, _rules: &[Rule]) -> bool {
    false
}

/// A Uuid for the administrative group used across tests.
pub fn admin_group_guid() -> Uuid {
    Uuid::from_u128(0x5741_5244_454e_0000_0000_0000_0000_0001)
}
