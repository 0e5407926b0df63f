//! The security manager.
//!
//! One [`SecurityManager`] is one root of trust: it owns a signing key, an
//! administrative group, a persistent catalog of the applications it has
//! claimed, and the machinery to claim and configure more. All remote
//! operations go through the session broker and the permission proxy;
//! results are persisted *before* registered listeners hear about them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use lock_ladder::{LockLevel, OrderedMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use warden_bus::{AuthMechanism, BusAttachment, ProtectedListenerDispatch};
use warden_model::{
    ApplicationInfo, ApplicationState, GuildInfo, IdentityCertificate, IdentityInfo, KeyInfo,
    Manifest, MembershipCertificate, PermissionPolicy, PublicKey, Rule, SignedManifest,
    SigningKey,
};
use warden_store::{ClaimedApplication, Store};

use crate::broker::ProxyObjectManager;
use crate::config::SecurityManagerConfig;
use crate::listener::ApplicationListener;
use crate::proxy::PermissionProxy;
use crate::{Error, Result};

/// Lock level of the in-memory application catalog. Acquired before the
/// store connection and the broker's session table, never after them.
const CATALOG_LEVEL: LockLevel = LockLevel::Rung(30);
/// Lock level of the listener registry.
const LISTENERS_LEVEL: LockLevel = LockLevel::Rung(35);

/// The claiming/configuration orchestrator.
pub struct SecurityManager {
    store: Arc<dyn Store>,
    signing_key: SigningKey,
    admin_group_guid: Uuid,
    broker: ProxyObjectManager,
    dispatch: Arc<ProtectedListenerDispatch>,
    catalog: OrderedMutex<HashMap<PublicKey, ApplicationInfo>>,
    listeners: OrderedMutex<Vec<Arc<dyn ApplicationListener>>>,
    config: SecurityManagerConfig,
}

impl SecurityManager {
    /// Builds a manager over `bus` and `store`.
    ///
    /// Previously claimed applications are loaded back into the catalog with
    /// an unknown running state; their bus addresses are stale until the
    /// peer announces itself again. Must be called within a tokio runtime.
    pub fn new(
        bus: Arc<dyn BusAttachment>,
        store: Arc<dyn Store>,
        signing_key: SigningKey,
        config: SecurityManagerConfig,
    ) -> Result<Self> {
        let broker =
            ProxyObjectManager::new(Arc::clone(&bus), &config.object_path, &config.interface);

        let mut catalog = HashMap::new();
        for row in store.applications()? {
            let mut app = ApplicationInfo::discovered(
                row.public_key,
                String::new(),
                ApplicationState::Claimed,
            );
            app.running_state = warden_model::RunningState::Unknown;
            app.app_name = row.app_name;
            app.device_name = row.device_name;
            app.user_defined_name = row.user_defined_name;
            catalog.insert(row.public_key, app);
        }
        let pending = store.applications_pending_reconciliation()?;
        if !pending.is_empty() {
            warn!(
                count = pending.len(),
                "applications need reconciliation after an interrupted update"
            );
        }

        Ok(Self {
            store,
            signing_key,
            admin_group_guid: config.admin_group_guid,
            broker,
            dispatch: Arc::new(ProtectedListenerDispatch::new()),
            catalog: OrderedMutex::new("application-catalog", CATALOG_LEVEL, catalog),
            listeners: OrderedMutex::new("listener-registry", LISTENERS_LEVEL, Vec::new()),
            config,
        })
    }

    /// This manager's public key — the root-of-trust identity peers are
    /// configured with.
    pub fn public_key(&self) -> &PublicKey {
        self.signing_key.public_key()
    }

    /// The credential-listener dispatch the transport should route
    /// credential requests through.
    pub fn credential_dispatch(&self) -> Arc<ProtectedListenerDispatch> {
        Arc::clone(&self.dispatch)
    }

    /// The session broker. Exposed for callers that need raw proxy access.
    pub fn broker(&self) -> &ProxyObjectManager {
        &self.broker
    }

    // ---- catalog and listeners -------------------------------------------

    /// Feeds a discovery/announcement update into the catalog.
    ///
    /// The claim-state transition rules are enforced here: an announcement
    /// that would move a claimed application back to claimable is rejected
    /// with an invalid-transition error and leaves the catalog untouched.
    pub fn application_discovered(&self, announced: ApplicationInfo) -> Result<ApplicationInfo> {
        let (old, new) = {
            let mut catalog = self.catalog.lock();
            match catalog.get_mut(&announced.public_key) {
                Some(existing) => {
                    let next = existing.claim_state.transition(announced.claim_state)?;
                    let old = existing.clone();
                    existing.claim_state = next;
                    existing.bus_address = announced.bus_address;
                    existing.running_state = announced.running_state;
                    if !announced.app_name.is_empty() {
                        existing.app_name = announced.app_name;
                    }
                    if !announced.device_name.is_empty() {
                        existing.device_name = announced.device_name;
                    }
                    (Some(old), existing.clone())
                }
                None => {
                    catalog.insert(announced.public_key, announced.clone());
                    (None, announced)
                }
            }
        };
        self.notify_changed(old.as_ref(), &new);
        Ok(new)
    }

    /// Applications currently known, optionally filtered by claim state.
    pub fn applications(&self, filter: Option<ApplicationState>) -> Vec<ApplicationInfo> {
        self.catalog
            .lock()
            .values()
            .filter(|app| filter.map_or(true, |state| app.claim_state == state))
            .cloned()
            .collect()
    }

    /// Looks up one application by public key.
    pub fn application(&self, public_key: &PublicKey) -> Option<ApplicationInfo> {
        self.catalog.lock().get(public_key).cloned()
    }

    /// Registers a listener for application changes.
    pub fn register_application_listener(&self, listener: Arc<dyn ApplicationListener>) {
        self.listeners.lock().push(listener);
    }

    /// Unregisters a previously registered listener.
    pub fn unregister_application_listener(&self, listener: &Arc<dyn ApplicationListener>) {
        self.listeners
            .lock()
            .retain(|candidate| !Arc::ptr_eq(candidate, listener));
    }

    fn notify_changed(&self, old: Option<&ApplicationInfo>, new: &ApplicationInfo) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_application_changed(old, new);
        }
    }

    fn notify_removed(&self, app: &ApplicationInfo) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener.on_application_removed(app);
        }
    }

    // ---- identity and guild records --------------------------------------

    /// Creates (in memory) an identity record administered by this manager.
    pub fn create_identity(&self, name: impl Into<String>) -> IdentityInfo {
        IdentityInfo::new(*self.public_key(), name)
    }

    /// Creates (in memory) a guild record administered by this manager.
    pub fn create_guild(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> GuildInfo {
        GuildInfo::new(*self.public_key(), name, description)
    }

    /// Persists an identity record.
    pub fn store_identity(&self, identity: &IdentityInfo, update: bool) -> Result<()> {
        self.ensure_own_authority(&identity.authority)?;
        Ok(self.store.store_identity(identity, update)?)
    }

    /// Fetches an identity record.
    pub fn identity(&self, guid: Uuid) -> Result<Option<IdentityInfo>> {
        Ok(self.store.identity(self.public_key(), guid)?)
    }

    /// All identity records this manager administers.
    pub fn identities(&self) -> Result<Vec<IdentityInfo>> {
        Ok(self.store.identities(self.public_key())?)
    }

    /// Removes an identity record.
    pub fn remove_identity(&self, guid: Uuid) -> Result<()> {
        Ok(self.store.remove_identity(self.public_key(), guid)?)
    }

    /// Persists a guild record.
    pub fn store_guild(&self, guild: &GuildInfo, update: bool) -> Result<()> {
        self.ensure_own_authority(&guild.authority)?;
        Ok(self.store.store_guild(guild, update)?)
    }

    /// Fetches a guild record.
    pub fn guild(&self, guid: Uuid) -> Result<Option<GuildInfo>> {
        Ok(self.store.guild(self.public_key(), guid)?)
    }

    /// All guild records this manager administers.
    pub fn guilds(&self) -> Result<Vec<GuildInfo>> {
        Ok(self.store.guilds(self.public_key())?)
    }

    /// Removes a guild record.
    pub fn remove_guild(&self, guid: Uuid) -> Result<()> {
        Ok(self.store.remove_guild(self.public_key(), guid)?)
    }

    fn ensure_own_authority(&self, authority: &PublicKey) -> Result<()> {
        if authority != self.public_key() {
            return Err(Error::InvalidState(
                "record is administered by a different security manager".to_string(),
            ));
        }
        Ok(())
    }

    // ---- claiming ---------------------------------------------------------

    /// Claims `app`: issues an identity certificate binding the application
    /// to `identity_guid` and establishes this manager as its root of
    /// trust.
    ///
    /// `manifest_accept` is consulted with the peer's declared manifest
    /// after the claim exchange; see
    /// [`Self::claim_application_with_chain`] for the rejection semantics.
    pub async fn claim_application<F>(
        &self,
        app: &ApplicationInfo,
        identity_guid: Uuid,
        manifest_accept: F,
    ) -> Result<ApplicationInfo>
    where
        F: FnOnce(&ApplicationInfo, &[Rule]) -> bool + Send,
    {
        self.ensure_not_claimed(&app.public_key)?;
        let identity = self
            .identity(identity_guid)?
            .ok_or_else(|| Error::InvalidState(format!("unknown identity {identity_guid}")))?;

        let serial = self.store.next_serial_number()?;
        let certificate = IdentityCertificate::issue(
            &self.signing_key,
            &app.public_key,
            identity.guid,
            serial,
            Utc::now() + Duration::days(self.config.certificate_validity_days),
        )?;
        self.claim_application_with_chain(app, &identity, vec![certificate], manifest_accept)
            .await
    }

    /// Claims `app` with an explicit identity-certificate chain (leaf first,
    /// root last; an empty chain is legal — nothing is installed or
    /// persisted for the identity in that case).
    ///
    /// On success the application is persisted as claimed before listeners
    /// are notified. If the administrator rejects the manifest after the
    /// peer already applied the claim, a compensating reset is attempted on
    /// the still-open session; nothing is persisted either way, and the
    /// error distinguishes whether the reset undid the peer-side claim.
    pub async fn claim_application_with_chain<F>(
        &self,
        app: &ApplicationInfo,
        identity: &IdentityInfo,
        chain: Vec<IdentityCertificate>,
        manifest_accept: F,
    ) -> Result<ApplicationInfo>
    where
        F: FnOnce(&ApplicationInfo, &[Rule]) -> bool + Send,
    {
        self.ensure_not_claimed(&app.public_key)?;

        // Anonymous key exchange is acceptable here and only here: the
        // peer is still in its claim window, there is no prior trust.
        let proxy = self
            .broker
            .get_proxy_object(app, AuthMechanism::EcdheNull)
            .await?;
        let claimed = self
            .claim_over_session(&proxy, app, identity, &chain, manifest_accept)
            .await;
        let released = self.broker.release_proxy_object(proxy).await;
        let updated = claimed?;
        released?;

        info!(app = %updated.public_key, identity = %identity.guid, "application claimed");
        self.notify_changed(Some(app), &updated);
        Ok(updated)
    }

    async fn claim_over_session<F>(
        &self,
        proxy: &PermissionProxy,
        app: &ApplicationInfo,
        identity: &IdentityInfo,
        chain: &[IdentityCertificate],
        manifest_accept: F,
    ) -> Result<ApplicationInfo>
    where
        F: FnOnce(&ApplicationInfo, &[Rule]) -> bool + Send,
    {
        let mut ca_key = self.signing_key.key_info();
        let mut group_key = self.signing_key.key_info();
        proxy
            .claim(&mut ca_key, self.admin_group_guid, &mut group_key, chain, &[])
            .await?;

        // The peer has applied the claim. Fetch what it declares it will
        // expose and put that in front of the administrator.
        let rules = proxy.get_manifest().await?;
        if !manifest_accept(app, &rules) {
            // Known asymmetry: the peer already considers itself claimed.
            // Attempt to compensate with a reset over the same session.
            return match proxy.reset().await {
                Ok(()) => {
                    debug!(app = %app.public_key, "manifest rejected; peer reset");
                    Err(Error::ManifestRejected)
                }
                Err(reset_error) => Err(Error::ManifestRejectedPeerClaimed {
                    reset_error: reset_error.to_string(),
                }),
            };
        }

        // Persist before anyone is told about the new state.
        self.store.store_application(&ClaimedApplication {
            public_key: app.public_key,
            app_name: app.app_name.clone(),
            device_name: app.device_name.clone(),
            user_defined_name: app.user_defined_name.clone(),
            manifest: Some(Manifest::new(rules)),
            policy: None,
            updates_pending: false,
        })?;
        if let Some(leaf) = chain.first() {
            self.store.store_identity_certificate(leaf)?;
        }

        let updated = {
            let mut catalog = self.catalog.lock();
            let entry = catalog
                .entry(app.public_key)
                .or_insert_with(|| app.clone());
            entry.claim_state = entry.claim_state.transition(ApplicationState::Claimed)?;
            entry.bus_address = app.bus_address.clone();
            entry.trust_anchors = vec![identity.guid];
            entry.clone()
        };
        Ok(updated)
    }

    fn ensure_not_claimed(&self, public_key: &PublicKey) -> Result<()> {
        if self.store.application(public_key)?.is_some() {
            return Err(Error::AlreadyClaimed);
        }
        Ok(())
    }

    // ---- post-claim configuration ----------------------------------------

    /// Installs a membership certificate on `app`, making it a member of
    /// the guild. `authorization` optionally carries embedded rules for the
    /// membership; without it the peer falls back to its manifest.
    pub async fn install_membership(
        &self,
        app: &ApplicationInfo,
        guild_guid: Uuid,
        authorization: Option<&PermissionPolicy>,
    ) -> Result<MembershipCertificate> {
        self.ensure_claimed(&app.public_key)?;
        let guild = self
            .guild(guild_guid)?
            .ok_or_else(|| Error::InvalidState(format!("unknown guild {guild_guid}")))?;

        let serial = self.store.next_serial_number()?;
        let certificate = MembershipCertificate::issue(
            &self.signing_key,
            &app.public_key,
            guild.guid,
            serial,
            Utc::now() + Duration::days(self.config.certificate_validity_days),
        )?;

        self.store.set_updates_pending(&app.public_key, true)?;
        let proxy = self
            .broker
            .get_proxy_object(app, AuthMechanism::EcdheEcdsa)
            .await?;
        let outcome: Result<()> = async {
            proxy
                .install_membership(std::slice::from_ref(&certificate))
                .await?;
            if let Some(policy) = authorization {
                proxy
                    .install_membership_auth_data(serial, certificate.issuer_key_id(), policy)
                    .await?;
            }
            Ok(())
        }
        .await;
        let released = self.broker.release_proxy_object(proxy).await;
        outcome?;
        released?;

        self.store.store_membership_certificate(&certificate)?;
        self.store.set_updates_pending(&app.public_key, false)?;
        info!(app = %app.public_key, guild = %guild.guid, "membership installed");
        Ok(certificate)
    }

    /// Revokes `app`'s membership of the guild, addressing the certificate
    /// by serial number and issuer key id.
    pub async fn remove_membership(&self, app: &ApplicationInfo, guild_guid: Uuid) -> Result<()> {
        self.ensure_claimed(&app.public_key)?;
        let certificate = self
            .store
            .membership_certificates(&app.public_key)?
            .into_iter()
            .find(|cert| cert.guild_guid() == guild_guid)
            .ok_or_else(|| {
                Error::InvalidState(format!("application is not a member of {guild_guid}"))
            })?;

        self.store.set_updates_pending(&app.public_key, true)?;
        let proxy = self
            .broker
            .get_proxy_object(app, AuthMechanism::EcdheEcdsa)
            .await?;
        let outcome = proxy
            .remove_membership(certificate.serial(), certificate.issuer_key_id())
            .await;
        let released = self.broker.release_proxy_object(proxy).await;
        outcome?;
        released?;

        self.store
            .remove_membership_certificate(&app.public_key, guild_guid)?;
        self.store.set_updates_pending(&app.public_key, false)?;
        info!(app = %app.public_key, guild = %guild_guid, "membership removed");
        Ok(())
    }

    /// Installs `policy` on `app`. The policy is persisted locally only
    /// after the remote installation succeeded.
    pub async fn install_policy(
        &self,
        app: &ApplicationInfo,
        policy: &PermissionPolicy,
    ) -> Result<()> {
        let mut row = self.claimed_row(&app.public_key)?;

        self.store.set_updates_pending(&app.public_key, true)?;
        let proxy = self
            .broker
            .get_proxy_object(app, AuthMechanism::EcdheEcdsa)
            .await?;
        let outcome = proxy.install_policy(policy).await;
        let released = self.broker.release_proxy_object(proxy).await;
        outcome?;
        released?;

        row.policy = Some(policy.clone());
        row.updates_pending = false;
        self.store.store_application(&row)?;
        info!(app = %app.public_key, serial = policy.serial, "policy installed");
        Ok(())
    }

    /// Fetches `app`'s policy — from the peer when `remote` is true, from
    /// the local store otherwise.
    pub async fn get_policy(
        &self,
        app: &ApplicationInfo,
        remote: bool,
    ) -> Result<Option<PermissionPolicy>> {
        if !remote {
            return Ok(self.claimed_row(&app.public_key)?.policy);
        }
        let proxy = self
            .broker
            .get_proxy_object(app, AuthMechanism::EcdheEcdsa)
            .await?;
        let outcome = proxy.get_policy().await;
        let released = self.broker.release_proxy_object(proxy).await;
        let policy = outcome?;
        released?;
        Ok(Some(policy))
    }

    /// Removes the policy from `app` and from the local store.
    pub async fn remove_policy(&self, app: &ApplicationInfo) -> Result<()> {
        let mut row = self.claimed_row(&app.public_key)?;

        self.store.set_updates_pending(&app.public_key, true)?;
        let proxy = self
            .broker
            .get_proxy_object(app, AuthMechanism::EcdheEcdsa)
            .await?;
        let outcome = proxy.remove_policy().await;
        let released = self.broker.release_proxy_object(proxy).await;
        outcome?;
        released?;

        row.policy = None;
        row.updates_pending = false;
        self.store.store_application(&row)?;
        Ok(())
    }

    /// Issues and installs a fresh identity certificate binding `app` to
    /// `identity_guid`, replacing the stored certificate.
    pub async fn install_identity(
        &self,
        app: &ApplicationInfo,
        identity_guid: Uuid,
    ) -> Result<IdentityCertificate> {
        self.ensure_claimed(&app.public_key)?;
        let identity = self
            .identity(identity_guid)?
            .ok_or_else(|| Error::InvalidState(format!("unknown identity {identity_guid}")))?;

        let serial = self.store.next_serial_number()?;
        let certificate = IdentityCertificate::issue(
            &self.signing_key,
            &app.public_key,
            identity.guid,
            serial,
            Utc::now() + Duration::days(self.config.certificate_validity_days),
        )?;

        self.store.set_updates_pending(&app.public_key, true)?;
        let proxy = self
            .broker
            .get_proxy_object(app, AuthMechanism::EcdheEcdsa)
            .await?;
        let outcome = proxy
            .install_identity(warden_model::CertificateEncoding::Der, &certificate)
            .await;
        let released = self.broker.release_proxy_object(proxy).await;
        outcome?;
        released?;

        self.store.store_identity_certificate(&certificate)?;
        self.store.set_updates_pending(&app.public_key, false)?;
        Ok(certificate)
    }

    /// Fetches the identity certificate currently installed on the peer.
    pub async fn get_identity_certificate(
        &self,
        app: &ApplicationInfo,
    ) -> Result<IdentityCertificate> {
        let proxy = self
            .broker
            .get_proxy_object(app, AuthMechanism::EcdheEcdsa)
            .await?;
        let outcome = proxy.get_identity().await;
        let released = self.broker.release_proxy_object(proxy).await;
        let certificate = outcome?;
        released?;
        Ok(certificate)
    }

    /// Fetches the peer's declared manifest. The returned rules are owned
    /// by the caller.
    pub async fn get_manifest(&self, app: &ApplicationInfo) -> Result<Vec<Rule>> {
        let mechanism = self.mechanism_for(app);
        let proxy = self.broker.get_proxy_object(app, mechanism).await?;
        let outcome = proxy.get_manifest().await;
        let released = self.broker.release_proxy_object(proxy).await;
        let rules = outcome?;
        released?;
        Ok(rules)
    }

    /// Reads the peer's claim state. `Ok(None)` means the peer does not
    /// support state introspection — distinct from a transport failure.
    pub async fn remote_application_state(
        &self,
        app: &ApplicationInfo,
    ) -> Result<Option<ApplicationState>> {
        let mechanism = self.mechanism_for(app);
        let proxy = self.broker.get_proxy_object(app, mechanism).await?;
        let outcome = proxy.application_state().await;
        let released = self.broker.release_proxy_object(proxy).await;
        let state = outcome?;
        released?;
        Ok(state)
    }

    /// Removes all security configuration from `app` — root of trust,
    /// identity certificate, memberships, policy — and erases it from the
    /// local catalog, cascading to its stored certificates.
    pub async fn reset(&self, app: &ApplicationInfo) -> Result<()> {
        self.ensure_claimed(&app.public_key)?;

        let proxy = self
            .broker
            .get_proxy_object(app, AuthMechanism::EcdheEcdsa)
            .await?;
        let outcome = proxy.reset().await;
        let released = self.broker.release_proxy_object(proxy).await;
        outcome?;
        released?;

        self.store.remove_application(&app.public_key)?;
        let removed = self.catalog.lock().remove(&app.public_key);
        info!(app = %app.public_key, "application reset");
        if let Some(removed) = removed {
            self.notify_removed(&removed);
        }
        Ok(())
    }

    /// Applications whose last mutating operation was interrupted before
    /// local persistence; the caller should reconcile them against the
    /// peer.
    pub fn applications_pending_reconciliation(&self) -> Result<Vec<ClaimedApplication>> {
        Ok(self.store.applications_pending_reconciliation()?)
    }

    // ---- manifest signing -------------------------------------------------

    /// Signs `manifest`, binding it to the identity certificate whose
    /// thumbprint is given. The caller is responsible for ensuring this
    /// manager's key issued the referenced certificate; that relationship
    /// is not re-verified here.
    pub fn sign_manifest(
        &self,
        subject_thumbprint: &[u8],
        manifest: &Manifest,
    ) -> Result<SignedManifest> {
        Ok(manifest.sign(subject_thumbprint, &self.signing_key)?)
    }

    /// Computes `certificate`'s thumbprint and signs `manifest` bound to
    /// it.
    pub fn compute_thumbprint_and_sign_manifest(
        &self,
        certificate: &IdentityCertificate,
        manifest: &Manifest,
    ) -> Result<SignedManifest> {
        Ok(manifest.compute_thumbprint_and_sign(certificate, &self.signing_key)?)
    }

    /// This manager's key info as peers receive it during claiming.
    pub fn key_info(&self) -> KeyInfo {
        self.signing_key.key_info()
    }

    // ---- helpers ----------------------------------------------------------

    fn mechanism_for(&self, app: &ApplicationInfo) -> AuthMechanism {
        if app.claim_state.is_unclaimed() {
            AuthMechanism::EcdheNull
        } else {
            AuthMechanism::EcdheEcdsa
        }
    }

    fn ensure_claimed(&self, public_key: &PublicKey) -> Result<()> {
        self.claimed_row(public_key).map(|_| ())
    }

    fn claimed_row(&self, public_key: &PublicKey) -> Result<ClaimedApplication> {
        self.store
            .application(public_key)?
            .ok_or_else(|| Error::InvalidState("application is not claimed".to_string()))
    }
}
