//! SQLite-backed [`Store`] implementation.

use lock_ladder::{LockLevel, OrderedMutex};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use warden_model::{
    GuildInfo, IdentityCertificate, IdentityInfo, Manifest, MembershipCertificate,
    PermissionPolicy, PublicKey,
};

use crate::{ClaimedApplication, Result, Store, StoreError};

/// Lock level of the store connection. Acquired after the manager's catalog
/// lock, never the other way around.
const CONNECTION_LEVEL: LockLevel = LockLevel::Rung(40);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS groups (
    authority   BLOB NOT NULL,
    id          TEXT NOT NULL,
    name        TEXT,
    description TEXT,
    PRIMARY KEY (authority, id)
);
CREATE TABLE IF NOT EXISTS identities (
    authority BLOB NOT NULL,
    id        TEXT NOT NULL,
    name      TEXT,
    PRIMARY KEY (authority, id)
);
CREATE TABLE IF NOT EXISTS claimed_applications (
    application_pubkey BLOB PRIMARY KEY NOT NULL,
    app_name           TEXT,
    dev_name           TEXT,
    user_def_name      TEXT,
    manifest           BLOB,
    policy             BLOB,
    updates_pending    INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS identity_certs (
    subject_pubkey BLOB PRIMARY KEY NOT NULL,
    issuer_key_id  BLOB NOT NULL,
    der            BLOB NOT NULL,
    id             TEXT NOT NULL,
    FOREIGN KEY (subject_pubkey)
        REFERENCES claimed_applications (application_pubkey) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS membership_certs (
    subject_pubkey BLOB NOT NULL,
    issuer_key_id  BLOB NOT NULL,
    der            BLOB NOT NULL,
    guild          TEXT NOT NULL,
    PRIMARY KEY (subject_pubkey, guild),
    FOREIGN KEY (subject_pubkey)
        REFERENCES claimed_applications (application_pubkey) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS serial_number (
    value INTEGER NOT NULL
);
INSERT INTO serial_number (value)
    SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM serial_number);
";

/// SQLite-backed store.
pub struct SqliteStore {
    conn: OrderedMutex<Connection>,
}

impl SqliteStore {
    /// Opens (and migrates) the store at `path`.
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory store. Test use.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        debug!("store schema initialized");
        Ok(Self {
            conn: OrderedMutex::new("store-connection", CONNECTION_LEVEL, conn),
        })
    }
}

fn key_blob(key: &PublicKey) -> Vec<u8> {
    key.to_uncompressed().to_vec()
}

fn key_from_blob(blob: &[u8]) -> Result<PublicKey> {
    PublicKey::from_uncompressed(blob)
        .map_err(|e| StoreError::Corrupt(format!("stored public key: {e}")))
}

fn json_blob<T: serde::Serialize>(value: &Option<T>) -> Result<Option<Vec<u8>>> {
    value
        .as_ref()
        .map(|v| {
            serde_json::to_vec(v).map_err(|e| StoreError::Corrupt(format!("encode blob: {e}")))
        })
        .transpose()
}

fn json_from_blob<T: serde::de::DeserializeOwned>(blob: Option<Vec<u8>>) -> Result<Option<T>> {
    blob.map(|bytes| {
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt(format!("decode blob: {e}")))
    })
    .transpose()
}

fn app_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Vec<u8>, ClaimedApplicationRaw)> {
    Ok((
        row.get(0)?,
        ClaimedApplicationRaw {
            app_name: row.get(1)?,
            device_name: row.get(2)?,
            user_defined_name: row.get(3)?,
            manifest: row.get(4)?,
            policy: row.get(5)?,
            updates_pending: row.get(6)?,
        },
    ))
}

struct ClaimedApplicationRaw {
    app_name: String,
    device_name: String,
    user_defined_name: String,
    manifest: Option<Vec<u8>>,
    policy: Option<Vec<u8>>,
    updates_pending: bool,
}

impl ClaimedApplicationRaw {
    fn into_model(self, key: &[u8]) -> Result<ClaimedApplication> {
        Ok(ClaimedApplication {
            public_key: key_from_blob(key)?,
            app_name: self.app_name,
            device_name: self.device_name,
            user_defined_name: self.user_defined_name,
            manifest: json_from_blob::<Manifest>(self.manifest)?,
            policy: json_from_blob::<PermissionPolicy>(self.policy)?,
            updates_pending: self.updates_pending,
        })
    }
}

impl Store for SqliteStore {
    fn store_guild(&self, guild: &GuildInfo, update: bool) -> Result<()> {
        let conn = self.conn.lock();
        let authority = key_blob(&guild.authority);
        let id = guild.guid.to_string();
        if !update {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM groups WHERE authority = ?1 AND id = ?2",
                    params![authority, id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(StoreError::AlreadyExists(format!("guild {id}")));
            }
        }
        conn.execute(
            "INSERT OR REPLACE INTO groups (authority, id, name, description)
             VALUES (?1, ?2, ?3, ?4)",
            params![authority, id, guild.name, guild.description],
        )?;
        Ok(())
    }

    fn guild(&self, authority: &PublicKey, guid: Uuid) -> Result<Option<GuildInfo>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT name, description FROM groups WHERE authority = ?1 AND id = ?2",
                params![key_blob(authority), guid.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(name, description)| GuildInfo {
            authority: *authority,
            guid,
            name,
            description,
        }))
    }

    fn guilds(&self, authority: &PublicKey) -> Result<Vec<GuildInfo>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id, name, description FROM groups WHERE authority = ?1")?;
        let rows = stmt.query_map(params![key_blob(authority)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut guilds = Vec::new();
        for row in rows {
            let (id, name, description) = row?;
            let guid = Uuid::parse_str(&id)
                .map_err(|e| StoreError::Corrupt(format!("guild id {id}: {e}")))?;
            guilds.push(GuildInfo {
                authority: *authority,
                guid,
                name,
                description,
            });
        }
        Ok(guilds)
    }

    fn remove_guild(&self, authority: &PublicKey, guid: Uuid) -> Result<()> {
        self.conn.lock().execute(
            "DELETE FROM groups WHERE authority = ?1 AND id = ?2",
            params![key_blob(authority), guid.to_string()],
        )?;
        Ok(())
    }

    fn store_identity(&self, identity: &IdentityInfo, update: bool) -> Result<()> {
        let conn = self.conn.lock();
        let authority = key_blob(&identity.authority);
        let id = identity.guid.to_string();
        if !update {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM identities WHERE authority = ?1 AND id = ?2",
                    params![authority, id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(StoreError::AlreadyExists(format!("identity {id}")));
            }
        }
        conn.execute(
            "INSERT OR REPLACE INTO identities (authority, id, name) VALUES (?1, ?2, ?3)",
            params![authority, id, identity.name],
        )?;
        Ok(())
    }

    fn identity(&self, authority: &PublicKey, guid: Uuid) -> Result<Option<IdentityInfo>> {
        let conn = self.conn.lock();
        let name = conn
            .query_row(
                "SELECT name FROM identities WHERE authority = ?1 AND id = ?2",
                params![key_blob(authority), guid.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(name.map(|name| IdentityInfo {
            authority: *authority,
            guid,
            name,
        }))
    }

    fn identities(&self, authority: &PublicKey) -> Result<Vec<IdentityInfo>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, name FROM identities WHERE authority = ?1")?;
        let rows = stmt.query_map(params![key_blob(authority)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut identities = Vec::new();
        for row in rows {
            let (id, name) = row?;
            let guid = Uuid::parse_str(&id)
                .map_err(|e| StoreError::Corrupt(format!("identity id {id}: {e}")))?;
            identities.push(IdentityInfo {
                authority: *authority,
                guid,
                name,
            });
        }
        Ok(identities)
    }

    fn remove_identity(&self, authority: &PublicKey, guid: Uuid) -> Result<()> {
        self.conn.lock().execute(
            "DELETE FROM identities WHERE authority = ?1 AND id = ?2",
            params![key_blob(authority), guid.to_string()],
        )?;
        Ok(())
    }

    fn store_application(&self, app: &ClaimedApplication) -> Result<()> {
        let manifest = json_blob(&app.manifest)?;
        let policy = json_blob(&app.policy)?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO claimed_applications
             (application_pubkey, app_name, dev_name, user_def_name, manifest, policy, updates_pending)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                key_blob(&app.public_key),
                app.app_name,
                app.device_name,
                app.user_defined_name,
                manifest,
                policy,
                app.updates_pending,
            ],
        )?;
        Ok(())
    }

    fn application(&self, public_key: &PublicKey) -> Result<Option<ClaimedApplication>> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT application_pubkey, app_name, dev_name, user_def_name,
                        manifest, policy, updates_pending
                 FROM claimed_applications WHERE application_pubkey = ?1",
                params![key_blob(public_key)],
                app_from_row,
            )
            .optional()?
        };
        row.map(|(key, raw)| raw.into_model(&key)).transpose()
    }

    fn applications(&self) -> Result<Vec<ClaimedApplication>> {
        let raw_rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT application_pubkey, app_name, dev_name, user_def_name,
                        manifest, policy, updates_pending
                 FROM claimed_applications",
            )?;
            let rows = stmt.query_map([], app_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raw_rows
            .into_iter()
            .map(|(key, raw)| raw.into_model(&key))
            .collect()
    }

    fn remove_application(&self, public_key: &PublicKey) -> Result<()> {
        // Foreign keys cascade: identity and membership certificates go with
        // the application row, atomically.
        self.conn.lock().execute(
            "DELETE FROM claimed_applications WHERE application_pubkey = ?1",
            params![key_blob(public_key)],
        )?;
        Ok(())
    }

    fn set_updates_pending(&self, public_key: &PublicKey, pending: bool) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE claimed_applications SET updates_pending = ?2 WHERE application_pubkey = ?1",
            params![key_blob(public_key), pending],
        )?;
        Ok(())
    }

    fn applications_pending_reconciliation(&self) -> Result<Vec<ClaimedApplication>> {
        let raw_rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT application_pubkey, app_name, dev_name, user_def_name,
                        manifest, policy, updates_pending
                 FROM claimed_applications WHERE updates_pending = 1",
            )?;
            let rows = stmt.query_map([], app_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        raw_rows
            .into_iter()
            .map(|(key, raw)| raw.into_model(&key))
            .collect()
    }

    fn store_identity_certificate(&self, cert: &IdentityCertificate) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO identity_certs (subject_pubkey, issuer_key_id, der, id)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                key_blob(cert.subject_public_key()),
                cert.issuer_key_id(),
                cert.der(),
                cert.identity_guid().to_string(),
            ],
        )?;
        Ok(())
    }

    fn identity_certificate(
        &self,
        public_key: &PublicKey,
    ) -> Result<Option<IdentityCertificate>> {
        let der = self
            .conn
            .lock()
            .query_row(
                "SELECT der FROM identity_certs WHERE subject_pubkey = ?1",
                params![key_blob(public_key)],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        der.map(|der| {
            IdentityCertificate::from_der(der)
                .map_err(|e| StoreError::Corrupt(format!("identity certificate: {e}")))
        })
        .transpose()
    }

    fn store_membership_certificate(&self, cert: &MembershipCertificate) -> Result<()> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO membership_certs (subject_pubkey, issuer_key_id, der, guild)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                key_blob(cert.subject_public_key()),
                cert.issuer_key_id(),
                cert.der(),
                cert.guild_guid().to_string(),
            ],
        )?;
        Ok(())
    }

    fn membership_certificates(
        &self,
        public_key: &PublicKey,
    ) -> Result<Vec<MembershipCertificate>> {
        let ders = {
            let conn = self.conn.lock();
            let mut stmt =
                conn.prepare("SELECT der FROM membership_certs WHERE subject_pubkey = ?1")?;
            let rows = stmt.query_map(params![key_blob(public_key)], |row| {
                row.get::<_, Vec<u8>>(0)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        ders.into_iter()
            .map(|der| {
                MembershipCertificate::from_der(der)
                    .map_err(|e| StoreError::Corrupt(format!("membership certificate: {e}")))
            })
            .collect()
    }

    fn remove_membership_certificate(&self, public_key: &PublicKey, guild: Uuid) -> Result<()> {
        self.conn.lock().execute(
            "DELETE FROM membership_certs WHERE subject_pubkey = ?1 AND guild = ?2",
            params![key_blob(public_key), guild.to_string()],
        )?;
        Ok(())
    }

    fn next_serial_number(&self) -> Result<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("UPDATE serial_number SET value = value + 1", [])?;
        let value: i64 = tx.query_row("SELECT value FROM serial_number", [], |row| row.get(0))?;
        tx.commit()?;
        Ok(value as u64)
    }
}
