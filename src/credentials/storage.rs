//! SQLite-backed credential store.
//!
//! # Schema
//! ```sql
//! CREATE TABLE credentials (
//!     id INTEGER PRIMARY KEY,
//!     subject TEXT NOT NULL UNIQUE,         -- stable identity id
//!     email TEXT NOT NULL UNIQUE,
//!     name TEXT NOT NULL,
//!     picture TEXT,
//!     role TEXT NOT NULL,
//!     session_refresh_token TEXT,           -- Encrypted
//!     session_refresh_nonce TEXT,
//!     google_access_token TEXT,             -- Encrypted
//!     google_access_nonce TEXT,
//!     google_refresh_token TEXT,            -- Encrypted
//!     google_refresh_nonce TEXT,
//!     google_token_expires_at TEXT,         -- ISO 8601 timestamp
//!     created_at TEXT NOT NULL,
//!     updated_at TEXT NOT NULL
//! );
//! ```
//!
//! Writes are whole-record upserts, last-writer-wins. Callers read the full
//! record, modify it, and write it back; the store never updates individual
//! fields behind a caller's back.
//!
//! # Thread Safety
//! - Connection is wrapped in Mutex for safe concurrent access
//! - SQLite itself is thread-safe with serialized mode

use super::{encryption::MasterKey, Role, UserCredential};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Mutex;

pub struct CredentialStore {
    conn: Mutex<Connection>,
    key: MasterKey,
}

/// Row as stored, before token values are opened.
struct RawRow {
    subject: String,
    email: String,
    name: String,
    picture: Option<String>,
    role: String,
    session_refresh_token: Option<String>,
    session_refresh_nonce: Option<String>,
    google_access_token: Option<String>,
    google_access_nonce: Option<String>,
    google_refresh_token: Option<String>,
    google_refresh_nonce: Option<String>,
    google_token_expires_at: Option<String>,
    created_at: String,
    updated_at: String,
}

const SELECT_COLUMNS: &str = "subject, email, name, picture, role, \
     session_refresh_token, session_refresh_nonce, \
     google_access_token, google_access_nonce, \
     google_refresh_token, google_refresh_nonce, \
     google_token_expires_at, created_at, updated_at";

fn read_raw_row(row: &Row) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        subject: row.get(0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        picture: row.get(3)?,
        role: row.get(4)?,
        session_refresh_token: row.get(5)?,
        session_refresh_nonce: row.get(6)?,
        google_access_token: row.get(7)?,
        google_access_nonce: row.get(8)?,
        google_refresh_token: row.get(9)?,
        google_refresh_nonce: row.get(10)?,
        google_token_expires_at: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse timestamp '{}'", value))
}

impl CredentialStore {
    /// Creates or opens a credential store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (`:memory:` for tests)
    /// * `encryption_key` - Base64-encoded 32-byte master key
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let key = MasterKey::from_base64(encryption_key).context("Invalid encryption key")?;

        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY,
                subject TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                picture TEXT,
                role TEXT NOT NULL,
                session_refresh_token TEXT,
                session_refresh_nonce TEXT,
                google_access_token TEXT,
                google_access_nonce TEXT,
                google_refresh_token TEXT,
                google_refresh_nonce TEXT,
                google_token_expires_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create credentials table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_credentials_email ON credentials(email)",
            [],
        )
        .context("Failed to create email index")?;

        Ok(Self {
            conn: Mutex::new(conn),
            key,
        })
    }

    /// Writes the full record, inserting or replacing by subject.
    ///
    /// `created_at` is preserved for existing rows; everything else is
    /// overwritten with the caller's copy.
    pub fn upsert(&self, credential: &UserCredential) -> Result<()> {
        let (srt, srt_nonce) = self
            .key
            .seal_opt(credential.session_refresh_token.as_deref())
            .context("Failed to encrypt session refresh token")?;
        let (gat, gat_nonce) = self
            .key
            .seal_opt(credential.google_access_token.as_deref())
            .context("Failed to encrypt Google access token")?;
        let (grt, grt_nonce) = self
            .key
            .seal_opt(credential.google_refresh_token.as_deref())
            .context("Failed to encrypt Google refresh token")?;

        let expires_at = credential.google_token_expires_at.map(|dt| dt.to_rfc3339());

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO credentials (
                    subject, email, name, picture, role,
                    session_refresh_token, session_refresh_nonce,
                    google_access_token, google_access_nonce,
                    google_refresh_token, google_refresh_nonce,
                    google_token_expires_at, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                ON CONFLICT(subject) DO UPDATE SET
                    email = excluded.email,
                    name = excluded.name,
                    picture = excluded.picture,
                    role = excluded.role,
                    session_refresh_token = excluded.session_refresh_token,
                    session_refresh_nonce = excluded.session_refresh_nonce,
                    google_access_token = excluded.google_access_token,
                    google_access_nonce = excluded.google_access_nonce,
                    google_refresh_token = excluded.google_refresh_token,
                    google_refresh_nonce = excluded.google_refresh_nonce,
                    google_token_expires_at = excluded.google_token_expires_at,
                    updated_at = excluded.updated_at
                "#,
                params![
                    credential.subject,
                    credential.email,
                    credential.name,
                    credential.picture,
                    credential.role.as_str(),
                    srt,
                    srt_nonce,
                    gat,
                    gat_nonce,
                    grt,
                    grt_nonce,
                    expires_at,
                    credential.created_at.to_rfc3339(),
                    credential.updated_at.to_rfc3339(),
                ],
            )
            .context("Failed to write credential record")?;

        Ok(())
    }

    /// Looks up a record by its stable subject id.
    pub fn find_by_subject(&self, subject: &str) -> Result<Option<UserCredential>> {
        self.find_where("subject = ?1", subject)
    }

    /// Looks up a record by email. Inbound principal evidence carries an
    /// email claim, not a subject id.
    pub fn find_by_email(&self, email: &str) -> Result<Option<UserCredential>> {
        self.find_where("email = ?1", email)
    }

    fn find_where(&self, predicate: &str, param: &str) -> Result<Option<UserCredential>> {
        let raw = {
            let conn = self.conn.lock().unwrap();
            let sql = format!(
                "SELECT {} FROM credentials WHERE {}",
                SELECT_COLUMNS, predicate
            );
            let mut stmt = conn.prepare(&sql).context("Failed to prepare query")?;

            let mut rows = stmt
                .query_map(params![param], read_raw_row)
                .context("Failed to execute query")?
                .collect::<rusqlite::Result<Vec<RawRow>>>()
                .context("Failed to read row")?;

            match rows.len() {
                0 => return Ok(None),
                _ => rows.remove(0),
            }
        };

        Ok(Some(self.open_row(raw)?))
    }

    /// All records, in insertion order.
    pub fn list_all(&self) -> Result<Vec<UserCredential>> {
        self.list_where("1 = 1")
    }

    /// Records currently holding a delegated access token. The sweeps and
    /// health reporting operate on this subset.
    pub fn list_with_google_tokens(&self) -> Result<Vec<UserCredential>> {
        self.list_where("google_access_token IS NOT NULL")
    }

    fn list_where(&self, predicate: &str) -> Result<Vec<UserCredential>> {
        let raw_rows = {
            let conn = self.conn.lock().unwrap();
            let sql = format!(
                "SELECT {} FROM credentials WHERE {} ORDER BY id",
                SELECT_COLUMNS, predicate
            );
            let mut stmt = conn.prepare(&sql).context("Failed to prepare query")?;

            let rows = stmt
                .query_map([], read_raw_row)
                .context("Failed to execute query")?
                .collect::<rusqlite::Result<Vec<RawRow>>>()
                .context("Failed to read rows")?;
            rows
        };

        raw_rows.into_iter().map(|raw| self.open_row(raw)).collect()
    }

    /// Decrypts token columns and assembles the domain record.
    fn open_row(&self, raw: RawRow) -> Result<UserCredential> {
        let session_refresh_token = self
            .key
            .open_opt(raw.session_refresh_token, raw.session_refresh_nonce)
            .context("Failed to decrypt session refresh token")?;
        let google_access_token = self
            .key
            .open_opt(raw.google_access_token, raw.google_access_nonce)
            .context("Failed to decrypt Google access token")?;
        let google_refresh_token = self
            .key
            .open_opt(raw.google_refresh_token, raw.google_refresh_nonce)
            .context("Failed to decrypt Google refresh token")?;

        let google_token_expires_at = raw
            .google_token_expires_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()?;

        Ok(UserCredential {
            subject: raw.subject,
            email: raw.email,
            name: raw.name,
            picture: raw.picture,
            role: Role::parse(&raw.role)?,
            session_refresh_token,
            google_access_token,
            google_refresh_token,
            google_token_expires_at,
            created_at: parse_timestamp(&raw.created_at)?,
            updated_at: parse_timestamp(&raw.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use chrono::Duration;

    fn create_test_store() -> CredentialStore {
        let key = BASE64.encode([0u8; 32]);
        CredentialStore::new(":memory:", &key).expect("Failed to create test store")
    }

    fn create_test_credential() -> UserCredential {
        let now = Utc::now();
        let mut cred = UserCredential::new(
            "google-sub-1",
            "user@example.com",
            "Test User",
            Some("https://example.com/p.jpg".to_string()),
            Role::User,
            now,
        );
        cred.session_refresh_token = Some("session-refresh-token".to_string());
        cred.google_access_token = Some("ya29.access".to_string());
        cred.google_refresh_token = Some("1//refresh".to_string());
        cred.google_token_expires_at = Some(now + Duration::hours(1));
        cred
    }

    #[test]
    fn test_upsert_and_find_by_subject() {
        let store = create_test_store();
        let cred = create_test_credential();

        store.upsert(&cred).expect("Failed to upsert");

        let found = store
            .find_by_subject("google-sub-1")
            .expect("Failed to query")
            .expect("Record not found");

        assert_eq!(found.email, cred.email);
        assert_eq!(found.session_refresh_token, cred.session_refresh_token);
        assert_eq!(found.google_access_token, cred.google_access_token);
        assert_eq!(found.google_refresh_token, cred.google_refresh_token);
        assert!(found.google_token_expires_at.is_some());
        assert_eq!(found.role, Role::User);
    }

    #[test]
    fn test_find_by_email() {
        let store = create_test_store();
        store.upsert(&create_test_credential()).unwrap();

        let found = store
            .find_by_email("user@example.com")
            .unwrap()
            .expect("Record not found by email");
        assert_eq!(found.subject, "google-sub-1");

        assert!(store.find_by_email("nobody@example.com").unwrap().is_none());
    }

    #[test]
    fn test_find_nonexistent() {
        let store = create_test_store();
        assert!(store.find_by_subject("missing").unwrap().is_none());
    }

    #[test]
    fn test_upsert_replaces_whole_record() {
        let store = create_test_store();
        let mut cred = create_test_credential();
        store.upsert(&cred).unwrap();

        cred.google_access_token = Some("ya29.newer".to_string());
        cred.session_refresh_token = None;
        cred.updated_at = Utc::now() + Duration::seconds(5);
        store.upsert(&cred).unwrap();

        let found = store.find_by_subject("google-sub-1").unwrap().unwrap();
        assert_eq!(found.google_access_token, Some("ya29.newer".to_string()));
        assert!(found.session_refresh_token.is_none());
        // Untouched field survives the rewrite
        assert_eq!(found.google_refresh_token, Some("1//refresh".to_string()));
    }

    #[test]
    fn test_upsert_preserves_created_at() {
        let store = create_test_store();
        let mut cred = create_test_credential();
        let original_created = cred.created_at;
        store.upsert(&cred).unwrap();

        cred.created_at = original_created + Duration::days(1);
        cred.updated_at = Utc::now();
        store.upsert(&cred).unwrap();

        let found = store.find_by_subject("google-sub-1").unwrap().unwrap();
        assert_eq!(
            found.created_at.timestamp(),
            original_created.timestamp(),
            "created_at must not change on update"
        );
    }

    #[test]
    fn test_list_with_google_tokens() {
        let store = create_test_store();

        let with_token = create_test_credential();
        store.upsert(&with_token).unwrap();

        let without_token = UserCredential::new(
            "google-sub-2",
            "other@example.com",
            "Other",
            None,
            Role::User,
            Utc::now(),
        );
        store.upsert(&without_token).unwrap();

        let tracked = store.list_with_google_tokens().unwrap();
        assert_eq!(tracked.len(), 1);
        assert_eq!(tracked[0].subject, "google-sub-1");

        assert_eq!(store.list_all().unwrap().len(), 2);
    }

    #[test]
    fn test_roles_persist() {
        let store = create_test_store();
        let mut cred = create_test_credential();
        cred.role = Role::Admin;
        store.upsert(&cred).unwrap();

        let found = store.find_by_subject("google-sub-1").unwrap().unwrap();
        assert_eq!(found.role, Role::Admin);
    }

    #[test]
    fn test_tokens_encrypted_at_rest() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("credentials.db");
        let key = BASE64.encode([0u8; 32]);

        let store = CredentialStore::new(&db_path, &key).unwrap();
        store.upsert(&create_test_credential()).unwrap();
        drop(store);

        // Read the raw column with a second connection: the stored value
        // must not be the plaintext token.
        let conn = Connection::open(&db_path).unwrap();
        let raw: String = conn
            .query_row(
                "SELECT google_access_token FROM credentials WHERE subject = 'google-sub-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_ne!(raw, "ya29.access");
        assert!(!raw.contains("ya29"));
    }

    #[test]
    fn test_invalid_encryption_key() {
        assert!(CredentialStore::new(":memory:", "short").is_err());
        assert!(CredentialStore::new(":memory:", "not-valid-base64!@#$").is_err());
    }
}
