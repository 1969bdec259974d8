// AccountRepository - account lookup and bookkeeping
//
// The only persisted state the authentication core reads or writes.
// Password hashes are compared by the caller; this layer just moves rows.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;

use crate::AccessLevel;
use crate::database::{Database, FieldExt};

/// An `accounts` table row, as the core sees it.
#[derive(Debug, Clone)]
pub struct Account {
    pub login: String,
    pub password_hash: String,
    pub access_level: AccessLevel,
    pub last_server: u8,
}

impl Account {
    /// Negative access levels are banned.
    pub fn is_banned(&self) -> bool {
        self.access_level < 0
    }
}

pub struct AccountRepository {
    db: Arc<Database>,
    auto_create: bool,
}

impl AccountRepository {
    pub fn new(db: Arc<Database>, auto_create: bool) -> Self {
        AccountRepository { db, auto_create }
    }

    /// Look up an account by (lowercase) login.
    pub async fn get(&self, login: &str) -> Result<Option<Account>> {
        let sql = format!(
            "SELECT login, password, CAST(accessLevel AS SIGNED) AS accessLevel, \
             CAST(lastServer AS SIGNED) AS lastServer \
             FROM accounts WHERE login = '{}'",
            Database::escape_string(login)
        );

        Ok(self.db.query_one(&sql).await?.map(|row| Account {
            login: row.get_string(0),
            password_hash: row.get_string(1),
            access_level: row.get_i32(2),
            last_server: row.get_u8(3),
        }))
    }

    /// Look up an account, creating it with the supplied hash when
    /// auto-creation is enabled. Returns `None` when the account does not
    /// exist and auto-creation is off.
    pub async fn get_or_create(
        &self,
        login: &str,
        password_hash: &str,
        ip: &str,
    ) -> Result<Option<Account>> {
        if let Some(account) = self.get(login).await? {
            return Ok(Some(account));
        }
        if !self.auto_create {
            return Ok(None);
        }

        let sql = format!(
            "INSERT INTO accounts (login, password, accessLevel, lastServer, lastIP, lastactive) \
             VALUES ('{}', '{}', 0, 1, '{}', {})",
            Database::escape_string(login),
            Database::escape_string(password_hash),
            Database::escape_string(ip),
            Utc::now().timestamp_millis()
        );
        self.db.execute(&sql).await?;
        tracing::info!("Auto-created account '{}'", login);

        Ok(Some(Account {
            login: login.to_string(),
            password_hash: password_hash.to_string(),
            access_level: 0,
            last_server: 1,
        }))
    }

    /// Record a successful credential check.
    pub async fn update_last_login(&self, login: &str, ip: &str) -> Result<()> {
        let sql = format!(
            "UPDATE accounts SET lastIP = '{}', lastactive = {} WHERE login = '{}'",
            Database::escape_string(ip),
            Utc::now().timestamp_millis(),
            Database::escape_string(login)
        );
        self.db.execute(&sql).await?;
        Ok(())
    }

    /// Record the server the client selected at PlayOk time.
    pub async fn update_last_server(&self, login: &str, server_id: u8) -> Result<()> {
        let sql = format!(
            "UPDATE accounts SET lastServer = {} WHERE login = '{}'",
            server_id,
            Database::escape_string(login)
        );
        self.db.execute(&sql).await?;
        Ok(())
    }
}
