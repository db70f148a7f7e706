use anyhow::{anyhow, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{new_id, now_ms, Store};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub created_at: i64,
}

impl Store {
    pub async fn create_user(&self, username: &str) -> Result<User> {
        let username = username.trim();
        if username.is_empty() {
            return Err(anyhow!("username required"));
        }

        let user = User {
            id: new_id(),
            username: username.to_string(),
            created_at: now_ms(),
        };

        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO users (id, username, created_at) VALUES (?1, ?2, ?3)",
            params![&user.id, &user.username, user.created_at],
        )?;
        Ok(user)
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn().lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT id, username, created_at FROM users WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(User {
            id: row.get(0)?,
            username: row.get(1)?,
            created_at: row.get(2)?,
        }))
    }

    pub async fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn
            .prepare_cached("SELECT id, username, created_at FROM users ORDER BY created_at ASC")?;
        let users = stmt
            .query_map([], |row| {
                Ok(User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }

    pub async fn count_users(&self) -> Result<usize> {
        let conn = self.conn().lock().await;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_get() {
        let store = Store::open_in_memory().unwrap();
        let user = store.create_user("alice").await.unwrap();
        let loaded = store.get_user(&user.id).await.unwrap().unwrap();
        assert_eq!(loaded.username, "alice");
        assert!(store.get_user("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_username_rejected() {
        let store = Store::open_in_memory().unwrap();
        store.create_user("bob").await.unwrap();
        assert!(store.create_user("bob").await.is_err());
    }
}
