use anyhow::{anyhow, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{new_id, now_ms, Store};

/// One configured model endpoint. `api_key` holds base64-wrapped ciphertext;
/// decryption happens outside the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub user_id: String,
    /// Provider family tag, e.g. "openai", "deepseek", "claude", "qwen".
    pub provider: String,
    /// Optional model-name override sent on the wire.
    pub model_name: Option<String>,
    pub enabled: bool,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub base_url: Option<String>,
    pub created_at: i64,
}

fn row_to_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModelConfig> {
    Ok(ModelConfig {
        id: row.get(0)?,
        user_id: row.get(1)?,
        provider: row.get(2)?,
        model_name: row.get(3)?,
        enabled: row.get::<_, i64>(4)? != 0,
        api_key: row.get(5)?,
        base_url: row.get(6)?,
        created_at: row.get(7)?,
    })
}

const COLUMNS: &str = "id, user_id, provider, model_name, enabled, api_key, base_url, created_at";

impl Store {
    pub async fn create_model_config(&self, mut cfg: ModelConfig) -> Result<ModelConfig> {
        if cfg.provider.trim().is_empty() {
            return Err(anyhow!("model provider required"));
        }
        if cfg.id.is_empty() {
            cfg.id = new_id();
        }
        cfg.created_at = now_ms();

        let conn = self.conn().lock().await;
        conn.execute(
            "INSERT INTO model_configs (id, user_id, provider, model_name, enabled, api_key, base_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                &cfg.id,
                &cfg.user_id,
                &cfg.provider,
                cfg.model_name.as_deref(),
                cfg.enabled as i64,
                &cfg.api_key,
                cfg.base_url.as_deref(),
                cfg.created_at
            ],
        )?;
        Ok(cfg)
    }

    pub async fn get_model_config(&self, id: &str) -> Result<Option<ModelConfig>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM model_configs WHERE id = ?1"
        ))?;
        let mut rows = stmt.query(params![id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(row_to_config(row)?))
    }

    pub async fn list_model_configs(&self, user_id: &str) -> Result<Vec<ModelConfig>> {
        let conn = self.conn().lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM model_configs WHERE user_id = ?1 ORDER BY created_at ASC"
        ))?;
        let out = stmt
            .query_map(params![user_id], row_to_config)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(out)
    }

    pub async fn update_model_config(&self, cfg: &ModelConfig) -> Result<()> {
        let conn = self.conn().lock().await;
        let changed = conn.execute(
            "UPDATE model_configs SET provider = ?2, model_name = ?3, enabled = ?4,
             api_key = ?5, base_url = ?6 WHERE id = ?1",
            params![
                &cfg.id,
                &cfg.provider,
                cfg.model_name.as_deref(),
                cfg.enabled as i64,
                &cfg.api_key,
                cfg.base_url.as_deref()
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("model config {} not found", cfg.id));
        }
        Ok(())
    }

    pub async fn delete_model_config(&self, id: &str) -> Result<()> {
        let conn = self.conn().lock().await;
        conn.execute("DELETE FROM model_configs WHERE id = ?1", params![id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(user_id: &str) -> ModelConfig {
        ModelConfig {
            id: String::new(),
            user_id: user_id.to_string(),
            provider: "openai".to_string(),
            model_name: Some("gpt-4o".to_string()),
            enabled: true,
            api_key: "c2VjcmV0".to_string(),
            base_url: None,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let created = store.create_model_config(sample("u1")).await.unwrap();
        assert!(!created.id.is_empty());

        let mut loaded = store.get_model_config(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded.provider, "openai");
        assert!(loaded.enabled);

        loaded.enabled = false;
        store.update_model_config(&loaded).await.unwrap();
        let reloaded = store.get_model_config(&created.id).await.unwrap().unwrap();
        assert!(!reloaded.enabled);
    }
}
