//! AI credential / model / component-binding registry.
//!
//! A credential owns its models (cascade delete); bindings reference
//! models weakly (SET NULL) so removing a model silently unbinds the
//! component instead of breaking it.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use atlas_core::crypto::KeyVault;
use atlas_core::time::to_db;
use atlas_core::utc_now;

use crate::error::{Result, StoreError};
use crate::Store;

/// Which subsystem a binding configures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiComponent {
    Assistant,
    Lightrag,
}

impl AiComponent {
    pub fn as_str(self) -> &'static str {
        match self {
            AiComponent::Assistant => "assistant",
            AiComponent::Lightrag => "lightrag",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiModelType {
    Llm,
    Embedding,
}

impl AiModelType {
    pub fn as_str(self) -> &'static str {
        match self {
            AiModelType::Llm => "llm",
            AiModelType::Embedding => "embedding",
        }
    }
}

/// Resolved runtime configuration for an OpenAI-compatible endpoint.
/// `api_key` is already decrypted — do not persist this struct.
#[derive(Debug, Clone, Serialize)]
pub struct OpenAiCompatConfig {
    #[serde(skip_serializing)]
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub credential_id: String,
    pub model_id: String,
}

fn normalize_base_url(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1")
    }
}

impl Store {
    pub fn create_ai_credential(
        &self,
        name: &str,
        base_url: &str,
        api_key: &str,
        vault: &KeyVault,
    ) -> Result<String> {
        let sealed = vault
            .seal(api_key)
            .map_err(|e| StoreError::Validation(e.to_string()))?;
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now_str = to_db(utc_now());
        conn.execute(
            "INSERT INTO ai_credentials
             (id, name, base_url, api_key_encrypted, api_key_hint, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![id, name, base_url, sealed, KeyVault::hint(api_key), now_str],
        )?;
        Ok(id)
    }

    pub fn add_ai_model(
        &self,
        credential_id: &str,
        name: &str,
        model_type: AiModelType,
    ) -> Result<String> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now_str = to_db(utc_now());
        conn.execute(
            "INSERT INTO ai_models (id, credential_id, name, model_type, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, credential_id, name, model_type.as_str(), now_str],
        )?;
        Ok(id)
    }

    /// Pin a model to a component slot, creating the binding row on
    /// first use.
    pub fn bind_component_model(
        &self,
        component: AiComponent,
        model_type: AiModelType,
        model_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now_str = to_db(utc_now());
        let column = match model_type {
            AiModelType::Llm => "llm_model_id",
            AiModelType::Embedding => "embedding_model_id",
        };
        conn.execute(
            "INSERT INTO ai_component_bindings (id, component, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(component) DO NOTHING",
            params![Uuid::new_v4().to_string(), component.as_str(), now_str],
        )?;
        conn.execute(
            &format!(
                "UPDATE ai_component_bindings SET {column} = ?1, updated_at = ?2
                 WHERE component = ?3"
            ),
            params![model_id, now_str, component.as_str()],
        )?;
        Ok(())
    }

    /// Resolve binding → model → credential into a usable endpoint
    /// config. Any broken link yields `None` rather than an error — a
    /// half-configured registry just means "feature unconfigured".
    pub fn resolve_openai_compat(
        &self,
        component: AiComponent,
        model_type: AiModelType,
        vault: &KeyVault,
    ) -> Result<Option<OpenAiCompatConfig>> {
        let conn = self.conn.lock().unwrap();
        let column = match model_type {
            AiModelType::Llm => "llm_model_id",
            AiModelType::Embedding => "embedding_model_id",
        };
        let model_id: Option<String> = conn
            .query_row(
                &format!("SELECT {column} FROM ai_component_bindings WHERE component = ?1"),
                [component.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let Some(model_id) = model_id else {
            return Ok(None);
        };

        let model: Option<(String, String, String)> = conn
            .query_row(
                "SELECT credential_id, name, model_type FROM ai_models WHERE id = ?1",
                [&model_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((credential_id, model_name, stored_type)) = model else {
            return Ok(None);
        };
        if stored_type.trim() != model_type.as_str() {
            return Ok(None);
        }

        let credential: Option<(String, String)> = conn
            .query_row(
                "SELECT base_url, api_key_encrypted FROM ai_credentials WHERE id = ?1",
                [&credential_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((base_url, sealed)) = credential else {
            return Ok(None);
        };

        let Ok(api_key) = vault.open(&sealed) else {
            return Ok(None);
        };

        let model_name = model_name.trim().to_string();
        let base_url = normalize_base_url(&base_url);
        let api_key = api_key.trim().to_string();
        if model_name.is_empty() || base_url.is_empty() || api_key.is_empty() {
            return Ok(None);
        }

        Ok(Some(OpenAiCompatConfig {
            api_key,
            base_url,
            model: model_name,
            credential_id,
            model_id,
        }))
    }
}
