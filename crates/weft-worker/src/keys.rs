// Provider API key resolution for the executing user

use async_trait::async_trait;
use uuid::Uuid;

use weft_core::error::Result;
use weft_core::traits::ApiKeyResolver;
use weft_storage::{Database, EncryptionService};

/// Resolves a user's stored provider key and decrypts it
#[derive(Clone)]
pub struct DbApiKeyResolver {
    db: Database,
    encryption: EncryptionService,
    user_id: Uuid,
}

impl DbApiKeyResolver {
    pub fn new(db: Database, encryption: EncryptionService, user_id: Uuid) -> Self {
        Self {
            db,
            encryption,
            user_id,
        }
    }
}

#[async_trait]
impl ApiKeyResolver for DbApiKeyResolver {
    async fn resolve(&self, provider: &str) -> Result<Option<String>> {
        let Some(row) = self.db.get_provider_key(self.user_id, provider).await? else {
            return Ok(None);
        };
        let key = self.encryption.decrypt(&row.encrypted_key)?;
        Ok(Some(key))
    }
}
