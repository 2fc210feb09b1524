//! Источник bearer-токена. Протокол авторизации живёт снаружи,
//! здесь только «дай текущий токен».

use ai_providers::CloudError;
use async_trait::async_trait;
use tokio::sync::RwLock;

#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Текущий токен. `None`: запрос уходит без Authorization.
    async fn bearer_token(&self) -> Result<Option<String>, CloudError>;
}

/// Токен, который можно подменить на лету (после логина/рефреша во внешнем слое).
#[derive(Default)]
pub struct StaticToken {
    token: RwLock<Option<String>>,
}

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token.filter(|t| !t.is_empty())),
        }
    }

    pub async fn set(&self, token: Option<String>) {
        *self.token.write().await = token.filter(|t| !t.is_empty());
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn bearer_token(&self) -> Result<Option<String>, CloudError> {
        Ok(self.token.read().await.clone())
    }
}

/// Токен из переменной окружения; читается на каждый запрос.
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl TokenSource for EnvToken {
    async fn bearer_token(&self) -> Result<Option<String>, CloudError> {
        match std::env::var(&self.var) {
            Ok(v) if !v.trim().is_empty() => Ok(Some(v.trim().to_string())),
            Ok(_) | Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(CloudError::Credential(format!("{}: {}", self.var, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_rotation() {
        let source = StaticToken::new(Some("first".into()));
        assert_eq!(source.bearer_token().await, Ok(Some("first".into())));
        source.set(Some(String::new())).await;
        assert_eq!(source.bearer_token().await, Ok(None));
        source.set(Some("second".into())).await;
        assert_eq!(source.bearer_token().await, Ok(Some("second".into())));
    }

    #[tokio::test]
    async fn test_env_token_missing_is_none() {
        let source = EnvToken::new("EMFIELD_TEST_TOKEN_THAT_IS_NEVER_SET");
        assert_eq!(source.bearer_token().await, Ok(None));
    }
}
