use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub app_name: String,
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(app_name: &str, user_id: &str, session_id: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.app_name, self.user_id, self.session_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Author {
    User,
    Agent(String),
}

/// One entry of a conversation: a user turn or a piece of agent output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub author: Author,
    pub text: String,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            author: Author::User,
            text: text.into(),
        }
    }

    pub fn agent(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            author: Author::Agent(name.into()),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub key: SessionKey,
    pub history: Vec<Message>,
    /// Latest value published under each pipeline output key.
    pub state: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn new(key: SessionKey) -> Self {
        Self {
            key,
            history: Vec::new(),
            state: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session already exists: {0}")]
    AlreadyExists(SessionKey),

    #[error("session not found: {0}")]
    NotFound(SessionKey),
}

/// Outcome of [`SessionStore::acquire`].
#[derive(Debug)]
pub enum Acquired {
    Created(Session),
    Existing(Session),
}

impl Acquired {
    pub fn session(&self) -> &Session {
        match self {
            Acquired::Created(s) | Acquired::Existing(s) => s,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Acquired::Created(_))
    }
}

/// In-memory conversation store. Contents are lost when the process exits.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionKey, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, key: SessionKey) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&key) {
            return Err(SessionError::AlreadyExists(key));
        }
        let session = Session::new(key.clone());
        sessions.insert(key, session.clone());
        debug!(session = %session.key, "session created");
        Ok(session)
    }

    /// Returns a snapshot of the session.
    pub async fn get(&self, key: &SessionKey) -> Option<Session> {
        self.sessions.read().await.get(key).cloned()
    }

    /// Creates the session, or returns the existing one when the key is taken.
    pub async fn acquire(&self, key: SessionKey) -> Result<Acquired, SessionError> {
        match self.create(key).await {
            Ok(session) => Ok(Acquired::Created(session)),
            Err(SessionError::AlreadyExists(key)) => self
                .get(&key)
                .await
                .map(Acquired::Existing)
                .ok_or(SessionError::NotFound(key)),
            Err(e) => Err(e),
        }
    }

    /// Appends `messages` to the history and publishes `state` entries.
    pub async fn append(
        &self,
        key: &SessionKey,
        messages: impl IntoIterator<Item = Message>,
        state: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| SessionError::NotFound(key.clone()))?;
        session.history.extend(messages);
        session.state.extend(state);
        Ok(())
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
