use crate::constants::ANTHROPIC_MESSAGES_URL;
use crate::store::DbPool;
use clap::Parser;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "colloquy.db")]
    pub database: String,
    #[arg(long, default_value = ANTHROPIC_MESSAGES_URL)]
    pub upstream_url: String,
    #[arg(long, default_value_t = 600)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 2 * 1024 * 1024)]
    pub max_body_size: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub client: reqwest::Client,
    pub anthropic_key: String,
    pub gate_password: String,
    pub db: DbPool,
    pub sessions: Arc<RwLock<HashMap<String, String>>>,
    pub args: Arc<Args>,
}

impl AppState {
    pub fn verify_password(&self, candidate: &str) -> bool {
        Sha256::digest(candidate.as_bytes()) == Sha256::digest(self.gate_password.as_bytes())
    }

    /// Mints a session grant for the username and records it. Grants live for
    /// the process lifetime.
    pub async fn issue_session(&self, username: &str) -> String {
        let token = format!("tok_{}", Uuid::new_v4().simple());
        self.sessions
            .write()
            .await
            .insert(token.clone(), username.to_string());
        token
    }

    pub async fn session_user(&self, token: &str) -> Option<String> {
        self.sessions.read().await.get(token).cloned()
    }
}
