//! Shared Application State
//!
//! `AppContext` is created once at startup and handed to whatever needs the
//! backend or the signed-in user's profile.

use crate::api::ApiClient;
use crate::config::Config;
use crate::models::{User, UserStats};
use signstream_core::store::StateHolder;
use std::sync::Arc;
use tracing::info;

pub struct AppContext {
    pub config: Arc<Config>,
    pub api: ApiClient,
    pub user: StateHolder<User>,
    pub stats: StateHolder<UserStats>,
}

impl AppContext {
    pub fn new(config: Config) -> Arc<Self> {
        let api = ApiClient::new(config.api_base_url.clone());
        Arc::new(Self {
            config: Arc::new(config),
            api,
            user: StateHolder::new(),
            stats: StateHolder::new(),
        })
    }

    /// Reloads the profile and, when that worked, the stats that go with it.
    pub async fn refresh_user(&self) -> Option<User> {
        let user = self
            .user
            .refresh(|| async { self.api.current_user().await.map_err(anyhow::Error::from) })
            .await?;
        self.refresh_stats().await;
        info!(user = %user.display_name(), "Profile loaded");
        Some(user)
    }

    pub async fn refresh_stats(&self) -> Option<UserStats> {
        self.stats
            .refresh(|| async { self.api.user_stats().await.map_err(anyhow::Error::from) })
            .await
    }

    pub fn sign_out(&self) {
        self.user.clear();
        self.stats.clear();
    }
}
