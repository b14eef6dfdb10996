use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Method;
use tracing::{debug, warn};

use replyhub_core::api::{RequestOptions, VERIFY_ENDPOINT};
use replyhub_core::config::{StorageBackend, STORAGE_PASSPHRASE_ENV};
use replyhub_core::identity::{IdentityProvider, RestIdentityConfig, RestIdentityProvider};
use replyhub_core::storage::{EncryptedFileStore, FileStore, KeyValueStore, KeyringStore};
use replyhub_core::{AuthContext, Config, SessionStatus};

const PASSWORD_ENV: &str = "REPLYHUB_PASSWORD";

pub struct App {
    config: Config,
    ctx: AuthContext,
}

impl App {
    pub async fn open(api_url: Option<String>) -> Result<Self> {
        let mut config = Config::load()?;
        if let Some(url) = api_url {
            config.api_base_url = Some(url);
        }

        let storage = open_storage(&config)?;
        let identity = open_identity(&config, Arc::clone(&storage))?;
        let ctx = AuthContext::from_config(&config, storage, identity)?;

        let session = ctx.init().await;
        debug!(status = %session.status(), "Session ready");
        Ok(Self { config, ctx })
    }

    pub fn close(&self) {
        self.ctx.dispose();
    }

    pub async fn login(&mut self, email: Option<String>) -> Result<()> {
        let email = self.resolve_email(email)?;
        let password = read_password()?;

        let credential = self
            .ctx
            .credentials()
            .sign_in_with_password(&email, &password)
            .await?;
        self.remember_email(email);
        println!("Signed in as {}", credential.identity.label());
        Ok(())
    }

    pub async fn register(&mut self, email: Option<String>) -> Result<()> {
        let email = self.resolve_email(email)?;
        let password = read_password()?;

        let credential = self.ctx.credentials().register(&email, &password).await?;
        self.remember_email(email);
        println!("Account created for {}", credential.identity.email);
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        let outcome = self.ctx.credentials().sign_out().await;
        match outcome.remote_error {
            None => println!("Signed out"),
            Some(e) => println!("Signed out locally (identity service: {})", e),
        }
        Ok(())
    }

    pub fn status(&self) -> Result<()> {
        let session = self.ctx.session();
        println!("Status:        {}", session.status());

        if let Some(identity) = session.identity() {
            println!("User:          {} ({})", identity.label(), identity.subject_id);
        }
        if let Some(token) = session.token() {
            match token.minutes_until_expiry() {
                Some(m) if m > 0 => println!("Token expires: in {} minutes", m),
                Some(_) => println!("Token expires: expired"),
                None => println!("Token expires: unknown"),
            }
        }
        if let Some(at) = session.last_verified_at() {
            let minutes = (Utc::now() - at).num_minutes();
            println!("Last verified: {} minutes ago", minutes);
        }
        Ok(())
    }

    pub async fn me(&self) -> Result<()> {
        let me: serde_json::Value = self.ctx.client().get_json(VERIFY_ENDPOINT).await?;
        println!("{}", serde_json::to_string_pretty(&me)?);
        Ok(())
    }

    pub async fn request(&self, method: &str, endpoint: &str, data: Option<&str>) -> Result<()> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .with_context(|| format!("Invalid HTTP method: {}", method))?;
        let mut options = RequestOptions::new(method);
        if let Some(data) = data {
            let body: serde_json::Value =
                serde_json::from_str(data).context("--data must be valid JSON")?;
            options = options.json(body);
        }

        let response = self.ctx.client().request(endpoint, options).await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read response body")?;

        eprintln!("{}", status);
        match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
            Err(_) => println!("{}", body),
        }
        if self.ctx.session().status() == SessionStatus::Expired {
            eprintln!("Session expired - run `replyhub login` again");
        }
        Ok(())
    }

    fn resolve_email(&self, email: Option<String>) -> Result<String> {
        if let Some(email) = email {
            return Ok(email);
        }
        match &self.config.last_email {
            Some(last) => {
                let entered = prompt(&format!("Email [{}]: ", last))?;
                Ok(if entered.is_empty() { last.clone() } else { entered })
            }
            None => prompt("Email: "),
        }
    }

    fn remember_email(&mut self, email: String) {
        self.config.last_email = Some(email);
        if let Err(e) = self.config.save() {
            warn!(error = %e, "Failed to save config");
        }
    }
}

fn open_storage(config: &Config) -> Result<Arc<dyn KeyValueStore>> {
    let dir = config.cache_dir()?;
    let storage: Arc<dyn KeyValueStore> = match config.storage {
        StorageBackend::File => Arc::new(FileStore::new(dir)?),
        StorageBackend::Encrypted => {
            let passphrase = std::env::var(STORAGE_PASSPHRASE_ENV).with_context(|| {
                format!("{} must be set for encrypted storage", STORAGE_PASSPHRASE_ENV)
            })?;
            Arc::new(EncryptedFileStore::open(dir, &passphrase)?)
        }
        StorageBackend::Keyring => Arc::new(KeyringStore::default()),
    };
    Ok(storage)
}

fn open_identity(
    config: &Config,
    storage: Arc<dyn KeyValueStore>,
) -> Result<Option<Arc<dyn IdentityProvider>>> {
    let Some(api_key) = config.identity_api_key() else {
        warn!("No identity API key configured; sign-in is unavailable");
        return Ok(None);
    };

    let mut identity_config = RestIdentityConfig::new(api_key);
    if let Some(url) = &config.identity.auth_base_url {
        identity_config.auth_base_url = url.clone();
    }
    if let Some(url) = &config.identity.token_base_url {
        identity_config.token_base_url = url.clone();
    }

    let provider: Arc<dyn IdentityProvider> =
        Arc::new(RestIdentityProvider::new(identity_config, storage)?);
    Ok(Some(provider))
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn read_password() -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(password);
    }
    let password = rpassword::prompt_password("Password: ")?;
    Ok(password)
}
