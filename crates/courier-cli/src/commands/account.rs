use super::open_messenger;
use crate::config::Config;
use crate::output::Output;
use anyhow::Result;
use courier::Account;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct WhoAmI<'a> {
    user_id: &'a str,
    device_id: u32,
    identity_key: Option<String>,
    server_url: &'a str,
    api_url: &'a str,
}

pub struct LoginArgs {
    pub user_id: String,
    pub device_id: u32,
    pub token: Option<String>,
    pub server_url: Option<String>,
    pub api_url: Option<String>,
}

/// Saves the account and publishes keys for this device.
pub async fn login(
    args: LoginArgs,
    config: &mut Config,
    data_dir: &Path,
    output: &Output,
) -> Result<()> {
    if let Some(current) = &config.account {
        if current.user_id != args.user_id || current.device_id != args.device_id {
            anyhow::bail!(
                "Already logged in as {}.{}; run `courier logout` first",
                current.user_id,
                current.device_id
            );
        }
    }

    config.account = Some(Account {
        user_id: args.user_id,
        device_id: args.device_id,
        auth_token: args.token,
    });
    if let Some(url) = args.server_url {
        config.engine.server_url = url;
    }
    if let Some(url) = args.api_url {
        config.api_url = url;
    }
    config.engine.validate()?;
    config.save()?;

    let messenger = open_messenger(config, data_dir)?;
    messenger.sessions().ensure_keys(false, true).await?;
    whoami_with(config, messenger.sessions().identity_key()?, "login", output)
}

/// Wipes keys, sessions, queued sends and messages, then forgets the account.
pub async fn logout(config: &mut Config, data_dir: &Path, output: &Output) -> Result<()> {
    if !config.is_logged_in() {
        output.success_message("logout", "Not logged in");
        return Ok(());
    }
    let messenger = open_messenger(config, data_dir)?;
    messenger.sign_out()?;
    config.account = None;
    config.storage_key = None;
    config.save()?;
    output.success_message("logout", "Logged out, local data wiped");
    Ok(())
}

pub async fn whoami(config: &mut Config, data_dir: &Path, output: &Output) -> Result<()> {
    let messenger = open_messenger(config, data_dir)?;
    let identity_key = messenger.sessions().identity_key()?;
    whoami_with(config, identity_key, "whoami", output)
}

fn whoami_with(
    config: &Config,
    identity_key: Option<String>,
    command: &str,
    output: &Output,
) -> Result<()> {
    let account = config.account()?;
    output.success(
        command,
        WhoAmI {
            user_id: &account.user_id,
            device_id: account.device_id,
            identity_key,
            server_url: &config.engine.server_url,
            api_url: &config.api_url,
        },
    );
    Ok(())
}
