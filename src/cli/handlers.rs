use anyhow::{bail, Context};

use crate::cli::ConfigAction;
use crate::client::ApiClient;
use crate::core::ExecSession;
use crate::utils::report;
use crate::{Config, Result};

pub async fn run_remote_command(
    config: Config,
    instance: Option<String>,
    service: String,
    command: Vec<String>,
) -> Result<()> {
    let instance = resolve_instance(&config, instance)?;
    let api = ApiClient::from_config(&config)?;
    let service = api.get_service(&instance, &service).await?;
    let endpoint = api.run_remote(&service, &command).await?;
    tracing::debug!("resolved exec endpoint {endpoint}");

    let session = ExecSession::new(endpoint, config.transport()?)
        .with_tty(true)
        .with_attaching_indicator(true);
    std::process::exit(session.execute().await);
}

pub async fn open_service(
    config: Config,
    instance: Option<String>,
    service: String,
) -> Result<()> {
    let instance = resolve_instance(&config, instance)?;
    let api = ApiClient::from_config(&config)?;
    let service = api.get_service(&instance, &service).await?;
    let Some(web_url) = service.web_url else {
        bail!("service '{}' has no web URL", service.name);
    };
    open::that(format!("https://{web_url}/"))?;
    Ok(())
}

pub fn configure(mut config: Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::SetInstance { instance } => {
            config.defaults.instance = Some(instance.clone());
            config.save()?;
            report::success(&format!("default instance set to '{instance}'"));
        }
        ConfigAction::SetUrl { url } => {
            url::Url::parse(&url).with_context(|| format!("invalid API URL '{url}'"))?;
            config.api.url = url.clone();
            config.save()?;
            report::success(&format!("API URL set to '{url}'"));
        }
    }
    Ok(())
}

fn resolve_instance(config: &Config, flag: Option<String>) -> Result<String> {
    match flag.or_else(|| config.defaults.instance.clone()) {
        Some(instance) => Ok(instance),
        None => bail!("no instance given; pass --instance or set one in the config"),
    }
}
