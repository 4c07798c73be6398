use copilot_bridge_core::config::{BridgeConfig, config_file_path, init_config_toml};

use crate::{CliError, CliResult, ConfigCommand, effective_config};

pub async fn handle_config_cmd(cmd: ConfigCommand) -> CliResult<()> {
    match cmd {
        ConfigCommand::Init { force } => {
            let path = init_config_toml(force)
                .await
                .map_err(|e| CliError::Config(e.to_string()))?;
            println!("Wrote TOML config template to {:?}", path);
        }
        ConfigCommand::Path => {
            println!("{}", config_file_path().display());
        }
        ConfigCommand::Show => {
            let cfg = effective_config(None, None)
                .await
                .map_err(|e| CliError::Config(format!("{e:#}")))?;
            let path = config_file_path();
            if path.exists() {
                println!("# effective config (from {:?} + environment)", path);
            } else {
                println!("# effective config (defaults + environment; {:?} not found)", path);
            }
            print!("{}", render_config(&cfg)?);
        }
    }
    Ok(())
}

fn render_config(cfg: &BridgeConfig) -> CliResult<String> {
    toml::to_string_pretty(cfg).map_err(|e| CliError::Config(e.to_string()))
}
