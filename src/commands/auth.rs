use std::time::Duration;

use copilot_bridge_core::github::{DeviceCode, DevicePoll, GitHubClient, GitHubError};
use owo_colors::OwoColorize;
use reqwest::Client;

use crate::{CliError, CliResult, effective_config};

/// Added to the poll interval each time GitHub answers `slow_down`.
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

async fn github_client() -> CliResult<GitHubClient> {
    let cfg = effective_config(None, None)
        .await
        .map_err(|e| CliError::Config(format!("{e:#}")))?;
    let http = Client::builder()
        .build()
        .map_err(|e| CliError::Other(e.to_string()))?;
    Ok(GitHubClient::new(http, cfg.github, cfg.editor))
}

fn github_err(e: GitHubError) -> CliError {
    CliError::GitHub(e.to_string())
}

/// What the login loop should do after one poll.
#[derive(Debug, PartialEq, Eq)]
enum PollStep {
    Done(String),
    Wait(Duration),
    Abort(String),
}

fn next_step(poll: DevicePoll, interval: Duration) -> PollStep {
    match poll {
        DevicePoll::Authorized { access_token } => PollStep::Done(access_token),
        DevicePoll::Pending => PollStep::Wait(interval),
        DevicePoll::SlowDown => PollStep::Wait(interval + SLOW_DOWN_STEP),
        other => PollStep::Abort(other.reason().unwrap_or("unknown error").to_string()),
    }
}

fn print_instructions(code: &DeviceCode) {
    println!(
        "Open {} and enter the code {}",
        code.verification_uri.cyan(),
        code.user_code.bold().green()
    );
    if code.expires_in > 0 {
        println!(
            "The code expires in {}.",
            humantime::format_duration(Duration::from_secs(code.expires_in))
        );
    }
    println!("Waiting for authorization...");
}

pub async fn handle_login() -> CliResult<()> {
    let github = github_client().await?;
    let code = github.request_device_code().await.map_err(github_err)?;
    print_instructions(&code);

    let deadline = (code.expires_in > 0)
        .then(|| tokio::time::Instant::now() + Duration::from_secs(code.expires_in));
    let mut interval = Duration::from_secs(code.interval.max(1));

    loop {
        tokio::time::sleep(interval).await;
        if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
            return Err(CliError::GitHub(
                "device code expired before authorization; run `copilot-bridge login` again"
                    .to_string(),
            ));
        }

        let poll = github
            .poll_device_code(&code.device_code)
            .await
            .map_err(github_err)?;
        match next_step(poll, interval) {
            PollStep::Done(token) => {
                println!("{}", "Authorized.".green());
                println!("{token}");
                println!(
                    "Use it as `Authorization: Bearer {}` against this proxy.",
                    "<token>".dimmed()
                );
                return Ok(());
            }
            PollStep::Wait(next) => {
                if next != interval {
                    tracing::debug!(
                        "GitHub asked to slow down; polling every {}",
                        humantime::format_duration(next)
                    );
                }
                interval = next;
            }
            PollStep::Abort(reason) => {
                return Err(CliError::GitHub(format!("device authorization failed: {reason}")));
            }
        }
    }
}

pub async fn handle_check(ghu: &str) -> CliResult<()> {
    let ghu = ghu.trim();
    if !ghu.starts_with("gh") {
        return Err(CliError::Other("invalid ghu token format".to_string()));
    }
    let github = github_client().await?;
    match github.subscription_sku(ghu).await.map_err(github_err)? {
        Some(sku) => println!("{sku}"),
        None => println!("{}", "not subscribed".yellow()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pending_keeps_interval_and_slow_down_backs_off() {
        let five = Duration::from_secs(5);
        assert_eq!(next_step(DevicePoll::Pending, five), PollStep::Wait(five));
        assert_eq!(
            next_step(DevicePoll::SlowDown, five),
            PollStep::Wait(Duration::from_secs(10))
        );
    }

    #[test]
    fn authorized_finishes_and_terminal_states_abort() {
        let five = Duration::from_secs(5);
        assert_eq!(
            next_step(
                DevicePoll::Authorized {
                    access_token: "ghu_x".to_string()
                },
                five
            ),
            PollStep::Done("ghu_x".to_string())
        );
        assert_eq!(
            next_step(DevicePoll::Expired, five),
            PollStep::Abort("expired_token".to_string())
        );
        assert_eq!(
            next_step(DevicePoll::AccessDenied, five),
            PollStep::Abort("access_denied".to_string())
        );
    }
}
