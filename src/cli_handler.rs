//! Management command handling for webproxy.
//!
//! Every subcommand except `serve` is a single request to a running proxy's
//! control socket; the result is printed to stdout.

use anyhow::{Context, Result, bail};
use std::path::Path;

use crate::cli::{CacheCommand, Commands};
use crate::control::{ControlClient, ControlRequest, ControlResponse};

/// Map a management subcommand to its control request.
///
/// Returns `None` for `serve`, which is not a management command.
pub fn control_request(command: &Commands) -> Option<ControlRequest> {
    let request = match command {
        Commands::Serve => return None,
        Commands::Block { pattern } => ControlRequest::Block {
            pattern: pattern.clone(),
        },
        Commands::Unblock { pattern } => ControlRequest::Unblock {
            pattern: pattern.clone(),
        },
        Commands::Allow { pattern } => ControlRequest::Allow {
            pattern: pattern.clone(),
        },
        Commands::Remove { pattern } => ControlRequest::Remove {
            pattern: pattern.clone(),
        },
        Commands::Rules => ControlRequest::ListRules,
        Commands::Cache {
            action: CacheCommand::Stats,
        } => ControlRequest::CacheStats,
        Commands::Cache {
            action: CacheCommand::Purge,
        } => ControlRequest::PurgeCache,
    };
    Some(request)
}

/// Handle a management subcommand against the proxy at `socket_path`.
pub fn handle_command(command: &Commands, socket_path: &Path) -> Result<()> {
    let Some(request) = control_request(command) else {
        bail!("'serve' is not a management command");
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    let response = rt.block_on(async {
        let mut client = ControlClient::connect(socket_path).await?;
        client.request(&request).await
    })?;

    match response {
        ControlResponse::Error(message) => bail!("Proxy rejected the request: {}", message),
        other => {
            println!("{}", render(&other));
            Ok(())
        }
    }
}

/// Human-readable form of a control response.
pub fn render(response: &ControlResponse) -> String {
    match response {
        ControlResponse::RuleUpdated { pattern, changed } => {
            if *changed {
                format!("updated: {}", pattern)
            } else {
                format!("unchanged: {}", pattern)
            }
        }
        ControlResponse::Rules(rules) if rules.is_empty() => "no rules (everything allowed)".to_string(),
        ControlResponse::Rules(rules) => rules
            .iter()
            .map(|rule| format!("{:<6} {}", rule.action.to_string(), rule.pattern))
            .collect::<Vec<_>>()
            .join("\n"),
        ControlResponse::Stats(None) => "cache disabled".to_string(),
        ControlResponse::Stats(Some(stats)) => format!(
            "entries:    {}\nbytes:      {}\nhits:       {}\nstale:      {}\nmisses:     {}\ninsertions: {}\nevictions:  {}",
            stats.entries,
            stats.bytes,
            stats.hits,
            stats.stale,
            stats.misses,
            stats.insertions,
            stats.evictions
        ),
        ControlResponse::Purged(count) => format!("purged {} entries", count),
        ControlResponse::Error(message) => format!("error: {}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStats;
    use crate::proxy::{PolicyRule, RuleAction};

    #[test]
    fn test_control_request_mapping() {
        assert_eq!(control_request(&Commands::Serve), None);
        assert_eq!(
            control_request(&Commands::Unblock {
                pattern: "a.com".to_string()
            }),
            Some(ControlRequest::Unblock {
                pattern: "a.com".to_string()
            })
        );
        assert_eq!(
            control_request(&Commands::Cache {
                action: CacheCommand::Purge
            }),
            Some(ControlRequest::PurgeCache)
        );
    }

    #[test]
    fn test_render_rules() {
        let text = render(&ControlResponse::Rules(vec![
            PolicyRule {
                pattern: "*.example.com".to_string(),
                action: RuleAction::Block,
            },
            PolicyRule {
                pattern: "docs.example.com".to_string(),
                action: RuleAction::Allow,
            },
        ]));
        assert_eq!(text, "block  *.example.com\nallow  docs.example.com");
        assert_eq!(
            render(&ControlResponse::Rules(Vec::new())),
            "no rules (everything allowed)"
        );
    }

    #[test]
    fn test_render_stats() {
        let text = render(&ControlResponse::Stats(Some(CacheStats {
            entries: 2,
            hits: 5,
            stale: 3,
            ..Default::default()
        })));
        assert!(text.contains("entries:    2"));
        assert!(text.contains("hits:       5"));
        assert!(text.contains("stale:      3"));
        assert_eq!(render(&ControlResponse::Stats(None)), "cache disabled");
    }

    #[tokio::test]
    async fn test_handle_command_without_proxy_fails() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("none.sock");
        let result = tokio::task::spawn_blocking(move || handle_command(&Commands::Rules, &socket))
            .await
            .unwrap();
        assert!(result.unwrap_err().to_string().contains("Cannot connect"));
    }
}
