//! Process bootstrap helpers.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the log filter directive.
pub const LOG_ENV_VAR: &str = "COURIER_LOG";

/// Initialize tracing from the `COURIER_LOG` environment variable.
///
/// Defaults to "info" level if COURIER_LOG is not set. Safe to call more than
/// once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Config file path from `--config <path>` or `--config=<path>` on the command line.
pub fn parse_config_path() -> Option<String> {
    config_path_from(std::env::args().skip(1))
}

fn config_path_from<I>(args: I) -> Option<String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_config_path_flag_forms() {
        assert_eq!(
            config_path_from(args(&["--config", "a.yaml"])).as_deref(),
            Some("a.yaml")
        );
        assert_eq!(
            config_path_from(args(&["-v", "--config=b.yaml"])).as_deref(),
            Some("b.yaml")
        );
        assert_eq!(config_path_from(args(&["-c"])), None);
        assert_eq!(config_path_from(args(&[])), None);
    }
}
