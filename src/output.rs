use std::{str::FromStr, sync::Arc};

use kestrel_core::{ConfigError, Event};
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug)]
pub enum OutputFormat {
    Plaintext,
    Json,
}

impl FromStr for OutputFormat {
    type Err = ConfigError;
    fn from_str(format: &str) -> Result<Self, Self::Err> {
        match format.to_lowercase().as_str() {
            "plaintext" => Ok(OutputFormat::Plaintext),
            "json" => Ok(OutputFormat::Json),
            _ => Err(ConfigError::InvalidValue {
                field: String::from("output"),
                value: format.to_string(),
                err: String::from("Output format must be one of [plaintext, json]"),
            }),
        }
    }
}

/// Prints every delivered event as one line until the engine goes
/// away.
pub async fn print_events(mut rx: mpsc::Receiver<Arc<Event>>, format: OutputFormat) {
    while let Some(event) = rx.recv().await {
        match format {
            OutputFormat::Plaintext => print!("{event}"),
            OutputFormat::Json => match serde_json::to_string(&*event) {
                Ok(line) => println!("{line}"),
                Err(err) => log::error!("error serializing event: {err}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parses_case_insensitively() {
        assert!(matches!(
            "Plaintext".parse::<OutputFormat>().unwrap(),
            OutputFormat::Plaintext
        ));
        assert!(matches!(
            "json".parse::<OutputFormat>().unwrap(),
            OutputFormat::Json
        ));
        assert!("yaml".parse::<OutputFormat>().is_err());
    }
}
