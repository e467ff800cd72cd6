//! Tracing subscriber setup from the `logging` config section.

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use statewire_core::config::LoggingConfig;

/// Build the filter: `RUST_LOG` wins, then `--verbose`, then config.
fn build_filter(config: &LoggingConfig, verbose: bool) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = if verbose {
        "debug"
    } else {
        config.level.as_deref().unwrap_or("info")
    };
    let mut filter = EnvFilter::new(level);
    for directive in &config.filters {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

pub fn init_logging(config: Option<&LoggingConfig>, verbose: bool) -> anyhow::Result<()> {
    let config = config.cloned().unwrap_or_default();
    let filter = build_filter(&config, verbose)?;

    let writer = match config.output.as_str() {
        "stdout" => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };
    let fmt = tracing_subscriber::fmt::layer().with_writer(writer);
    let fmt: Box<dyn Layer<Registry> + Send + Sync> = match config.format.as_str() {
        "json" => fmt.json().boxed(),
        _ => fmt.boxed(),
    };

    tracing_subscriber::registry().with(fmt).with(filter).try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_directives() {
        let config = LoggingConfig {
            level: Some("warn".into()),
            filters: vec!["statewire_gateway=debug".into()],
            ..Default::default()
        };
        assert!(build_filter(&config, false).is_ok());
    }

    #[test]
    fn test_bad_directive_is_error() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            filters: vec!["statewire_gateway=notalevel".into()],
            ..Default::default()
        };
        assert!(build_filter(&config, false).is_err());
    }
}
