use std::fmt::Display;
use std::time::Duration;

use console::Style;
use indicatif::ProgressStyle;
use indicatif::style::TemplateError;

const ANSI_BLUE: Style = Style::new().blue();

/// Timing suffix printed after finished work, e.g. `(+12ms)`.
pub fn as_overhead(elapsed: Duration) -> impl Display {
    ANSI_BLUE.apply_to(format!("(+{}ms)", elapsed.as_millis()))
}

/// Style of the bar that counts finished tasks.
pub(crate) fn get_style_root() -> Result<ProgressStyle, TemplateError> {
    Ok(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
        .progress_chars("=>-"))
}

/// Style of a single running task.
pub(crate) fn get_style_task() -> Result<ProgressStyle, TemplateError> {
    ProgressStyle::default_spinner().template("  {spinner:.blue} {msg} [{elapsed}]")
}

/// Installs the global subscriber: formatted events go through the
/// indicatif writer so they don't tear progress bars.
///
/// `RUST_LOG` wins over `verbose` when set.
#[cfg(feature = "logging")]
pub fn init_logging(verbose: bool) -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let default = if verbose { "gantry=debug" } else { "gantry=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_styles_parse() {
        assert!(get_style_root().is_ok());
        assert!(get_style_task().is_ok());
    }

    #[test]
    fn test_overhead_format() {
        let text = as_overhead(Duration::from_millis(42)).to_string();
        assert!(text.contains("(+42ms)"));
    }
}
