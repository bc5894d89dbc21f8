use colored::*;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::{FmtContext, Layer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use socktun_traits::logging::LoggingService;

/// One log line: `<time> <LEVEL> <component>: <message and fields>`.
struct SessionFormatter {
    use_color: bool,
}

impl<S, N> FormatEvent<S, N> for SessionFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let time = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let component = component_of(metadata.target());

        let level_str = level_label(*metadata.level());
        let (level_str, component) = if self.use_color {
            let level_str = match *metadata.level() {
                Level::TRACE => level_str.magenta().bold(),
                Level::DEBUG => level_str.blue().bold(),
                Level::INFO => level_str.green().bold(),
                Level::WARN => level_str.yellow().bold(),
                Level::ERROR => level_str.red().bold(),
            };
            (level_str, component.dimmed())
        } else {
            (level_str.normal(), component.normal())
        };

        write!(writer, "{} {} {}: ", time, level_str, component)?;

        ctx.format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

fn level_label(level: Level) -> &'static str {
    match level {
        Level::TRACE => "TRACE",
        Level::DEBUG => "DEBUG",
        Level::INFO => " INFO",
        Level::WARN => " WARN",
        Level::ERROR => "ERROR",
    }
}

/// `socktun_session::probe` becomes `session`, anything outside the workspace keeps
/// its crate name.
fn component_of(target: &str) -> &str {
    let krate = target.split("::").next().unwrap_or(target);
    krate.strip_prefix("socktun_").unwrap_or(krate)
}

/// Unknown level names fall back to `info` instead of failing startup.
pub fn parse_level(level_str: &str) -> Level {
    Level::from_str(level_str.trim()).unwrap_or(Level::INFO)
}

pub struct LoggingServiceImpl;

impl LoggingService for LoggingServiceImpl {
    fn init_logging(
        level_str: &str,
        use_color: bool,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let level = parse_level(level_str);

        let env_filter = EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy();

        let formatter = SessionFormatter { use_color };

        let layer = Layer::default()
            .with_writer(std::io::stderr)
            .event_format(formatter);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init()?;

        Ok(())
    }
}

/// Initializes the global logger.
pub fn init_logging(
    level_str: &str,
    use_color: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    LoggingServiceImpl::init_logging(level_str, use_color)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level(" WARN "), Level::WARN);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }

    #[test]
    fn test_component_of() {
        assert_eq!(component_of("socktun_session::probe"), "session");
        assert_eq!(component_of("socktun_ssh"), "ssh");
        assert_eq!(component_of("tokio::runtime"), "tokio");
    }

    #[test]
    fn test_level_labels_are_aligned() {
        for level in [Level::TRACE, Level::DEBUG, Level::INFO, Level::WARN, Level::ERROR] {
            assert_eq!(level_label(level).len(), 5);
        }
    }
}
