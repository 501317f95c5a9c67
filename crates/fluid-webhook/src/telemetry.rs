//! Initializes the tracing subscribers for console and rolling file output.
//!
//! To get started, see [`Tracing::pre_configured`].
use std::path::PathBuf;

use snafu::{ResultExt as _, Snafu};
use tracing::{level_filters::LevelFilter, subscriber::SetGlobalDefaultError};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, Registry, filter::Directive, layer::SubscriberExt};

type Result<T, E = TracingError> = std::result::Result<T, E>;

/// Errors which can be encountered when initializing [`Tracing`].
#[derive(Debug, Snafu)]
pub enum TracingError {
    #[snafu(display("failed to initialize rolling file appender"))]
    InitRollingFileAppender { source: InitError },

    #[snafu(display("unable to set the global default subscriber"))]
    SetGlobalDefaultSubscriber { source: SetGlobalDefaultError },
}

/// Settings of the JSON file output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileLogSettings {
    pub directory: PathBuf,
    pub rotation_period: RotationPeriod,
}

/// The configured tracing subscribers.
///
/// ```no_run
/// # use fluid_webhook::telemetry::{TelemetryOptions, Tracing, TracingError};
/// fn main() -> Result<(), TracingError> {
///     let _tracing_guard = Tracing::pre_configured("fluid-webhook", TelemetryOptions::default()).init()?;
///
///     tracing::info!("log a message");
///     Ok(())
/// }
/// ```
#[derive(Debug, PartialEq, Eq)]
pub struct Tracing {
    service_name: &'static str,
    console_log_enabled: bool,
    file_log_settings: Option<FileLogSettings>,
}

impl Tracing {
    /// The environment variable used to set the console log level filter.
    pub const CONSOLE_LOG_LEVEL: &str = "CONSOLE_LOG_LEVEL";
    /// The environment variable used to set the rolling file log level filter.
    pub const FILE_LOG_LEVEL: &str = "FILE_LOG_LEVEL";
    /// The filename used for the rolling file logs.
    pub const FILE_LOG_SUFFIX: &str = "tracing-rs.json";

    /// Creates a [`Tracing`] instance from CLI `options`.
    ///
    /// Both outputs default to the INFO level. Without a rotation period the
    /// log file is never rolled over.
    pub fn pre_configured(service_name: &'static str, options: TelemetryOptions) -> Self {
        let TelemetryOptions {
            console_log_disabled,
            file_log_directory,
            file_log_rotation_period,
        } = options;

        Self {
            service_name,
            console_log_enabled: !console_log_disabled,
            file_log_settings: file_log_directory.map(|directory| FileLogSettings {
                directory,
                rotation_period: file_log_rotation_period.unwrap_or_default(),
            }),
        }
    }

    /// Installs the configured subscribers as the global default.
    ///
    /// <div class="warning">
    /// Name the guard variable appropriately, do not just use <code>let _ =</code>.
    /// </div>
    pub fn init(self) -> Result<Self> {
        let mut layers: Vec<Box<dyn Layer<Registry> + Sync + Send>> = Vec::new();

        if self.console_log_enabled {
            let env_filter_layer = env_filter_builder(Self::CONSOLE_LOG_LEVEL, LevelFilter::INFO);
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_filter(env_filter_layer)
                    .boxed(),
            );
        }

        if let Some(FileLogSettings {
            directory,
            rotation_period,
        }) = &self.file_log_settings
        {
            let env_filter_layer = env_filter_builder(Self::FILE_LOG_LEVEL, LevelFilter::INFO);

            let file_appender = RollingFileAppender::builder()
                .rotation(rotation_period.clone().into())
                .filename_prefix(self.service_name.to_string())
                .filename_suffix(Self::FILE_LOG_SUFFIX)
                .build(directory)
                .context(InitRollingFileAppenderSnafu)?;

            layers.push(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(file_appender)
                    .with_filter(env_filter_layer)
                    .boxed(),
            );
        }

        if !layers.is_empty() {
            tracing::subscriber::set_global_default(tracing_subscriber::registry().with(layers))
                .context(SetGlobalDefaultSubscriberSnafu)?;
        }

        Ok(self)
    }
}

/// Create an [`EnvFilter`] configured with the given environment variable and default [`Directive`].
fn env_filter_builder(env_var: &str, default_directive: impl Into<Directive>) -> EnvFilter {
    EnvFilter::builder()
        .with_env_var(env_var)
        .with_default_directive(default_directive.into())
        .from_env_lossy()
}

/// Contains the logging options of the CLI.
#[derive(Clone, Debug, Default, PartialEq, Eq, clap::Args)]
pub struct TelemetryOptions {
    /// Disable console logs.
    #[arg(long, env)]
    pub console_log_disabled: bool,

    /// Enable logging to files located in the specified DIRECTORY.
    #[arg(long, env, value_name = "DIRECTORY", group = "file_log")]
    pub file_log_directory: Option<PathBuf>,

    /// Time PERIOD after which log files are rolled over.
    #[arg(long, env, value_name = "PERIOD", requires = "file_log")]
    pub file_log_rotation_period: Option<RotationPeriod>,
}

/// Supported periods when the log file is rolled over.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "PascalCase")]
pub enum RotationPeriod {
    Minutely,
    Hourly,
    Daily,

    #[default]
    Never,
}

impl From<RotationPeriod> for Rotation {
    fn from(value: RotationPeriod) -> Self {
        match value {
            RotationPeriod::Minutely => Self::MINUTELY,
            RotationPeriod::Hourly => Self::HOURLY,
            RotationPeriod::Daily => Self::DAILY,
            RotationPeriod::Never => Self::NEVER,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn pre_configured_defaults() {
        let tracing = Tracing::pre_configured("test", TelemetryOptions::default());

        assert_eq!(
            tracing,
            Tracing {
                service_name: "test",
                console_log_enabled: true,
                file_log_settings: None,
            }
        );
    }

    #[test]
    fn pre_configured_file_output() {
        let tracing = Tracing::pre_configured(
            "test",
            TelemetryOptions {
                console_log_disabled: true,
                file_log_directory: Some(PathBuf::from("/var/log/fluid")),
                file_log_rotation_period: None,
            },
        );

        assert!(!tracing.console_log_enabled);
        assert_eq!(
            tracing.file_log_settings,
            Some(FileLogSettings {
                directory: PathBuf::from("/var/log/fluid"),
                rotation_period: RotationPeriod::Never,
            })
        );
    }

    #[rstest]
    #[case("Minutely", RotationPeriod::Minutely)]
    #[case("Hourly", RotationPeriod::Hourly)]
    #[case("Daily", RotationPeriod::Daily)]
    #[case("Never", RotationPeriod::Never)]
    fn rotation_periods_parse(#[case] input: &str, #[case] expected: RotationPeriod) {
        assert_eq!(input.parse::<RotationPeriod>().unwrap(), expected);
        assert_eq!(expected.to_string(), input);
    }
}
