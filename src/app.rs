//! Core application runner for the `openscale-ble` binary.
//!
//! This module is decoupled from process setup (logging, exit codes) so the
//! whole flow, from discovery to the printed measurement lines, can be tested
//! with fake links and in-memory output streams.

use crate::advertisement::ScannedDeviceInfo;
use crate::event::{BluetoothEvent, InteractionData, InteractionFeedback, InteractionKind};
use crate::factory::ScaleFactory;
use crate::handler::StaticUsers;
use crate::handler::s400::{SETTINGS_KEY_BIND_KEY, SETTINGS_KEY_MAC_ADDRESS};
use crate::link::{Backend, LinkError, LinkFuture, Links, ScanFilter};
use crate::mac_address::MacAddress;
use crate::measurement::ScaleMeasurement;
use crate::settings::{JsonFileStore, MemoryStore, PreferenceStore, SettingsError, TUNING_PROFILE_KEY};
use crate::transport::{AdapterEnv, Communicator};
use crate::tuning::TuningProfile;
use crate::user::{ActivityLevel, Gender, ScaleUser, WeightUnit};
use chrono::{Local, Months, NaiveDate, SecondsFormat};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use std::fmt::Write as _;
use std::io;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Handler whose settings namespace receives `--bind-key`.
const S400_HANDLER: &str = "MiScaleS400Handler";

const DEFAULT_AGE: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// One human-readable line per measurement
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Command line of the scale reader.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Bluetooth address of the scale, e.g. AA:BB:CC:DD:EE:FF
    pub address: MacAddress,

    /// Device name to match handlers against when the scan does not report one.
    #[arg(long)]
    pub name: Option<String>,

    /// Handler or legacy driver name remembered from an earlier session.
    #[arg(long)]
    pub driver: Option<String>,

    /// Timing profile; overrides the handler's default and is saved in the settings.
    #[arg(long, value_enum)]
    pub tuning: Option<TuningProfile>,

    /// Bluetooth backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// How long to scan for the scale before connecting.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub scan_timeout: Duration,

    /// Application user id the measurements are attributed to.
    #[arg(long, default_value_t = 1)]
    pub user_id: i32,

    #[arg(long, default_value = "openscale")]
    pub user_name: String,

    /// Body height in centimeters
    #[arg(long, default_value_t = 175.0)]
    pub height: f32,

    /// Birthday as YYYY-MM-DD
    #[arg(long, conflicts_with = "age")]
    pub birthday: Option<NaiveDate>,

    /// Age in years, used when no birthday is given
    #[arg(long)]
    pub age: Option<u32>,

    #[arg(long, default_value_t, value_enum)]
    pub gender: Gender,

    #[arg(long, default_value_t, value_enum)]
    pub activity: ActivityLevel,

    /// Unit the scale should display
    #[arg(long, default_value_t, value_enum)]
    pub unit: WeightUnit,

    /// Initial weight in kg, some scales use it to tell users apart
    #[arg(long, default_value_t = 0.0)]
    pub initial_weight: f32,

    /// JSON file keeping driver settings between runs
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Xiaomi S400 bind key, 32 hex digits
    #[arg(long)]
    pub bind_key: Option<String>,

    /// Answer to a "choose user" request of the scale; -1 registers a new slot.
    #[arg(long, allow_negative_numbers = true)]
    pub slot: Option<i32>,

    /// Consent code to answer an "enter consent" request with.
    #[arg(long)]
    pub consent: Option<i32>,

    #[arg(long, default_value_t, value_enum)]
    pub format: OutputFormat,

    /// Verbose output, print device messages and errors to stderr
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

/// Invalid combinations of command line values.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("bind key must be 32 hex digits")]
    BindKey,
    #[error("birthday {0} lies in the future")]
    BirthdayInFuture(NaiveDate),
    #[error("age {0} is out of range")]
    Age(u32),
    #[error("height must be positive, got {0}")]
    Height(f32),
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("unsupported device {0}")]
    Unsupported(String),
    #[error("the scale asks to {0}; {1}")]
    Interaction(InteractionKind, &'static str),
    #[error("{0}")]
    Failed(String),
}

/// Link abstraction to enable deterministic unit tests without Bluetooth hardware.
pub trait LinkProvider: Send + Sync {
    fn open(&self, backend: Backend) -> LinkFuture<'_, Links>;
}

/// Opens the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealLinks;

impl LinkProvider for RealLinks {
    fn open(&self, backend: Backend) -> LinkFuture<'_, Links> {
        Box::pin(async move { crate::link::open(backend).await })
    }
}

/// Parse a duration from a human-readable string.
///
/// Supports the suffixes `ms`, `s`, `m` and `h`; a bare number means seconds.
///
/// # Examples
/// ```
/// use openscale_ble::app::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num, scale, what) = if let Some(num) = src.strip_suffix("ms") {
        (num, 1, "milliseconds")
    } else if let Some(num) = src.strip_suffix('h') {
        (num, 3_600_000, "hours")
    } else if let Some(num) = src.strip_suffix('m') {
        (num, 60_000, "minutes")
    } else if let Some(num) = src.strip_suffix('s') {
        (num, 1000, "seconds")
    } else {
        (src, 1000, "duration")
    };
    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid {}: {}", what, num))?;
    value
        .checked_mul(scale)
        .map(Duration::from_millis)
        .ok_or_else(|| format!("{} out of range: {}", what, num))
}

impl Options {
    /// The user profile handed to the scale.
    pub fn user(&self) -> Result<ScaleUser, ConfigError> {
        if self.height <= 0.0 {
            return Err(ConfigError::Height(self.height));
        }
        let today = Local::now().date_naive();
        let birthday = match self.birthday {
            Some(birthday) if birthday > today => return Err(ConfigError::BirthdayInFuture(birthday)),
            Some(birthday) => birthday,
            None => {
                let age = self.age.unwrap_or(DEFAULT_AGE);
                if age > 150 {
                    return Err(ConfigError::Age(age));
                }
                today
                    .checked_sub_months(Months::new(age * 12))
                    .ok_or(ConfigError::Age(age))?
            }
        };
        Ok(ScaleUser {
            id: self.user_id,
            user_name: self.user_name.clone(),
            birthday,
            body_height: self.height,
            gender: self.gender,
            initial_weight: self.initial_weight,
            goal_weight: self.initial_weight,
            scale_unit: self.unit,
            activity_level: self.activity,
        })
    }

    fn open_store(&self) -> Result<Arc<dyn PreferenceStore>, RunError> {
        Ok(match &self.settings {
            Some(path) => Arc::new(JsonFileStore::open(path)?),
            None => Arc::new(MemoryStore::new()),
        })
    }
}

/// Write the choices given on the command line into the settings.
pub async fn seed_store(options: &Options, store: &dyn PreferenceStore) -> Result<(), RunError> {
    if let Some(tuning) = options.tuning {
        store.put(TUNING_PROFILE_KEY, json!(tuning.to_string())).await?;
    }
    if let Some(bind_key) = &options.bind_key {
        if !crate::s400::is_valid_bind_key(bind_key) {
            return Err(ConfigError::BindKey.into());
        }
        let prefix = format!("ble/{S400_HANDLER}/{}", options.address);
        store
            .put(&format!("{prefix}/{SETTINGS_KEY_BIND_KEY}"), json!(bind_key))
            .await?;
        store
            .put(
                &format!("{prefix}/{SETTINGS_KEY_MAC_ADDRESS}"),
                json!(options.address.to_string()),
            )
            .await?;
    }
    Ok(())
}

/// Scan for the target until it shows up or `timeout` passes.
async fn discover(links: &Links, address: MacAddress, timeout: Duration) -> Result<Option<ScannedDeviceInfo>, LinkError> {
    let mut rx = links.advertisements.scan(ScanFilter::address(address)).await?;
    let found = tokio::time::timeout(timeout, async {
        while let Some(device) = rx.recv().await {
            if device.address == address {
                return Some(device);
            }
        }
        None
    })
    .await;
    Ok(found.ok().flatten())
}

/// What the factory gets to look at for the target.
fn describe(options: &Options, scanned: Option<ScannedDeviceInfo>) -> ScannedDeviceInfo {
    let mut device = scanned.unwrap_or_else(|| ScannedDeviceInfo::new(options.address));
    if device.name.is_none() {
        device.name = options.name.clone();
    }
    if options.driver.is_some() {
        device.handler_hint = options.driver.clone();
    }
    device
}

#[derive(Serialize)]
struct MeasurementLine<'a> {
    address: MacAddress,
    #[serde(flatten)]
    measurement: &'a ScaleMeasurement,
}

/// One line of text output: address, time and every value the scale reported.
pub fn format_text(address: MacAddress, measurement: &ScaleMeasurement) -> String {
    let unit = measurement.weight_unit.unwrap_or_default();
    let mut line = address.to_string();
    if let Some(time) = measurement.date_time {
        let _ = write!(line, " {}", time.to_rfc3339_opts(SecondsFormat::Secs, true));
    }
    let _ = write!(line, " weight={:.2}{unit}", measurement.weight);

    let fields = [
        ("fat", measurement.fat, "%"),
        ("water", measurement.water, "%"),
        ("muscle", measurement.muscle, "%"),
        ("visceral_fat", measurement.visceral_fat, ""),
        ("bone", measurement.bone, ""),
        ("lbm", measurement.lbm, ""),
        ("bmr", measurement.bmr, "kcal"),
    ];
    for (name, value, suffix) in fields {
        if value > 0.0 {
            let _ = write!(line, " {name}={value:.2}{suffix}");
        }
    }
    if measurement.impedance > 0.0 {
        let _ = write!(line, " impedance={:.0}", measurement.impedance);
    }
    if let Some(rate) = measurement.heart_rate.filter(|r| *r > 0) {
        let _ = write!(line, " heart_rate={rate}");
    }
    line
}

fn write_measurement(
    format: OutputFormat,
    address: MacAddress,
    measurement: &ScaleMeasurement,
    out: &mut dyn Write,
) -> io::Result<()> {
    let line = match format {
        OutputFormat::Text => format_text(address, measurement),
        OutputFormat::Json => serde_json::to_string(&MeasurementLine {
            address,
            measurement,
        })?,
    };
    writeln!(out, "{line}")
}

/// Answer an interaction request from the command line values, if possible.
fn answer(options: &Options, kind: InteractionKind, data: &InteractionData) -> Result<InteractionFeedback, RunError> {
    match kind {
        InteractionKind::ChooseUser => options
            .slot
            .map(InteractionFeedback::UserIndex)
            .ok_or(RunError::Interaction(kind, "pass --slot")),
        InteractionKind::EnterConsent => {
            let user_index = match data {
                InteractionData::ConsentFor { user_index } => *user_index,
                _ => options.slot.unwrap_or(-1),
            };
            options
                .consent
                .map(|code| InteractionFeedback::Consent { user_index, code })
                .ok_or(RunError::Interaction(kind, "pass --consent"))
        }
    }
}

/// Follow one session to its terminal event, writing measurements to `out`.
async fn follow(
    options: &Options,
    communicator: &dyn Communicator,
    user: ScaleUser,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Result<(), RunError> {
    let mut events = communicator.events();
    let user_id = user.id;
    communicator.connect(options.address, Some(user));

    while let Some(event) = events.recv().await {
        match &event {
            BluetoothEvent::MeasurementReceived {
                measurement,
                address,
            } => write_measurement(options.format, *address, measurement, out)?,
            BluetoothEvent::UserInteractionRequired { kind, data, .. } => {
                if options.verbose {
                    writeln!(err, "scale asks to {kind}: {data:?}")?;
                }
                match answer(options, *kind, data) {
                    Ok(feedback) => communicator.provide_user_interaction_feedback(*kind, user_id, feedback),
                    Err(e) => {
                        communicator.disconnect();
                        return Err(e);
                    }
                }
            }
            BluetoothEvent::DeviceMessage { message, .. } => {
                info!(address = %options.address, "{message}");
                if options.verbose {
                    writeln!(err, "{message}")?;
                }
            }
            BluetoothEvent::Error { error, .. } => {
                warn!(address = %options.address, error = %error, "device error");
                if options.verbose {
                    writeln!(err, "{error}")?;
                }
            }
            BluetoothEvent::ConnectionFailed { error, .. } => return Err(RunError::Failed(error.clone())),
            other => info!("{other}"),
        }
        if event.is_terminal() {
            return Ok(());
        }
    }
    Err(RunError::Failed("event stream closed".to_string()))
}

/// Run one scale session, writing measurement lines to `out` and verbose
/// diagnostics to `err`.
///
/// - The target is scanned for first so the handlers can match on its name and
///   advertised services; `--name` and `--driver` fill in what the scan lacks.
/// - Returns after the adapter's terminal event. A failed connection and an
///   unsupported device are errors.
pub async fn run_with_io(
    options: Options,
    links: &dyn LinkProvider,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Result<(), RunError> {
    let user = options.user()?;
    let store = options.open_store()?;
    seed_store(&options, store.as_ref()).await?;

    let links = links.open(options.backend).await?;
    let scanned = discover(&links, options.address, options.scan_timeout).await?;
    if scanned.is_none() {
        debug!(address = %options.address, "target not seen while scanning");
    }
    let device = describe(&options, scanned);

    let env = AdapterEnv {
        store,
        users: Arc::new(StaticUsers::new(vec![user.clone()])),
    };
    let factory = ScaleFactory::new(links, env);
    let Some(communicator) = factory.create_communicator(&device).await else {
        let label = match &device.name {
            Some(name) => format!("{} ({name})", device.address),
            None => device.address.to_string(),
        };
        return Err(RunError::Unsupported(label));
    };
    info!(address = %options.address, driver = communicator.name(), "connecting");

    let outcome = follow(&options, communicator.as_ref(), user, out, err).await;
    communicator.release();
    outcome
}
