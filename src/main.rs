use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use futures_lite::StreamExt;
use radiacode_lib::transport::usb;
use radiacode_lib::{AlertControl, ClientConfig, DisplayDirection, EnergyCalibration, RadiaCode, Target};
use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Connect to the USB device with this serial number.
    #[arg(long, conflicts_with = "bluetooth")]
    usb_serial: Option<String>,
    /// Connect over Bluetooth through this RFCOMM serial port (e.g. /dev/rfcomm0).
    #[arg(short, long)]
    bluetooth: Option<String>,
    /// Per-command timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Talk to firmware older than 4.8 anyway.
    #[arg(long)]
    no_firmware_check: bool,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List RadiaCode devices attached over USB.
    List,
    /// Show device identity, firmware and status.
    Info,
    /// Print the configuration dump.
    Config,
    /// Read the spectrum.
    Spectrum {
        /// Read the non-resettable accumulated spectrum instead.
        #[arg(long)]
        accumulated: bool,
        /// Print channel, energy and count for every channel.
        #[arg(long)]
        channels: bool,
        /// Reset the spectrum after reading it.
        #[arg(long)]
        reset: bool,
    },
    /// Poll real-time count and dose rates.
    Watch {
        /// Stop after this many samples.
        #[arg(short = 'n', long)]
        count: Option<usize>,
        /// Pause between polls that returned nothing.
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Show the accumulated dose.
    Dose {
        #[arg(long)]
        reset: bool,
    },
    /// Show device events not yet acknowledged.
    Events {
        /// Acknowledge the printed events.
        #[arg(long)]
        ack: bool,
    },
    /// Show or change the energy calibration.
    Calibration {
        /// New coefficients a0 a1 a2.
        #[arg(long, num_args = 3, value_names = ["A0", "A1", "A2"], allow_negative_numbers = true)]
        set: Option<Vec<f32>>,
    },
    /// Change a device setting.
    Set {
        #[command(subcommand)]
        setting: Setting,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn is_on(self) -> bool {
        matches!(self, Switch::On)
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Direction {
    Auto,
    Left,
    Right,
}

impl From<Direction> for DisplayDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Auto => DisplayDirection::Auto,
            Direction::Left => DisplayDirection::Left,
            Direction::Right => DisplayDirection::Right,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Setting {
    /// Display brightness, 0 to 9.
    Brightness { level: u8 },
    Sound { state: Switch },
    Vibration { state: Switch },
    /// Display auto-off after 5, 10, 15 or 30 seconds.
    DisplayOff { seconds: u32 },
    /// "ru" or "en".
    Language { language: String },
    Direction { direction: Direction },
    /// Sound alerts on clicks and alarms.
    SoundAlerts { state: Switch },
    /// Vibration alerts on alarms.
    VibrationAlerts { state: Switch },
    /// Sync the device clock to this computer.
    Time,
    /// Switch the device on or off.
    Power { state: Switch },
}

fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file =
            File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // INFO by default, DEBUG with -v, TRACE with -vv; RUST_LOG overrides.
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

fn alarms() -> AlertControl {
    AlertControl::new()
        .with_dose_rate_alarm_1(true)
        .with_dose_rate_alarm_2(true)
        .with_dose_rate_out_of_scale(true)
        .with_dose_alarm_1(true)
        .with_dose_alarm_2(true)
        .with_dose_out_of_scale(true)
}

fn list_devices() -> Result<()> {
    let devices = usb::list_devices().context("Failed to enumerate USB devices")?;
    if devices.is_empty() {
        println!("No RadiaCode found on USB.");
    }
    for (i, device) in devices.iter().enumerate() {
        println!(
            "#{}: bus {:03} addr {:03} serial {} ({})",
            i + 1,
            device.bus_number(),
            device.device_address(),
            device.serial_number().unwrap_or("<not available>"),
            device.product_string().unwrap_or("RadiaCode")
        );
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    if let Cmd::List = cli.command {
        return list_devices();
    }

    let target = match cli.bluetooth {
        Some(port) => Target::Bluetooth { port },
        None => Target::Usb {
            serial_number: cli.usb_serial,
        },
    };
    let mut config = ClientConfig::for_target(&target).with_firmware_check(!cli.no_firmware_check);
    if let Some(ms) = cli.timeout_ms {
        config = config.with_command_timeout(Duration::from_millis(ms));
    }

    info!(%target, "Connecting");
    let device = RadiaCode::connect(target, config)
        .await
        .context("Failed to connect to RadiaCode")?;

    let result = execute(&device, cli.command).await;
    if let Err(e) = device.disconnect().await {
        warn!(error = %e, "Disconnect failed");
    }
    result
}

async fn execute(device: &RadiaCode, command: Cmd) -> Result<()> {
    match command {
        Cmd::List => list_devices()?,
        Cmd::Info => {
            let info = device.device_info().await?;
            println!("Serial number:   {}", info.serial_number);
            println!("HW serial:       {}", device.get_hw_serial_number().await?);
            println!("Boot version:    {}", info.firmware.boot);
            println!("Target version:  {}", info.firmware.target);
            println!("Spectrum format: {:?}", info.spectrum_format);
            println!("{}", device.get_fw_signature().await?);
            println!("Status flags:    {:#010x}", device.get_status().await?);
            println!("Calibration:     {}", device.get_energy_calibration().await?);
            let text = device.get_text_message().await?;
            if !text.is_empty() {
                println!("Message:         {text}");
            }
        }
        Cmd::Config => println!("{}", device.get_configuration().await?),
        Cmd::Spectrum {
            accumulated,
            channels,
            reset,
        } => {
            let spectrum = if accumulated {
                device.get_accumulated_spectrum().await?
            } else {
                device.get_spectrum().await?
            };
            println!("{spectrum}");
            if let Some(rate) = spectrum.count_rate() {
                println!("Average count rate: {rate:.2} cps");
            }
            if channels {
                for (channel, count) in spectrum.counts.iter().enumerate() {
                    println!("{channel}\t{:.2}\t{count}", spectrum.channel_to_energy(channel));
                }
            }
            if reset {
                device.reset_spectrum().await?;
                info!("Spectrum reset");
            }
        }
        Cmd::Watch { count, interval_ms } => {
            let limit = count.unwrap_or(usize::MAX);
            let mut seen = 0;
            while seen < limit {
                let mut samples = std::pin::pin!(device.get_real_time_samples());
                while let Some(item) = samples.next().await {
                    match item {
                        Ok(sample) => {
                            println!("{sample}");
                            seen += 1;
                            if seen >= limit {
                                break;
                            }
                        }
                        Err(e) if e.is_channel_error() || matches!(e, radiacode_lib::Error::ReconnectRequired) => {
                            return Err(e).context("Lost the device");
                        }
                        Err(e) => warn!(error = %e, "Skipping sample"),
                    }
                }
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
            }
        }
        Cmd::Dose { reset } => {
            let dose = device.get_accumulated_dose().await?;
            match dose.duration {
                Some(duration) => println!("Dose: {} over {} s", dose.dose, duration.as_secs()),
                None => println!("Dose: {}", dose.dose),
            }
            if dose.overload {
                println!("(overload)");
            }
            if reset {
                device.reset_dose().await?;
                info!("Dose reset");
            }
        }
        Cmd::Events { ack } => {
            let batch = device.read_events().await?;
            if batch.events.is_empty() {
                println!("No new events.");
            }
            for event in &batch.events {
                println!("{event}");
            }
            if let (true, Some(cursor)) = (ack, batch.cursor) {
                device.acknowledge_events(cursor).await?;
            }
        }
        Cmd::Calibration { set } => {
            if let Some(values) = set {
                let [a0, a1, a2] = values[..] else {
                    bail!("expected three coefficients");
                };
                device.set_energy_calibration(EnergyCalibration::new(a0, a1, a2)).await?;
            }
            println!("{}", device.get_energy_calibration().await?);
        }
        Cmd::Set { setting } => apply(device, setting).await?,
    }
    Ok(())
}

async fn apply(device: &RadiaCode, setting: Setting) -> Result<()> {
    match setting {
        Setting::Brightness { level } => device.set_display_brightness(level).await?,
        Setting::Sound { state } => device.set_sound_enabled(state.is_on()).await?,
        Setting::Vibration { state } => device.set_vibration_enabled(state.is_on()).await?,
        Setting::DisplayOff { seconds } => device.set_display_off_timeout(seconds).await?,
        Setting::Language { language } => device.set_language(&language).await?,
        Setting::Direction { direction } => device.set_display_direction(direction.into()).await?,
        Setting::SoundAlerts { state } => {
            let alerts = if state.is_on() {
                alarms().with_clicks(true).with_buttons(true)
            } else {
                AlertControl::new()
            };
            device.set_sound_alerts(alerts).await?
        }
        Setting::VibrationAlerts { state } => {
            let alerts = if state.is_on() { alarms() } else { AlertControl::new() };
            device.set_vibration_alerts(alerts).await?
        }
        Setting::Time => device.set_local_time(chrono::Local::now().naive_local()).await?,
        Setting::Power { state } => device.set_device_on(state.is_on()).await?,
    }
    info!("Setting applied");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;
    run(cli).await
}
