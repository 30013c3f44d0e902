use std::io::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use harden_mqtt_core::{
    classify, CancellationToken, DeviceIdentity, Dispatcher, DisplayHandler, EventLog,
    FileSettings, IndexSelector, InteroperableField, LoopbackBroker, MqttClient, PairingEngine,
    PairingOutcome, PairingRole, PeerBinding, Qos, SecureTelemetry, SensorReading, SlaveCandidate,
    SlaveSelector, TrollMutator,
};
use log::{debug, info, LevelFilter};
use rand::Rng;
use time::OffsetDateTime;

#[derive(Parser)]
#[command(
    name = "harden-mqtt",
    author,
    version,
    about = "Sensor, display, and troll over a hardened MQTT security layer"
)]
struct Cli {
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate (or show) a device identity backed by a settings file.
    Keygen {
        #[arg(long, value_name = "FILE")]
        settings: PathBuf,
        #[arg(long, value_name = "ID")]
        device_id: Option<String>,
        #[arg(long, default_value = "Sensor")]
        device_type: String,
    },
    /// Run sensor, display, and troll end-to-end over the in-process bus.
    Demo {
        #[arg(long, default_value_t = 5)]
        readings: u64,
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
        #[arg(long, default_value_t = 3)]
        trolliness: u32,
        /// Prompt on the console for the slave selection instead of
        /// auto-picking the first candidate.
        #[arg(long)]
        interactive: bool,
    },
    /// Classify a payload file the way the troll would and emit one
    /// perturbed variant.
    Mutate {
        #[arg(long, value_name = "FILE")]
        input: PathBuf,
        #[arg(long, default_value = "HardenMqtt/Unsecured/Unstructured/Demo/Value")]
        topic: String,
        #[arg(long, default_value_t = 1)]
        trolliness: u32,
        #[arg(long, value_name = "TEXT")]
        seed: Option<String>,
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);
    match cli.command {
        Commands::Keygen {
            settings,
            device_id,
            device_type,
        } => cmd_keygen(settings, device_id, device_type),
        Commands::Demo {
            readings,
            interval_ms,
            trolliness,
            interactive,
        } => cmd_demo(readings, interval_ms, trolliness, interactive),
        Commands::Mutate {
            input,
            topic,
            trolliness,
            seed,
            out,
        } => cmd_mutate(input, topic, trolliness, seed, out),
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(default));
    builder.format_timestamp(None);
    if debug {
        builder.filter_level(LevelFilter::Debug);
    }
    let _ = builder.try_init();
}

fn cmd_keygen(
    settings: PathBuf,
    device_id: Option<String>,
    device_type: String,
) -> Result<()> {
    let store = FileSettings::open(&settings)
        .with_context(|| format!("opening settings at {}", settings.display()))?;
    let default_id = device_id.unwrap_or_else(|| default_device_id(&device_type));
    let identity = DeviceIdentity::load_or_create(&store, &default_id, &device_type)
        .context("loading device identity")?;
    let broker = harden_mqtt_core::ConnectOptions::from_settings(&store);
    println!("Device ID:  {}", identity.device_id());
    println!("Type:       {}", identity.device_type());
    println!("Public key: {}", identity.public_base64());
    println!("Broker:     {}:{} (tls={})", broker.host, broker.port, broker.tls);
    println!("Settings:   {}", settings.display());
    Ok(())
}

fn cmd_demo(readings: u64, interval_ms: u64, trolliness: u32, interactive: bool) -> Result<()> {
    if readings == 0 {
        bail!("--readings must be at least 1");
    }
    let broker = LoopbackBroker::new();
    let sensor = DeviceIdentity::from_scalar(random_scalar(), &default_device_id("Sensor"), "Sensor");
    let display =
        DeviceIdentity::from_scalar(random_scalar(), &default_device_id("Display"), "Display");

    println!("Sensor  {} ({})", sensor.device_id(), sensor.public_base64());
    println!("Display {} ({})", display.device_id(), display.public_base64());
    println!("Pairing over {}...", harden_mqtt_core::TOPIC_PAIRING);

    let (sensor_binding, display_binding) = run_pairing(&broker, &sensor, &display, interactive)?;
    info!(
        "paired: sensor <-> {} / display <-> {}",
        sensor_binding.device_id, display_binding.device_id
    );

    let sensor_client = broker.client();
    let events = EventLog::new(&sensor_client, sensor.device_id());
    events.publish("pairing completed");

    let cancel = CancellationToken::new();
    let troll_client = broker.client();
    let display_client = broker.client();

    thread::scope(|scope| -> Result<()> {
        // Troll: everything on the bus, perturbed and republished.
        {
            let cancel = cancel.clone();
            let troll_client = &troll_client;
            scope.spawn(move || {
                let inbox = match troll_client.subscribe("#") {
                    Ok(inbox) => inbox,
                    Err(_) => return,
                };
                let mut troll = TrollMutator::new(trolliness);
                while !cancel.is_cancelled() {
                    let message = match inbox.recv_timeout(Duration::from_millis(100)) {
                        Ok(message) => message,
                        Err(_) => continue,
                    };
                    if let Some(republication) = troll.handle(&message.topic, &message.payload) {
                        debug!(
                            "troll republishes {} ({} bytes)",
                            message.topic,
                            republication.payload.len()
                        );
                        let _ = troll_client.publish(
                            &message.topic,
                            Qos::AtMostOnce,
                            republication.retain,
                            &republication.payload,
                        );
                    }
                }
            });
        }

        // Display: dispatch all namespaces into the console view.
        {
            let cancel = cancel.clone();
            let display = &display;
            let display_client = &display_client;
            let binding = display_binding.clone();
            scope.spawn(move || {
                let inbox = match display_client.subscribe("HardenMqtt/#") {
                    Ok(inbox) => inbox,
                    Err(_) => return,
                };
                let mut dispatcher = Dispatcher::new(display, binding);
                let mut view = ConsoleView;
                dispatcher.run(&inbox, &cancel, &mut view);
            });
        }

        // Sensor: the main publishing loop.
        let telemetry = SecureTelemetry::new(&sensor_client, &sensor, Some(sensor_binding.clone()));
        let mut weather = WeatherWalk::new(&sensor);
        for index in 0..readings {
            let reading = weather.next_reading();
            telemetry
                .publish_reading(&reading)
                .context("publishing reading")?;
            info!("published reading {} of {readings}", index + 1);
            thread::sleep(Duration::from_millis(interval_ms));
        }
        events.publish("demo finished");
        // Let the troll and display drain the tail end of the bus.
        thread::sleep(Duration::from_millis(300));
        cancel.cancel();
        Ok(())
    })?;
    println!("Done: {readings} readings across all five namespaces.");
    Ok(())
}

fn cmd_mutate(
    input: PathBuf,
    topic: String,
    trolliness: u32,
    seed: Option<String>,
    out: Option<PathBuf>,
) -> Result<()> {
    let payload = std::fs::read(&input)
        .with_context(|| format!("reading payload from {}", input.display()))?;
    let class = classify(&payload);
    println!("Classified as: {}", class.kind());
    let mut troll = match seed {
        Some(seed) => TrollMutator::with_rng(
            trolliness,
            harden_mqtt_core::rng::derive_rng(seed.as_bytes()),
        ),
        None => TrollMutator::new(trolliness),
    };
    let Some(republication) = troll.handle(&topic, &payload) else {
        bail!("topic {topic} is reserved; nothing emitted");
    };
    match out {
        Some(path) => {
            std::fs::write(&path, &republication.payload)
                .with_context(|| format!("writing mutation to {}", path.display()))?;
            println!(
                "Wrote {} bytes (retain={}) to {}",
                republication.payload.len(),
                republication.retain,
                path.display()
            );
        }
        None => {
            println!("--- mutated payload ({} bytes) ---", republication.payload.len());
            println!("{}", String::from_utf8_lossy(&republication.payload));
        }
    }
    Ok(())
}

/// Runs master (sensor) and slave (display) concurrently on the bus at
/// demo-friendly timing.
fn run_pairing(
    broker: &LoopbackBroker,
    sensor: &DeviceIdentity,
    display: &DeviceIdentity,
    interactive: bool,
) -> Result<(PeerBinding, PeerBinding)> {
    let master_client = broker.client();
    let slave_client = broker.client();
    let master_engine = PairingEngine::new(&master_client, sensor, "Display").with_timing(
        Duration::from_millis(100),
        Duration::from_millis(500),
        Duration::from_millis(50),
    );
    let slave_engine = PairingEngine::new(&slave_client, display, "Sensor").with_timing(
        Duration::from_millis(100),
        Duration::from_millis(500),
        Duration::from_millis(50),
    );
    let cancel = CancellationToken::new();
    let selector: Arc<dyn SlaveSelector> = if interactive {
        Arc::new(ConsoleSelector)
    } else {
        Arc::new(IndexSelector(1))
    };
    let nonce = random_scalar();

    thread::scope(|scope| -> Result<(PeerBinding, PeerBinding)> {
        let master_cancel = cancel.clone();
        let master = scope.spawn(move || {
            master_engine.pair(&nonce, PairingRole::Master, selector, &master_cancel)
        });
        let slave_cancel = cancel.clone();
        let slave_selector: Arc<dyn SlaveSelector> = Arc::new(IndexSelector(1));
        let slave = scope.spawn(move || {
            slave_engine.pair(&[], PairingRole::Slave, slave_selector, &slave_cancel)
        });

        let master_outcome = master
            .join()
            .map_err(|_| anyhow::anyhow!("master pairing thread panicked"))??;
        let slave_outcome = slave
            .join()
            .map_err(|_| anyhow::anyhow!("slave pairing thread panicked"))??;
        match (master_outcome, slave_outcome) {
            (PairingOutcome::Paired(sensor_side), PairingOutcome::Paired(display_side)) => {
                Ok((sensor_side, display_side))
            }
            _ => bail!("pairing was cancelled before completion"),
        }
    })
}

/// Console selector for `--interactive`: enumerates candidates and blocks
/// on stdin while the engine keeps republishing.
struct ConsoleSelector;

impl SlaveSelector for ConsoleSelector {
    fn choose(
        &self,
        candidates: &Mutex<Vec<SlaveCandidate>>,
        cancel: &CancellationToken,
    ) -> Option<usize> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let list = candidates.lock().expect("candidate lock").clone();
            if list.is_empty() {
                thread::sleep(Duration::from_millis(100));
                continue;
            }
            println!("Available slaves:");
            for (index, candidate) in list.iter().enumerate() {
                println!(
                    "  {}. {} ({})",
                    index + 1,
                    candidate.device_id,
                    candidate.public_base64
                );
            }
            print!("Select slave [1-{}]: ", list.len());
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return None;
            }
            match line.trim().parse::<usize>() {
                Ok(choice) if (1..=list.len()).contains(&choice) => return Some(choice - 1),
                _ => println!("Invalid selection, try again."),
            }
        }
    }
}

/// Console sink for the display side; rows keep a payload pinned to one
/// line slot per topic.
struct ConsoleView;

impl DisplayHandler for ConsoleView {
    fn on_unstructured(&mut self, row: usize, device: &str, field: &str, value: &str) {
        println!("[{row:02}] {device} {field}: {value}");
    }
    fn on_structured(&mut self, row: usize, device: &str, reading: &SensorReading) {
        println!(
            "[{row:02}] {device} structured: {} fields",
            reading.unstructured_fields().len()
        );
    }
    fn on_interoperable(&mut self, row: usize, device: &str, fields: &[InteroperableField]) {
        println!("[{row:02}] {device} interoperable: {} fields", fields.len());
    }
    fn on_signed(&mut self, row: usize, fields: &[InteroperableField]) {
        println!("[{row:02}] VERIFIED signed: {}", summarize(fields));
    }
    fn on_confidential(&mut self, row: usize, fields: &[InteroperableField]) {
        println!("[{row:02}] VERIFIED confidential: {}", summarize(fields));
    }
    fn on_event(&mut self, text: &str) {
        println!("[event] {text}");
    }
}

fn summarize(fields: &[InteroperableField]) -> String {
    fields
        .iter()
        .map(|field| format!("{}={}", field.name, field.value.render()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Synthetic weather source standing in for the real data feed.
struct WeatherWalk {
    device_id: String,
    temperature: f64,
    humidity: f64,
    pressure: f64,
}

impl WeatherWalk {
    fn new(identity: &DeviceIdentity) -> Self {
        Self {
            device_id: identity.device_id().to_string(),
            temperature: 21.5,
            humidity: 60.0,
            pressure: 1013.0,
        }
    }

    fn next_reading(&mut self) -> SensorReading {
        let mut rng = rand::thread_rng();
        self.temperature += rng.gen_range(-0.4..0.4);
        self.humidity = (self.humidity + rng.gen_range(-2.0..2.0)).clamp(0.0, 100.0);
        self.pressure += rng.gen_range(-0.8..0.8);
        let now = OffsetDateTime::now_utc();
        SensorReading {
            readout: now,
            timestamp: now,
            name: "Backyard".into(),
            id: self.device_id.clone(),
            country: "SE".into(),
            time_zone: "Europe/Stockholm".into(),
            temperature_celsius: Some(self.temperature),
            humidity_percent: Some(self.humidity),
            pressure_hpa: Some(self.pressure),
            wind_speed_mps: None,
            description: Some("simulated".into()),
        }
    }
}

fn random_scalar() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    bytes
}

fn default_device_id(device_type: &str) -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "local".into());
    format!("{device_type}-{host}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weather_walk_stays_in_range() {
        let identity = DeviceIdentity::from_scalar([1; 32], "Sensor-x", "Sensor");
        let mut walk = WeatherWalk::new(&identity);
        for _ in 0..100 {
            let reading = walk.next_reading();
            let humidity = reading.humidity_percent.unwrap();
            assert!((0.0..=100.0).contains(&humidity));
            assert_eq!(reading.id, "Sensor-x");
        }
    }

    #[test]
    fn default_device_id_carries_the_type() {
        assert!(default_device_id("Sensor").starts_with("Sensor-"));
    }
}
