use clap::Parser;
use companion_link::{
    BlueRSupport, ConnectTarget, ConnectionState, LinkConfig, LinkEvent, PeerKind, ProtocolEngine,
    ReconnectReason, TelemetryKind,
};
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Interval between link health checks when auto-reconnect is enabled
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "companion-link", version, about = "Talk to a companion module or peer app over BLE")]
struct Args {
    /// Bluetooth address of the peer (format: AA:BB:CC:DD:EE:FF)
    #[arg(value_name = "ADDRESS")]
    address: String,

    /// Kind of peer: module (companion sensor module) or app (peer application)
    #[arg(long, default_value = "module")]
    peer: PeerKind,

    /// JSON file with link timing configuration
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bluetooth adapter to use (default: system default adapter)
    #[arg(long, value_name = "NAME")]
    adapter: Option<String>,

    /// Reconnect automatically when the link is lost or stalls
    #[arg(long)]
    auto_reconnect: bool,

    /// Override the per-attempt connect timeout in milliseconds
    #[arg(long)]
    connect_timeout_ms: Option<u64>,

    /// Override the number of connect attempts
    #[arg(long)]
    max_connect_attempts: Option<u32>,

    /// Override the companion scan timeout in milliseconds
    #[arg(long)]
    scan_timeout_ms: Option<u64>,
}

fn load_config(args: &Args) -> companion_link::Result<LinkConfig> {
    let mut config = match &args.config {
        Some(path) => LinkConfig::from_json_file(path)?,
        None => LinkConfig::default(),
    };
    if let Some(timeout) = args.connect_timeout_ms {
        config.connect_timeout_ms = timeout;
    }
    if let Some(attempts) = args.max_connect_attempts {
        config.max_connect_attempts = attempts;
    }
    if let Some(timeout) = args.scan_timeout_ms {
        config.scan_timeout_ms = timeout;
    }
    config.validate()?;
    Ok(config)
}

fn print_event(event: &LinkEvent) {
    match event {
        LinkEvent::ConnectionStateChanged(state) => println!("[link] {}", state),
        LinkEvent::TextMessage { text, from_self } => {
            println!("{} {}", if *from_self { ">>" } else { "<<" }, text)
        }
        LinkEvent::VoiceMessage { data, from_self } => println!(
            "{} voice message ({} bytes)",
            if *from_self { ">>" } else { "<<" },
            data.len()
        ),
        LinkEvent::Telemetry(sample) => println!("[telemetry] {}", sample),
        LinkEvent::ScanRosterUpdated { roster, complete } => {
            if *complete && roster.is_empty() {
                println!("[scan] no devices found");
                return;
            }
            println!(
                "[scan] {} devices{}",
                roster.len(),
                if *complete { " (complete)" } else { "" }
            );
            for (index, device) in roster.devices.iter().enumerate() {
                println!("  {}: {} ({})", index, device.name, device.address);
            }
        }
        LinkEvent::Error(message) => eprintln!("[error] {}", message),
    }
}

/// Run one command line. Returns false when the user asked to quit.
async fn handle_command(engine: &ProtocolEngine, line: &str) -> bool {
    let (command, argument) = match line.split_once(' ') {
        Some((command, argument)) => (command, argument.trim()),
        None => (line, ""),
    };

    let result = match command {
        "" => Ok(()),
        "/quit" => return false,
        "/scan" => engine.request_scan().await,
        "/local-scan" => {
            let roster = engine.scan_local().await;
            println!("[local-scan] {} devices", roster.len());
            for device in &roster.devices {
                let rssi = device
                    .rssi
                    .map(|rssi| format!("{} dBm", rssi))
                    .unwrap_or_else(|| "n/a".to_string());
                println!("  {} ({}) {}", device.name, device.address, rssi);
            }
            Ok(())
        }
        "/select" => match argument.parse::<usize>() {
            Ok(index) => engine.select_device(index).await.map(|device| {
                println!("[scan] selected {} ({})", device.name, device.address);
            }),
            Err(_) => {
                eprintln!("usage: /select <index>");
                Ok(())
            }
        },
        "/read" => match TelemetryKind::ALL
            .into_iter()
            .find(|kind| kind.to_string() == argument)
        {
            Some(kind) => engine.read_telemetry(kind).await.map(|sample| match sample {
                Some(sample) => println!("[telemetry] {}", sample),
                None => println!("[telemetry] no {} reading", kind),
            }),
            None => {
                let kinds: Vec<String> = TelemetryKind::ALL.iter().map(ToString::to_string).collect();
                eprintln!("usage: /read <{}>", kinds.join("|"));
                Ok(())
            }
        },
        "/reconnect" => engine
            .reconnect(ReconnectReason::Manual)
            .await
            .map(|state| println!("[link] {}", state)),
        "/voice" => match tokio::fs::read(argument).await {
            Ok(blob) => engine.send_voice(&blob).await,
            Err(e) => {
                eprintln!("cannot read {}: {}", argument, e);
                Ok(())
            }
        },
        "/status" => {
            println!("[link] {}", engine.state());
            if let Some(link) = engine.link().await {
                println!(
                    "  {} ({}, {:?}), max write {} bytes",
                    link.address, link.peer, link.role, link.max_write
                );
            }
            print!("{}", engine.metrics().await);
            Ok(())
        }
        other if other.starts_with('/') => {
            eprintln!("unknown command {}", other);
            Ok(())
        }
        _ => engine.send_text(line).await,
    };

    if let Err(e) = result {
        eprintln!("[error] {}", e);
    }
    true
}

/// Watch link health and reconnect with linear backoff after loss or stall
fn spawn_supervisor(engine: Arc<ProtocolEngine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let health = engine.health();
        loop {
            sleep(HEALTH_CHECK_INTERVAL).await;

            let state = engine.state();
            let reason = match health.should_reconnect(state.is_connected()).await {
                Some(reason) => reason,
                None if matches!(state, ConnectionState::Error(_)) => ReconnectReason::ConnectionLost,
                None => continue,
            };

            match engine.reconnect(reason).await {
                Ok(ConnectionState::Connected) => info!("Reconnected after {}", reason),
                Ok(state) => error!("Reconnect failed: {}", state),
                Err(e) => error!("Reconnect failed: {}", e),
            }
        }
    })
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(&args)?;

    println!("Target device: {} ({})", args.address, args.peer);
    println!(
        "Auto-reconnect: {}",
        if args.auto_reconnect { "enabled" } else { "disabled" }
    );

    let transport = Arc::new(BlueRSupport::new(args.adapter.as_deref()).await?);
    let (engine, mut events) = ProtocolEngine::new(transport, config);
    let engine = Arc::new(engine);
    let target = ConnectTarget::Device(args.address.clone());

    let state = engine.connect(target, args.peer).await;
    if !state.is_connected() && !args.auto_reconnect {
        return Err(format!("could not connect to {}: {}", args.address, state).into());
    }

    let supervisor = args
        .auto_reconnect
        .then(|| spawn_supervisor(Arc::clone(&engine)));

    println!(
        "Type a message, or /scan /local-scan /select N /voice FILE /read KIND /reconnect /status /quit"
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(&event),
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_command(&engine, line.trim()).await {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    if let Some(supervisor) = supervisor {
        supervisor.abort();
    }
    engine.disconnect().await;
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    Ok(())
}
