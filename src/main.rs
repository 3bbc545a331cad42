use ftms_link::domain::models::{AdvertisementKind, AdvertisementRecord, Device, RadioState};
use ftms_link::domain::settings::SettingsService;
use ftms_link::infrastructure::bluetooth::protocol::{self, FtmsSessionProvider};
use ftms_link::infrastructure::bluetooth::sim::SimulatedRadio;
use ftms_link::infrastructure::bluetooth::{ConnectionManager, ConnectionManagerConfig};
use ftms_link::infrastructure::logging;
use futures::StreamExt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Which device a `connect` command refers to
#[derive(Debug, Clone, PartialEq, Eq)]
enum DeviceSelector {
    Index(usize),
    Id(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    StartScan { show_all: bool },
    StopScan,
    Devices,
    Connect(DeviceSelector),
    Disconnect,
    Radio(bool),
    Read(Uuid),
    Status,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        match verb.to_lowercase().as_str() {
            "scan" => match rest {
                "" => Ok(Command::StartScan { show_all: false }),
                "all" => Ok(Command::StartScan { show_all: true }),
                other => Err(format!("unknown scan mode '{other}'")),
            },
            "stop" => Ok(Command::StopScan),
            "devices" | "ls" => Ok(Command::Devices),
            "connect" => {
                if let Ok(index) = rest.parse::<usize>() {
                    Ok(Command::Connect(DeviceSelector::Index(index)))
                } else if let Ok(id) = Uuid::parse_str(rest) {
                    Ok(Command::Connect(DeviceSelector::Id(id)))
                } else {
                    Err("usage: connect <index|uuid>".to_string())
                }
            }
            "disconnect" => Ok(Command::Disconnect),
            "radio" => match rest {
                "on" => Ok(Command::Radio(true)),
                "off" => Ok(Command::Radio(false)),
                _ => Err("usage: radio on|off".to_string()),
            },
            "read" => protocol::characteristic_by_name(rest)
                .or_else(|| Uuid::parse_str(rest).ok())
                .map(Command::Read)
                .ok_or_else(|| format!("unknown characteristic '{rest}'")),
            "status" => Ok(Command::Status),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            "" => Err("empty command".to_string()),
            other => Err(format!("unknown command '{other}', try 'help'")),
        }
    }
}

const HELP: &str = "\
commands:
  scan [all]                 start scanning (all: no service filter)
  stop                       stop scanning
  devices                    list discovered devices
  connect <index|uuid>       connect to a discovered device
  disconnect                 drop the current connection
  radio on|off               toggle the simulated radio
  read <characteristic>      read an FTMS characteristic by name or uuid
  status                     show radio, connection and session state
  quit";

/// Fitness machines the simulated radio keeps advertising
fn demo_devices(radio: &SimulatedRadio) -> Vec<Device> {
    let service_data = AdvertisementRecord::new(
        AdvertisementKind::ServiceData,
        [0x26, 0x18, 0x01, 0x20, 0x00],
    );
    let machines = [
        ("Indoor Bike", -48, protocol::INDOOR_BIKE_DATA, "Indoor Bike Data"),
        ("Rowing Machine", -63, protocol::ROWER_DATA, "Rower Data"),
        ("Treadmill", -71, protocol::TREADMILL_DATA, "Treadmill Data"),
    ];

    let mut devices: Vec<Device> = machines
        .into_iter()
        .map(|(name, rssi, data_id, data_name)| {
            let device = Device::new(Uuid::new_v4(), name)
                .with_rssi(rssi)
                .with_services(&[protocol::FITNESS_MACHINE_SERVICE])
                .with_record(service_data.clone());
            let service = radio.add_service(device.id, protocol::FITNESS_MACHINE_SERVICE);
            service.add_characteristic(
                protocol::FITNESS_MACHINE_FEATURE,
                "Fitness Machine Feature",
                [0x02, 0x40, 0x00, 0x00, 0x08, 0x20, 0x00, 0x00],
            );
            service.add_characteristic(data_id, data_name, [0x00, 0x00, 0x00, 0x00]);
            device
        })
        .collect();

    // Something that is not a fitness machine, visible with `scan all`
    devices.push(Device::new(Uuid::new_v4(), "Headphones").with_rssi(-80));
    devices
}

async fn handle_command(manager: &ConnectionManager, radio: &SimulatedRadio, command: Command) {
    match command {
        Command::StartScan { show_all: false } => manager.start_default_scan(),
        Command::StartScan { show_all: true } => manager.start_scanning(None, None),
        Command::StopScan => manager.stop_scanning(),
        Command::Devices => {
            let devices = manager.devices().sorted();
            if devices.is_empty() {
                println!("no devices discovered");
            }
            for (index, device) in devices.iter().enumerate() {
                println!("[{index}] {device} rssi={}", device.rssi);
            }
        }
        Command::Connect(selector) => {
            let id = match selector {
                DeviceSelector::Id(id) => id,
                DeviceSelector::Index(index) => match manager.devices().sorted().get(index) {
                    Some(device) => device.id,
                    None => {
                        warn!(index, "No device at that index");
                        return;
                    }
                },
            };
            if !manager.connect(id).await {
                error!(device_id = %id, "Connection failed");
            }
        }
        Command::Disconnect => manager.disconnect().await,
        Command::Radio(on) => {
            radio.set_radio_state(if on { RadioState::On } else { RadioState::Off })
        }
        Command::Read(characteristic) => {
            let Some(session) = manager.current_session() else {
                warn!("No service session");
                return;
            };
            match session.endpoint(characteristic).await {
                Ok(Some(endpoint)) => match endpoint.read().await {
                    Ok(value) => println!("{}: {:02x?}", endpoint.name(), value),
                    Err(e) => error!(error = %e, "Read failed"),
                },
                Ok(None) => {}
                Err(e) => error!(error = %e, "Characteristic lookup failed"),
            }
        }
        Command::Status => {
            println!("radio available: {}", manager.is_radio_available());
            println!("scanning: {}", manager.is_scanning());
            println!("connection: {}", manager.connection_state());
            match manager.current_session() {
                Some(session) => println!(
                    "session: {} service data {:02x?}",
                    session.device(),
                    session.service_data()
                ),
                None => println!("session: none"),
            }
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {e}"))
        .ok();

    info!(settings = %settings_service.path().display(), "Starting FTMS link");

    let radio = Arc::new(SimulatedRadio::new());
    let devices = demo_devices(&radio);
    let manager = Arc::new(ConnectionManager::new(
        radio.clone(),
        Arc::new(FtmsSessionProvider::new(radio.clone())),
        ConnectionManagerConfig::from(settings_service.get()),
    ));

    // Advertisement loop of the simulated environment
    let advertiser = {
        let radio = radio.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            loop {
                ticker.tick().await;
                for device in &devices {
                    radio.advertise(device.clone());
                }
            }
        })
    };

    let reporter = {
        let mut connected = manager.observe_connected_device();
        let mut sessions = manager.observe_current_session();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(device) = connected.next() => match device {
                        Some(device) => println!("connected device: {device}"),
                        None => println!("connected device: none"),
                    },
                    Some(session) = sessions.next() => {
                        if let Some(session) = session {
                            println!("session ready on {}", session.device());
                        }
                    }
                    else => break,
                }
            }
        })
    };

    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<Command>();
    let worker = {
        let manager = manager.clone();
        let radio = radio.clone();
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                if command == Command::Quit {
                    break;
                }
                handle_command(&manager, &radio, command).await;
            }
        })
    };

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.parse::<Command>() {
            Ok(command) => {
                let quit = command == Command::Quit;
                if command_tx.send(command).is_err() || quit {
                    break;
                }
            }
            Err(_) if line.trim().is_empty() => {}
            Err(e) => println!("{e}"),
        }
    }

    drop(command_tx);
    worker.await?;
    manager.disconnect().await;
    advertiser.abort();
    reporter.abort();
    info!("Shutting down");
    Ok(())
}
