//! Selecting and driving one of the supported system variants.

use std::sync::Arc;

use tracing::debug;

use crate::aido;
use crate::connection::{self, TcpGateway};
use crate::discovery::ZoneId;
use crate::innobus::{self, ClockSync};
use crate::localapi;
use crate::registers::WriteError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] connection::Error),
    #[error(transparent)]
    LocalApi(#[from] localapi::Error),
    #[error("the {0} system is reached over Modbus, use `--tcp`")]
    NeedsTcp(System),
}

#[derive(thiserror::Error, Debug)]
pub enum ApplyError {
    #[error("{setting} is not supported by {system} systems")]
    Unsupported { setting: &'static str, system: System },
    #[error("{0} applies to a single zone, select one with `--zone`")]
    ZoneRequired(&'static str),
    #[error("zone {0} is not configured")]
    UnknownZone(ZoneId),
    #[error("`{value}` is not a valid {setting} for {system} systems")]
    InvalidValue {
        setting: &'static str,
        value: String,
        system: System,
        #[source]
        source: strum::ParseError,
    },
    #[error("could not change {0}")]
    Write(&'static str, #[source] WriteError),
}

#[derive(
    clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::IntoStaticStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum System {
    /// Zoned installations on the Modbus bus.
    #[default]
    Innobus,
    /// Single indoor units on the Modbus bus.
    Aido,
    /// The HTTP API of an Airzone webserver.
    LocalApi,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "system::Args")]
pub struct Args {
    #[clap(flatten)]
    pub connection: connection::Args,

    /// The Modbus device id of the machine, or the system id for the local API.
    #[arg(long, short = 'm', default_value = "1")]
    pub machine: u8,

    /// The kind of system to talk to. Implied by `--local-api`.
    #[arg(long, value_enum)]
    pub system: Option<System>,

    /// Do not discover zones from the machine bitmaps (Innobus).
    #[arg(long)]
    pub no_discovery: bool,

    /// When to set the machine clock to the local time while connecting (Innobus).
    #[arg(long, value_enum, default_value_t = ClockSync::IfUnset)]
    pub clock: ClockSync,
}

impl Args {
    pub fn system(&self) -> System {
        match (&self.connection.how.local_api, self.system) {
            (Some(_), _) => System::LocalApi,
            (None, system) => system.unwrap_or_default(),
        }
    }

    pub fn innobus_options(&self) -> innobus::Options {
        innobus::Options { discover_zones: !self.no_discovery, clock: self.clock }
    }
}

/// A field to change, as given on the command line.
#[derive(clap::Subcommand, Clone, Debug, strum::IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Setting {
    /// Target temperature, in °C.
    Setpoint { celsius: f32 },
    /// Lowest setpoint a zone thermostat accepts, in °C (Innobus).
    MinTemperature { celsius: f32 },
    /// Highest setpoint a zone thermostat accepts, in °C (Innobus).
    MaxTemperature { celsius: f32 },
    /// Switch the unit (Aido), the thermostat (Innobus) or the zone (local API) on or off.
    Power {
        #[arg(value_enum)]
        state: Switch,
    },
    /// Sleep mode of a zone (Innobus).
    Sleep {
        #[arg(value_enum)]
        state: Switch,
    },
    /// Hold of a zone (Innobus).
    Hold {
        #[arg(value_enum)]
        state: Switch,
    },
    /// Automatic and sleep flags of a zone (Innobus).
    ZoneMode { mode: innobus::ZoneMode },
    /// Operation mode, e.g. `cold`, `hot-plus` (Innobus), `cooling` (Aido, local API).
    Mode { mode: String },
    /// Fan speed, e.g. `speed2` or `automatic` (Innobus), `auto` (Aido, local API).
    Speed { speed: String },
    /// Louvre position (Aido).
    Louvres { position: aido::Louvres },
    /// Switch a zone off when it is on and on otherwise (local API).
    Toggle,
    /// Set the machine clock to the current local time (Innobus).
    Clock,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Switch {
    On,
    Off,
}

impl Switch {
    pub fn is_on(self) -> bool {
        self == Switch::On
    }
}

impl Setting {
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

/// One row of the zone listing, common to all variants.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ZoneRow {
    pub zone: u8,
    pub name: String,
    pub on: bool,
    pub mode: String,
    pub speed: String,
    pub setpoint: f32,
    pub temperature: f32,
    pub min_temperature: f32,
    pub max_temperature: f32,
    pub air_request: bool,
}

pub enum AnyMachine {
    Innobus(innobus::Machine<TcpGateway>),
    Aido(aido::Machine<TcpGateway>),
    LocalApi(localapi::Machine),
}

/// Construct the machine selected by `args` and read its initial state.
///
/// Fails only on unusable configuration. A machine that does not respond is returned unsynced.
pub async fn connect(args: &Args) -> Result<AnyMachine, Error> {
    let system = args.system();
    debug!(message = "connecting", %system, machine = args.machine);
    Ok(match system {
        System::LocalApi => {
            let address = args
                .connection
                .how
                .local_api
                .as_deref()
                .or(args.connection.how.tcp.as_deref())
                .unwrap_or_default();
            let timeout = *args.connection.read_timeout;
            AnyMachine::LocalApi(localapi::Machine::connect(address, args.machine, timeout).await?)
        }
        System::Innobus | System::Aido => {
            if args.connection.how.tcp.is_none() {
                return Err(Error::NeedsTcp(system));
            }
            let gateway = Arc::new(TcpGateway::new(args.connection.clone())?);
            if system == System::Aido {
                AnyMachine::Aido(aido::Machine::connect(gateway, args.machine).await)
            } else {
                let options = args.innobus_options();
                AnyMachine::Innobus(innobus::Machine::connect(gateway, args.machine, options).await)
            }
        }
    })
}

impl AnyMachine {
    pub fn system(&self) -> System {
        match self {
            AnyMachine::Innobus(_) => System::Innobus,
            AnyMachine::Aido(_) => System::Aido,
            AnyMachine::LocalApi(_) => System::LocalApi,
        }
    }

    pub fn is_synced(&self) -> bool {
        match self {
            AnyMachine::Innobus(m) => m.is_synced(),
            AnyMachine::Aido(m) => m.is_synced(),
            AnyMachine::LocalApi(m) => m.is_synced(),
        }
    }

    pub async fn refresh(&mut self) -> bool {
        match self {
            AnyMachine::Innobus(m) => m.refresh().await,
            AnyMachine::Aido(m) => m.refresh().await,
            AnyMachine::LocalApi(m) => m.refresh().await,
        }
    }

    /// The cached state as last read, `null` where nothing has been read.
    pub fn raw_state(&self) -> serde_json::Value {
        match self {
            AnyMachine::Innobus(m) => innobus_raw_state(m),
            AnyMachine::Aido(m) => serde_json::json!({ "machine": m.state() }),
            AnyMachine::LocalApi(m) => serde_json::json!(m.state()),
        }
    }

    pub fn zone_rows(&self) -> Vec<ZoneRow> {
        match self {
            AnyMachine::Innobus(m) => innobus_zone_rows(m),
            AnyMachine::Aido(m) => vec![ZoneRow {
                zone: 0,
                name: String::new(),
                on: m.is_on(),
                mode: m.operation_mode().to_string(),
                speed: m.speed().to_string(),
                setpoint: m.setpoint(),
                temperature: m.local_temperature(),
                min_temperature: aido::fields::SETPOINT.minimum.unwrap_or_default(),
                max_temperature: aido::fields::SETPOINT.maximum.unwrap_or_default(),
                air_request: false,
            }],
            AnyMachine::LocalApi(m) => m
                .zones()
                .map(|zone| ZoneRow {
                    zone: zone.zone_id,
                    name: zone.name.clone(),
                    on: zone.is_on(),
                    mode: zone.operation_mode().to_string(),
                    speed: zone.speed().to_string(),
                    setpoint: zone.setpoint,
                    temperature: zone.room_temp,
                    min_temperature: zone.min_temp,
                    max_temperature: zone.max_temp,
                    air_request: zone.is_requesting_air(),
                })
                .collect(),
        }
    }

    /// Dispatch a single change. The cached state is not updated, refresh to observe it.
    pub async fn apply(&self, zone: Option<ZoneId>, setting: &Setting) -> Result<(), ApplyError> {
        match self {
            AnyMachine::Innobus(m) => apply_innobus(m, zone, setting).await,
            AnyMachine::Aido(m) => apply_aido(m, setting).await,
            AnyMachine::LocalApi(m) => apply_local_api(m, zone, setting).await,
        }
    }
}

impl std::fmt::Display for AnyMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnyMachine::Innobus(m) => std::fmt::Display::fmt(m, f),
            AnyMachine::Aido(m) => std::fmt::Display::fmt(m, f),
            AnyMachine::LocalApi(m) => std::fmt::Display::fmt(m, f),
        }
    }
}

fn innobus_raw_state<G>(machine: &innobus::Machine<G>) -> serde_json::Value {
    let zones = machine
        .zones()
        .map(|zone| (zone.id().to_string(), serde_json::json!(zone.state())))
        .collect::<serde_json::Map<_, _>>();
    serde_json::json!({ "machine": machine.state(), "zones": zones })
}

fn innobus_zone_rows<G>(machine: &innobus::Machine<G>) -> Vec<ZoneRow> {
    machine
        .zones()
        .map(|zone| ZoneRow {
            zone: zone.id().get(),
            name: String::new(),
            on: zone.is_tacto_on(),
            mode: zone.zone_mode().to_string(),
            speed: zone.speed_selection().to_string(),
            setpoint: zone.setpoint(),
            temperature: zone.local_temperature(),
            min_temperature: zone.min_temperature(),
            max_temperature: zone.max_temperature(),
            air_request: zone.is_requesting_air(),
        })
        .collect()
}

fn parse<T>(setting: &Setting, system: System, value: &str) -> Result<T, ApplyError>
where
    T: std::str::FromStr<Err = strum::ParseError>,
{
    value.parse().map_err(|source| ApplyError::InvalidValue {
        setting: setting.name(),
        value: value.to_string(),
        system,
        source,
    })
}

async fn apply_innobus<G: crate::gateway::Gateway>(
    machine: &innobus::Machine<G>,
    zone: Option<ZoneId>,
    setting: &Setting,
) -> Result<(), ApplyError> {
    let name = setting.name();
    let write = |e| ApplyError::Write(name, e);
    match setting {
        Setting::Mode { mode } => {
            let mode = parse(setting, System::Innobus, mode)?;
            return machine.set_operation_mode(mode).await.map_err(write);
        }
        Setting::Clock => {
            return machine.set_clock(crate::clock::Clock::now()).await.map_err(write);
        }
        Setting::Louvres { .. } | Setting::Toggle => {
            return Err(ApplyError::Unsupported { setting: name, system: System::Innobus });
        }
        _ => {}
    }
    let id = zone.ok_or(ApplyError::ZoneRequired(name))?;
    let zone = machine.zone(id).ok_or(ApplyError::UnknownZone(id))?;
    let result = match setting {
        Setting::Setpoint { celsius } => zone.set_setpoint(*celsius).await,
        Setting::MinTemperature { celsius } => zone.set_min_temperature(*celsius).await,
        Setting::MaxTemperature { celsius } => zone.set_max_temperature(*celsius).await,
        Setting::Power { state } => zone.set_tacto_on(state.is_on()).await,
        Setting::Sleep { state } => zone.set_sleep(state.is_on()).await,
        Setting::Hold { state } => zone.set_hold(state.is_on()).await,
        Setting::ZoneMode { mode } => zone.set_zone_mode(*mode).await,
        Setting::Speed { speed } => {
            zone.set_speed_selection(parse(setting, System::Innobus, speed)?).await
        }
        // Handled above.
        Setting::Mode { .. } | Setting::Clock | Setting::Louvres { .. } | Setting::Toggle => {
            return Ok(());
        }
    };
    result.map_err(write)
}

async fn apply_aido<G: crate::gateway::Gateway>(
    machine: &aido::Machine<G>,
    setting: &Setting,
) -> Result<(), ApplyError> {
    let name = setting.name();
    let result = match setting {
        Setting::Setpoint { celsius } => machine.set_setpoint(*celsius).await,
        Setting::Power { state: Switch::On } => machine.turn_on().await,
        Setting::Power { state: Switch::Off } => machine.turn_off().await,
        Setting::Mode { mode } => {
            machine.set_operation_mode(parse(setting, System::Aido, mode)?).await
        }
        Setting::Speed { speed } => machine.set_speed(parse(setting, System::Aido, speed)?).await,
        Setting::Louvres { position } => machine.set_louvres(*position).await,
        Setting::MinTemperature { .. }
        | Setting::MaxTemperature { .. }
        | Setting::Sleep { .. }
        | Setting::Hold { .. }
        | Setting::ZoneMode { .. }
        | Setting::Toggle
        | Setting::Clock => {
            return Err(ApplyError::Unsupported { setting: name, system: System::Aido });
        }
    };
    result.map_err(|e| ApplyError::Write(name, e))
}

async fn apply_local_api(
    machine: &localapi::Machine,
    zone: Option<ZoneId>,
    setting: &Setting,
) -> Result<(), ApplyError> {
    let name = setting.name();
    // Machine wide settings go to the first zone, which the webserver propagates.
    let zone_id = match zone {
        Some(zone) => zone.get(),
        None if matches!(setting, Setting::Mode { .. } | Setting::Speed { .. }) => {
            machine.zones().next().map_or(1, |zone| zone.zone_id)
        }
        None => return Err(ApplyError::ZoneRequired(name)),
    };
    let result = match setting {
        Setting::Setpoint { celsius } => machine.set_setpoint(zone_id, *celsius).await,
        Setting::Power { state } => machine.set_on(zone_id, state.is_on()).await,
        Setting::Toggle => machine.toggle_zone(zone_id).await,
        Setting::Mode { mode } => {
            machine.set_operation_mode(zone_id, parse(setting, System::LocalApi, mode)?).await
        }
        Setting::Speed { speed } => {
            machine.set_speed(zone_id, parse(setting, System::LocalApi, speed)?).await
        }
        Setting::MinTemperature { .. }
        | Setting::MaxTemperature { .. }
        | Setting::Sleep { .. }
        | Setting::Hold { .. }
        | Setting::ZoneMode { .. }
        | Setting::Louvres { .. }
        | Setting::Clock => {
            return Err(ApplyError::Unsupported { setting: name, system: System::LocalApi });
        }
    };
    result.map_err(|e| ApplyError::Write(name, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::MemoryGateway;
    use clap::Parser as _;

    #[derive(clap::Parser)]
    struct Cli {
        #[clap(flatten)]
        system: Args,
        #[command(subcommand)]
        setting: Option<Setting>,
    }

    fn parse_cli(argv: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("test").chain(argv.iter().copied()))
    }

    #[test]
    fn system_selection() {
        let cli = parse_cli(&["--tcp", "10.0.0.3:502"]);
        assert_eq!(cli.system.system(), System::Innobus);
        assert_eq!(cli.system.machine, 1);
        assert_eq!(cli.system.clock, ClockSync::IfUnset);
        assert!(cli.system.innobus_options().discover_zones);

        let cli = parse_cli(&["--tcp", "10.0.0.3:502", "--system", "aido", "-m", "4"]);
        assert_eq!(cli.system.system(), System::Aido);
        assert_eq!(cli.system.machine, 4);

        let cli = parse_cli(&["--local-api", "10.0.0.4", "--system", "innobus", "--no-discovery"]);
        assert_eq!(cli.system.system(), System::LocalApi);
        assert!(!cli.system.innobus_options().discover_zones);
    }

    #[test]
    fn settings_parse() {
        let cli = parse_cli(&["--tcp", "h:502", "zone-mode", "automatic-sleep"]);
        assert!(matches!(
            cli.setting,
            Some(Setting::ZoneMode { mode: innobus::ZoneMode::AutomaticSleep })
        ));
        let cli = parse_cli(&["--tcp", "h:502", "power", "off"]);
        assert!(matches!(cli.setting, Some(Setting::Power { state: Switch::Off })));
        let cli = parse_cli(&["--tcp", "h:502", "setpoint", "21.5"]);
        assert!(matches!(cli.setting, Some(Setting::Setpoint { celsius }) if celsius == 21.5));
        let cli = parse_cli(&["--local-api", "h", "toggle"]);
        assert!(matches!(cli.setting, Some(Setting::Toggle)));
        assert_eq!(Setting::Clock.name(), "clock");
        assert_eq!(Setting::MinTemperature { celsius: 1.0 }.name(), "min-temperature");
    }

    fn installation() -> Arc<MemoryGateway> {
        let gateway = MemoryGateway::new();
        gateway.set(1, 0, &[1, 0, 0, 0, 7795]);
        gateway.set(1, 9, &[0b10, 0]);
        gateway.set(1, 512, &[0b10, 200, 280, 215]);
        Arc::new(gateway)
    }

    #[tokio::test]
    async fn innobus_settings() {
        let gateway = installation();
        let machine =
            innobus::Machine::connect(Arc::clone(&gateway), 1, innobus::Options::default()).await;
        let zone = ZoneId::new(2);
        apply_innobus(&machine, None, &Setting::Mode { mode: "hot-plus".into() }).await.unwrap();
        apply_innobus(&machine, zone, &Setting::Setpoint { celsius: 24.0 }).await.unwrap();
        apply_innobus(&machine, zone, &Setting::Speed { speed: "speed2".into() }).await.unwrap();
        apply_innobus(&machine, zone, &Setting::Sleep { state: Switch::On }).await.unwrap();
        assert_eq!(
            gateway.writes(),
            [(1, 0, 258), (1, 515, 240), (1, 512, 0b10_0010), (1, 512, 0b11)]
        );

        assert!(matches!(
            apply_innobus(&machine, None, &Setting::Setpoint { celsius: 24.0 }).await,
            Err(ApplyError::ZoneRequired("setpoint"))
        ));
        assert!(matches!(
            apply_innobus(&machine, ZoneId::new(5), &Setting::Hold { state: Switch::On }).await,
            Err(ApplyError::UnknownZone(_))
        ));
        assert!(matches!(
            apply_innobus(&machine, None, &Setting::Mode { mode: "cooling".into() }).await,
            Err(ApplyError::InvalidValue { setting: "mode", .. })
        ));
        assert!(matches!(
            apply_innobus(&machine, zone, &Setting::Setpoint { celsius: 35.0 }).await,
            Err(ApplyError::Write("setpoint", WriteError::OutOfRange { .. }))
        ));
        assert!(matches!(
            apply_innobus(&machine, zone, &Setting::Louvres { position: aido::Louvres::Swing })
                .await,
            Err(ApplyError::Unsupported { system: System::Innobus, .. })
        ));
        assert_eq!(gateway.writes().len(), 4);
    }

    #[tokio::test]
    async fn aido_settings() {
        let gateway = Arc::new(MemoryGateway::new());
        let machine = aido::Machine::connect(Arc::clone(&gateway), 2).await;
        apply_aido(&machine, &Setting::Power { state: Switch::On }).await.unwrap();
        apply_aido(&machine, &Setting::Mode { mode: "cooling".into() }).await.unwrap();
        apply_aido(&machine, &Setting::Louvres { position: aido::Louvres::Swirl }).await.unwrap();
        assert_eq!(gateway.writes(), [(2, 0, 1), (2, 3, 2), (2, 5, 10)]);
        assert!(matches!(
            apply_aido(&machine, &Setting::Hold { state: Switch::On }).await,
            Err(ApplyError::Unsupported { setting: "hold", system: System::Aido })
        ));
    }

    #[tokio::test]
    async fn innobus_rows_and_raw_state() {
        let gateway = installation();
        let machine =
            innobus::Machine::connect(Arc::clone(&gateway), 1, innobus::Options::default()).await;
        let rows = innobus_zone_rows(&machine);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].zone, 2);
        assert_eq!(rows[0].mode, "automatic");
        assert_eq!(rows[0].setpoint, 21.5);
        let raw = innobus_raw_state(&machine);
        assert_eq!(raw["machine"][0], 1);
        assert_eq!(raw["machine"][4], 7795);
        assert_eq!(raw["zones"]["2"][3], 215);
    }

    #[tokio::test]
    async fn local_api_requires_a_zone_for_zone_settings() {
        let machine =
            localapi::Machine::new("127.0.0.1:1", 1, std::time::Duration::from_secs(1)).unwrap();
        assert!(matches!(
            apply_local_api(&machine, None, &Setting::Setpoint { celsius: 21.0 }).await,
            Err(ApplyError::ZoneRequired("setpoint"))
        ));
        assert!(matches!(
            apply_local_api(&machine, ZoneId::new(1), &Setting::Clock).await,
            Err(ApplyError::Unsupported { system: System::LocalApi, .. })
        ));
        assert!(matches!(
            apply_local_api(&machine, None, &Setting::Mode { mode: "sideways".into() }).await,
            Err(ApplyError::InvalidValue { .. })
        ));
        assert!(matches!(
            apply_local_api(&machine, ZoneId::new(1), &Setting::Toggle).await,
            Err(ApplyError::Write("toggle", WriteError::NotSynced { .. }))
        ));
    }
}
