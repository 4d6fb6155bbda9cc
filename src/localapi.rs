//! The HTTP/JSON local API served by Airzone webservers.
//!
//! One `POST` returns the whole system as a list of zone records; each change is a `PUT` of a
//! single zone parameter.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::registers::{RegisterEnum, WriteError, register_enum};

pub const DEFAULT_PORT: u16 = 3000;
const PATH: &str = "/api/v1/hvac";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("`{0}` is not a usable local API address")]
    InvalidAddress(String),
    #[error("could not construct the HTTP client")]
    CreateReqwest(#[source] reqwest::Error),
    #[error("local API request failed")]
    Request(#[source] reqwest::Error),
    #[error("local API returned a malformed response")]
    Decode(#[source] reqwest::Error),
}

register_enum! {
    pub enum OperationMode {
        Stop = 1,
        Cooling = 2,
        Heating = 3,
        Fan = 4,
        Dry = 5,
        Auto = 7,
    }
    default = Stop;
}

register_enum! {
    pub enum Speed {
        Auto = 0,
        Speed1 = 1,
        Speed2 = 2,
        Speed3 = 3,
    }
    default = Auto;
}

/// One zone as reported by the local API.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneRecord {
    #[serde(rename = "systemID", default)]
    pub system_id: u8,
    #[serde(rename = "zoneID")]
    pub zone_id: u8,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub on: u8,
    #[serde(default)]
    pub max_temp: f32,
    #[serde(default)]
    pub min_temp: f32,
    #[serde(default)]
    pub setpoint: f32,
    #[serde(default)]
    pub room_temp: f32,
    #[serde(default)]
    pub humidity: u8,
    #[serde(rename = "air_demand", default)]
    pub air_demand: u8,
    #[serde(default)]
    pub mode: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<u16>,
}

impl ZoneRecord {
    pub fn is_on(&self) -> bool {
        self.on != 0
    }

    pub fn is_requesting_air(&self) -> bool {
        self.air_demand != 0
    }

    pub fn operation_mode(&self) -> OperationMode {
        OperationMode::from_raw(self.mode)
    }

    pub fn speed(&self) -> Speed {
        self.speed.map_or(Speed::DEFAULT, Speed::from_raw)
    }
}

impl std::fmt::Display for ZoneRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Zone with id: {} Name: {} On: {} Setpoint: {} Temperature: {} Humidity: {}",
            self.zone_id,
            self.name,
            self.is_on(),
            self.setpoint,
            self.room_temp,
            self.humidity,
        )
    }
}

/// The body of a successful state request.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Snapshot {
    #[serde(default)]
    pub data: Vec<ZoneRecord>,
}

#[derive(serde::Serialize)]
struct Query {
    #[serde(rename = "systemID")]
    system_id: u8,
    #[serde(rename = "zoneID")]
    zone_id: u8,
}

#[derive(serde::Serialize)]
struct Change {
    #[serde(flatten)]
    query: Query,
    #[serde(flatten)]
    parameter: serde_json::Map<String, serde_json::Value>,
}

pub struct Machine {
    client: reqwest::Client,
    url: reqwest::Url,
    system_id: u8,
    state: Option<Snapshot>,
}

/// `host` or `host:port`, the latter defaulting to [`DEFAULT_PORT`].
fn endpoint(address: &str) -> Result<reqwest::Url, Error> {
    let authority = if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{DEFAULT_PORT}")
    };
    reqwest::Url::parse(&format!("http://{authority}{PATH}"))
        .map_err(|_| Error::InvalidAddress(address.to_string()))
}

/// `value` rounded to the tenths of a degree the webserver works in, e.g. `22.3` rather than
/// `22.299999237060547`.
fn tenths(value: f32) -> serde_json::Value {
    serde_json::Value::from(f64::from((value * 10.0).round()) / 10.0)
}

impl Machine {
    /// A machine that has not talked to the webserver yet.
    pub fn new(address: &str, system_id: u8, timeout: Duration) -> Result<Self, Error> {
        let url = endpoint(address)?;
        let client =
            reqwest::Client::builder().timeout(timeout).build().map_err(Error::CreateReqwest)?;
        Ok(Self { client, url, system_id, state: None })
    }

    /// Construct the machine and fetch the first snapshot. A failed fetch leaves it unsynced.
    pub async fn connect(address: &str, system_id: u8, timeout: Duration) -> Result<Self, Error> {
        let mut machine = Self::new(address, system_id, timeout)?;
        info!(message = "using the local API", url = %machine.url);
        machine.refresh().await;
        Ok(machine)
    }

    pub fn system_id(&self) -> u8 {
        self.system_id
    }

    pub fn url(&self) -> &reqwest::Url {
        &self.url
    }

    pub fn state(&self) -> Option<&Snapshot> {
        self.state.as_ref()
    }

    pub fn is_synced(&self) -> bool {
        self.state.is_some()
    }

    /// Replace the cached snapshot, e.g. with one obtained out of band.
    pub fn set_state(&mut self, state: Option<Snapshot>) {
        self.state = state;
    }

    async fn fetch(&self) -> Result<Snapshot, Error> {
        let query = Query { system_id: self.system_id, zone_id: 0 };
        let response = self
            .client
            .post(self.url.clone())
            .json(&query)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(Error::Request)?;
        response.json::<Snapshot>().await.map_err(Error::Decode)
    }

    /// Re-fetch the snapshot. Without a response the machine becomes unsynced.
    pub async fn refresh(&mut self) -> bool {
        self.state = match self.fetch().await {
            Ok(snapshot) => {
                debug!(message = "fetched snapshot", zones = snapshot.data.len());
                Some(snapshot)
            }
            Err(e) => {
                warn!(
                    message = "could not fetch the system state",
                    system_id = self.system_id,
                    error = (&e as &dyn std::error::Error)
                );
                None
            }
        };
        self.state.is_some()
    }

    pub fn zones(&self) -> impl Iterator<Item = &ZoneRecord> {
        self.state.iter().flat_map(|state| state.data.iter())
    }

    pub fn zone(&self, zone_id: u8) -> Option<&ZoneRecord> {
        self.zones().find(|zone| zone.zone_id == zone_id)
    }

    /// The mode of the first zone, which the webserver reports for the whole system.
    pub fn operation_mode(&self) -> OperationMode {
        self.zones().next().map_or(OperationMode::DEFAULT, ZoneRecord::operation_mode)
    }

    pub fn speed(&self) -> Speed {
        self.zones().next().map_or(Speed::DEFAULT, ZoneRecord::speed)
    }

    /// Change one parameter of a zone.
    pub async fn set_zone_parameter(
        &self,
        zone_id: u8,
        parameter: &str,
        value: serde_json::Value,
    ) -> Result<(), WriteError> {
        let mut change = serde_json::Map::new();
        change.insert(parameter.to_string(), value);
        let body = Change { query: Query { system_id: self.system_id, zone_id }, parameter: change };
        debug!(message = "changing zone parameter", zone_id, parameter);
        let result = self
            .client
            .put(self.url.clone())
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(
                    message = "changing zone parameter failed",
                    zone_id,
                    parameter,
                    error = (&e as &dyn std::error::Error)
                );
                Err(WriteError::NoResponse)
            }
        }
    }

    fn known_zone(&self, zone_id: u8) -> Result<&ZoneRecord, WriteError> {
        if self.state.is_none() {
            return Err(WriteError::NotSynced { field: "zones" });
        }
        self.zone(zone_id).ok_or(WriteError::UnknownZone(zone_id))
    }

    pub async fn set_on(&self, zone_id: u8, on: bool) -> Result<(), WriteError> {
        self.set_zone_parameter(zone_id, "on", u8::from(on).into()).await
    }

    /// Bounds are the limits the webserver reports for the zone.
    pub async fn set_setpoint(&self, zone_id: u8, celsius: f32) -> Result<(), WriteError> {
        let zone = self.known_zone(zone_id)?;
        let (min, max) = (zone.min_temp, zone.max_temp);
        if !(min <= celsius && celsius <= max) {
            return Err(WriteError::OutOfRange { field: "setpoint", value: celsius, min, max });
        }
        self.set_zone_parameter(zone_id, "setpoint", tenths(celsius)).await
    }

    /// Switch a zone off when it is on and on otherwise, as last read.
    pub async fn toggle_zone(&self, zone_id: u8) -> Result<(), WriteError> {
        let on = self.known_zone(zone_id)?.is_on();
        self.set_on(zone_id, !on).await
    }

    pub async fn set_operation_mode(
        &self,
        zone_id: u8,
        mode: OperationMode,
    ) -> Result<(), WriteError> {
        self.set_zone_parameter(zone_id, "mode", mode.to_raw().into()).await
    }

    pub async fn set_speed(&self, zone_id: u8, speed: Speed) -> Result<(), WriteError> {
        self.set_zone_parameter(zone_id, "speed", speed.to_raw().into()).await
    }
}

impl std::fmt::Display for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Machine with id: {} OperationMode: {}",
            self.system_id,
            self.operation_mode()
        )?;
        write!(f, "Zones:")?;
        for zone in self.zones() {
            write!(f, "\n{zone}")?;
        }
        Ok(())
    }
}
