//! Innobus: zoned Airzone installations reached over Modbus.
//!
//! A [`Machine`] holds the last read of its own register block plus one block per configured
//! [`Zone`]. Reads go through [`Machine::refresh`]; setters dispatch a single register write and
//! leave the cached blocks alone, so a changed value shows up only after the next refresh.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::discovery::{self, ZoneId};
use crate::gateway::Gateway;
use crate::registers::{Field, RegisterEnum, WriteError, register_enum};

register_enum! {
    pub enum OperationMode {
        Stop = 0,
        Cold = 1,
        Hot = 2,
        Air = 3,
        HotAir = 4,
        HotPlus = 258,
    }
    default = Stop;
}

register_enum! {
    /// The automatic (bit 1) and sleep (bit 0) flags of a zone read as one value.
    pub enum ZoneMode {
        Manual = 0,
        ManualSleep = 1,
        Automatic = 2,
        AutomaticSleep = 3,
    }
    default = Manual;
}

register_enum! {
    pub enum FancoilSpeed {
        Automatic = 0,
        Speed1 = 1,
        Speed2 = 2,
        Speed3 = 3,
    }
    default = Automatic;
}

register_enum! {
    pub enum ProtectionTime {
        TenSeconds = 0,
        FourMinutes = 1,
    }
    default = TenSeconds;
}

register_enum! {
    pub enum GridMode {
        AllOrNone = 0,
        Proportional = 1,
    }
    default = AllOrNone;
}

register_enum! {
    pub enum GridAngle {
        Ninety = 0,
        Fifty = 1,
        FortyFive = 2,
        Forty = 3,
    }
    default = Ninety;
}

register_enum! {
    pub enum ProbeType {
        NoProbe = 0,
        Remote = 1,
        Floor = 2,
    }
    default = NoProbe;
}

register_enum! {
    pub enum RelayConfig {
        Off = 0,
        NormallyOpen = 1,
        NormallyClosed = 2,
    }
    default = Off;
}

register_enum! {
    pub enum LocalFancoilType {
        Grid = 0,
        Fancoil = 1,
    }
    default = Grid;
}

/// Register map of a zone. Words are relative to the zone base address.
pub mod zone {
    use super::{
        FancoilSpeed, GridAngle, GridMode, LocalFancoilType, ProbeType, RelayConfig, ZoneMode,
    };
    use crate::registers::{Bits, Kind, enum_values, fields};

    pub const BLOCK_LEN: u16 = 13;

    fields! {
        SLEEP: Bits::bit(0, 0), RW, Kind::Flag, "Sleep mode";
        AUTOMATIC: Bits::bit(0, 1), RW, Kind::Flag, "Automatic mode";
        MODE: Bits::range(0, 0, 1), RW, Kind::Enum(enum_values::<ZoneMode>), "Zone mode";
        TACTO_ON: Bits::bit(0, 2), RW, Kind::Flag, "Thermostat switched on";
        HOLD: Bits::bit(0, 3), RW, Kind::Flag, "Hold";
        SPEED_SELECTION: Bits::range(0, 4, 5), RW, Kind::Enum(enum_values::<FancoilSpeed>),
            "Selected fancoil speed";
        MIN_TEMPERATURE: Bits::word(1), RW, Kind::Celsius, "Lowest allowed setpoint",
            min = 18.0, max = 22.0;
        MAX_TEMPERATURE: Bits::word(2), RW, Kind::Celsius, "Highest allowed setpoint",
            min = 25.0, max = 30.0;
        SETPOINT: Bits::word(3), RW, Kind::Celsius, "Setpoint", min = 18.0, max = 30.0;
        MASTER: Bits::bit(4, 0), R_, Kind::Flag, "Master zone";
        GRID_MODE: Bits::bit(4, 1), R_, Kind::Enum(enum_values::<GridMode>), "Grid mode";
        AIR_ASSISTED: Bits::bit(4, 2), R_, Kind::Flag, "Air assisted enabled";
        FLOOR_ENABLED: Bits::bit(4, 3), R_, Kind::Flag, "Radiant floor enabled";
        GRID_ANGLE_HEAT: Bits::range(4, 5, 6), R_, Kind::Enum(enum_values::<GridAngle>),
            "Grid angle while heating";
        GRID_ANGLE_COLD: Bits::range(4, 7, 8), R_, Kind::Enum(enum_values::<GridAngle>),
            "Grid angle while cooling";
        MINIMUM_AIR: Bits::bit(4, 9), R_, Kind::Flag, "Minimum air enabled";
        PROBE_TYPE: Bits::range(4, 10, 11), R_, Kind::Enum(enum_values::<ProbeType>), "Probe type";
        PRESENCE_RELAY: Bits::range(4, 12, 13), R_, Kind::Enum(enum_values::<RelayConfig>),
            "Presence relay configuration";
        WINDOW_RELAY: Bits::range(4, 14, 15), R_, Kind::Enum(enum_values::<RelayConfig>),
            "Window relay configuration";
        GRID_OPENED_TIME: Bits::word(5), R_, Kind::Uint, "Grid opened time, in tens of seconds";
        TACTO_ADDRESS: Bits::word(6), R_, Kind::Uint, "Thermostat address";
        MASTER_TACTO_ADDRESS: Bits::word(7), R_, Kind::Uint, "Master thermostat address";
        REMOTE_PROBE_TEMPERATURE: Bits::word(8), R_, Kind::Celsius, "Remote probe temperature";
        GRID_OPEN: Bits::bit(9, 0), R_, Kind::Flag, "Grid open";
        GRID_MOTOR_ACTIVE: Bits::bit(9, 1), R_, Kind::Flag, "Grid motor active";
        GRID_MOTOR_REQUESTED: Bits::bit(9, 2), R_, Kind::Flag, "Grid motor requested";
        FLOOR_ACTIVE: Bits::bit(9, 5), R_, Kind::Flag, "Radiant floor active";
        LOCAL_FANCOIL_TYPE: Bits::bit(9, 6), R_, Kind::Enum(enum_values::<LocalFancoilType>),
            "Local module type";
        AIR_REQUEST: Bits::bit(9, 7), R_, Kind::Flag, "Requesting air";
        OCCUPIED: Bits::bit(9, 8), R_, Kind::Flag, "Occupied";
        WINDOW_OPEN: Bits::bit(9, 9), R_, Kind::Flag, "Window open";
        FANCOIL_SPEED: Bits::range(9, 10, 11), R_, Kind::Enum(enum_values::<FancoilSpeed>),
            "Current fancoil speed";
        PROPORTIONAL_APERTURE: Bits::range(9, 12, 13), R_, Kind::Uint, "Proportional aperture";
        TACTO_CONNECTED: Bits::bit(9, 14), R_, Kind::Flag, "Thermostat connected";
        LOCAL_TEMPERATURE: Bits::word(10), R_, Kind::Celsius, "Room temperature";
    }
}

/// Register map of the machine, starting at address 0.
pub mod machine {
    use super::{OperationMode, ProtectionTime};
    use crate::registers::{Bits, Kind, enum_values, fields};

    pub const BLOCK_LEN: u16 = 21;

    fields! {
        OPERATION_MODE: Bits::word(0), RW, Kind::Enum(enum_values::<OperationMode>),
            "Operation mode";
        HOTPLUS_DIFFERENTIAL: Bits::word(2), R_, Kind::Uint, "Hot plus differential signal";
        PROTECTION_TIME: Bits::bit(3, 0), R_, Kind::Enum(enum_values::<ProtectionTime>),
            "Protection time";
        CLOCK: Bits::word(4), RW, Kind::Clock, "Real-time clock";
        ZONE_BITMAP_1: Bits::word(9), R_, Kind::Bitmap, "Configured zones, bit n is zone n+1";
        ZONE_BITMAP_2: Bits::word(10), R_, Kind::Bitmap, "Configured zones, bit n is zone n+9";
        CENTRAL_RELAY: Bits::word(13), R_, Kind::Bitmap, "Central relay state";
    }
}

/// When to set the machine clock to the local time while connecting.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClockSync {
    Never,
    /// Only when the machine reports an unset clock.
    #[default]
    IfUnset,
    Force,
}

#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Discover configured zones from the machine bitmaps.
    pub discover_zones: bool,
    pub clock: ClockSync,
}

impl Default for Options {
    fn default() -> Self {
        Self { discover_zones: true, clock: ClockSync::default() }
    }
}

#[derive(Clone, Debug)]
pub struct Zone {
    id: ZoneId,
    state: Option<Vec<u16>>,
}

impl Zone {
    pub fn new(id: ZoneId) -> Self {
        Self { id, state: None }
    }

    pub fn id(&self) -> ZoneId {
        self.id
    }

    pub fn state(&self) -> Option<&[u16]> {
        self.state.as_deref()
    }

    pub fn is_synced(&self) -> bool {
        self.state.is_some()
    }

    fn block(&self) -> &[u16] {
        self.state.as_deref().unwrap_or(&[])
    }

    pub fn is_sleep_on(&self) -> bool {
        zone::SLEEP.flag(self.block())
    }

    pub fn is_automatic_mode(&self) -> bool {
        zone::AUTOMATIC.flag(self.block())
    }

    pub fn zone_mode(&self) -> ZoneMode {
        zone::MODE.value(self.block())
    }

    pub fn is_tacto_on(&self) -> bool {
        zone::TACTO_ON.flag(self.block())
    }

    pub fn is_hold_on(&self) -> bool {
        zone::HOLD.flag(self.block())
    }

    pub fn speed_selection(&self) -> FancoilSpeed {
        zone::SPEED_SELECTION.value(self.block())
    }

    pub fn min_temperature(&self) -> f32 {
        zone::MIN_TEMPERATURE.celsius(self.block())
    }

    pub fn max_temperature(&self) -> f32 {
        zone::MAX_TEMPERATURE.celsius(self.block())
    }

    pub fn setpoint(&self) -> f32 {
        zone::SETPOINT.celsius(self.block())
    }

    pub fn is_master_zone(&self) -> bool {
        zone::MASTER.flag(self.block())
    }

    pub fn grid_mode(&self) -> GridMode {
        zone::GRID_MODE.value(self.block())
    }

    pub fn is_air_assisted_enabled(&self) -> bool {
        zone::AIR_ASSISTED.flag(self.block())
    }

    pub fn is_floor_enabled(&self) -> bool {
        zone::FLOOR_ENABLED.flag(self.block())
    }

    pub fn grid_angle_heat(&self) -> GridAngle {
        zone::GRID_ANGLE_HEAT.value(self.block())
    }

    pub fn grid_angle_cold(&self) -> GridAngle {
        zone::GRID_ANGLE_COLD.value(self.block())
    }

    pub fn is_minimum_air_enabled(&self) -> bool {
        zone::MINIMUM_AIR.flag(self.block())
    }

    pub fn probe_type(&self) -> ProbeType {
        zone::PROBE_TYPE.value(self.block())
    }

    pub fn presence_relay(&self) -> RelayConfig {
        zone::PRESENCE_RELAY.value(self.block())
    }

    pub fn window_relay(&self) -> RelayConfig {
        zone::WINDOW_RELAY.value(self.block())
    }

    /// Seconds the grid has been open.
    pub fn grid_opened_time(&self) -> u32 {
        u32::from(zone::GRID_OPENED_TIME.uint(self.block())) * 10
    }

    pub fn tacto_address(&self) -> u16 {
        zone::TACTO_ADDRESS.uint(self.block())
    }

    pub fn master_tacto_address(&self) -> u16 {
        zone::MASTER_TACTO_ADDRESS.uint(self.block())
    }

    pub fn remote_probe_temperature(&self) -> f32 {
        zone::REMOTE_PROBE_TEMPERATURE.celsius(self.block())
    }

    pub fn is_grid_open(&self) -> bool {
        zone::GRID_OPEN.flag(self.block())
    }

    pub fn is_grid_motor_active(&self) -> bool {
        zone::GRID_MOTOR_ACTIVE.flag(self.block())
    }

    pub fn is_grid_motor_requested(&self) -> bool {
        zone::GRID_MOTOR_REQUESTED.flag(self.block())
    }

    pub fn is_floor_active(&self) -> bool {
        zone::FLOOR_ACTIVE.flag(self.block())
    }

    pub fn local_fancoil_type(&self) -> LocalFancoilType {
        zone::LOCAL_FANCOIL_TYPE.value(self.block())
    }

    pub fn is_requesting_air(&self) -> bool {
        zone::AIR_REQUEST.flag(self.block())
    }

    pub fn is_occupied(&self) -> bool {
        zone::OCCUPIED.flag(self.block())
    }

    pub fn is_window_open(&self) -> bool {
        zone::WINDOW_OPEN.flag(self.block())
    }

    pub fn fancoil_speed(&self) -> FancoilSpeed {
        zone::FANCOIL_SPEED.value(self.block())
    }

    pub fn proportional_aperture(&self) -> u16 {
        zone::PROPORTIONAL_APERTURE.uint(self.block())
    }

    pub fn is_tacto_connected(&self) -> bool {
        zone::TACTO_CONNECTED.flag(self.block())
    }

    pub fn local_temperature(&self) -> f32 {
        zone::LOCAL_TEMPERATURE.celsius(self.block())
    }

    /// Setpoint minus room temperature.
    pub fn temperature_difference(&self) -> f32 {
        self.setpoint() - self.local_temperature()
    }
}

impl std::fmt::Display for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Zone with id: {} ZoneMode: {} Tacto On: {} Hold On: {} Setpoint: {} Temperature: {}",
            self.id,
            self.zone_mode(),
            self.is_tacto_on(),
            self.is_hold_on(),
            self.setpoint(),
            self.local_temperature(),
        )
    }
}

pub struct Machine<G> {
    gateway: Arc<G>,
    machine_id: u8,
    options: Options,
    state: Option<Vec<u16>>,
    zones: BTreeMap<ZoneId, Zone>,
}

impl<G> Machine<G> {
    /// A machine that has not talked to the bus yet. Every getter returns its default.
    pub fn new(gateway: Arc<G>, machine_id: u8, options: Options) -> Self {
        Self { gateway, machine_id, options, state: None, zones: BTreeMap::new() }
    }

    pub fn machine_id(&self) -> u8 {
        self.machine_id
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    pub fn state(&self) -> Option<&[u16]> {
        self.state.as_deref()
    }

    pub fn is_synced(&self) -> bool {
        self.state.is_some()
    }

    fn block(&self) -> &[u16] {
        self.state.as_deref().unwrap_or(&[])
    }

    pub fn operation_mode(&self) -> OperationMode {
        machine::OPERATION_MODE.value(self.block())
    }

    pub fn hotplus_differential_signal(&self) -> u16 {
        machine::HOTPLUS_DIFFERENTIAL.uint(self.block())
    }

    pub fn protection_time(&self) -> ProtectionTime {
        machine::PROTECTION_TIME.value(self.block())
    }

    /// `None` while unsynced or while the machine clock is unset.
    pub fn clock(&self) -> Option<Clock> {
        machine::CLOCK.raw(self.block()).and_then(Clock::from_word)
    }

    pub fn central_relay_state(&self) -> u16 {
        machine::CENTRAL_RELAY.uint(self.block())
    }

    pub fn zone_ids(&self) -> impl Iterator<Item = ZoneId> + '_ {
        self.zones.keys().copied()
    }

    pub fn zones(&self) -> impl Iterator<Item = ZoneRef<'_, G>> {
        self.zones.values().map(move |zone| ZoneRef { machine: self, zone })
    }

    pub fn zone(&self, id: ZoneId) -> Option<ZoneRef<'_, G>> {
        self.zones.get(&id).map(|zone| ZoneRef { machine: self, zone })
    }
}

impl<G: std::fmt::Display> Machine<G> {
    /// Stable identifier of the machine, e.g. `Innobus_M1_192.168.1.20:502`.
    pub fn unique_id(&self) -> String {
        format!("Innobus_M{}_{}", self.machine_id, self.gateway)
    }
}

impl<G: Gateway> Machine<G> {
    /// Set up a machine: apply the clock policy, read the machine block and the zones.
    ///
    /// Never fails. Without a response the machine stays unsynced and can be refreshed later.
    pub async fn connect(gateway: Arc<G>, machine_id: u8, options: Options) -> Self {
        let mut machine = Self::new(gateway, machine_id, options);
        if let Err(e) = machine.sync_clock(options.clock).await {
            warn!(
                message = "could not synchronize the machine clock",
                machine_id,
                error = (&e as &dyn std::error::Error)
            );
        }
        machine.refresh().await;
        machine
    }

    async fn read(&self, address: u16, count: u16) -> Option<Vec<u16>> {
        let values = self.gateway.read_input_registers(self.machine_id, address, count).await?;
        if values.len() != usize::from(count) {
            warn!(message = "short read", address, requested = count, received = values.len());
            return None;
        }
        Some(values)
    }

    async fn write(&self, address: u16, value: u16) -> Result<(), WriteError> {
        debug!(message = "writing register", machine_id = self.machine_id, address, value);
        self.gateway
            .write_single_register(self.machine_id, address, value)
            .await
            .ok_or(WriteError::NoResponse)
    }

    async fn write_field(&self, field: &Field, raw: u16) -> Result<(), WriteError> {
        let word = field.encode(field.bits.word_in(self.block()), raw)?;
        self.write(field.bits.word, word).await
    }

    /// Re-read the machine block and every zone. Returns whether the machine block was read.
    ///
    /// Without a response the machine becomes unsynced. Zones are discovered first while none
    /// are known.
    pub async fn refresh(&mut self) -> bool {
        self.state = self.read(0, machine::BLOCK_LEN).await;
        if self.state.is_none() {
            debug!(message = "machine state unavailable", machine_id = self.machine_id);
        }
        if self.zones.is_empty() && self.options.discover_zones {
            self.rediscover_zones().await;
        }
        self.refresh_zones().await;
        self.state.is_some()
    }

    pub async fn refresh_zones(&mut self) {
        let ids = self.zones.keys().copied().collect::<Vec<_>>();
        for id in ids {
            let state = self.read(id.base_address(), zone::BLOCK_LEN).await;
            if state.is_none() {
                debug!(message = "zone state unavailable", machine_id = self.machine_id, zone = %id);
            }
            if let Some(zone) = self.zones.get_mut(&id) {
                zone.state = state;
            }
        }
    }

    /// Re-read the zone bitmaps and rebuild the zone set.
    ///
    /// Zones that remain configured keep their last read state; new zones start unsynced. Without
    /// a response the current zone set is kept and `false` is returned.
    pub async fn rediscover_zones(&mut self) -> bool {
        let bitmaps =
            self.read(discovery::ZONE_BITMAP_ADDRESS, discovery::ZONE_BITMAP_COUNT).await;
        let Some(&[first, second]) = bitmaps.as_deref() else {
            warn!(message = "could not read the zone bitmaps", machine_id = self.machine_id);
            return false;
        };
        let mut previous = std::mem::take(&mut self.zones);
        self.zones = discovery::discover_zones(first, second)
            .into_iter()
            .map(|id| (id, previous.remove(&id).unwrap_or_else(|| Zone::new(id))))
            .collect();
        debug!(
            message = "discovered zones",
            machine_id = self.machine_id,
            zones = ?self.zones.keys().map(|id| id.get()).collect::<Vec<_>>()
        );
        true
    }

    /// Apply the clock policy. Returns whether the clock was written.
    pub async fn sync_clock(&self, policy: ClockSync) -> Result<bool, WriteError> {
        match policy {
            ClockSync::Never => return Ok(false),
            ClockSync::IfUnset => {
                let current = self.read(machine::CLOCK.bits.word, 1).await;
                match current.as_deref() {
                    Some(&[0]) => {}
                    Some(_) => return Ok(false),
                    None => {
                        debug!(message = "clock unavailable, leaving it alone");
                        return Ok(false);
                    }
                }
            }
            ClockSync::Force => {}
        }
        self.set_clock(Clock::now()).await?;
        Ok(true)
    }

    pub async fn set_clock(&self, clock: Clock) -> Result<(), WriteError> {
        debug!(message = "setting the machine clock", %clock);
        self.write_field(&machine::CLOCK, clock.to_word()).await
    }

    pub async fn set_operation_mode(&self, mode: OperationMode) -> Result<(), WriteError> {
        self.write_field(&machine::OPERATION_MODE, mode.to_raw()).await
    }
}

impl<G> std::fmt::Display for Machine<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Machine with id: {} OperationMode: {}",
            self.machine_id,
            self.operation_mode()
        )?;
        write!(f, "Zones:")?;
        for zone in self.zones.values() {
            write!(f, "\n{zone}")?;
        }
        Ok(())
    }
}

/// A zone together with the machine it belongs to, for issuing writes.
pub struct ZoneRef<'a, G> {
    machine: &'a Machine<G>,
    zone: &'a Zone,
}

impl<G> Clone for ZoneRef<'_, G> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<G> Copy for ZoneRef<'_, G> {}

impl<G> std::ops::Deref for ZoneRef<'_, G> {
    type Target = Zone;
    fn deref(&self) -> &Zone {
        self.zone
    }
}

impl<G: std::fmt::Display> ZoneRef<'_, G> {
    /// The machine identifier suffixed with the zone, e.g. `Innobus_M1_192.168.1.20:502_Z3`.
    pub fn unique_id(&self) -> String {
        format!("{}_Z{}", self.machine.unique_id(), self.zone.id)
    }
}

impl<G: Gateway> ZoneRef<'_, G> {
    async fn write_field(&self, field: &Field, raw: u16) -> Result<(), WriteError> {
        let word = field.encode(field.bits.word_in(self.zone.block()), raw)?;
        self.machine.write(self.zone.id.base_address() + field.bits.word, word).await
    }

    async fn write_celsius(&self, field: &Field, value: f32) -> Result<(), WriteError> {
        let word = field.encode_celsius(field.bits.word_in(self.zone.block()), value)?;
        self.machine.write(self.zone.id.base_address() + field.bits.word, word).await
    }

    pub async fn set_sleep(&self, on: bool) -> Result<(), WriteError> {
        self.write_field(&zone::SLEEP, u16::from(on)).await
    }

    pub async fn set_automatic_mode(&self, on: bool) -> Result<(), WriteError> {
        self.write_field(&zone::AUTOMATIC, u16::from(on)).await
    }

    /// Sets the automatic and sleep flags together, in a single write.
    pub async fn set_zone_mode(&self, mode: ZoneMode) -> Result<(), WriteError> {
        self.write_field(&zone::MODE, mode.to_raw()).await
    }

    pub async fn set_tacto_on(&self, on: bool) -> Result<(), WriteError> {
        self.write_field(&zone::TACTO_ON, u16::from(on)).await
    }

    pub async fn set_hold(&self, on: bool) -> Result<(), WriteError> {
        self.write_field(&zone::HOLD, u16::from(on)).await
    }

    pub async fn set_speed_selection(&self, speed: FancoilSpeed) -> Result<(), WriteError> {
        self.write_field(&zone::SPEED_SELECTION, speed.to_raw()).await
    }

    pub async fn set_min_temperature(&self, celsius: f32) -> Result<(), WriteError> {
        self.write_celsius(&zone::MIN_TEMPERATURE, celsius).await
    }

    pub async fn set_max_temperature(&self, celsius: f32) -> Result<(), WriteError> {
        self.write_celsius(&zone::MAX_TEMPERATURE, celsius).await
    }

    pub async fn set_setpoint(&self, celsius: f32) -> Result<(), WriteError> {
        self.write_celsius(&zone::SETPOINT, celsius).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::MemoryGateway;

    const MACHINE: u8 = 1;

    fn zone_id(id: u8) -> ZoneId {
        ZoneId::new(id).unwrap()
    }

    /// A cooling machine with zones 1, 3 and 10 and its clock already set.
    fn installation() -> Arc<MemoryGateway> {
        let gateway = MemoryGateway::new();
        gateway.set(MACHINE, 0, &[1, 0, 5, 1, 7795]);
        gateway.set(MACHINE, 9, &[0b101, 0b10]);
        gateway.set(MACHINE, 13, &[0b11]);
        // Automatic mode with sleep, fancoil speed 1.
        gateway.set(MACHINE, 256, &[19, 200, 280, 215, 0b0100_0000_0000_0001, 3, 0, 0, 0]);
        gateway.set(MACHINE, 256 + 9, &[0b0100_0101_1000_0001, 223]);
        gateway.set(MACHINE, 768, &[0b100, 180, 300, 200]);
        gateway.set(MACHINE, 2560, &[0, 190, 250, 190]);
        Arc::new(gateway)
    }

    async fn connected(gateway: &Arc<MemoryGateway>) -> Machine<MemoryGateway> {
        Machine::connect(Arc::clone(gateway), MACHINE, Options::default()).await
    }

    #[tokio::test]
    async fn reads_machine_and_zones() {
        let gateway = installation();
        let machine = connected(&gateway).await;
        assert!(machine.is_synced());
        assert_eq!(machine.operation_mode(), OperationMode::Cold);
        assert_eq!(machine.hotplus_differential_signal(), 5);
        assert_eq!(machine.protection_time(), ProtectionTime::FourMinutes);
        assert_eq!(machine.clock(), Clock::new(3, 14, 30));
        assert_eq!(machine.central_relay_state(), 0b11);
        assert_eq!(machine.zone_ids().map(ZoneId::get).collect::<Vec<_>>(), [1, 3, 10]);

        let zone = machine.zone(zone_id(1)).unwrap();
        assert!(zone.is_synced());
        assert_eq!(zone.zone_mode(), ZoneMode::AutomaticSleep);
        assert!(zone.is_sleep_on());
        assert!(zone.is_automatic_mode());
        assert!(!zone.is_tacto_on());
        assert_eq!(zone.speed_selection(), FancoilSpeed::Speed1);
        assert_eq!(zone.min_temperature(), 20.0);
        assert_eq!(zone.max_temperature(), 28.0);
        assert_eq!(zone.setpoint(), 21.5);
        assert!(zone.is_master_zone());
        assert_eq!(zone.window_relay(), RelayConfig::NormallyOpen);
        assert_eq!(zone.grid_opened_time(), 30);
        assert!(zone.is_grid_open());
        assert!(zone.is_requesting_air());
        assert!(zone.is_occupied());
        assert_eq!(zone.fancoil_speed(), FancoilSpeed::Speed1);
        assert!(zone.is_tacto_connected());
        assert_eq!(zone.local_temperature(), 22.3);
        assert!((zone.temperature_difference() + 0.8).abs() < 1e-4);

        let zone = machine.zone(zone_id(3)).unwrap();
        assert!(zone.is_tacto_on());
        assert_eq!(zone.zone_mode(), ZoneMode::Manual);
    }

    #[tokio::test]
    async fn clock_is_left_alone_when_set() {
        let gateway = installation();
        let _machine = connected(&gateway).await;
        assert!(gateway.writes().is_empty());
    }

    #[tokio::test]
    async fn unset_clock_is_synchronized() {
        let gateway = installation();
        gateway.set(MACHINE, 4, &[0]);
        let machine = connected(&gateway).await;
        let writes = gateway.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!((writes[0].0, writes[0].1), (MACHINE, 4));
        assert!(Clock::from_word(writes[0].2).is_some());
        assert!(machine.clock().is_some());
    }

    #[tokio::test]
    async fn clock_policy() {
        let gateway = installation();
        let machine = Machine::new(Arc::clone(&gateway), MACHINE, Options::default());
        assert_eq!(machine.sync_clock(ClockSync::Never).await, Ok(false));
        assert_eq!(machine.sync_clock(ClockSync::IfUnset).await, Ok(false));
        assert_eq!(machine.sync_clock(ClockSync::Force).await, Ok(true));
        assert_eq!(gateway.writes().len(), 1);
    }

    #[tokio::test]
    async fn unsynced_machine_reports_defaults() {
        let gateway = installation();
        gateway.set_offline(true);
        let machine = connected(&gateway).await;
        assert!(!machine.is_synced());
        assert_eq!(machine.operation_mode(), OperationMode::Stop);
        assert_eq!(machine.clock(), None);
        assert_eq!(machine.zones().count(), 0);
        assert!(machine.to_string().starts_with("Machine with id: 1 OperationMode: stop"));

        let zone = Zone::new(zone_id(4));
        assert_eq!(zone.setpoint(), -1.0);
        assert_eq!(zone.local_temperature(), -1.0);
        assert_eq!(zone.zone_mode(), ZoneMode::Manual);
        assert_eq!(zone.speed_selection(), FancoilSpeed::Automatic);
        assert_eq!(zone.grid_angle_cold(), GridAngle::Ninety);
        assert!(!zone.is_sleep_on());
        assert_eq!(zone.grid_opened_time(), 0);
    }

    #[tokio::test]
    async fn unknown_raw_values_decode_to_defaults() {
        let gateway = installation();
        gateway.set(MACHINE, 0, &[77]);
        let machine = connected(&gateway).await;
        assert_eq!(machine.operation_mode(), OperationMode::Stop);
        gateway.set(MACHINE, 0, &[258]);
        let mut machine = machine;
        machine.refresh().await;
        assert_eq!(machine.operation_mode(), OperationMode::HotPlus);
    }

    #[tokio::test]
    async fn fan_speed_write_preserves_the_other_bits() {
        let gateway = installation();
        let machine = connected(&gateway).await;
        let zone = machine.zone(zone_id(1)).unwrap();
        zone.set_speed_selection(FancoilSpeed::Speed3).await.unwrap();
        assert_eq!(gateway.writes(), [(MACHINE, 256, 0b11_0011)]);
    }

    #[tokio::test]
    async fn zone_mode_is_a_single_write() {
        let gateway = installation();
        let machine = connected(&gateway).await;
        let zone = machine.zone(zone_id(1)).unwrap();
        zone.set_zone_mode(ZoneMode::Manual).await.unwrap();
        assert_eq!(gateway.writes(), [(MACHINE, 256, 0b1_0000)]);
    }

    #[tokio::test]
    async fn writes_do_not_patch_the_cache() {
        let gateway = installation();
        let mut machine = connected(&gateway).await;
        let zone = machine.zone(zone_id(3)).unwrap();
        zone.set_setpoint(23.0).await.unwrap();
        zone.set_hold(true).await.unwrap();
        assert_eq!(zone.setpoint(), 20.0);
        assert!(!zone.is_hold_on());
        assert_eq!(gateway.writes(), [(MACHINE, 771, 230), (MACHINE, 768, 0b1100)]);

        machine.refresh().await;
        let zone = machine.zone(zone_id(3)).unwrap();
        assert_eq!(zone.setpoint(), 23.0);
        assert!(zone.is_hold_on());
    }

    #[tokio::test]
    async fn out_of_range_writes_are_rejected() {
        let gateway = installation();
        let machine = connected(&gateway).await;
        let zone = machine.zone(zone_id(1)).unwrap();
        assert!(matches!(
            zone.set_setpoint(30.5).await,
            Err(WriteError::OutOfRange { field: "SETPOINT", .. })
        ));
        assert!(zone.set_min_temperature(23.0).await.is_err());
        assert!(zone.set_max_temperature(24.5).await.is_err());
        assert!(gateway.writes().is_empty());
        zone.set_min_temperature(22.0).await.unwrap();
        zone.set_max_temperature(25.0).await.unwrap();
        assert_eq!(gateway.writes(), [(MACHINE, 257, 220), (MACHINE, 258, 250)]);
    }

    #[tokio::test]
    async fn failed_refresh_unsyncs() {
        let gateway = installation();
        let mut machine = connected(&gateway).await;
        gateway.set_offline(true);
        assert!(!machine.refresh().await);
        assert!(!machine.is_synced());
        assert_eq!(machine.operation_mode(), OperationMode::Stop);
        // The zone set survives, only the zone states are gone.
        assert_eq!(machine.zones().count(), 3);
        let zone = machine.zone(zone_id(1)).unwrap();
        assert!(!zone.is_synced());
        assert_eq!(zone.set_sleep(false).await, Err(WriteError::NotSynced { field: "SLEEP" }));
        assert_eq!(zone.set_setpoint(20.0).await, Err(WriteError::NoResponse));
        assert_eq!(machine.set_operation_mode(OperationMode::Hot).await, Err(WriteError::NoResponse));
    }

    #[tokio::test]
    async fn rediscovery_keeps_known_zones() {
        let gateway = installation();
        let mut machine = connected(&gateway).await;
        gateway.set(MACHINE, 9, &[0b1100, 0]);
        assert!(machine.rediscover_zones().await);
        assert_eq!(machine.zone_ids().map(ZoneId::get).collect::<Vec<_>>(), [3, 4]);
        assert!(machine.zone(zone_id(3)).unwrap().is_synced());
        assert!(!machine.zone(zone_id(4)).unwrap().is_synced());
        machine.refresh_zones().await;
        assert!(machine.zone(zone_id(4)).unwrap().is_synced());

        gateway.set_offline(true);
        assert!(!machine.rediscover_zones().await);
        assert_eq!(machine.zone_ids().map(ZoneId::get).collect::<Vec<_>>(), [3, 4]);
    }

    #[tokio::test]
    async fn discovery_can_be_disabled() {
        let gateway = installation();
        let options = Options { discover_zones: false, clock: ClockSync::Never };
        let mut machine = Machine::connect(Arc::clone(&gateway), MACHINE, options).await;
        assert!(machine.is_synced());
        assert_eq!(machine.zones().count(), 0);
        assert!(machine.rediscover_zones().await);
        assert_eq!(machine.zones().count(), 3);
    }

    #[tokio::test]
    async fn zones_are_read_from_their_base_address() {
        let gateway = installation();
        let _machine = connected(&gateway).await;
        let zone_reads = gateway
            .reads()
            .into_iter()
            .filter(|&(_, _, count)| count == zone::BLOCK_LEN)
            .map(|(_, address, _)| address)
            .collect::<Vec<_>>();
        assert_eq!(zone_reads, [256, 768, 2560]);
    }

    #[tokio::test]
    async fn unique_ids() {
        let gateway = installation();
        let machine = connected(&gateway).await;
        assert_eq!(machine.unique_id(), "Innobus_M1_memory");
        let ids = machine.zones().map(|zone| zone.unique_id()).collect::<Vec<_>>();
        assert_eq!(ids, ["Innobus_M1_memory_Z1", "Innobus_M1_memory_Z3", "Innobus_M1_memory_Z10"]);
    }

    #[tokio::test]
    async fn summary() {
        let gateway = installation();
        let machine = connected(&gateway).await;
        let summary = machine.to_string();
        let mut lines = summary.lines();
        assert_eq!(lines.next(), Some("Machine with id: 1 OperationMode: cold"));
        assert_eq!(lines.next(), Some("Zones:"));
        assert_eq!(
            lines.next(),
            Some(
                "Zone with id: 1 ZoneMode: automatic-sleep Tacto On: false Hold On: false \
                 Setpoint: 21.5 Temperature: 22.3"
            )
        );
        assert_eq!(summary.lines().count(), 5);
    }
}
