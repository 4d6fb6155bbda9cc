//! Aido: a single indoor unit without zones, reached over Modbus.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::gateway::Gateway;
use crate::registers::{Field, RegisterEnum, WriteError, register_enum};

register_enum! {
    pub enum OperationMode {
        Auto = 1,
        Cooling = 2,
        Heating = 3,
        Fan = 4,
        Dry = 5,
    }
    default = Auto;
}

register_enum! {
    pub enum Speed {
        Auto = 0,
        Speed1 = 1,
        Speed2 = 2,
        Speed3 = 3,
        Speed4 = 4,
        Speed5 = 5,
        Speed6 = 6,
        Speed7 = 7,
    }
    default = Auto;
}

register_enum! {
    pub enum Louvres {
        Position0 = 0,
        Position1 = 1,
        Position2 = 2,
        Position3 = 3,
        Position4 = 4,
        Position5 = 5,
        Position6 = 6,
        Position7 = 7,
        Auto = 8,
        Swing = 9,
        Swirl = 10,
    }
    default = Auto;
}

pub mod fields {
    use super::{Louvres, OperationMode, Speed};
    use crate::registers::{Bits, Kind, enum_values, fields};

    pub const BLOCK_LEN: u16 = 7;

    fields! {
        ON: Bits::word(0), RW, Kind::Flag, "Unit switched on";
        SETPOINT: Bits::word(1), RW, Kind::Celsius, "Setpoint", min = 18.0, max = 30.0;
        LOCAL_TEMPERATURE: Bits::word(2), R_, Kind::Celsius, "Room temperature";
        OPERATION_MODE: Bits::word(3), RW, Kind::Enum(enum_values::<OperationMode>),
            "Operation mode";
        SPEED: Bits::word(4), RW, Kind::Enum(enum_values::<Speed>), "Fan speed";
        LOUVRES: Bits::word(5), RW, Kind::Enum(enum_values::<Louvres>), "Louvre position";
    }
}

pub struct Machine<G> {
    gateway: Arc<G>,
    machine_id: u8,
    state: Option<Vec<u16>>,
}

impl<G> Machine<G> {
    pub fn new(gateway: Arc<G>, machine_id: u8) -> Self {
        Self { gateway, machine_id, state: None }
    }

    pub fn machine_id(&self) -> u8 {
        self.machine_id
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

    pub fn is_on(&self) -> bool {
        fields::ON.flag(self.block())
    }

    pub fn setpoint(&self) -> f32 {
        fields::SETPOINT.celsius(self.block())
    }

    pub fn local_temperature(&self) -> f32 {
        fields::LOCAL_TEMPERATURE.celsius(self.block())
    }

    pub fn operation_mode(&self) -> OperationMode {
        fields::OPERATION_MODE.value(self.block())
    }

    pub fn speed(&self) -> Speed {
        fields::SPEED.value(self.block())
    }

    pub fn louvres(&self) -> Louvres {
        fields::LOUVRES.value(self.block())
    }
}

impl<G: Gateway> Machine<G> {
    pub async fn connect(gateway: Arc<G>, machine_id: u8) -> Self {
        let mut machine = Self::new(gateway, machine_id);
        machine.refresh().await;
        machine
    }

    /// Re-read the machine block. Without a response the machine becomes unsynced.
    pub async fn refresh(&mut self) -> bool {
        let state = self
            .gateway
            .read_input_registers(self.machine_id, 0, fields::BLOCK_LEN)
            .await;
        self.state = match state {
            Some(values) if values.len() == usize::from(fields::BLOCK_LEN) => Some(values),
            Some(values) => {
                warn!(message = "short read", received = values.len());
                None
            }
            None => {
                debug!(message = "machine state unavailable", machine_id = self.machine_id);
                None
            }
        };
        self.state.is_some()
    }

    async fn write_field(&self, field: &Field, raw: u16) -> Result<(), WriteError> {
        let word = field.encode(field.bits.word_in(self.block()), raw)?;
        debug!(message = "writing register", machine_id = self.machine_id, field = field.name, word);
        self.gateway
            .write_single_register(self.machine_id, field.bits.word, word)
            .await
            .ok_or(WriteError::NoResponse)
    }

    pub async fn turn_on(&self) -> Result<(), WriteError> {
        self.write_field(&fields::ON, 1).await
    }

    pub async fn turn_off(&self) -> Result<(), WriteError> {
        self.write_field(&fields::ON, 0).await
    }

    pub async fn set_setpoint(&self, celsius: f32) -> Result<(), WriteError> {
        fields::SETPOINT.check(celsius)?;
        self.write_field(&fields::SETPOINT, crate::registers::celsius_to_raw(celsius)).await
    }

    pub async fn set_operation_mode(&self, mode: OperationMode) -> Result<(), WriteError> {
        self.write_field(&fields::OPERATION_MODE, mode.to_raw()).await
    }

    pub async fn set_speed(&self, speed: Speed) -> Result<(), WriteError> {
        self.write_field(&fields::SPEED, speed.to_raw()).await
    }

    pub async fn set_louvres(&self, louvres: Louvres) -> Result<(), WriteError> {
        self.write_field(&fields::LOUVRES, louvres.to_raw()).await
    }
}

impl<G> std::fmt::Display for Machine<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Machine with id: {} OperationMode: {} On: {} Setpoint: {} Temperature: {} Speed: {} \
             Louvres: {}",
            self.machine_id,
            self.operation_mode(),
            self.is_on(),
            self.setpoint(),
            self.local_temperature(),
            self.speed(),
            self.louvres(),
        )
    }
}
