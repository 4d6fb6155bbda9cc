//! Field descriptors and the machinery for the per-device register maps.
//!
//! Each device variant declares its register map with [`fields!`], which produces one [`Field`]
//! constant per named field and a `FIELDS` table used for listing the map.

use crate::bits::{range_value, with_bit, with_range};

/// Returned by temperature getters while no register block has been read.
pub const UNSYNCED_TEMPERATURE: f32 = -1.0;

/// Celsius values are transferred multiplied by 10.
pub const CELSIUS_SCALE: f32 = 10.0;

pub fn celsius(raw: u16) -> f32 {
    f32::from(raw as i16) / CELSIUS_SCALE
}

pub fn celsius_to_raw(value: f32) -> u16 {
    (value * CELSIUS_SCALE).round() as i16 as u16
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum WriteError {
    #[error("{field} is not writable")]
    ReadOnly { field: &'static str },
    #[error("{value} is outside of the accepted range {min}..={max} for {field}")]
    OutOfRange { field: &'static str, value: f32, min: f32, max: f32 },
    #[error("the current value of {field} is unknown, refresh the state first")]
    NotSynced { field: &'static str },
    #[error("zone {0} is not known")]
    UnknownZone(u8),
    #[error("the device did not acknowledge the write")]
    NoResponse,
}

#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Mode(u8);

impl serde::Serialize for Mode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0 & Self::R.0 == 0 { "-" } else { "R" })?;
        f.write_str(if self.0 & Self::W.0 == 0 { "-" } else { "W" })?;
        Ok(())
    }
}

impl Mode {
    pub const R: Self = Self(1 << 0);
    pub const W: Self = Self(1 << 1);
    pub const RW: Self = Self(Self::R.0 | Self::W.0);
    // Alias for nicely tabulated `fields!` invocations.
    pub const R_: Self = Self::R;

    pub const fn is_writable(self) -> bool {
        self.0 & Self::W.0 != 0
    }
}

/// Location of a field: a word of the register block and an inclusive bit range within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bits {
    pub word: u16,
    pub start: u8,
    pub end: u8,
}

impl Bits {
    pub const fn range(word: u16, start: u8, end: u8) -> Self {
        assert!(start <= end && end < 16, "bit range must lie within a 16-bit word");
        Self { word, start, end }
    }

    pub const fn bit(word: u16, bit: u8) -> Self {
        Self::range(word, bit, bit)
    }

    pub const fn word(word: u16) -> Self {
        Self::range(word, 0, 15)
    }

    pub const fn width(self) -> u8 {
        self.end - self.start + 1
    }

    pub const fn is_full_word(self) -> bool {
        self.width() == 16
    }

    /// The whole register word holding this field.
    pub fn word_in(self, block: &[u16]) -> Option<u16> {
        block.get(usize::from(self.word)).copied()
    }

    pub const fn extract(self, word: u16) -> u16 {
        range_value(word, self.start, self.end)
    }

    /// Replace this field within `word`, leaving every other bit as it was.
    pub const fn splice(self, word: u16, value: u16) -> u16 {
        if self.start == self.end {
            with_bit(word, self.start, value & 1 == 1)
        } else {
            with_range(word, self.start, self.width(), value)
        }
    }
}

impl std::fmt::Display for Bits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_full_word() {
            write!(f, "{}", self.word)
        } else if self.start == self.end {
            write!(f, "{}.{}", self.word, self.start)
        } else {
            write!(f, "{}.{}-{}", self.word, self.start, self.end)
        }
    }
}

/// How the raw bits of a field are interpreted.
#[derive(Clone, Copy)]
pub enum Kind {
    Flag,
    Uint,
    Celsius,
    Enum(fn() -> Vec<(u16, &'static str)>),
    Clock,
    Bitmap,
}

impl Kind {
    pub fn name(&self) -> &'static str {
        match self {
            Kind::Flag => "flag",
            Kind::Uint => "uint",
            Kind::Celsius => "celsius",
            Kind::Enum(_) => "enum",
            Kind::Clock => "clock",
            Kind::Bitmap => "bitmap",
        }
    }

    /// Human readable list of the values an enumerated field can take.
    pub fn values(&self) -> String {
        match self {
            Kind::Enum(values) => values()
                .into_iter()
                .map(|(raw, name)| format!("{raw}={name}"))
                .collect::<Vec<_>>()
                .join(", "),
            Kind::Flag => "0=off, 1=on".into(),
            _ => String::new(),
        }
    }
}

/// A named field of a register map.
#[derive(Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub bits: Bits,
    pub mode: Mode,
    pub kind: Kind,
    pub description: &'static str,
    pub minimum: Option<f32>,
    pub maximum: Option<f32>,
}

impl Field {
    pub fn raw(&self, block: &[u16]) -> Option<u16> {
        self.bits.word_in(block).map(|word| self.bits.extract(word))
    }

    pub fn flag(&self, block: &[u16]) -> bool {
        self.raw(block).is_some_and(|v| v != 0)
    }

    pub fn uint(&self, block: &[u16]) -> u16 {
        self.raw(block).unwrap_or(0)
    }

    pub fn celsius(&self, block: &[u16]) -> f32 {
        self.raw(block).map_or(UNSYNCED_TEMPERATURE, celsius)
    }

    pub fn value<T: RegisterEnum>(&self, block: &[u16]) -> T {
        self.raw(block).map_or(T::DEFAULT, T::from_raw)
    }

    /// Inclusive bounds check against the documented limits of this field.
    pub fn check(&self, value: f32) -> Result<(), WriteError> {
        let min = self.minimum.unwrap_or(f32::MIN);
        let max = self.maximum.unwrap_or(f32::MAX);
        if min <= value && value <= max {
            Ok(())
        } else {
            Err(WriteError::OutOfRange { field: self.name, value, min, max })
        }
    }

    /// Compute the register word that stores `raw` in this field.
    ///
    /// `current` is the word as last read from the device. It is required unless the field spans
    /// the whole word.
    pub fn encode(&self, current: Option<u16>, raw: u16) -> Result<u16, WriteError> {
        if !self.mode.is_writable() {
            return Err(WriteError::ReadOnly { field: self.name });
        }
        if self.bits.is_full_word() {
            return Ok(raw);
        }
        let current = current.ok_or(WriteError::NotSynced { field: self.name })?;
        Ok(self.bits.splice(current, raw))
    }

    pub fn encode_celsius(&self, current: Option<u16>, value: f32) -> Result<u16, WriteError> {
        self.check(value)?;
        self.encode(current, celsius_to_raw(value))
    }
}

/// Closed enumerations stored in register fields.
///
/// Decoding never fails: raw values without a variant map to [`RegisterEnum::DEFAULT`], since
/// firmware revisions may report values this crate does not know about.
pub trait RegisterEnum: Copy + 'static {
    const DEFAULT: Self;
    fn from_raw(raw: u16) -> Self;
    fn to_raw(self) -> u16;
}

pub fn enum_values<T>() -> Vec<(u16, &'static str)>
where
    T: strum::VariantNames + strum::VariantArray + num_traits::ToPrimitive,
{
    let names = <T as strum::VariantNames>::VARIANTS;
    let values = <T as strum::VariantArray>::VARIANTS;
    names
        .iter()
        .zip(values)
        .filter_map(|(name, value)| Some((value.to_u16()?, *name)))
        .collect()
}

macro_rules! register_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident = $value:literal),* $(,)?
        }
        default = $default:ident;
    ) => {
        #[derive(
            Clone,
            Copy,
            Debug,
            PartialEq,
            Eq,
            strum::VariantNames,
            strum::VariantArray,
            strum::FromRepr,
            strum::IntoStaticStr,
            strum::EnumString,
            strum::Display,
            num_derive::ToPrimitive,
        )]
        #[strum(serialize_all = "kebab-case")]
        #[repr(u16)]
        $(#[$meta])*
        $vis enum $name {
            $($variant = $value),*
        }

        impl $crate::registers::RegisterEnum for $name {
            const DEFAULT: Self = Self::$default;
            fn from_raw(raw: u16) -> Self {
                Self::from_repr(raw).unwrap_or(Self::DEFAULT)
            }
            fn to_raw(self) -> u16 {
                self as u16
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(<&'static str>::from(self))
            }
        }
    };
}

pub(crate) use register_enum;

macro_rules! optional {
    () => {
        None
    };
    ($($lit: tt)+) => {
        Some($($lit)*)
    };
}

pub(crate) use optional;

macro_rules! fields {
    ($(
        $name: ident: $bits: expr, $mode: ident, $kind: expr, $desc: literal
        $(, min = $min: literal)? $(, max = $max: literal)?;
    )+) => {
        $(
            pub const $name: $crate::registers::Field = $crate::registers::Field {
                name: stringify!($name),
                bits: $bits,
                mode: $crate::registers::Mode::$mode,
                kind: $kind,
                description: $desc,
                minimum: $crate::registers::optional!($($min)?),
                maximum: $crate::registers::optional!($($max)?),
            };
        )+

        pub static FIELDS: &[$crate::registers::Field] = &[$($name),+];
    };
}

pub(crate) use fields;
