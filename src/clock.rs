use crate::bits::{range_value, with_range};

const WEEKDAY_START: u8 = 0;
const WEEKDAY_WIDTH: u8 = 3;
const HOUR_START: u8 = 3;
const HOUR_WIDTH: u8 = 5;
const MINUTE_START: u8 = 8;
const MINUTE_WIDTH: u8 = 6;

/// Packs a time of week into the device clock register layout.
///
/// The word is laid out as `minute (6 bits) | hour (5 bits) | weekday (3 bits)`, from most to
/// least significant. `weekday` is 1-indexed starting at Monday.
pub const fn encode_clock(weekday: u8, hour: u8, minute: u8) -> u16 {
    let word = with_range(0, WEEKDAY_START, WEEKDAY_WIDTH, weekday as u16);
    let word = with_range(word, HOUR_START, HOUR_WIDTH, hour as u16);
    with_range(word, MINUTE_START, MINUTE_WIDTH, minute as u16)
}

/// The time of week kept by the machine real-time clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Clock {
    /// Monday (1) ... Sunday (7).
    pub weekday: u8,
    pub hour: u8,
    pub minute: u8,
}

impl Clock {
    pub fn new(weekday: u8, hour: u8, minute: u8) -> Option<Self> {
        if !(1..=7).contains(&weekday) || hour > 23 || minute > 59 {
            return None;
        }
        Some(Self { weekday, hour, minute })
    }

    pub fn from_zoned(time: &jiff::Zoned) -> Self {
        Self {
            weekday: time.weekday().to_monday_one_offset() as u8,
            hour: time.hour() as u8,
            minute: time.minute() as u8,
        }
    }

    pub fn now() -> Self {
        Self::from_zoned(&jiff::Zoned::now())
    }

    pub const fn to_word(self) -> u16 {
        encode_clock(self.weekday, self.hour, self.minute)
    }

    /// Decode the clock register. An unset clock reads as zero and decodes to `None`.
    pub fn from_word(word: u16) -> Option<Self> {
        Self::new(
            range_value(word, WEEKDAY_START, WEEKDAY_START + WEEKDAY_WIDTH - 1) as u8,
            range_value(word, HOUR_START, HOUR_START + HOUR_WIDTH - 1) as u8,
            range_value(word, MINUTE_START, MINUTE_START + MINUTE_WIDTH - 1) as u8,
        )
    }
}

impl std::fmt::Display for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let day = match self.weekday {
            1 => "Mon",
            2 => "Tue",
            3 => "Wed",
            4 => "Thu",
            5 => "Fri",
            6 => "Sat",
            _ => "Sun",
        };
        write!(f, "{day} {:0>2}:{:0>2}", self.hour, self.minute)
    }
}
