use serde::{Serialize, Deserialize};

/// Semantic meaning of a channel id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    SportState,
    Speed,
    Distance,
    Calories,
    ElapsedTime,
    HeartRate,
    Resistance,
    Incline,
    MaxSpeed,
    MinSpeed,
    MaxIncline,
    MinIncline,
    History,
    PeakResistance,
    TroughResistance,
}

/// Integer-keyed channel table of the machine protocol. The defaults are the ids the
/// physical machine uses and must not drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelTable {
    pub sport_state: u32,
    pub speed: u32,
    pub distance: u32,
    pub calories: u32,
    pub elapsed_time: u32,
    pub heart_rate: u32,
    pub resistance: u32,
    pub incline: u32,
    pub max_speed: u32,
    pub min_speed: u32,
    pub max_incline: u32,
    pub min_incline: u32,
    pub history: u32,
    // not every product reports these
    pub peak_resistance: Option<u32>,
    pub trough_resistance: Option<u32>,
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self {
            sport_state: 106,
            speed: 112,
            distance: 103,
            calories: 105,
            elapsed_time: 108,
            heart_rate: 110,
            resistance: 107,
            incline: 114,
            max_speed: 115,
            min_speed: 116,
            max_incline: 117,
            min_incline: 118,
            history: 113,
            peak_resistance: None,
            trough_resistance: None,
        }
    }
}

impl ChannelTable {
    pub fn field(&self, channel: u32) -> Option<Field> {
        let fixed = [
            (self.sport_state, Field::SportState),
            (self.speed, Field::Speed),
            (self.distance, Field::Distance),
            (self.calories, Field::Calories),
            (self.elapsed_time, Field::ElapsedTime),
            (self.heart_rate, Field::HeartRate),
            (self.resistance, Field::Resistance),
            (self.incline, Field::Incline),
            (self.max_speed, Field::MaxSpeed),
            (self.min_speed, Field::MinSpeed),
            (self.max_incline, Field::MaxIncline),
            (self.min_incline, Field::MinIncline),
            (self.history, Field::History),
        ];
        if let Some((_, f)) = fixed.iter().find(|(ch, _)| *ch == channel) {
            return Some(*f);
        }
        if self.peak_resistance == Some(channel) { return Some(Field::PeakResistance); }
        if self.trough_resistance == Some(channel) { return Some(Field::TroughResistance); }
        None
    }
}

/// Raw-to-display conversions. They differ between product variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Units {
    /// raw distance / divisor = km
    pub distance_divisor: f64,
    /// raw speed / divisor = display speed
    pub speed_divisor: f64,
    pub speed_limit_divisor: f64,
    /// display speed * factor = km/h (1.609 when the display is in mph)
    pub speed_to_kmh: f64,
}

impl Default for Units {
    fn default() -> Self {
        Self { distance_divisor: 100.0, speed_divisor: 10.0, speed_limit_divisor: 10.0, speed_to_kmh: 1.0 }
    }
}

impl Units {
    pub fn speed_from_raw(&self, raw: f64) -> f64 {
        // some firmwares already report a fractional display value
        if raw.fract() != 0.0 && raw <= 30.0 { raw } else { raw / self.speed_divisor }
    }

    pub fn speed_to_raw(&self, speed: f64) -> i64 {
        (speed * self.speed_divisor).round() as i64
    }

    pub fn distance_from_raw(&self, raw: f64) -> f64 { raw / self.distance_divisor }

    pub fn speed_limit_from_raw(&self, raw: f64) -> f64 { raw / self.speed_limit_divisor }
}

/// Product configuration: which channels exist and how their values scale.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub channels: ChannelTable,
    pub units: Units,
}

impl DeviceProfile {
    /// Exercise page variant: distance in 1/100 km.
    pub fn exercise() -> Self { Self::default() }

    /// Home page variant: distance in metres.
    pub fn home() -> Self {
        Self { units: Units { distance_divisor: 1000.0, ..Units::default() }, ..Self::default() }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "exercise" => Some(Self::exercise()),
            "home" => Some(Self::home()),
            _ => None,
        }
    }
}
