//! Battery readings, chemistry profiles and the payloads published for them.
//!
//! Rendering goes through [`core::fmt::Write`] so the same code fills bounded
//! `heapless` buffers on the device and `String`s on the host.

use core::fmt::{self, Write};

/// Voltage thresholds used to classify a reading for one chemistry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoltageThresholds {
    pub full: f32,
    pub nominal: f32,
    pub low: f32,
    pub critical: f32,
    pub minimum: f32,
}

const LEAD_ACID_THRESHOLDS: VoltageThresholds = VoltageThresholds {
    full: 12.7,
    nominal: 12.4,
    low: 12.0,
    critical: 11.8,
    minimum: 10.5,
};

const LIFEPO4_THRESHOLDS: VoltageThresholds = VoltageThresholds {
    full: 14.6,
    nominal: 13.2,
    low: 12.8,
    critical: 12.0,
    minimum: 10.0,
};

/// Supported battery chemistries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Chemistry {
    #[default]
    LeadAcid,
    LiFePo4,
}

const LEAD_ACID_ALIASES: [&str; 6] = ["lead-acid", "leadacid", "lead_acid", "lead", "agm", "sla"];
const LIFEPO4_ALIASES: [&str; 4] = ["lifepo4", "lifepo", "lfp", "lithium"];

impl Chemistry {
    /// Human-readable name published on the type topic.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Chemistry::LeadAcid => "Lead-Acid",
            Chemistry::LiFePo4 => "LiFePO4",
        }
    }

    /// Short identifier used in firmware image names and durable storage.
    #[must_use]
    pub const fn slug(self) -> &'static str {
        match self {
            Chemistry::LeadAcid => "leadacid",
            Chemistry::LiFePo4 => "lifepo4",
        }
    }

    /// Resolves any accepted spelling (case-insensitive) to a chemistry.
    #[must_use]
    pub fn from_alias(text: &str) -> Option<Self> {
        let text = text.trim();
        if LEAD_ACID_ALIASES
            .iter()
            .any(|alias| alias.eq_ignore_ascii_case(text))
        {
            Some(Chemistry::LeadAcid)
        } else if LIFEPO4_ALIASES
            .iter()
            .any(|alias| alias.eq_ignore_ascii_case(text))
        {
            Some(Chemistry::LiFePo4)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn thresholds(self) -> VoltageThresholds {
        match self {
            Chemistry::LeadAcid => LEAD_ACID_THRESHOLDS,
            Chemistry::LiFePo4 => LIFEPO4_THRESHOLDS,
        }
    }
}

impl fmt::Display for Chemistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Coarse battery state derived from the measured voltage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatteryStatus {
    Full,
    Good,
    Low,
    Critical,
    Dead,
}

impl BatteryStatus {
    #[must_use]
    pub fn classify(voltage: f32, chemistry: Chemistry) -> Self {
        let limits = chemistry.thresholds();
        if voltage >= limits.full {
            BatteryStatus::Full
        } else if voltage >= limits.nominal {
            BatteryStatus::Good
        } else if voltage >= limits.low {
            BatteryStatus::Low
        } else if voltage >= limits.critical {
            BatteryStatus::Critical
        } else {
            BatteryStatus::Dead
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            BatteryStatus::Full => "FULL",
            BatteryStatus::Good => "GOOD",
            BatteryStatus::Low => "LOW",
            BatteryStatus::Critical => "CRITICAL",
            BatteryStatus::Dead => "DEAD",
        }
    }
}

impl fmt::Display for BatteryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One battery measurement taken during a wake cycle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reading {
    pub voltage: f32,
    pub percentage: f32,
    pub status: BatteryStatus,
    pub timestamp_ms: u64,
}

impl Reading {
    /// Builds a reading from a raw voltage using a linear charge estimate
    /// between the chemistry's minimum and full thresholds.
    #[must_use]
    pub fn from_voltage(voltage: f32, chemistry: Chemistry, timestamp_ms: u64) -> Self {
        let limits = chemistry.thresholds();
        let percentage = if voltage >= limits.full {
            100.0
        } else if voltage <= limits.minimum {
            0.0
        } else {
            ((voltage - limits.minimum) / (limits.full - limits.minimum) * 100.0).clamp(0.0, 100.0)
        };

        Self {
            voltage,
            percentage,
            status: BatteryStatus::classify(voltage, chemistry),
            timestamp_ms,
        }
    }
}

/// Platform voltage sensor.
pub trait SensorSource {
    /// Samples the battery voltage in volts.
    fn sample_voltage(&mut self) -> f32;

    /// Milliseconds since boot, used to timestamp readings.
    fn uptime_ms(&self) -> u64;
}

/// Writes the aggregate JSON document published on the `json` topic.
///
/// `rssi` is omitted when the network link cannot report signal strength.
pub fn write_aggregate_json<W: Write>(
    writer: &mut W,
    reading: &Reading,
    chemistry: Chemistry,
    boot_count: u32,
    rssi: Option<i8>,
) -> fmt::Result {
    write!(
        writer,
        "{{\"voltage\":{:.2},\"percentage\":{:.1},\"status\":\"{}\",\"type\":\"{}\",\"boot\":{}",
        reading.voltage,
        reading.percentage,
        reading.status.as_str(),
        chemistry.display_name(),
        boot_count,
    )?;
    if let Some(rssi) = rssi {
        write!(writer, ",\"rssi\":{rssi}")?;
    }
    writer.write_char('}')
}

/// Sensor fields advertised through broker auto-discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryField {
    Voltage,
    Percentage,
    Status,
    BootCount,
}

impl DiscoveryField {
    pub const ALL: [DiscoveryField; 4] = [
        DiscoveryField::Voltage,
        DiscoveryField::Percentage,
        DiscoveryField::Status,
        DiscoveryField::BootCount,
    ];

    #[must_use]
    pub const fn object_id(self) -> &'static str {
        match self {
            DiscoveryField::Voltage => "voltage",
            DiscoveryField::Percentage => "percentage",
            DiscoveryField::Status => "status",
            DiscoveryField::BootCount => "boot",
        }
    }

    const fn label(self) -> &'static str {
        match self {
            DiscoveryField::Voltage => "Battery Voltage",
            DiscoveryField::Percentage => "Battery Level",
            DiscoveryField::Status => "Battery Status",
            DiscoveryField::BootCount => "Boot Count",
        }
    }

    const fn unit(self) -> Option<&'static str> {
        match self {
            DiscoveryField::Voltage => Some("V"),
            DiscoveryField::Percentage => Some("%"),
            DiscoveryField::Status | DiscoveryField::BootCount => None,
        }
    }

    const fn device_class(self) -> Option<&'static str> {
        match self {
            DiscoveryField::Voltage => Some("voltage"),
            DiscoveryField::Percentage => Some("battery"),
            DiscoveryField::Status | DiscoveryField::BootCount => None,
        }
    }
}

/// Writes the discovery topic for `field`.
pub fn write_discovery_topic<W: Write>(
    writer: &mut W,
    client_id: &str,
    field: DiscoveryField,
) -> fmt::Result {
    write!(
        writer,
        "homeassistant/sensor/{client_id}/{}/config",
        field.object_id()
    )
}

/// Writes the discovery document describing `field`.
pub fn write_discovery_payload<W: Write>(
    writer: &mut W,
    client_id: &str,
    state_topic: &str,
    availability_topic: &str,
    field: DiscoveryField,
) -> fmt::Result {
    write!(
        writer,
        "{{\"name\":\"{}\",\"unique_id\":\"{client_id}_{}\",\"state_topic\":\"{state_topic}\",\"availability_topic\":\"{availability_topic}\"",
        field.label(),
        field.object_id(),
    )?;
    if let Some(unit) = field.unit() {
        write!(writer, ",\"unit_of_measurement\":\"{unit}\"")?;
    }
    if let Some(class) = field.device_class() {
        write!(writer, ",\"device_class\":\"{class}\"")?;
    }
    write!(
        writer,
        ",\"device\":{{\"identifiers\":[\"{client_id}\"],\"name\":\"Battery Monitor\"}}}}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapless::String;

    #[test]
    fn classifies_lead_acid_boundaries() {
        let chem = Chemistry::LeadAcid;
        assert_eq!(BatteryStatus::classify(12.7, chem), BatteryStatus::Full);
        assert_eq!(BatteryStatus::classify(12.69, chem), BatteryStatus::Good);
        assert_eq!(BatteryStatus::classify(12.0, chem), BatteryStatus::Low);
        assert_eq!(BatteryStatus::classify(11.8, chem), BatteryStatus::Critical);
        assert_eq!(BatteryStatus::classify(11.0, chem), BatteryStatus::Dead);
    }

    #[test]
    fn lifepo4_uses_its_own_thresholds() {
        assert_eq!(
            BatteryStatus::classify(13.0, Chemistry::LiFePo4),
            BatteryStatus::Low
        );
        assert_eq!(
            BatteryStatus::classify(13.0, Chemistry::LeadAcid),
            BatteryStatus::Full
        );
    }

    #[test]
    fn percentage_is_clamped_linear_estimate() {
        let full = Reading::from_voltage(13.5, Chemistry::LeadAcid, 0);
        assert!((full.percentage - 100.0).abs() < f32::EPSILON);

        let empty = Reading::from_voltage(9.0, Chemistry::LeadAcid, 0);
        assert!(empty.percentage.abs() < f32::EPSILON);

        let half = Reading::from_voltage(12.3, Chemistry::LiFePo4, 0);
        assert!((half.percentage - 50.0).abs() < 0.01);
    }

    #[test]
    fn chemistry_aliases_are_case_insensitive() {
        assert_eq!(Chemistry::from_alias("AGM"), Some(Chemistry::LeadAcid));
        assert_eq!(Chemistry::from_alias(" Lead_Acid "), Some(Chemistry::LeadAcid));
        assert_eq!(Chemistry::from_alias("LFP"), Some(Chemistry::LiFePo4));
        assert_eq!(Chemistry::from_alias("nimh"), None);
    }

    #[test]
    fn aggregate_json_matches_wire_layout() {
        let reading = Reading {
            voltage: 12.451,
            percentage: 88.64,
            status: BatteryStatus::Good,
            timestamp_ms: 0,
        };
        let mut json: String<160> = String::new();
        write_aggregate_json(&mut json, &reading, Chemistry::LeadAcid, 7, Some(-61))
            .expect("json fits");
        assert_eq!(
            json.as_str(),
            "{\"voltage\":12.45,\"percentage\":88.6,\"status\":\"GOOD\",\"type\":\"Lead-Acid\",\"boot\":7,\"rssi\":-61}"
        );

        json.clear();
        write_aggregate_json(&mut json, &reading, Chemistry::LiFePo4, 1, None).expect("json fits");
        assert!(json.ends_with("\"boot\":1}"));
    }

    #[test]
    fn discovery_payload_carries_unit_and_class() {
        let mut payload: String<320> = String::new();
        write_discovery_payload(
            &mut payload,
            "node-7",
            "battery/monitor/voltage",
            "battery/monitor/availability",
            DiscoveryField::Voltage,
        )
        .expect("payload fits");
        assert!(payload.contains("\"unique_id\":\"node-7_voltage\""));
        assert!(payload.contains("\"unit_of_measurement\":\"V\""));
        assert!(payload.contains("\"device_class\":\"voltage\""));

        let mut topic: String<96> = String::new();
        write_discovery_topic(&mut topic, "node-7", DiscoveryField::BootCount).expect("fits");
        assert_eq!(topic.as_str(), "homeassistant/sensor/node-7/boot/config");
    }
}
