use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const V1_VERSION: &str = "v1.0.0";
pub const V2_VERSION: &str = "v2.0.0";

/// The nine equipment slots of a reported player. Missing slots are empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Equipment {
    pub equip_head_id: Option<i32>,
    pub equip_amulet_id: Option<i32>,
    pub equip_torso_id: Option<i32>,
    pub equip_legs_id: Option<i32>,
    pub equip_boots_id: Option<i32>,
    pub equip_cape_id: Option<i32>,
    pub equip_hands_id: Option<i32>,
    pub equip_weapon_id: Option<i32>,
    pub equip_shield_id: Option<i32>,
}

/// Fields shared by every wire version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportFields {
    pub region_id: i32,
    pub x_coord: i32,
    pub y_coord: i32,
    pub z_coord: i32,
    /// Seconds since the epoch
    pub ts: i64,
    #[serde(deserialize_with = "deserialize_flag", serialize_with = "serialize_flag")]
    pub manual_detect: bool,
    #[serde(deserialize_with = "deserialize_int_flag")]
    pub on_members_world: i32,
    #[serde(deserialize_with = "deserialize_flag", serialize_with = "serialize_flag")]
    pub on_pvp_world: bool,
    pub world_number: i32,
    pub equipment: Equipment,
    pub equip_ge_value: i64,
}

/// Legacy reports, identifying players by display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportV1 {
    pub reporter: String,
    pub reported: String,
    #[serde(flatten)]
    pub fields: ReportFields,
}

/// Reports that carry resolved player ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportV2 {
    #[serde(deserialize_with = "deserialize_numeric_id")]
    pub reporter_id: i64,
    #[serde(deserialize_with = "deserialize_numeric_id")]
    pub reported_id: i64,
    #[serde(flatten)]
    pub fields: ReportFields,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: String,
}

impl Metadata {
    pub fn v2() -> Self {
        Metadata {
            version: V2_VERSION.to_string(),
        }
    }
}

/// An inbound report, keyed by its `metadata.version`.
#[derive(Debug, Clone, PartialEq)]
pub enum WireReport {
    V1(ReportV1),
    V2(ReportV2),
}

impl WireReport {
    pub fn fields(&self) -> &ReportFields {
        match self {
            WireReport::V1(report) => &report.fields,
            WireReport::V2(report) => &report.fields,
        }
    }
}

/// A report with both players resolved, independent of the wire version it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRecord {
    pub reporter_id: i64,
    pub reported_id: i64,
    pub region_id: i32,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub timestamp: DateTime<Utc>,
    pub manual_detect: bool,
    pub on_members_world: i32,
    pub on_pvp_world: bool,
    pub world_number: i32,
    pub equipment: Equipment,
    pub equip_ge_value: i64,
}

impl ReportRecord {
    pub fn new(
        reporter_id: i64,
        reported_id: i64,
        timestamp: DateTime<Utc>,
        fields: &ReportFields,
    ) -> Self {
        ReportRecord {
            reporter_id,
            reported_id,
            region_id: fields.region_id,
            x: fields.x_coord,
            y: fields.y_coord,
            z: fields.z_coord,
            timestamp,
            manual_detect: fields.manual_detect,
            on_members_world: fields.on_members_world,
            on_pvp_world: fields.on_pvp_world,
            world_number: fields.world_number,
            equipment: fields.equipment,
            equip_ge_value: fields.equip_ge_value,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            reported_id: self.reported_id,
            reporter_id: self.reporter_id,
            region_id: self.region_id,
        }
    }

    pub fn is_self_report(&self) -> bool {
        self.reporter_id == self.reported_id
    }

    /// The V2 wire form, used when a record has to go back through the bus.
    /// Ids are already resolved, so the retry skips name resolution.
    pub fn to_wire(&self) -> ReportV2 {
        ReportV2 {
            reporter_id: self.reporter_id,
            reported_id: self.reported_id,
            fields: ReportFields {
                region_id: self.region_id,
                x_coord: self.x,
                y_coord: self.y,
                z_coord: self.z,
                ts: self.timestamp.timestamp(),
                manual_detect: self.manual_detect,
                on_members_world: self.on_members_world,
                on_pvp_world: self.on_pvp_world,
                world_number: self.world_number,
                equipment: self.equipment,
                equip_ge_value: self.equip_ge_value,
            },
            metadata: Metadata::v2(),
        }
    }
}

/// Two reports with the same fingerprint are the same report, wherever and whenever they were seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub reported_id: i64,
    pub reporter_id: i64,
    pub region_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Player {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub possible_ban: bool,
    pub confirmed_ban: bool,
    pub confirmed_player: bool,
    pub label_id: i32,
    pub label_jagex: i32,
}

impl Player {
    pub fn new(id: i64, name: &str) -> Self {
        Player {
            id,
            name: name.to_owned(),
            created_at: Utc::now(),
            updated_at: None,
            possible_ban: false,
            confirmed_ban: false,
            confirmed_player: false,
            label_id: 0,
            label_jagex: 0,
        }
    }
}

// Producers send flags as 0/1 or as booleans
#[derive(Deserialize)]
#[serde(untagged)]
enum WireFlag {
    Bool(bool),
    Int(i64),
}

fn deserialize_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match WireFlag::deserialize(deserializer)? {
        WireFlag::Bool(flag) => Ok(flag),
        WireFlag::Int(0) => Ok(false),
        WireFlag::Int(1) => Ok(true),
        WireFlag::Int(other) => Err(D::Error::custom(format!(
            "expected a 0/1 flag, got {other}"
        ))),
    }
}

fn deserialize_int_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
    match WireFlag::deserialize(deserializer)? {
        WireFlag::Bool(flag) => Ok(i32::from(flag)),
        WireFlag::Int(value) => i32::try_from(value).map_err(D::Error::custom),
    }
}

fn serialize_flag<S: Serializer>(flag: &bool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(u8::from(*flag))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireId {
    Int(i64),
    Str(String),
}

fn deserialize_numeric_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match WireId::deserialize(deserializer)? {
        WireId::Int(id) => Ok(id),
        WireId::Str(id) => id.trim().parse().map_err(D::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fields() -> ReportFields {
        ReportFields {
            region_id: 14651,
            x_coord: 3682,
            y_coord: 3837,
            z_coord: 0,
            ts: 1704223741,
            manual_detect: false,
            on_members_world: 1,
            on_pvp_world: false,
            world_number: 324,
            equipment: Equipment {
                equip_head_id: Some(13592),
                ..Default::default()
            },
            equip_ge_value: 0,
        }
    }

    #[test]
    fn v2_ids_accept_strings_and_integers() {
        let payload = json!({
            "reporter_id": "17",
            "reported_id": 42,
            "region_id": 14651,
            "x_coord": 3682,
            "y_coord": 3837,
            "z_coord": 0,
            "ts": 1704223741,
            "manual_detect": true,
            "on_members_world": true,
            "on_pvp_world": 0,
            "world_number": 324,
            "equipment": {"equip_head_id": 13592},
            "equip_ge_value": 0,
            "metadata": {"version": "v2.0.0"}
        });

        let report: ReportV2 = serde_json::from_value(payload).unwrap();
        assert_eq!(report.reporter_id, 17);
        assert_eq!(report.reported_id, 42);
        assert!(report.fields.manual_detect);
        assert_eq!(report.fields.on_members_world, 1);
        assert!(!report.fields.on_pvp_world);
        assert_eq!(report.fields.equipment.equip_head_id, Some(13592));
        assert_eq!(report.fields.equipment.equip_shield_id, None);
    }

    #[test]
    fn flags_outside_zero_one_are_rejected() {
        let mut payload = serde_json::to_value(ReportV1 {
            reporter: "a".to_string(),
            reported: "b".to_string(),
            fields: fields(),
        })
        .unwrap();
        payload["manual_detect"] = json!(2);

        assert!(serde_json::from_value::<ReportV1>(payload).is_err());
    }

    #[test]
    fn record_wire_form_is_v2() {
        let timestamp = DateTime::from_timestamp(1704223741, 0).unwrap();
        let record = ReportRecord::new(1, 2, timestamp, &fields());

        let wire = serde_json::to_value(record.to_wire()).unwrap();
        assert_eq!(wire["metadata"]["version"], "v2.0.0");
        assert_eq!(wire["reporter_id"], 1);
        assert_eq!(wire["reported_id"], 2);
        assert_eq!(wire["ts"], 1704223741);
        assert_eq!(wire["manual_detect"], 0);
        assert_eq!(wire["equipment"]["equip_head_id"], 13592);

        let back: ReportV2 = serde_json::from_value(wire).unwrap();
        assert_eq!(back.fields, fields());
    }

    #[test]
    fn fingerprint_ignores_location_and_time() {
        let timestamp = DateTime::from_timestamp(1704223741, 0).unwrap();
        let first = ReportRecord::new(1, 2, timestamp, &fields());
        let mut second = first.clone();
        second.x += 10;
        second.timestamp = timestamp + chrono::Duration::minutes(5);

        assert_eq!(first.fingerprint(), second.fingerprint());
        assert!(!first.is_self_report());
    }
}
