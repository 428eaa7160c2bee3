use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::ValidationError,
    node::{RelayNode, SensorNode},
    schedule::Period,
    types::ZoneId,
};

/// Serialized form of one zone inside the `systems` array.
///
/// Field names match documents written by existing deployments. Timestamps
/// are float epoch seconds; fields this version does not know are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub system_id: ZoneId,
    pub sensor: SensorNode,
    pub relay: RelayNode,
    #[serde(default)]
    pub program: bool,
    #[serde(default)]
    pub periods: Vec<Period>,
    #[serde(default, with = "epoch_seconds")]
    pub advance: Option<DateTime<Utc>>,
    #[serde(default, with = "epoch_seconds")]
    pub boost: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, with = "epoch_seconds")]
    pub disabled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default, with = "epoch_seconds")]
    pub temperature_expiry: Option<DateTime<Utc>>,
}

/// The identity and relay of a record. Decodes even when the rest of the
/// record does not, so cleanup can still reach the relay.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelayRecord {
    pub system_id: ZoneId,
    pub relay: RelayNode,
}

/// `Option<DateTime<Utc>>` as a nullable float of seconds since the epoch.
pub mod epoch_seconds {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn to_f64(at: DateTime<Utc>) -> f64 {
        at.timestamp() as f64 + f64::from(at.timestamp_subsec_micros()) / 1_000_000.0
    }

    pub fn from_f64(secs: f64) -> Option<DateTime<Utc>> {
        if !secs.is_finite() {
            return None;
        }
        let whole = secs.floor();
        let micros = ((secs - whole) * 1_000_000.0).round() as i64;
        Utc.timestamp_opt(whole as i64, 0)
            .single()
            .map(|at| at + chrono::Duration::microseconds(micros))
    }

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(at) => serializer.serialize_f64(to_f64(*at)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<f64>::deserialize(deserializer)? {
            Some(secs) => from_f64(secs)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp {secs}"))),
            None => Ok(None),
        }
    }
}

/// The whole persisted document. Records stay as raw JSON until asked for so
/// that one unreadable record never blocks saving the others.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistenceDocument {
    #[serde(default)]
    pub systems: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PersistenceDocument {
    /// An empty or whitespace-only file reads as an empty document.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(text)
    }

    pub fn to_pretty_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    /// Decodes record `index`, reporting why it is unusable if it is not.
    pub fn record(&self, index: usize) -> Option<Result<ZoneRecord, ValidationError>> {
        self.systems.get(index).map(|raw| {
            ZoneRecord::deserialize(raw).map_err(|err| ValidationError::Malformed(err.to_string()))
        })
    }

    pub fn records(&self) -> impl Iterator<Item = Result<ZoneRecord, ValidationError>> + '_ {
        (0..self.systems.len()).filter_map(|index| self.record(index))
    }

    /// Every usable relay in the document, including those of records that
    /// fail full validation.
    pub fn relays(&self) -> impl Iterator<Item = RelayRecord> + '_ {
        self.systems.iter().filter_map(|raw| {
            RelayRecord::deserialize(raw)
                .ok()
                .filter(|record| record.relay.validate().is_ok())
        })
    }

    /// Removes every record with the same `system_id`, then appends `record`.
    pub fn upsert(&mut self, record: &ZoneRecord) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(record)?;
        self.systems.retain(|raw| {
            !raw.get("system_id")
                .is_some_and(|id| record.system_id.matches_json(id))
        });
        self.systems.push(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn legacy_document() -> &'static str {
        r#"{
            "systems": [
                {
                    "relay": {
                        "url_on": "http://192.168.1.1/off?pin=1",
                        "url_off": "http://192.168.1.1/on?pin=1",
                        "url_status": "http://192.168.1.1/status?pin=1"
                    },
                    "sensor": {"url": "http://192.168.1.44", "adjustment": 0.5},
                    "system_id": 1,
                    "program": true,
                    "periods": [
                        {"start": 7.0, "end": 10.5, "target": 21.0,
                         "days": {"monday": true, "tuesday": true, "wednesday": true,
                                  "thursday": true, "friday": true,
                                  "saturday": false, "sunday": false},
                         "id": "6f0c"}
                    ],
                    "advance": null,
                    "boost": 1767603600.5,
                    "temperature": 19.5,
                    "temperature_expiry": null,
                    "cached_value": {"URLS": {}}
                },
                {"system_id": "broken"}
            ]
        }"#
    }

    #[test]
    fn reads_legacy_record_and_reports_malformed_one() {
        let document = PersistenceDocument::parse(legacy_document()).unwrap();
        let records: Vec<_> = document.records().collect();

        assert_eq!(records.len(), 2);
        let record = records[0].as_ref().unwrap();
        assert_eq!(record.system_id.as_str(), "1");
        assert_eq!(record.periods[0].id, "6f0c");
        assert!(!record.periods[0].days.saturday);
        assert_eq!(record.error_count, 0);
        assert_eq!(
            record.boost,
            Some(Utc.timestamp_opt(1_767_603_600, 500_000_000).unwrap())
        );
        assert!(matches!(records[1], Err(ValidationError::Malformed(_))));
    }

    #[test]
    fn upsert_replaces_by_id_and_keeps_other_records() {
        let mut document = PersistenceDocument::parse(legacy_document()).unwrap();
        let mut record = document.record(0).unwrap().unwrap();
        record.program = false;

        document.upsert(&record).unwrap();

        assert_eq!(document.len(), 2);
        assert_eq!(document.systems[0], json!({"system_id": "broken"}));
        assert_eq!(document.systems[1]["system_id"], json!("1"));
        assert_eq!(document.systems[1]["program"], json!(false));
    }

    #[test]
    fn relays_survive_an_invalid_record() {
        let document = PersistenceDocument::parse(
            r#"{"systems": [
                {"system_id": 2,
                 "sensor": {"url": "http://sensor"},
                 "relay": {"url_on": "http://r/off?pin=2", "url_off": "http://r/on?pin=2",
                           "url_status": "http://r/status?pin=2"},
                 "periods": [{"start": 7.0, "end": 9.0, "target": 95.0}]},
                {"system_id": "broken"}
            ]}"#,
        )
        .unwrap();

        assert!(document.records().all(|record| record
            .and_then(crate::Zone::from_record)
            .is_err()));
        let relays: Vec<_> = document.relays().collect();
        assert_eq!(relays.len(), 1);
        assert_eq!(relays[0].system_id.as_str(), "2");
        assert_eq!(relays[0].relay.url_off, "http://r/on?pin=2");
    }

    #[test]
    fn empty_text_is_empty_document() {
        assert!(PersistenceDocument::parse("  \n").unwrap().is_empty());
    }

    #[test]
    fn unknown_top_level_keys_survive_a_rewrite() {
        let mut document =
            PersistenceDocument::parse(r#"{"systems": [], "version": 3}"#).unwrap();
        document.systems.push(json!({"system_id": 9}));

        let reparsed = PersistenceDocument::parse(&document.to_pretty_string().unwrap()).unwrap();
        assert_eq!(reparsed.extra.get("version"), Some(&json!(3)));
        assert_eq!(reparsed.len(), 1);
    }

    #[test]
    fn epoch_seconds_keep_sub_second_precision() {
        let at = Utc.timestamp_opt(1_767_600_000, 250_000_000).unwrap();
        assert_eq!(epoch_seconds::from_f64(epoch_seconds::to_f64(at)), Some(at));
        assert_eq!(epoch_seconds::from_f64(f64::NAN), None);
    }
}
