// [libs/domain/models/src/hashcat.rs]
//! The external cracker's JSON status document, as emitted with
//! `--status-json`. This is external input: unknown fields are ignored and
//! missing optional fields default.

use serde::{Deserialize, Serialize};

/// Status code meaning every hash in the list is cracked.
pub const STATUS_ALL_CRACKED: i32 = 6;
/// Status code meaning the keyspace was exhausted.
pub const STATUS_EXHAUSTED: i32 = 5;
/// Status code for a running attack.
pub const STATUS_RUNNING: i32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashcatDeviceStatus {
    pub device_id: u32,
    /// Candidates per second on this device.
    pub speed: u64,
    #[serde(default)]
    pub temp: Option<i32>,
    #[serde(default)]
    pub util: Option<i32>,
}

/// One parsed line of the cracker's status stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashcatStatus {
    pub status: i32,
    /// `[processed, total]`; index 1 is the true effective keyspace for the
    /// invocation and feeds keyspace calibration.
    pub progress: [u64; 2],
    #[serde(default)]
    pub devices: Vec<HashcatDeviceStatus>,
    /// `[cracked, total]` hash counts for the running list.
    #[serde(default)]
    pub recovered_hashes: [u64; 2],
    #[serde(default)]
    pub time_start: Option<i64>,
    #[serde(default)]
    pub estimated_stop: Option<i64>,
    #[serde(default)]
    pub session: Option<String>,
}

impl HashcatStatus {
    pub fn total_speed(&self) -> u64 {
        self.devices.iter().map(|device| device.speed).sum()
    }

    pub fn all_hashes_cracked(&self) -> bool {
        self.status == STATUS_ALL_CRACKED
    }

    pub fn is_exhausted(&self) -> bool {
        self.status == STATUS_EXHAUSTED
    }

    /// Effective keyspace hashcat reports for the whole invocation.
    pub fn effective_keyspace(&self) -> u64 {
        self.progress[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_real_status_line() {
        // Trimmed from a live `--status-json` stream; extra fields must not
        // break deserialization.
        let line = r#"{
            "session": "kh-3f2a",
            "status": 3,
            "target": "example.hash",
            "progress": [351232, 14344384],
            "recovered_hashes": [2, 6],
            "devices": [
                {"device_id": 1, "speed": 1228800, "temp": 61, "util": 98},
                {"device_id": 2, "speed": 1orr228800}
            ]
        }"#;
        // Deliberately corrupt second device: whole-line parse must fail
        // loudly rather than half-succeed.
        assert!(serde_json::from_str::<HashcatStatus>(line).is_err());

        let good = r#"{
            "session": "kh-3f2a",
            "status": 6,
            "target": "example.hash",
            "progress": [14344384, 14344384],
            "recovered_hashes": [6, 6],
            "devices": [
                {"device_id": 1, "speed": 1228800, "temp": 61, "util": 98},
                {"device_id": 2, "speed": 1228800}
            ]
        }"#;
        let status: HashcatStatus = serde_json::from_str(good).expect("status parses");
        assert!(status.all_hashes_cracked());
        assert_eq!(status.total_speed(), 2_457_600);
        assert_eq!(status.effective_keyspace(), 14_344_384);
    }
}
