// [apps/agent/src/hardware.rs]
//! Compute device discovery. `TEST_MODE` swaps in a mock inventory so the
//! protocol paths can run without a cracker or GPUs present.

use tokio::process::Command;
use tracing::{info, warn};

use krakenhashes_models::Device;

/// Discovers devices, preferring the cracker's own `-I` inventory when a
/// binary is available.
pub async fn detect_devices(test_mode: bool, binary_path: Option<&str>) -> Vec<Device> {
    if test_mode {
        info!("[HARDWARE]: TEST_MODE active, reporting mock devices");
        return mock_devices();
    }

    if let Some(binary) = binary_path {
        match Command::new(binary).arg("-I").output().await {
            Ok(output) if output.status.success() => {
                let parsed = parse_device_inventory(&String::from_utf8_lossy(&output.stdout));
                if !parsed.is_empty() {
                    return parsed;
                }
            }
            Ok(output) => {
                warn!("[HARDWARE]: device probe exited {}", output.status);
            }
            Err(error) => {
                warn!("[HARDWARE]: device probe failed: {error}");
            }
        }
    }

    // No binary yet (first sync still pending): report the CPU so the
    // server has something to schedule against after sync completes.
    vec![Device {
        device_id: 1,
        enabled: true,
        device_type: "CPU".to_string(),
        name: format!("{} logical cores", num_cpus::get()),
    }]
}

pub fn mock_devices() -> Vec<Device> {
    vec![
        Device { device_id: 1, enabled: true, device_type: "GPU".into(), name: "Mock CUDA Device".into() },
        Device { device_id: 2, enabled: true, device_type: "GPU".into(), name: "Mock OpenCL Device".into() },
    ]
}

/// Parses `hashcat -I` output into devices.
fn parse_device_inventory(raw: &str) -> Vec<Device> {
    let mut devices = Vec::new();
    let mut current_id: Option<u32> = None;
    let mut current_type = String::new();
    let mut current_name = String::new();

    for line in raw.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Backend Device ID #") {
            if let Some(id) = current_id.take() {
                devices.push(Device {
                    device_id: id,
                    enabled: true,
                    device_type: std::mem::take(&mut current_type),
                    name: std::mem::take(&mut current_name),
                });
            }
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            current_id = digits.parse().ok();
        } else if let Some(value) = field_value(trimmed, "Type") {
            current_type = value;
        } else if let Some(value) = field_value(trimmed, "Name") {
            current_name = value;
        }
    }
    if let Some(id) = current_id {
        devices.push(Device {
            device_id: id,
            enabled: true,
            device_type: current_type,
            name: current_name,
        });
    }
    devices
}

fn field_value(line: &str, field: &str) -> Option<String> {
    let rest = line.strip_prefix(field)?;
    let rest = rest.trim_start_matches('.');
    let rest = rest.trim_start_matches(':').trim();
    if rest.is_empty() {
        return None;
    }
    Some(rest.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cracker_inventory_output() {
        let raw = "\
CUDA Info:
==========
Backend Device ID #1
  Type...........: GPU
  Name...........: NVIDIA GeForce RTX 3080
  Processor(s)...: 68

Backend Device ID #2
  Type...........: CPU
  Name...........: AMD Ryzen 9 5950X
";
        let devices = parse_device_inventory(raw);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].device_id, 1);
        assert_eq!(devices[0].device_type, "GPU");
        assert_eq!(devices[0].name, "NVIDIA GeForce RTX 3080");
        assert_eq!(devices[1].device_id, 2);
        assert_eq!(devices[1].device_type, "CPU");
    }

    #[test]
    fn mock_inventory_has_enabled_devices() {
        assert!(mock_devices().iter().all(|device| device.enabled));
    }
}
