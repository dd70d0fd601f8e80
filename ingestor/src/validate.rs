use crate::errors::{Error, Result};
use crate::model::{BusTelemetry, IngestRequest};

const TEMP_MIN: f64 = -50.0;
const TEMP_MAX: f64 = 100.0;
const HUMIDITY_MIN: f64 = 0.0;
const HUMIDITY_MAX: f64 = 100.0;
const LIGHT_MIN: f64 = 0.0;

/// Device id used when a bus payload carries no usable aviary id
pub const DEFAULT_BUS_DEVICE_ID: i32 = 1;

/// Validates a synchronous telemetry submission
pub fn validate(request: &IngestRequest) -> Result<()> {
    if request.mac_address.trim().is_empty() {
        return Err(Error::Validation("MAC address cannot be empty".to_string()));
    }

    check_temperature(request.temperature)?;
    check_humidity(request.humidity)?;

    if let Some(light) = request.light {
        if !light.is_finite() || light < LIGHT_MIN {
            return Err(Error::Validation(format!(
                "Light {} must be a non-negative number",
                light
            )));
        }
    }

    Ok(())
}

/// A bus sample that survived validation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BusSample {
    pub device_id: i32,
    pub temperature: f64,
    pub humidity: f64,
}

/// Resolves the device id and checks the measurements of a bus payload.
///
/// Numbers may arrive as JSON numbers or numeric strings. A missing
/// humidity is recorded as 0.0; a missing or unparseable temperature
/// rejects the sample.
pub fn validate_bus(payload: &BusTelemetry) -> Result<BusSample> {
    let temperature = match present(payload.temp.as_ref()) {
        Some(raw) => numeric(raw)
            .ok_or_else(|| Error::Validation(format!("Temperature {raw} is not a number")))?,
        None => return Err(Error::Validation("Temperature missing from payload".to_string())),
    };
    check_temperature(temperature)?;

    let humidity = match present(payload.hum.as_ref()) {
        Some(raw) => numeric(raw)
            .ok_or_else(|| Error::Validation(format!("Humidity {raw} is not a number")))?,
        None => 0.0,
    };
    check_humidity(humidity)?;

    Ok(BusSample {
        device_id: bus_device_id(payload.aviary_id.as_ref())?,
        temperature,
        humidity,
    })
}

/// Extracts the first run of digits from an aviary id such as `"AV_001"`.
///
/// Falls back to the default device when the id is absent or carries no
/// digits; digits that do not fit a device id name no known device.
pub fn bus_device_id(raw: Option<&serde_json::Value>) -> Result<i32> {
    let text = match raw {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return Ok(DEFAULT_BUS_DEVICE_ID),
    };

    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();

    if digits.is_empty() {
        return Ok(DEFAULT_BUS_DEVICE_ID);
    }
    digits
        .parse()
        .map_err(|_| Error::DeviceUnknown(format!("aviary {text}")))
}

fn present(raw: Option<&serde_json::Value>) -> Option<&serde_json::Value> {
    raw.filter(|v| !v.is_null())
}

fn numeric(raw: &serde_json::Value) -> Option<f64> {
    match raw {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn check_temperature(temperature: f64) -> Result<()> {
    if !temperature.is_finite() || !(TEMP_MIN..=TEMP_MAX).contains(&temperature) {
        return Err(Error::Validation(format!(
            "Temperature {} out of range [{}, {}]",
            temperature, TEMP_MIN, TEMP_MAX
        )));
    }
    Ok(())
}

fn check_humidity(humidity: f64) -> Result<()> {
    if !humidity.is_finite() || !(HUMIDITY_MIN..=HUMIDITY_MAX).contains(&humidity) {
        return Err(Error::Validation(format!(
            "Humidity {} out of range [{}, {}]",
            humidity, HUMIDITY_MIN, HUMIDITY_MAX
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(temperature: f64, humidity: f64) -> IngestRequest {
        IngestRequest {
            mac_address: "AA:BB:CC:DD:EE:01".to_string(),
            temperature,
            humidity,
            light: None,
        }
    }

    #[test]
    fn test_valid_request() {
        assert!(validate(&request(22.5, 60.0)).is_ok());
    }

    #[test]
    fn test_invalid_temperature() {
        assert!(validate(&request(150.0, 60.0)).is_err());
        assert!(validate(&request(f64::NAN, 60.0)).is_err());
    }

    #[test]
    fn test_invalid_humidity() {
        assert!(validate(&request(22.0, 150.0)).is_err());
    }

    #[test]
    fn test_negative_light() {
        let mut req = request(22.0, 50.0);
        req.light = Some(-1.0);
        assert!(validate(&req).is_err());
    }

    #[test]
    fn test_empty_mac() {
        let mut req = request(22.0, 50.0);
        req.mac_address = "  ".to_string();
        assert!(validate(&req).is_err());
    }

    #[test]
    fn test_bus_device_id_from_prefixed_string() {
        assert_eq!(bus_device_id(Some(&json!("AV_001"))).unwrap(), 1);
        assert_eq!(bus_device_id(Some(&json!("AV_042"))).unwrap(), 42);
        assert_eq!(bus_device_id(Some(&json!("cage7-b12"))).unwrap(), 7);
    }

    #[test]
    fn test_bus_device_id_from_number() {
        assert_eq!(bus_device_id(Some(&json!(12))).unwrap(), 12);
    }

    #[test]
    fn test_bus_device_id_fallback() {
        assert_eq!(bus_device_id(None).unwrap(), DEFAULT_BUS_DEVICE_ID);
        assert_eq!(bus_device_id(Some(&json!("no-digits"))).unwrap(), DEFAULT_BUS_DEVICE_ID);
        assert_eq!(bus_device_id(Some(&json!(null))).unwrap(), DEFAULT_BUS_DEVICE_ID);
        assert_eq!(bus_device_id(Some(&json!(true))).unwrap(), DEFAULT_BUS_DEVICE_ID);
    }

    #[test]
    fn test_bus_device_id_overflow_is_unknown() {
        let err = bus_device_id(Some(&json!("AV_99999999999"))).unwrap_err();
        assert!(matches!(err, Error::DeviceUnknown(_)));
        assert!(bus_device_id(Some(&json!(99_999_999_999_i64))).is_err());
    }

    #[test]
    fn test_bus_missing_temperature_rejected() {
        let payload = BusTelemetry {
            aviary_id: Some(json!("AV_003")),
            temp: None,
            hum: Some(json!(40.0)),
            ..Default::default()
        };
        assert!(validate_bus(&payload).is_err());

        let null_temp = BusTelemetry {
            temp: Some(json!(null)),
            ..payload.clone()
        };
        assert!(validate_bus(&null_temp).is_err());

        let garbage = BusTelemetry {
            temp: Some(json!("warm")),
            ..payload
        };
        assert!(matches!(validate_bus(&garbage), Err(Error::Validation(_))));
    }

    #[test]
    fn test_bus_sample_resolved() {
        let payload = BusTelemetry {
            aviary_id: Some(json!("AV_003")),
            temp: Some(json!(21.25)),
            hum: None,
            ..Default::default()
        };
        let sample = validate_bus(&payload).unwrap();
        assert_eq!(sample.device_id, 3);
        assert_eq!(sample.temperature, 21.25);
        assert_eq!(sample.humidity, 0.0);
    }

    #[test]
    fn test_bus_numeric_strings_and_loose_fields_accepted() {
        let payload: BusTelemetry = serde_json::from_str(
            r#"{"aviary_id": "AV_004", "temp": "21.5", "hum": " 48 ",
                "heater": true, "fan": "off", "status": 3, "timestamp": "2024-05-01T12:00:00Z"}"#,
        )
        .unwrap();
        let sample = validate_bus(&payload).unwrap();
        assert_eq!(sample.device_id, 4);
        assert_eq!(sample.temperature, 21.5);
        assert_eq!(sample.humidity, 48.0);
    }
}
