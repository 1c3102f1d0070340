use crate::jump_protection::{ClampError, MaxRelativeTarget};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, collections::BTreeSet, fs, path::Path};
use thiserror::Error;

/// Full scale of a Feetech STS3215 position register
pub const MAX_RESOLUTION: u16 = 4095;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error while accessing configuration")]
    IoError(#[from] std::io::Error),
    #[error("error while parsing json")]
    JsonError(#[from] serde_json::Error),
    #[error("error while parsing yaml")]
    YamlError(#[from] serde_yaml::Error),
    #[error("unsupported configuration file extension {0:?}")]
    UnsupportedFormat(String),
    #[error("arm configuration has no joints")]
    NoJoints,
    #[error("joint {0:?} is declared more than once")]
    DuplicateJoint(String),
    #[error("servo id {0} is used by more than one joint")]
    DuplicateId(u8),
    #[error("joint {joint:?} has invalid range {min}..{max}")]
    InvalidRange { joint: String, min: u16, max: u16 },
    #[error("calibration for {joint:?} targets servo {found}, expected {expected}")]
    CalibrationIdMismatch { joint: String, expected: u8, found: u8 },
    #[error("unknown units {0:?}, expected degrees or normalized")]
    UnknownUnits(String),
    #[error("invalid max relative target")]
    InvalidMaxRelativeTarget(#[source] ClampError),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Unit used for every joint position exchanged between leader and follower
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    #[default]
    Degrees,
    /// -100 to 100 over the calibrated range
    Normalized,
}

impl Units {
    pub fn body_norm_mode(self) -> NormMode {
        match self {
            Units::Degrees => NormMode::Degrees,
            Units::Normalized => NormMode::RangeM100To100,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Units::Degrees => "degrees",
            Units::Normalized => "normalized",
        }
    }
}

impl std::fmt::Display for Units {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Units {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self> {
        match text {
            "degrees" => Ok(Units::Degrees),
            "normalized" => Ok(Units::Normalized),
            other => Err(ConfigError::UnknownUnits(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormMode {
    Degrees,
    #[serde(rename = "range_m100_100")]
    RangeM100To100,
    #[serde(rename = "range_0_100")]
    Range0To100,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MotorCalibration {
    /// 1 inverts the direction of the joint
    #[serde(default)]
    pub drive_mode: u8,
    pub range_min: u16,
    pub range_max: u16,
}

impl MotorCalibration {
    pub fn full_range() -> Self {
        Self {
            drive_mode: 0,
            range_min: 0,
            range_max: MAX_RESOLUTION,
        }
    }

    fn inverted(&self) -> bool {
        self.drive_mode != 0
    }

    fn mid(&self) -> f32 {
        (self.range_min as f32 + self.range_max as f32) / 2.0
    }

    fn span(&self) -> f32 {
        self.range_max as f32 - self.range_min as f32
    }

    /// Convert a raw register value into `mode` units
    pub fn normalize(&self, raw: u16, mode: NormMode) -> f32 {
        let bounded = (raw as f32).clamp(self.range_min as f32, self.range_max as f32);
        match mode {
            NormMode::Degrees => {
                let degrees = (raw as f32 - self.mid()) * 360.0 / MAX_RESOLUTION as f32;
                if self.inverted() {
                    -degrees
                } else {
                    degrees
                }
            }
            NormMode::RangeM100To100 => {
                let value = (bounded - self.range_min as f32) / self.span() * 200.0 - 100.0;
                if self.inverted() {
                    -value
                } else {
                    value
                }
            }
            NormMode::Range0To100 => {
                let value = (bounded - self.range_min as f32) / self.span() * 100.0;
                if self.inverted() {
                    100.0 - value
                } else {
                    value
                }
            }
        }
    }

    /// Convert a position in `mode` units back into a raw register value.
    ///
    /// Result never leaves the calibrated range.
    pub fn denormalize(&self, value: f32, mode: NormMode) -> u16 {
        let raw = match mode {
            NormMode::Degrees => {
                let degrees = if self.inverted() { -value } else { value };
                degrees * MAX_RESOLUTION as f32 / 360.0 + self.mid()
            }
            NormMode::RangeM100To100 => {
                let value = if self.inverted() { -value } else { value };
                (value.clamp(-100.0, 100.0) + 100.0) / 200.0 * self.span() + self.range_min as f32
            }
            NormMode::Range0To100 => {
                let value = if self.inverted() { 100.0 - value } else { value };
                value.clamp(0.0, 100.0) / 100.0 * self.span() + self.range_min as f32
            }
        };
        raw.round()
            .clamp(self.range_min as f32, self.range_max as f32) as u16
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JointConfig {
    pub name: String,
    pub id: u8,
    /// Overrides the unit mode of the session, used for grippers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub norm_mode: Option<NormMode>,
    pub calibration: MotorCalibration,
}

/// Calibration file as written by the lerobot calibration tooling
///
/// Maps joint name to servo id and range.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CalibrationEntry {
    pub id: u8,
    #[serde(flatten)]
    pub calibration: MotorCalibration,
}

pub type CalibrationFile = BTreeMap<String, CalibrationEntry>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArmConfig {
    pub joints: Vec<JointConfig>,
    /// Jump protection bound for followers built from this config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_relative_target: Option<MaxRelativeTarget>,
}

impl ArmConfig {
    /// SO-101 comes with an included config file.
    ///
    /// This file is packaged with the binary
    /// This method retrieves this included version
    pub fn included() -> ArmConfig {
        let json = include_str!("../config/so101.json");
        serde_json::from_str(json).expect("included arm config is valid")
    }

    pub fn parse_json(text: &str) -> Result<ArmConfig> {
        let config: ArmConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse_yaml(text: &str) -> Result<ArmConfig> {
        let config: ArmConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn serialize_to_json(&self) -> Result<String> {
        let json = serde_json::to_string_pretty(self)?;
        Ok(json)
    }

    pub fn serialize_to_yaml(&self) -> Result<String> {
        let yaml = serde_yaml::to_string(self)?;
        Ok(yaml)
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        fs::write(path, self.serialize_to_json()?)?;
        Ok(())
    }

    pub fn save_yaml(&self, path: &Path) -> Result<()> {
        fs::write(path, self.serialize_to_yaml()?)?;
        Ok(())
    }

    /// Load json or yaml based on the file extension
    pub fn load(path: &Path) -> Result<ArmConfig> {
        let text = fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => ArmConfig::parse_json(&text),
            Some("yaml") | Some("yml") => ArmConfig::parse_yaml(&text),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_owned(),
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.joints.is_empty() {
            return Err(ConfigError::NoJoints);
        }
        let mut names = BTreeSet::new();
        let mut ids = BTreeSet::new();
        for joint in &self.joints {
            if !names.insert(joint.name.as_str()) {
                return Err(ConfigError::DuplicateJoint(joint.name.clone()));
            }
            if !ids.insert(joint.id) {
                return Err(ConfigError::DuplicateId(joint.id));
            }
            let calibration = &joint.calibration;
            if calibration.range_min >= calibration.range_max
                || calibration.range_max > MAX_RESOLUTION
            {
                return Err(ConfigError::InvalidRange {
                    joint: joint.name.clone(),
                    min: calibration.range_min,
                    max: calibration.range_max,
                });
            }
        }
        if let Some(bounds) = &self.max_relative_target {
            bounds
                .validate()
                .map_err(ConfigError::InvalidMaxRelativeTarget)?;
        }
        Ok(())
    }

    /// Replace joint calibrations with entries from a calibration file.
    ///
    /// Joints missing from the file keep their current calibration.
    pub fn apply_calibration(&mut self, file: &CalibrationFile) -> Result<()> {
        for joint in self.joints.iter_mut() {
            if let Some(entry) = file.get(&joint.name) {
                if entry.id != joint.id {
                    return Err(ConfigError::CalibrationIdMismatch {
                        joint: joint.name.clone(),
                        expected: joint.id,
                        found: entry.id,
                    });
                }
                joint.calibration = entry.calibration.clone();
            }
        }
        self.validate()
    }

    pub fn load_calibration(path: &Path) -> Result<CalibrationFile> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn joint(&self, name: &str) -> Option<&JointConfig> {
        self.joints.iter().find(|joint| joint.name == name)
    }

    pub fn joint_names(&self) -> Vec<String> {
        self.joints.iter().map(|joint| joint.name.clone()).collect()
    }

    pub fn get_ids(&self) -> Vec<u8> {
        self.joints.iter().map(|joint| joint.id).collect()
    }

    pub fn norm_mode(&self, joint: &JointConfig, units: Units) -> NormMode {
        joint.norm_mode.unwrap_or_else(|| units.body_norm_mode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const MINIMAL_JSON: &str = r#"{"joints":[{"name":"shoulder_pan","id":1,"calibration":{"range_min":1000,"range_max":3000}},{"name":"gripper","id":6,"norm_mode":"range_0_100","calibration":{"drive_mode":0,"range_min":2000,"range_max":3000}}]}"#;

    #[test]
    fn parse_from_json() {
        let config = ArmConfig::parse_json(MINIMAL_JSON).unwrap();
        assert_eq!(config.joint_names(), vec!["shoulder_pan", "gripper"]);
        assert_eq!(config.get_ids(), vec![1, 6]);
        assert_eq!(
            config.joint("gripper").unwrap().norm_mode,
            Some(NormMode::Range0To100)
        );
    }

    #[test]
    fn parse_from_yaml() {
        // json is valid yaml
        let config = ArmConfig::parse_yaml(MINIMAL_JSON).unwrap();
        assert_eq!(config, ArmConfig::parse_json(MINIMAL_JSON).unwrap());
    }

    #[test]
    fn serialize_to_json() {
        let config = ArmConfig::included();
        let json = config.serialize_to_json().unwrap();
        let parsed_config = ArmConfig::parse_json(&json).unwrap();
        assert_eq!(config, parsed_config);
    }

    #[test]
    fn serialize_to_yaml() {
        let config = ArmConfig::included();
        let yaml = config.serialize_to_yaml().unwrap();
        let parsed_config = ArmConfig::parse_yaml(&yaml).unwrap();
        assert_eq!(config, parsed_config);
    }

    #[test]
    fn check_included() {
        let config = ArmConfig::included();
        config.validate().unwrap();
        assert_eq!(config.joints.len(), 6);
        assert_eq!(config.get_ids(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn load_picks_format_from_extension() {
        let dir = tempfile::tempdir().unwrap();
        let config = ArmConfig::included();
        let json_path = dir.path().join("arm.json");
        let yaml_path = dir.path().join("arm.yaml");
        config.save_json(&json_path).unwrap();
        config.save_yaml(&yaml_path).unwrap();
        assert_eq!(ArmConfig::load(&json_path).unwrap(), config);
        assert_eq!(ArmConfig::load(&yaml_path).unwrap(), config);
        let toml_path = dir.path().join("arm.toml");
        std::fs::write(&toml_path, "").unwrap();
        assert!(matches!(
            ArmConfig::load(&toml_path),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let json = r#"{"joints":[{"name":"a","id":1,"calibration":{"range_min":0,"range_max":10}},{"name":"b","id":1,"calibration":{"range_min":0,"range_max":10}}]}"#;
        assert!(matches!(
            ArmConfig::parse_json(json),
            Err(ConfigError::DuplicateId(1))
        ));
    }

    #[test]
    fn units_parse_from_text() {
        assert_eq!("degrees".parse::<Units>().unwrap(), Units::Degrees);
        assert_eq!("normalized".parse::<Units>().unwrap(), Units::Normalized);
        assert!(matches!(
            "radians".parse::<Units>(),
            Err(ConfigError::UnknownUnits(_))
        ));
    }

    #[test]
    fn per_joint_bounds_are_read_from_config() {
        let yaml = r#"
joints:
  - name: shoulder_pan
    id: 1
    calibration: { range_min: 0, range_max: 4095 }
  - name: gripper
    id: 6
    calibration: { range_min: 0, range_max: 4095 }
max_relative_target:
  shoulder_pan: 10.0
  gripper: 30.0
"#;
        let config = ArmConfig::parse_yaml(yaml).unwrap();
        let bounds = config.max_relative_target.unwrap();
        assert_eq!(bounds.for_joint("shoulder_pan"), Some(10.0));
        assert_eq!(bounds.for_joint("gripper"), Some(30.0));

        let negative = r#"{"joints":[{"name":"a","id":1,"calibration":{"range_min":0,"range_max":10}}],"max_relative_target":-1.0}"#;
        assert!(matches!(
            ArmConfig::parse_json(negative),
            Err(ConfigError::InvalidMaxRelativeTarget(_))
        ));
    }

    #[test]
    fn empty_range_is_rejected() {
        let json = r#"{"joints":[{"name":"a","id":1,"calibration":{"range_min":10,"range_max":10}}]}"#;
        assert!(matches!(
            ArmConfig::parse_json(json),
            Err(ConfigError::InvalidRange { .. })
        ));
    }

    #[test]
    fn calibration_file_overrides_ranges() {
        let mut config = ArmConfig::included();
        let file: CalibrationFile = serde_json::from_str(
            r#"{"shoulder_pan":{"id":1,"drive_mode":0,"homing_offset":-12,"range_min":800,"range_max":3200}}"#,
        )
        .unwrap();
        config.apply_calibration(&file).unwrap();
        let joint = config.joint("shoulder_pan").unwrap();
        assert_eq!(joint.calibration.range_min, 800);
        assert_eq!(joint.calibration.range_max, 3200);
    }

    #[test]
    fn calibration_file_with_wrong_id_is_rejected() {
        let mut config = ArmConfig::included();
        let file: CalibrationFile = serde_json::from_str(
            r#"{"gripper":{"id":2,"drive_mode":0,"range_min":800,"range_max":3200}}"#,
        )
        .unwrap();
        assert!(matches!(
            config.apply_calibration(&file),
            Err(ConfigError::CalibrationIdMismatch { .. })
        ));
    }

    #[test]
    fn degrees_are_centered_on_range() {
        let calibration = MotorCalibration {
            drive_mode: 0,
            range_min: 1000,
            range_max: 3000,
        };
        assert_relative_eq!(calibration.normalize(2000, NormMode::Degrees), 0.0);
        assert_relative_eq!(
            calibration.normalize(3000, NormMode::Degrees),
            1000.0 * 360.0 / 4095.0
        );
        assert_eq!(calibration.denormalize(0.0, NormMode::Degrees), 2000);
    }

    #[test]
    fn normalized_range_spans_minus_hundred_to_hundred() {
        let calibration = MotorCalibration {
            drive_mode: 0,
            range_min: 1000,
            range_max: 3000,
        };
        assert_relative_eq!(calibration.normalize(1000, NormMode::RangeM100To100), -100.0);
        assert_relative_eq!(calibration.normalize(2000, NormMode::RangeM100To100), 0.0);
        assert_relative_eq!(calibration.normalize(3000, NormMode::RangeM100To100), 100.0);
        // readings outside the calibrated range saturate
        assert_relative_eq!(calibration.normalize(3500, NormMode::RangeM100To100), 100.0);
        assert_eq!(calibration.denormalize(50.0, NormMode::RangeM100To100), 2500);
        assert_eq!(calibration.denormalize(400.0, NormMode::RangeM100To100), 3000);
    }

    #[test]
    fn inverted_drive_mode_flips_direction() {
        let calibration = MotorCalibration {
            drive_mode: 1,
            range_min: 0,
            range_max: 1000,
        };
        assert_relative_eq!(calibration.normalize(0, NormMode::RangeM100To100), 100.0);
        assert_relative_eq!(calibration.normalize(0, NormMode::Range0To100), 100.0);
        assert_relative_eq!(calibration.normalize(1000, NormMode::Range0To100), 0.0);
        assert_eq!(calibration.denormalize(100.0, NormMode::Range0To100), 0);
    }

    #[test]
    fn gripper_uses_its_own_mode() {
        let config = ArmConfig::included();
        let gripper = config.joint("gripper").unwrap();
        let pan = config.joint("shoulder_pan").unwrap();
        assert_eq!(config.norm_mode(gripper, Units::Degrees), NormMode::Range0To100);
        assert_eq!(config.norm_mode(pan, Units::Degrees), NormMode::Degrees);
        assert_eq!(
            config.norm_mode(pan, Units::Normalized),
            NormMode::RangeM100To100
        );
    }
}
