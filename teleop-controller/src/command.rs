//! JSON command envelope exchanged between leader and follower.
//!
//! ```json
//! { "method": "set_joint_angles", "id": "42",
//!   "params": { "units": "degrees", "joints": { "shoulder_pan.pos": 12.5 } } }
//! ```

use crate::arm_config::Units;
use crate::arm_driver::JointPositions;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use thiserror::Error;

pub const SET_JOINT_ANGLES: &str = "set_joint_angles";
pub const POSITION_SUFFIX: &str = ".pos";

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("payload is not valid json: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("envelope is missing required field {0:?}")]
    MissingField(&'static str),
    #[error("unknown method {0:?}")]
    UnknownMethod(String),
    #[error("invalid params: {0}")]
    InvalidParams(#[source] serde_json::Error),
    #[error("command is in {found} but this arm runs in {expected}")]
    UnitMismatch { expected: Units, found: Units },
    #[error("joint {0:?} has a non numeric position")]
    InvalidJointValue(String),
    #[error("command contains no joint positions")]
    EmptyGoal,
    #[error("failed to serialize command")]
    Serialize(#[source] serde_json::Error),
}

type Result<T> = std::result::Result<T, CommandError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointAnglesParams {
    pub units: Units,
    pub joints: BTreeMap<String, f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub params: JointAnglesParams,
}

impl CommandEnvelope {
    pub fn set_joint_angles(id: Option<String>, units: Units, positions: &JointPositions) -> Self {
        let joints = positions
            .iter()
            .map(|(joint, value)| (format!("{}{}", joint, POSITION_SUFFIX), *value))
            .collect();
        Self {
            method: SET_JOINT_ANGLES.to_owned(),
            id,
            params: JointAnglesParams { units, joints },
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(CommandError::Serialize)
    }
}

/// Envelope as received, every field optional so absence can be reported
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    method: Option<String>,
    id: Option<Value>,
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawParams {
    units: Option<Units>,
    joints: Option<BTreeMap<String, Value>>,
}

/// Goal positions requested by one inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct GoalCommand {
    pub id: Option<String>,
    pub positions: JointPositions,
    pub received_at: Instant,
}

impl GoalCommand {
    /// Parse and validate a `set_joint_angles` envelope.
    ///
    /// Keys without the `.pos` suffix are ignored, the suffix is stripped
    /// from the rest.
    pub fn parse(payload: &[u8], expected_units: Units, received_at: Instant) -> Result<Self> {
        let envelope: RawEnvelope =
            serde_json::from_slice(payload).map_err(CommandError::InvalidJson)?;
        let method = envelope.method.ok_or(CommandError::MissingField("method"))?;
        if method != SET_JOINT_ANGLES {
            return Err(CommandError::UnknownMethod(method));
        }
        let params = envelope.params.ok_or(CommandError::MissingField("params"))?;
        let params: RawParams =
            serde_json::from_value(params).map_err(CommandError::InvalidParams)?;
        let units = params
            .units
            .ok_or(CommandError::MissingField("params.units"))?;
        if units != expected_units {
            return Err(CommandError::UnitMismatch {
                expected: expected_units,
                found: units,
            });
        }
        let joints = params
            .joints
            .ok_or(CommandError::MissingField("params.joints"))?;

        let mut positions = JointPositions::new();
        for (key, value) in joints {
            let joint = match key.strip_suffix(POSITION_SUFFIX) {
                Some(joint) => joint,
                None => continue,
            };
            let position = value
                .as_f64()
                .ok_or_else(|| CommandError::InvalidJointValue(joint.to_owned()))?;
            positions.insert(joint.to_owned(), position as f32);
        }
        if positions.is_empty() {
            return Err(CommandError::EmptyGoal);
        }

        let id = envelope.id.map(|id| match id {
            Value::String(text) => text,
            other => other.to_string(),
        });
        Ok(Self {
            id,
            positions,
            received_at,
        })
    }
}
