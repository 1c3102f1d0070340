use crate::arm_driver::JointPositions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Step bound used when nothing else is configured
pub const DEFAULT_MAX_RELATIVE_TARGET: f32 = 20.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClampError {
    #[error("joint {0:?} is missing from present position")]
    MissingPresentPosition(String),
    #[error("no max relative target configured for joint {0:?}")]
    MissingBound(String),
    #[error("max relative target for {joint:?} must be finite and non-negative, got {value}")]
    InvalidBound { joint: String, value: f32 },
    #[error("goal for joint {joint:?} is not finite ({value})")]
    NonFiniteGoal { joint: String, value: f32 },
    #[error("present position of joint {joint:?} is not finite ({value})")]
    NonFinitePresent { joint: String, value: f32 },
    #[error("none of the requested joints are present on the arm")]
    NothingToCommand,
}

type Result<T> = std::result::Result<T, ClampError>;

/// Largest step a single command may move a joint away from its present position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxRelativeTarget {
    Uniform(f32),
    PerJoint(BTreeMap<String, f32>),
}

impl MaxRelativeTarget {
    pub fn for_joint(&self, joint: &str) -> Option<f32> {
        match self {
            MaxRelativeTarget::Uniform(value) => Some(*value),
            MaxRelativeTarget::PerJoint(bounds) => bounds.get(joint).copied(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        fn check(joint: &str, value: f32) -> Result<()> {
            if value.is_finite() && value >= 0.0 {
                Ok(())
            } else {
                Err(ClampError::InvalidBound {
                    joint: joint.to_owned(),
                    value,
                })
            }
        }
        match self {
            MaxRelativeTarget::Uniform(value) => check("*", *value),
            MaxRelativeTarget::PerJoint(bounds) => bounds
                .iter()
                .try_for_each(|(joint, value)| check(joint, *value)),
        }
    }
}

impl From<f32> for MaxRelativeTarget {
    fn from(value: f32) -> Self {
        MaxRelativeTarget::Uniform(value)
    }
}

/// What to do with goal joints the arm did not report a present position for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingJointPolicy {
    /// Reject the whole command
    #[default]
    Abort,
    /// Drop the unknown joints and command the rest
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClampedJoint {
    pub joint: String,
    pub requested: f32,
    pub commanded: f32,
}

/// Goal positions that are safe to write to the arm.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SafeCommand {
    pub positions: JointPositions,
    pub clamped: Vec<ClampedJoint>,
    pub skipped: Vec<String>,
}

impl SafeCommand {
    pub fn was_clamped(&self) -> bool {
        !self.clamped.is_empty()
    }
}

/// Adjacent float from `value` in the direction of `target`
#[allow(clippy::float_cmp)]
fn next_toward(value: f32, target: f32) -> f32 {
    if value == target {
        return target;
    }
    if value == 0.0 {
        let smallest = f32::from_bits(1);
        return if target > 0.0 { smallest } else { -smallest };
    }
    let bits = value.to_bits();
    // away from zero when the step grows the magnitude
    if (value < target) == (value > 0.0) {
        f32::from_bits(bits + 1)
    } else {
        f32::from_bits(bits - 1)
    }
}

fn clamp_joint(goal: f32, present: f32, max_delta: f32) -> f32 {
    let delta = goal - present;
    if delta.abs() <= max_delta {
        return goal;
    }
    let mut safe = (present + max_delta * delta.signum()).clamp(f32::MIN, f32::MAX);
    // the rounded sum can land just outside the envelope
    while (safe - present).abs() > max_delta {
        safe = next_toward(safe, present);
    }
    safe
}

/// Limit every goal joint to `max_delta` away from the present position.
///
/// Fails for the whole command if any goal joint has no present position,
/// so a partially clamped command is never produced.
/// With `max_delta` set to `None` the goal is returned unchanged.
pub fn ensure_safe_goal_position(
    goal: &JointPositions,
    present: &JointPositions,
    max_delta: Option<&MaxRelativeTarget>,
) -> Result<SafeCommand> {
    let mut command = SafeCommand::default();
    for (joint, &goal_position) in goal {
        if !goal_position.is_finite() {
            return Err(ClampError::NonFiniteGoal {
                joint: joint.clone(),
                value: goal_position,
            });
        }
        let present_position = *present
            .get(joint)
            .ok_or_else(|| ClampError::MissingPresentPosition(joint.clone()))?;
        if !present_position.is_finite() {
            return Err(ClampError::NonFinitePresent {
                joint: joint.clone(),
                value: present_position,
            });
        }
        let safe_position = match max_delta {
            None => goal_position,
            Some(bounds) => {
                let bound = bounds
                    .for_joint(joint)
                    .ok_or_else(|| ClampError::MissingBound(joint.clone()))?;
                if !(bound.is_finite() && bound >= 0.0) {
                    return Err(ClampError::InvalidBound {
                        joint: joint.clone(),
                        value: bound,
                    });
                }
                clamp_joint(goal_position, present_position, bound)
            }
        };
        // exact comparison, pass-through keeps the goal bit for bit
        #[allow(clippy::float_cmp)]
        if safe_position != goal_position {
            command.clamped.push(ClampedJoint {
                joint: joint.clone(),
                requested: goal_position,
                commanded: safe_position,
            });
        }
        command.positions.insert(joint.clone(), safe_position);
    }
    Ok(command)
}

/// Jump protection settings of a follower, fixed for its lifetime.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JumpProtection {
    max_relative_target: Option<MaxRelativeTarget>,
    missing_joint_policy: MissingJointPolicy,
}

impl JumpProtection {
    pub fn new(
        max_relative_target: Option<MaxRelativeTarget>,
        missing_joint_policy: MissingJointPolicy,
    ) -> Result<Self> {
        if let Some(bounds) = &max_relative_target {
            bounds.validate()?;
        }
        Ok(Self {
            max_relative_target,
            missing_joint_policy,
        })
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn max_relative_target(&self) -> Option<&MaxRelativeTarget> {
        self.max_relative_target.as_ref()
    }

    pub fn missing_joint_policy(&self) -> MissingJointPolicy {
        self.missing_joint_policy
    }

    pub fn apply(&self, goal: &JointPositions, present: &JointPositions) -> Result<SafeCommand> {
        match self.missing_joint_policy {
            MissingJointPolicy::Abort => {
                ensure_safe_goal_position(goal, present, self.max_relative_target.as_ref())
            }
            MissingJointPolicy::Skip => {
                let (known, unknown): (JointPositions, JointPositions) = goal
                    .iter()
                    .map(|(joint, value)| (joint.clone(), *value))
                    .partition(|(joint, _)| present.contains_key(joint));
                if known.is_empty() {
                    return Err(ClampError::NothingToCommand);
                }
                let mut command =
                    ensure_safe_goal_position(&known, present, self.max_relative_target.as_ref())?;
                command.skipped = unknown.into_keys().collect();
                Ok(command)
            }
        }
    }
}
