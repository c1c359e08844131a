//! Error reporting for the robot state core

/// Unified error for configuration, manipulator and attachment operations.
///
/// Validation always happens before any field is mutated, so an operation
/// returning an error leaves the robot exactly as it was.
#[derive(Debug, Clone, PartialEq)]
pub enum RobotError {
    /// Out-of-range index, size mismatch, self-grab, link not owned by this robot.
    InvalidArgument(String),
    /// Operation needs state that is not there yet: no IK solver bound,
    /// kinematic hierarchy not finalized.
    PreconditionViolation(String),
    /// The operation has no defined result for the requested parameterization
    /// (rotation and angular-velocity Jacobians of the 3D/quaternion blocks).
    UnsupportedOperation(String),
    /// Lookup by name failed (unknown manipulator).
    NotFound(String),
}

impl std::fmt::Display for RobotError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            RobotError::InvalidArgument(ref msg) =>
                write!(f, "Invalid argument: {}", msg),
            RobotError::PreconditionViolation(ref msg) =>
                write!(f, "Precondition violation: {}", msg),
            RobotError::UnsupportedOperation(ref msg) =>
                write!(f, "Unsupported operation: {}", msg),
            RobotError::NotFound(ref msg) =>
                write!(f, "Not found: {}", msg),
        }
    }
}

impl std::error::Error for RobotError {}

pub type Result<T> = std::result::Result<T, RobotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = RobotError::InvalidArgument("dof index 9 out of range".to_string());
        assert_eq!(format!("{}", err), "Invalid argument: dof index 9 out of range");
        let err = RobotError::NotFound("manipulator left_arm".to_string());
        assert_eq!(format!("{}", err), "Not found: manipulator left_arm");
    }
}
