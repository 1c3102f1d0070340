use teleop_controller::transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WrapperError {
    #[error("Zenoh error {0:?}")]
    ZenohError(#[from] zenoh::Error),
    #[error("Invalid zenoh endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
}

impl From<WrapperError> for TransportError {
    fn from(err: WrapperError) -> Self {
        TransportError::Backend(Box::new(err))
    }
}
