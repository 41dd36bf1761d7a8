use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum IscsiError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("CHAP credentials missing: {0}")]
    AuthMissing(String),

    #[error("host environment error: {0}")]
    HostEnvironment(String),

    #[error("command '{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("timed out waiting for device path '{0}'")]
    PathTimeout(String),

    #[error("no staging record found for volume '{0}'")]
    StagingRecordMissing(String),

    #[error("mount failed: {0}")]
    Mount(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IscsiError>;

impl From<IscsiError> for Status {
    fn from(err: IscsiError) -> Self {
        match err {
            IscsiError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
            _ => Status::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_invalid_argument_maps_to_invalid_argument() {
        let status: Status = IscsiError::InvalidArgument("target iqn is missing".into()).into();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_other_errors_map_to_internal() {
        let auth: Status = IscsiError::AuthMissing("node.session.auth.username".into()).into();
        assert_eq!(auth.code(), Code::Internal);

        let timeout: Status = IscsiError::PathTimeout("/dev/disk/by-path/x".into()).into();
        assert_eq!(timeout.code(), Code::Internal);

        let cmd: Status = IscsiError::CommandFailed {
            command: "iscsiadm --mode session".into(),
            stderr: "no active sessions".into(),
        }
        .into();
        assert_eq!(cmd.code(), Code::Internal);
    }
}
