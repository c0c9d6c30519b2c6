//! Definition of DeviceError used by the attach and detach code.

/// A Device Attach/Detach error.
pub(crate) struct DeviceError {
    pub(crate) message: String,
    pub(crate) source: DeviceErrorSource,
}

/// Possible device error kind sources.
pub(crate) enum DeviceErrorSource {
    None,
    StdIoError(std::io::Error),
}

impl std::fmt::Debug for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.source {
            DeviceErrorSource::None => None,
            DeviceErrorSource::StdIoError(error) => Some(error),
        }
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(error: std::io::Error) -> DeviceError {
        DeviceError {
            message: format!("{error}"),
            source: DeviceErrorSource::StdIoError(error),
        }
    }
}

impl From<String> for DeviceError {
    fn from(message: String) -> DeviceError {
        DeviceError {
            message,
            source: DeviceErrorSource::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn device_error_source() {
        let error = DeviceError::from(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "iscsiadm: permission denied",
        ));
        assert!(error.source().is_some());
        assert_eq!(error.to_string(), "iscsiadm: permission denied");

        let error = DeviceError::from("iscsiadm: exit code 8".to_string());
        assert!(error.source().is_none());
    }
}
