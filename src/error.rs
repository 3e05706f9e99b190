//! Definition of errors.

use std::fmt;

/// Errors reported by `HazardDomain` and the container constructors.
///
/// Full and empty containers are not errors, they are reported by the return value of the
/// operation itself.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Error {
    /// Every hazard record of the domain is claimed by another thread
    ThreadNumOverflow { max: usize },
    /// Invalid parameter
    InvalidParam(&'static str),
    /// Ring capacity rejected
    InvalidCapacity { capacity: usize, reason: &'static str },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::ThreadNumOverflow { max } => {
                write!(f, "thread number overflow, all {} hazard records are in use", max)
            }
            Error::InvalidParam(what) => write!(f, "invalid parameter: {}", what),
            Error::InvalidCapacity { capacity, reason } => {
                write!(f, "invalid capacity {}: {}", capacity, reason)
            }
        }
    }
}

impl std::error::Error for Error {}

/// `Result` with `Error` as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod test {
    use super::Error;

    #[test]
    fn test_display() {
        let e = Error::ThreadNumOverflow { max: 16 };
        assert_eq!(
            format!("{}", e),
            "thread number overflow, all 16 hazard records are in use"
        );
        let e = Error::InvalidCapacity {
            capacity: 3,
            reason: "must be a power of two",
        };
        assert_eq!(format!("{}", e), "invalid capacity 3: must be a power of two");
        assert_eq!(
            format!("{}", Error::InvalidParam("hazards_per_thread")),
            "invalid parameter: hazards_per_thread"
        );
    }

    #[test]
    fn test_is_std_error() {
        fn takes_error(_: &dyn std::error::Error) {}
        takes_error(&Error::InvalidParam("x"));
    }
}
