//! Result type aliases for Courier.

use crate::CourierError;

/// A specialized `Result` type for Courier operations.
pub type CourierResult<T> = Result<T, CourierError>;
