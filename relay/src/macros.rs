//! Shorthands for building and returning [`crate::error::RelayError`]s.

/// Builds a [`crate::error::RelayError`] from a kind, a static description and an optional detail.
#[macro_export]
macro_rules! relay_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::RelayError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::RelayError::from(($kind, $desc, $detail.to_string()))
    };
}

/// Returns early with a [`crate::error::RelayError`].
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return Err($crate::relay_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return Err($crate::relay_error!($kind, $desc, $detail))
    };
}
