use std::io;

use rusqlite::ErrorCode;

/// Result of an operation that may run out of room on the current volume.
///
/// Fatal failures travel separately as `Err` of the surrounding
/// `anyhow::Result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Stored(T),
    OutOfSpace,
}

impl<T> Outcome<T> {
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, Outcome::OutOfSpace)
    }
}

/// Internal failure classification used inside the copy protocol.
#[derive(Debug)]
pub(crate) enum Fault {
    OutOfSpace,
    Fatal(anyhow::Error),
}

impl Fault {
    pub(crate) fn io(err: io::Error, what: impl FnOnce() -> String) -> Self {
        if is_storage_full(&err) {
            Fault::OutOfSpace
        } else {
            Fault::Fatal(anyhow::Error::new(err).context(what()))
        }
    }

    pub(crate) fn sql(err: rusqlite::Error, what: impl FnOnce() -> String) -> Self {
        if is_catalog_full(&err) {
            Fault::OutOfSpace
        } else {
            Fault::Fatal(anyhow::Error::new(err).context(what()))
        }
    }

    pub(crate) fn into_outcome<T>(result: Result<T, Fault>) -> anyhow::Result<Outcome<T>> {
        match result {
            Ok(value) => Ok(Outcome::Stored(value)),
            Err(Fault::OutOfSpace) => Ok(Outcome::OutOfSpace),
            Err(Fault::Fatal(err)) => Err(err),
        }
    }
}

impl From<anyhow::Error> for Fault {
    fn from(err: anyhow::Error) -> Self {
        Fault::Fatal(err)
    }
}

/// The filesystem behind a file write reported exhaustion.
pub fn is_storage_full(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::StorageFull
}

/// SQLite could not grow the catalog because its filesystem is full.
pub fn is_catalog_full(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::DiskFull)
}

/// Whether any error in the chain signals exhausted storage.
pub fn is_out_of_space(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<io::Error>().is_some_and(is_storage_full)
            || cause.downcast_ref::<rusqlite::Error>().is_some_and(is_catalog_full)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None)
    }

    #[test]
    fn storage_full_io_maps_to_out_of_space() {
        let fault = Fault::io(io::Error::from(io::ErrorKind::StorageFull), || "write".into());
        assert!(matches!(fault, Fault::OutOfSpace));
    }

    #[test]
    fn other_io_errors_are_fatal() {
        let fault = Fault::io(io::Error::from(io::ErrorKind::PermissionDenied), || "write".into());
        match fault {
            Fault::Fatal(err) => assert!(err.to_string().contains("write")),
            Fault::OutOfSpace => panic!("permission denied must be fatal"),
        }
    }

    #[test]
    fn full_catalog_maps_to_out_of_space() {
        let fault = Fault::sql(sqlite_failure(rusqlite::ffi::SQLITE_FULL), || "insert".into());
        assert!(matches!(fault, Fault::OutOfSpace));

        let fault = Fault::sql(sqlite_failure(rusqlite::ffi::SQLITE_CORRUPT), || "insert".into());
        assert!(matches!(fault, Fault::Fatal(_)));
    }

    #[test]
    fn out_of_space_is_found_through_context() {
        let err: anyhow::Result<()> = Err(io::Error::from(io::ErrorKind::StorageFull)).context("create catalog");
        assert!(is_out_of_space(&err.unwrap_err()));

        let err: anyhow::Result<()> = Err(sqlite_failure(rusqlite::ffi::SQLITE_FULL)).context("create schema");
        assert!(is_out_of_space(&err.unwrap_err()));

        let err = anyhow::anyhow!("something else");
        assert!(!is_out_of_space(&err));
    }

    #[test]
    fn into_outcome_splits_three_ways() {
        assert_eq!(Fault::into_outcome(Ok::<_, Fault>(3)).unwrap(), Outcome::Stored(3));
        assert!(Fault::into_outcome::<u8>(Err(Fault::OutOfSpace)).unwrap().is_out_of_space());
        assert!(Fault::into_outcome::<u8>(Err(Fault::Fatal(anyhow::anyhow!("boom")))).is_err());
    }
}
