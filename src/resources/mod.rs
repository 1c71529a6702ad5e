//! Building blocks shared by the movers for managing Kubernetes objects

pub mod cleanup;
pub mod common;
pub mod ensure;
pub mod job_status;

pub use cleanup::cleanup_objects;
pub use common::*;
pub use ensure::{create_or_replace, create_or_update, is_new, EnsureOutcome, Reconcilable};

/// Result of one ensure step: the object is usable, or it is still materializing
///
/// Errors travel separately through `Result`, giving every step the three
/// outcomes not-ready, ready and failed.
#[derive(Clone, Debug, PartialEq)]
pub enum Readiness<T> {
    Pending,
    Ready(T),
}

/// Unwrap a [`Readiness`], returning `Ok($pending)` from the enclosing function when not ready
#[macro_export]
macro_rules! ready_or {
    ($readiness:expr, $pending:expr) => {
        match $readiness {
            $crate::resources::Readiness::Ready(value) => value,
            $crate::resources::Readiness::Pending => return Ok($pending),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(input: Readiness<u32>) -> crate::Result<Option<u32>> {
        let v = ready_or!(input, None);
        Ok(Some(v + 1))
    }

    #[test]
    fn test_ready_or_short_circuits_pending() {
        assert_eq!(step(Readiness::Pending).unwrap(), None);
        assert_eq!(step(Readiness::Ready(1)).unwrap(), Some(2));
    }
}
