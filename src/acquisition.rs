//! Results of adapter read operations.

use crate::reading::{ReadingKey, ReadingStore, ReadingValue};
use crate::{Error, Result};

/// Retries a fallible bus request while it fails with a recoverable error.
///
/// `$request` is re-evaluated for every attempt, so it must build a fresh future each time.
/// After `$retries` failed attempts the result of one last attempt is returned as is.
macro_rules! request_with_retry {
    ($retries:expr, $request:expr) => {{
        'retry_block: {
            let retries = $retries;
            for t in 0..retries {
                match $request.await {
                    Ok(result) => break 'retry_block Ok(result),
                    Err(err) if err.is_recoverable() => {
                        log::trace!("Failed try {} of {}, repeating ({err})", t + 1, retries);
                    }
                    Err(err) => break 'retry_block Err(err),
                }
            }
            $request.await
        }
    }};
}
pub(crate) use request_with_retry;

pub const DEFAULT_RETRIES: u8 = 3;

/// A reading written during an acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatedReading {
    /// Element the reading belongs to, e.g. `chip 0 cell 3`.
    pub target: String,
    pub key: ReadingKey,
    pub value: ReadingValue,
}

/// A target that was skipped because reading it failed.
#[derive(Debug)]
pub struct AcquisitionFailure {
    pub target: String,
    pub error: Error,
}

/// What an acquisition managed to update and what it had to skip.
///
/// Readings of skipped targets keep their previous values.
#[derive(Debug, Default)]
pub struct AcquisitionReport {
    pub updated: Vec<UpdatedReading>,
    pub failures: Vec<AcquisitionFailure>,
}

impl AcquisitionReport {
    /// True when no target was skipped.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: AcquisitionReport) {
        self.updated.extend(other.updated);
        self.failures.extend(other.failures);
    }

    /// Writes `value` into `store` and records the update.
    pub(crate) fn record(
        &mut self,
        target: impl Into<String>,
        store: &ReadingStore,
        key: &ReadingKey,
        value: ReadingValue,
    ) -> Result<()> {
        store.set(key, value.clone())?;
        self.updated.push(UpdatedReading {
            target: target.into(),
            key: key.clone(),
            value,
        });
        Ok(())
    }

    pub(crate) fn skip(&mut self, target: impl Into<String>, error: Error) {
        let target = target.into();
        log::warn!("Skipping {target}: {error}");
        self.failures.push(AcquisitionFailure { target, error });
    }
}
