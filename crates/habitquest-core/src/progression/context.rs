//! Per-request deadline propagation.

use std::time::{Duration, Instant};

use crate::error::InfraError;

/// Carries the caller's deadline into every storage round trip.
///
/// Components call [`RequestContext::check`] before each store access; once
/// the deadline has passed the request fails with
/// [`InfraError::DeadlineExceeded`] instead of issuing more I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
}

impl RequestContext {
    /// No deadline.
    pub fn background() -> Self {
        Self { deadline: None }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail if the deadline has already passed.
    pub fn check(&self, stage: &'static str) -> Result<(), InfraError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(InfraError::DeadlineExceeded { stage })
            }
            _ => Ok(()),
        }
    }
}
