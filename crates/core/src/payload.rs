//! Typed job payloads.
//!
//! A payload type binds a Rust struct to the queue and job name it travels
//! under, so producers and processors agree on the JSON shape at compile time.

use serde::{Serialize, de::DeserializeOwned};

use crate::error::DomainResult;

pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Queue the job is enqueued on.
    const QUEUE: &'static str;
    /// Job name used to route to a processor.
    const JOB_NAME: &'static str;

    /// Payload-level validation, run before anything is written.
    fn validate(&self) -> DomainResult<()> {
        Ok(())
    }

    /// Idempotency key derived from the payload, if any.
    fn dedupe_key(&self) -> Option<String> {
        None
    }

    fn correlation_id(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DomainError;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct GeneratePdf {
        proposal_id: String,
        pages: u32,
    }

    impl JobPayload for GeneratePdf {
        const QUEUE: &'static str = "pdf-processing";
        const JOB_NAME: &'static str = "generate-ccb";

        fn validate(&self) -> DomainResult<()> {
            if self.pages == 0 {
                return Err(DomainError::validation("pages must be positive"));
            }
            Ok(())
        }

        fn dedupe_key(&self) -> Option<String> {
            Some(format!("ccb-{}", self.proposal_id))
        }
    }

    #[test]
    fn defaults_and_overrides() {
        let p = GeneratePdf { proposal_id: "p-1".into(), pages: 3 };
        assert!(p.validate().is_ok());
        assert_eq!(p.dedupe_key().as_deref(), Some("ccb-p-1"));
        assert_eq!(p.correlation_id(), None);

        let bad = GeneratePdf { proposal_id: "p-2".into(), pages: 0 };
        assert!(bad.validate().unwrap_err().is_validation());
    }
}
