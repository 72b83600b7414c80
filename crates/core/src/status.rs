//! Edge status computation.
//!
//! [`compute_status`] is a pure function of what the producer currently
//! publishes for the edge's output, the digest the consumer last observed,
//! and whether a mock value is attached. Precedence, highest first:
//!
//! 1. `missing-output`: producer has content but not this output
//! 2. `mock`: producer has no content yet and a mock value is set
//! 3. `pending`: producer has no content yet
//! 4. `clean` / `dirty`, suffixed `-invalid` when the output failed its schema

use stategraph_storage::{EdgeStatus, OutputKeyRecord, ValidationStatus};

/// What the producer side of an edge looks like right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerOutput<'a> {
    /// The producer has never uploaded content.
    NoContent,
    /// The producer has content that lacks the referenced output.
    Missing,
    Present {
        digest: &'a str,
        validation: ValidationStatus,
    },
}

impl<'a> ProducerOutput<'a> {
    /// Classify from the producer's content flag and its output row, if any.
    /// Rows without a digest are schema placeholders and count as missing.
    pub fn from_row(has_content: bool, row: Option<&'a OutputKeyRecord>) -> Self {
        if !has_content {
            return ProducerOutput::NoContent;
        }
        match row.and_then(|r| r.digest.as_deref().map(|d| (d, r.validation_status))) {
            Some((digest, validation)) => ProducerOutput::Present { digest, validation },
            None => ProducerOutput::Missing,
        }
    }

    pub fn digest(&self) -> Option<&'a str> {
        match self {
            ProducerOutput::Present { digest, .. } => Some(*digest),
            _ => None,
        }
    }
}

/// Everything the status of one edge depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeInputs<'a> {
    pub producer: ProducerOutput<'a>,
    /// Digest the consumer last applied against, if ever.
    pub in_digest: Option<&'a str>,
    pub has_mock: bool,
}

pub fn compute_status(inputs: &EdgeInputs<'_>) -> EdgeStatus {
    match inputs.producer {
        ProducerOutput::Missing => EdgeStatus::MissingOutput,
        ProducerOutput::NoContent if inputs.has_mock => EdgeStatus::Mock,
        ProducerOutput::NoContent => EdgeStatus::Pending,
        ProducerOutput::Present { digest, validation } => {
            let clean = inputs.in_digest == Some(digest);
            let invalid = validation == ValidationStatus::Invalid;
            match (clean, invalid) {
                (true, false) => EdgeStatus::Clean,
                (true, true) => EdgeStatus::CleanInvalid,
                (false, false) => EdgeStatus::Dirty,
                (false, true) => EdgeStatus::DirtyInvalid,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(digest: &str, validation: ValidationStatus) -> ProducerOutput<'_> {
        ProducerOutput::Present { digest, validation }
    }

    fn status(producer: ProducerOutput<'_>, in_digest: Option<&str>, has_mock: bool) -> EdgeStatus {
        compute_status(&EdgeInputs {
            producer,
            in_digest,
            has_mock,
        })
    }

    #[test]
    fn no_content_is_pending_or_mock() {
        assert_eq!(status(ProducerOutput::NoContent, None, false), EdgeStatus::Pending);
        assert_eq!(status(ProducerOutput::NoContent, None, true), EdgeStatus::Mock);
    }

    #[test]
    fn missing_output_beats_mock() {
        assert_eq!(status(ProducerOutput::Missing, None, true), EdgeStatus::MissingOutput);
        assert_eq!(
            status(ProducerOutput::Missing, Some("d1"), false),
            EdgeStatus::MissingOutput
        );
    }

    #[test]
    fn drift_axis() {
        let nv = ValidationStatus::NotValidated;
        assert_eq!(status(present("d1", nv), None, false), EdgeStatus::Dirty);
        assert_eq!(status(present("d1", nv), Some("d0"), false), EdgeStatus::Dirty);
        assert_eq!(status(present("d1", nv), Some("d1"), false), EdgeStatus::Clean);
        // A real output supersedes any mock value.
        assert_eq!(status(present("d1", nv), Some("d1"), true), EdgeStatus::Clean);
    }

    #[test]
    fn validation_axis_only_suffixes_invalid() {
        for v in [
            ValidationStatus::Valid,
            ValidationStatus::NotValidated,
            ValidationStatus::Error,
        ] {
            assert_eq!(status(present("d", v), Some("d"), false), EdgeStatus::Clean);
            assert_eq!(status(present("d", v), Some("x"), false), EdgeStatus::Dirty);
        }
        let inv = ValidationStatus::Invalid;
        assert_eq!(status(present("d", inv), Some("d"), false), EdgeStatus::CleanInvalid);
        assert_eq!(status(present("d", inv), None, false), EdgeStatus::DirtyInvalid);
    }

    #[test]
    fn status_is_deterministic() {
        let validations = [
            ValidationStatus::Valid,
            ValidationStatus::Invalid,
            ValidationStatus::Error,
            ValidationStatus::NotValidated,
        ];
        let digests = [None, Some("a"), Some("b")];
        for v in validations {
            for producer in [ProducerOutput::NoContent, ProducerOutput::Missing, present("a", v)] {
                for in_digest in digests {
                    for has_mock in [false, true] {
                        let first = status(producer, in_digest, has_mock);
                        for _ in 0..3 {
                            assert_eq!(status(producer, in_digest, has_mock), first);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn placeholder_rows_count_as_missing() {
        let row = OutputKeyRecord {
            state_guid: "g".into(),
            key: "vpc_id".into(),
            digest: None,
            sensitive: false,
            schema_json: Some("{}".into()),
            schema_source: None,
            validation_status: ValidationStatus::NotValidated,
            validation_error: None,
            validated_at: None,
        };
        assert_eq!(ProducerOutput::from_row(true, Some(&row)), ProducerOutput::Missing);
        assert_eq!(ProducerOutput::from_row(false, Some(&row)), ProducerOutput::NoContent);
        assert_eq!(ProducerOutput::from_row(true, None), ProducerOutput::Missing);
    }
}
