//! Grounded answer synthesis over the fused context.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use hybrid_query_core::error::{EngineError, Result};
use hybrid_query_core::generation::Generator;
use hybrid_query_core::models::{QueryTurn, RetrievalCandidate};
use hybrid_query_core::prompt::{answer_request, extract_citations, NO_CONTEXT_DISCLAIMER};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesizedAnswer {
    pub answer: String,
    /// Candidate ids the answer rests on. Never empty when context was supplied.
    pub provenance: Vec<String>,
    /// False when no context was available.
    pub grounded: bool,
}

#[derive(Clone)]
pub struct AnswerSynthesizer {
    generator: Arc<dyn Generator>,
    retry_backoff: Duration,
}

impl AnswerSynthesizer {
    pub fn new(generator: Arc<dyn Generator>, retry_backoff: Duration) -> Self {
        Self {
            generator,
            retry_backoff,
        }
    }

    /// Produce an answer citing the supplied context.
    ///
    /// A failed generation is retried once after the backoff; a second
    /// failure is [`EngineError::SynthesisUnavailable`].
    pub async fn synthesize(
        &self,
        question: &str,
        context: &[RetrievalCandidate],
        history: &[QueryTurn],
    ) -> Result<SynthesizedAnswer> {
        let request = answer_request(question, context, history);

        let answer = match self.generator.generate(&request).await {
            Ok(text) => text,
            Err(first) => {
                tracing::warn!(error = %first, backoff = ?self.retry_backoff, "answer generation failed, retrying");
                tokio::time::sleep(self.retry_backoff).await;
                self.generator.generate(&request).await.map_err(|e| {
                    EngineError::SynthesisUnavailable(format!(
                        "answer generation failed twice: {}",
                        e
                    ))
                })?
            }
        };
        let answer = answer.trim().to_string();

        if context.is_empty() {
            let answer = if answer.starts_with(NO_CONTEXT_DISCLAIMER) {
                answer
            } else {
                format!("{} {}", NO_CONTEXT_DISCLAIMER, answer)
            };
            return Ok(SynthesizedAnswer {
                answer,
                provenance: Vec::new(),
                grounded: false,
            });
        }

        let mut provenance = extract_citations(&answer, &request.citations);
        if provenance.is_empty() {
            provenance = request.citations.clone();
        }
        Ok(SynthesizedAnswer {
            answer,
            provenance,
            grounded: true,
        })
    }
}
