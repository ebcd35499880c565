//! Post-generation grounding check: how close is the answer, in embedding
//! space, to the context it was supposed to be grounded in. Advisory only;
//! the result rides on the debug event and never blocks a response.

use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

use crate::services::embedding_service::EmbeddingProvider;
use crate::utils::similarity::cosine_similarity;

#[derive(Debug, Clone, Copy)]
pub struct GroundingReport {
    pub similarity: f32,
    pub low_grounding: bool,
}

pub struct GroundingVerifier {
    embeddings: Arc<dyn EmbeddingProvider>,
    threshold: f32,
}

impl GroundingVerifier {
    pub fn new(embeddings: Arc<dyn EmbeddingProvider>, threshold: f32) -> Self {
        Self {
            embeddings,
            threshold,
        }
    }

    /// Compare the answer embedding against the concatenated retrieved
    /// context. Callers skip this entirely when no context was used.
    pub async fn verify(&self, answer: &str, context: &str) -> Result<GroundingReport> {
        let answer_vector = self.embeddings.embed_query(answer).await?;
        let context_vector = self.embeddings.embed_query(context).await?;

        let similarity = cosine_similarity(&answer_vector, &context_vector)?;
        let low_grounding = similarity < self.threshold;

        if low_grounding {
            debug!(
                "Low grounding: answer-context similarity {:.3} below {:.3}",
                similarity, self.threshold
            );
        }

        Ok(GroundingReport {
            similarity,
            low_grounding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Stub embedder mapping known phrases to fixed directions.
    struct PhraseEmbedder;

    #[async_trait]
    impl EmbeddingProvider for PhraseEmbedder {
        async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
            if text.contains("deadline") {
                Ok(vec![1.0, 0.0])
            } else {
                Ok(vec![0.0, 1.0])
            }
        }

        async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed_query(t).await?);
            }
            Ok(out)
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    #[tokio::test]
    async fn test_grounded_answer_passes() {
        let verifier = GroundingVerifier::new(Arc::new(PhraseEmbedder), 0.5);
        let report = verifier
            .verify("the deadline is March 15", "scholarship deadline details")
            .await
            .unwrap();

        assert!(!report.low_grounding);
        assert!(report.similarity > 0.9);
    }

    #[tokio::test]
    async fn test_ungrounded_answer_is_flagged() {
        let verifier = GroundingVerifier::new(Arc::new(PhraseEmbedder), 0.5);
        let report = verifier
            .verify("I like pasta recipes", "scholarship deadline details")
            .await
            .unwrap();

        assert!(report.low_grounding);
        assert!(report.similarity < 0.5);
    }
}
