//! Query Forwarder: routes query requests to an externally supplied
//! `QueryWalker`, or fails outright if none was configured.

use std::sync::Arc;

use crate::{
    env::QueryWalker,
    errors::ErrorMetadata,
    identifier::SegmentIdentifier,
};

pub struct QueryForwarder<Row> {
    walker: Option<Arc<dyn QueryWalker<Row>>>,
}

impl<Row: Send + Sync + 'static> QueryForwarder<Row> {
    pub fn new(walker: Option<Arc<dyn QueryWalker<Row>>>) -> Self {
        Self { walker }
    }

    pub async fn run_for_intervals(&self, query: serde_json::Value, identifiers: &[SegmentIdentifier]) -> anyhow::Result<serde_json::Value> {
        let walker = self.walker()?;
        walker.run_for_intervals(query, identifiers).await
    }

    pub async fn run_for_segments(&self, query: serde_json::Value, identifiers: &[SegmentIdentifier]) -> anyhow::Result<serde_json::Value> {
        let walker = self.walker()?;
        walker.run_for_segments(query, identifiers).await
    }

    fn walker(&self) -> anyhow::Result<&Arc<dyn QueryWalker<Row>>> {
        self.walker
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("queries not supported on this appenderator").context(ErrorMetadata::invalid_argument("NoQueryRunner", "no QueryWalker was configured")))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::testing::test_identifier;

    struct EchoWalker;

    #[async_trait]
    impl QueryWalker<i64> for EchoWalker {
        async fn run_for_intervals(&self, query: serde_json::Value, _identifiers: &[SegmentIdentifier]) -> anyhow::Result<serde_json::Value> {
            Ok(query)
        }

        async fn run_for_segments(&self, query: serde_json::Value, _identifiers: &[SegmentIdentifier]) -> anyhow::Result<serde_json::Value> {
            Ok(query)
        }
    }

    #[tokio::test]
    async fn forwards_to_configured_walker() {
        let forwarder = QueryForwarder::new(Some(Arc::new(EchoWalker) as Arc<dyn QueryWalker<i64>>));
        let result = forwarder
            .run_for_intervals(serde_json::json!({"ping": true}), &[test_identifier("v1")])
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"ping": true}));
    }

    #[tokio::test]
    async fn fails_without_a_configured_walker() {
        let forwarder: QueryForwarder<i64> = QueryForwarder::new(None);
        let result = forwarder.run_for_segments(serde_json::json!({}), &[]).await;
        assert!(result.is_err());
    }
}
