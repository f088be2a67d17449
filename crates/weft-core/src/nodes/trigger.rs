// Trigger nodes: entry points that pass the trigger payload through verbatim

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::node::{NodeExecutionContext, NodeHandler, NodeInput};

macro_rules! trigger_node {
    ($name:ident, $tag:literal) => {
        pub struct $name;

        #[async_trait]
        impl NodeHandler for $name {
            fn node_type(&self) -> &'static str {
                $tag
            }

            async fn execute(
                &self,
                input: &NodeInput,
                _ctx: &mut NodeExecutionContext<'_>,
            ) -> Result<Value> {
                Ok(input.data.clone())
            }
        }
    };
}

trigger_node!(ManualTriggerNode, "manual-trigger");
trigger_node!(WebhookTriggerNode, "webhook-trigger");
trigger_node!(ScheduleTriggerNode, "schedule-trigger");

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::node::NodeInputMetadata;
    use crate::traits::EngineServices;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn trigger_passes_payload_through() {
        let mut context = ExecutionContext::new();
        let services = EngineServices::new();
        let mut ctx = NodeExecutionContext::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            "trigger",
            "manual-trigger",
            &mut context,
            &services,
        );
        let input = NodeInput {
            data: json!({"x": 1}),
            metadata: NodeInputMetadata {
                node_config: serde_json::Map::new(),
                execution_id: Uuid::now_v7(),
                workflow_id: Uuid::now_v7(),
            },
        };
        let output = ManualTriggerNode.execute(&input, &mut ctx).await.unwrap();
        assert_eq!(output, json!({"x": 1}));
    }
}
