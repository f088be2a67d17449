// Output and log nodes: pass upstream output through
//
// `output` is the terminal marker of a workflow; `log` additionally writes
// a structured trace line with an optional label.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::error::Result;
use crate::node::{NodeExecutionContext, NodeHandler, NodeInput};
use crate::schema::{ConfigSchema, FieldKind, FieldSpec};

pub struct OutputNode;

#[async_trait]
impl NodeHandler for OutputNode {
    fn node_type(&self) -> &'static str {
        "output"
    }

    async fn execute(
        &self,
        input: &NodeInput,
        _ctx: &mut NodeExecutionContext<'_>,
    ) -> Result<Value> {
        Ok(input.data.clone())
    }
}

pub struct LogNode;

#[async_trait]
impl NodeHandler for LogNode {
    fn node_type(&self) -> &'static str {
        "log"
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new(vec![FieldSpec::optional("label", FieldKind::String)])
    }

    async fn execute(
        &self,
        input: &NodeInput,
        ctx: &mut NodeExecutionContext<'_>,
    ) -> Result<Value> {
        let label = input.config_str("label").unwrap_or("log");
        info!(
            node_id = %ctx.node_id,
            label,
            data = %input.data,
            "log node"
        );
        Ok(input.data.clone())
    }
}
